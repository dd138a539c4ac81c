use crate::{EngineError, Error, Result};
use regex::Regex;
use std::{borrow::Cow, sync::LazyLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServicePartKind {
    FindBy,
    FindAllBy,
    DeleteBy,
    And,
    Or,
    Custom,
}

impl ServicePartKind {
    pub fn is_qualifier(&self) -> bool {
        matches!(
            self,
            ServicePartKind::FindBy | ServicePartKind::FindAllBy | ServicePartKind::DeleteBy
        )
    }
}

/// Qualifier or connective recognized inside a method identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServicePart {
    pub kind: ServicePartKind,
    /// Literal as it appears in the identifier, `findAllBy`.
    pub literal: Cow<'static, str>,
    /// SQL emitted for this part.
    pub sql: Cow<'static, str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Service(ServicePart),
    Field(String),
}

impl Part {
    pub fn is_field(&self) -> bool {
        matches!(self, Part::Field(..))
    }
}

const QUALIFIERS: [(&str, ServicePartKind, &str); 3] = [
    ("findAllBy", ServicePartKind::FindAllBy, "SELECT"),
    ("findBy", ServicePartKind::FindBy, "SELECT"),
    ("deleteBy", ServicePartKind::DeleteBy, "DELETE"),
];

const CONNECTIVES: [(&str, ServicePartKind, &str); 2] = [
    ("And", ServicePartKind::And, "AND"),
    ("Or", ServicePartKind::Or, "OR"),
];

/// Tokenizes identifiers such as `findAllByAgeAndName` into service and field parts.
pub struct MethodNameParser {
    parts: Vec<ServicePart>,
    regex: Regex,
}

fn build_regex(parts: &[ServicePart]) -> Result<Regex> {
    let mut literals: Vec<&str> = parts.iter().map(|p| p.literal.as_ref()).collect();
    // Longer literals first so that `findAllBy` wins over `findBy`
    literals.sort_by_key(|v| std::cmp::Reverse(v.len()));
    let alternation = literals
        .iter()
        .map(|v| regex::escape(v))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!("({})", alternation)).map_err(Error::new)
}

impl Default for MethodNameParser {
    fn default() -> Self {
        static DEFAULT: LazyLock<(Vec<ServicePart>, Regex)> = LazyLock::new(|| {
            let parts = QUALIFIERS
                .iter()
                .chain(CONNECTIVES.iter())
                .map(|(literal, kind, sql)| ServicePart {
                    kind: *kind,
                    literal: Cow::Borrowed(*literal),
                    sql: Cow::Borrowed(*sql),
                })
                .collect::<Vec<_>>();
            let regex = build_regex(&parts).expect("Service part literals must form a valid regex");
            (parts, regex)
        });
        Self {
            parts: DEFAULT.0.clone(),
            regex: DEFAULT.1.clone(),
        }
    }
}

impl MethodNameParser {
    pub fn new() -> Self {
        Default::default()
    }

    /// Register an additional connective, `literal` must start with an uppercase letter.
    pub fn with_custom(
        mut self,
        literal: impl Into<Cow<'static, str>>,
        sql: impl Into<Cow<'static, str>>,
    ) -> Result<Self> {
        let literal = literal.into();
        if !literal.starts_with(|c: char| c.is_ascii_uppercase()) {
            return Err(Error::msg(format!(
                "Custom service part `{}` must start with an uppercase letter",
                literal
            )));
        }
        self.parts.push(ServicePart {
            kind: ServicePartKind::Custom,
            literal,
            sql: sql.into(),
        });
        self.regex = build_regex(&self.parts)?;
        Ok(self)
    }

    /// Qualifiers only open the identifier, connectives must sit between two
    /// capitalized words.
    fn stands_alone(identifier: &str, start: usize, part: &ServicePart) -> bool {
        if part.kind.is_qualifier() {
            start == 0
        } else {
            start != 0
                && identifier[start + part.literal.len()..]
                    .starts_with(|c: char| c.is_ascii_uppercase())
        }
    }

    /// Split `identifier` into an ordered sequence starting with its qualifier.
    ///
    /// Connectives only count when they start a new capitalized word, so the
    /// `Or` inside `findByOrderId` stays part of the field name. When several
    /// literals start at the same position the longest one standing alone wins,
    /// `findByNameAndNotes` still splits on `And` next to an `AndNot` connective.
    pub fn parse(&self, identifier: &str) -> Result<Vec<Part>> {
        let malformed = || Error::new(EngineError::MalformedQueryName(identifier.to_string()));
        let mut tokens: Vec<(usize, usize, &ServicePart)> = Vec::new();
        let mut position = 0;
        while let Some(found) = self.regex.find_at(identifier, position) {
            let start = found.start();
            let accepted = self
                .parts
                .iter()
                .filter(|p| identifier[start..].starts_with(p.literal.as_ref()))
                .filter(|p| Self::stands_alone(identifier, start, p))
                .max_by_key(|p| p.literal.len());
            match accepted {
                Some(part) => {
                    let end = start + part.literal.len();
                    tokens.push((start, end, part));
                    position = end;
                }
                // Every literal starts with an ASCII letter, start + 1 is a char boundary
                None => position = start + 1,
            }
        }
        match tokens.first() {
            Some((0, _, part)) if part.kind.is_qualifier() => {}
            _ => return Err(malformed()),
        }
        let mut result = Vec::with_capacity(tokens.len() * 2);
        for (i, (_, end, part)) in tokens.iter().enumerate() {
            let fragment_end = tokens
                .get(i + 1)
                .map(|(start, ..)| *start)
                .unwrap_or(identifier.len());
            let fragment = &identifier[*end..fragment_end];
            if fragment.is_empty() {
                return Err(malformed());
            }
            result.push(Part::Service((*part).clone()));
            result.push(Part::Field(fragment.to_string()));
        }
        Ok(result)
    }
}
