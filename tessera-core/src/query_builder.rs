use crate::{
    EngineError, EntityDescriptor, Error, FieldDescriptor, Part, Result, ServicePartKind,
    SqlWriter,
};
use std::sync::Arc;

/// How many rows a query yields to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cardinality {
    Single,
    Multiple,
    None,
}

/// Compiled, parameterized statement ready to be bound and executed.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub sql: Arc<str>,
    /// Fields bound to the placeholders, in placeholder order.
    pub bound_fields: Vec<FieldDescriptor>,
    /// Selected fields, in column order. Empty for template queries.
    pub fetched_fields: Vec<FieldDescriptor>,
    pub cardinality: Cardinality,
    pub from_template: bool,
}

impl QueryPlan {
    /// Wrap a declared query, the text is used verbatim.
    pub fn from_template(sql: impl Into<Arc<str>>, cardinality: Cardinality) -> Self {
        Self {
            sql: sql.into(),
            bound_fields: Vec::new(),
            fetched_fields: Vec::new(),
            cardinality,
            from_template: true,
        }
    }

    pub fn placeholders(&self) -> usize {
        count_placeholders(&self.sql)
    }
}

/// Number of `?` placeholders outside quoted literals and identifiers.
pub fn count_placeholders(sql: &str) -> usize {
    let mut quote = None;
    let mut count = 0;
    for c in sql.chars() {
        match (quote, c) {
            (None, '\'' | '"' | '`') => quote = Some(c),
            (Some(q), c) if q == c => quote = None,
            (None, '?') => count += 1,
            _ => {}
        }
    }
    count
}

/// Turns a sequence of [`Part`] into a [`QueryPlan`].
pub struct QueryBuilder<'w, W: SqlWriter> {
    writer: &'w W,
}

impl<'w, W: SqlWriter> QueryBuilder<'w, W> {
    pub fn new(writer: &'w W) -> Self {
        Self { writer }
    }

    /// Compile `parts` against `entity`, selecting `fields_to_fetch`.
    pub fn build(
        &self,
        parts: &[Part],
        entity: &EntityDescriptor,
        fields_to_fetch: &[FieldDescriptor],
    ) -> Result<QueryPlan> {
        let qualifier = match parts.first() {
            Some(Part::Service(part)) if part.kind.is_qualifier() => part,
            _ => {
                return Err(Error::msg(
                    "A query must start with a qualifier (findBy, findAllBy)",
                ));
            }
        };
        let cardinality = match qualifier.kind {
            ServicePartKind::FindBy => Cardinality::Single,
            ServicePartKind::FindAllBy => Cardinality::Multiple,
            ServicePartKind::DeleteBy => {
                return Err(Error::new(EngineError::NotImplemented(
                    "Derived delete queries",
                )));
            }
            _ => unreachable!("Qualifier checked above"),
        };
        let mut sql = String::with_capacity(128);
        let mut bound_fields = Vec::new();
        self.writer
            .write_select(&mut sql, &entity.table_name, fields_to_fetch.iter());
        self.writer.write_where(&mut sql);
        for part in &parts[1..] {
            match part {
                Part::Service(service) => match service.kind {
                    ServicePartKind::And => self.writer.write_and(&mut sql),
                    ServicePartKind::Or => self.writer.write_or(&mut sql),
                    ServicePartKind::Custom => {
                        sql.push(' ');
                        sql.push_str(&service.sql);
                        sql.push(' ');
                    }
                    _ => {
                        return Err(Error::msg(format!(
                            "Unexpected qualifier `{}` in the middle of a query",
                            service.literal
                        )));
                    }
                },
                Part::Field(name) => {
                    let field = entity.field(name)?;
                    self.writer.write_condition(&mut sql, field);
                    bound_fields.push(field.clone());
                }
            }
        }
        let plan = QueryPlan {
            sql: sql.into(),
            bound_fields,
            fetched_fields: fields_to_fetch.to_vec(),
            cardinality,
            from_template: false,
        };
        let placeholders = plan.placeholders();
        if placeholders != plan.bound_fields.len() {
            return Err(Error::new(EngineError::PlaceholderArgumentCountMismatch {
                expected: placeholders,
                actual: plan.bound_fields.len(),
            })
            .context(format!("While building `{}`", plan.sql)));
        }
        Ok(plan)
    }
}
