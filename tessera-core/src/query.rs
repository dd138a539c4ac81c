use crate::{Value, truncate_long};
use std::{
    fmt::{self, Display},
    sync::Arc,
};

/// SQL text with positional `?` placeholders and the values bound to them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub sql: Arc<str>,
    pub params: Vec<Value>,
}

impl Query {
    pub fn new(sql: impl Into<Arc<str>>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
    pub fn with_params(sql: impl Into<Arc<str>>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
    /// Append a parameter value.
    pub fn bind(&mut self, value: impl Into<Value>) -> &mut Self {
        self.params.push(value.into());
        self
    }
}

impl From<&str> for Query {
    fn from(value: &str) -> Self {
        Query::new(value)
    }
}

impl From<String> for Query {
    fn from(value: String) -> Self {
        Query::new(value)
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", truncate_long!(self.sql))
    }
}

/// Metadata about modify operations (INSERT/DELETE).
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowsAffected {
    /// Total number of rows impacted.
    pub rows_affected: u64,
    /// Backend-specific last inserted / affected identifier when available.
    pub last_affected_id: Option<i64>,
}

/// Shared reference-counted column name list.
pub type RowNames = Arc<[String]>;
/// Owned row value slice matching `RowNames` length.
pub type Row = Box<[Value]>;

/// A result row with its corresponding column labels.
#[derive(Debug, Clone, PartialEq)]
pub struct RowLabeled {
    /// Column names.
    pub labels: RowNames,
    /// Data values (aligned by index with `labels`).
    pub values: Row,
}

impl RowLabeled {
    pub fn new(names: RowNames, values: Row) -> Self {
        Self {
            labels: names,
            values,
        }
    }
    pub fn names(&self) -> &[String] {
        &self.labels
    }
    pub fn values(&self) -> &[Value] {
        &self.values
    }
    pub fn get_column(&self, name: &str) -> Option<&Value> {
        self.labels
            .iter()
            .position(|v| v.eq_ignore_ascii_case(name))
            .map(|i| &self.values()[i])
    }
}

/// Heterogeneous items emitted by `Connection::run` combining rows and modify results.
#[derive(Debug)]
pub enum QueryResult {
    /// A labeled row.
    Row(RowLabeled),
    /// A modify effect aggregation.
    Affected(RowsAffected),
}

impl Extend<RowsAffected> for RowsAffected {
    fn extend<T: IntoIterator<Item = RowsAffected>>(&mut self, iter: T) {
        for elem in iter {
            self.rows_affected += elem.rows_affected;
            if elem.last_affected_id.is_some() {
                self.last_affected_id = elem.last_affected_id;
            }
        }
    }
}

impl From<RowLabeled> for Row {
    fn from(value: RowLabeled) -> Self {
        value.values
    }
}

impl From<RowLabeled> for QueryResult {
    fn from(value: RowLabeled) -> Self {
        QueryResult::Row(value)
    }
}

impl From<RowsAffected> for QueryResult {
    fn from(value: RowsAffected) -> Self {
        QueryResult::Affected(value)
    }
}
