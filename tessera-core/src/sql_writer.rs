use crate::{EntityDescriptor, FieldDescriptor, separated_by};
use regex::Regex;
use std::sync::LazyLock;

/// Renders every statement the engine emits. Values never appear inline, each
/// one is a positional `?` placeholder bound at execution time.
pub trait SqlWriter {
    fn identifier_regex(&self) -> &'static Regex {
        static IDENTIFIER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("Identifier regex must compile")
        });
        &IDENTIFIER_REGEX
    }

    fn write_escaped(&self, out: &mut String, value: &str, search: char, replace: &str) {
        let mut position = 0;
        for (i, c) in value.char_indices() {
            if c == search {
                out.push_str(&value[position..i]);
                out.push_str(replace);
                position = i + c.len_utf8();
            }
        }
        out.push_str(&value[position..]);
    }

    /// Plain identifiers are written as they are, anything else is quoted.
    fn write_identifier(&self, out: &mut String, value: &str) {
        if self.identifier_regex().is_match(value) {
            out.push_str(value);
        } else {
            out.push('"');
            self.write_escaped(out, value, '"', r#""""#);
            out.push('"');
        }
    }

    fn write_placeholder(&self, out: &mut String) {
        out.push('?');
    }

    fn write_columns<'a>(
        &self,
        out: &mut String,
        fields: impl IntoIterator<Item = &'a FieldDescriptor>,
    ) where
        Self: Sized,
    {
        separated_by(
            out,
            fields,
            |out, v| self.write_identifier(out, &v.column_name),
            ", ",
        );
    }

    /// `SELECT <columns> FROM <table>`
    fn write_select<'a>(
        &self,
        out: &mut String,
        table: &str,
        fields: impl IntoIterator<Item = &'a FieldDescriptor>,
    ) where
        Self: Sized,
    {
        out.push_str("SELECT ");
        self.write_columns(out, fields);
        out.push_str(" FROM ");
        self.write_identifier(out, table);
    }

    fn write_where(&self, out: &mut String) {
        out.push_str(" WHERE ");
    }

    fn write_and(&self, out: &mut String) {
        out.push_str(" AND ");
    }

    fn write_or(&self, out: &mut String) {
        out.push_str(" OR ");
    }

    /// `<column> = ?`
    fn write_condition(&self, out: &mut String, field: &FieldDescriptor) {
        self.write_identifier(out, &field.column_name);
        out.push_str(" = ");
        self.write_placeholder(out);
    }

    fn write_select_all(&self, out: &mut String, entity: &EntityDescriptor)
    where
        Self: Sized,
    {
        self.write_select(out, &entity.table_name, entity.fields.iter());
    }

    fn write_select_by_id(&self, out: &mut String, entity: &EntityDescriptor)
    where
        Self: Sized,
    {
        self.write_select_all(out, entity);
        self.write_where(out);
        self.write_condition(out, entity.identity_field());
    }

    fn write_count(&self, out: &mut String, entity: &EntityDescriptor) {
        out.push_str("SELECT COUNT(*) FROM ");
        self.write_identifier(out, &entity.table_name);
    }

    /// `INSERT INTO <table> (<columns>) VALUES (?, ..)`, the multi-row form of a
    /// batch is produced by [`SqlWriter::write_insert_rows`].
    fn write_insert(&self, out: &mut String, entity: &EntityDescriptor)
    where
        Self: Sized,
    {
        out.push_str("INSERT INTO ");
        self.write_identifier(out, &entity.table_name);
        out.push_str(" (");
        self.write_columns(out, entity.fields.iter());
        out.push_str(") VALUES ");
        self.write_insert_rows(out, entity.fields.len(), 1);
    }

    /// Placeholder tuples for `rows` rows of `columns` values each.
    fn write_insert_rows(&self, out: &mut String, columns: usize, rows: usize) {
        separated_by(
            out,
            0..rows,
            |out, _| {
                out.push('(');
                separated_by(out, 0..columns, |out, _| self.write_placeholder(out), ", ");
                out.push(')');
            },
            ", ",
        );
    }

    fn write_delete_by_id(&self, out: &mut String, entity: &EntityDescriptor) {
        out.push_str("DELETE FROM ");
        self.write_identifier(out, &entity.table_name);
        self.write_where(out);
        self.write_condition(out, entity.identity_field());
    }

    fn write_delete_all(&self, out: &mut String, entity: &EntityDescriptor) {
        out.push_str("DELETE FROM ");
        self.write_identifier(out, &entity.table_name);
    }
}

/// Writer producing ANSI style statements, usable by most backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericSqlWriter;

impl GenericSqlWriter {
    pub const fn new() -> Self {
        Self
    }
}

impl SqlWriter for GenericSqlWriter {}

/// Rewrite the single-row `VALUES (?, ..)` of an insert into `rows` tuples.
pub fn multi_row_insert(writer: &impl SqlWriter, insert: &str, columns: usize, rows: usize) -> String {
    let head = insert
        .rfind(" VALUES ")
        .map(|i| &insert[..i])
        .unwrap_or(insert);
    let mut out = String::with_capacity(head.len() + 8 + rows * (columns * 3 + 4));
    out.push_str(head);
    out.push_str(" VALUES ");
    writer.write_insert_rows(&mut out, columns, rows);
    out
}
