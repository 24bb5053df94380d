//! Parameterized statements over registry tables. Identifiers only ever come
//! from the schema registry and are quoted; values are always bound.

use crate::models::FieldValue;
use crate::schema::{SchemaRegistry, Table};
use rusqlite::types::{ToSql, ToSqlOutput, Value};
use rusqlite::{params_from_iter, Connection, OptionalExtension};

pub const CREATED_AT_COLUMN: &str = "created_at";
pub const UPDATED_AT_COLUMN: &str = "updated_at";

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Value::Null),
            Self::Bool(value) => ToSqlOutput::Owned(Value::Integer(i64::from(*value))),
            Self::Number(value) => ToSqlOutput::Owned(Value::Real(*value)),
            Self::Date(value) => ToSqlOutput::Owned(Value::Text(value.format("%Y-%m-%d").to_string())),
            Self::Text(value) => ToSqlOutput::from(value.as_str()),
        })
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<FieldValue>,
}

impl Statement {
    pub fn insert(table: &str, columns: &[(String, FieldValue)]) -> Self {
        let names = columns
            .iter()
            .map(|(name, _)| quote_ident(name))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = (1..=columns.len())
            .map(|index| format!("?{}", index))
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            sql: format!("INSERT INTO {} ({}) VALUES ({})", quote_ident(table), names, placeholders),
            params: columns.iter().map(|(_, value)| value.clone()).collect(),
        }
    }

    /// `UPDATE … WHERE key… RETURNING returning`; yields the returned key of the
    /// matched row, or nothing when no row matched.
    pub fn update_returning(
        table: &str,
        assignments: &[(String, FieldValue)],
        key: &[(String, FieldValue)],
        returning: &str,
    ) -> Self {
        let mut params = Vec::with_capacity(assignments.len() + key.len());
        let mut sets = Vec::with_capacity(assignments.len());
        for (name, value) in assignments {
            params.push(value.clone());
            sets.push(format!("{} = ?{}", quote_ident(name), params.len()));
        }
        let mut conditions = Vec::with_capacity(key.len());
        for (name, value) in key {
            params.push(value.clone());
            conditions.push(format!("{} = ?{}", quote_ident(name), params.len()));
        }
        Self {
            sql: format!(
                "UPDATE {} SET {} WHERE {} RETURNING {}",
                quote_ident(table),
                sets.join(", "),
                conditions.join(" AND "),
                quote_ident(returning)
            ),
            params,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[FieldValue] {
        &self.params
    }

    pub fn execute(&self, conn: &Connection) -> rusqlite::Result<usize> {
        conn.execute(&self.sql, params_from_iter(self.params.iter()))
    }

    pub fn query_returning(&self, conn: &Connection) -> rusqlite::Result<Option<String>> {
        conn.query_row(&self.sql, params_from_iter(self.params.iter()), |row| row.get::<_, String>(0))
            .optional()
    }
}

/// DDL for one registry table plus its natural-key index.
pub fn table_ddl(table: &Table, registry: &SchemaRegistry) -> String {
    let mut lines = Vec::new();
    for field in &table.fields {
        let mut line = format!("  {} {}", quote_ident(&field.name), field.field_type.sql_type());
        if field.primary_key {
            line.push_str(" PRIMARY KEY NOT NULL");
        } else if field.required {
            line.push_str(" NOT NULL");
        }
        lines.push(line);
    }
    lines.push(format!("  {} TEXT NOT NULL", quote_ident(CREATED_AT_COLUMN)));
    lines.push(format!("  {} TEXT NOT NULL", quote_ident(UPDATED_AT_COLUMN)));

    for field in &table.fields {
        let Some(parent) = field.references.as_deref().and_then(|name| registry.table(name)) else {
            continue;
        };
        let Some(parent_key) = parent.primary_key() else {
            continue;
        };
        lines.push(format!(
            "  FOREIGN KEY({}) REFERENCES {}({}) ON DELETE CASCADE ON UPDATE CASCADE",
            quote_ident(&field.name),
            quote_ident(&parent.name),
            quote_ident(&parent_key.name)
        ));
    }

    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n);",
        quote_ident(&table.name),
        lines.join(",\n")
    );
    if !table.natural_key.is_empty() {
        ddl.push_str(&format!(
            "\nCREATE UNIQUE INDEX IF NOT EXISTS {} ON {}({});",
            quote_ident(&format!("ux_{}_natural_key", table.name)),
            quote_ident(&table.name),
            table
                .natural_key
                .iter()
                .map(|key| quote_ident(key))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    ddl
}
