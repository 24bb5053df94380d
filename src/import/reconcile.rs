use super::MappedRow;
use crate::db::statement::{Statement, CREATED_AT_COLUMN, UPDATED_AT_COLUMN};
use crate::errors::AppError;
use crate::models::{FieldValue, ReconcileStrategy};
use crate::schema::Table;
use chrono::Utc;
use rusqlite::{Connection, ErrorCode};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub outcome: RowOutcome,
    pub id: String,
}

#[derive(Debug)]
pub enum RowFailure {
    /// The row is rejected; the batch goes on.
    Row(String),
    /// The store itself is unusable; the batch stops.
    Fatal(AppError),
}

/// Writes one mapped row into `table`.
///
/// With `Upsert`, a present non-generated primary key is tried first, then a
/// complete natural key; when neither matches an existing row the row is
/// inserted. `InsertOnly` always inserts and lets duplicates fail.
pub fn reconcile(
    row: &MappedRow,
    table: &Table,
    conn: &Connection,
    strategy: ReconcileStrategy,
) -> Result<Reconciled, RowFailure> {
    let primary_key = table
        .primary_key()
        .ok_or_else(|| RowFailure::Fatal(AppError::Config(format!("table '{}' has no primary key", table.name))))?;
    let now = FieldValue::Text(Utc::now().to_rfc3339());
    let given_key = if primary_key.auto_generated {
        None
    } else {
        row.get(&primary_key.name)
            .filter(|value| !value.is_null())
            .map(ToString::to_string)
    };

    if strategy == ReconcileStrategy::Upsert {
        let key_columns: Option<Vec<String>> = if given_key.is_some() {
            Some(vec![primary_key.name.clone()])
        } else if !table.natural_key.is_empty()
            && table
                .natural_key
                .iter()
                .all(|name| row.get(name).map(|value| !value.is_null()).unwrap_or(false))
        {
            Some(table.natural_key.clone())
        } else {
            None
        };

        if let Some(key_columns) = key_columns {
            let mut assignments: Vec<(String, FieldValue)> = row
                .values()
                .iter()
                .filter(|(name, _)| name != &primary_key.name && !key_columns.contains(name))
                .cloned()
                .collect();
            assignments.push((UPDATED_AT_COLUMN.to_string(), now.clone()));
            let key: Vec<(String, FieldValue)> = key_columns
                .iter()
                .map(|name| (name.clone(), row.get(name).cloned().unwrap_or(FieldValue::Null)))
                .collect();

            let statement = Statement::update_returning(&table.name, &assignments, &key, &primary_key.name);
            if let Some(id) = statement.query_returning(conn).map_err(classify)? {
                return Ok(Reconciled {
                    outcome: RowOutcome::Updated,
                    id,
                });
            }
        }
    }

    let id = given_key.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut columns: Vec<(String, FieldValue)> = row
        .values()
        .iter()
        .filter(|(name, _)| name != &primary_key.name)
        .cloned()
        .collect();
    columns.insert(0, (primary_key.name.clone(), FieldValue::Text(id.clone())));
    columns.push((CREATED_AT_COLUMN.to_string(), now.clone()));
    columns.push((UPDATED_AT_COLUMN.to_string(), now));

    Statement::insert(&table.name, &columns)
        .execute(conn)
        .map_err(classify)?;
    Ok(Reconciled {
        outcome: RowOutcome::Inserted,
        id,
    })
}

/// Constraint and data errors belong to the row; everything else means the
/// connection or file is in trouble.
pub fn classify(error: rusqlite::Error) -> RowFailure {
    match &error {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch | ErrorCode::TooBig => {
                RowFailure::Row(error.to_string())
            }
            _ => RowFailure::Fatal(AppError::Store(error.to_string())),
        },
        rusqlite::Error::ToSqlConversionFailure(_)
        | rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => RowFailure::Row(error.to_string()),
        _ => RowFailure::Fatal(AppError::Store(error.to_string())),
    }
}
