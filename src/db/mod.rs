pub mod queries;
pub mod statement;

use crate::errors::{AppError, AppResult};
use crate::models::{DashboardSettings, ImportBatchRecord, ReconcileStrategy, TransactionMode};
use crate::schema::SchemaRegistry;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Transaction};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path, registry: &SchemaRegistry) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };

        db.ensure_registry_tables(registry)?;
        db.ensure_default_settings()?;

        Ok(db)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> AppResult<T>) -> AppResult<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Runs `f` in one transaction; commits on `Ok`, rolls back on `Err`.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> AppResult<T>) -> AppResult<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn get_settings(&self) -> AppResult<DashboardSettings> {
        let conn = self.lock()?;
        Ok(queries::load_settings(&conn)?)
    }

    /// Deep-merges `update` into the stored settings. `validate` sees the
    /// merged value before anything is written.
    pub fn update_settings(
        &self,
        update: serde_json::Value,
        validate: impl FnOnce(&DashboardSettings) -> AppResult<()>,
    ) -> AppResult<DashboardSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: DashboardSettings =
            serde_json::from_value(merged).map_err(|err| AppError::Invalid(format!("settings: {}", err)))?;
        validate(&settings)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('dashboard', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, Utc::now().to_rfc3339()],
        )?;

        Ok(settings)
    }

    pub fn record_import_batch(&self, batch: &ImportBatchRecord, report: &serde_json::Value) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO import_batches (
               id, started_at, finished_at, mode, strategy, success, rolled_back,
               inserted, updated, skipped, error_count, report_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                batch.id,
                batch.started_at.to_rfc3339(),
                batch.finished_at.to_rfc3339(),
                batch.mode.as_str(),
                batch.strategy.as_str(),
                batch.success as i32,
                batch.rolled_back as i32,
                batch.inserted as i64,
                batch.updated as i64,
                batch.skipped as i64,
                batch.error_count as i64,
                serde_json::to_string(report)?,
            ],
        )?;
        Ok(())
    }

    pub fn list_import_batches(&self, limit: u32) -> AppResult<Vec<ImportBatchRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, started_at, finished_at, mode, strategy, success, rolled_back,
                    inserted, updated, skipped, error_count
             FROM import_batches
             ORDER BY started_at DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit.clamp(1, 500)], parse_import_batch_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM settings WHERE key = 'dashboard'", [], |row| row.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES ('dashboard', ?1, ?2)",
                params![
                    serde_json::to_string(&DashboardSettings::default())?,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }

    /// Creates registry tables that do not exist yet and adds columns a newer
    /// registry declares on tables that do.
    fn ensure_registry_tables(&self, registry: &SchemaRegistry) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        for table in &registry.tables {
            conn.execute_batch(&statement::table_ddl(table, registry))?;
            for field in &table.fields {
                if !column_exists(&conn, &table.name, &field.name)? {
                    conn.execute(
                        &format!(
                            "ALTER TABLE {} ADD COLUMN {} {}",
                            statement::quote_ident(&table.name),
                            statement::quote_ident(&field.name),
                            field.field_type.sql_type()
                        ),
                        [],
                    )?;
                }
            }
        }

        conn.execute_batch(queries::AGGREGATE_TABLES_SQL)?;
        Ok(())
    }
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({})", statement::quote_ident(table));
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn parse_import_batch_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ImportBatchRecord> {
    let mode = match row.get::<_, String>(3)?.as_str() {
        "all-or-nothing" => TransactionMode::AllOrNothing,
        _ => TransactionMode::PerRow,
    };
    let strategy = match row.get::<_, String>(4)?.as_str() {
        "insert-only" => ReconcileStrategy::InsertOnly,
        _ => ReconcileStrategy::Upsert,
    };
    Ok(ImportBatchRecord {
        id: row.get(0)?,
        started_at: parse_datetime(row.get::<_, String>(1)?),
        finished_at: parse_datetime(row.get::<_, String>(2)?),
        mode,
        strategy,
        success: row.get::<_, i64>(5)? != 0,
        rolled_back: row.get::<_, i64>(6)? != 0,
        inserted: row.get::<_, i64>(7)? as usize,
        updated: row.get::<_, i64>(8)? as usize,
        skipped: row.get::<_, i64>(9)? as usize,
        error_count: row.get::<_, i64>(10)? as usize,
    })
}

fn parse_datetime(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|value| value.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{merge_json, Database};
    use crate::models::{ImportBatchRecord, ReconcileStrategy, TransactionMode};
    use crate::schema::SchemaRegistry;
    use chrono::Utc;

    fn open(dir: &tempfile::TempDir) -> Database {
        let registry = SchemaRegistry::builtin().expect("registry");
        Database::new(&dir.path().join("test.db"), &registry).expect("db")
    }

    #[test]
    fn creates_registry_and_aggregate_tables() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                let mut names = Vec::new();
                for row in rows {
                    names.push(row?);
                }
                Ok(names)
            })
            .expect("tables");
        for expected in [
            "branch_aggregates",
            "branches",
            "dimension_scores",
            "import_batches",
            "management_adjustments",
            "personnel_distributions",
            "score_history",
            "settings",
        ] {
            assert!(tables.iter().any(|name| name == expected), "missing {}", expected);
        }
    }

    #[test]
    fn reopening_an_existing_database_is_harmless() {
        let dir = tempfile::tempdir().expect("tempdir");
        drop(open(&dir));
        let db = open(&dir);
        assert_eq!(db.get_settings().expect("settings").trend_window, 6);
    }

    #[test]
    fn settings_update_deep_merges_and_validates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);

        let updated = db
            .update_settings(serde_json::json!({ "trendWindow": 3 }), |_| Ok(()))
            .expect("update");
        assert_eq!(updated.trend_window, 3);
        assert_eq!(updated.max_reported_errors, 50);

        let rejected = db.update_settings(serde_json::json!({ "trendWindow": 99 }), |settings| {
            if settings.trend_window > 24 {
                Err(crate::errors::AppError::Policy("too wide".to_string()))
            } else {
                Ok(())
            }
        });
        assert!(rejected.is_err());
        assert_eq!(db.get_settings().expect("settings").trend_window, 3);
    }

    #[test]
    fn unreadable_settings_fall_back_to_defaults_until_rewritten() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        db.with_conn(|conn| {
            conn.execute("UPDATE settings SET value_json = '{not json' WHERE key = 'dashboard'", [])?;
            Ok(())
        })
        .expect("corrupt settings");

        let settings = db.get_settings().expect("settings");
        assert_eq!(settings.max_reported_errors, 50);
        assert_eq!(settings.trend_window, 6);

        let updated = db
            .update_settings(serde_json::json!({ "evaluationPeriod": "2023" }), |_| Ok(()))
            .expect("update");
        assert_eq!(updated.evaluation_period, "2023");
        assert_eq!(db.get_settings().expect("settings").evaluation_period, "2023");
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let result: crate::errors::AppResult<()> = db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO branches (code, name, created_at, updated_at) VALUES ('B-1', 'One', 'x', 'x')",
                [],
            )?;
            Err(crate::errors::AppError::Internal("abort".to_string()))
        });
        assert!(result.is_err());
        let count: i64 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(1) FROM branches", [], |row| row.get(0))?))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn import_batches_are_listed_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        for (index, id) in ["batch-1", "batch-2"].into_iter().enumerate() {
            let at = Utc::now() + chrono::Duration::seconds(index as i64);
            db.record_import_batch(
                &ImportBatchRecord {
                    id: id.to_string(),
                    started_at: at,
                    finished_at: at,
                    mode: TransactionMode::AllOrNothing,
                    strategy: ReconcileStrategy::Upsert,
                    success: true,
                    rolled_back: false,
                    inserted: 2,
                    updated: 0,
                    skipped: 0,
                    error_count: 0,
                },
                &serde_json::json!({}),
            )
            .expect("record");
        }
        let batches = db.list_import_batches(10).expect("list");
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].id, "batch-2");
        assert_eq!(batches[0].mode, TransactionMode::AllOrNothing);
    }

    #[test]
    fn merge_json_replaces_leaves_only() {
        let mut target = serde_json::json!({ "a": { "b": 1, "c": 2 }, "d": 3 });
        merge_json(&mut target, serde_json::json!({ "a": { "b": 5 } }));
        assert_eq!(target, serde_json::json!({ "a": { "b": 5, "c": 2 }, "d": 3 }));
    }
}
