//! Connection-level queries shared by `Database` and by the importer and
//! scoring engine, which run them inside their own transactions.

use crate::models::{
    AggregateRecord, BranchRecord, DashboardSettings, DimensionScore, Grade, ManagementAdjustment, RadarProjection,
    TrendProjection,
};
use crate::schema::{ADJUSTMENT_TABLE, BRANCH_KEY_COLUMN, BRANCH_NAME_COLUMN, BRANCH_TABLE, DIMENSION_TABLE};
use chrono::Utc;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;

pub const AGGREGATE_TABLES_SQL: &str = "CREATE TABLE IF NOT EXISTS branch_aggregates (
   branch_code TEXT PRIMARY KEY NOT NULL,
   base_score REAL NOT NULL,
   base_grade TEXT NOT NULL,
   management_score REAL NOT NULL,
   total_score REAL NOT NULL,
   grade TEXT NOT NULL,
   radar_json TEXT NOT NULL,
   trend_json TEXT NOT NULL,
   FOREIGN KEY(branch_code) REFERENCES branches(code) ON DELETE CASCADE
 );
 CREATE TABLE IF NOT EXISTS score_history (
   branch_code TEXT NOT NULL,
   period TEXT NOT NULL,
   base_score REAL NOT NULL,
   management_score REAL NOT NULL,
   total_score REAL NOT NULL,
   PRIMARY KEY(branch_code, period),
   FOREIGN KEY(branch_code) REFERENCES branches(code) ON DELETE CASCADE
 );
 CREATE INDEX IF NOT EXISTS idx_branch_aggregates_total ON branch_aggregates(total_score DESC);";

const DIMENSION_COLUMNS: &str = "id, branch_code, dimension, raw_score, weight, weighted_score, grade, trend";
const ADJUSTMENT_COLUMNS: &str = "id, branch_code, adjustment_type, score, reason, evaluator, adjusted_on, active";
const AGGREGATE_COLUMNS: &str = "a.branch_code, b.name, a.base_score, a.base_grade, a.management_score,
     a.total_score, a.grade, a.radar_json, a.trend_json";

pub fn load_settings(conn: &Connection) -> rusqlite::Result<DashboardSettings> {
    let raw = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = 'dashboard'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    match raw {
        Some(raw) => match serde_json::from_str::<DashboardSettings>(&raw) {
            Ok(settings) => Ok(settings),
            Err(error) => {
                tracing::warn!(error = %error, "stored settings are unreadable, using defaults");
                Ok(DashboardSettings::default())
            }
        },
        None => Ok(DashboardSettings::default()),
    }
}

pub fn branch_exists(conn: &Connection, code: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(1) FROM {} WHERE {} = ?1", BRANCH_TABLE, BRANCH_KEY_COLUMN),
        [code],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn load_branch(conn: &Connection, code: &str) -> rusqlite::Result<Option<BranchRecord>> {
    let sql = format!("SELECT * FROM {} WHERE {} = ?1", BRANCH_TABLE, BRANCH_KEY_COLUMN);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map([code], parse_branch_row)?;
    rows.next().transpose()
}

pub fn list_branches(conn: &Connection) -> rusqlite::Result<Vec<BranchRecord>> {
    let sql = format!("SELECT * FROM {} ORDER BY {} ASC", BRANCH_TABLE, BRANCH_NAME_COLUMN);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], parse_branch_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn list_branch_codes(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let sql = format!("SELECT {} FROM {} ORDER BY {} ASC", BRANCH_KEY_COLUMN, BRANCH_TABLE, BRANCH_KEY_COLUMN);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn delete_branch(conn: &Connection, code: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        &format!("DELETE FROM {} WHERE {} = ?1", BRANCH_TABLE, BRANCH_KEY_COLUMN),
        [code],
    )?;
    Ok(changed > 0)
}

pub fn load_dimension_scores(conn: &Connection, branch_code: &str) -> rusqlite::Result<Vec<DimensionScore>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE branch_code = ?1 ORDER BY dimension ASC",
        DIMENSION_COLUMNS, DIMENSION_TABLE
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([branch_code], parse_dimension_score_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn load_adjustment(conn: &Connection, id: &str) -> rusqlite::Result<Option<ManagementAdjustment>> {
    conn.query_row(
        &format!("SELECT {} FROM {} WHERE id = ?1", ADJUSTMENT_COLUMNS, ADJUSTMENT_TABLE),
        [id],
        parse_adjustment_row,
    )
    .optional()
}

pub fn list_adjustments(conn: &Connection, branch_code: &str) -> rusqlite::Result<Vec<ManagementAdjustment>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE branch_code = ?1 ORDER BY adjusted_on ASC, created_at ASC, id ASC",
        ADJUSTMENT_COLUMNS, ADJUSTMENT_TABLE
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([branch_code], parse_adjustment_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn insert_adjustment(conn: &Connection, adjustment: &ManagementAdjustment) -> rusqlite::Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        &format!(
            "INSERT INTO {} ({}, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            ADJUSTMENT_TABLE, ADJUSTMENT_COLUMNS
        ),
        params![
            adjustment.id,
            adjustment.branch_code,
            adjustment.adjustment_type,
            adjustment.score,
            adjustment.reason,
            adjustment.evaluator,
            adjustment.adjusted_on,
            adjustment.active as i32,
            now,
        ],
    )?;
    Ok(())
}

pub fn update_adjustment(conn: &Connection, adjustment: &ManagementAdjustment) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        &format!(
            "UPDATE {} SET adjustment_type = ?1, score = ?2, reason = ?3, evaluator = ?4,
             adjusted_on = ?5, active = ?6, updated_at = ?7 WHERE id = ?8",
            ADJUSTMENT_TABLE
        ),
        params![
            adjustment.adjustment_type,
            adjustment.score,
            adjustment.reason,
            adjustment.evaluator,
            adjustment.adjusted_on,
            adjustment.active as i32,
            Utc::now().to_rfc3339(),
            adjustment.id,
        ],
    )?;
    Ok(changed > 0)
}

pub fn delete_adjustment(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(&format!("DELETE FROM {} WHERE id = ?1", ADJUSTMENT_TABLE), [id])?;
    Ok(changed > 0)
}

/// Scores of active adjustments in a stable order so sums are reproducible.
pub fn load_active_adjustment_scores(conn: &Connection, branch_code: &str) -> rusqlite::Result<Vec<f64>> {
    let sql = format!(
        "SELECT score FROM {} WHERE branch_code = ?1 AND COALESCE(active, 1) != 0 ORDER BY id ASC",
        ADJUSTMENT_TABLE
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([branch_code], |row| row.get::<_, f64>(0))?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Rows of any branch-owned registry table, columns carried as JSON values.
pub fn list_child_rows(
    conn: &Connection,
    table: &str,
    branch_code: &str,
) -> rusqlite::Result<Vec<BTreeMap<String, serde_json::Value>>> {
    let sql = format!(
        "SELECT * FROM {} WHERE branch_code = ?1 ORDER BY rowid ASC",
        crate::db::statement::quote_ident(table)
    );
    let mut stmt = conn.prepare(&sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(ToString::to_string).collect();
    let rows = stmt.query_map([branch_code], |row| row_to_json(row, &names))?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

pub fn upsert_score_history(
    conn: &Connection,
    branch_code: &str,
    period: &str,
    base_score: f64,
    management_score: f64,
    total_score: f64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO score_history (branch_code, period, base_score, management_score, total_score)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(branch_code, period) DO UPDATE SET
           base_score = excluded.base_score,
           management_score = excluded.management_score,
           total_score = excluded.total_score",
        params![branch_code, period, base_score, management_score, total_score],
    )?;
    Ok(())
}

/// Most recent `limit` periods, oldest first.
pub fn load_score_history(conn: &Connection, branch_code: &str, limit: usize) -> rusqlite::Result<Vec<(String, f64)>> {
    let mut stmt = conn.prepare(
        "SELECT period, total_score FROM score_history WHERE branch_code = ?1 ORDER BY period DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![branch_code, limit as i64], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    result.reverse();
    Ok(result)
}

pub fn write_aggregate(conn: &Connection, record: &AggregateRecord) -> rusqlite::Result<()> {
    let radar_json = serde_json::to_string(&record.radar).map_err(json_error)?;
    let trend_json = serde_json::to_string(&record.trend).map_err(json_error)?;
    conn.execute(
        "INSERT INTO branch_aggregates (
           branch_code, base_score, base_grade, management_score, total_score, grade, radar_json, trend_json
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(branch_code) DO UPDATE SET
           base_score = excluded.base_score,
           base_grade = excluded.base_grade,
           management_score = excluded.management_score,
           total_score = excluded.total_score,
           grade = excluded.grade,
           radar_json = excluded.radar_json,
           trend_json = excluded.trend_json",
        params![
            record.branch_code,
            record.base_score,
            record.base_grade.as_str(),
            record.management_score,
            record.total_score,
            record.grade.as_str(),
            radar_json,
            trend_json,
        ],
    )?;
    Ok(())
}

pub fn read_aggregate(conn: &Connection, branch_code: &str) -> rusqlite::Result<Option<AggregateRecord>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM branch_aggregates a JOIN {} b ON b.{} = a.branch_code WHERE a.branch_code = ?1",
            AGGREGATE_COLUMNS, BRANCH_TABLE, BRANCH_KEY_COLUMN
        ),
        [branch_code],
        parse_aggregate_row,
    )
    .optional()
}

pub fn list_aggregates(conn: &Connection) -> rusqlite::Result<Vec<AggregateRecord>> {
    let sql = format!(
        "SELECT {} FROM branch_aggregates a JOIN {} b ON b.{} = a.branch_code
         ORDER BY a.total_score DESC, b.{} ASC",
        AGGREGATE_COLUMNS, BRANCH_TABLE, BRANCH_KEY_COLUMN, BRANCH_NAME_COLUMN
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], parse_aggregate_row)?;
    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Raw stored columns of an aggregate, used to compare recomputations.
pub fn aggregate_fingerprint(conn: &Connection, branch_code: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT base_score || '|' || base_grade || '|' || management_score || '|' || total_score || '|'
                || grade || '|' || radar_json || '|' || trend_json
         FROM branch_aggregates WHERE branch_code = ?1",
        [branch_code],
        |row| row.get::<_, String>(0),
    )
    .optional()
}

fn parse_branch_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BranchRecord> {
    let names: Vec<String> = row
        .as_ref()
        .column_names()
        .into_iter()
        .map(ToString::to_string)
        .collect();
    let mut attributes = row_to_json(row, &names)?;
    let code = take_string(&mut attributes, BRANCH_KEY_COLUMN);
    let name = take_string(&mut attributes, BRANCH_NAME_COLUMN);
    Ok(BranchRecord { code, name, attributes })
}

fn take_string(map: &mut BTreeMap<String, serde_json::Value>, key: &str) -> String {
    match map.remove(key) {
        Some(serde_json::Value::String(value)) => value,
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn parse_dimension_score_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DimensionScore> {
    Ok(DimensionScore {
        id: row.get(0)?,
        branch_code: row.get(1)?,
        dimension: row.get(2)?,
        raw_score: row.get(3)?,
        weight: row.get::<_, Option<f64>>(4)?.unwrap_or_default(),
        weighted_score: row.get::<_, Option<f64>>(5)?.unwrap_or_default(),
        grade: parse_grade(row.get::<_, Option<String>>(6)?.as_deref().unwrap_or("C"))?,
        trend: row.get(7)?,
    })
}

fn parse_adjustment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManagementAdjustment> {
    Ok(ManagementAdjustment {
        id: row.get(0)?,
        branch_code: row.get(1)?,
        adjustment_type: row.get(2)?,
        score: row.get(3)?,
        reason: row.get(4)?,
        evaluator: row.get(5)?,
        adjusted_on: row.get(6)?,
        active: row.get::<_, Option<i64>>(7)?.map(|value| value != 0).unwrap_or(true),
    })
}

fn parse_aggregate_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AggregateRecord> {
    let radar_raw: String = row.get(7)?;
    let trend_raw: String = row.get(8)?;
    Ok(AggregateRecord {
        branch_code: row.get(0)?,
        branch_name: row.get(1)?,
        base_score: row.get(2)?,
        base_grade: parse_grade(&row.get::<_, String>(3)?)?,
        management_score: row.get(4)?,
        total_score: row.get(5)?,
        grade: parse_grade(&row.get::<_, String>(6)?)?,
        radar: serde_json::from_str::<RadarProjection>(&radar_raw).unwrap_or_default(),
        trend: serde_json::from_str::<TrendProjection>(&trend_raw).unwrap_or_default(),
    })
}

fn parse_grade(raw: &str) -> rusqlite::Result<Grade> {
    Grade::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Unknown grade '{}'", raw),
            )),
        )
    })
}

fn row_to_json(row: &rusqlite::Row<'_>, names: &[String]) -> rusqlite::Result<BTreeMap<String, serde_json::Value>> {
    let mut map = BTreeMap::new();
    for (index, name) in names.iter().enumerate() {
        let value = match row.get_ref(index)? {
            ValueRef::Null => serde_json::Value::Null,
            ValueRef::Integer(value) => serde_json::Value::from(value),
            ValueRef::Real(value) => serde_json::Number::from_f64(value)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueRef::Text(bytes) => serde_json::Value::String(String::from_utf8_lossy(bytes).to_string()),
            ValueRef::Blob(bytes) => serde_json::Value::from(bytes.len()),
        };
        map.insert(name.clone(), value);
    }
    Ok(map)
}

fn json_error(error: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(error))
}
