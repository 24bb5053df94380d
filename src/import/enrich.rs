use super::MappedRow;
use crate::models::FieldValue;
use crate::schema::{SchemaRegistry, ADJUSTMENT_TABLE, DIMENSION_TABLE};
use crate::scoring::grade;
use std::collections::HashMap;
use std::sync::Arc;

pub const MIN_RAW_SCORE: f64 = 0.0;
pub const MAX_RAW_SCORE: f64 = 100.0;

/// A rejected row: the offending column, if any, and a readable reason.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub column: Option<String>,
    pub message: String,
}

impl Rejection {
    fn on(column: &str, message: String) -> Self {
        Self {
            column: Some(column.to_string()),
            message,
        }
    }
}

/// Table-specific rules applied to a coerced row before it is cross-referenced
/// and written. May canonicalize values and fill derived columns.
pub trait RowEnricher: Send + Sync {
    fn enrich(&self, row: &mut MappedRow) -> Result<(), Rejection>;
}

/// Canonical dimension key, raw score bounds, and the weight, weighted score
/// and grade derived from them.
#[derive(Debug, Clone)]
pub struct DimensionEnricher {
    registry: Arc<SchemaRegistry>,
}

impl DimensionEnricher {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }
}

impl RowEnricher for DimensionEnricher {
    fn enrich(&self, row: &mut MappedRow) -> Result<(), Rejection> {
        let raw_dimension = row.get("dimension").map(ToString::to_string).unwrap_or_default();
        let dimension = self
            .registry
            .dimension(&raw_dimension)
            .ok_or_else(|| Rejection::on("dimension", format!("Unknown dimension '{}'", raw_dimension)))?;

        let raw_score = row
            .get("raw_score")
            .and_then(FieldValue::as_f64)
            .ok_or_else(|| Rejection::on("raw_score", "Raw score is required".to_string()))?;
        if !(MIN_RAW_SCORE..=MAX_RAW_SCORE).contains(&raw_score) {
            return Err(Rejection::on(
                "raw_score",
                format!(
                    "Raw score {} is out of allowed range ({}..={})",
                    raw_score, MIN_RAW_SCORE, MAX_RAW_SCORE
                ),
            ));
        }

        row.set("dimension", FieldValue::Text(dimension.key.clone()));
        row.set("weight", FieldValue::Number(dimension.weight));
        row.set("weighted_score", FieldValue::Number(raw_score * dimension.weight));
        row.set("grade", FieldValue::Text(grade(raw_score).as_str().to_string()));
        Ok(())
    }
}

/// Canonical adjustment kind and its score bounds. Out-of-range scores are
/// rejected rather than clamped.
#[derive(Debug, Clone)]
pub struct AdjustmentEnricher {
    registry: Arc<SchemaRegistry>,
}

impl AdjustmentEnricher {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }
}

impl RowEnricher for AdjustmentEnricher {
    fn enrich(&self, row: &mut MappedRow) -> Result<(), Rejection> {
        let raw_type = row.get("adjustment_type").map(ToString::to_string).unwrap_or_default();
        let rule = self.registry.adjustment_rule(&raw_type).ok_or_else(|| {
            Rejection::on("adjustment_type", format!("Unknown adjustment type '{}'", raw_type))
        })?;

        let score = row
            .get("score")
            .and_then(FieldValue::as_f64)
            .ok_or_else(|| Rejection::on("score", "Adjustment score is required".to_string()))?;
        if !rule.contains(score) {
            return Err(Rejection::on(
                "score",
                format!(
                    "Adjustment score {} is out of allowed range ({}..={}) for '{}'",
                    score, rule.min, rule.max, rule.kind
                ),
            ));
        }

        row.set("adjustment_type", FieldValue::Text(rule.kind.clone()));
        if row.get("active").map(FieldValue::is_null).unwrap_or(true) {
            row.set("active", FieldValue::Bool(true));
        }
        Ok(())
    }
}

/// Enrichers keyed by table name.
#[derive(Clone, Default)]
pub struct EnricherSet {
    by_table: HashMap<String, Arc<dyn RowEnricher>>,
}

impl EnricherSet {
    pub fn builtin(registry: &Arc<SchemaRegistry>) -> Self {
        let mut set = Self::default();
        set.register(DIMENSION_TABLE, Arc::new(DimensionEnricher::new(registry.clone())));
        set.register(ADJUSTMENT_TABLE, Arc::new(AdjustmentEnricher::new(registry.clone())));
        set
    }

    pub fn register(&mut self, table: &str, enricher: Arc<dyn RowEnricher>) {
        self.by_table.insert(table.to_string(), enricher);
    }

    pub fn for_table(&self, table: &str) -> Option<&dyn RowEnricher> {
        self.by_table.get(table).map(|enricher| enricher.as_ref())
    }
}

impl std::fmt::Debug for EnricherSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tables: Vec<&String> = self.by_table.keys().collect();
        tables.sort();
        f.debug_struct("EnricherSet").field("tables", &tables).finish()
    }
}
