//! Declarative description of the importable tables, the scoring dimensions
//! and the bounds of management adjustments.
//!
//! The registry is loaded once (from the embedded default or a YAML file) and
//! passed by value/reference to every component that needs it.

pub mod validation;

use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

const DEFAULT_REGISTRY_YAML: &str = include_str!("registry.yaml");

pub const BRANCH_TABLE: &str = "branches";
pub const DIMENSION_TABLE: &str = "dimension_scores";
pub const ADJUSTMENT_TABLE: &str = "management_adjustments";
pub const DISTRIBUTION_TABLE: &str = "personnel_distributions";
pub const BRANCH_KEY_COLUMN: &str = "code";
pub const BRANCH_NAME_COLUMN: &str = "name";
pub const BRANCH_REFERENCE_COLUMN: &str = "branch_code";

/// Columns the scoring engine and typed queries read directly.
const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    (BRANCH_TABLE, &["code", "name"]),
    (
        DIMENSION_TABLE,
        &["id", "branch_code", "dimension", "raw_score", "trend", "weight", "weighted_score", "grade"],
    ),
    (
        ADJUSTMENT_TABLE,
        &["id", "branch_code", "adjustment_type", "score", "reason", "evaluator", "adjusted_on", "active"],
    ),
];

/// Maintained by the store on every registry table.
const RESERVED_COLUMNS: &[&str] = &["created_at", "updated_at"];

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Number,
    String,
    Boolean,
    Date,
}

impl FieldType {
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Number => "REAL",
            Self::Boolean => "INTEGER",
            Self::String | Self::Date => "TEXT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub auto_generated: bool,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub derived: bool,
    #[serde(default)]
    pub references: Option<String>,
}

impl Field {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            aliases: Vec::new(),
            primary_key: false,
            auto_generated: false,
            required: false,
            derived: false,
            references: None,
        }
    }

    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases = aliases.iter().map(ToString::to_string).collect();
        self
    }

    /// Whether a spreadsheet column may feed this field.
    pub fn is_mappable(&self) -> bool {
        !self.auto_generated && !self.derived
    }

    /// Name first, then aliases in declaration order.
    pub fn spellings(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub sheet_aliases: Vec<String>,
    pub fields: Vec<Field>,
    #[serde(default)]
    pub natural_key: Vec<String>,
}

impl Table {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn primary_key(&self) -> Option<&Field> {
        self.fields.iter().find(|field| field.primary_key)
    }

    pub fn mappable_fields(&self) -> Vec<Field> {
        self.fields.iter().filter(|field| field.is_mappable()).cloned().collect()
    }

    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }

    fn matches_sheet(&self, sheet: &str) -> bool {
        let needle = fold(sheet);
        std::iter::once(self.name.as_str())
            .chain(self.label.as_deref())
            .chain(self.sheet_aliases.iter().map(String::as_str))
            .any(|candidate| fold(candidate) == needle)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionDef {
    pub key: String,
    pub label: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentRule {
    pub kind: String,
    #[serde(default)]
    pub label: Option<String>,
    pub min: f64,
    pub max: f64,
}

impl AdjustmentRule {
    pub fn contains(&self, score: f64) -> bool {
        score >= self.min && score <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRegistry {
    #[serde(default = "default_management_axis_label")]
    pub management_axis_label: String,
    pub dimensions: Vec<DimensionDef>,
    #[serde(default)]
    pub adjustment_rules: Vec<AdjustmentRule>,
    pub tables: Vec<Table>,
}

fn default_management_axis_label() -> String {
    "Management".to_string()
}

impl SchemaRegistry {
    pub fn builtin() -> AppResult<Self> {
        Self::from_yaml(DEFAULT_REGISTRY_YAML)
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        let document: serde_json::Value = serde_yaml::from_str(raw)?;
        let validation = validation::validate_registry_document(&document);
        if let Some(error) = validation.error {
            let detail = if validation.errors.is_empty() {
                error
            } else {
                format!("{} {}", error, validation.errors.join("; "))
            };
            return Err(AppError::Config(detail));
        }
        let registry: Self =
            serde_json::from_value(document).map_err(|error| AppError::Config(error.to_string()))?;
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> AppResult<()> {
        let mut table_names = HashSet::new();
        for table in &self.tables {
            if !table_names.insert(table.name.as_str()) {
                return Err(config(format!("table '{}' is declared twice", table.name)));
            }
            self.validate_table(table)?;
        }

        let branch_key = self
            .table(BRANCH_TABLE)
            .and_then(Table::primary_key)
            .map(|field| field.name.as_str());
        if branch_key.is_some() && branch_key != Some(BRANCH_KEY_COLUMN) {
            return Err(config(format!("'{}' must be keyed by '{}'", BRANCH_TABLE, BRANCH_KEY_COLUMN)));
        }

        for (table_name, columns) in REQUIRED_COLUMNS {
            let table = self
                .table(table_name)
                .ok_or_else(|| config(format!("scoring table '{}' is not declared", table_name)))?;
            for column in columns.iter() {
                if table.field(column).is_none() {
                    return Err(config(format!("table '{}' lacks column '{}'", table_name, column)));
                }
            }
        }

        let mut dimension_keys = HashSet::new();
        for dimension in &self.dimensions {
            if !dimension_keys.insert(fold(&dimension.key)) {
                return Err(config(format!("dimension '{}' is declared twice", dimension.key)));
            }
        }
        let sum = self.weight_sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(config(format!("dimension weights sum to {} instead of 1.0", sum)));
        }

        let mut kinds = HashSet::new();
        for rule in &self.adjustment_rules {
            if !kinds.insert(fold(&rule.kind)) {
                return Err(config(format!("adjustment type '{}' is declared twice", rule.kind)));
            }
            if rule.min > rule.max {
                return Err(config(format!(
                    "adjustment type '{}' has min {} above max {}",
                    rule.kind, rule.min, rule.max
                )));
            }
        }
        Ok(())
    }

    fn validate_table(&self, table: &Table) -> AppResult<()> {
        let mut field_names = HashSet::new();
        for field in &table.fields {
            if !field_names.insert(field.name.as_str()) {
                return Err(config(format!("field '{}.{}' is declared twice", table.name, field.name)));
            }
            if RESERVED_COLUMNS.contains(&field.name.as_str()) {
                return Err(config(format!("field '{}.{}' uses a reserved name", table.name, field.name)));
            }
            if let Some(parent) = field.references.as_deref() {
                let parent_table = self.table(parent).ok_or_else(|| {
                    config(format!("field '{}.{}' references unknown table '{}'", table.name, field.name, parent))
                })?;
                if parent_table.natural_key.len() != 1 {
                    return Err(config(format!(
                        "referenced table '{}' needs a single-field natural key",
                        parent
                    )));
                }
            }
        }

        let keys: Vec<&Field> = table.fields.iter().filter(|field| field.primary_key).collect();
        match keys.as_slice() {
            [key] if key.field_type == FieldType::String => {}
            [key] => {
                return Err(config(format!("primary key '{}.{}' must be a string", table.name, key.name)))
            }
            _ => {
                return Err(config(format!(
                    "table '{}' must declare exactly one primary key",
                    table.name
                )))
            }
        }

        for key in &table.natural_key {
            if table.field(key).is_none() {
                return Err(config(format!("natural key '{}.{}' is not a field", table.name, key)));
            }
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|table| table.name == name)
    }

    pub fn table_for_sheet(&self, sheet: &str) -> Option<&Table> {
        self.tables.iter().find(|table| table.matches_sheet(sheet))
    }

    pub fn table_position(&self, name: &str) -> Option<usize> {
        self.tables.iter().position(|table| table.name == name)
    }

    pub fn dimension(&self, key_or_label: &str) -> Option<&DimensionDef> {
        let needle = fold(key_or_label);
        self.dimensions
            .iter()
            .find(|dimension| fold(&dimension.key) == needle || fold(&dimension.label) == needle)
    }

    pub fn dimension_position(&self, key: &str) -> Option<usize> {
        self.dimensions.iter().position(|dimension| dimension.key == key)
    }

    pub fn adjustment_rule(&self, kind_or_label: &str) -> Option<&AdjustmentRule> {
        let needle = fold(kind_or_label);
        self.adjustment_rules.iter().find(|rule| {
            fold(&rule.kind) == needle || rule.label.as_deref().map(fold).as_deref() == Some(needle.as_str())
        })
    }

    pub fn weight_sum(&self) -> f64 {
        self.dimensions.iter().map(|dimension| dimension.weight).sum()
    }
}

/// Trimmed, lower-cased form used for every exact case-insensitive lookup.
pub fn fold(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn config(message: String) -> AppError {
    AppError::Config(message)
}

#[cfg(test)]
mod tests {
    use super::{SchemaRegistry, ADJUSTMENT_TABLE, BRANCH_TABLE};

    #[test]
    fn builtin_registry_loads_and_weights_sum_to_one() {
        let registry = SchemaRegistry::builtin().expect("registry");
        assert_eq!(registry.dimensions.len(), 7);
        assert!((registry.weight_sum() - 1.0).abs() <= 1e-6);
        let branches = registry.table(BRANCH_TABLE).expect("branches");
        assert_eq!(branches.primary_key().map(|field| field.name.as_str()), Some("code"));
        assert_eq!(branches.natural_key, vec!["name".to_string()]);
    }

    #[test]
    fn rejects_weights_that_do_not_sum_to_one() {
        let mut registry = SchemaRegistry::builtin().expect("registry");
        registry.dimensions[0].weight += 0.01;
        let error = registry.validate().expect_err("weights must sum to one");
        assert!(error.to_string().contains("weights"));
    }

    #[test]
    fn rejects_yaml_with_unknown_field_type() {
        let raw = "dimensions:\n  - {key: a, label: A, weight: 1.0}\ntables:\n  - name: branches\n    fields:\n      - {name: code, type: text}\n";
        let error = SchemaRegistry::from_yaml(raw).expect_err("schema violation");
        assert!(error.to_string().starts_with("CONFIG_INVALID"));
    }

    #[test]
    fn lookups_are_exact_and_case_insensitive() {
        let registry = SchemaRegistry::builtin().expect("registry");
        assert_eq!(registry.table_for_sheet(" Branches ").map(|t| t.name.as_str()), Some(BRANCH_TABLE));
        assert_eq!(registry.table_for_sheet("管理评价").map(|t| t.name.as_str()), Some(ADJUSTMENT_TABLE));
        assert!(registry.table_for_sheet("管理评").is_none());
        assert_eq!(registry.dimension("组织建设").map(|d| d.key.as_str()), Some("organization"));
        assert_eq!(registry.dimension("ORGANIZATION").map(|d| d.label.as_str()), Some("组织建设"));
        let rule = registry.adjustment_rule("领导评价").expect("rule");
        assert_eq!((rule.min, rule.max), (-3.0, 3.0));
        assert!(!rule.contains(3.5));
    }
}
