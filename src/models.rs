use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A raw spreadsheet cell as handed over by the workbook parser.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    #[default]
    Empty,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl CellValue {
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    pub fn header_text(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::Bool(value) => value.to_string(),
            Self::Number(value) => format_number(*value),
            Self::Text(text) => text.trim().to_string(),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// A cell value after coercion to the declared field type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Date(NaiveDate),
    Text(String),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(value) => write!(f, "{}", value),
            Self::Number(value) => f.write_str(&format_number(*value)),
            Self::Date(value) => write!(f, "{}", value.format("%Y-%m-%d")),
            Self::Text(value) => f.write_str(value),
        }
    }
}

/// Renders integral numbers without a fractional part, everything else in
/// shortest round-trip form.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worksheet {
    pub name: String,
    pub rows: Vec<Vec<CellValue>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workbook {
    pub sheets: Vec<Worksheet>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionMode {
    #[default]
    PerRow,
    AllOrNothing,
}

impl TransactionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PerRow => "per-row",
            Self::AllOrNothing => "all-or-nothing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileStrategy {
    #[default]
    Upsert,
    InsertOnly,
}

impl ReconcileStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::InsertOnly => "insert-only",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOptions {
    pub mode: Option<TransactionMode>,
    pub strategy: Option<ReconcileStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueKind {
    FieldResolutionMiss,
    CoercionFailure,
    ReconciliationFailure,
    EntityResolutionFailure,
    ValidationFailure,
}

impl IssueKind {
    /// Warnings never cost the row; everything else skips it.
    pub fn is_warning(self) -> bool {
        matches!(self, Self::FieldResolutionMiss | Self::CoercionFailure)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportIssue {
    pub sheet: String,
    pub row_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub kind: IssueKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub header: String,
    pub field: String,
    pub exact: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetSummary {
    pub sheet: String,
    pub table: Option<String>,
    pub columns: Vec<ColumnMapping>,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub batch_id: String,
    pub success: bool,
    pub rolled_back: bool,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub total_errors: usize,
    pub total_warnings: usize,
    pub errors: Vec<ImportIssue>,
    pub warnings: Vec<ImportIssue>,
    pub sheets: Vec<SheetSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Grade {
    #[serde(rename = "A+")]
    APlus,
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B+")]
    BPlus,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "C")]
    C,
}

impl Grade {
    pub const ALL: [Grade; 5] = [Grade::APlus, Grade::A, Grade::BPlus, Grade::B, Grade::C];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::APlus => "A+",
            Self::A => "A",
            Self::BPlus => "B+",
            Self::B => "B",
            Self::C => "C",
        }
    }

    /// Higher is better.
    pub fn rank(self) -> u8 {
        match self {
            Self::APlus => 4,
            Self::A => 3,
            Self::BPlus => 2,
            Self::B => 1,
            Self::C => 0,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|grade| grade.as_str() == raw)
    }
}

/// An imported organizational unit. Columns beyond the key pair are carried
/// as-is so custom registries can add their own attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRecord {
    pub code: String,
    pub name: String,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionScore {
    pub id: String,
    pub branch_code: String,
    pub dimension: String,
    pub raw_score: f64,
    pub weight: f64,
    pub weighted_score: f64,
    pub grade: Grade,
    pub trend: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementAdjustment {
    pub id: String,
    pub branch_code: String,
    pub adjustment_type: String,
    pub score: f64,
    pub reason: Option<String>,
    pub evaluator: Option<String>,
    pub adjusted_on: Option<NaiveDate>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveAdjustmentPayload {
    pub branch_code: String,
    pub adjustment_type: String,
    pub score: f64,
    pub reason: Option<String>,
    pub evaluator: Option<String>,
    pub adjusted_on: Option<NaiveDate>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAdjustmentPayload {
    pub adjustment_type: Option<String>,
    pub score: Option<f64>,
    pub reason: Option<String>,
    pub evaluator: Option<String>,
    pub adjusted_on: Option<NaiveDate>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RadarProjection {
    pub labels: Vec<String>,
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendProjection {
    pub labels: Vec<String>,
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateRecord {
    pub branch_code: String,
    pub branch_name: String,
    pub base_score: f64,
    pub base_grade: Grade,
    pub management_score: f64,
    pub total_score: f64,
    pub grade: Grade,
    pub radar: RadarProjection,
    pub trend: TrendProjection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeCount {
    pub grade: Grade,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportBatchRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub mode: TransactionMode,
    pub strategy: ReconcileStrategy,
    pub success: bool,
    pub rolled_back: bool,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub error_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DashboardSettings {
    pub max_reported_errors: usize,
    pub similarity_threshold: f64,
    pub default_transaction_mode: TransactionMode,
    pub default_strategy: ReconcileStrategy,
    pub evaluation_period: String,
    pub trend_window: usize,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            max_reported_errors: 50,
            similarity_threshold: 0.5,
            default_transaction_mode: TransactionMode::PerRow,
            default_strategy: ReconcileStrategy::Upsert,
            evaluation_period: Utc::now().year().to_string(),
            trend_window: 6,
        }
    }
}
