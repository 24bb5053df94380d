use crate::errors::{AppError, AppResult};
use crate::models::DashboardSettings;
use crate::schema::{AdjustmentRule, SchemaRegistry};

const MIN_REPORTED_ERRORS: usize = 1;
const MAX_REPORTED_ERRORS: usize = 1_000;
const MIN_TREND_WINDOW: usize = 1;
const MAX_TREND_WINDOW: usize = 24;
const MAX_EVALUATION_PERIOD_LEN: usize = 32;
const MAX_REASON_LEN: usize = 2_000;

/// Bounds on persisted settings and on manually entered adjustments.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    adjustment_rules: Vec<AdjustmentRule>,
}

impl PolicyEngine {
    pub fn new(registry: &SchemaRegistry) -> Self {
        Self {
            adjustment_rules: registry.adjustment_rules.clone(),
        }
    }

    pub fn validate_settings(&self, settings: &DashboardSettings) -> AppResult<()> {
        if !(MIN_REPORTED_ERRORS..=MAX_REPORTED_ERRORS).contains(&settings.max_reported_errors) {
            return Err(AppError::Policy(format!(
                "maxReportedErrors {} is out of allowed range ({}..={})",
                settings.max_reported_errors, MIN_REPORTED_ERRORS, MAX_REPORTED_ERRORS
            )));
        }

        let threshold = settings.similarity_threshold;
        if !threshold.is_finite() || threshold <= 0.0 || threshold >= 1.0 {
            return Err(AppError::Policy(format!(
                "similarityThreshold {} must be strictly between 0 and 1",
                threshold
            )));
        }

        if !(MIN_TREND_WINDOW..=MAX_TREND_WINDOW).contains(&settings.trend_window) {
            return Err(AppError::Policy(format!(
                "trendWindow {} is out of allowed range ({}..={})",
                settings.trend_window, MIN_TREND_WINDOW, MAX_TREND_WINDOW
            )));
        }

        let period = settings.evaluation_period.trim();
        if period.is_empty() {
            return Err(AppError::Policy("evaluationPeriod cannot be empty".to_string()));
        }
        if period.chars().count() > MAX_EVALUATION_PERIOD_LEN {
            return Err(AppError::Policy(format!(
                "evaluationPeriod exceeds {} characters",
                MAX_EVALUATION_PERIOD_LEN
            )));
        }

        Ok(())
    }

    /// Resolves the adjustment type (kind or label) and checks the score
    /// against its bounds. Out-of-range scores are rejected, never clamped.
    pub fn validate_adjustment(&self, adjustment_type: &str, score: f64, reason: Option<&str>) -> AppResult<&AdjustmentRule> {
        let needle = crate::schema::fold(adjustment_type);
        let rule = self
            .adjustment_rules
            .iter()
            .find(|rule| {
                crate::schema::fold(&rule.kind) == needle
                    || rule.label.as_deref().map(crate::schema::fold).as_deref() == Some(needle.as_str())
            })
            .ok_or_else(|| AppError::Policy(format!("Unknown adjustment type '{}'", adjustment_type)))?;

        if !score.is_finite() || !rule.contains(score) {
            return Err(AppError::Policy(format!(
                "Adjustment score {} is out of allowed range ({}..={}) for '{}'",
                score, rule.min, rule.max, rule.kind
            )));
        }

        if let Some(reason) = reason {
            if reason.chars().count() > MAX_REASON_LEN {
                return Err(AppError::Policy(format!("Adjustment reason exceeds {} characters", MAX_REASON_LEN)));
            }
        }

        Ok(rule)
    }
}
