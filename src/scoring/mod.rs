//! Weighted composite scoring of a branch and the derived chart projections.
//!
//! An aggregate is a pure function of the branch's dimension scores, its
//! active adjustments, the score history and the registry. It carries no
//! timestamps, so recomputing without intervening writes rewrites identical
//! bytes.

pub mod projection;
pub mod triggers;

use crate::db::queries;
use crate::errors::{AppError, AppResult};
use crate::models::{AggregateRecord, DimensionScore, Grade};
use crate::schema::SchemaRegistry;
use rusqlite::Connection;
use std::sync::Arc;
use tracing::info;
use triggers::{MutationEvent, MutationObserver};

pub const BASE_SCORE_FACTOR: f64 = 0.8;
pub const MANAGEMENT_SCORE_FACTOR: f64 = 2.0;

/// Lower bounds, highest first. Anything below the last bound is a C.
const GRADE_THRESHOLDS: [(f64, Grade); 4] = [(90.0, Grade::APlus), (80.0, Grade::A), (70.0, Grade::BPlus), (60.0, Grade::B)];

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub fn grade(score: f64) -> Grade {
    GRADE_THRESHOLDS
        .iter()
        .find(|(bound, _)| score >= *bound)
        .map(|(_, grade)| *grade)
        .unwrap_or(Grade::C)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub base_score: f64,
    pub base_grade: Grade,
    pub management_score: f64,
    pub total_score: f64,
    pub grade: Grade,
}

/// Sums weighted dimension scores in declared dimension order; scores for
/// dimensions the registry no longer declares are ignored.
pub fn compute_scores(
    dimensions: &[DimensionScore],
    adjustment_scores: &[f64],
    registry: &SchemaRegistry,
) -> ScoreBreakdown {
    let weighted_sum: f64 = registry
        .dimensions
        .iter()
        .filter_map(|def| dimensions.iter().find(|score| score.dimension == def.key))
        .map(|score| score.weighted_score)
        .sum();
    let base_score = round1(weighted_sum);
    let management_score = round1(adjustment_scores.iter().sum());
    let total_score = round1(base_score * BASE_SCORE_FACTOR + management_score * MANAGEMENT_SCORE_FACTOR);

    ScoreBreakdown {
        base_score,
        base_grade: grade(base_score),
        management_score,
        total_score,
        grade: grade(total_score),
    }
}

#[derive(Debug, Clone)]
pub struct ScoringEngine {
    registry: Arc<SchemaRegistry>,
}

impl ScoringEngine {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Recomputes and overwrites the aggregate of `branch_code`. Callers wrap
    /// this in a transaction so history and aggregate land together.
    pub fn recompute(&self, conn: &Connection, branch_code: &str) -> AppResult<AggregateRecord> {
        let branch = queries::load_branch(conn, branch_code)?
            .ok_or_else(|| AppError::NotFound(format!("branch '{}' not found", branch_code)))?;
        let dimensions = queries::load_dimension_scores(conn, branch_code)?;
        let adjustments = queries::load_active_adjustment_scores(conn, branch_code)?;
        let scores = compute_scores(&dimensions, &adjustments, &self.registry);

        let settings = queries::load_settings(conn)?;
        queries::upsert_score_history(
            conn,
            branch_code,
            settings.evaluation_period.trim(),
            scores.base_score,
            scores.management_score,
            scores.total_score,
        )?;
        let history = queries::load_score_history(conn, branch_code, settings.trend_window)?;

        let record = AggregateRecord {
            branch_code: branch.code,
            branch_name: branch.name,
            base_score: scores.base_score,
            base_grade: scores.base_grade,
            management_score: scores.management_score,
            total_score: scores.total_score,
            grade: scores.grade,
            radar: projection::build_radar_projection(&dimensions, scores.management_score, &self.registry),
            trend: projection::build_trend_projection(&history, settings.trend_window),
        };
        queries::write_aggregate(conn, &record)?;

        info!(
            branch = %record.branch_code,
            base_score = record.base_score,
            management_score = record.management_score,
            total_score = record.total_score,
            grade = record.grade.as_str(),
            "recomputed aggregate"
        );
        Ok(record)
    }
}

impl MutationObserver for ScoringEngine {
    fn on_mutation(&self, conn: &Connection, event: &MutationEvent) -> AppResult<()> {
        self.recompute(conn, event.branch_code()).map(|_| ())
    }
}
