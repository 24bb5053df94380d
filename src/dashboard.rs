use crate::db::{queries, Database};
use crate::errors::{AppError, AppResult};
use crate::import::Importer;
use crate::models::{
    AggregateRecord, BranchRecord, DashboardSettings, DimensionScore, Grade, GradeCount, ImportBatchRecord, ImportOptions,
    ImportResult, ManagementAdjustment, SaveAdjustmentPayload, UpdateAdjustmentPayload, Workbook,
};
use crate::policy::PolicyEngine;
use crate::schema::{SchemaRegistry, DISTRIBUTION_TABLE};
use crate::scoring::triggers::{MutationEvent, Triggers};
use crate::scoring::ScoringEngine;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Entry point for the CLI and any other front end. Owns the store, the
/// registry and the wiring between writes and aggregate recomputation.
#[derive(Debug)]
pub struct DashboardCore {
    db: Arc<Database>,
    registry: Arc<SchemaRegistry>,
    policy: PolicyEngine,
    engine: Arc<ScoringEngine>,
    triggers: Triggers,
    importer: Importer,
}

impl DashboardCore {
    pub fn new(db_path: &Path, registry: SchemaRegistry) -> AppResult<Arc<Self>> {
        let registry = Arc::new(registry);
        let db = Arc::new(Database::new(db_path, &registry)?);
        let engine = Arc::new(ScoringEngine::new(registry.clone()));

        let mut triggers = Triggers::new();
        triggers.register(engine.clone());

        let settings = db.get_settings()?;
        let policy = PolicyEngine::new(&registry);
        if let Err(error) = policy.validate_settings(&settings) {
            tracing::warn!(error = %error, "stored settings are out of bounds");
        }

        tracing::info!(db = %db.db_path().display(), tables = registry.tables.len(), "dashboard opened");

        Ok(Arc::new(Self {
            importer: Importer::new(registry.clone(), triggers.clone()),
            db,
            registry,
            policy,
            engine,
            triggers,
        }))
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn import_workbook(&self, workbook: &Workbook, options: ImportOptions) -> AppResult<ImportResult> {
        self.importer.import(&self.db, workbook, options)
    }

    pub fn recompute(&self, branch_code: &str) -> AppResult<AggregateRecord> {
        self.db.with_transaction(|tx| self.engine.recompute(tx, branch_code))
    }

    pub fn recompute_all(&self) -> AppResult<Vec<AggregateRecord>> {
        self.db.with_transaction(|tx| {
            let mut records = Vec::new();
            for code in queries::list_branch_codes(tx)? {
                records.push(self.engine.recompute(tx, &code)?);
            }
            Ok(records)
        })
    }

    pub fn create_adjustment(&self, payload: SaveAdjustmentPayload) -> AppResult<ManagementAdjustment> {
        let rule = self
            .policy
            .validate_adjustment(&payload.adjustment_type, payload.score, payload.reason.as_deref())?;
        let adjustment = ManagementAdjustment {
            id: Uuid::new_v4().to_string(),
            branch_code: payload.branch_code,
            adjustment_type: rule.kind.clone(),
            score: payload.score,
            reason: normalize_text(payload.reason),
            evaluator: normalize_text(payload.evaluator),
            adjusted_on: payload.adjusted_on,
            active: payload.active.unwrap_or(true),
        };

        self.db.with_transaction(|tx| {
            if !queries::branch_exists(tx, &adjustment.branch_code)? {
                return Err(AppError::NotFound(format!("branch '{}' not found", adjustment.branch_code)));
            }
            queries::insert_adjustment(tx, &adjustment)?;
            self.triggers
                .emit(tx, &MutationEvent::AdjustmentChanged(adjustment.branch_code.clone()))
        })?;

        tracing::info!(id = %adjustment.id, branch = %adjustment.branch_code, score = adjustment.score, "adjustment created");
        Ok(adjustment)
    }

    pub fn update_adjustment(&self, id: &str, payload: UpdateAdjustmentPayload) -> AppResult<ManagementAdjustment> {
        self.db.with_transaction(|tx| {
            let mut adjustment = queries::load_adjustment(tx, id)?
                .ok_or_else(|| AppError::NotFound(format!("adjustment '{}' not found", id)))?;

            if let Some(adjustment_type) = payload.adjustment_type {
                adjustment.adjustment_type = adjustment_type;
            }
            if let Some(score) = payload.score {
                adjustment.score = score;
            }
            if payload.reason.is_some() {
                adjustment.reason = normalize_text(payload.reason);
            }
            if payload.evaluator.is_some() {
                adjustment.evaluator = normalize_text(payload.evaluator);
            }
            if payload.adjusted_on.is_some() {
                adjustment.adjusted_on = payload.adjusted_on;
            }
            if let Some(active) = payload.active {
                adjustment.active = active;
            }

            let rule = self.policy.validate_adjustment(
                &adjustment.adjustment_type,
                adjustment.score,
                adjustment.reason.as_deref(),
            )?;
            adjustment.adjustment_type = rule.kind.clone();

            queries::update_adjustment(tx, &adjustment)?;
            self.triggers
                .emit(tx, &MutationEvent::AdjustmentChanged(adjustment.branch_code.clone()))?;
            tracing::info!(id = %adjustment.id, branch = %adjustment.branch_code, "adjustment updated");
            Ok(adjustment)
        })
    }

    /// Returns false when no adjustment has that id.
    pub fn delete_adjustment(&self, id: &str) -> AppResult<bool> {
        self.db.with_transaction(|tx| {
            let Some(adjustment) = queries::load_adjustment(tx, id)? else {
                return Ok(false);
            };
            queries::delete_adjustment(tx, id)?;
            self.triggers
                .emit(tx, &MutationEvent::AdjustmentChanged(adjustment.branch_code.clone()))?;
            tracing::info!(id = %id, branch = %adjustment.branch_code, "adjustment deleted");
            Ok(true)
        })
    }

    pub fn list_adjustments(&self, branch_code: &str) -> AppResult<Vec<ManagementAdjustment>> {
        self.db.with_conn(|conn| Ok(queries::list_adjustments(conn, branch_code)?))
    }

    pub fn get_branch(&self, branch_code: &str) -> AppResult<Option<BranchRecord>> {
        self.db.with_conn(|conn| Ok(queries::load_branch(conn, branch_code)?))
    }

    pub fn list_branches(&self) -> AppResult<Vec<BranchRecord>> {
        self.db.with_conn(|conn| Ok(queries::list_branches(conn)?))
    }

    /// Child rows, the aggregate and its history go with the branch.
    pub fn delete_branch(&self, branch_code: &str) -> AppResult<bool> {
        let deleted = self
            .db
            .with_transaction(|tx| Ok(queries::delete_branch(tx, branch_code)?))?;
        if deleted {
            tracing::info!(branch = %branch_code, "branch deleted");
        }
        Ok(deleted)
    }

    pub fn list_dimension_scores(&self, branch_code: &str) -> AppResult<Vec<DimensionScore>> {
        self.db
            .with_conn(|conn| Ok(queries::load_dimension_scores(conn, branch_code)?))
    }

    pub fn list_distributions(&self, branch_code: &str) -> AppResult<Vec<BTreeMap<String, serde_json::Value>>> {
        if self.registry.table(DISTRIBUTION_TABLE).is_none() {
            return Ok(Vec::new());
        }
        self.db
            .with_conn(|conn| Ok(queries::list_child_rows(conn, DISTRIBUTION_TABLE, branch_code)?))
    }

    /// The stored aggregate; never recomputes.
    pub fn get_aggregate(&self, branch_code: &str) -> AppResult<Option<AggregateRecord>> {
        self.db.with_conn(|conn| Ok(queries::read_aggregate(conn, branch_code)?))
    }

    /// Highest total first; equal totals by branch name.
    pub fn ranking(&self) -> AppResult<Vec<AggregateRecord>> {
        self.db.with_conn(|conn| Ok(queries::list_aggregates(conn)?))
    }

    pub fn grade_distribution(&self) -> AppResult<Vec<GradeCount>> {
        let aggregates = self.ranking()?;
        Ok(Grade::ALL
            .into_iter()
            .map(|grade| GradeCount {
                grade,
                count: aggregates.iter().filter(|record| record.grade == grade).count(),
            })
            .collect())
    }

    pub fn get_settings(&self) -> AppResult<DashboardSettings> {
        self.db.get_settings()
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<DashboardSettings> {
        let updated = self
            .db
            .update_settings(update, |settings| self.policy.validate_settings(settings))?;
        tracing::info!(
            period = %updated.evaluation_period,
            threshold = updated.similarity_threshold,
            mode = updated.default_transaction_mode.as_str(),
            "settings updated"
        );
        Ok(updated)
    }

    pub fn list_import_batches(&self, limit: u32) -> AppResult<Vec<ImportBatchRecord>> {
        self.db.list_import_batches(limit)
    }
}

fn normalize_text(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::DashboardCore;
    use crate::models::{Grade, SaveAdjustmentPayload};
    use crate::schema::SchemaRegistry;

    fn payload(branch_code: &str, score: f64) -> SaveAdjustmentPayload {
        SaveAdjustmentPayload {
            branch_code: branch_code.to_string(),
            adjustment_type: "honor".to_string(),
            score,
            reason: Some("  ".to_string()),
            evaluator: None,
            adjusted_on: None,
            active: None,
        }
    }

    #[test]
    fn adjustment_for_unknown_branch_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = DashboardCore::new(&dir.path().join("test.db"), SchemaRegistry::builtin().expect("registry"))
            .expect("core");
        let error = core.create_adjustment(payload("missing", 1.0)).expect_err("no branch");
        assert!(error.to_string().starts_with("NOT_FOUND"));
        assert!(core.list_adjustments("missing").expect("list").is_empty());
    }

    #[test]
    fn grade_distribution_lists_every_grade() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = DashboardCore::new(&dir.path().join("test.db"), SchemaRegistry::builtin().expect("registry"))
            .expect("core");
        let distribution = core.grade_distribution().expect("distribution");
        assert_eq!(distribution.len(), 5);
        assert_eq!(distribution[0].grade, Grade::APlus);
        assert!(distribution.iter().all(|entry| entry.count == 0));
    }

    #[test]
    fn settings_updates_are_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = DashboardCore::new(&dir.path().join("test.db"), SchemaRegistry::builtin().expect("registry"))
            .expect("core");
        let error = core
            .update_settings(serde_json::json!({ "similarityThreshold": 0.0 }))
            .expect_err("out of range");
        assert!(error.to_string().starts_with("POLICY_DENIED"));
        let updated = core
            .update_settings(serde_json::json!({ "evaluationPeriod": "2024" }))
            .expect("update");
        assert_eq!(updated.evaluation_period, "2024");
    }
}
