//! Workbook import: header resolution, coercion, enrichment, parent lookup
//! and reconciliation, under one of two transaction modes.

pub mod coerce;
pub mod enrich;
pub mod reconcile;
pub mod report;
pub mod resolver;
pub mod xref;

use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{
    CellValue, ColumnMapping, FieldValue, ImportBatchRecord, ImportIssue, ImportOptions, ImportResult, IssueKind,
    ReconcileStrategy, SheetSummary, TransactionMode, Workbook, Worksheet,
};
use crate::schema::{Field, SchemaRegistry, Table, ADJUSTMENT_TABLE, BRANCH_REFERENCE_COLUMN, DIMENSION_TABLE};
use crate::scoring::triggers::{MutationEvent, Triggers};
use chrono::Utc;
use enrich::EnricherSet;
use reconcile::{reconcile, RowFailure, RowOutcome};
use report::IssueLog;
use resolver::FieldResolver;
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use xref::NameIndex;

/// Coerced values of one row, in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedRow {
    values: Vec<(String, FieldValue)>,
}

impl MappedRow {
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }

    pub fn set(&mut self, field: &str, value: FieldValue) {
        match self.values.iter_mut().find(|(name, _)| name == field) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((field.to_string(), value)),
        }
    }

    pub fn values(&self) -> &[(String, FieldValue)] {
        &self.values
    }
}

/// A sheet matched to a table, with its header columns resolved.
#[derive(Debug)]
struct SheetPlan<'a> {
    sheet: &'a Worksheet,
    table: &'a Table,
    columns: Vec<(usize, Field)>,
    mappings: Vec<ColumnMapping>,
    missing_required: Vec<String>,
}

#[derive(Debug)]
struct Applied {
    outcome: RowOutcome,
    id: String,
    event: Option<MutationEvent>,
}

#[derive(Debug)]
enum RowError {
    Issue(ImportIssue),
    Fatal(AppError),
}

/// Counters and bounded issue logs for one import call.
#[derive(Debug)]
struct ImportState {
    errors: IssueLog,
    warnings: IssueLog,
    sheets: Vec<SheetSummary>,
    affected: BTreeMap<String, MutationEvent>,
}

impl ImportState {
    fn new(max_reported: usize) -> Self {
        Self {
            errors: IssueLog::new(Some(max_reported)),
            warnings: IssueLog::new(Some(max_reported)),
            sheets: Vec::new(),
            affected: BTreeMap::new(),
        }
    }

    fn begin_sheet(&mut self, plan: &SheetPlan<'_>) -> usize {
        self.sheets.push(SheetSummary {
            sheet: plan.sheet.name.clone(),
            table: Some(plan.table.name.clone()),
            columns: plan.mappings.clone(),
            ..SheetSummary::default()
        });
        self.sheets.len() - 1
    }

    fn applied(&mut self, sheet: usize, row_index: usize, applied: Applied) {
        let summary = &mut self.sheets[sheet];
        match applied.outcome {
            RowOutcome::Inserted => summary.inserted += 1,
            RowOutcome::Updated => summary.updated += 1,
        }
        debug!(sheet = %summary.sheet, row = row_index, id = %applied.id, outcome = ?applied.outcome, "row reconciled");
        if let Some(event) = applied.event {
            self.affected.entry(event.branch_code().to_string()).or_insert(event);
        }
    }

    fn failed(&mut self, sheet: usize, issue: ImportIssue) {
        let summary = &mut self.sheets[sheet];
        summary.skipped += 1;
        summary.errors += 1;
        warn!(
            sheet = %issue.sheet,
            row = issue.row_index,
            kind = ?issue.kind,
            message = %issue.message,
            "row rejected"
        );
        self.errors.push(issue);
    }

    fn missing_columns(&mut self, sheet: usize, plan: &SheetPlan<'_>) {
        for field in &plan.missing_required {
            self.errors.push(ImportIssue {
                sheet: plan.sheet.name.clone(),
                row_index: 0,
                column: Some(field.clone()),
                kind: IssueKind::ValidationFailure,
                message: format!("Required column '{}' is missing", field),
            });
        }
        let summary = &mut self.sheets[sheet];
        summary.errors += plan.missing_required.len();
        summary.skipped += data_rows(plan.sheet);
        warn!(sheet = %plan.sheet.name, missing = ?plan.missing_required, "sheet skipped");
    }

    fn discard_writes(&mut self) {
        for summary in &mut self.sheets {
            summary.inserted = 0;
            summary.updated = 0;
        }
        self.affected.clear();
    }
}

/// Drives a workbook through resolution, coercion, enrichment, parent lookup
/// and reconciliation, then notifies observers of the affected branches.
#[derive(Debug, Clone)]
pub struct Importer {
    registry: Arc<SchemaRegistry>,
    enrichers: EnricherSet,
    triggers: Triggers,
}

impl Importer {
    pub fn new(registry: Arc<SchemaRegistry>, triggers: Triggers) -> Self {
        let enrichers = EnricherSet::builtin(&registry);
        Self {
            registry,
            enrichers,
            triggers,
        }
    }

    pub fn with_enrichers(mut self, enrichers: EnricherSet) -> Self {
        self.enrichers = enrichers;
        self
    }

    pub fn import(&self, db: &Database, workbook: &Workbook, options: ImportOptions) -> AppResult<ImportResult> {
        let settings = db.get_settings()?;
        let mode = options.mode.unwrap_or(settings.default_transaction_mode);
        let strategy = options.strategy.unwrap_or(settings.default_strategy);
        let resolver = FieldResolver::new(settings.similarity_threshold);
        let batch_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();

        info!(batch_id = %batch_id, mode = mode.as_str(), strategy = strategy.as_str(), sheets = workbook.sheets.len(), "import started");

        let mut state = ImportState::new(settings.max_reported_errors);
        let mut plans = Vec::new();
        let mut unmatched = Vec::new();
        for sheet in &workbook.sheets {
            match self.registry.table_for_sheet(&sheet.name) {
                Some(table) => plans.push(self.plan_sheet(sheet, table, &resolver, &mut state.warnings)),
                None => unmatched.push(sheet),
            }
        }
        plans.sort_by_key(|plan| self.registry.table_position(&plan.table.name).unwrap_or(usize::MAX));

        let rolled_back = match mode {
            TransactionMode::PerRow => {
                self.run_per_row(db, &plans, strategy, &mut state)?;
                false
            }
            TransactionMode::AllOrNothing => self.run_all_or_nothing(db, &plans, strategy, &mut state)?,
        };

        for sheet in unmatched {
            warn!(sheet = %sheet.name, "no table matches sheet");
            state.warnings.push(ImportIssue {
                sheet: sheet.name.clone(),
                row_index: 0,
                column: None,
                kind: IssueKind::FieldResolutionMiss,
                message: format!("No table matches sheet '{}'; sheet ignored", sheet.name),
            });
            state.sheets.push(SheetSummary {
                sheet: sheet.name.clone(),
                table: None,
                skipped: data_rows(sheet),
                ..SheetSummary::default()
            });
        }

        let result = finish(batch_id, rolled_back, state);
        let finished_at = Utc::now();
        db.record_import_batch(
            &ImportBatchRecord {
                id: result.batch_id.clone(),
                started_at,
                finished_at,
                mode,
                strategy,
                success: result.success,
                rolled_back: result.rolled_back,
                inserted: result.inserted,
                updated: result.updated,
                skipped: result.skipped,
                error_count: result.total_errors,
            },
            &serde_json::to_value(&result)?,
        )?;

        info!(
            batch_id = %result.batch_id,
            success = result.success,
            rolled_back = result.rolled_back,
            inserted = result.inserted,
            updated = result.updated,
            skipped = result.skipped,
            errors = result.total_errors,
            warnings = result.total_warnings,
            "import finished"
        );
        Ok(result)
    }

    /// Each row commits alone; observers run per affected branch once every
    /// sheet is done.
    fn run_per_row(
        &self,
        db: &Database,
        plans: &[SheetPlan<'_>],
        strategy: ReconcileStrategy,
        state: &mut ImportState,
    ) -> AppResult<()> {
        for plan in plans {
            let sheet = state.begin_sheet(plan);
            if !plan.missing_required.is_empty() {
                state.missing_columns(sheet, plan);
                continue;
            }

            let indexes = {
                let conn = db.lock()?;
                self.load_indexes(&conn, plan)?
            };

            for (row_index, cells) in plan.sheet.rows.iter().enumerate().skip(1) {
                let mut conn = db.lock()?;
                let tx = conn.transaction()?;
                match self.apply_row(&tx, plan, &indexes, row_index, cells, strategy, &mut state.warnings) {
                    Ok(Some(applied)) => {
                        tx.commit()?;
                        state.applied(sheet, row_index, applied);
                    }
                    Ok(None) => {}
                    Err(RowError::Issue(issue)) => {
                        drop(tx);
                        state.failed(sheet, issue);
                    }
                    Err(RowError::Fatal(error)) => return Err(error),
                }
            }
        }

        for event in state.affected.values() {
            let mut conn = db.lock()?;
            let tx = conn.transaction()?;
            self.triggers.emit(&tx, event)?;
            tx.commit()?;
        }
        Ok(())
    }

    /// One transaction for every sheet and the observers. Returns whether the
    /// batch was rolled back.
    fn run_all_or_nothing(
        &self,
        db: &Database,
        plans: &[SheetPlan<'_>],
        strategy: ReconcileStrategy,
        state: &mut ImportState,
    ) -> AppResult<bool> {
        let mut conn = db.lock()?;
        let tx = conn.transaction()?;

        'sheets: for plan in plans {
            let sheet = state.begin_sheet(plan);
            if !plan.missing_required.is_empty() {
                state.missing_columns(sheet, plan);
                break 'sheets;
            }

            let indexes = self.load_indexes(&tx, plan)?;
            for (row_index, cells) in plan.sheet.rows.iter().enumerate().skip(1) {
                match self.apply_row(&tx, plan, &indexes, row_index, cells, strategy, &mut state.warnings) {
                    Ok(Some(applied)) => state.applied(sheet, row_index, applied),
                    Ok(None) => {}
                    Err(RowError::Issue(issue)) => {
                        state.failed(sheet, issue);
                        break 'sheets;
                    }
                    Err(RowError::Fatal(error)) => return Err(error),
                }
            }
        }

        if !state.errors.is_empty() {
            drop(tx);
            state.discard_writes();
            warn!("import rolled back");
            return Ok(true);
        }

        for event in state.affected.values() {
            self.triggers.emit(&tx, event)?;
        }
        tx.commit()?;
        Ok(false)
    }

    fn plan_sheet<'a>(
        &self,
        sheet: &'a Worksheet,
        table: &'a Table,
        resolver: &FieldResolver,
        warnings: &mut IssueLog,
    ) -> SheetPlan<'a> {
        let candidates = table.mappable_fields();
        let mut columns: Vec<(usize, Field)> = Vec::new();
        let mut mappings = Vec::new();
        let header = sheet.rows.first().map(Vec::as_slice).unwrap_or(&[]);

        for (index, cell) in header.iter().enumerate() {
            let text = cell.header_text();
            if text.is_empty() {
                continue;
            }
            let Some(resolution) = resolver.resolve_detailed(&text, &candidates) else {
                warn!(sheet = %sheet.name, header = %text, "column dropped");
                warnings.push(ImportIssue {
                    sheet: sheet.name.clone(),
                    row_index: 0,
                    column: Some(text.clone()),
                    kind: IssueKind::FieldResolutionMiss,
                    message: format!("Header '{}' matches no field of '{}'", text, table.name),
                });
                continue;
            };

            if columns.iter().any(|(_, field)| field.name == resolution.field.name) {
                warn!(sheet = %sheet.name, header = %text, field = %resolution.field.name, "duplicate column dropped");
                warnings.push(ImportIssue {
                    sheet: sheet.name.clone(),
                    row_index: 0,
                    column: Some(text.clone()),
                    kind: IssueKind::FieldResolutionMiss,
                    message: format!(
                        "Header '{}' maps to '{}', already taken by an earlier column",
                        text, resolution.field.name
                    ),
                });
                continue;
            }

            mappings.push(ColumnMapping {
                header: text,
                field: resolution.field.name.clone(),
                exact: resolution.exact,
            });
            columns.push((index, resolution.field.clone()));
        }

        let missing_required = candidates
            .iter()
            .filter(|field| field.required && !columns.iter().any(|(_, mapped)| mapped.name == field.name))
            .map(|field| field.name.clone())
            .collect();

        SheetPlan {
            sheet,
            table,
            columns,
            mappings,
            missing_required,
        }
    }

    /// Name indexes of every parent table the sheet references, read through
    /// `conn` so parents written earlier in the same transaction are visible.
    fn load_indexes(&self, conn: &Connection, plan: &SheetPlan<'_>) -> AppResult<HashMap<String, NameIndex>> {
        let mut indexes = HashMap::new();
        for (_, field) in &plan.columns {
            let Some(parent_name) = field.references.as_deref() else {
                continue;
            };
            if indexes.contains_key(parent_name) {
                continue;
            }
            let parent = self
                .registry
                .table(parent_name)
                .ok_or_else(|| AppError::Config(format!("unknown referenced table '{}'", parent_name)))?;
            let key = parent
                .primary_key()
                .ok_or_else(|| AppError::Config(format!("table '{}' has no primary key", parent.name)))?;
            let name_column = parent
                .natural_key
                .first()
                .ok_or_else(|| AppError::Config(format!("table '{}' has no natural key", parent.name)))?;
            let index = NameIndex::load(conn, &parent.name, name_column, &key.name)?;
            debug!(table = %parent.name, names = index.len(), "name index loaded");
            indexes.insert(parent_name.to_string(), index);
        }
        Ok(indexes)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_row(
        &self,
        conn: &Connection,
        plan: &SheetPlan<'_>,
        indexes: &HashMap<String, NameIndex>,
        row_index: usize,
        cells: &[CellValue],
        strategy: ReconcileStrategy,
        warnings: &mut IssueLog,
    ) -> Result<Option<Applied>, RowError> {
        if cells.iter().all(CellValue::is_blank) {
            return Ok(None);
        }
        let issue = |column: Option<&str>, kind: IssueKind, message: String| ImportIssue {
            sheet: plan.sheet.name.clone(),
            row_index,
            column: column.map(ToString::to_string),
            kind,
            message,
        };

        let mut row = MappedRow::default();
        for (index, field) in &plan.columns {
            let raw = cells.get(*index).cloned().unwrap_or_default();
            let value = coerce::coerce(&raw, field.field_type);
            if value.is_null() && !raw.is_blank() {
                warnings.push(issue(
                    Some(field.name.as_str()),
                    IssueKind::CoercionFailure,
                    format!("Cannot read '{}' as {:?}; stored empty", raw.header_text(), field.field_type),
                ));
            }
            row.set(&field.name, value);
        }

        for (_, field) in &plan.columns {
            if field.required && row.get(&field.name).map(FieldValue::is_null).unwrap_or(true) {
                return Err(RowError::Issue(issue(
                    Some(field.name.as_str()),
                    IssueKind::ValidationFailure,
                    format!("Required value '{}' is missing", field.name),
                )));
            }
        }

        if let Some(enricher) = self.enrichers.for_table(&plan.table.name) {
            enricher.enrich(&mut row).map_err(|rejection| {
                RowError::Issue(issue(rejection.column.as_deref(), IssueKind::ValidationFailure, rejection.message))
            })?;
        }

        for (_, field) in &plan.columns {
            let Some(parent) = field.references.as_deref() else {
                continue;
            };
            let name = match row.get(&field.name) {
                Some(value) if !value.is_null() => value.to_string(),
                _ => continue,
            };
            let key = indexes
                .get(parent)
                .and_then(|index| index.resolve_by_name(&name))
                .ok_or_else(|| {
                    RowError::Issue(issue(
                        Some(field.name.as_str()),
                        IssueKind::EntityResolutionFailure,
                        format!("No '{}' named '{}'", parent, name),
                    ))
                })?
                .to_string();
            row.set(&field.name, FieldValue::Text(key));
        }

        let reconciled = reconcile(&row, plan.table, conn, strategy).map_err(|failure| match failure {
            RowFailure::Row(message) => RowError::Issue(issue(None, IssueKind::ReconciliationFailure, message)),
            RowFailure::Fatal(error) => RowError::Fatal(error),
        })?;

        let branch_code = row
            .get(BRANCH_REFERENCE_COLUMN)
            .and_then(FieldValue::as_text)
            .map(ToString::to_string);
        let event = match (plan.table.name.as_str(), branch_code) {
            (DIMENSION_TABLE, Some(code)) => Some(MutationEvent::DimensionsImported(code)),
            (ADJUSTMENT_TABLE, Some(code)) => Some(MutationEvent::AdjustmentChanged(code)),
            _ => None,
        };

        Ok(Some(Applied {
            outcome: reconciled.outcome,
            id: reconciled.id,
            event,
        }))
    }
}

fn data_rows(sheet: &Worksheet) -> usize {
    sheet
        .rows
        .iter()
        .skip(1)
        .filter(|row| !row.iter().all(CellValue::is_blank))
        .count()
}

fn finish(batch_id: String, rolled_back: bool, state: ImportState) -> ImportResult {
    let inserted = state.sheets.iter().map(|sheet| sheet.inserted).sum();
    let updated = state.sheets.iter().map(|sheet| sheet.updated).sum();
    let skipped = state.sheets.iter().map(|sheet| sheet.skipped).sum();
    let total_errors = state.errors.total();
    let total_warnings = state.warnings.total();

    ImportResult {
        batch_id,
        success: total_errors == 0 && !rolled_back,
        rolled_back,
        inserted,
        updated,
        skipped,
        total_errors,
        total_warnings,
        errors: state.errors.into_entries(),
        warnings: state.warnings.into_entries(),
        sheets: state.sheets,
    }
}
