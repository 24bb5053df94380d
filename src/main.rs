use anyhow::{Context, Result};
use branch_dashboard_lib::models::{ImportOptions, ReconcileStrategy, TransactionMode, Workbook};
use branch_dashboard_lib::{init_tracing, DashboardCore, SchemaRegistry};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;

/// Branch dashboard: spreadsheet import and weighted scoring.
#[derive(Parser, Debug)]
#[command(name = "branch-dashboard")]
#[command(version)]
struct Args {
    /// SQLite database file
    #[arg(long, default_value = "dashboard.sqlite", env = "BRANCH_DASHBOARD_DB")]
    db: PathBuf,

    /// Schema registry YAML; the built-in registry when omitted
    #[arg(long, env = "BRANCH_DASHBOARD_REGISTRY")]
    registry: Option<PathBuf>,

    /// Directory for JSON log files
    #[arg(long, default_value = "logs", env = "BRANCH_DASHBOARD_LOG_DIR")]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Import a workbook exported as JSON
    Import {
        workbook: PathBuf,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,
    },
    /// Recompute one branch, or every branch when none is given
    Recompute { branch: Option<String> },
    /// Show a branch with its scores, adjustments and aggregate
    Show { branch: String },
    /// Aggregates ordered by total score
    Ranking,
    /// Print settings, or deep-merge a JSON patch into them
    Settings {
        #[arg(long)]
        set: Option<String>,
    },
    /// Recent import batches
    History {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    PerRow,
    AllOrNothing,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StrategyArg {
    Upsert,
    InsertOnly,
}

impl From<ModeArg> for TransactionMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::PerRow => Self::PerRow,
            ModeArg::AllOrNothing => Self::AllOrNothing,
        }
    }
}

impl From<StrategyArg> for ReconcileStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Upsert => Self::Upsert,
            StrategyArg::InsertOnly => Self::InsertOnly,
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    if let Err(error) = init_tracing(&args.log_dir) {
        eprintln!("logging disabled: {}", error);
    }

    let registry = match &args.registry {
        Some(path) => SchemaRegistry::load(path).with_context(|| format!("loading registry {}", path.display()))?,
        None => SchemaRegistry::builtin().context("loading built-in registry")?,
    };
    let core = DashboardCore::new(&args.db, registry).context("opening dashboard")?;

    match args.command {
        Command::Import {
            workbook,
            mode,
            strategy,
        } => {
            let raw = std::fs::read_to_string(&workbook)
                .with_context(|| format!("reading {}", workbook.display()))?;
            let workbook: Workbook = serde_json::from_str(&raw).context("parsing workbook JSON")?;
            let result = core.import_workbook(
                &workbook,
                ImportOptions {
                    mode: mode.map(Into::into),
                    strategy: strategy.map(Into::into),
                },
            )?;
            print_json(&result)
        }
        Command::Recompute { branch: Some(branch) } => print_json(&core.recompute(&branch)?),
        Command::Recompute { branch: None } => print_json(&core.recompute_all()?),
        Command::Show { branch } => {
            let record = core
                .get_branch(&branch)?
                .with_context(|| format!("branch '{}' not found", branch))?;
            print_json(&serde_json::json!({
                "branch": record,
                "dimensionScores": core.list_dimension_scores(&branch)?,
                "adjustments": core.list_adjustments(&branch)?,
                "distributions": core.list_distributions(&branch)?,
                "aggregate": core.get_aggregate(&branch)?,
            }))
        }
        Command::Ranking => print_json(&serde_json::json!({
            "ranking": core.ranking()?,
            "grades": core.grade_distribution()?,
        })),
        Command::Settings { set: Some(patch) } => {
            let patch: serde_json::Value = serde_json::from_str(&patch).context("parsing settings patch")?;
            print_json(&core.update_settings(patch)?)
        }
        Command::Settings { set: None } => print_json(&core.get_settings()?),
        Command::History { limit } => print_json(&core.list_import_batches(limit)?),
    }
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
