//! Curtailment Pipeline
//!
//! Thin command-line front end over the pipeline library:
//! - `ingest` fetches, filters and stores dates, then derives aggregates and yields
//! - `aggregate` and `yields` rerun a single derivation stage
//! - `reconcile` scans a day, month or year and repairs drift
//! - `difficulty` maintains the date-scoped difficulty parameter
//!
//! Exits 0 when every scope touched is consistent, 2 when one is not, and
//! 3 when `difficulty show` finds no value.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use curtailment_pipeline::config::AppConfig;
use curtailment_pipeline::database::{create_pool, run_migrations};
use curtailment_pipeline::error::{AppError, AppResult, PipelineError};
use curtailment_pipeline::models::{Scope, YearMonth, PERIODS_PER_DAY};
use curtailment_pipeline::registry::RegistryLoader;
use curtailment_pipeline::repositories::{DifficultyRepository, SettlementRepository, YieldRepository};
use curtailment_pipeline::services::{AuditTrailService, Verdict, YieldCalculator, YieldService};
use curtailment_pipeline::upstream::{CancelToken, ElexonClient, RateLimitedFetcher};
use curtailment_pipeline::PipelineContext;
use tracing::{error, info, warn};

/// Exit status for a scope that did not reach Consistent
const EXIT_DRIFTED: i32 = 2;
/// Exit status for `difficulty show` on a date with no value
const EXIT_NO_DIFFICULTY: i32 = 3;

#[derive(Parser)]
#[command(name = "curtailment-pipeline", version)]
#[command(about = "Ingest and reconcile wind curtailment settlement data")]
struct Cli {
    /// Abandon in-flight upstream requests after this many seconds
    #[arg(long, global = true)]
    deadline_secs: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one date or an inclusive date range
    Ingest {
        #[arg(long)]
        date: NaiveDate,

        /// Last date of the range (defaults to --date)
        #[arg(long)]
        end_date: Option<NaiveDate>,

        #[arg(long, default_value_t = 1)]
        from_period: i32,

        #[arg(long, default_value_t = PERIODS_PER_DAY)]
        to_period: i32,

        /// Run reconciliation repair for each date afterwards
        #[arg(long)]
        repair: bool,
    },
    /// Recompute the aggregate of a scope and its parents
    Aggregate {
        #[command(subcommand)]
        scope: ScopeArg,
    },
    /// Derive yields for one date or a range
    Yields {
        #[arg(long)]
        date: NaiveDate,

        #[arg(long)]
        end_date: Option<NaiveDate>,

        /// Only compute yields that are not stored yet
        #[arg(long)]
        missing_only: bool,
    },
    /// Scan a scope and repair any drift
    Reconcile {
        #[command(subcommand)]
        scope: ScopeArg,

        /// Re-fetch ingested periods and flag the ones upstream has changed
        #[arg(long)]
        verify_upstream: bool,

        /// Report drift without repairing it
        #[arg(long)]
        scan_only: bool,
    },
    /// Manage the difficulty parameter
    Difficulty {
        #[command(subcommand)]
        action: DifficultyAction,
    },
}

#[derive(Subcommand, Clone)]
enum ScopeArg {
    Day { date: NaiveDate },
    Month { month: YearMonth },
    Year { year: i32 },
}

impl ScopeArg {
    fn scope(&self) -> Scope {
        match self {
            ScopeArg::Day { date } => Scope::Day(*date),
            ScopeArg::Month { month } => Scope::Month(*month),
            ScopeArg::Year { year } => Scope::Year(*year),
        }
    }
}

#[derive(Subcommand)]
enum DifficultyAction {
    Set {
        #[arg(long)]
        date: NaiveDate,
        #[arg(long)]
        value: f64,
    },
    Show {
        #[arg(long)]
        date: NaiveDate,
    },
}

fn date_range(start: NaiveDate, end: Option<NaiveDate>) -> AppResult<Vec<NaiveDate>> {
    let end = end.unwrap_or(start);
    if end < start {
        return Err(AppError::Config(format!(
            "End date {} is before start date {}",
            end, start
        )));
    }
    Ok(start.iter_days().take_while(|d| *d <= end).collect())
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("curtailment_pipeline={},sqlx=warn", config.log_level).into()
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    // Load environment variables first
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        AppError::Config(e)
    })?;
    init_tracing(&config);
    info!(
        environment = %config.environment,
        production = config.is_production(),
        "Curtailment pipeline starting"
    );

    let pool = create_pool(&config.database).await.map_err(|e| {
        error!("Failed to create database pool: {}", e);
        AppError::Database(e)
    })?;
    run_migrations(&pool).await.map_err(|e| {
        error!("Database migration failed: {}", e);
        AppError::Database(e)
    })?;

    // Difficulty maintenance needs neither the registry nor the upstream API
    if let Command::Difficulty { action } = &cli.command {
        let difficulty_repo = Arc::new(DifficultyRepository::new(pool.clone()));
        match action {
            DifficultyAction::Set { date, value } => {
                let yields = YieldService::new(
                    YieldCalculator::new(config.pipeline.block_reward),
                    config.pipeline.profiles.clone(),
                    config.pipeline.difficulty_fallback,
                    Arc::new(SettlementRepository::new(pool.clone())),
                    Arc::new(YieldRepository::new(pool)),
                    difficulty_repo,
                );
                let (entry, summary) = yields.apply_difficulty(*date, *value).await?;
                println!(
                    "{} difficulty {}: {} yields restated",
                    entry.difficulty_date, entry.difficulty, summary.written
                );
            }
            DifficultyAction::Show { date } => match difficulty_repo.get(*date).await? {
                Some(entry) => println!("{} {}", entry.difficulty_date, entry.difficulty),
                None => {
                    warn!(%date, "No difficulty recorded");
                    std::process::exit(EXIT_NO_DIFFICULTY);
                }
            },
        }
        return Ok(());
    }

    if let Command::Reconcile {
        verify_upstream: true,
        ..
    } = &cli.command
    {
        config.pipeline.verify_upstream = true;
    }

    let registry = RegistryLoader::from_path(&config.pipeline.registry_path)?;
    let client = ElexonClient::new(&config.upstream)?;
    let fetcher = Arc::new(RateLimitedFetcher::from_config(
        Arc::new(client),
        &config.upstream,
    ));
    let mut ctx = PipelineContext::new(pool, registry, fetcher, &config.pipeline);
    if let Some(dir) = &config.pipeline.audit_log_dir {
        ctx = ctx.with_audit_trail(AuditTrailService::new(dir.clone())?);
    }

    let cancel = cli
        .deadline_secs
        .map(|secs| CancelToken::with_deadline(Duration::from_secs(secs)))
        .unwrap_or_default();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let consistent = match cli.command {
        Command::Ingest {
            date,
            end_date,
            from_period,
            to_period,
            repair,
        } => {
            if !(1 <= from_period && from_period <= to_period && to_period <= PERIODS_PER_DAY) {
                return Err(AppError::Config(format!(
                    "Invalid period range {}..={}",
                    from_period, to_period
                )));
            }
            let periods: Vec<i32> = (from_period..=to_period).collect();
            let mut all_consistent = true;

            for date in date_range(date, end_date)? {
                let run = ctx.run_date(date, &periods, &cancel).await?;
                println!(
                    "{} ingested: {} periods, {} records, {} failed periods",
                    date,
                    run.ingestion.written.len(),
                    run.ingestion.record_count(),
                    run.ingestion.failed.len()
                );

                let verdict = if repair {
                    let report = ctx.reconcile(Scope::Day(date), &cancel).await?;
                    report.verdict
                } else {
                    ctx.auditor.scan(Scope::Day(date), &cancel).await?.verdict()
                };
                println!("{} {:?}", date, verdict);
                all_consistent &= verdict == Verdict::Consistent;
            }
            all_consistent
        }
        Command::Aggregate { scope } => {
            let recomputed = match scope.scope() {
                Scope::Day(date) => ctx.aggregation.recompute_cascade(&[date], &[], &[]).await?,
                Scope::Month(month) => ctx.aggregation.recompute_cascade(&[], &[month], &[]).await?,
                Scope::Year(year) => ctx.aggregation.recompute_cascade(&[], &[], &[year]).await?,
            };
            for aggregate in &recomputed {
                println!(
                    "{} {}: energy {:.3} MWh, payment {:.2}, records {}",
                    aggregate.scope.kind(),
                    aggregate.scope,
                    aggregate.total_energy,
                    aggregate.total_payment,
                    aggregate.record_count
                );
                if let Some(audit) = &ctx.audit_trail {
                    audit.log_aggregate(aggregate).await?;
                }
            }
            true
        }
        Command::Yields {
            date,
            end_date,
            missing_only,
        } => {
            let mut complete = true;
            for date in date_range(date, end_date)? {
                let result = if missing_only {
                    ctx.yields.fill_missing(date).await
                } else {
                    ctx.yields.process_date(date).await
                };
                match result {
                    Ok(summary) => println!(
                        "{} yields: {} written for {} records x {} models",
                        date, summary.written, summary.records, summary.profiles
                    ),
                    Err(e @ PipelineError::MissingParameter { .. }) => {
                        warn!(%date, error = %e, "Yields not derived");
                        complete = false;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            complete
        }
        Command::Reconcile {
            scope, scan_only, ..
        } => {
            let scope = scope.scope();
            if scan_only {
                let scan = ctx.auditor.scan(scope, &cancel).await?;
                for gap in &scan.gaps {
                    println!("{}", serde_json::to_string(gap)?);
                }
                println!("{} {:?}", scope, scan.verdict());
                scan.is_consistent()
            } else {
                let report = ctx.reconcile(scope, &cancel).await?;
                println!(
                    "{} {:?} after {} cycles: records {} -> {}, yields {}/{} -> {}/{}",
                    scope,
                    report.verdict,
                    report.cycles,
                    report.before.record_count,
                    report.after.record_count,
                    report.before.yield_count,
                    report.before.expected_yield_count,
                    report.after.yield_count,
                    report.after.expected_yield_count
                );
                for gap in &report.after.gaps {
                    println!("{}", serde_json::to_string(gap)?);
                }
                report.verdict == Verdict::Consistent
            }
        }
        Command::Difficulty { .. } => true,
    };

    if !consistent {
        std::process::exit(EXIT_DRIFTED);
    }
    Ok(())
}
