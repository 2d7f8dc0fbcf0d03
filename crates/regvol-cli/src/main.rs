use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use regvol_storage::SnapshotStore;
use regvol_sync::{connect_store_from_env, BackfillConfig, SnapshotPipeline};
use regvol_web::{AppState, WebConfig};
use tracing::info;

mod progress;

use progress::BarProgress;

#[derive(Debug, Parser)]
#[command(name = "regvol-cli")]
#[command(about = "Quarterly regulatory text volume backfill and read API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, measure and store every (date, agency) unit on the quarterly axis.
    Backfill(BackfillArgs),
    /// Rerun units recorded as dead letters.
    Reprocess(PipelineArgs),
    /// Apply pending schema migrations.
    Migrate,
    /// Serve the summary and agency series endpoints.
    Serve,
    /// Run the backfill on the configured cron schedule until interrupted.
    Schedule(PipelineArgs),
    /// Check stored rows against the aggregation and exclusivity rules.
    Audit,
}

#[derive(Debug, Clone, Default, Args)]
struct PipelineArgs {
    /// Units processed concurrently within one date.
    #[arg(long)]
    concurrency: Option<usize>,
    /// Restrict to agencies by name or short name; repeatable.
    #[arg(long = "agency")]
    agencies: Vec<String>,
    /// Read the agency catalog from a YAML/JSON file instead of the eCFR API.
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Log progress lines instead of drawing a progress bar.
    #[arg(long)]
    no_progress_bar: bool,
}

#[derive(Debug, Clone, Default, Args)]
struct BackfillArgs {
    #[arg(long)]
    min_year: Option<i32>,
    #[arg(long)]
    terminal_year: Option<i32>,
    /// Recompute units that already have stored results.
    #[arg(long)]
    refresh: bool,
    #[command(flatten)]
    pipeline: PipelineArgs,
}

impl PipelineArgs {
    fn apply(&self, config: &mut BackfillConfig) {
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if !self.agencies.is_empty() {
            config.agencies = self.agencies.clone();
        }
        if let Some(catalog) = &self.catalog {
            config.catalog_path = Some(catalog.clone());
        }
    }
}

impl BackfillArgs {
    fn apply(&self, config: &mut BackfillConfig) {
        if let Some(min_year) = self.min_year {
            config.min_year = min_year;
        }
        if let Some(terminal_year) = self.terminal_year {
            config.terminal_year = terminal_year;
        }
        if self.refresh {
            config.skip_completed = false;
        }
        self.pipeline.apply(config);
    }
}

async fn build_pipeline(config: BackfillConfig, args: &PipelineArgs) -> Result<SnapshotPipeline> {
    config.validate()?;
    let store = connect_store_from_env().await?;
    let pipeline = SnapshotPipeline::from_config(config, Arc::new(store))?;
    Ok(if args.no_progress_bar {
        pipeline
    } else {
        pipeline.with_progress(Arc::new(BarProgress::new()?))
    })
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli
        .command
        .unwrap_or_else(|| Commands::Backfill(BackfillArgs::default()))
    {
        Commands::Backfill(args) => {
            let mut config = BackfillConfig::from_env()?;
            args.apply(&mut config);
            let summary = build_pipeline(config, &args.pipeline).await?.run_once().await?;
            println!(
                "backfill complete: run_id={} dates={} agencies={} committed={} dead_lettered={} skipped={}",
                summary.run_id,
                summary.dates,
                summary.agencies,
                summary.committed,
                summary.dead_lettered,
                summary.skipped
            );
            if let Some(dir) = &summary.reports_dir {
                println!("reports: {dir}");
            }
        }
        Commands::Reprocess(args) => {
            let mut config = BackfillConfig::from_env()?;
            args.apply(&mut config);
            let summary = build_pipeline(config, &args)
                .await?
                .reprocess_dead_letters()
                .await?;
            println!(
                "reprocess complete: attempted={} recovered={} still_failing={} unreadable={}",
                summary.attempted, summary.recovered, summary.still_failing, summary.unreadable
            );
        }
        Commands::Migrate => {
            let store = connect_store_from_env().await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let config = WebConfig::from_env()?;
            let store = connect_store_from_env().await?;
            let state = AppState::new(Arc::new(store)).with_series_window(config.series_window);
            regvol_web::serve(&config, state).await?;
        }
        Commands::Schedule(args) => {
            let mut config = BackfillConfig::from_env()?;
            args.apply(&mut config);
            config.scheduler_enabled = true;
            let cron = config.schedule_cron.clone();
            let pipeline = Arc::new(build_pipeline(config, &args).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                anyhow::bail!("scheduler could not be enabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Audit => {
            let store = connect_store_from_env().await?;
            let report = store.audit().await.context("auditing stored rows")?;
            for m in &report.sum_mismatches {
                println!(
                    "sum mismatch: {} {} agency={} regulations={}",
                    m.date, m.agency_name, m.agency_word_count, m.regulation_word_count
                );
            }
            for (date, name) in &report.conflicting_units {
                println!("dead letter alongside results: {date} {name}");
            }
            for (date, name) in &report.orphaned_regulations {
                println!("regulation rows without agency row: {date} {name}");
            }
            if !report.is_clean() {
                return Ok(ExitCode::FAILURE);
            }
            println!("audit clean");
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn backfill_flags_override_environment_config() {
        let cli = Cli::try_parse_from([
            "regvol-cli",
            "backfill",
            "--min-year",
            "2023",
            "--refresh",
            "--concurrency",
            "8",
            "--agency",
            "USDA",
            "--agency",
            "FCA",
        ])
        .unwrap();
        let Some(Commands::Backfill(args)) = cli.command else {
            panic!("expected backfill");
        };
        let mut config = BackfillConfig::default();
        args.apply(&mut config);

        assert_eq!(config.min_year, 2023);
        assert_eq!(config.terminal_year, 2025);
        assert!(!config.skip_completed);
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.agencies, vec!["USDA", "FCA"]);
    }
}
