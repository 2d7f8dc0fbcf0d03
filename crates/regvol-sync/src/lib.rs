//! Snapshot orchestration: dates x agencies x references, one atomic write or dead letter per unit.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use regvol_adapters::{
    filter_agencies, snapshot_from_content, Catalog, ContentParseError, ContentSource,
    EcfrAgencyCatalog, EcfrContentSource, FileCatalog, RawContent, SourceError,
};
use regvol_core::{
    error_chain, Agency, AgencyBatch, AgencyOnDate, CfrReference, DeadLetter, FeatureSet,
    RegulationOnDate, ValidationError,
};
use regvol_storage::{
    HttpFetcher, MarkupArchive, PersistenceError, PgSnapshotStore, SnapshotStore, StoreConfig,
};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod progress;

pub use config::{BackfillConfig, ConfigError};
pub use progress::{NullProgress, ProgressSink, TracingProgress};

pub const CRATE_NAME: &str = "regvol-sync";

/// Why a (date, agency) unit was dead-lettered. [`UnitError::detail`] is what gets stored.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("fetch failed for {reference} on {date}: {source}")]
    Fetch {
        reference: CfrReference,
        date: NaiveDate,
        #[source]
        source: SourceError,
    },
    #[error(transparent)]
    ContentParse(#[from] ContentParseError),
    #[error("invalid record: {0}")]
    InvalidRecord(#[from] ValidationError),
}

impl UnitError {
    /// Message plus the underlying causes (transport, OS) that `Display` leaves out.
    pub fn detail(&self) -> String {
        error_chain(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    Committed,
    DeadLettered,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedUnit {
    pub date: NaiveDate,
    pub agency_name: String,
    pub failure: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub dates: usize,
    pub agencies: usize,
    pub units_total: usize,
    pub committed: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
    pub failed_units: Vec<FailedUnit>,
    pub reports_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReprocessSummary {
    pub attempted: usize,
    pub recovered: usize,
    pub still_failing: usize,
    /// Dead letters whose stored reference list could not be decoded; left untouched.
    pub unreadable: usize,
    pub failed_units: Vec<FailedUnit>,
}

struct PlannedUnit {
    date: NaiveDate,
    agency: Agency,
    skip: bool,
}

struct UnitReport {
    date: NaiveDate,
    agency_name: String,
    outcome: UnitOutcome,
    failure: Option<String>,
}

#[derive(Default)]
struct UnitTally {
    committed: usize,
    dead_lettered: usize,
    skipped: usize,
    failed_units: Vec<FailedUnit>,
}

impl UnitTally {
    fn record(&mut self, report: UnitReport) {
        match report.outcome {
            UnitOutcome::Committed => self.committed += 1,
            UnitOutcome::Skipped => self.skipped += 1,
            UnitOutcome::DeadLettered => {
                self.dead_lettered += 1;
                self.failed_units.push(FailedUnit {
                    date: report.date,
                    agency_name: report.agency_name,
                    failure: report.failure.unwrap_or_default(),
                });
            }
        }
    }

    fn total(&self) -> usize {
        self.committed + self.dead_lettered + self.skipped
    }
}

pub struct SnapshotPipeline {
    config: BackfillConfig,
    catalog: Arc<dyn Catalog>,
    source: Arc<dyn ContentSource>,
    store: Arc<dyn SnapshotStore>,
    features: FeatureSet,
    archive: Option<MarkupArchive>,
    progress: Arc<dyn ProgressSink>,
}

impl SnapshotPipeline {
    pub fn new(
        config: BackfillConfig,
        catalog: Arc<dyn Catalog>,
        source: Arc<dyn ContentSource>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let archive = config.artifacts_dir.clone().map(MarkupArchive::new);
        Self {
            config,
            catalog,
            source,
            store,
            features: FeatureSet::default(),
            archive,
            progress: Arc::new(TracingProgress::default()),
        }
    }

    /// Wire the eCFR content source and the configured catalog around `store`.
    pub fn from_config(config: BackfillConfig, store: Arc<dyn SnapshotStore>) -> Result<Self> {
        config.validate()?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let catalog: Arc<dyn Catalog> = match &config.catalog_path {
            Some(path) => Arc::new(FileCatalog::new(path.clone())),
            None => Arc::new(EcfrAgencyCatalog::new(
                Arc::clone(&http),
                config.ecfr_base_url.clone(),
            )),
        };
        let source = Arc::new(EcfrContentSource::new(http, config.ecfr_base_url.clone()));
        Ok(Self::new(config, catalog, source, store))
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features = features;
        self
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<BackfillSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let dates = self.config.dates(started_at.date_naive())?;

        let agencies = self
            .catalog
            .list_agencies()
            .await
            .context("loading agency catalog")?;
        let agencies = filter_agencies(agencies, &self.config.agencies);
        if agencies.is_empty() {
            bail!(
                "agency filter {:?} matched no catalog entries",
                self.config.agencies
            );
        }

        info!(
            %run_id,
            dates = dates.len(),
            agencies = agencies.len(),
            skip_completed = self.config.skip_completed,
            concurrency = self.config.concurrency,
            "starting backfill"
        );
        self.progress.begin(dates.len() * agencies.len());

        let mut tally = UnitTally::default();
        for date in &dates {
            let completed = if self.config.skip_completed {
                self.store
                    .completed_agencies(*date)
                    .await
                    .with_context(|| format!("listing completed units for {date}"))?
            } else {
                HashSet::new()
            };
            let units = agencies
                .iter()
                .map(|agency| PlannedUnit {
                    date: *date,
                    skip: completed.contains(&agency.name),
                    agency: agency.clone(),
                })
                .collect();
            self.drive(units, &mut tally)
                .await
                .with_context(|| format!("backfill aborted while processing {date}"))?;
        }
        self.progress.finish();

        let mut summary = BackfillSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            first_date: dates.first().copied(),
            last_date: dates.last().copied(),
            dates: dates.len(),
            agencies: agencies.len(),
            units_total: tally.total(),
            committed: tally.committed,
            dead_lettered: tally.dead_lettered,
            skipped: tally.skipped,
            failed_units: tally.failed_units,
            reports_dir: None,
        };
        if let Some(root) = &self.config.reports_dir {
            let dir = write_reports(root, &mut summary).await?;
            info!(reports_dir = %dir.display(), "wrote run reports");
        }

        info!(
            %run_id,
            committed = summary.committed,
            dead_lettered = summary.dead_lettered,
            skipped = summary.skipped,
            "backfill finished"
        );
        Ok(summary)
    }

    /// Rerun every dead-lettered unit with the reference list stored at failure time.
    pub async fn reprocess_dead_letters(&self) -> Result<ReprocessSummary> {
        let letters = self
            .store
            .dead_letters()
            .await
            .context("loading dead letters")?;

        let mut unreadable = 0usize;
        let mut units = Vec::with_capacity(letters.len());
        for letter in &letters {
            match letter.to_agency() {
                Ok(agency) => units.push(PlannedUnit {
                    date: letter.date,
                    agency,
                    skip: false,
                }),
                Err(err) => {
                    unreadable += 1;
                    warn!(
                        date = %letter.date,
                        agency = %letter.agency_name,
                        error = %err,
                        "dead letter references are unreadable; leaving it in place"
                    );
                }
            }
        }

        info!(attempted = units.len(), unreadable, "reprocessing dead letters");
        self.progress.begin(units.len());
        let mut tally = UnitTally::default();
        self.drive(units, &mut tally)
            .await
            .context("reprocessing aborted")?;
        self.progress.finish();

        Ok(ReprocessSummary {
            attempted: letters.len(),
            recovered: tally.committed,
            still_failing: tally.dead_lettered,
            unreadable,
            failed_units: tally.failed_units,
        })
    }

    /// Cron-driven reruns; `None` when the scheduler is disabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = &self.config.schedule_cron;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        committed = summary.committed,
                        dead_lettered = summary.dead_lettered,
                        "scheduled backfill finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled backfill failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn drive(
        &self,
        units: Vec<PlannedUnit>,
        tally: &mut UnitTally,
    ) -> Result<(), PersistenceError> {
        let mut results = stream::iter(units)
            .map(move |unit| async move {
                if unit.skip {
                    return Ok(UnitReport {
                        date: unit.date,
                        agency_name: unit.agency.name,
                        outcome: UnitOutcome::Skipped,
                        failure: None,
                    });
                }
                self.process_unit(unit.date, &unit.agency).await
            })
            .buffer_unordered(self.config.concurrency.max(1));

        // Returning early drops in-flight units; their open transactions roll back.
        while let Some(result) = results.next().await {
            let report = result?;
            self.progress
                .unit_done(report.date, &report.agency_name, report.outcome);
            tally.record(report);
        }
        Ok(())
    }

    async fn process_unit(
        &self,
        date: NaiveDate,
        agency: &Agency,
    ) -> Result<UnitReport, PersistenceError> {
        let span = info_span!("unit", %date, agency = %agency.name);
        async move {
            match self.extract_unit(date, agency).await {
                Ok(batch) => {
                    self.store.record_success(&batch).await.map_err(|err| {
                        error!(error = %err, "persisting unit failed");
                        err
                    })?;
                    debug!(
                        word_count = batch.agency().word_count,
                        references = batch.regulations().len(),
                        "unit committed"
                    );
                    Ok(UnitReport {
                        date,
                        agency_name: agency.name.clone(),
                        outcome: UnitOutcome::Committed,
                        failure: None,
                    })
                }
                Err(unit_err) => {
                    let detail = unit_err.detail();
                    warn!(error = %detail, "unit failed; recording dead letter");
                    let letter = DeadLetter::for_agency(date, agency, detail).map_err(|e| {
                        PersistenceError::Corrupt(format!("serializing dead letter references: {e}"))
                    })?;
                    self.store.record_dead_letter(&letter).await.map_err(|err| {
                        error!(error = %err, "persisting dead letter failed");
                        err
                    })?;
                    Ok(UnitReport {
                        date,
                        agency_name: agency.name.clone(),
                        outcome: UnitOutcome::DeadLettered,
                        failure: Some(letter.failure),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Fetch and measure every reference in order, stopping at the first failure.
    async fn extract_unit(&self, date: NaiveDate, agency: &Agency) -> Result<AgencyBatch, UnitError> {
        let limit = self.config.fetch_timeout();
        let mut regulations = Vec::with_capacity(agency.cfr_references.len());

        for reference in &agency.cfr_references {
            let fetched = match tokio::time::timeout(limit, self.source.fetch(reference, date)).await
            {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout(limit)),
            };
            let content = fetched.map_err(|source| UnitError::Fetch {
                reference: reference.clone(),
                date,
                source,
            })?;
            self.archive_markup(date, agency, &content).await;

            let snapshot = snapshot_from_content(reference, date, &content)?;
            let values = self.features.evaluate(&snapshot.paragraphs);
            regulations.push(RegulationOnDate::new(
                date,
                snapshot.reference,
                &agency.name,
                values.word_count(),
            )?);
        }

        let total = regulations.iter().map(|r| r.word_count).sum();
        Ok(AgencyBatch::new(
            AgencyOnDate::new(date, agency, total)?,
            regulations,
        )?)
    }

    async fn archive_markup(&self, date: NaiveDate, agency: &Agency, content: &RawContent) {
        let Some(archive) = &self.archive else {
            return;
        };
        if let Err(err) = archive
            .store(
                date,
                &agency.slug(),
                content.kind.extension(),
                content.markup.as_bytes(),
            )
            .await
        {
            warn!(error = %format!("{err:#}"), url = %content.source_url, "archiving markup failed");
        }
    }
}

/// Write `<root>/<run_id>/run_summary.json` and `brief.md`, recording the directory on `summary`.
pub async fn write_reports(root: &Path, summary: &mut BackfillSummary) -> Result<PathBuf> {
    let dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    summary.reports_dir = Some(dir.display().to_string());

    let json = serde_json::to_vec_pretty(&*summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;
    fs::write(dir.join("brief.md"), render_brief(summary))
        .await
        .context("writing brief.md")?;
    Ok(dir)
}

pub fn render_brief(summary: &BackfillSummary) -> String {
    let range = match (summary.first_date, summary.last_date) {
        (Some(first), Some(last)) => format!("{first} .. {last}"),
        _ => "empty".to_string(),
    };
    let failures = if summary.failed_units.is_empty() {
        "- none".to_string()
    } else {
        summary
            .failed_units
            .iter()
            .map(|f| format!("- {} {}: {}", f.date, f.agency_name, f.failure))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "# Regulatory Volume Backfill\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Dates: {} ({})\n- Agencies: {}\n- Units: {} committed, {} dead-lettered, {} skipped\n\n## Dead-lettered units\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.dates,
        range,
        summary.agencies,
        summary.committed,
        summary.dead_lettered,
        summary.skipped,
        failures
    )
}

pub async fn connect_store_from_env() -> Result<PgSnapshotStore> {
    let store_config = StoreConfig::from_env()?;
    PgSnapshotStore::connect(&store_config)
        .await
        .context("connecting to postgres")
}

pub async fn run_backfill_from_env() -> Result<BackfillSummary> {
    let config = BackfillConfig::from_env()?;
    let store = connect_store_from_env().await?;
    let pipeline = SnapshotPipeline::from_config(config, Arc::new(store))?;
    pipeline.run_once().await
}
