use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use regvol_core::{
    summarize, AgencyBatch, AgencyOnDate, AgencySummary, DeadLetter, RegulationOnDate,
    SeriesPoint, ValidationError,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored row is invalid: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreConfigError {
    #[error("missing environment variable {0} (set DATABASE_URL or the POSTGRES_* variables)")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Connection settings for the Postgres store, resolved once at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 8,
        }
    }

    pub fn from_env() -> Result<Self, StoreConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `DATABASE_URL` wins; otherwise the URL is assembled from `POSTGRES_*` parts.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StoreConfigError> {
        let database_url = match lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()) {
            Some(url) => url,
            None => {
                let required = |key: &'static str| {
                    lookup(key)
                        .filter(|v| !v.trim().is_empty())
                        .ok_or(StoreConfigError::MissingVar(key))
                };
                let user = required("POSTGRES_USER")?;
                let password = required("POSTGRES_PASSWORD")?;
                let host = required("POSTGRES_HOST")?;
                let db = required("POSTGRES_DB")?;
                let port = lookup("POSTGRES_PORT").unwrap_or_else(|| "5432".to_string());
                if port.parse::<u16>().is_err() {
                    return Err(StoreConfigError::Invalid {
                        var: "POSTGRES_PORT",
                        value: port,
                    });
                }
                format!("postgres://{user}:{password}@{host}:{port}/{db}")
            }
        };

        let max_connections = match lookup("REGVOL_DB_MAX_CONNECTIONS") {
            Some(raw) => match raw.parse::<u32>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(StoreConfigError::Invalid {
                        var: "REGVOL_DB_MAX_CONNECTIONS",
                        value: raw,
                    })
                }
            },
            None => 8,
        };

        Ok(Self {
            database_url,
            max_connections,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SumMismatch {
    pub date: NaiveDate,
    pub agency_name: String,
    pub agency_word_count: i64,
    pub regulation_word_count: i64,
}

/// Cross-checks of the stored dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    /// Agency rows whose word count is not the sum of their regulation rows.
    pub sum_mismatches: Vec<SumMismatch>,
    /// (date, agency) pairs holding both a dead letter and an agency row.
    pub conflicting_units: Vec<(NaiveDate, String)>,
    /// (date, agency) pairs holding regulation rows but no agency row.
    pub orphaned_regulations: Vec<(NaiveDate, String)>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.sum_mismatches.is_empty()
            && self.conflicting_units.is_empty()
            && self.orphaned_regulations.is_empty()
    }
}

/// Durable store for the three record kinds plus the read paths built on them.
///
/// Writes replace by (date, agency): a success batch clears any earlier rows and
/// dead letter for its unit, and a dead letter clears any earlier success rows.
/// Each write is one transaction.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn record_success(&self, batch: &AgencyBatch) -> Result<(), PersistenceError>;

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), PersistenceError>;

    /// Names of agencies that already have an agency row for `date`.
    async fn completed_agencies(&self, date: NaiveDate) -> Result<HashSet<String>, PersistenceError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, PersistenceError>;

    async fn agencies_on(&self, date: NaiveDate) -> Result<Vec<AgencyOnDate>, PersistenceError>;

    async fn regulations_on(
        &self,
        date: NaiveDate,
        agency_name: &str,
    ) -> Result<Vec<RegulationOnDate>, PersistenceError>;

    async fn summary(
        &self,
        old_date: NaiveDate,
        new_date: NaiveDate,
    ) -> Result<Vec<AgencySummary>, PersistenceError> {
        let old = self.agencies_on(old_date).await?;
        let new = self.agencies_on(new_date).await?;
        Ok(summarize(&old, &new))
    }

    /// Ascending by date; an unknown agency yields an empty series.
    async fn agency_series(
        &self,
        agency_name: &str,
        min_date: NaiveDate,
        max_date: NaiveDate,
    ) -> Result<Vec<SeriesPoint>, PersistenceError>;

    async fn audit(&self) -> Result<AuditReport, PersistenceError>;
}
