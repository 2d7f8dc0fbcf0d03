use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use regvol_core::{
    AgencyBatch, AgencyOnDate, AgencySummary, CfrReference, DeadLetter, RegulationOnDate,
    SeriesPoint,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::snapshot::{AuditReport, PersistenceError, SnapshotStore, StoreConfig, SumMismatch};

/// Postgres-backed [`SnapshotStore`] over the `regulation_on_date`,
/// `agency_on_date` and `dead_letter` tables.
#[derive(Debug, Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

async fn clear_unit(
    tx: &mut Transaction<'_, Postgres>,
    date: NaiveDate,
    agency_name: &str,
) -> Result<(), PersistenceError> {
    for statement in [
        "DELETE FROM regulation_on_date WHERE date = $1 AND agency_name = $2",
        "DELETE FROM agency_on_date WHERE date = $1 AND name = $2",
        "DELETE FROM dead_letter WHERE date = $1 AND agency_name = $2",
    ] {
        sqlx::query(statement)
            .bind(date)
            .bind(agency_name)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

fn title_to_db(reference: &CfrReference) -> Result<i32, PersistenceError> {
    i32::try_from(reference.title)
        .map_err(|_| PersistenceError::Corrupt(format!("title {} out of range", reference.title)))
}

fn regulation_from_row(row: &PgRow) -> Result<RegulationOnDate, PersistenceError> {
    let title: i32 = row.try_get("title")?;
    let title = u32::try_from(title)
        .map_err(|_| PersistenceError::Corrupt(format!("negative title {title}")))?;
    let reference = CfrReference {
        title,
        subtitle: row.try_get("subtitle")?,
        chapter: row.try_get("chapter")?,
        subchapter: row.try_get("subchapter")?,
        part: row.try_get("part")?,
        subpart: row.try_get("subpart")?,
        section: row.try_get("section")?,
        appendix: row.try_get("appendix")?,
    };
    Ok(RegulationOnDate::new(
        row.try_get("date")?,
        reference,
        row.try_get::<String, _>("agency_name")?,
        row.try_get("word_count")?,
    )?)
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn record_success(&self, batch: &AgencyBatch) -> Result<(), PersistenceError> {
        let agency = batch.agency();
        let mut tx = self.pool.begin().await?;
        clear_unit(&mut tx, agency.date, &agency.name).await?;

        for row in batch.regulations() {
            let r = &row.reference;
            sqlx::query(
                r#"
                INSERT INTO regulation_on_date
                    (date, title, subtitle, chapter, subchapter, part, subpart, section, appendix,
                     agency_name, word_count)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(row.date)
            .bind(title_to_db(r)?)
            .bind(r.subtitle.as_deref())
            .bind(r.chapter.as_deref())
            .bind(r.subchapter.as_deref())
            .bind(r.part.as_deref())
            .bind(r.subpart.as_deref())
            .bind(r.section.as_deref())
            .bind(r.appendix.as_deref())
            .bind(&row.agency_name)
            .bind(row.word_count)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO agency_on_date (date, name, short_name, word_count)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(agency.date)
        .bind(&agency.name)
        .bind(agency.short_name.as_deref())
        .bind(agency.word_count)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(date = %agency.date, agency = %agency.name, rows = batch.regulations().len(), "unit committed");
        Ok(())
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;
        clear_unit(&mut tx, letter.date, &letter.agency_name).await?;
        sqlx::query(
            r#"
            INSERT INTO dead_letter
                (date, agency_name, agency_short_name, cfr_references, exception_msg)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(letter.date)
        .bind(&letter.agency_name)
        .bind(letter.agency_short_name.as_deref())
        .bind(&letter.references)
        .bind(&letter.failure)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn completed_agencies(&self, date: NaiveDate) -> Result<HashSet<String>, PersistenceError> {
        let rows = sqlx::query("SELECT name FROM agency_on_date WHERE date = $1")
            .bind(date)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(PersistenceError::from))
            .collect()
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT date, agency_name, agency_short_name, cfr_references, exception_msg
              FROM dead_letter
             ORDER BY date, agency_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DeadLetter {
                date: row.try_get("date")?,
                agency_name: row.try_get("agency_name")?,
                agency_short_name: row.try_get("agency_short_name")?,
                references: row.try_get("cfr_references")?,
                failure: row.try_get("exception_msg")?,
            });
        }
        Ok(out)
    }

    async fn agencies_on(&self, date: NaiveDate) -> Result<Vec<AgencyOnDate>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT date, name, short_name, word_count
              FROM agency_on_date
             WHERE date = $1
             ORDER BY name
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AgencyOnDate {
                date: row.try_get("date")?,
                name: row.try_get("name")?,
                short_name: row.try_get("short_name")?,
                word_count: row.try_get("word_count")?,
            });
        }
        Ok(out)
    }

    async fn regulations_on(
        &self,
        date: NaiveDate,
        agency_name: &str,
    ) -> Result<Vec<RegulationOnDate>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT date, title, subtitle, chapter, subchapter, part, subpart, section, appendix,
                   agency_name, word_count
              FROM regulation_on_date
             WHERE date = $1 AND agency_name = $2
             ORDER BY id
            "#,
        )
        .bind(date)
        .bind(agency_name)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(regulation_from_row).collect()
    }

    async fn summary(
        &self,
        old_date: NaiveDate,
        new_date: NaiveDate,
    ) -> Result<Vec<AgencySummary>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT COALESCE(n.name, o.name) AS name,
                   COALESCE(n.short_name, o.short_name) AS short_name,
                   COALESCE(n.word_count, 0) AS new_word_count,
                   COALESCE(o.word_count, 0) AS old_word_count
              FROM (SELECT name, short_name, word_count FROM agency_on_date WHERE date = $2) n
              FULL OUTER JOIN
                   (SELECT name, short_name, word_count FROM agency_on_date WHERE date = $1) o
                ON n.name = o.name
             ORDER BY new_word_count DESC, name ASC
            "#,
        )
        .bind(old_date)
        .bind(new_date)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(AgencySummary {
                name: row.try_get("name")?,
                short_name: row.try_get("short_name")?,
                new_word_count: row.try_get("new_word_count")?,
                old_word_count: row.try_get("old_word_count")?,
            });
        }
        Ok(out)
    }

    async fn agency_series(
        &self,
        agency_name: &str,
        min_date: NaiveDate,
        max_date: NaiveDate,
    ) -> Result<Vec<SeriesPoint>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT date, word_count
              FROM agency_on_date
             WHERE name = $1 AND date >= $2 AND date <= $3
             ORDER BY date
            "#,
        )
        .bind(agency_name)
        .bind(min_date)
        .bind(max_date)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SeriesPoint {
                date: row.try_get("date")?,
                word_count: row.try_get("word_count")?,
            });
        }
        Ok(out)
    }

    async fn audit(&self) -> Result<AuditReport, PersistenceError> {
        let mismatch_rows = sqlx::query(
            r#"
            SELECT a.date, a.name, a.word_count AS agency_word_count,
                   COALESCE(SUM(r.word_count), 0)::BIGINT AS regulation_word_count
              FROM agency_on_date a
              LEFT JOIN regulation_on_date r
                ON r.date = a.date AND r.agency_name = a.name
             GROUP BY a.id, a.date, a.name, a.word_count
            HAVING a.word_count <> COALESCE(SUM(r.word_count), 0)
             ORDER BY a.date, a.name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let conflict_rows = sqlx::query(
            r#"
            SELECT d.date, d.agency_name AS name
              FROM dead_letter d
              JOIN agency_on_date a ON a.date = d.date AND a.name = d.agency_name
             ORDER BY d.date, d.agency_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let orphan_rows = sqlx::query(
            r#"
            SELECT DISTINCT r.date, r.agency_name AS name
              FROM regulation_on_date r
              LEFT JOIN agency_on_date a ON a.date = r.date AND a.name = r.agency_name
             WHERE a.id IS NULL
             ORDER BY r.date, name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut report = AuditReport::default();
        for row in mismatch_rows {
            report.sum_mismatches.push(SumMismatch {
                date: row.try_get("date")?,
                agency_name: row.try_get("name")?,
                agency_word_count: row.try_get("agency_word_count")?,
                regulation_word_count: row.try_get("regulation_word_count")?,
            });
        }
        for row in conflict_rows {
            report
                .conflicting_units
                .push((row.try_get("date")?, row.try_get("name")?));
        }
        for row in orphan_rows {
            report
                .orphaned_regulations
                .push((row.try_get("date")?, row.try_get("name")?));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regvol_core::Agency;
    use uuid::Uuid;

    /// Migrated store on `DATABASE_URL`; these tests are skipped when it is unset.
    async fn test_store() -> Option<PgSnapshotStore> {
        let url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())?;
        let store = PgSnapshotStore::connect(&StoreConfig::new(url))
            .await
            .expect("connect");
        store.migrate().await.expect("migrate");
        Some(store)
    }

    async fn purge(store: &PgSnapshotStore, names: &[&str]) {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        for statement in [
            "DELETE FROM regulation_on_date WHERE agency_name = ANY($1)",
            "DELETE FROM agency_on_date WHERE name = ANY($1)",
            "DELETE FROM dead_letter WHERE agency_name = ANY($1)",
        ] {
            sqlx::query(statement)
                .bind(&names)
                .execute(store.pool())
                .await
                .expect("purge");
        }
    }

    fn date(year: i32, month: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, 1).unwrap()
    }

    fn agency(prefix: &str) -> Agency {
        Agency::new(
            format!("{prefix}-{}", Uuid::new_v4()),
            Some(prefix.to_uppercase()),
            vec![
                CfrReference::new(12).with_chapter("VI"),
                CfrReference::new(12).with_chapter("VI").with_part("600"),
            ],
        )
        .unwrap()
    }

    fn batch(agency: &Agency, d: NaiveDate, counts: &[i64]) -> AgencyBatch {
        let regulations = agency
            .cfr_references
            .iter()
            .zip(counts)
            .map(|(r, n)| RegulationOnDate::new(d, r.clone(), &agency.name, *n).unwrap())
            .collect();
        let total = counts.iter().sum();
        AgencyBatch::new(AgencyOnDate::new(d, agency, total).unwrap(), regulations).unwrap()
    }

    #[tokio::test]
    async fn unit_writes_replace_and_exclude_each_other() {
        let Some(store) = test_store().await else {
            return;
        };
        let alpha = agency("alpha");
        let d = date(1990, 2);

        store.record_success(&batch(&alpha, d, &[10, 5])).await.unwrap();
        store.record_success(&batch(&alpha, d, &[12, 5])).await.unwrap();
        let rows = store.regulations_on(d, &alpha.name).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].reference, alpha.cfr_references[0]);
        let stored: Vec<_> = store
            .agencies_on(d)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.name == alpha.name)
            .collect();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].word_count, 17);

        let letter = DeadLetter::for_agency(d, &alpha, "http status 500").unwrap();
        store.record_dead_letter(&letter).await.unwrap();
        assert!(store.regulations_on(d, &alpha.name).await.unwrap().is_empty());
        assert!(!store.completed_agencies(d).await.unwrap().contains(&alpha.name));
        let letters: Vec<_> = store
            .dead_letters()
            .await
            .unwrap()
            .into_iter()
            .filter(|l| l.agency_name == alpha.name)
            .collect();
        assert_eq!(letters, vec![letter]);
        assert_eq!(letters[0].to_agency().unwrap(), alpha);

        store.record_success(&batch(&alpha, d, &[1, 2])).await.unwrap();
        assert!(store
            .dead_letters()
            .await
            .unwrap()
            .iter()
            .all(|l| l.agency_name != alpha.name));

        purge(&store, &[&alpha.name]).await;
    }

    #[tokio::test]
    async fn summary_and_series_read_back_committed_units() {
        let Some(store) = test_store().await else {
            return;
        };
        let alpha = agency("alpha");
        let beta = agency("beta");
        let (old, new) = (date(1991, 2), date(1991, 5));

        store.record_success(&batch(&alpha, old, &[60, 40])).await.unwrap();
        store.record_success(&batch(&alpha, new, &[100, 50])).await.unwrap();
        store.record_success(&batch(&beta, new, &[80, 0])).await.unwrap();

        let summary: Vec<_> = store
            .summary(old, new)
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.name == alpha.name || s.name == beta.name)
            .collect();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].name, alpha.name);
        assert_eq!((summary[0].old_word_count, summary[0].new_word_count), (100, 150));
        assert_eq!(summary[1].name, beta.name);
        assert_eq!((summary[1].old_word_count, summary[1].new_word_count), (0, 80));
        assert_eq!(summary[1].short_name.as_deref(), Some("BETA"));

        let series = store
            .agency_series(&alpha.name, date(1991, 5), date(1991, 11))
            .await
            .unwrap();
        assert_eq!(series, vec![SeriesPoint { date: new, word_count: 150 }]);

        purge(&store, &[&alpha.name, &beta.name]).await;
    }

    #[tokio::test]
    async fn audit_reports_rows_written_outside_the_store() {
        let Some(store) = test_store().await else {
            return;
        };
        let gamma = agency("gamma");
        let delta = agency("delta");
        let d = date(1992, 8);

        sqlx::query("INSERT INTO agency_on_date (date, name, word_count) VALUES ($1, $2, 99)")
            .bind(d)
            .bind(&gamma.name)
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO regulation_on_date (date, title, agency_name, word_count) VALUES ($1, 5, $2, 7)",
        )
        .bind(d)
        .bind(&delta.name)
        .execute(store.pool())
        .await
        .unwrap();

        let report = store.audit().await.unwrap();
        assert!(report
            .sum_mismatches
            .iter()
            .any(|m| m.agency_name == gamma.name && m.regulation_word_count == 0));
        assert!(report.orphaned_regulations.contains(&(d, delta.name.clone())));

        purge(&store, &[&gamma.name, &delta.name]).await;
    }
}
