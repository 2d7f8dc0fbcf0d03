use std::collections::{BTreeMap, BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use regvol_core::{AgencyBatch, AgencyOnDate, DeadLetter, RegulationOnDate, SeriesPoint};
use tokio::sync::Mutex;

use crate::snapshot::{AuditReport, PersistenceError, SnapshotStore, SumMismatch};

/// In-process [`SnapshotStore`] with the same replace-by-unit semantics as Postgres.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    regulations: Vec<RegulationOnDate>,
    agencies: Vec<AgencyOnDate>,
    dead_letters: Vec<DeadLetter>,
}

impl MemoryState {
    fn clear_unit(&mut self, date: NaiveDate, agency_name: &str) {
        self.regulations
            .retain(|r| !(r.date == date && r.agency_name == agency_name));
        self.agencies
            .retain(|a| !(a.date == date && a.name == agency_name));
        self.dead_letters
            .retain(|d| !(d.date == date && d.agency_name == agency_name));
    }
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn regulation_count(&self) -> usize {
        self.state.lock().await.regulations.len()
    }

    pub async fn agency_count(&self) -> usize {
        self.state.lock().await.agencies.len()
    }

    /// Seed rows directly, bypassing batch validation. Used to stage read-path fixtures.
    pub async fn insert_agency_row(&self, row: AgencyOnDate) {
        self.state.lock().await.agencies.push(row);
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn record_success(&self, batch: &AgencyBatch) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        let agency = batch.agency();
        state.clear_unit(agency.date, &agency.name);
        state.regulations.extend(batch.regulations().iter().cloned());
        state.agencies.push(agency.clone());
        Ok(())
    }

    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), PersistenceError> {
        let mut state = self.state.lock().await;
        state.clear_unit(letter.date, &letter.agency_name);
        state.dead_letters.push(letter.clone());
        Ok(())
    }

    async fn completed_agencies(&self, date: NaiveDate) -> Result<HashSet<String>, PersistenceError> {
        let state = self.state.lock().await;
        Ok(state
            .agencies
            .iter()
            .filter(|a| a.date == date)
            .map(|a| a.name.clone())
            .collect())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, PersistenceError> {
        let state = self.state.lock().await;
        let mut out = state.dead_letters.clone();
        out.sort_by(|a, b| (a.date, &a.agency_name).cmp(&(b.date, &b.agency_name)));
        Ok(out)
    }

    async fn agencies_on(&self, date: NaiveDate) -> Result<Vec<AgencyOnDate>, PersistenceError> {
        let state = self.state.lock().await;
        let mut out = state
            .agencies
            .iter()
            .filter(|a| a.date == date)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn regulations_on(
        &self,
        date: NaiveDate,
        agency_name: &str,
    ) -> Result<Vec<RegulationOnDate>, PersistenceError> {
        let state = self.state.lock().await;
        Ok(state
            .regulations
            .iter()
            .filter(|r| r.date == date && r.agency_name == agency_name)
            .cloned()
            .collect())
    }

    async fn agency_series(
        &self,
        agency_name: &str,
        min_date: NaiveDate,
        max_date: NaiveDate,
    ) -> Result<Vec<SeriesPoint>, PersistenceError> {
        let state = self.state.lock().await;
        let mut points = state
            .agencies
            .iter()
            .filter(|a| a.name == agency_name && a.date >= min_date && a.date <= max_date)
            .map(|a| SeriesPoint {
                date: a.date,
                word_count: a.word_count,
            })
            .collect::<Vec<_>>();
        points.sort_by_key(|p| p.date);
        Ok(points)
    }

    async fn audit(&self) -> Result<AuditReport, PersistenceError> {
        let state = self.state.lock().await;

        let mut regulation_sums: BTreeMap<(NaiveDate, &str), i64> = BTreeMap::new();
        for row in &state.regulations {
            *regulation_sums
                .entry((row.date, row.agency_name.as_str()))
                .or_default() += row.word_count;
        }
        let agency_units: BTreeSet<(NaiveDate, &str)> = state
            .agencies
            .iter()
            .map(|a| (a.date, a.name.as_str()))
            .collect();

        let mut report = AuditReport::default();
        for agency in &state.agencies {
            let sum = regulation_sums
                .get(&(agency.date, agency.name.as_str()))
                .copied()
                .unwrap_or(0);
            if sum != agency.word_count {
                report.sum_mismatches.push(SumMismatch {
                    date: agency.date,
                    agency_name: agency.name.clone(),
                    agency_word_count: agency.word_count,
                    regulation_word_count: sum,
                });
            }
        }
        for letter in &state.dead_letters {
            if agency_units.contains(&(letter.date, letter.agency_name.as_str())) {
                report
                    .conflicting_units
                    .push((letter.date, letter.agency_name.clone()));
            }
        }
        for (date, name) in regulation_sums.keys() {
            if !agency_units.contains(&(*date, *name)) {
                report.orphaned_regulations.push((*date, name.to_string()));
            }
        }
        report.sum_mismatches.sort_by(|a, b| {
            (a.date, &a.agency_name).cmp(&(b.date, &b.agency_name))
        });
        report.conflicting_units.sort();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regvol_core::{Agency, CfrReference};

    fn date(y: i32, m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, 1).unwrap()
    }

    fn batch(agency: &Agency, d: NaiveDate, counts: &[i64]) -> AgencyBatch {
        let regulations = counts
            .iter()
            .enumerate()
            .map(|(i, c)| {
                RegulationOnDate::new(d, CfrReference::new(i as u32 + 1), &agency.name, *c).unwrap()
            })
            .collect::<Vec<_>>();
        let total = counts.iter().sum();
        AgencyBatch::new(AgencyOnDate::new(d, agency, total).unwrap(), regulations).unwrap()
    }

    fn agency(name: &str) -> Agency {
        Agency::new(name, None, vec![CfrReference::new(1), CfrReference::new(2)]).unwrap()
    }

    #[tokio::test]
    async fn rewriting_a_unit_replaces_instead_of_duplicating() {
        let store = MemorySnapshotStore::new();
        let alpha = agency("Alpha");
        let d = date(2020, 2);

        store.record_success(&batch(&alpha, d, &[10, 5])).await.unwrap();
        store.record_success(&batch(&alpha, d, &[12, 5])).await.unwrap();

        assert_eq!(store.agency_count().await, 1);
        assert_eq!(store.regulation_count().await, 2);
        assert_eq!(store.agencies_on(d).await.unwrap()[0].word_count, 17);
        assert!(store.audit().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn dead_letter_and_success_are_mutually_exclusive() {
        let store = MemorySnapshotStore::new();
        let alpha = agency("Alpha");
        let d = date(2020, 5);

        store.record_success(&batch(&alpha, d, &[3, 4])).await.unwrap();
        let letter = DeadLetter::for_agency(d, &alpha, "http status 500").unwrap();
        store.record_dead_letter(&letter).await.unwrap();

        assert_eq!(store.agency_count().await, 0);
        assert_eq!(store.regulation_count().await, 0);
        assert_eq!(store.dead_letters().await.unwrap(), vec![letter]);

        store.record_success(&batch(&alpha, d, &[3, 4])).await.unwrap();
        assert!(store.dead_letters().await.unwrap().is_empty());
        assert!(store.completed_agencies(d).await.unwrap().contains("Alpha"));
    }

    #[tokio::test]
    async fn series_is_windowed_and_ascending() {
        let store = MemorySnapshotStore::new();
        let alpha = agency("Alpha");
        for (d, n) in [(date(2021, 8), 30), (date(2019, 2), 10), (date(2020, 2), 20)] {
            store.record_success(&batch(&alpha, d, &[n])).await.unwrap();
        }

        let series = store
            .agency_series("Alpha", date(2019, 5), date(2021, 11))
            .await
            .unwrap();
        assert_eq!(
            series,
            vec![
                SeriesPoint { date: date(2020, 2), word_count: 20 },
                SeriesPoint { date: date(2021, 8), word_count: 30 },
            ]
        );
        assert!(store
            .agency_series("Nobody", date(2018, 2), date(2025, 2))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn audit_flags_rows_that_break_the_sum_invariant() {
        let store = MemorySnapshotStore::new();
        store
            .insert_agency_row(AgencyOnDate {
                date: date(2022, 2),
                name: "Alpha".into(),
                short_name: None,
                word_count: 99,
            })
            .await;

        let report = store.audit().await.unwrap();
        assert!(!report.is_clean());
        assert_eq!(report.sum_mismatches.len(), 1);
        assert_eq!(report.sum_mismatches[0].regulation_word_count, 0);
    }
}
