use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::NaiveDate;
use tracing::info;

use crate::UnitOutcome;

/// Coarse progress reporting for a backfill; never influences control flow.
/// `begin` starts a fresh count; one sink may see several runs.
pub trait ProgressSink: Send + Sync {
    fn begin(&self, _total_units: usize) {}
    fn unit_done(&self, date: NaiveDate, agency: &str, outcome: UnitOutcome);
    fn finish(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn unit_done(&self, _date: NaiveDate, _agency: &str, _outcome: UnitOutcome) {}
}

/// Logs a progress line every `every` finished units.
#[derive(Debug)]
pub struct TracingProgress {
    every: usize,
    total: AtomicUsize,
    done: AtomicUsize,
}

impl TracingProgress {
    pub fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            total: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
        }
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }
}

impl Default for TracingProgress {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ProgressSink for TracingProgress {
    fn begin(&self, total_units: usize) {
        self.total.store(total_units, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
    }

    fn unit_done(&self, date: NaiveDate, agency: &str, outcome: UnitOutcome) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        if done % self.every == 0 {
            info!(
                done,
                total = self.total(),
                %date,
                agency,
                ?outcome,
                "backfill progress"
            );
        }
    }

    fn finish(&self) {
        info!(done = self.done(), "backfill units finished");
    }
}
