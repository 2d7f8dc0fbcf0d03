use anyhow::Result;
use chrono::NaiveDate;
use indicatif::{ProgressBar, ProgressStyle};
use regvol_sync::{ProgressSink, UnitOutcome};

/// Terminal progress bar over backfill units.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new() -> Result<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta}) {msg}")?
                .progress_chars("=> "),
        );
        Ok(Self { bar })
    }
}

impl ProgressSink for BarProgress {
    fn begin(&self, total_units: usize) {
        self.bar.reset();
        self.bar.set_length(total_units as u64);
    }

    fn unit_done(&self, date: NaiveDate, agency: &str, outcome: UnitOutcome) {
        if outcome == UnitOutcome::DeadLettered {
            self.bar.println(format!("dead letter: {date} {agency}"));
        }
        self.bar.set_message(format!("{date} {agency}"));
        self.bar.inc(1);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
