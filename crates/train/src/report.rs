//! Rank-gated progress reporting.
//!
//! Only the reporting process (rank 0, or the sole process) prints progress
//! lines or appends to the metrics file. Other ranks construct a disabled
//! [`Reporter`] and every call is a no-op.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Result;
use parking_lot::Mutex;

/// One log-interval sample of training progress.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub epoch: usize,
    pub epochs: usize,
    pub step: usize,
    pub iter_per_epoch: usize,
    /// Un-divided loss (the micro-step loss × accumulation steps).
    pub loss: f32,
    pub lr: f64,
    /// Seconds since the epoch started.
    pub elapsed_secs: f64,
}

impl StepReport {
    pub fn eta_minutes(&self) -> i64 {
        epoch_time_left_minutes(self.elapsed_secs, self.step, self.iter_per_epoch)
    }

    /// `Epoch:[1/2](100/977) loss:3.142 lr:0.000500000000 epoch_Time:12min:`
    pub fn line(&self) -> String {
        format!(
            "Epoch:[{}/{}]({}/{}) loss:{:.3} lr:{:.12} epoch_Time:{}min:",
            self.epoch + 1,
            self.epochs,
            self.step,
            self.iter_per_epoch,
            self.loss,
            self.lr,
            self.eta_minutes()
        )
    }
}

/// Projected whole minutes left in the epoch:
/// `floor(spend / (step+1) * iter / 60) - floor(spend / 60)`.
pub fn epoch_time_left_minutes(elapsed_secs: f64, step: usize, iter_per_epoch: usize) -> i64 {
    let projected = elapsed_secs / (step as f64 + 1.0) * iter_per_epoch as f64;
    (projected / 60.0).floor() as i64 - (elapsed_secs / 60.0).floor() as i64
}

// ── Metrics sink ────────────────────────────────────────────────────────────

/// Append-only CSV of logged steps, one file per run.
pub struct MetricsSink {
    writer: Mutex<BufWriter<File>>,
}

impl MetricsSink {
    pub const HEADER: &'static str = "epoch,step,global_step,loss,lr,epoch_time_min";

    pub fn create(dir: &Path, run_name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{run_name}.csv"));
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "{}", Self::HEADER)?;
        tracing::info!(path = %path.display(), "metrics sink");
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    pub fn record(&self, report: &StepReport) -> Result<()> {
        let mut w = self.writer.lock();
        writeln!(
            w,
            "{},{},{},{},{},{}",
            report.epoch,
            report.step,
            report.epoch * report.iter_per_epoch + report.step,
            report.loss,
            report.lr,
            report.eta_minutes()
        )?;
        w.flush()?;
        Ok(())
    }
}

// ── Reporter ────────────────────────────────────────────────────────────────

pub struct Reporter {
    enabled: bool,
    sink: Option<MetricsSink>,
}

impl Reporter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            sink: None,
        }
    }

    /// Attach a metrics sink. Ignored on non-reporting ranks.
    pub fn with_sink(mut self, sink: MetricsSink) -> Self {
        if self.enabled {
            self.sink = Some(sink);
        }
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Print the progress line and record it. Returns whether anything was emitted.
    pub fn step(&self, report: &StepReport) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }
        tracing::info!(
            epoch = report.epoch + 1,
            step = report.step,
            loss = report.loss,
            lr = report.lr,
            "{}",
            report.line()
        );
        if let Some(sink) = &self.sink {
            sink.record(report)?;
        }
        Ok(true)
    }

    /// Free-form message, reporting process only.
    pub fn info(&self, msg: &str) {
        if self.enabled {
            tracing::info!("{msg}");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn report(step: usize, elapsed: f64) -> StepReport {
        StepReport {
            epoch: 0,
            epochs: 2,
            step,
            iter_per_epoch: 1000,
            loss: 3.14159,
            lr: 5e-4,
            elapsed_secs: elapsed,
        }
    }

    #[test]
    fn line_format() {
        assert_eq!(
            report(100, 30.0).line(),
            "Epoch:[1/2](100/1000) loss:3.142 lr:0.000500000000 epoch_Time:4min:"
        );
    }

    #[test]
    fn eta_floors_both_terms() {
        // 30s / 101 * 1000 ≈ 297s → 4 min; 30s → 0 min.
        assert_eq!(epoch_time_left_minutes(30.0, 100, 1000), 4);
        // 90s elapsed at step 0 of 2 → 180s → 3 min; minus 1 min.
        assert_eq!(epoch_time_left_minutes(90.0, 0, 2), 2);
    }

    #[test]
    fn disabled_reporter_emits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MetricsSink::create(dir.path(), "run").unwrap();
        let reporter = Reporter::new(false).with_sink(sink);
        assert!(!reporter.step(&report(0, 1.0)).unwrap());
        let csv = std::fs::read_to_string(dir.path().join("run.csv")).unwrap();
        assert_eq!(csv.lines().count(), 1);
    }

    #[test]
    fn enabled_reporter_records_to_sink() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MetricsSink::create(dir.path(), "run").unwrap();
        let reporter = Reporter::new(true).with_sink(sink);
        assert!(reporter.step(&report(5, 1.0)).unwrap());
        let csv = std::fs::read_to_string(dir.path().join("run.csv")).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], MetricsSink::HEADER);
        assert!(lines[1].starts_with("0,5,5,"));
    }
}
