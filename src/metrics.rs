//! Metric sinks and accuracy bookkeeping
//!
//! The aligner never talks to a global tracker. It reports through a
//! [`MetricSink`] handed in by the caller: plain text logs in the run
//! directory, `tracing` events, an in-memory record for tests, or several
//! of those at once.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

pub const PREALIGN_ACCURACY: &str = "eval/prealign_accuracy";
pub const EVAL_ACCURACY: &str = "eval/accuracy";
pub const TEST_ACCURACY: &str = "test/accuracy";
pub const TRAIN_LOSS: &str = "train/loss";
pub const TRAIN_STEP_ACCURACY: &str = "train/step_accuracy";
pub const TRAIN_TEMPERATURE: &str = "train/temperature";
pub const TRAIN_BOUNDARY0: &str = "train/boundary0";
pub const TRAIN_BOUNDARY1: &str = "train/boundary1";

pub const PREALIGN_LOG: &str = "prealign_log.txt";
pub const TRAIN_LOG: &str = "train_log.txt";
pub const EVAL_LOG: &str = "eval_log.txt";

/// Destination for scalar metrics
pub trait MetricSink {
    fn log_metric(&mut self, name: &str, value: f64, step: usize) -> Result<()>;

    /// One training log line (loss and step accuracy)
    fn log_train_step(&mut self, step: usize, loss: f64, accuracy: f64) -> Result<()>;

    /// Called once before the first training step
    fn start_training(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once when the run is over
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Comma-separated text logs in a run directory
pub struct TextLogSink {
    dir: PathBuf,
}

impl TextLogSink {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_fresh(&self, file: &str, line: &str) -> Result<()> {
        let path = self.dir.join(file);
        fs::write(&path, format!("{line}\n"))
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    fn append(&self, file: &str, line: &str) -> Result<()> {
        let path = self.dir.join(file);
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        writeln!(handle, "{line}")?;
        Ok(())
    }
}

impl MetricSink for TextLogSink {
    fn log_metric(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        match name {
            PREALIGN_ACCURACY => self.write_fresh(PREALIGN_LOG, &format!("prealign_accuracy,{value}")),
            EVAL_ACCURACY | TEST_ACCURACY => self.append(EVAL_LOG, &format!("{step},{value}")),
            _ => Ok(()),
        }
    }

    fn log_train_step(&mut self, step: usize, loss: f64, accuracy: f64) -> Result<()> {
        self.append(TRAIN_LOG, &format!("{step},{loss},{accuracy}"))
    }

    fn start_training(&mut self) -> Result<()> {
        self.write_fresh(TRAIN_LOG, "step,loss,accuracy")?;
        self.write_fresh(EVAL_LOG, "step,accuracy")
    }
}

/// Emits every metric as a `tracing` event
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn log_metric(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        if name.starts_with("train/") {
            debug!(metric = name, value, step, "metric");
        } else {
            info!(metric = name, value, step, "metric");
        }
        Ok(())
    }

    fn log_train_step(&mut self, step: usize, loss: f64, accuracy: f64) -> Result<()> {
        info!("step {step}: loss {loss:.4}, accuracy {accuracy:.2}");
        Ok(())
    }
}

/// Records everything in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pub metrics: Vec<(String, f64, usize)>,
    pub train_steps: Vec<(usize, f64, f64)>,
    pub started: bool,
    pub finished: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(step, value)` pairs recorded under `name`
    pub fn values(&self, name: &str) -> Vec<(usize, f64)> {
        self.metrics
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|(_, v, s)| (*s, *v))
            .collect()
    }

    pub fn last(&self, name: &str) -> Option<f64> {
        self.values(name).last().map(|(_, v)| *v)
    }
}

impl MetricSink for MemorySink {
    fn log_metric(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.metrics.push((name.to_string(), value, step));
        Ok(())
    }

    fn log_train_step(&mut self, step: usize, loss: f64, accuracy: f64) -> Result<()> {
        self.train_steps.push((step, loss, accuracy));
        Ok(())
    }

    fn start_training(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

/// Forwards to several sinks in order
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<Box<dyn MetricSink>>,
}

impl SinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl MetricSink for SinkSet {
    fn log_metric(&mut self, name: &str, value: f64, step: usize) -> Result<()> {
        self.sinks
            .iter_mut()
            .try_for_each(|s| s.log_metric(name, value, step))
    }

    fn log_train_step(&mut self, step: usize, loss: f64, accuracy: f64) -> Result<()> {
        self.sinks
            .iter_mut()
            .try_for_each(|s| s.log_train_step(step, loss, accuracy))
    }

    fn start_training(&mut self) -> Result<()> {
        self.sinks.iter_mut().try_for_each(|s| s.start_training())
    }

    fn finish(&mut self) -> Result<()> {
        self.sinks.iter_mut().try_for_each(|s| s.finish())
    }
}

/// Case-insensitive exact match of decoded strings
pub fn exact_match(prediction: &str, target: &str) -> bool {
    prediction.trim().to_lowercase() == target.trim().to_lowercase()
}

/// Running correct/total counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accuracy {
    pub correct: usize,
    pub total: usize,
}

impl Accuracy {
    pub fn record(&mut self, correct: bool) {
        self.total += 1;
        if correct {
            self.correct += 1;
        }
    }

    /// Score prediction/target string pairs
    pub fn record_pairs<'a>(&mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) {
        for (prediction, target) in pairs {
            self.record(exact_match(prediction, target));
        }
    }

    pub fn merge(&mut self, other: Accuracy) {
        self.correct += other.correct;
        self.total += other.total;
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Fraction correct; 0.0 when nothing was scored
    pub fn value(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    /// Fraction correct rounded to two decimals, as reported in logs
    pub fn rounded(&self) -> f64 {
        (self.value() * 100.0).round() / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_ignores_case_and_whitespace() {
        assert!(exact_match(" Yes", "yes"));
        assert!(exact_match("NO\n", "no"));
        assert!(!exact_match("Yes", "No"));
        assert!(!exact_match("Yess", "Yes"));
    }

    #[test]
    fn test_accuracy_empty_is_zero() {
        let acc = Accuracy::default();
        assert!(acc.is_empty());
        assert_eq!(acc.value(), 0.0);
    }

    #[test]
    fn test_accuracy_invariant_under_shuffling() {
        let pairs = [("Yes", "yes"), ("No", "Yes"), ("no", "No"), ("Yes", "No")];
        let mut forward = Accuracy::default();
        forward.record_pairs(pairs.iter().copied());

        let mut reversed = Accuracy::default();
        reversed.record_pairs(pairs.iter().rev().copied());

        // Split across two "batches" in a different order
        let mut split = Accuracy::default();
        let mut first = Accuracy::default();
        first.record_pairs([pairs[2], pairs[0]]);
        let mut second = Accuracy::default();
        second.record_pairs([pairs[3], pairs[1]]);
        split.merge(second);
        split.merge(first);

        assert_eq!(forward.value(), 0.5);
        assert_eq!(forward, reversed);
        assert_eq!(forward, split);
    }

    #[test]
    fn test_rounded() {
        let acc = Accuracy {
            correct: 2,
            total: 3,
        };
        assert_eq!(acc.rounded(), 0.67);
    }

    #[test]
    fn test_text_log_sink_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = TextLogSink::new(dir.path()).unwrap();
        sink.log_metric(PREALIGN_ACCURACY, 0.75, 0).unwrap();
        sink.start_training().unwrap();
        sink.log_train_step(0, 1.5, 0.5).unwrap();
        sink.log_metric(TRAIN_TEMPERATURE, 50.0, 0).unwrap();
        sink.log_metric(EVAL_ACCURACY, 0.5, 10).unwrap();
        sink.log_metric(TEST_ACCURACY, 0.25, 20).unwrap();

        let read = |name: &str| fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read(PREALIGN_LOG), "prealign_accuracy,0.75\n");
        assert_eq!(read(TRAIN_LOG), "step,loss,accuracy\n0,1.5,0.5\n");
        assert_eq!(read(EVAL_LOG), "step,accuracy\n10,0.5\n20,0.25\n");
    }

    #[test]
    fn test_sink_set_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = SinkSet::new()
            .with(TracingSink)
            .with(TextLogSink::new(dir.path()).unwrap());
        set.log_metric(PREALIGN_ACCURACY, 1.0, 0).unwrap();
        set.finish().unwrap();
        assert!(dir.path().join(PREALIGN_LOG).is_file());
    }

    #[test]
    fn test_memory_sink_lookup() {
        let mut sink = MemorySink::new();
        sink.log_metric(EVAL_ACCURACY, 0.1, 5).unwrap();
        sink.log_metric(EVAL_ACCURACY, 0.3, 10).unwrap();
        sink.log_metric(TEST_ACCURACY, 0.2, 10).unwrap();
        assert_eq!(sink.values(EVAL_ACCURACY), vec![(5, 0.1), (10, 0.3)]);
        assert_eq!(sink.last(TEST_ACCURACY), Some(0.2));
        assert_eq!(sink.last(TRAIN_LOSS), None);
    }
}
