//! Scalar metric logging.
//!
//! Drivers log named scalars (`loss`, `epoch time consumption`, `test loss`,
//! `test accuracy`) through a [`RunLog`], which numbers them and fans them out
//! to any number of [`MetricSink`]s, optionally keeping an in-memory history.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Per-minibatch training loss.
pub const LOSS: &str = "loss";
/// Wall-clock seconds spent in one training epoch.
pub const EPOCH_TIME: &str = "epoch time consumption";
/// Mean test-set loss.
pub const TEST_LOSS: &str = "test loss";
/// Test-set accuracy in `[0, 1]`.
pub const TEST_ACCURACY: &str = "test accuracy";

/// One logged scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Sequence number within the run, starting at 0.
    pub step: usize,
    /// Metric name.
    pub name: String,
    /// Value.
    pub value: f64,
}

/// Destination for metric records.
pub trait MetricSink {
    /// Consume one record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn record(&mut self, record: &MetricRecord) -> Result<()>;

    /// Flush buffered output.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Emits records as tracing events. Per-step losses go to `debug`, the rest
/// to `info`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&mut self, record: &MetricRecord) -> Result<()> {
        if record.name == LOSS {
            tracing::debug!(step = record.step, "{}: {:.6}", record.name, record.value);
        } else {
            tracing::info!(step = record.step, "{}: {:.6}", record.name, record.value);
        }
        Ok(())
    }
}

/// Appends one JSON object per record to a file.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Create (or truncate) `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = Some(open_truncated(&path)?);
        Ok(Self { path, writer })
    }

    /// A sink that creates `path` only when the first record arrives, so a
    /// run that fails before logging anything leaves an existing file alone.
    #[must_use]
    pub fn deferred<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: None,
        }
    }

    /// Output file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_truncated(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

impl MetricSink for JsonLinesSink {
    fn record(&mut self, record: &MetricRecord) -> Result<()> {
        if self.writer.is_none() {
            self.writer = Some(open_truncated(&self.path)?);
        }
        if let Some(writer) = &mut self.writer {
            serde_json::to_writer(&mut *writer, record)?;
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}

/// In-memory history of records.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct MetricsRecorder {
    records: Vec<MetricRecord>,
}

impl MetricsRecorder {
    /// All records in logging order.
    #[must_use]
    pub fn records(&self) -> &[MetricRecord] {
        &self.records
    }

    /// Values logged under `name`, in order.
    #[must_use]
    pub fn values(&self, name: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter(|r| r.name == name)
            .map(|r| r.value)
            .collect()
    }

    /// Most recent value logged under `name`.
    #[must_use]
    pub fn last(&self, name: &str) -> Option<f64> {
        self.records
            .iter()
            .rev()
            .find(|r| r.name == name)
            .map(|r| r.value)
    }

    /// Serialize the history as a JSON array.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.records)?)
    }
}

impl MetricSink for MetricsRecorder {
    fn record(&mut self, record: &MetricRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }
}

/// Metric stream of one training run.
pub struct RunLog {
    step: usize,
    keep_history: bool,
    history: MetricsRecorder,
    sinks: Vec<Box<dyn MetricSink>>,
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLog {
    /// A log that keeps the in-memory history.
    #[must_use]
    pub fn new() -> Self {
        Self {
            step: 0,
            keep_history: true,
            history: MetricsRecorder::default(),
            sinks: Vec::new(),
        }
    }

    /// Stop keeping records in memory; only the sinks see them.
    #[must_use]
    pub const fn without_history(mut self) -> Self {
        self.keep_history = false;
        self
    }

    /// Add a sink.
    #[must_use]
    pub fn with_sink(mut self, sink: impl MetricSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Log one scalar.
    ///
    /// # Errors
    ///
    /// Returns an error if a sink fails.
    pub fn log(&mut self, name: &str, value: f64) -> Result<()> {
        let record = MetricRecord {
            step: self.step,
            name: name.to_string(),
            value,
        };
        self.step += 1;
        if self.keep_history {
            self.history.record(&record)?;
        }
        for sink in &mut self.sinks {
            sink.record(&record)?;
        }
        Ok(())
    }

    /// Flush every sink.
    ///
    /// # Errors
    ///
    /// Returns an error if a sink fails.
    pub fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }

    /// Everything logged so far. Empty when built
    /// [`without_history`](Self::without_history).
    #[must_use]
    pub const fn history(&self) -> &MetricsRecorder {
        &self.history
    }
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog")
            .field("step", &self.step)
            .field("keep_history", &self.keep_history)
            .field("records", &self.history.records.len())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_run_log_numbers_records() {
        let mut log = RunLog::new();
        log.log(LOSS, 2.0).unwrap();
        log.log(LOSS, 1.5).unwrap();
        log.log(TEST_ACCURACY, 0.5).unwrap();

        let history = log.history();
        assert_eq!(history.records().len(), 3);
        assert_eq!(history.records()[2].step, 2);
        assert_eq!(history.values(LOSS), vec![2.0, 1.5]);
        assert_eq!(history.last(LOSS), Some(1.5));
        assert_eq!(history.last(TEST_LOSS), None);
    }

    #[test]
    fn test_json_lines_sink_writes_one_object_per_line() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("metrics.jsonl");
        let sink = JsonLinesSink::create(&path).unwrap();
        assert_eq!(sink.path(), path.as_path());

        let mut log = RunLog::new().with_sink(sink).with_sink(TracingSink);
        log.log(LOSS, 0.25).unwrap();
        log.log(EPOCH_TIME, 1.0).unwrap();
        log.flush().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let records: Vec<MetricRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].name, EPOCH_TIME);
        assert_eq!(records[0].value, 0.25);
    }

    #[test]
    fn test_run_log_without_history_still_feeds_sinks() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metrics.jsonl");
        let mut log = RunLog::new()
            .without_history()
            .with_sink(JsonLinesSink::create(&path).unwrap());
        for i in 0..5 {
            log.log(LOSS, f64::from(i)).unwrap();
        }
        log.flush().unwrap();

        assert!(log.history().records().is_empty());
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 5);
    }

    #[test]
    fn test_deferred_sink_leaves_file_until_first_record() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("runs").join("metrics.jsonl");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{\"step\":0,\"name\":\"loss\",\"value\":1.0}\n").unwrap();

        let mut sink = JsonLinesSink::deferred(&path);
        sink.flush().unwrap();
        drop(sink);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);

        let mut log = RunLog::new().with_sink(JsonLinesSink::deferred(&path));
        log.log(TEST_LOSS, 0.5).unwrap();
        log.log(TEST_ACCURACY, 0.9).unwrap();
        log.flush().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("test accuracy"));
    }

    #[test]
    fn test_recorder_to_json() {
        let mut recorder = MetricsRecorder::default();
        recorder
            .record(&MetricRecord {
                step: 0,
                name: TEST_LOSS.into(),
                value: 0.75,
            })
            .unwrap();
        let json = recorder.to_json().unwrap();
        assert!(json.contains("test loss"));
        let parsed: Vec<MetricRecord> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, recorder.records());
    }
}
