//! Run persistence.
//!
//! A finished run produces three artifacts, all named after the experiment's
//! `filename`:
//!
//! - `<stem>.csv`: the trimmed waveform, header `time,signal`, one row per
//!   sample with `time = time_origin_s + i / sample_rate_hz`.
//! - `<stem>.json`: [`RunMetadata`], the config plus a report of the run.
//! - `<stem>_events.json`: the event log records.
//!
//! [`CsvRunSink`] writes them to a directory; [`MemorySink`] keeps them for
//! inspection in tests.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fluor_core::{EventLog, EventRecord};
use serde::Serialize;
use tracing::info;

use crate::acquisition::{AcquisitionResult, StepTiming};
use crate::error::{ProtocolError, ProtocolResult};
use crate::experiment::{ensure_csv_suffix, is_bare_file_name, ExperimentConfig, SampleCounts};
use crate::stop::StopReason;
use crate::timeline::Timeline;

/// Trimmed sample record of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    /// Detector voltages from time zero.
    pub samples: Vec<f64>,
    /// Sample rate.
    pub sample_rate_hz: f64,
    /// Time of the first sample.
    pub time_origin_s: f64,
    /// Output file name.
    pub filename: String,
}

impl Waveform {
    /// Time of sample `index`.
    pub fn time_at(&self, index: usize) -> f64 {
        self.time_origin_s + index as f64 / self.sample_rate_hz
    }

    /// `(time, signal)` pairs.
    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.samples
            .iter()
            .enumerate()
            .map(|(i, &v)| (self.time_at(i), v))
    }
}

/// Summary of how an acquisition went.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Samples in the persisted waveform.
    pub true_sample_count: usize,
    /// Samples expected in the waveform.
    pub nominal_sample_count: usize,
    /// Samples acquired before trimming.
    pub raw_sample_count: usize,
    /// Buffer index of time zero.
    pub data_index: Option<usize>,
    /// Time zero was established.
    pub anchored: bool,
    /// Device dropped samples.
    pub lost: bool,
    /// Device flagged corrupted samples.
    pub corrupted: bool,
    /// Samples dropped.
    pub lost_samples: usize,
    /// Samples flagged corrupted.
    pub corrupted_samples: usize,
    /// The buffer limit was exceeded.
    pub overrun: bool,
    /// Why the acquisition ended.
    pub stop_reason: Option<StopReason>,
    /// Stale samples discarded before the run.
    pub flushed_samples: usize,
    /// Polling iterations.
    pub iterations: u64,
    /// Iterations whose last sample read exactly zero.
    pub zero_sample_warnings: u64,
    /// Scheduling accuracy per step.
    pub timings: Vec<StepTiming>,
}

impl RunReport {
    /// Summarize an acquisition.
    pub fn from_result(result: &AcquisitionResult, nominal_sample_count: usize) -> Self {
        Self {
            true_sample_count: result.true_sample_count,
            nominal_sample_count,
            raw_sample_count: result.raw_sample_count,
            data_index: result.data_index,
            anchored: result.anchored,
            lost: result.lost,
            corrupted: result.corrupted,
            lost_samples: result.lost_samples,
            corrupted_samples: result.corrupted_samples,
            overrun: result.overrun,
            stop_reason: result.stop_reason,
            flushed_samples: result.flushed_samples,
            iterations: result.iterations,
            zero_sample_warnings: result.zero_sample_warnings,
            timings: result.timings.clone(),
        }
    }
}

/// Metadata written next to the waveform.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    /// Version of this software.
    pub software_version: String,
    /// When the run finished.
    pub created_at: DateTime<Utc>,
    /// Experiment parameters.
    pub config: ExperimentConfig,
    /// Derived sample counts.
    pub sample_counts: SampleCounts,
    /// Step offsets used.
    pub timeline: Timeline,
    /// Acquisition summary.
    pub report: RunReport,
}

impl RunMetadata {
    /// Metadata stamped with the current time.
    pub fn new(
        config: ExperimentConfig,
        sample_counts: SampleCounts,
        timeline: Timeline,
        report: RunReport,
    ) -> Self {
        Self {
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            created_at: Utc::now(),
            config,
            sample_counts,
            timeline,
            report,
        }
    }
}

/// Destination for run artifacts.
pub trait RunSink: Send {
    /// Persist the waveform. Returns where it went.
    fn write_waveform(&mut self, waveform: &Waveform) -> ProtocolResult<PathBuf>;

    /// Persist the run metadata, named after `metadata.config.filename`.
    fn write_metadata(&mut self, metadata: &RunMetadata) -> ProtocolResult<PathBuf>;

    /// Persist the event log, named after `filename`.
    fn write_events(&mut self, log: &EventLog, filename: &str) -> ProtocolResult<PathBuf>;
}

/// `record.csv` -> `record`.
fn file_stem(filename: &str) -> String {
    let name = ensure_csv_suffix(filename);
    Path::new(&name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or(name)
}

fn storage_error(context: &str, path: &Path, e: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Storage(format!("{} '{}': {}", context, path.display(), e))
}

// =============================================================================
// CsvRunSink
// =============================================================================

/// Writes run artifacts to a directory.
#[derive(Debug, Clone)]
pub struct CsvRunSink {
    output_dir: PathBuf,
}

impl CsvRunSink {
    /// Sink writing under `output_dir`, created on first write.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Target directory.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn prepare(&self, name: String) -> ProtocolResult<PathBuf> {
        if !is_bare_file_name(&name) {
            return Err(ProtocolError::Storage(format!(
                "'{}' is not a plain file name inside '{}'",
                name,
                self.output_dir.display()
            )));
        }
        if !self.output_dir.exists() {
            fs::create_dir_all(&self.output_dir)
                .map_err(|e| storage_error("Failed to create output directory", &self.output_dir, e))?;
        }
        Ok(self.output_dir.join(name))
    }

    fn write_json<T: Serialize>(&self, name: String, value: &T) -> ProtocolResult<PathBuf> {
        let path = self.prepare(name)?;
        let file = File::create(&path).map_err(|e| storage_error("Failed to create", &path, e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), value)
            .map_err(|e| storage_error("Failed to write", &path, e))?;
        Ok(path)
    }
}

impl RunSink for CsvRunSink {
    fn write_waveform(&mut self, waveform: &Waveform) -> ProtocolResult<PathBuf> {
        #[cfg(not(feature = "storage_csv"))]
        {
            let _ = waveform;
            return Err(ProtocolError::FeatureNotEnabled("storage_csv".to_string()));
        }

        #[cfg(feature = "storage_csv")]
        {
            let path = self.prepare(ensure_csv_suffix(&waveform.filename))?;
            let mut writer = csv::Writer::from_path(&path)
                .map_err(|e| storage_error("Failed to create CSV file", &path, e))?;
            writer
                .write_record(["time", "signal"])
                .map_err(|e| storage_error("Failed to write", &path, e))?;
            for (time, signal) in waveform.points() {
                writer
                    .write_record([time.to_string(), signal.to_string()])
                    .map_err(|e| storage_error("Failed to write", &path, e))?;
            }
            writer
                .flush()
                .map_err(|e| storage_error("Failed to flush", &path, e))?;

            info!(
                path = %path.display(),
                samples = waveform.samples.len(),
                "Waveform saved"
            );
            Ok(path)
        }
    }

    fn write_metadata(&mut self, metadata: &RunMetadata) -> ProtocolResult<PathBuf> {
        let name = format!("{}.json", file_stem(&metadata.config.filename));
        let path = self.write_json(name, metadata)?;
        info!(path = %path.display(), "Run metadata saved");
        Ok(path)
    }

    fn write_events(&mut self, log: &EventLog, filename: &str) -> ProtocolResult<PathBuf> {
        let name = format!("{}_events.json", file_stem(filename));
        let path = self.write_json(name, &log.to_records())?;
        info!(path = %path.display(), events = log.len(), "Event log saved");
        Ok(path)
    }
}

// =============================================================================
// MemorySink
// =============================================================================

/// Keeps run artifacts in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    waveforms: Vec<Waveform>,
    metadata: Vec<serde_json::Value>,
    events: Vec<Vec<EventRecord>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Waveforms written so far.
    pub fn waveforms(&self) -> &[Waveform] {
        &self.waveforms
    }

    /// Metadata records as JSON values.
    pub fn metadata(&self) -> &[serde_json::Value] {
        &self.metadata
    }

    /// Event logs as serialized records.
    pub fn events(&self) -> &[Vec<EventRecord>] {
        &self.events
    }
}

impl RunSink for MemorySink {
    fn write_waveform(&mut self, waveform: &Waveform) -> ProtocolResult<PathBuf> {
        self.waveforms.push(waveform.clone());
        Ok(PathBuf::from(ensure_csv_suffix(&waveform.filename)))
    }

    fn write_metadata(&mut self, metadata: &RunMetadata) -> ProtocolResult<PathBuf> {
        let value = serde_json::to_value(metadata)
            .map_err(|e| ProtocolError::Storage(format!("Failed to serialize metadata: {}", e)))?;
        self.metadata.push(value);
        Ok(PathBuf::from(format!("{}.json", file_stem(&metadata.config.filename))))
    }

    fn write_events(&mut self, log: &EventLog, filename: &str) -> ProtocolResult<PathBuf> {
        self.events.push(log.to_records());
        Ok(PathBuf::from(format!("{}_events.json", file_stem(filename))))
    }
}
