//! Per-run event timeline.
//!
//! An [`EventLog`] records `(elapsed seconds, label)` pairs against a
//! [`Clock`]. [`EventLog::start`] anchors t = 0 and always becomes the first
//! entry; every later entry is relative to that anchor. Scheduled protocol
//! steps additionally attach an [`ActionTiming`] so the scheduling latency of
//! each step can be checked after the run.
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fluor_core::{Clock, EventLog, SimulatedClock};
//!
//! let clock = Arc::new(SimulatedClock::new());
//! let mut log = EventLog::new(clock.clone());
//! log.start("protocol_start");
//! clock.sleep(Duration::from_millis(250));
//! log.log("shutter_opened").unwrap();
//!
//! assert_eq!(log.time_of("shutter_opened"), Some(0.25));
//! ```

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::EventLogError;

/// Scheduling accuracy of one protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionTiming {
    /// Offset from time zero the step was scheduled for.
    pub scheduled_s: f64,
    /// Offset from time zero at which the step completed.
    pub actual_s: f64,
    /// `actual_s - scheduled_s`.
    pub latency_s: f64,
}

impl ActionTiming {
    /// Build a timing record from the scheduled and observed offsets.
    pub fn new(scheduled_s: f64, actual_s: f64) -> Self {
        Self {
            scheduled_s,
            actual_s,
            latency_s: actual_s - scheduled_s,
        }
    }
}

/// One entry of the timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Seconds since the start anchor.
    pub elapsed_s: f64,
    /// Event label.
    pub label: String,
    /// Scheduling detail, present for timed protocol steps.
    pub timing: Option<ActionTiming>,
}

/// Serialized form of an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Seconds since the start anchor, rounded to microseconds.
    pub time_s: f64,
    /// Event label.
    pub label: String,
    /// Scheduling detail, omitted when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<ActionTiming>,
}

/// Append-only timeline of labelled events.
#[derive(Debug, Clone)]
pub struct EventLog {
    clock: Arc<dyn Clock>,
    anchor: Option<f64>,
    events: Vec<Event>,
}

impl EventLog {
    /// Create an empty, unstarted log reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            anchor: None,
            events: Vec::new(),
        }
    }

    /// Reset the timeline and anchor t = 0 now, recording `label` at 0.0.
    ///
    /// Calling `start` again discards all previous entries.
    pub fn start(&mut self, label: impl Into<String>) {
        self.events.clear();
        self.anchor = Some(self.clock.now());
        self.events.push(Event {
            elapsed_s: 0.0,
            label: label.into(),
            timing: None,
        });
    }

    /// True once [`start`](Self::start) has been called.
    pub fn is_started(&self) -> bool {
        self.anchor.is_some()
    }

    /// Append `label` at the current elapsed time.
    pub fn log(&mut self, label: impl Into<String>) -> Result<f64, EventLogError> {
        self.push(label.into(), None)
    }

    /// Append `label` with a scheduling record.
    ///
    /// `scheduled_s` and `actual_s` are offsets from the protocol's time
    /// zero, which need not coincide with this log's start anchor.
    pub fn log_timing(
        &mut self,
        label: impl Into<String>,
        scheduled_s: f64,
        actual_s: f64,
    ) -> Result<f64, EventLogError> {
        self.push(label.into(), Some(ActionTiming::new(scheduled_s, actual_s)))
    }

    fn push(&mut self, label: String, timing: Option<ActionTiming>) -> Result<f64, EventLogError> {
        let Some(anchor) = self.anchor else {
            return Err(EventLogError::NotStarted { label });
        };
        let elapsed_s = self.clock.now() - anchor;
        debug!(label = %label, elapsed_s, "event");
        self.events.push(Event {
            elapsed_s,
            label,
            timing,
        });
        Ok(elapsed_s)
    }

    /// Elapsed time of the first entry labelled `label`.
    pub fn time_of(&self, label: &str) -> Option<f64> {
        self.events
            .iter()
            .find(|event| event.label == label)
            .map(|event| event.elapsed_s)
    }

    /// Like [`time_of`](Self::time_of) but a missing label is an error.
    pub fn require(&self, label: &str) -> Result<f64, EventLogError> {
        self.time_of(label)
            .ok_or_else(|| EventLogError::MissingEvent(label.to_string()))
    }

    /// All entries in insertion order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Entries in their serialized form.
    pub fn to_records(&self) -> Vec<EventRecord> {
        self.events
            .iter()
            .map(|event| EventRecord {
                time_s: round_micros(event.elapsed_s),
                label: event.label.clone(),
                timing: event.timing,
            })
            .collect()
    }

    /// Serialize the timeline as a JSON array of records.
    pub fn to_json(&self) -> Result<String, EventLogError> {
        Ok(serde_json::to_string_pretty(&self.to_records())?)
    }

    /// Rebuild a log from serialized records.
    ///
    /// Records that are not objects with a numeric `time_s` and a string
    /// `label` are skipped. The rebuilt log is anchored so that the current
    /// clock time lines up with its latest entry; further
    /// [`log`](Self::log) calls append after the restored timeline.
    pub fn from_records(clock: Arc<dyn Clock>, records: &[serde_json::Value]) -> Self {
        let mut log = Self::new(clock);
        for (index, value) in records.iter().enumerate() {
            match EventRecord::deserialize(value) {
                Ok(record) => log.events.push(Event {
                    elapsed_s: record.time_s,
                    label: record.label,
                    timing: record.timing,
                }),
                Err(e) => warn!(index, error = %e, "Skipping malformed event record"),
            }
        }
        let latest = log
            .events
            .iter()
            .map(|event| event.elapsed_s)
            .fold(0.0_f64, f64::max);
        log.anchor = Some(log.clock.now() - latest);
        log
    }

    /// Parse a JSON array produced by [`to_json`](Self::to_json).
    pub fn from_json(clock: Arc<dyn Clock>, json: &str) -> Result<Self, EventLogError> {
        let values: Vec<serde_json::Value> = serde_json::from_str(json)?;
        Ok(Self::from_records(clock, &values))
    }

    /// Write the timeline as pretty-printed JSON.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), EventLogError> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(writer, &self.to_records())?;
        Ok(())
    }

    /// Load a timeline written by [`save_to_file`](Self::save_to_file).
    pub fn load_from_file(
        clock: Arc<dyn Clock>,
        path: impl AsRef<Path>,
    ) -> Result<Self, EventLogError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let values: Vec<serde_json::Value> = serde_json::from_reader(reader)?;
        Ok(Self::from_records(clock, &values))
    }
}

impl fmt::Display for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, event) in self.events.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{:.6}s - {}", event.elapsed_s, event.label)?;
        }
        Ok(())
    }
}

fn round_micros(seconds: f64) -> f64 {
    (seconds * 1e6).round() / 1e6
}
