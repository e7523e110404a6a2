//! # fluor-daq
//!
//! Sample-synchronized controller for fluorescence-induction experiments.
//! A red actinic LED pulse, a shutter and a green measuring LED are switched
//! in a fixed protocol while a photodiode is sampled continuously; every
//! switch is placed against the sample stream so the saved waveform starts
//! exactly when the actinic light came on.
//!
//! ## Crate Structure
//!
//! - **`experiment`**: [`ExperimentConfig`](experiment::ExperimentConfig),
//!   validation and sample-count derivation.
//! - **`led`**: intensity percent to drive voltage.
//! - **`timeline`**: protocol steps and their offsets from time zero.
//! - **`action`**: scheduled, execute-once hardware operations.
//! - **`stop`**: the run stop signal shared with cancel callers.
//! - **`acquisition`**: the polling loop that reads samples, fires actions,
//!   re-anchors time zero and trims the waveform.
//! - **`orchestrator`**: one complete run, from validation to persistence.
//! - **`storage`**: CSV waveform, JSON metadata and event-log sinks.
//! - **`config`**: layered application configuration (TOML + environment).
//! - **`logging`**: tracing subscriber setup for the binary.
//! - **`error`**: the [`ProtocolError`](error::ProtocolError) type.
//!
//! Hardware access goes through [`fluor_core::HardwarePort`]; the simulated
//! instrument lives in `fluor-driver-mock`.

pub mod acquisition;
pub mod action;
pub mod config;
pub mod error;
pub mod experiment;
pub mod led;
pub mod logging;
pub mod orchestrator;
pub mod stop;
pub mod storage;
pub mod timeline;

pub use acquisition::{AcquisitionResult, AcquisitionSession, AcquisitionSettings, SessionState};
pub use error::{ProtocolError, ProtocolResult};
pub use experiment::ExperimentConfig;
pub use orchestrator::{CancelHandle, OrchestratorOptions, ProtocolOrchestrator, ProtocolOutcome};
pub use stop::{StopReason, StopSignal};
pub use storage::{CsvRunSink, MemorySink, RunMetadata, RunReport, RunSink, Waveform};
pub use timeline::{Step, Timeline};
