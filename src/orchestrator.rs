//! Protocol orchestration.
//!
//! [`ProtocolOrchestrator`] runs one complete fluorescence-induction
//! protocol: it validates the experiment, puts the instrument in a known
//! state, builds the timeline and actions, drives an [`AcquisitionSession`],
//! returns the instrument to a safe state and persists the results.
//!
//! The shutter is closed and both LEDs are switched off on every exit path
//! once hardware has been touched, including after a hardware error. Cleanup
//! failures are logged and never replace the original error.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fluor_core::{Clock, EventLog, HardwarePort};
use tracing::{error, info, warn};

use crate::acquisition::{
    AcquisitionResult, AcquisitionSession, AcquisitionSettings, DEFAULT_BUFFER_MULTIPLIER,
};
use crate::action::{build_actions, validate_actions};
use crate::error::ProtocolResult;
use crate::experiment::{ensure_csv_suffix, ExperimentConfig, SampleCounts};
use crate::stop::{StopReason, StopSignal};
use crate::storage::{RunMetadata, RunReport, RunSink, Waveform};
use crate::timeline::Timeline;

/// Acquisition tuning applied to every run.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorOptions {
    /// Analog input channel of the photodiode.
    pub channel: u32,
    /// Sleep between idle polls.
    pub idle_wait: Duration,
    /// Bound on the wait for the first sample.
    pub first_data_timeout: Duration,
    /// Buffer capacity as a multiple of the acquisition budget.
    pub buffer_multiplier: usize,
    /// Cycle the shutter once before the run and log its latency.
    pub diagnostic_shutter_cycle: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            channel: fluor_core::hardware::pins::ANALOG_IN,
            idle_wait: Duration::from_millis(1),
            first_data_timeout: Duration::from_secs(5),
            buffer_multiplier: DEFAULT_BUFFER_MULTIPLIER,
            diagnostic_shutter_cycle: false,
        }
    }
}

/// Cloneable handle that cancels the run in progress from any thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    stop: StopSignal,
}

impl CancelHandle {
    /// Ask the running protocol to stop. The acquisition ends within one
    /// polling iteration and the partial data is still persisted.
    pub fn cancel(&self) {
        if self.stop.request(StopReason::Cancelled) {
            info!("Protocol cancellation requested");
        }
    }

    /// True once a stop has been requested for the current run.
    pub fn is_requested(&self) -> bool {
        self.stop.is_requested()
    }
}

/// Everything a finished run produced.
#[derive(Debug)]
pub struct ProtocolOutcome {
    /// Where the waveform was written.
    pub data_path: PathBuf,
    /// Where the metadata was written.
    pub metadata_path: PathBuf,
    /// Where the event log was written.
    pub events_path: PathBuf,
    /// Trimmed waveform.
    pub waveform: Waveform,
    /// Acquisition summary.
    pub report: RunReport,
    /// Timeline of the run.
    pub event_log: EventLog,
    /// Step offsets used.
    pub timeline: Timeline,
    /// Derived sample counts.
    pub sample_counts: SampleCounts,
}

impl ProtocolOutcome {
    /// True if the run was cancelled before `end_recording`.
    pub fn is_cancelled(&self) -> bool {
        self.report.stop_reason == Some(StopReason::Cancelled)
    }

    /// Human-readable result line.
    pub fn message(&self) -> String {
        let path = self.data_path.display();
        if self.is_cancelled() {
            format!("Protocol cancelled. Partial data saved to {}", path)
        } else if self.report.overrun {
            format!(
                "Protocol stopped on buffer overrun. Partial data saved to {}",
                path
            )
        } else {
            format!("Protocol completed successfully. Data saved to {}", path)
        }
    }
}

impl fmt::Display for ProtocolOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Runs protocols on one instrument, writing results to one sink.
pub struct ProtocolOrchestrator<P: HardwarePort, S: RunSink> {
    port: P,
    sink: S,
    clock: Arc<dyn Clock>,
    stop: StopSignal,
    options: OrchestratorOptions,
}

impl<P: HardwarePort, S: RunSink> ProtocolOrchestrator<P, S> {
    /// Create an orchestrator with default options.
    pub fn new(port: P, sink: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            port,
            sink,
            clock,
            stop: StopSignal::new(),
            options: OrchestratorOptions::default(),
        }
    }

    /// Replace the acquisition options.
    pub fn with_options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    /// Handle for cancelling runs from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            stop: self.stop.clone(),
        }
    }

    /// The instrument.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// The result sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Options in use.
    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Take back the instrument and sink.
    pub fn into_parts(self) -> (P, S) {
        (self.port, self.sink)
    }

    /// Run one protocol.
    ///
    /// Configuration errors are returned before any hardware command is
    /// issued. A cancelled run or a buffer overrun is not an error: the
    /// partial data is persisted and flagged in the outcome.
    ///
    /// A cancel issued through a [`CancelHandle`] before the run starts
    /// applies to it; the stop signal is cleared once the run has ended.
    pub fn run_protocol(&mut self, config: &ExperimentConfig) -> ProtocolResult<ProtocolOutcome> {
        let outcome = self.run_once(config);
        self.stop.reset();
        outcome
    }

    fn run_once(&mut self, config: &ExperimentConfig) -> ProtocolResult<ProtocolOutcome> {
        config.validate()?;
        let counts = config.sample_counts()?;

        let mut log = EventLog::new(Arc::clone(&self.clock));
        log.start("protocol_start");
        info!(
            recording_hz = config.recording_hz,
            protocol_s = counts.protocol_duration_s,
            nominal_samples = counts.nominal,
            acquisition_budget = counts.acquisition_budget,
            "Starting protocol"
        );

        let run = self.execute(config, &counts, &mut log);
        self.make_safe(&mut log, run.is_err());
        let (result, timeline) = run?;

        self.persist(config, counts, timeline, result, log)
    }

    fn execute(
        &mut self,
        config: &ExperimentConfig,
        counts: &SampleCounts,
        log: &mut EventLog,
    ) -> ProtocolResult<(AcquisitionResult, Timeline)> {
        self.port.all_leds_off()?;
        self.port.set_shutter(false)?;
        log.log("hardware_initialized")?;

        if self.options.diagnostic_shutter_cycle {
            self.shutter_diagnostic(log)?;
        }

        let timeline = Timeline::from_config(config);
        let mut actions = build_actions(config, &timeline)?;
        validate_actions(&actions)?;

        let settings = AcquisitionSettings {
            channel: self.options.channel,
            idle_wait: self.options.idle_wait,
            first_data_timeout: self.options.first_data_timeout,
            buffer_multiplier: self.options.buffer_multiplier,
            ..AcquisitionSettings::from_config(config, counts)
        };
        let session = AcquisitionSession::new(settings, Arc::clone(&self.clock));
        let result = session.run(&mut self.port, &mut actions, &self.stop, log)?;

        Ok((result, timeline))
    }

    fn shutter_diagnostic(&mut self, log: &mut EventLog) -> ProtocolResult<()> {
        let before = self.clock.now();
        self.port.set_shutter(true)?;
        let opened = log.log("shutter_diag_opened")?;
        let mid = self.clock.now();
        self.port.set_shutter(false)?;
        log.log("shutter_diag_closed")?;
        let after = self.clock.now();

        info!(
            open_ms = (mid - before) * 1e3,
            close_ms = (after - mid) * 1e3,
            opened_at_s = opened,
            "Shutter diagnostic cycle"
        );
        Ok(())
    }

    /// Close the shutter and switch the LEDs off, and stop the acquisition
    /// too if the run failed.
    fn make_safe(&mut self, log: &mut EventLog, failed: bool) {
        if failed {
            if let Err(e) = self.port.stop_acquisition() {
                warn!(error = %e, "Failed to stop acquisition during cleanup");
            }
        }
        if let Err(e) = self.port.set_shutter(false) {
            error!(error = %e, "Failed to close shutter during cleanup");
        }
        if let Err(e) = self.port.all_leds_off() {
            error!(error = %e, "Failed to switch LEDs off during cleanup");
        }
        if let Err(e) = log.log("hardware_safe") {
            warn!(error = %e, "Failed to log cleanup");
        }
    }

    fn persist(
        &mut self,
        config: &ExperimentConfig,
        counts: SampleCounts,
        timeline: Timeline,
        result: AcquisitionResult,
        mut log: EventLog,
    ) -> ProtocolResult<ProtocolOutcome> {
        let report = RunReport::from_result(&result, counts.nominal);
        if report.lost || report.corrupted {
            warn!(
                lost = report.lost_samples,
                corrupted = report.corrupted_samples,
                "Run completed with sample faults"
            );
        }

        let waveform = Waveform {
            samples: result.samples,
            sample_rate_hz: f64::from(config.recording_hz),
            time_origin_s: 0.0,
            filename: ensure_csv_suffix(&config.filename),
        };
        log.log("protocol_complete")?;

        let data_path = self.sink.write_waveform(&waveform)?;
        let metadata = RunMetadata::new(config.clone(), counts, timeline.clone(), report.clone());
        let metadata_path = self.sink.write_metadata(&metadata)?;
        let events_path = self.sink.write_events(&log, &waveform.filename)?;

        let outcome = ProtocolOutcome {
            data_path,
            metadata_path,
            events_path,
            waveform,
            report,
            event_log: log,
            timeline,
            sample_counts: counts,
        };
        info!(
            samples = outcome.report.true_sample_count,
            stop_reason = ?outcome.report.stop_reason,
            "{}",
            outcome.message()
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySink;
    use fluor_core::hardware::pins;
    use fluor_core::SimulatedClock;
    use fluor_driver_mock::{ErrorConfig, ErrorScenario, MockPort, PortOp};

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            recording_hz: 1000,
            ared_duration_s: 0.2,
            wait_after_ared_s: 0.05,
            agreen_delay_s: 0.01,
            agreen_duration_s: 0.2,
            filename: "leaf.csv".to_string(),
            ..Default::default()
        }
    }

    fn orchestrator(
        port: impl FnOnce(Arc<dyn Clock>) -> MockPort,
    ) -> ProtocolOrchestrator<MockPort, MemorySink> {
        let clock: Arc<dyn Clock> = Arc::new(SimulatedClock::new());
        ProtocolOrchestrator::new(port(clock.clone()), MemorySink::new(), clock)
    }

    fn assert_safe(port: &MockPort) {
        assert_eq!(port.led_voltage(pins::LED_RED), 0.0);
        assert_eq!(port.led_voltage(pins::LED_GREEN), 0.0);
        assert!(!port.shutter_open());
        assert!(!port.is_running());
    }

    #[test]
    fn test_successful_run() {
        let mut orch = orchestrator(MockPort::new);
        let outcome = orch.run_protocol(&config()).unwrap();

        assert_eq!(
            outcome.message(),
            "Protocol completed successfully. Data saved to leaf.csv"
        );
        assert_eq!(outcome.report.stop_reason, Some(StopReason::ProtocolComplete));
        assert_eq!(outcome.waveform.samples.len(), outcome.sample_counts.nominal);
        assert_eq!(outcome.waveform.filename, "leaf.csv");
        assert!(!outcome.report.lost && !outcome.report.corrupted);
        assert_eq!(outcome.report.timings.len(), 7);

        assert_safe(orch.port());
        assert_eq!(orch.sink().waveforms().len(), 1);
        assert_eq!(orch.sink().metadata().len(), 1);
        assert_eq!(orch.sink().events()[0][0].label, "protocol_start");
    }

    #[test]
    fn test_event_order() {
        let mut orch = orchestrator(MockPort::new);
        let outcome = orch.run_protocol(&config()).unwrap();
        let log = &outcome.event_log;

        let order = [
            "protocol_start",
            "hardware_initialized",
            "recording_started",
            "ared_on",
            "ared_off",
            "wait_after_ared",
            "shutter_opened",
            "agreen_on",
            "agreen_off",
            "end_recording",
            "recording_completed",
            "hardware_safe",
            "protocol_complete",
        ];
        let times: Vec<f64> = order.iter().map(|l| log.require(l).unwrap()).collect();
        assert!(times.windows(2).all(|w| w[1] >= w[0]), "{:?}", times);
    }

    #[test]
    fn test_configuration_error_touches_no_hardware() {
        let mut orch = orchestrator(MockPort::new);
        let bad = ExperimentConfig {
            agreen_delay_s: 0.5,
            agreen_duration_s: 0.6,
            recording_length_s: 1.0,
            ..config()
        };

        let err = orch.run_protocol(&bad).unwrap_err();
        assert!(err.is_configuration());
        assert!(orch.port().commands().is_empty());
        assert!(orch.sink().waveforms().is_empty());
    }

    #[test]
    fn test_hardware_failure_leaves_instrument_safe() {
        let mut orch = orchestrator(|clock| {
            MockPort::builder(clock)
                .error_config(ErrorConfig::scenario(ErrorScenario::FailAfterN {
                    operation: PortOp::ReadSamples,
                    count: 20,
                }))
                .build()
        });

        let err = orch.run_protocol(&config()).unwrap_err();
        assert!(matches!(err, crate::error::ProtocolError::Hardware(_)));
        assert_safe(orch.port());
        assert!(orch.sink().waveforms().is_empty());
    }

    #[test]
    fn test_diagnostic_shutter_cycle() {
        let clock: Arc<dyn Clock> = Arc::new(SimulatedClock::new());
        let port = MockPort::builder(clock.clone())
            .output_latency(Duration::from_micros(500))
            .build();
        let mut orch = ProtocolOrchestrator::new(port, MemorySink::new(), clock).with_options(
            OrchestratorOptions {
                diagnostic_shutter_cycle: true,
                ..Default::default()
            },
        );

        let outcome = orch.run_protocol(&config()).unwrap();
        let log = &outcome.event_log;
        let opened = log.require("shutter_diag_opened").unwrap();
        let closed = log.require("shutter_diag_closed").unwrap();
        assert!((closed - opened - 0.001).abs() < 1e-9);
        assert!(closed <= log.require("recording_started").unwrap());
        assert_safe(orch.port());
    }

    #[test]
    fn test_cancel_handle_shares_stop_signal() {
        let orch = orchestrator(MockPort::new);
        let handle = orch.cancel_handle();
        assert!(!handle.is_requested());
        handle.clone().cancel();
        assert!(handle.is_requested());
        assert_eq!(orch.stop.reason(), Some(StopReason::Cancelled));
    }

    #[test]
    fn test_cancel_before_run_is_honoured() {
        let mut orch = orchestrator(MockPort::new);
        let handle = orch.cancel_handle();
        handle.cancel();

        let cancelled = orch.run_protocol(&config()).unwrap();
        assert!(cancelled.is_cancelled());
        assert!(cancelled.waveform.samples.is_empty());
        assert!(cancelled.event_log.time_of("ared_on").is_none());
        assert_safe(orch.port());
        assert!(!handle.is_requested());

        let next = orch.run_protocol(&config()).unwrap();
        assert_eq!(next.report.stop_reason, Some(StopReason::ProtocolComplete));
        assert_eq!(next.waveform.samples.len(), next.sample_counts.nominal);
    }

    #[test]
    fn test_runs_are_independent() {
        let mut orch = orchestrator(MockPort::new);
        let first = orch.run_protocol(&config()).unwrap();
        let second = orch.run_protocol(&config()).unwrap();

        assert_eq!(first.event_log.events()[0].label, "protocol_start");
        assert_eq!(first.event_log.len(), second.event_log.len());
        assert_eq!(
            first.waveform.samples.len(),
            second.waveform.samples.len()
        );
        assert_eq!(orch.sink().waveforms().len(), 2);
    }
}
