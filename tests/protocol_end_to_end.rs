//! End-to-end protocol runs against the simulated instrument.

use std::fs;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use fluor_core::hardware::pins;
use fluor_core::{
    AcquisitionStatus, Clock, DeviceState, HardwarePort, HardwareResult, MonotonicClock,
    SimulatedClock,
};
use fluor_daq::{
    CancelHandle, CsvRunSink, ExperimentConfig, MemorySink, ProtocolError, ProtocolOrchestrator,
    StopReason,
};
use fluor_driver_mock::{
    ErrorConfig, ErrorScenario, InductionModel, MockPort, PortCommand, PortOp,
};
use tempfile::tempdir;

fn induction_config() -> ExperimentConfig {
    ExperimentConfig {
        recording_hz: 1000,
        ared_duration_s: 1.0,
        wait_after_ared_s: 0.0,
        agreen_delay_s: 0.0,
        agreen_duration_s: 1.0,
        filename: "induction.csv".to_string(),
        ..Default::default()
    }
}

fn assert_safe(port: &MockPort) {
    assert_eq!(port.led_voltage(pins::LED_RED), 0.0, "red LED left on");
    assert_eq!(port.led_voltage(pins::LED_GREEN), 0.0, "green LED left on");
    assert!(!port.shutter_open(), "shutter left open");
    assert!(!port.is_running(), "acquisition left running");
}

#[test]
fn test_full_protocol_with_simulated_instrument() {
    let dir = tempdir().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SimulatedClock::new());
    let port = MockPort::builder(clock.clone())
        .startup_delay(Duration::from_millis(50))
        .build();
    let mut orchestrator = ProtocolOrchestrator::new(port, CsvRunSink::new(dir.path()), clock);

    let outcome = orchestrator.run_protocol(&induction_config()).unwrap();

    // Sample count
    assert!(
        (outcome.waveform.samples.len() as i64 - 2000).abs() <= 1,
        "got {} samples",
        outcome.waveform.samples.len()
    );
    assert!(!outcome.report.lost);
    assert!(!outcome.report.corrupted);
    assert!(!outcome.report.overrun);

    // Event times relative to ared_on
    let log = &outcome.event_log;
    let zero = log.require("ared_on").unwrap();
    let relative = |label: &str| log.require(label).unwrap() - zero;
    assert!((relative("ared_off") - 1.0).abs() < 0.005);
    assert!((relative("agreen_on") - 1.0).abs() < 0.005);
    assert!((relative("agreen_off") - 2.0).abs() < 0.005);
    assert!(relative("shutter_opened") <= relative("agreen_on"));

    // Dark during the actinic pulse, fluorescence once the measuring light is on
    let dark = InductionModel::default().dark_v;
    let samples = &outcome.waveform.samples;
    assert_eq!(samples[500], dark);
    assert!(samples[1500] > dark + 0.5);

    // Files
    let expected = "Protocol completed successfully. Data saved to ";
    assert!(outcome.message().starts_with(expected));
    assert_eq!(outcome.data_path, dir.path().join("induction.csv"));
    let csv = fs::read_to_string(&outcome.data_path).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("time,signal"));
    assert_eq!(lines.count(), samples.len());
    assert!(dir.path().join("induction.json").exists());
    assert!(dir.path().join("induction_events.json").exists());

    assert_safe(orchestrator.port());
}

#[test]
fn test_data_index_tracks_anchor_latency() {
    for latency_ms in [0_u64, 3, 12, 37] {
        let clock: Arc<dyn Clock> = Arc::new(SimulatedClock::new());
        let port = MockPort::builder(clock.clone())
            .output_latency(Duration::from_millis(latency_ms))
            .build();
        let mut orchestrator = ProtocolOrchestrator::new(port, MemorySink::new(), clock);
        let config = ExperimentConfig {
            ared_duration_s: 0.2,
            agreen_duration_s: 0.2,
            ..induction_config()
        };

        let outcome = orchestrator.run_protocol(&config).unwrap();
        let data_index = outcome.report.data_index.unwrap() as i64;
        assert!(
            (data_index - latency_ms as i64).abs() <= 1,
            "latency {} ms gave data_index {}",
            latency_ms,
            data_index
        );
    }
}

#[test]
fn test_wide_action_tolerance_keeps_full_waveform() {
    let clock: Arc<dyn Clock> = Arc::new(SimulatedClock::new());
    let port = MockPort::new(clock.clone());
    let mut orchestrator = ProtocolOrchestrator::new(port, MemorySink::new(), clock);
    let config = ExperimentConfig {
        action_epsilon_s: 0.1,
        ..induction_config()
    };

    let outcome = orchestrator.run_protocol(&config).unwrap();

    assert_eq!(outcome.report.stop_reason, Some(StopReason::ProtocolComplete));
    assert!(!outcome.report.lost && !outcome.report.overrun);
    assert_eq!(outcome.sample_counts.nominal, 2000);
    assert_eq!(outcome.waveform.samples.len(), 2000);
}

#[test]
fn test_hardware_failure_mid_run_leaves_instrument_safe() {
    let clock: Arc<dyn Clock> = Arc::new(SimulatedClock::new());
    let port = MockPort::builder(clock.clone())
        .error_config(ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: PortOp::PollStatus,
            count: 300,
        }))
        .build();
    let mut orchestrator = ProtocolOrchestrator::new(port, MemorySink::new(), clock);

    let err = orchestrator.run_protocol(&induction_config()).unwrap_err();
    assert!(matches!(err, ProtocolError::Hardware(_)));
    assert!(!err.is_configuration());

    let (port, sink) = orchestrator.into_parts();
    let red_was_on = port.commands().iter().any(|(_, cmd)| {
        matches!(cmd, PortCommand::SetLedVoltage { channel, volts } if *channel == pins::LED_RED && *volts > 0.0)
    });
    assert!(red_was_on, "failure should hit while the actinic LED is on");
    assert_safe(&port);
    assert!(sink.waveforms().is_empty());
}

#[test]
fn test_configuration_error_issues_no_commands() {
    let clock: Arc<dyn Clock> = Arc::new(SimulatedClock::new());
    let port = MockPort::new(clock.clone());
    let mut orchestrator = ProtocolOrchestrator::new(port, MemorySink::new(), clock);

    let config = ExperimentConfig {
        recording_hz: 10,
        ..induction_config()
    };
    let err = orchestrator.run_protocol(&config).unwrap_err();
    assert!(err.is_configuration());
    assert!(orchestrator.port().commands().is_empty());
}

// =============================================================================
// Cancellation
// =============================================================================

/// Delegates to a [`MockPort`] and cancels the run on a given running poll.
struct CancellingPort {
    inner: MockPort,
    cancel_at: usize,
    running_polls: usize,
    cancelled_at: Option<usize>,
    handle: Arc<OnceLock<CancelHandle>>,
}

impl HardwarePort for CancellingPort {
    fn configure_input(&mut self, channel: u32, range_v: f64, rate: f64) -> HardwareResult<()> {
        self.inner.configure_input(channel, range_v, rate)
    }

    fn start_acquisition(&mut self) -> HardwareResult<()> {
        self.inner.start_acquisition()
    }

    fn stop_acquisition(&mut self) -> HardwareResult<()> {
        self.inner.stop_acquisition()
    }

    fn poll_status(&mut self) -> HardwareResult<AcquisitionStatus> {
        let status = self.inner.poll_status()?;
        if status.state == DeviceState::Running {
            self.running_polls += 1;
            if self.running_polls == self.cancel_at {
                if let Some(handle) = self.handle.get() {
                    handle.cancel();
                    self.cancelled_at = Some(self.running_polls);
                }
            }
        }
        Ok(status)
    }

    fn read_samples(&mut self, channel: u32, count: usize) -> HardwareResult<Vec<f64>> {
        self.inner.read_samples(channel, count)
    }

    fn set_led_voltage(&mut self, channel: u32, volts: f64) -> HardwareResult<()> {
        self.inner.set_led_voltage(channel, volts)
    }

    fn set_digital_pin(&mut self, pin: u32, high: bool) -> HardwareResult<()> {
        self.inner.set_digital_pin(pin, high)
    }
}

#[test]
fn test_cancel_stops_within_one_iteration() {
    let clock: Arc<dyn Clock> = Arc::new(SimulatedClock::new());
    let handle = Arc::new(OnceLock::new());
    let port = CancellingPort {
        inner: MockPort::new(clock.clone()),
        cancel_at: 600,
        running_polls: 0,
        cancelled_at: None,
        handle: handle.clone(),
    };
    let mut orchestrator = ProtocolOrchestrator::new(port, MemorySink::new(), clock);
    assert!(handle.set(orchestrator.cancel_handle()).is_ok());

    let outcome = orchestrator.run_protocol(&induction_config()).unwrap();

    assert!(outcome.is_cancelled());
    assert_eq!(outcome.report.stop_reason, Some(StopReason::Cancelled));
    assert!(outcome.message().starts_with("Protocol cancelled."));
    assert!(!outcome.waveform.samples.is_empty());
    assert!(outcome.waveform.samples.len() < outcome.sample_counts.nominal);
    assert!(outcome.event_log.time_of("end_recording").is_none());

    let port = orchestrator.port();
    assert_eq!(port.cancelled_at, Some(600));
    assert_eq!(port.running_polls, 600, "polled again after cancel");
    assert_safe(&port.inner);
    assert_eq!(orchestrator.sink().waveforms().len(), 1);
}

#[test]
fn test_cancel_from_another_thread_in_real_time() {
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let port = MockPort::builder(clock.clone())
        .startup_delay(Duration::from_millis(5))
        .build();
    let mut orchestrator = ProtocolOrchestrator::new(port, MemorySink::new(), clock);
    let handle = orchestrator.cancel_handle();

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(150));
        handle.cancel();
    });
    let outcome = orchestrator.run_protocol(&induction_config()).unwrap();
    canceller.join().unwrap();

    assert!(outcome.is_cancelled());
    assert!(outcome.waveform.samples.len() < 1000);
    assert_safe(orchestrator.port());
}

#[test]
fn test_cancel_during_long_wait_after_actinic_pulse() {
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let port = MockPort::builder(clock.clone())
        .startup_delay(Duration::from_millis(5))
        .build();
    let mut orchestrator = ProtocolOrchestrator::new(port, MemorySink::new(), clock);
    let handle = orchestrator.cancel_handle();
    let config = ExperimentConfig {
        ared_duration_s: 0.1,
        wait_after_ared_s: 3.0,
        agreen_duration_s: 0.2,
        ..induction_config()
    };

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        handle.cancel();
    });
    let started = Instant::now();
    let outcome = orchestrator.run_protocol(&config).unwrap();
    let took = started.elapsed();
    canceller.join().unwrap();

    assert!(outcome.is_cancelled());
    assert!(took < Duration::from_millis(1500), "run took {:?}", took);
    assert!(outcome.event_log.time_of("shutter_opened").is_none());
    assert_safe(orchestrator.port());
}
