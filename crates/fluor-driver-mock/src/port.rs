//! Simulated instrument implementing [`HardwarePort`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fluor_core::hardware::pins;
use fluor_core::{
    AcquisitionStatus, Clock, DeviceState, HardwareError, HardwareErrorKind, HardwarePort,
    HardwareResult,
};
use tracing::{debug, info, trace};

use crate::errors::{ErrorConfig, PortOp};
use crate::rng::MockRng;
use crate::signal::InductionModel;

/// Value of samples left over in the device buffer from an earlier run.
///
/// Far outside the photodiode's output range so leaked stale data is
/// obvious in test assertions.
pub const STALE_SAMPLE_V: f64 = -9.0;

/// Maximum LED drive voltage the analog outputs accept.
const MAX_LED_V: f64 = 5.0;

/// Sample-level fault reported on a given poll.
///
/// `poll` counts status polls from the moment the device enters `Running`,
/// starting at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFault {
    /// The device drops `count` samples; they are reported as lost and never
    /// become readable.
    Lost {
        /// Running poll index.
        poll: usize,
        /// Samples dropped.
        count: usize,
    },
    /// The device flags `count` samples as corrupted.
    Corrupted {
        /// Running poll index.
        poll: usize,
        /// Samples flagged.
        count: usize,
    },
}

/// Command issued to the simulated instrument, for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum PortCommand {
    /// `configure_input`
    ConfigureInput {
        /// Analog input channel.
        channel: u32,
        /// Input span in volts.
        range_v: f64,
        /// Sample rate.
        sample_rate_hz: f64,
    },
    /// `start_acquisition`
    StartAcquisition,
    /// `stop_acquisition`
    StopAcquisition,
    /// `set_led_voltage`
    SetLedVoltage {
        /// Analog output channel.
        channel: u32,
        /// Drive voltage.
        volts: f64,
    },
    /// `set_digital_pin`
    SetDigitalPin {
        /// Digital pin.
        pin: u32,
        /// Level.
        high: bool,
    },
}

#[derive(Debug, Clone, Copy)]
struct InputConfig {
    channel: u32,
    sample_rate_hz: f64,
}

// =============================================================================
// MockPortBuilder
// =============================================================================

/// Builder for [`MockPort`].
pub struct MockPortBuilder {
    clock: Arc<dyn Clock>,
    startup_delay: Duration,
    stale_samples: usize,
    noise_v: f64,
    seed: Option<u64>,
    model: InductionModel,
    faults: Vec<SampleFault>,
    error_config: ErrorConfig,
    output_latency: Duration,
}

impl MockPortBuilder {
    fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            startup_delay: Duration::from_millis(50),
            stale_samples: 0,
            noise_v: 0.0,
            seed: None,
            model: InductionModel::default(),
            faults: Vec::new(),
            error_config: ErrorConfig::none(),
            output_latency: Duration::ZERO,
        }
    }

    /// Time between `start_acquisition` and the first sample (default 50 ms).
    pub fn startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Samples sitting in the device buffer before the first acquisition.
    pub fn stale_samples(mut self, count: usize) -> Self {
        self.stale_samples = count;
        self
    }

    /// Uniform noise amplitude added to every sample.
    pub fn noise(mut self, amplitude_v: f64) -> Self {
        self.noise_v = amplitude_v.max(0.0);
        self
    }

    /// Seed for the noise generator.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Fluorescence response parameters.
    pub fn model(mut self, model: InductionModel) -> Self {
        self.model = model;
        self
    }

    /// Add a scripted lost/corrupted sample fault.
    pub fn fault(mut self, fault: SampleFault) -> Self {
        self.faults.push(fault);
        self
    }

    /// Error injection for individual operations.
    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    /// Time each analog or digital output write takes.
    pub fn output_latency(mut self, latency: Duration) -> Self {
        self.output_latency = latency;
        self
    }

    /// Build the port.
    pub fn build(self) -> MockPort {
        MockPort {
            rng: MockRng::new(self.seed),
            clock: self.clock,
            startup_delay: self.startup_delay,
            noise_v: self.noise_v,
            model: self.model,
            faults: self.faults,
            errors: self.error_config,
            output_latency: self.output_latency,
            input: None,
            running: false,
            stopped: false,
            started_at: 0.0,
            delivered: 0,
            stale: self.stale_samples,
            running_polls: 0,
            polls: 0,
            leds: BTreeMap::new(),
            pins: BTreeMap::new(),
            green_on_at: None,
            commands: Vec::new(),
        }
    }
}

// =============================================================================
// MockPort
// =============================================================================

/// Simulated fluorescence instrument.
///
/// Samples are produced at the configured rate from the moment the start-up
/// delay has elapsed on the shared clock. Output state (LED voltages, pins)
/// and every command are kept for inspection.
#[derive(Debug)]
pub struct MockPort {
    clock: Arc<dyn Clock>,
    startup_delay: Duration,
    noise_v: f64,
    model: InductionModel,
    faults: Vec<SampleFault>,
    errors: ErrorConfig,
    output_latency: Duration,
    rng: MockRng,

    input: Option<InputConfig>,
    running: bool,
    stopped: bool,
    started_at: f64,
    /// Samples read or dropped since the acquisition started.
    delivered: u64,
    stale: usize,
    running_polls: usize,
    polls: usize,

    leds: BTreeMap<u32, f64>,
    pins: BTreeMap<u32, bool>,
    green_on_at: Option<f64>,
    commands: Vec<(f64, PortCommand)>,
}

impl MockPort {
    /// Create a builder using `clock` as the time base.
    pub fn builder(clock: Arc<dyn Clock>) -> MockPortBuilder {
        MockPortBuilder::new(clock)
    }

    /// Create a port with default settings.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::builder(clock).build()
    }

    /// Current drive voltage of an LED channel.
    pub fn led_voltage(&self, channel: u32) -> f64 {
        self.leds.get(&channel).copied().unwrap_or(0.0)
    }

    /// Current level of a digital pin (low until first driven).
    pub fn pin(&self, pin: u32) -> bool {
        self.pins.get(&pin).copied().unwrap_or(false)
    }

    /// True when the shutter pins are in the open configuration.
    pub fn shutter_open(&self) -> bool {
        self.pin(pins::GATE) && !self.pin(pins::TRIGGER)
    }

    /// True between `start_acquisition` and `stop_acquisition`.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Every command issued so far, with the clock time it was issued at.
    pub fn commands(&self) -> &[(f64, PortCommand)] {
        &self.commands
    }

    /// Total `poll_status` calls.
    pub fn poll_count(&self) -> usize {
        self.polls
    }

    /// Samples read or dropped in the current acquisition.
    pub fn samples_delivered(&self) -> u64 {
        self.delivered
    }

    /// Shared error-injection state.
    pub fn error_config(&self) -> &ErrorConfig {
        &self.errors
    }

    /// Seconds since the first sample was due, negative during start-up.
    fn stream_time(&self, now: f64) -> f64 {
        now - self.started_at - self.startup_delay.as_secs_f64()
    }

    fn produced(&self, now: f64) -> u64 {
        let Some(input) = self.input else {
            return 0;
        };
        if !self.running {
            return self.delivered;
        }
        let t = self.stream_time(now);
        if t <= 0.0 {
            return 0;
        }
        // Tolerance keeps exact sample boundaries from rounding down
        (t * input.sample_rate_hz + 1e-6).floor() as u64
    }

    fn record(&mut self, command: PortCommand) {
        let now = self.clock.now();
        self.commands.push((now, command));
    }

    fn sample_value(&self, index: u64, sample_rate_hz: f64) -> f64 {
        let t_sample =
            self.started_at + self.startup_delay.as_secs_f64() + index as f64 / sample_rate_hz;
        let green_on_for = self
            .green_on_at
            .and_then(|on| (t_sample >= on).then_some(t_sample - on));
        self.model.level(
            self.shutter_open(),
            self.led_voltage(pins::LED_RED),
            self.led_voltage(pins::LED_GREEN),
            green_on_for,
        ) + self.rng.noise(self.noise_v)
    }
}

impl HardwarePort for MockPort {
    fn configure_input(
        &mut self,
        channel: u32,
        range_v: f64,
        sample_rate_hz: f64,
    ) -> HardwareResult<()> {
        self.errors.check(PortOp::ConfigureInput)?;
        if !(range_v.is_finite() && range_v > 0.0) {
            return Err(HardwareError::configuration(
                "configure_input",
                format!("Invalid input range {} V", range_v),
            ));
        }
        if !(sample_rate_hz.is_finite() && sample_rate_hz > 0.0) {
            return Err(HardwareError::configuration(
                "configure_input",
                format!("Invalid sample rate {} Hz", sample_rate_hz),
            ));
        }

        self.input = Some(InputConfig {
            channel,
            sample_rate_hz,
        });
        self.record(PortCommand::ConfigureInput {
            channel,
            range_v,
            sample_rate_hz,
        });
        info!(channel, range_v, sample_rate_hz, "Mock analog input configured");
        Ok(())
    }

    fn start_acquisition(&mut self) -> HardwareResult<()> {
        self.errors.check(PortOp::StartAcquisition)?;
        if self.input.is_none() {
            return Err(HardwareError::configuration(
                "start_acquisition",
                "configure_input must be called before starting",
            ));
        }

        self.running = true;
        self.stopped = false;
        self.started_at = self.clock.now();
        self.delivered = 0;
        self.running_polls = 0;
        self.record(PortCommand::StartAcquisition);
        debug!(
            startup_delay_ms = self.startup_delay.as_millis() as u64,
            "Mock acquisition started"
        );
        Ok(())
    }

    fn stop_acquisition(&mut self) -> HardwareResult<()> {
        self.errors.check(PortOp::StopAcquisition)?;
        if self.running {
            self.running = false;
            self.stopped = true;
            debug!(delivered = self.delivered, "Mock acquisition stopped");
        }
        self.record(PortCommand::StopAcquisition);
        Ok(())
    }

    fn poll_status(&mut self) -> HardwareResult<AcquisitionStatus> {
        self.errors.check(PortOp::PollStatus)?;
        self.polls += 1;

        if !self.running {
            let state = if self.stopped {
                DeviceState::Done
            } else {
                DeviceState::Ready
            };
            return Ok(AcquisitionStatus {
                available: self.stale,
                ..AcquisitionStatus::idle(state)
            });
        }

        let now = self.clock.now();
        let t = self.stream_time(now);
        if t < 0.0 {
            let half_delay = self.startup_delay.as_secs_f64() / 2.0;
            let state = if -t > half_delay {
                DeviceState::Prefill
            } else {
                DeviceState::Armed
            };
            return Ok(AcquisitionStatus {
                available: self.stale,
                ..AcquisitionStatus::idle(state)
            });
        }

        let poll = self.running_polls;
        self.running_polls += 1;

        let mut lost = 0;
        let mut corrupted = 0;
        for fault in &self.faults {
            match *fault {
                SampleFault::Lost { poll: p, count } if p == poll => lost += count,
                SampleFault::Corrupted { poll: p, count } if p == poll => corrupted += count,
                _ => {}
            }
        }
        self.delivered += lost as u64;

        let fresh = self.produced(now).saturating_sub(self.delivered);
        let available = self.stale + usize::try_from(fresh).unwrap_or(usize::MAX);
        trace!(poll, available, lost, corrupted, "Mock status");

        Ok(AcquisitionStatus {
            state: DeviceState::Running,
            available,
            lost,
            corrupted,
        })
    }

    fn read_samples(&mut self, channel: u32, count: usize) -> HardwareResult<Vec<f64>> {
        self.errors.check(PortOp::ReadSamples)?;
        let Some(input) = self.input else {
            return Err(HardwareError::configuration(
                "read_samples",
                "analog input is not configured",
            ));
        };
        if channel != input.channel {
            return Err(HardwareError::configuration(
                "read_samples",
                format!(
                    "channel {} is not the configured input channel {}",
                    channel, input.channel
                ),
            ));
        }

        let mut samples = Vec::with_capacity(count);
        let from_stale = count.min(self.stale);
        self.stale -= from_stale;
        samples.resize(from_stale, STALE_SAMPLE_V);

        let wanted = (count - from_stale) as u64;
        if wanted > 0 {
            let available = self.produced(self.clock.now()).saturating_sub(self.delivered);
            if wanted > available {
                return Err(HardwareError::new(
                    HardwareErrorKind::Communication,
                    "read_samples",
                    format!("requested {} samples, only {} available", wanted, available),
                ));
            }
            for index in self.delivered..self.delivered + wanted {
                samples.push(self.sample_value(index, input.sample_rate_hz));
            }
            self.delivered += wanted;
        }

        Ok(samples)
    }

    fn set_led_voltage(&mut self, channel: u32, volts: f64) -> HardwareResult<()> {
        self.errors.check(PortOp::SetLedVoltage)?;
        if channel != pins::LED_RED && channel != pins::LED_GREEN {
            return Err(HardwareError::configuration(
                "set_led_voltage",
                format!("no LED on analog output {}", channel),
            ));
        }
        if !(0.0..=MAX_LED_V).contains(&volts) {
            return Err(HardwareError::configuration(
                "set_led_voltage",
                format!("{} V is outside the 0-{} V output range", volts, MAX_LED_V),
            ));
        }

        if !self.output_latency.is_zero() {
            self.clock.sleep(self.output_latency);
        }
        if channel == pins::LED_GREEN {
            match (volts > 0.0, self.green_on_at) {
                (true, None) => self.green_on_at = Some(self.clock.now()),
                (false, _) => self.green_on_at = None,
                _ => {}
            }
        }
        self.leds.insert(channel, volts);
        self.record(PortCommand::SetLedVoltage { channel, volts });
        Ok(())
    }

    fn set_digital_pin(&mut self, pin: u32, high: bool) -> HardwareResult<()> {
        self.errors.check(PortOp::SetDigitalPin)?;
        if !self.output_latency.is_zero() {
            self.clock.sleep(self.output_latency);
        }
        self.pins.insert(pin, high);
        self.record(PortCommand::SetDigitalPin { pin, high });
        Ok(())
    }
}
