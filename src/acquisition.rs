//! Real-time acquisition session.
//!
//! An [`AcquisitionSession`] owns one continuous analog-input acquisition
//! and fires the protocol's [`ScheduledAction`]s from inside its polling
//! loop, so every hardware transition is placed against the sample stream
//! rather than against a separate timer.
//!
//! # State machine
//!
//! ```text
//! Unarmed ─arm─▶ Flushing ─▶ WaitingForFirstData ─▶ Streaming ─▶ Trimming ─▶ Complete
//!                                                       │
//!                                                       └──▶ Overrun
//! ```
//!
//! # Time zero
//!
//! Samples accumulate from the moment the device starts delivering data,
//! which is some unknown time before the protocol begins. The `ared_on`
//! action fires on the first streaming iteration; its completion time
//! becomes `t_zero`, and the buffer index corresponding to it is
//! `round((t_zero - acquisition_start) * rate)`. Every other action is then
//! scheduled relative to `t_zero`, and the returned waveform is trimmed to
//! start at that index. If `end_recording` fires before the buffer holds the
//! full window after that index, the loop keeps reading until it does.
//!
//! # Faults
//!
//! Lost and corrupted samples set sticky flags. Lost samples leave
//! zero-filled gaps so later samples keep their position. A buffer that
//! grows past twice the requested sample budget, or fills completely, stops
//! the session as an overrun; whatever was recorded is still returned.

use std::sync::Arc;
use std::time::Duration;

use fluor_core::{ActionTiming, Clock, EventLog, HardwareError, HardwarePort};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::action::{validate_actions, ActionContext, ScheduledAction};
use crate::error::ProtocolResult;
use crate::experiment::{ExperimentConfig, SampleCounts};
use crate::stop::{StopReason, StopSignal};
use crate::timeline::Step;

/// Buffer capacity as a multiple of the acquisition budget.
pub const DEFAULT_BUFFER_MULTIPLIER: usize = 4;

/// Buffer fill, as a multiple of the acquisition budget, that counts as an
/// overrun.
pub const OVERRUN_FACTOR: usize = 2;

/// Upper bound on flush rounds before starting an acquisition.
const MAX_FLUSH_ROUNDS: usize = 16;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, hardware untouched.
    Unarmed,
    /// Input configured, stale samples being discarded.
    Flushing,
    /// Acquisition started, waiting for the device to deliver data.
    WaitingForFirstData,
    /// Polling loop running.
    Streaming,
    /// Extracting the time-zero-aligned waveform.
    Trimming,
    /// Finished normally.
    Complete,
    /// Stopped because the buffer grew past its limit.
    Overrun,
}

/// Acquisition parameters for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    /// Analog input channel.
    pub channel: u32,
    /// Input span in volts.
    pub range_v: f64,
    /// Sample rate.
    pub sample_rate_hz: f64,
    /// Samples in the trimmed waveform.
    pub nominal_samples: usize,
    /// Samples requested from the acquisition.
    pub acquisition_budget: usize,
    /// Buffer capacity as a multiple of the budget.
    pub buffer_multiplier: usize,
    /// Sleep between polls when no samples are pending.
    pub idle_wait: Duration,
    /// Longest wait for the device to start delivering data.
    pub first_data_timeout: Duration,
}

impl AcquisitionSettings {
    /// Settings for an experiment with default loop tuning.
    pub fn from_config(config: &ExperimentConfig, counts: &SampleCounts) -> Self {
        Self {
            channel: fluor_core::hardware::pins::ANALOG_IN,
            range_v: config.channel_range,
            sample_rate_hz: f64::from(config.recording_hz),
            nominal_samples: counts.nominal,
            acquisition_budget: counts.acquisition_budget,
            buffer_multiplier: DEFAULT_BUFFER_MULTIPLIER,
            idle_wait: Duration::from_millis(1),
            first_data_timeout: Duration::from_secs(5),
        }
    }

    /// Buffer capacity in samples.
    pub fn capacity(&self) -> usize {
        self.acquisition_budget
            .saturating_mul(self.buffer_multiplier.max(OVERRUN_FACTOR + 1))
    }

    /// Buffer fill beyond which the session stops as an overrun.
    pub fn overrun_limit(&self) -> usize {
        self.acquisition_budget.saturating_mul(OVERRUN_FACTOR)
    }
}

/// Fixed-capacity, zero-filled sample buffer with a write cursor.
#[derive(Debug, Clone)]
pub struct AcquisitionBuffer {
    data: Vec<f64>,
    cursor: usize,
}

impl AcquisitionBuffer {
    /// Allocate a zero-filled buffer.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0.0; capacity],
            cursor: 0,
        }
    }

    /// Total slots.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Slots written or skipped so far.
    pub fn len(&self) -> usize {
        self.cursor
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Slots left.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Copy samples in at the cursor. Returns how many fit.
    pub fn write(&mut self, samples: &[f64]) -> usize {
        let count = samples.len().min(self.remaining());
        self.data[self.cursor..self.cursor + count].copy_from_slice(&samples[..count]);
        self.cursor += count;
        count
    }

    /// Advance the cursor over `count` zero-filled slots. Returns how many
    /// fit.
    pub fn skip(&mut self, count: usize) -> usize {
        let count = count.min(self.remaining());
        self.cursor += count;
        count
    }

    /// Written portion of the buffer.
    pub fn as_slice(&self) -> &[f64] {
        &self.data[..self.cursor]
    }

    /// `len` samples starting at `start`, clipped to the written portion.
    pub fn window(&self, start: usize, len: usize) -> &[f64] {
        let start = start.min(self.cursor);
        let end = start.saturating_add(len).min(self.cursor);
        &self.data[start..end]
    }
}

/// Scheduling accuracy of one step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepTiming {
    /// Protocol step.
    pub step: Step,
    /// Scheduled versus actual offset.
    pub timing: ActionTiming,
}

/// Everything a session produced.
#[derive(Debug, Clone)]
pub struct AcquisitionResult {
    /// Waveform starting at time zero (or the whole buffer if unanchored).
    pub samples: Vec<f64>,
    /// `samples.len()`.
    pub true_sample_count: usize,
    /// Buffer slots filled before trimming.
    pub raw_sample_count: usize,
    /// Buffer index of time zero.
    pub data_index: Option<usize>,
    /// Clock time of time zero.
    pub t_zero: Option<f64>,
    /// Clock time the device started delivering data.
    pub acquisition_start: Option<f64>,
    /// False if time zero was never established.
    pub anchored: bool,
    /// Sticky: the device dropped samples.
    pub lost: bool,
    /// Sticky: the device flagged corrupted samples.
    pub corrupted: bool,
    /// Total samples dropped.
    pub lost_samples: usize,
    /// Total samples flagged corrupted.
    pub corrupted_samples: usize,
    /// The buffer limit was exceeded.
    pub overrun: bool,
    /// Why the loop ended.
    pub stop_reason: Option<StopReason>,
    /// Stale samples discarded before starting.
    pub flushed_samples: usize,
    /// Polling iterations executed.
    pub iterations: u64,
    /// Iterations whose last sample read exactly 0.0.
    pub zero_sample_warnings: u64,
    /// Scheduling accuracy of every fired step.
    pub timings: Vec<StepTiming>,
    /// State the session ended in.
    pub final_state: SessionState,
}

/// One acquisition with its polling loop.
#[derive(Debug)]
pub struct AcquisitionSession {
    settings: AcquisitionSettings,
    clock: Arc<dyn Clock>,
    state: SessionState,
    buffer: AcquisitionBuffer,
    acquisition_start: Option<f64>,
    t_zero: Option<f64>,
    data_index: Option<usize>,
    lost: bool,
    corrupted: bool,
    lost_samples: usize,
    corrupted_samples: usize,
    overrun: bool,
    stop_reason: Option<StopReason>,
    flushed_samples: usize,
    iterations: u64,
    zero_sample_warnings: u64,
    timings: Vec<StepTiming>,
}

impl AcquisitionSession {
    /// Create a session and allocate its buffer.
    pub fn new(settings: AcquisitionSettings, clock: Arc<dyn Clock>) -> Self {
        let buffer = AcquisitionBuffer::new(settings.capacity());
        Self {
            settings,
            clock,
            state: SessionState::Unarmed,
            buffer,
            acquisition_start: None,
            t_zero: None,
            data_index: None,
            lost: false,
            corrupted: false,
            lost_samples: 0,
            corrupted_samples: 0,
            overrun: false,
            stop_reason: None,
            flushed_samples: 0,
            iterations: 0,
            zero_sample_warnings: 0,
            timings: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Settings in use.
    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "Acquisition state");
        self.state = next;
    }

    /// Arm, stream and trim in one call.
    pub fn run(
        mut self,
        port: &mut dyn HardwarePort,
        actions: &mut [ScheduledAction],
        stop: &StopSignal,
        log: &mut EventLog,
    ) -> ProtocolResult<AcquisitionResult> {
        let anchor = validate_actions(actions)?;
        self.arm(port, stop, log)?;
        self.stream(port, actions, anchor, stop, log)?;
        Ok(self.finish())
    }

    /// Configure the input, discard stale samples, start the acquisition
    /// and wait for the first data.
    ///
    /// Returns early without error if `stop` is raised while waiting.
    pub fn arm(
        &mut self,
        port: &mut dyn HardwarePort,
        stop: &StopSignal,
        log: &mut EventLog,
    ) -> ProtocolResult<()> {
        self.transition(SessionState::Flushing);
        port.configure_input(
            self.settings.channel,
            self.settings.range_v,
            self.settings.sample_rate_hz,
        )?;
        self.flush_stale(port)?;

        port.start_acquisition()?;
        self.transition(SessionState::WaitingForFirstData);

        let started = self.wait_for_first_data(port, stop);
        match started {
            Ok(Some(start)) => {
                self.acquisition_start = Some(start);
                log.log("recording_started")?;
                info!(
                    sample_rate_hz = self.settings.sample_rate_hz,
                    capacity = self.buffer.capacity(),
                    "Acquisition delivering data"
                );
                Ok(())
            }
            Ok(None) => {
                info!("Stop requested before acquisition delivered data");
                Ok(())
            }
            Err(e) => {
                if let Err(stop_err) = port.stop_acquisition() {
                    warn!(error = %stop_err, "Failed to stop acquisition after start failure");
                }
                Err(e.into())
            }
        }
    }

    fn flush_stale(&mut self, port: &mut dyn HardwarePort) -> ProtocolResult<()> {
        for _ in 0..MAX_FLUSH_ROUNDS {
            let status = port.poll_status()?;
            if status.available == 0 {
                break;
            }
            let stale = port.read_samples(self.settings.channel, status.available)?;
            self.flushed_samples += stale.len();
        }
        if self.flushed_samples > 0 {
            info!(count = self.flushed_samples, "Discarded stale samples");
        }
        Ok(())
    }

    fn wait_for_first_data(
        &mut self,
        port: &mut dyn HardwarePort,
        stop: &StopSignal,
    ) -> Result<Option<f64>, HardwareError> {
        let deadline = self.clock.now() + self.settings.first_data_timeout.as_secs_f64();
        loop {
            if stop.is_requested() {
                self.stop_reason = stop.reason();
                return Ok(None);
            }
            let status = port.poll_status()?;
            if !status.state.is_pre_acquisition() {
                return Ok(Some(self.clock.now()));
            }
            if self.clock.now() >= deadline {
                return Err(HardwareError::timeout(
                    "start_acquisition",
                    format!(
                        "device still in {:?} after {:?}",
                        status.state, self.settings.first_data_timeout
                    ),
                ));
            }
            self.clock.sleep(self.settings.idle_wait);
        }
    }

    /// Run the polling loop until the stop signal is raised or the buffer
    /// overruns. The acquisition is stopped on every exit path.
    pub fn stream(
        &mut self,
        port: &mut dyn HardwarePort,
        actions: &mut [ScheduledAction],
        anchor: usize,
        stop: &StopSignal,
        log: &mut EventLog,
    ) -> ProtocolResult<()> {
        let result = match self.acquisition_start {
            Some(start) => {
                self.transition(SessionState::Streaming);
                log.log("recording_loop_started")?;
                self.poll_loop(port, actions, anchor, stop, log, start)
            }
            None => Ok(()),
        };

        let stopped = port.stop_acquisition();
        match (&result, stopped) {
            (Ok(()), Err(e)) => return Err(e.into()),
            (Err(_), Err(e)) => warn!(error = %e, "Failed to stop acquisition after error"),
            _ => {}
        }
        result?;

        log.log("recording_completed")?;
        info!(
            samples = self.buffer.len(),
            iterations = self.iterations,
            lost = self.lost,
            corrupted = self.corrupted,
            overrun = self.overrun,
            "Acquisition stopped"
        );
        Ok(())
    }

    fn poll_loop(
        &mut self,
        port: &mut dyn HardwarePort,
        actions: &mut [ScheduledAction],
        anchor: usize,
        stop: &StopSignal,
        log: &mut EventLog,
        acquisition_start: f64,
    ) -> ProtocolResult<()> {
        let clock = Arc::clone(&self.clock);
        let channel = self.settings.channel;
        let rate = self.settings.sample_rate_hz;
        let overrun_limit = self.settings.overrun_limit();
        let mut completion_deadline: Option<f64> = None;

        loop {
            self.iterations += 1;
            let mut buffer_full = false;

            let status = port.poll_status()?;
            if status.lost > 0 {
                if !self.lost {
                    warn!(count = status.lost, "Device reported lost samples");
                }
                self.lost = true;
                self.lost_samples += status.lost;
                buffer_full |= self.buffer.skip(status.lost) < status.lost;
            }
            if status.corrupted > 0 {
                if !self.corrupted {
                    warn!(count = status.corrupted, "Device reported corrupted samples");
                }
                self.corrupted = true;
                self.corrupted_samples += status.corrupted;
            }

            if status.available > 0 {
                let count = status.available.min(self.buffer.remaining());
                if count > 0 {
                    let samples = port.read_samples(channel, count)?;
                    self.buffer.write(&samples);
                    if samples.last() == Some(&0.0) {
                        self.zero_sample_warnings += 1;
                        if self.zero_sample_warnings == 1 {
                            warn!(
                                index = self.buffer.len(),
                                "Last sample read is exactly zero; check the photodiode input"
                            );
                        } else {
                            debug!(index = self.buffer.len(), "Zero-valued sample");
                        }
                    }
                }
                buffer_full |= count < status.available;
            }

            let mut ctx = ActionContext {
                port: &mut *port,
                clock: clock.as_ref(),
                stop,
            };

            if self.t_zero.is_none() {
                let elapsed = clock.now() - acquisition_start;
                let action = &mut actions[anchor];
                if action.should_execute(elapsed) {
                    if let Some(t_zero) = action.execute(&mut ctx, log, None)? {
                        let index = ((t_zero - acquisition_start).max(0.0) * rate).round() as usize;
                        self.t_zero = Some(t_zero);
                        self.data_index = Some(index);
                        self.timings.push(StepTiming {
                            step: action.step(),
                            timing: ActionTiming::new(0.0, 0.0),
                        });
                        info!(
                            data_index = index,
                            delay_ms = (t_zero - acquisition_start) * 1e3,
                            "Time zero established"
                        );
                    }
                }
            }

            if let Some(t_zero) = self.t_zero {
                for (i, action) in actions.iter_mut().enumerate() {
                    if i == anchor || !action.should_execute(clock.now() - t_zero) {
                        continue;
                    }
                    if let Some(done) = action.execute(&mut ctx, log, Some(t_zero))? {
                        self.timings.push(StepTiming {
                            step: action.step(),
                            timing: ActionTiming::new(action.offset_s(), done - t_zero),
                        });
                    }
                }
            }

            if stop.is_requested() {
                let reason = stop.reason();
                let shortfall = self.window_shortfall();
                if reason != Some(StopReason::ProtocolComplete) || shortfall == 0 {
                    self.stop_reason = reason;
                    debug!(reason = ?self.stop_reason, "Stop requested");
                    return Ok(());
                }

                // The protocol ended before the waveform window was filled.
                let now = clock.now();
                let deadline = *completion_deadline.get_or_insert_with(|| {
                    debug!(
                        missing_samples = shortfall,
                        "Holding end of recording until the waveform window is filled"
                    );
                    now + shortfall as f64 / rate + self.settings.first_data_timeout.as_secs_f64()
                });
                if now >= deadline {
                    warn!(
                        missing_samples = shortfall,
                        "Device stopped delivering before the waveform window was filled"
                    );
                    self.stop_reason = reason;
                    return Ok(());
                }
            }

            if buffer_full || self.buffer.len() > overrun_limit {
                warn!(
                    samples = self.buffer.len(),
                    limit = overrun_limit,
                    capacity = self.buffer.capacity(),
                    "Acquisition buffer overrun; stopping with partial data"
                );
                self.overrun = true;
                self.stop_reason = Some(StopReason::Overrun);
                self.transition(SessionState::Overrun);
                return Ok(());
            }

            if status.available == 0 {
                clock.sleep(self.settings.idle_wait);
            }
        }
    }

    /// Samples still missing from the window `data_index .. data_index + nominal`.
    fn window_shortfall(&self) -> usize {
        match self.data_index {
            Some(index) => (index + self.settings.nominal_samples).saturating_sub(self.buffer.len()),
            None => 0,
        }
    }

    /// Trim the buffer to the waveform starting at time zero.
    pub fn finish(mut self) -> AcquisitionResult {
        let overrun = self.state == SessionState::Overrun;
        self.transition(SessionState::Trimming);

        let samples = match self.data_index {
            Some(index) => self
                .buffer
                .window(index, self.settings.nominal_samples)
                .to_vec(),
            None => {
                warn!(
                    samples = self.buffer.len(),
                    "Time zero was never established; returning the untrimmed buffer"
                );
                self.buffer.as_slice().to_vec()
            }
        };

        let final_state = if overrun {
            SessionState::Overrun
        } else {
            SessionState::Complete
        };
        self.transition(final_state);

        AcquisitionResult {
            true_sample_count: samples.len(),
            raw_sample_count: self.buffer.len(),
            samples,
            data_index: self.data_index,
            t_zero: self.t_zero,
            acquisition_start: self.acquisition_start,
            anchored: self.data_index.is_some(),
            lost: self.lost,
            corrupted: self.corrupted,
            lost_samples: self.lost_samples,
            corrupted_samples: self.corrupted_samples,
            overrun: self.overrun,
            stop_reason: self.stop_reason,
            flushed_samples: self.flushed_samples,
            iterations: self.iterations,
            zero_sample_warnings: self.zero_sample_warnings,
            timings: self.timings,
            final_state,
        }
    }
}
