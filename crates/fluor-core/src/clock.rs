//! Time sources for protocol scheduling.
//!
//! Everything that timestamps or waits during a run goes through a [`Clock`]
//! so the same scheduling code can run against wall time on an instrument or
//! against virtual time in tests. Timestamps are `f64` seconds since the
//! clock's own origin; only differences between them are meaningful.
//!
//! [`MonotonicClock`] is backed by [`Instant`] and sleeps with
//! [`precise_sleep`]. [`SimulatedClock`] only moves when something sleeps on
//! it, which makes timing tests deterministic and fast.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Final stretch of a wait that is spun rather than slept.
///
/// OS sleeps routinely overshoot by a scheduler tick; spinning the last
/// couple of milliseconds keeps action latency well under one sample at
/// kilohertz rates.
pub const SPIN_THRESHOLD: Duration = Duration::from_millis(2);

/// Monotonic time source with a blocking sleep.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Seconds elapsed since this clock's origin.
    fn now(&self) -> f64;

    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Sleep for `duration` with sub-millisecond accuracy.
///
/// Uses a coarse OS sleep for everything but the last [`SPIN_THRESHOLD`],
/// then spins on [`Instant`] until the deadline.
pub fn precise_sleep(duration: Duration) {
    let deadline = Instant::now() + duration;
    if duration > SPIN_THRESHOLD {
        std::thread::sleep(duration - SPIN_THRESHOLD);
    }
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

/// Wall-clock time source backed by [`Instant`].
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn sleep(&self, duration: Duration) {
        precise_sleep(duration);
    }
}

/// Virtual time source for tests and simulation.
///
/// Time starts at zero and advances only through [`Clock::sleep`] or
/// [`SimulatedClock::advance`]. Stored as integer nanoseconds so repeated
/// small steps do not accumulate rounding error.
#[derive(Debug, Default)]
pub struct SimulatedClock {
    nanos: AtomicU64,
}

impl SimulatedClock {
    /// Create a simulated clock at t = 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward without blocking.
    pub fn advance(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Current virtual time as a [`Duration`] since the origin.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
