//! Core types and traits shared by the fluor-daq crates.
//!
//! - [`hardware`]: the [`HardwarePort`] capability surface every instrument
//!   backend implements, plus device status types and pin assignments.
//! - [`clock`]: monotonic and simulated time sources and the
//!   high-resolution sleep used for action waits.
//! - [`event_log`]: the per-run timeline of labelled events.
//! - [`error`]: hardware and event-log error types.

pub mod clock;
pub mod error;
pub mod event_log;
pub mod hardware;

pub use clock::{precise_sleep, Clock, MonotonicClock, SimulatedClock};
pub use error::{EventLogError, HardwareError, HardwareErrorKind, HardwareResult};
pub use event_log::{ActionTiming, Event, EventLog, EventRecord};
pub use hardware::{AcquisitionStatus, DeviceState, HardwarePort};
