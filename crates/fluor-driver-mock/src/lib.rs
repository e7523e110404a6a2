//! Simulated fluorescence instrument for fluor-daq.
//!
//! [`MockPort`] implements [`HardwarePort`](fluor_core::HardwarePort) without
//! any physical device. It behaves like the real analog front end closely
//! enough to exercise the protocol engine end to end:
//!
//! - a start-up delay spent in the `Prefill`/`Armed` states before samples flow
//! - hardware-paced sample production from a shared [`Clock`](fluor_core::Clock)
//! - a fluorescence induction signal that responds to the green LED and shutter
//! - scripted lost/corrupted sample bursts and stale buffered samples
//! - error injection per operation ([`ErrorConfig`])
//! - a timestamped command history for assertions
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fluor_core::{HardwarePort, SimulatedClock};
//! use fluor_driver_mock::MockPort;
//!
//! let clock = Arc::new(SimulatedClock::new());
//! let mut port = MockPort::builder(clock).startup_delay(Duration::ZERO).build();
//! port.configure_input(0, 5.0, 1000.0).unwrap();
//! port.start_acquisition().unwrap();
//! assert_eq!(port.poll_status().unwrap().available, 0);
//! ```

pub mod errors;
mod port;
mod rng;
mod signal;

pub use errors::{ErrorConfig, ErrorScenario, PortOp};
pub use port::{MockPort, MockPortBuilder, PortCommand, SampleFault, STALE_SAMPLE_V};
pub use rng::MockRng;
pub use signal::InductionModel;
