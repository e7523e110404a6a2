//! Run cancellation.
//!
//! A [`StopSignal`] is shared between the acquisition loop, the
//! `end_recording` action and any external caller that wants to cancel a
//! run. The loop checks it once per polling iteration. The first request
//! wins: a cancel arriving after the protocol already completed does not
//! relabel the run as cancelled.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Why an acquisition stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The `end_recording` step fired.
    ProtocolComplete,
    /// An external caller cancelled the run.
    Cancelled,
    /// The buffer grew past its safety limit.
    Overrun,
}

impl StopReason {
    fn to_code(self) -> u8 {
        match self {
            StopReason::ProtocolComplete => 1,
            StopReason::Cancelled => 2,
            StopReason::Overrun => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(StopReason::ProtocolComplete),
            2 => Some(StopReason::Cancelled),
            3 => Some(StopReason::Overrun),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    requested: AtomicBool,
    reason: AtomicU8,
}

/// Cloneable stop flag with a reason.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

impl StopSignal {
    /// Create a signal that has not been raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal. Returns `false` if it was already raised, in which
    /// case the original reason is kept.
    pub fn request(&self, reason: StopReason) -> bool {
        let first = self
            .inner
            .reason
            .compare_exchange(0, reason.to_code(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        self.inner.requested.store(true, Ordering::SeqCst);
        first
    }

    /// Request cancellation of the current run.
    pub fn cancel(&self) {
        self.request(StopReason::Cancelled);
    }

    /// True once any stop has been requested.
    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Reason of the first request, if any.
    pub fn reason(&self) -> Option<StopReason> {
        StopReason::from_code(self.inner.reason.load(Ordering::SeqCst))
    }

    /// Lower the signal for a new run.
    pub fn reset(&self) {
        self.inner.requested.store(false, Ordering::SeqCst);
        self.inner.reason.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let signal = StopSignal::new();
        assert!(!signal.is_requested());
        assert_eq!(signal.reason(), None);

        assert!(signal.request(StopReason::ProtocolComplete));
        assert!(!signal.request(StopReason::Cancelled));
        assert!(signal.is_requested());
        assert_eq!(signal.reason(), Some(StopReason::ProtocolComplete));
    }

    #[test]
    fn test_clones_share_state() {
        let signal = StopSignal::new();
        let handle = signal.clone();
        handle.cancel();
        assert_eq!(signal.reason(), Some(StopReason::Cancelled));

        signal.reset();
        assert!(!handle.is_requested());
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let signal = StopSignal::new();
        let handle = signal.clone();
        std::thread::spawn(move || handle.cancel())
            .join()
            .unwrap();
        assert!(signal.is_requested());
    }
}
