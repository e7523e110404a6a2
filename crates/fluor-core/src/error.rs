//! Error types for hardware access and event logging.
//!
//! [`HardwareError`] is what every [`HardwarePort`](crate::HardwarePort)
//! operation returns on failure. It carries a [`HardwareErrorKind`] so callers
//! can distinguish a lost link from a device fault or a timeout without string
//! matching, and the name of the operation that failed.
//!
//! [`EventLogError`] covers misuse of the [`EventLog`](crate::EventLog) and
//! its persistence.

use thiserror::Error;

// =============================================================================
// Hardware Errors
// =============================================================================

/// Category of a hardware failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareErrorKind {
    /// Link to the device was lost or a transfer failed.
    Communication,
    /// The device rejected a configuration (channel, range, rate).
    Configuration,
    /// The device did not reach the expected state in time.
    Timeout,
    /// The device reported an internal fault.
    Hardware,
}

impl std::fmt::Display for HardwareErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            HardwareErrorKind::Communication => "communication",
            HardwareErrorKind::Configuration => "configuration",
            HardwareErrorKind::Timeout => "timeout",
            HardwareErrorKind::Hardware => "hardware",
        };
        write!(f, "{}", label)
    }
}

/// Failure reported by a hardware operation.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Hardware {kind} error during '{operation}': {message}")]
pub struct HardwareError {
    /// Failure category.
    pub kind: HardwareErrorKind,
    /// Operation that failed (e.g. `start_acquisition`).
    pub operation: String,
    /// Human-readable detail.
    pub message: String,
}

impl HardwareError {
    /// Create a new hardware error.
    pub fn new(
        kind: HardwareErrorKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`HardwareErrorKind::Timeout`] error.
    pub fn timeout(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(HardwareErrorKind::Timeout, operation, message)
    }

    /// Shorthand for a [`HardwareErrorKind::Configuration`] error.
    pub fn configuration(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(HardwareErrorKind::Configuration, operation, message)
    }
}

/// Convenience alias for hardware operation results.
pub type HardwareResult<T> = std::result::Result<T, HardwareError>;

// =============================================================================
// Event Log Errors
// =============================================================================

/// Errors raised by the event log.
#[derive(Error, Debug)]
pub enum EventLogError {
    /// An event was logged before the timeline was anchored with `start`.
    #[error("Event log has not been started; call start() before logging '{label}'")]
    NotStarted {
        /// Label of the rejected event.
        label: String,
    },

    /// A required label is not present in the timeline.
    #[error("Event '{0}' not found in event log")]
    MissingEvent(String),

    /// Serialization failure.
    #[error("Event log serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// File I/O failure while saving or loading.
    #[error("Event log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hardware_error_display() {
        let err = HardwareError::new(
            HardwareErrorKind::Communication,
            "poll_status",
            "device unplugged",
        );
        assert_eq!(
            err.to_string(),
            "Hardware communication error during 'poll_status': device unplugged"
        );
    }

    #[test]
    fn test_shorthand_constructors() {
        assert_eq!(
            HardwareError::timeout("start_acquisition", "no data").kind,
            HardwareErrorKind::Timeout
        );
        assert_eq!(
            HardwareError::configuration("configure_input", "bad range").kind,
            HardwareErrorKind::Configuration
        );
    }

    #[test]
    fn test_not_started_names_label() {
        let err = EventLogError::NotStarted {
            label: "ared_on".into(),
        };
        assert!(err.to_string().contains("'ared_on'"));
    }
}
