//! Error taxonomy shared by the discovery and connection sessions.
//!
//! Adapter-level failures never escape as panics: the sessions catch them at
//! their boundary, turn them into state transitions, and hand the caller a
//! [`ScaleError`].  Weight payloads of an unexpected length are *not* errors;
//! see [`crate::parse::decode_weight`].

use thiserror::Error;

/// Errors returned by the discovery and connection sessions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScaleError {
    /// Scan start/stop, connect, or GATT discovery failed inside the BLE stack.
    #[error("Bluetooth adapter error: {0}")]
    Adapter(String),

    /// The peripheral does not expose the named capability.
    #[error("{0} is not available on this device")]
    NotAvailable(&'static str),

    /// `start()` was called on a discovery session that is not stopped.
    #[error("Discovery is already active")]
    AlreadyActive,

    /// `connect()` was called while a connection is in progress or established.
    #[error("A connection is already in progress")]
    AlreadyConnecting,

    /// The adapter did not report a powered-on state in time.
    #[error("Bluetooth adapter is not ready (is Bluetooth turned on?)")]
    NotReady,

    /// A bounded adapter operation did not complete in time.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// A characteristic returned a payload that cannot be decoded.
    #[error("Invalid payload received")]
    InvalidPayload,

    /// The link dropped while a connection was still being set up.
    #[error("Connection was lost during setup")]
    LinkLost,
}

impl From<btleplug::Error> for ScaleError {
    fn from(e: btleplug::Error) -> Self {
        ScaleError::Adapter(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ScaleError>;
