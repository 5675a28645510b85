//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to a UC2 controller
///
/// Correlation results (timeouts, rejected commands) are not errors; they are
/// reported as [`SendOutcome`](super::SendOutcome) values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Port could not be opened or configured
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// A wait ran out
    #[error("Connection timeout")]
    Timeout,

    /// No transport is open
    #[error("Not connected to device")]
    NotConnected,

    /// A controller answered but the session could not start
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// [`connect`](super::Session::connect) called while the loops run
    #[error("Already connected")]
    AlreadyConnected,

    /// A port opened but did not identify as a controller
    #[error("Handshake failed on {port}: {reason}")]
    HandshakeFailed {
        /// Candidate port
        port: String,
        /// What went wrong
        reason: String,
    },

    /// The device answered with the negated `qid`
    #[error("Device rejected command with qid {0}")]
    WrongCommand(i64),

    /// A reboot or explicit break ended the wait
    #[error("Query {0} interrupted by a reset")]
    Interrupted(i64),

    /// The blocking task behind an async send did not complete
    #[error("Background send failed: {0}")]
    TaskFailed(String),

    /// Payload is not a JSON object or carries a non-integer `qid`
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// No device at the given path
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transport or file I/O failed
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serialport::Error> for ProtocolError {
    fn from(e: serialport::Error) -> Self {
        ProtocolError::SerialError(e.to_string())
    }
}
