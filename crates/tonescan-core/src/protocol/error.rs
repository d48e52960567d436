//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to the colorimeter
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Host has no serial capability
    #[error("Serial access is not available in this environment: {0}")]
    UnsupportedEnvironment(String),

    /// Operator dismissed the device prompt
    #[error("Device selection was cancelled")]
    SelectionCancelled,

    /// No matching device is attached
    #[error("No authorized colorimeter found")]
    DeviceNotFound,

    /// Port could not be opened
    #[error("Failed to open {port}: {reason}")]
    LinkOpenFailed {
        /// Port path
        port: String,
        /// OS or driver message
        reason: String,
    },

    /// Output channel failed
    #[error("Write to device failed: {0}")]
    LinkWriteFailed(String),

    /// Input channel failed
    #[error("Read from device failed: {0}")]
    LinkReadFailed(String),

    /// Reply had the wrong length
    #[error("Malformed response: expected {expected} bytes, got {actual}")]
    MalformedResponse {
        /// Required length
        expected: usize,
        /// Length received
        actual: usize,
    },

    /// Decoded triple is not a usable color
    #[error("Invalid reading from device: L={l} a={a} b={b}")]
    InvalidReading {
        /// Lightness as decoded
        l: f32,
        /// Green-red axis as decoded
        a: f32,
        /// Blue-yellow axis as decoded
        b: f32,
    },

    /// Reply did not complete before the deadline
    #[error("Measurement timed out: received {received} of {expected} bytes")]
    MeasurementTimeout {
        /// Bytes collected before giving up
        received: usize,
        /// Bytes required
        expected: usize,
    },

    /// Scan failed for good, after any retry
    #[error("Measurement failed after {attempts} attempt(s): {source}")]
    MeasurementFailed {
        /// Attempts made
        attempts: u8,
        /// Last failure
        #[source]
        source: Box<ProtocolError>,
    },

    /// Another connect holds the session
    #[error("A connection attempt is already in progress")]
    ConnectInProgress,

    /// Operation needs an open link
    #[error("Not connected to colorimeter")]
    NotConnected,

    /// A link is already open
    #[error("Already connected")]
    AlreadyConnected,
}

impl ProtocolError {
    /// Whether a full reconnect is expected to clear this failure.
    ///
    /// Only these errors trigger the scan retry; everything else ends the
    /// scan call immediately.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::MeasurementTimeout { .. }
                | ProtocolError::MalformedResponse { .. }
                | ProtocolError::InvalidReading { .. }
                | ProtocolError::LinkReadFailed(_)
        )
    }

    /// The innermost error for wrapped failures
    pub fn root_cause(&self) -> &ProtocolError {
        match self {
            ProtocolError::MeasurementFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
