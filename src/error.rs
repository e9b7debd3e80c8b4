use thiserror::Error;

/// Error types for netgauge operations.
///
/// The variants map directly onto the failure classes a test can hit:
/// transport problems, malformed framing, protocol violations signalled by
/// the peer, deadline expiry, and invalid input caught before any I/O.
///
/// # Examples
///
/// ```
/// use netgauge::Error;
///
/// fn check_streams(n: usize) -> Result<(), Error> {
///     if n == 0 || n > 128 {
///         return Err(Error::Config(format!("invalid stream count: {}", n)));
///     }
///     Ok(())
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error during network operations.
    ///
    /// Wraps `std::io::Error` for connect failures, read/write failures,
    /// and unexpected EOF on either the control or a data connection.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration rejected before any I/O took place.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A second test or server was requested while one is active.
    #[error("Already running: {0}")]
    AlreadyRunning(String),

    /// Malformed control-channel framing: bad length prefix, oversized
    /// message, or a short cookie read.
    #[error("Framing error: {0}")]
    Framing(String),

    /// The peer violated the control-channel state machine.
    #[error("{0}")]
    Protocol(ProtocolError),

    /// A control read or connect exceeded its deadline.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The caller requested an abort. Reported through the `Cancelled`
    /// event, never through `Error` events.
    #[error("Test cancelled")]
    Cancelled,
}

/// Protocol-level failures, distinguished so callers can react to a
/// peer-signalled refusal differently from a garbled exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Access denied by server")]
    AccessDenied,

    #[error("Server error")]
    ServerError,

    #[error("Server terminated the connection")]
    ServerTerminate,

    #[error("Unexpected protocol state: {0}")]
    UnexpectedState(String),

    #[error("Protocol error: {0}")]
    Other(String),
}

impl Error {
    /// True when the error is the cancellation sentinel rather than a
    /// genuine failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub(crate) fn unexpected_state(state: impl std::fmt::Display) -> Self {
        Error::Protocol(ProtocolError::UnexpectedState(state.to_string()))
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

/// Result type alias for netgauge operations.
pub type Result<T> = std::result::Result<T, Error>;
