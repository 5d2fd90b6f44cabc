//! Error types for event socket operations.
//!
//! All fallible operations in this crate return [`EslResult<T>`].  Errors are
//! classified into two axes for caller convenience:
//!
//! - **Connection errors** ([`EslError::is_connection_error`]): the command
//!   never got an answer because the socket went away. The background loop
//!   reconnects on its own, so retrying later is the right move.
//! - **Recoverable errors** ([`EslError::is_recoverable`]): the command failed
//!   but the connection is still usable (e.g. command rejected by the switch).

use thiserror::Error;

/// Result type alias for event socket operations
pub type EslResult<T> = Result<T, EslError>;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EslError {
    /// IO error from underlying TCP operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No connection is currently established
    #[error("Not connected to FreeSWITCH")]
    NotConnected,

    /// The connection dropped before a reply arrived
    #[error("Disconnected before a reply arrived")]
    ConnectionClosed,

    /// `auth` was answered with anything other than the accepted reply
    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    /// Framing error, the byte stream is no longer trustworthy
    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    /// A header line could not be split into key and value
    #[error("Invalid header format: {header}")]
    InvalidHeader { header: String },

    /// Too much unparsed data accumulated
    #[error("Buffer overflow: message size {size} exceeds limit {limit}")]
    BufferOverflow { size: usize, limit: usize },

    /// The switch reported a failure for this command
    #[error("Command failed: {reply_text}")]
    CommandFailed { reply_text: String },

    /// Timeout waiting for a dial, handshake read or command reply
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Rejected client configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EslError {
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::ProtocolError {
            message: message.into(),
        }
    }

    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthenticationFailed {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// `true` if the connection is still usable and the caller can retry.
    ///
    /// Recoverable: `CommandFailed`, `Timeout`.
    pub fn is_recoverable(&self) -> bool {
        match self {
            EslError::CommandFailed { .. } => true,
            EslError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// `true` if the command was lost to a disconnect; the background loop
    /// will re-establish the session.
    ///
    /// Matches: `Io`, `NotConnected`, `ConnectionClosed`.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            EslError::Io(_) | EslError::NotConnected | EslError::ConnectionClosed
        )
    }

    /// `true` for errors after which the byte stream cannot be re-synchronized.
    pub(crate) fn is_framing_error(&self) -> bool {
        matches!(
            self,
            EslError::ProtocolError { .. }
                | EslError::InvalidHeader { .. }
                | EslError::BufferOverflow { .. }
        )
    }
}
