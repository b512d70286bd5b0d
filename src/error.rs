//! Centralized error types
//!
//! Connection-level failures are reported as session events, per-call
//! failures as `RequestError` to the caller that issued the call.
//! `Error` covers everything outside the session (config, runtime).
//! Use `Result<T>` as shorthand for `std::result::Result<T, Error>`.

use std::fmt;
use std::path::PathBuf;

use crate::session::SessionState;

// =============================================================================
// Transport
// =============================================================================

/// Failure of the underlying socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Socket could not be opened (refused, DNS, TLS...)
    Refused { url: String, message: String },
    /// Connect or handshake did not finish in time
    Timeout { after_ms: u64 },
    /// Peer sent something we could not decode or did not expect
    Protocol { message: String },
    /// Socket closed by the peer or by an I/O error
    Closed { code: Option<u16>, reason: String },
}

impl std::error::Error for TransportError {}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused { url, message } => write!(f, "Cannot connect to {}: {}", url, message),
            Self::Timeout { after_ms } => write!(f, "Timed out after {} ms", after_ms),
            Self::Protocol { message } => write!(f, "Protocol violation: {}", message),
            Self::Closed { code: Some(code), reason } if !reason.is_empty() => {
                write!(f, "Connection closed ({}): {}", code, reason)
            }
            Self::Closed { code: Some(code), .. } => write!(f, "Connection closed ({})", code),
            Self::Closed { code: None, reason } if !reason.is_empty() => {
                write!(f, "Connection closed: {}", reason)
            }
            Self::Closed { code: None, .. } => write!(f, "Connection closed"),
        }
    }
}

// =============================================================================
// Connect
// =============================================================================

/// Why a connection attempt did not reach `Connected`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Transient socket failure, eligible for auto-reconnect
    Transport(TransportError),
    /// Credential rejected by the backend. Never retried.
    AuthRejected { reason: String },
    /// A connection attempt or session is already in progress
    AlreadyConnecting { state: SessionState },
    /// The attempt was cancelled by `disconnect()` or a newer `connect()`
    Cancelled,
    /// The session manager task is gone
    ManagerStopped,
}

impl ConnectError {
    /// Whether auto-reconnect may retry after this failure
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(source) => Some(source),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "{}", e),
            Self::AuthRejected { reason } => write!(f, "Authentication rejected: {}", reason),
            Self::AlreadyConnecting { state } => {
                write!(f, "Already connecting (state: {})", state)
            }
            Self::Cancelled => write!(f, "Connection attempt cancelled"),
            Self::ManagerStopped => write!(f, "Session manager stopped"),
        }
    }
}

impl From<TransportError> for ConnectError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// =============================================================================
// Request
// =============================================================================

/// Failure of a single `request()` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Session is not `Connected`; nothing was sent
    NotConnected,
    /// Connection closed before the response arrived
    ConnectionLost,
    /// Backend answered with a failed request status
    Rejected {
        request_type: String,
        code: u16,
        comment: Option<String>,
    },
    /// No response within the request timeout
    Timeout { request_type: String },
    /// Outbound queue to the transport is full
    Backpressure,
}

impl RequestError {
    /// Whether this failure means the whole connection is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::NotConnected | Self::ConnectionLost)
    }
}

impl std::error::Error for RequestError {}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Not connected"),
            Self::ConnectionLost => write!(f, "Connection lost"),
            Self::Rejected {
                request_type,
                code,
                comment: Some(comment),
            } => write!(f, "{} failed ({}): {}", request_type, code, comment),
            Self::Rejected {
                request_type, code, ..
            } => write!(f, "{} failed ({})", request_type, code),
            Self::Timeout { request_type } => write!(f, "{} timed out", request_type),
            Self::Backpressure => write!(f, "Outbound queue full"),
        }
    }
}

// =============================================================================
// Crate-level
// =============================================================================

/// Errors outside the session lifecycle
#[derive(Debug)]
pub enum Error {
    /// File system operation failed
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Invalid config value
    ConfigValidation { field: &'static str, reason: String },
    /// Config could not be serialized
    ConfigSerialize { source: toml::ser::Error },
    /// Tokio runtime creation failed
    Runtime { source: std::io::Error },
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } | Self::Runtime { source } => Some(source),
            Self::ConfigSerialize { source } => Some(source),
            Self::ConfigValidation { .. } => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, .. } => write!(f, "IO error: {}", path.display()),
            Self::ConfigValidation { field, reason } => {
                write!(f, "Invalid {}: {}", field, reason)
            }
            Self::ConfigSerialize { .. } => write!(f, "Cannot serialize config"),
            Self::Runtime { .. } => write!(f, "Failed to create runtime"),
        }
    }
}

/// Alias for Result with Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let e = TransportError::Closed {
            code: Some(1006),
            reason: String::new(),
        };
        assert_eq!(e.to_string(), "Connection closed (1006)");

        let e = TransportError::Refused {
            url: "ws://localhost:4455".into(),
            message: "connection refused".into(),
        };
        assert!(e.to_string().contains("ws://localhost:4455"));
    }

    #[test]
    fn test_only_transport_failures_are_transient() {
        assert!(ConnectError::Transport(TransportError::Timeout { after_ms: 10 }).is_transient());
        assert!(!ConnectError::AuthRejected {
            reason: "bad".into()
        }
        .is_transient());
        assert!(!ConnectError::Cancelled.is_transient());
    }

    #[test]
    fn test_request_error_disconnect_classification() {
        assert!(RequestError::NotConnected.is_disconnect());
        assert!(RequestError::ConnectionLost.is_disconnect());
        assert!(!RequestError::Rejected {
            request_type: "GetInputMute".into(),
            code: 600,
            comment: None,
        }
        .is_disconnect());
    }
}
