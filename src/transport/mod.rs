//! Transport abstraction for message-level I/O
//!
//! Separates socket concerns from session logic:
//! - **Transport**: how messages reach the backend (WebSocket, test doubles...)
//! - **Session**: handshake, correlation, reconnection (handled in `session`)
//!
//! A transport does NOT handle:
//! - Authentication decisions (the session computes the Identify payload)
//! - Request correlation (the session owns pending requests)
//! - Reconnection logic (that's the session's job)
//!
//! # Lifecycle
//!
//! 1. `open()` a URL; returns once the socket is up
//! 2. Use the returned channels for communication
//! 3. The link runs until:
//!    - `Outbound::Close` is sent, OR
//!    - the peer closes or an I/O error occurs
//! 4. The transport reports `Inbound::Closed` and drops the inbound channel

pub mod websocket;

pub use websocket::WebSocketTransport;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{RequestError, TransportError};

/// Messages from the session to the backend
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Handshake reply to `Hello`
    Identify {
        authentication: Option<String>,
        event_subscriptions: u32,
    },
    /// RPC call tagged with a correlation id
    Request {
        request_type: String,
        request_id: String,
        data: Option<Value>,
    },
    /// Ask the transport to close the socket gracefully
    Close,
}

/// Credential challenge sent by the backend in `Hello`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub challenge: String,
    pub salt: String,
}

/// Why a link closed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseReason {
    /// WebSocket close code, if the peer sent one
    pub code: Option<u16>,
    pub message: String,
}

impl CloseReason {
    pub fn new(code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Backend refused the credential
    pub fn is_auth_failure(&self) -> bool {
        self.code == Some(crate::protocol::AUTH_FAILED_CLOSE_CODE)
    }
}

impl From<CloseReason> for TransportError {
    fn from(reason: CloseReason) -> Self {
        TransportError::Closed {
            code: reason.code,
            reason: reason.message,
        }
    }
}

/// Messages from the backend to the session
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// First message after the socket opens
    Hello { challenge: Option<AuthChallenge> },
    /// Handshake accepted
    Identified,
    /// Reply to a prior `Outbound::Request`
    Response {
        request_id: String,
        result: std::result::Result<Value, RequestError>,
    },
    /// Unsolicited server event
    Event { name: String, data: Value },
    /// Link is gone; no further messages follow
    Closed(CloseReason),
}

/// Channels for bidirectional communication with an open link
///
/// The transport owns the socket and communicates via these channels.
/// Dropping `tx` closes the socket; `rx` returning `None` without a prior
/// `Inbound::Closed` counts as an unsolicited close.
pub struct TransportChannels {
    /// Receive decoded messages from the backend
    pub rx: mpsc::Receiver<Inbound>,

    /// Send messages to the backend
    pub tx: mpsc::Sender<Outbound>,
}

/// Trait for transports the session manager can drive
///
/// # Example
///
/// ```ignore
/// let transport = WebSocketTransport::new();
/// let mut channels = transport.open("ws://localhost:4455").await?;
///
/// while let Some(msg) = channels.rx.recv().await {
///     println!("Received: {:?}", msg);
/// }
/// // Channel closed = link stopped
/// ```
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a link to `url`
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Refused` if the socket cannot be opened.
    async fn open(&self, url: &str) -> std::result::Result<TransportChannels, TransportError>;

    /// Whether the backend expects a Hello/Identify exchange before requests
    fn requires_handshake(&self) -> bool {
        true
    }
}
