//! Session lifecycle
//!
//! Owns the single connection to the backend: handshake, request
//! correlation, disconnect detection and auto-reconnect.
//!
//! Transitions:
//! - `Idle` → `Connecting`: `connect()`
//! - `Connecting` → `Authenticating`: socket open (Hello/Identify follows)
//! - `Authenticating` → `Connected`: Identified
//! - `Connecting`/`Authenticating` → `ReconnectPending` or `Idle`: refused,
//!   timed out or rejected; only transient failures are retried
//! - `Connected` → `Closing` → `Idle`: `disconnect()`
//! - `Connected` → `ReconnectPending` or `Idle`: peer closed the link
//! - `ReconnectPending` → `Connecting`: delay elapsed
//! - `ReconnectPending` → `Idle`: attempts exhausted, `disconnect()`
//!   (a new `connect()` goes straight to `Connecting`)
//!
//! All transitions happen inside one actor task; `SessionHandle` only sends
//! commands and observes state/events.

mod actor;
mod pending;
pub mod policy;

pub use policy::ReconnectPolicy;

use crate::constants::{CLOSE_TIMEOUT_MS, CONNECT_TIMEOUT_MS, EVENT_CAPACITY, REQUEST_TIMEOUT_MS};
use crate::error::{ConnectError, RequestError, TransportError};
use crate::protocol::EVENT_SUBSCRIPTIONS;
use crate::transport::Transport;
use parking_lot::RwLock;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use self::actor::{Actor, Command};

// =============================================================================
// Types
// =============================================================================

/// Where to connect
///
/// Immutable once an attempt starts; reconnects reuse the last target.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub credential: String,
}

impl ConnectionTarget {
    pub fn new(host: impl Into<String>, port: u16, credential: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            credential: credential.into(),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    Authenticating,
    Connected,
    Closing,
    ReconnectPending,
}

impl SessionState {
    /// States from which `connect()` is accepted
    pub fn accepts_connect(&self) -> bool {
        matches!(self, Self::Idle | Self::ReconnectPending)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::ReconnectPending => "reconnect pending",
        };
        f.write_str(name)
    }
}

/// Events published to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Every state transition, in order
    StateChanged(SessionState),
    Connected,
    /// User-initiated disconnect completed
    Disconnected,
    /// An attempt failed before reaching `Connected`
    ConnectFailed(ConnectError),
    /// An established connection dropped without being asked to
    ConnectionLost(TransportError),
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// Attempts used up; the session is `Idle`
    ReconnectExhausted,
    /// Unsolicited backend event, passed through
    Remote { name: String, data: Value },
}

/// Session timing and handshake settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bound on Connecting + Authenticating
    pub connect_timeout: Duration,
    /// Bound on waiting for the transport to confirm a user close
    pub close_timeout: Duration,
    /// Bound on waiting for a request's response
    pub request_timeout: Duration,
    /// Event subscription mask sent in Identify
    pub event_subscriptions: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(CONNECT_TIMEOUT_MS),
            close_timeout: Duration::from_millis(CLOSE_TIMEOUT_MS),
            request_timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
            event_subscriptions: EVENT_SUBSCRIPTIONS,
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Entry point: spawns the session actor
pub struct SessionManager;

impl SessionManager {
    /// Spawn the session actor on the current tokio runtime
    ///
    /// The actor stops once every `SessionHandle` has been dropped.
    pub fn spawn<T: Transport>(
        transport: T,
        config: SessionConfig,
        policy: ReconnectPolicy,
    ) -> SessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(crate::constants::CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let policy = Arc::new(RwLock::new(policy));

        let actor = Actor::new(
            Arc::new(transport),
            config,
            policy.clone(),
            state_tx,
            events.clone(),
        );
        tokio::spawn(actor.run(cmd_rx));

        SessionHandle {
            cmd_tx,
            state_rx,
            events,
            policy,
            request_timeout: config.request_timeout,
        }
    }
}

/// Cheap, cloneable handle to the session actor
#[derive(Clone)]
pub struct SessionHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    policy: Arc<RwLock<ReconnectPolicy>>,
    request_timeout: Duration,
}

impl SessionHandle {
    /// Connect to `target`
    ///
    /// Resolves once this attempt reaches `Connected`, or fails with the
    /// attempt's error. Reconnects scheduled after a failure are reported
    /// through events only.
    pub async fn connect(&self, target: ConnectionTarget) -> Result<(), ConnectError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Connect { target, reply })
            .await
            .map_err(|_| ConnectError::ManagerStopped)?;
        rx.await.map_err(|_| ConnectError::ManagerStopped)?
    }

    /// Disconnect and cancel any pending reconnect
    ///
    /// Idempotent. Never fails; close errors are logged by the actor.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Issue an RPC request and wait for its response
    ///
    /// Fails immediately with `NotConnected` outside `Connected`.
    pub async fn request(
        &self,
        request_type: &str,
        data: Option<Value>,
    ) -> Result<Value, RequestError> {
        if self.state() != SessionState::Connected {
            return Err(RequestError::NotConnected);
        }

        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Request {
                request_type: request_type.to_string(),
                data,
                reply,
            })
            .await
            .map_err(|_| RequestError::NotConnected)?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::ConnectionLost),
            Err(_) => Err(RequestError::Timeout {
                request_type: request_type.to_string(),
            }),
        }
    }

    /// Replace the reconnect policy
    ///
    /// Applies from the next scheduled reconnect. A timer that is already
    /// pending keeps the delay it was scheduled with.
    pub fn set_reconnect_policy(&self, policy: ReconnectPolicy) {
        *self.policy.write() = policy;
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        *self.policy.read()
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Level-triggered state observer
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Subscribe to session events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
