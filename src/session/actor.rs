//! Session actor: the only owner of state, attempt counter and link

use super::pending::{PendingRequests, Reply};
use super::{ConnectionTarget, ReconnectPolicy, SessionConfig, SessionEvent, SessionState};
use crate::error::{ConnectError, RequestError, TransportError};
use crate::protocol;
use crate::transport::{CloseReason, Inbound, Outbound, Transport, TransportChannels};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

type OpenResult = Result<TransportChannels, TransportError>;

/// Requests from `SessionHandle`
pub(crate) enum Command {
    Connect {
        target: ConnectionTarget,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Request {
        request_type: String,
        data: Option<Value>,
        reply: Reply,
    },
}

/// State plus the resources that only exist in that state
enum Phase {
    Idle,
    Connecting {
        open: JoinHandle<OpenResult>,
        deadline: Instant,
    },
    Authenticating {
        link: TransportChannels,
        deadline: Instant,
    },
    Connected {
        link: TransportChannels,
    },
    /// User asked to disconnect; the resulting close never reconnects
    Closing {
        link: TransportChannels,
        deadline: Instant,
    },
    ReconnectPending {
        at: Instant,
    },
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Self::Idle => SessionState::Idle,
            Self::Connecting { .. } => SessionState::Connecting,
            Self::Authenticating { .. } => SessionState::Authenticating,
            Self::Connected { .. } => SessionState::Connected,
            Self::Closing { .. } => SessionState::Closing,
            Self::ReconnectPending { .. } => SessionState::ReconnectPending,
        }
    }
}

/// What woke the actor up
enum Wake {
    Command(Option<Command>),
    Opened(Result<OpenResult, JoinError>),
    Inbound(Option<Inbound>),
    Deadline,
    ReconnectDue,
}

pub(crate) struct Actor {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    policy: Arc<RwLock<ReconnectPolicy>>,
    state_tx: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    phase: Phase,
    /// Reconnects scheduled since the last success or user action
    attempts: u32,
    /// Target of the most recent attempt; reconnects always reuse it
    last_target: Option<ConnectionTarget>,
    connect_waiter: Option<oneshot::Sender<Result<(), ConnectError>>>,
    disconnect_waiters: Vec<oneshot::Sender<()>>,
    pending: PendingRequests,
}

impl Actor {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: SessionConfig,
        policy: Arc<RwLock<ReconnectPolicy>>,
        state_tx: watch::Sender<SessionState>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            transport,
            config,
            policy,
            state_tx,
            events,
            phase: Phase::Idle,
            attempts: 0,
            last_target: None,
            connect_waiter: None,
            disconnect_waiters: Vec::new(),
            pending: PendingRequests::new(),
        }
    }

    /// Process commands and link activity until every handle is dropped
    pub async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            match self.next_wake(&mut cmd_rx).await {
                Wake::Command(Some(cmd)) => self.handle_command(cmd),
                Wake::Command(None) => break,
                Wake::Opened(result) => self.handle_opened(result),
                Wake::Inbound(msg) => self.handle_inbound(msg),
                Wake::Deadline => self.handle_deadline(),
                Wake::ReconnectDue => self.handle_reconnect_due(),
            }
        }

        debug!("Session handles dropped, stopping actor");
        self.teardown();
    }

    async fn next_wake(&mut self, cmd_rx: &mut mpsc::Receiver<Command>) -> Wake {
        match &mut self.phase {
            Phase::Idle => Wake::Command(cmd_rx.recv().await),
            Phase::Connecting { open, deadline } => tokio::select! {
                cmd = cmd_rx.recv() => Wake::Command(cmd),
                result = open => Wake::Opened(result),
                _ = sleep_until(*deadline) => Wake::Deadline,
            },
            Phase::Authenticating { link, deadline } | Phase::Closing { link, deadline } => {
                tokio::select! {
                    cmd = cmd_rx.recv() => Wake::Command(cmd),
                    msg = link.rx.recv() => Wake::Inbound(msg),
                    _ = sleep_until(*deadline) => Wake::Deadline,
                }
            }
            Phase::Connected { link } => tokio::select! {
                cmd = cmd_rx.recv() => Wake::Command(cmd),
                msg = link.rx.recv() => Wake::Inbound(msg),
            },
            Phase::ReconnectPending { at } => tokio::select! {
                cmd = cmd_rx.recv() => Wake::Command(cmd),
                _ = sleep_until(*at) => Wake::ReconnectDue,
            },
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { target, reply } => self.handle_connect(target, reply),
            Command::Disconnect { reply } => self.handle_disconnect(reply),
            Command::Request {
                request_type,
                data,
                reply,
            } => self.handle_request(request_type, data, reply),
        }
    }

    fn handle_connect(
        &mut self,
        target: ConnectionTarget,
        reply: oneshot::Sender<Result<(), ConnectError>>,
    ) {
        let state = self.phase.state();
        if !state.accepts_connect() {
            let _ = reply.send(Err(ConnectError::AlreadyConnecting { state }));
            return;
        }

        if state == SessionState::ReconnectPending {
            info!("Pending reconnect cancelled by new connect");
        }
        // Fresh user attempt: cancels any reconnect timer and restarts the count
        self.attempts = 0;
        self.connect_waiter = Some(reply);
        self.start_attempt(target);
    }

    fn handle_disconnect(&mut self, reply: oneshot::Sender<()>) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {
                let _ = reply.send(());
            }
            Phase::Connected { link } => {
                info!("Disconnecting");
                // Socket may already be gone; the close path below still runs
                let _ = link.tx.try_send(Outbound::Close);
                self.pending.fail_all(RequestError::ConnectionLost);
                self.disconnect_waiters.push(reply);
                self.phase = Phase::Closing {
                    link,
                    deadline: Instant::now() + self.config.close_timeout,
                };
                self.publish_state();
            }
            closing @ Phase::Closing { .. } => {
                self.phase = closing;
                self.disconnect_waiters.push(reply);
            }
            Phase::Connecting { open, .. } => {
                info!("Connection attempt cancelled");
                open.abort();
                self.finish_user_disconnect(reply);
            }
            Phase::Authenticating { link, .. } => {
                info!("Handshake cancelled");
                let _ = link.tx.try_send(Outbound::Close);
                self.finish_user_disconnect(reply);
            }
            Phase::ReconnectPending { .. } => {
                info!("Pending reconnect cancelled");
                self.finish_user_disconnect(reply);
            }
        }
    }

    /// Phase is already `Idle`; settle waiters and announce
    fn finish_user_disconnect(&mut self, reply: oneshot::Sender<()>) {
        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Err(ConnectError::Cancelled));
        }
        self.attempts = 0;
        self.publish_state();
        self.emit(SessionEvent::Disconnected);
        let _ = reply.send(());
    }

    fn handle_request(&mut self, request_type: String, data: Option<Value>, reply: Reply) {
        let Phase::Connected { link } = &self.phase else {
            let _ = reply.send(Err(RequestError::NotConnected));
            return;
        };

        let request_id = self.pending.register(&request_type, reply);
        debug!(
            "Request {} #{} ({} pending)",
            request_type,
            request_id,
            self.pending.len()
        );

        let sent = link.tx.try_send(Outbound::Request {
            request_type,
            request_id: request_id.clone(),
            data,
        });
        if let Err(e) = sent {
            let error = match e {
                TrySendError::Full(_) => RequestError::Backpressure,
                TrySendError::Closed(_) => RequestError::ConnectionLost,
            };
            if let Some(reply) = self.pending.remove(&request_id) {
                let _ = reply.send(Err(error));
            }
        }
    }

    // =========================================================================
    // Connection attempts
    // =========================================================================

    fn start_attempt(&mut self, target: ConnectionTarget) {
        let url = target.url();
        info!("Connecting to {}", url);
        self.last_target = Some(target);

        let transport = self.transport.clone();
        let open = tokio::spawn(async move { transport.open(&url).await });
        self.phase = Phase::Connecting {
            open,
            deadline: Instant::now() + self.config.connect_timeout,
        };
        self.publish_state();
    }

    fn handle_opened(&mut self, result: Result<OpenResult, JoinError>) {
        let Phase::Connecting { deadline, .. } = self.phase else {
            return;
        };

        match result {
            Ok(Ok(link)) if self.transport.requires_handshake() => {
                debug!("Socket open, waiting for Hello");
                self.phase = Phase::Authenticating { link, deadline };
                self.publish_state();
            }
            Ok(Ok(link)) => self.become_connected(link),
            Ok(Err(e)) => self.fail_attempt(ConnectError::Transport(e)),
            Err(e) => self.fail_attempt(ConnectError::Transport(TransportError::Closed {
                code: None,
                reason: format!("transport task failed: {}", e),
            })),
        }
    }

    fn become_connected(&mut self, link: TransportChannels) {
        self.phase = Phase::Connected { link };
        self.attempts = 0;
        if let Some(target) = &self.last_target {
            info!("Connected to {}", target.url());
        }
        self.publish_state();
        self.emit(SessionEvent::Connected);
        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Connecting/Authenticating failed
    fn fail_attempt(&mut self, error: ConnectError) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Connecting { open, .. } => open.abort(),
            Phase::Authenticating { link, .. } => {
                let _ = link.tx.try_send(Outbound::Close);
            }
            _ => {}
        }

        warn!("Connection failed: {}", error);
        self.emit(SessionEvent::ConnectFailed(error.clone()));
        if let Some(waiter) = self.connect_waiter.take() {
            let _ = waiter.send(Err(error.clone()));
        }

        if error.is_transient() {
            self.schedule_reconnect();
        } else {
            self.publish_state();
        }
    }

    // =========================================================================
    // Link traffic
    // =========================================================================

    fn handle_inbound(&mut self, msg: Option<Inbound>) {
        // Channel ending without a Closed message is an unsolicited close
        let msg = msg.unwrap_or_else(|| Inbound::Closed(CloseReason::new(None, "link dropped")));

        match self.phase.state() {
            SessionState::Authenticating => self.handle_handshake(msg),
            SessionState::Connected => self.handle_connected(msg),
            SessionState::Closing => {
                if let Inbound::Closed(reason) = msg {
                    debug!("Close confirmed: {:?}", reason);
                    self.finish_close();
                }
            }
            _ => {}
        }
    }

    fn handle_handshake(&mut self, msg: Inbound) {
        match msg {
            Inbound::Hello { challenge } => {
                let Phase::Authenticating { link, .. } = &self.phase else {
                    return;
                };
                let authentication = match (&challenge, &self.last_target) {
                    (Some(challenge), Some(target)) => {
                        Some(protocol::authentication_string(&target.credential, challenge))
                    }
                    _ => None,
                };
                debug!("Hello received (auth required: {})", challenge.is_some());
                let identify = Outbound::Identify {
                    authentication,
                    event_subscriptions: self.config.event_subscriptions,
                };
                if link.tx.try_send(identify).is_err() {
                    self.fail_attempt(ConnectError::Transport(TransportError::Closed {
                        code: None,
                        reason: "link closed during handshake".into(),
                    }));
                }
            }
            Inbound::Identified => {
                if let Phase::Authenticating { link, .. } =
                    std::mem::replace(&mut self.phase, Phase::Idle)
                {
                    self.become_connected(link);
                }
            }
            Inbound::Closed(reason) if reason.is_auth_failure() => {
                self.fail_attempt(ConnectError::AuthRejected {
                    reason: reason.message,
                });
            }
            Inbound::Closed(reason) => self.fail_attempt(ConnectError::Transport(reason.into())),
            other => debug!("Ignoring message during handshake: {:?}", other),
        }
    }

    fn handle_connected(&mut self, msg: Inbound) {
        match msg {
            Inbound::Response { request_id, result } => {
                self.pending.resolve(&request_id, result);
            }
            Inbound::Event { name, data } => {
                self.emit(SessionEvent::Remote { name, data });
            }
            Inbound::Closed(reason) => self.connection_lost(reason),
            other => debug!("Ignoring message while connected: {:?}", other),
        }
    }

    /// Unsolicited close of an established connection
    fn connection_lost(&mut self, reason: CloseReason) {
        self.phase = Phase::Idle;
        let failed = self.pending.fail_all(RequestError::ConnectionLost);
        let error = TransportError::from(reason);
        warn!("Connection lost: {} ({} requests failed)", error, failed);
        self.emit(SessionEvent::ConnectionLost(error));
        self.schedule_reconnect();
    }

    fn finish_close(&mut self) {
        self.phase = Phase::Idle;
        self.attempts = 0;
        info!("Disconnected");
        self.publish_state();
        self.emit(SessionEvent::Disconnected);
        for waiter in self.disconnect_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn handle_deadline(&mut self) {
        match self.phase.state() {
            SessionState::Connecting | SessionState::Authenticating => {
                let after_ms = millis(self.config.connect_timeout);
                self.fail_attempt(ConnectError::Transport(TransportError::Timeout { after_ms }));
            }
            SessionState::Closing => {
                warn!("Transport did not confirm close, dropping link");
                self.finish_close();
            }
            _ => {}
        }
    }

    fn handle_reconnect_due(&mut self) {
        match self.last_target.clone() {
            Some(target) => {
                info!("Reconnect attempt {}", self.attempts);
                self.start_attempt(target);
            }
            None => {
                self.phase = Phase::Idle;
                self.publish_state();
            }
        }
    }

    /// Enter `ReconnectPending`, or `Idle` if disabled or exhausted
    ///
    /// The policy is read now, so edits apply from this schedule on.
    fn schedule_reconnect(&mut self) {
        let policy = self.policy.read().normalized();

        if !policy.enabled || self.last_target.is_none() {
            self.phase = Phase::Idle;
            self.publish_state();
            return;
        }

        if self.attempts >= policy.max_attempts {
            info!("Giving up after {} reconnect attempts", self.attempts);
            self.phase = Phase::Idle;
            self.publish_state();
            self.emit(SessionEvent::ReconnectExhausted);
            return;
        }

        self.attempts += 1;
        let delay = policy.next_delay();
        info!(
            "Reconnect {}/{} in {} ms",
            self.attempts,
            policy.max_attempts,
            delay.as_millis()
        );
        self.phase = Phase::ReconnectPending {
            at: Instant::now() + delay,
        };
        self.publish_state();
        self.emit(SessionEvent::ReconnectScheduled {
            attempt: self.attempts,
            delay,
        });
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn publish_state(&self) {
        let state = self.phase.state();
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!("Session state: {}", state);
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn teardown(&mut self) {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Connecting { open, .. } => open.abort(),
            Phase::Authenticating { link, .. }
            | Phase::Connected { link }
            | Phase::Closing { link, .. } => {
                let _ = link.tx.try_send(Outbound::Close);
            }
            _ => {}
        }
        self.pending.fail_all(RequestError::ConnectionLost);
        self.publish_state();
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
