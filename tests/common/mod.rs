//! Scripted in-memory backend shared by the integration tests
//!
//! Each `open()` pops the next `Behavior` (or the fallback), so a test can
//! describe a sequence like "refuse, refuse, accept". Accepted links run the
//! Hello/Identify handshake, then hand a `ServerLink` to the test so it can
//! read requests and push responses, events or a close.

#![allow(dead_code)]

use async_trait::async_trait;
use obs_remote::error::{RequestError, TransportError};
use obs_remote::protocol::{self, AUTH_FAILED_CLOSE_CODE};
use obs_remote::session::{
    ConnectionTarget, ReconnectPolicy, SessionConfig, SessionEvent, SessionHandle, SessionManager,
};
use obs_remote::transport::{
    AuthChallenge, CloseReason, Inbound, Outbound, Transport, TransportChannels,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

pub const SALT: &str = "lM1GncleQOaCu9lT1yeUZhFYnqhsLLP1G5lAGo3ixaI=";
pub const CHALLENGE: &str = "+IxH4CnCiqpX1rM9scsNynZzbOe4KhDeYcTNS3PDaeY=";

/// Upper bound for any single wait; paused time makes this free
const WAIT: Duration = Duration::from_secs(300);

// =============================================================================
// Mock Transport
// =============================================================================

/// What the next `open()` does
#[derive(Debug, Clone)]
pub enum Behavior {
    Refuse,
    /// Handshake without authentication
    Accept,
    /// Handshake that only accepts this password
    AcceptWithPassword(String),
    /// Never completes; the connect timeout has to fire
    Hang,
    /// Handshake without authentication after a delay
    SlowAccept(Duration),
}

struct Shared {
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    opens: Mutex<Vec<Instant>>,
    /// `(currently opening, most ever opening at once)`
    in_flight: Mutex<(usize, usize)>,
    links: mpsc::UnboundedSender<ServerLink>,
}

/// Counts an `open()` as in flight until it returns or is dropped
struct OpenGuard<'a>(&'a Shared);

impl<'a> OpenGuard<'a> {
    fn enter(shared: &'a Shared) -> Self {
        let mut in_flight = shared.in_flight.lock();
        in_flight.0 += 1;
        in_flight.1 = in_flight.1.max(in_flight.0);
        Self(shared)
    }
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.lock().0 -= 1;
    }
}

/// Transport handed to the session under test
pub struct MockTransport {
    shared: Arc<Shared>,
}

/// Test-side view of the mock: scripting, counters and accepted links
pub struct MockServer {
    shared: Arc<Shared>,
    links: mpsc::UnboundedReceiver<ServerLink>,
}

pub fn mock(fallback: Behavior) -> (MockTransport, MockServer) {
    let (links_tx, links_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        script: Mutex::new(VecDeque::new()),
        fallback,
        opens: Mutex::new(Vec::new()),
        in_flight: Mutex::new((0, 0)),
        links: links_tx,
    });
    (
        MockTransport {
            shared: shared.clone(),
        },
        MockServer {
            shared,
            links: links_rx,
        },
    )
}

impl MockServer {
    /// Queue a behavior for a future `open()`
    pub fn push(&self, behavior: Behavior) {
        self.shared.script.lock().push_back(behavior);
    }

    /// Number of `open()` calls so far
    pub fn opens(&self) -> usize {
        self.shared.opens.lock().len()
    }

    /// When each `open()` happened
    pub fn open_times(&self) -> Vec<Instant> {
        self.shared.opens.lock().clone()
    }

    /// Most `open()` calls ever running at the same time
    pub fn max_concurrent_opens(&self) -> usize {
        self.shared.in_flight.lock().1
    }

    /// Most recent accepted link, if any arrived since the last call
    pub fn latest_link(&mut self) -> Option<ServerLink> {
        let mut latest = None;
        while let Ok(link) = self.links.try_recv() {
            latest = Some(link);
        }
        latest
    }

    /// Wait for the next link that completed its handshake
    pub async fn next_link(&mut self) -> ServerLink {
        tokio::time::timeout(WAIT, self.links.recv())
            .await
            .expect("no link accepted in time")
            .expect("mock transport dropped")
    }
}

impl MockTransport {
    fn accept(&self, password: Option<String>) -> TransportChannels {
        let (in_tx, in_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(64);
        tokio::spawn(serve(password, in_tx, out_rx, self.shared.links.clone()));
        TransportChannels {
            rx: in_rx,
            tx: out_tx,
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, url: &str) -> Result<TransportChannels, TransportError> {
        self.shared.opens.lock().push(Instant::now());
        let _in_flight = OpenGuard::enter(&self.shared);
        let behavior = self
            .shared
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.shared.fallback.clone());

        match behavior {
            Behavior::Refuse => Err(TransportError::Refused {
                url: url.to_string(),
                message: "connection refused".into(),
            }),
            Behavior::Accept => Ok(self.accept(None)),
            Behavior::AcceptWithPassword(password) => Ok(self.accept(Some(password))),
            Behavior::Hang => std::future::pending().await,
            Behavior::SlowAccept(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.accept(None))
            }
        }
    }
}

/// Backend side of one link
async fn serve(
    password: Option<String>,
    in_tx: mpsc::Sender<Inbound>,
    mut out_rx: mpsc::Receiver<Outbound>,
    links: mpsc::UnboundedSender<ServerLink>,
) {
    let challenge = password.as_ref().map(|_| AuthChallenge {
        challenge: CHALLENGE.into(),
        salt: SALT.into(),
    });
    let hello = Inbound::Hello {
        challenge: challenge.clone(),
    };
    if in_tx.send(hello).await.is_err() {
        return;
    }

    let Some(Outbound::Identify { authentication, .. }) = out_rx.recv().await else {
        return;
    };
    let expected = match (&password, &challenge) {
        (Some(password), Some(challenge)) => {
            Some(protocol::authentication_string(password, challenge))
        }
        _ => None,
    };
    if expected.is_some() && authentication != expected {
        let reason = CloseReason::new(Some(AUTH_FAILED_CLOSE_CODE), "Authentication failed.");
        let _ = in_tx.send(Inbound::Closed(reason)).await;
        return;
    }
    if in_tx.send(Inbound::Identified).await.is_err() {
        return;
    }

    let (seen_tx, seen_rx) = mpsc::unbounded_channel();
    let _ = links.send(ServerLink {
        inbound: in_tx.clone(),
        outbound: seen_rx,
    });

    while let Some(msg) = out_rx.recv().await {
        let close = msg == Outbound::Close;
        let _ = seen_tx.send(msg);
        if close {
            let reason = CloseReason::new(Some(1000), "closed by client");
            let _ = in_tx.send(Inbound::Closed(reason)).await;
            break;
        }
    }
}

// =============================================================================
// Server link
// =============================================================================

/// Request as seen by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct SeenRequest {
    pub request_type: String,
    pub request_id: String,
    pub data: Option<Value>,
}

pub struct ServerLink {
    inbound: mpsc::Sender<Inbound>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl ServerLink {
    /// Next message the session sent after the handshake
    pub async fn next_outbound(&mut self) -> Option<Outbound> {
        tokio::time::timeout(WAIT, self.outbound.recv())
            .await
            .expect("no outbound message in time")
    }

    pub async fn next_request(&mut self) -> SeenRequest {
        match self.next_outbound().await {
            Some(Outbound::Request {
                request_type,
                request_id,
                data,
            }) => SeenRequest {
                request_type,
                request_id,
                data,
            },
            other => panic!("expected a request, got {:?}", other),
        }
    }

    pub async fn respond(&self, request_id: &str, result: Result<Value, RequestError>) {
        let _ = self
            .inbound
            .send(Inbound::Response {
                request_id: request_id.to_string(),
                result,
            })
            .await;
    }

    pub async fn event(&self, name: &str, data: Value) {
        let _ = self
            .inbound
            .send(Inbound::Event {
                name: name.to_string(),
                data,
            })
            .await;
    }

    /// Peer-side close
    pub async fn close(&self, code: u16, message: &str) {
        let _ = self
            .inbound
            .send(Inbound::Closed(CloseReason::new(Some(code), message)))
            .await;
    }

    /// Answer every request with `answer` in a background task
    ///
    /// `answer` returning `None` leaves that request unanswered. Returns the
    /// inbound sender so the test can still push events.
    pub fn answer_with<F>(mut self, mut answer: F) -> mpsc::Sender<Inbound>
    where
        F: FnMut(&str, Option<&Value>) -> Option<Result<Value, RequestError>> + Send + 'static,
    {
        let inbound = self.inbound.clone();
        tokio::spawn(async move {
            while let Some(msg) = self.outbound.recv().await {
                if let Outbound::Request {
                    request_type,
                    request_id,
                    data,
                } = msg
                {
                    if let Some(result) = answer(&request_type, data.as_ref()) {
                        self.respond(&request_id, result).await;
                    }
                }
            }
        });
        inbound
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub fn target() -> ConnectionTarget {
    ConnectionTarget::new("localhost", 4455, "")
}

pub fn spawn_session(transport: MockTransport, policy: ReconnectPolicy) -> SessionHandle {
    SessionManager::spawn(transport, SessionConfig::default(), policy)
}

/// Flat 2 s delay, no jitter
pub fn fixed_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        enabled: true,
        base_delay_ms: 2000,
        jitter_ms: 0,
        max_attempts,
    }
}

pub async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("no session event in time")
        .expect("event channel closed")
}

/// Skip events until one matches
pub async fn wait_for<F>(events: &mut broadcast::Receiver<SessionEvent>, mut matches: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if matches(&event) {
            return event;
        }
    }
}
