//! WebSocket transport for the obs-websocket backend
//!
//! Opens a client connection and relays decoded messages bidirectionally.
//!
//! Architecture:
//! ```text
//! SessionManager ──Outbound──► link task ──WebSocket:4455──► OBS
//!                ◄──Inbound───           ◄──────────────────
//! ```

use super::{CloseReason, Inbound, Outbound, Transport, TransportChannels};
use crate::constants::{CHANNEL_CAPACITY, CLOSE_TIMEOUT_MS};
use crate::error::TransportError;
use crate::protocol;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code sent when the session asks for a graceful close
const NORMAL_CLOSE_CODE: u16 = 1000;

/// WebSocket client transport
///
/// Each `open()` creates an independent link with its own relay task.
///
/// # Example
///
/// ```ignore
/// let transport = WebSocketTransport::new();
/// let channels = transport.open("ws://localhost:4455").await?;
///
/// // Messages from OBS come through channels.rx
/// // Messages sent to channels.tx go to OBS
/// ```
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    close_timeout: Duration,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            close_timeout: Duration::from_millis(CLOSE_TIMEOUT_MS),
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<TransportChannels, TransportError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Refused {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        info!("WebSocket connected: {}", url);

        let (in_tx, in_rx) = mpsc::channel::<Inbound>(CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel::<Outbound>(CHANNEL_CAPACITY);

        let close_timeout = self.close_timeout;
        let url = url.to_string();
        tokio::spawn(async move {
            let reason = run_link(ws_stream, in_tx.clone(), out_rx, close_timeout).await;
            debug!("WebSocket link to {} closed: {:?}", url, reason);
            // Receiver may already be gone if the session dropped the link
            let _ = in_tx.send(Inbound::Closed(reason)).await;
        });

        Ok(TransportChannels {
            rx: in_rx,
            tx: out_tx,
        })
    }
}

/// Relay frames until either side closes
async fn run_link(
    ws_stream: WsStream,
    in_tx: mpsc::Sender<Inbound>,
    mut out_rx: mpsc::Receiver<Outbound>,
    close_timeout: Duration,
) -> CloseReason {
    let (mut ws_sink, mut ws_stream) = ws_stream.split();

    loop {
        tokio::select! {
            // Session -> OBS
            msg = out_rx.recv() => {
                match msg {
                    Some(Outbound::Close) | None => {
                        // Sender dropped counts as a close request
                        let _ = ws_sink.close().await;
                        let _ = tokio::time::timeout(close_timeout, async {
                            while let Some(Ok(_)) = ws_stream.next().await {}
                        })
                        .await;
                        return CloseReason::new(Some(NORMAL_CLOSE_CODE), "closed by client");
                    }
                    Some(msg) => {
                        let Some(text) = protocol::encode(&msg) else {
                            continue;
                        };
                        if let Err(e) = ws_sink.send(Message::text(text)).await {
                            return CloseReason::new(None, e.to_string());
                        }
                    }
                }
            }

            // OBS -> Session
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match protocol::decode(text.as_str()) {
                        Ok(Some(msg)) => {
                            if in_tx.send(msg).await.is_err() {
                                // Session gone
                                let _ = ws_sink.close().await;
                                return CloseReason::new(Some(NORMAL_CLOSE_CODE), "session dropped");
                            }
                        }
                        Ok(None) => debug!("Ignoring frame with unhandled opcode"),
                        Err(e) => {
                            warn!("Undecodable frame: {}", e);
                            let _ = ws_sink.close().await;
                            return CloseReason::new(None, e.to_string());
                        }
                    },
                    Some(Ok(Message::Close(frame))) => return close_reason(frame),
                    Some(Ok(_)) => {} // Ping/pong handled by tungstenite, binary unused
                    Some(Err(e)) => return CloseReason::new(None, e.to_string()),
                    None => return CloseReason::new(None, "stream ended"),
                }
            }
        }
    }
}

fn close_reason(frame: Option<CloseFrame>) -> CloseReason {
    match frame {
        Some(frame) => CloseReason::new(Some(u16::from(frame.code)), frame.reason.as_str()),
        None => CloseReason::new(None, "closed by peer"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn test_close_reason_from_auth_failure_frame() {
        let reason = close_reason(Some(CloseFrame {
            code: CloseCode::from(4009),
            reason: "Authentication failed.".into(),
        }));
        assert_eq!(reason.code, Some(4009));
        assert!(reason.is_auth_failure());
    }

    #[test]
    fn test_close_reason_without_frame() {
        let reason = close_reason(None);
        assert_eq!(reason.code, None);
        assert!(!reason.is_auth_failure());
    }

    #[tokio::test]
    async fn test_open_refused() {
        // Port 1 is reserved and never listening
        let transport = WebSocketTransport::new();
        let result = transport.open("ws://127.0.0.1:1").await;
        assert!(matches!(result, Err(TransportError::Refused { .. })));
    }
}
