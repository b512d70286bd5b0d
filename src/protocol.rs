//! obs-websocket v5 wire format
//!
//! Every frame is a JSON text message: `{"op": <opcode>, "d": {...}}`.
//!
//! | op | message          | direction |
//! |----|------------------|-----------|
//! | 0  | Hello            | in        |
//! | 1  | Identify         | out       |
//! | 2  | Identified       | in        |
//! | 5  | Event            | in        |
//! | 6  | Request          | out       |
//! | 7  | RequestResponse  | in        |

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{RequestError, TransportError};
use crate::transport::{AuthChallenge, Inbound, Outbound};

pub const OP_HELLO: u8 = 0;
pub const OP_IDENTIFY: u8 = 1;
pub const OP_IDENTIFIED: u8 = 2;
pub const OP_EVENT: u8 = 5;
pub const OP_REQUEST: u8 = 6;
pub const OP_REQUEST_RESPONSE: u8 = 7;

/// Negotiated RPC version
pub const RPC_VERSION: u32 = 1;

/// All non-high-volume event categories
pub const EVENT_SUBSCRIPTION_ALL: u32 = 0x7FF;

/// High-volume audio meter events (not part of `All`)
pub const EVENT_SUBSCRIPTION_INPUT_VOLUME_METERS: u32 = 1 << 16;

/// Default subscription mask; meters feed the `input.<name>.level` parameters
pub const EVENT_SUBSCRIPTIONS: u32 =
    EVENT_SUBSCRIPTION_ALL | EVENT_SUBSCRIPTION_INPUT_VOLUME_METERS;

/// WebSocket close code for a rejected credential
pub const AUTH_FAILED_CLOSE_CODE: u16 = 4009;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    op: u8,
    #[serde(default)]
    d: Value,
}

#[derive(Debug, Deserialize)]
struct HelloData {
    #[serde(default)]
    authentication: Option<ChallengeData>,
}

#[derive(Debug, Deserialize)]
struct ChallengeData {
    challenge: String,
    salt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventData {
    event_type: String,
    #[serde(default)]
    event_data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseData {
    request_type: String,
    request_id: String,
    request_status: RequestStatus,
    #[serde(default)]
    response_data: Value,
}

#[derive(Debug, Deserialize)]
struct RequestStatus {
    result: bool,
    code: u16,
    #[serde(default)]
    comment: Option<String>,
}

/// Compute the Identify `authentication` string for a credential
///
/// `base64(sha256(base64(sha256(credential + salt)) + challenge))`
pub fn authentication_string(credential: &str, challenge: &AuthChallenge) -> String {
    let secret = STANDARD.encode(Sha256::digest(format!("{}{}", credential, challenge.salt)));
    STANDARD.encode(Sha256::digest(format!("{}{}", secret, challenge.challenge)))
}

/// Encode an outbound message as a text frame
///
/// Returns `None` for `Outbound::Close`, which maps to a close frame.
pub fn encode(msg: &Outbound) -> Option<String> {
    let envelope = match msg {
        Outbound::Identify {
            authentication,
            event_subscriptions,
        } => {
            let mut d = json!({
                "rpcVersion": RPC_VERSION,
                "eventSubscriptions": event_subscriptions,
            });
            if let Some(auth) = authentication {
                d["authentication"] = json!(auth);
            }
            Envelope { op: OP_IDENTIFY, d }
        }
        Outbound::Request {
            request_type,
            request_id,
            data,
        } => {
            let mut d = json!({
                "requestType": request_type,
                "requestId": request_id,
            });
            if let Some(data) = data {
                d["requestData"] = data.clone();
            }
            Envelope { op: OP_REQUEST, d }
        }
        Outbound::Close => return None,
    };
    // Envelope holds only JSON values, serialization cannot fail
    serde_json::to_string(&envelope).ok()
}

/// Decode a text frame
///
/// Returns `Ok(None)` for opcodes the session does not consume.
pub fn decode(text: &str) -> std::result::Result<Option<Inbound>, TransportError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(invalid)?;

    let msg = match envelope.op {
        OP_HELLO => {
            let hello: HelloData = serde_json::from_value(envelope.d).map_err(invalid)?;
            Inbound::Hello {
                challenge: hello.authentication.map(|a| AuthChallenge {
                    challenge: a.challenge,
                    salt: a.salt,
                }),
            }
        }
        OP_IDENTIFIED => Inbound::Identified,
        OP_EVENT => {
            let event: EventData = serde_json::from_value(envelope.d).map_err(invalid)?;
            Inbound::Event {
                name: event.event_type,
                data: event.event_data,
            }
        }
        OP_REQUEST_RESPONSE => {
            let resp: ResponseData = serde_json::from_value(envelope.d).map_err(invalid)?;
            let result = if resp.request_status.result {
                Ok(resp.response_data)
            } else {
                Err(RequestError::Rejected {
                    request_type: resp.request_type,
                    code: resp.request_status.code,
                    comment: resp.request_status.comment,
                })
            };
            Inbound::Response {
                request_id: resp.request_id,
                result,
            }
        }
        _ => return Ok(None),
    };

    Ok(Some(msg))
}

fn invalid(e: serde_json::Error) -> TransportError {
    TransportError::Protocol {
        message: e.to_string(),
    }
}
