//! Request/response correlation
//!
//! Every outbound request gets an id unique for the lifetime of the manager.
//! Entries live until their response arrives or the link closes.

use crate::error::RequestError;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::debug;

pub(crate) type Reply = oneshot::Sender<Result<Value, RequestError>>;

struct PendingRequest {
    request_type: String,
    reply: Reply,
}

/// Outstanding requests keyed by correlation id
#[derive(Default)]
pub(crate) struct PendingRequests {
    next_id: u64,
    entries: HashMap<String, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a request and return its correlation id
    ///
    /// Entries whose caller has stopped waiting (timed out or dropped) are
    /// pruned here.
    pub fn register(&mut self, request_type: &str, reply: Reply) -> String {
        self.entries.retain(|_, p| !p.reply.is_closed());

        self.next_id += 1;
        let id = self.next_id.to_string();
        self.entries.insert(
            id.clone(),
            PendingRequest {
                request_type: request_type.to_string(),
                reply,
            },
        );
        id
    }

    /// Complete the request matching `id`
    ///
    /// Returns `false` if no such request is outstanding.
    pub fn resolve(&mut self, id: &str, result: Result<Value, RequestError>) -> bool {
        match self.entries.remove(id) {
            Some(pending) => {
                let outcome = if result.is_ok() { "ok" } else { "failed" };
                debug!("{} #{} {}", pending.request_type, id, outcome);
                // Caller may have timed out already
                let _ = pending.reply.send(result);
                true
            }
            None => {
                debug!("Response for unknown request #{}", id);
                false
            }
        }
    }

    /// Take back a request that never reached the transport
    pub fn remove(&mut self, id: &str) -> Option<Reply> {
        self.entries.remove(id).map(|p| p.reply)
    }

    /// Fail every outstanding request
    pub fn fail_all(&mut self, error: RequestError) -> usize {
        let count = self.entries.len();
        for (_, pending) in self.entries.drain() {
            let _ = pending.reply.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_unique() {
        let mut pending = PendingRequests::new();
        let (a_tx, _a_rx) = oneshot::channel();
        let (b_tx, _b_rx) = oneshot::channel();
        let a = pending.register("GetStats", a_tx);
        let b = pending.register("GetStats", b_tx);
        assert_ne!(a, b);
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_out_of_order_resolution() {
        let mut pending = PendingRequests::new();
        let (a_tx, mut a_rx) = oneshot::channel();
        let (b_tx, mut b_rx) = oneshot::channel();
        let a = pending.register("GetInputMute", a_tx);
        let b = pending.register("GetInputVolume", b_tx);

        assert!(pending.resolve(&b, Ok(json!({"inputVolumeDb": -6.0}))));
        assert!(pending.resolve(&a, Ok(json!({"inputMuted": true}))));

        assert_eq!(a_rx.try_recv().unwrap().unwrap(), json!({"inputMuted": true}));
        assert_eq!(b_rx.try_recv().unwrap().unwrap(), json!({"inputVolumeDb": -6.0}));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_unknown_id_is_ignored() {
        let mut pending = PendingRequests::new();
        assert!(!pending.resolve("42", Ok(Value::Null)));
    }

    #[test]
    fn test_fail_all_rejects_everything() {
        let mut pending = PendingRequests::new();
        let (a_tx, mut a_rx) = oneshot::channel();
        let (b_tx, mut b_rx) = oneshot::channel();
        pending.register("GetStats", a_tx);
        pending.register("GetStats", b_tx);

        assert_eq!(pending.fail_all(RequestError::ConnectionLost), 2);
        assert_eq!(a_rx.try_recv().unwrap(), Err(RequestError::ConnectionLost));
        assert_eq!(b_rx.try_recv().unwrap(), Err(RequestError::ConnectionLost));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_abandoned_requests_are_pruned() {
        let mut pending = PendingRequests::new();
        let (a_tx, a_rx) = oneshot::channel();
        pending.register("GetStats", a_tx);
        drop(a_rx);

        let (b_tx, _b_rx) = oneshot::channel();
        pending.register("GetStats", b_tx);
        assert_eq!(pending.len(), 1);
    }
}
