//! Request/response correlation
//!
//! Signalling responses arrive asynchronously and carry no transaction
//! numbers; they are matched to pending requests by message type plus the
//! identifiers embedded in the payload. Responses whose identifiers do not
//! match any pending request are discarded rather than misrouted.

use super::protocol::SignalMessage;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

/// Key identifying one pending request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RequestKey {
    Register,
    StreamList { consumer_id: String },
    Session { consumer_id: String, stream_id: String },
}

struct PendingRequest {
    serial: u64,
    tx: oneshot::Sender<SignalMessage>,
}

/// Mapping from request key to its completion handle
pub struct Correlator {
    pending: Mutex<HashMap<RequestKey, PendingRequest>>,
    next_serial: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Register a pending request and return its completion handle together
    /// with the serial identifying this particular registration.
    ///
    /// Re-registering the same key supersedes the previous request; its
    /// receiver resolves with a recv error.
    pub fn register(&self, key: RequestKey) -> (oneshot::Receiver<SignalMessage>, u64) {
        let (tx, rx) = oneshot::channel();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        if self
            .pending
            .lock()
            .insert(key.clone(), PendingRequest { serial, tx })
            .is_some()
        {
            warn!("correlator: superseding pending request {:?}", key);
        }
        (rx, serial)
    }

    /// Drop a pending request (caller timed out or gave up). The serial
    /// guard keeps a stale cancel from removing a later request that
    /// superseded this one under the same key.
    pub fn cancel(&self, key: &RequestKey, serial: u64) {
        let mut pending = self.pending.lock();
        if pending.get(key).map_or(false, |p| p.serial == serial) {
            pending.remove(key);
        }
    }

    /// Route a response to its pending request.
    ///
    /// Returns true when the message was response-shaped (delivered or
    /// discarded as stale), false when it is not a response at all.
    pub fn complete(&self, message: SignalMessage) -> bool {
        let mut pending = self.pending.lock();

        let key = match &message {
            SignalMessage::Registered { .. } => Some(RequestKey::Register),
            SignalMessage::StreamList { consumer_id, .. } => Some(RequestKey::StreamList {
                consumer_id: consumer_id.clone(),
            }),
            SignalMessage::SessionGranted {
                consumer_id,
                stream_id,
                ..
            } => Some(RequestKey::Session {
                consumer_id: consumer_id.clone(),
                stream_id: stream_id.clone(),
            }),
            SignalMessage::Error {
                consumer_id,
                stream_id,
                ..
            } => error_key(&pending, consumer_id.as_deref(), stream_id.as_deref()),
            _ => None,
        };

        let Some(key) = key else {
            return matches!(&message, SignalMessage::Error { .. });
        };

        match pending.remove(&key) {
            Some(entry) => {
                if entry.tx.send(message).is_err() {
                    debug!("correlator: requester for {:?} no longer waiting", key);
                }
            }
            None => debug!("correlator: discarding stale response for {:?}", key),
        }
        true
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// Match an error message to the most specific pending request its embedded
/// identifiers allow.
fn error_key(
    pending: &HashMap<RequestKey, PendingRequest>,
    consumer_id: Option<&str>,
    stream_id: Option<&str>,
) -> Option<RequestKey> {
    if let (Some(consumer_id), Some(stream_id)) = (consumer_id, stream_id) {
        let key = RequestKey::Session {
            consumer_id: consumer_id.to_string(),
            stream_id: stream_id.to_string(),
        };
        if pending.contains_key(&key) {
            return Some(key);
        }
    }
    if let Some(consumer_id) = consumer_id {
        let key = RequestKey::StreamList {
            consumer_id: consumer_id.to_string(),
        };
        if pending.contains_key(&key) {
            return Some(key);
        }
    }
    if pending.contains_key(&RequestKey::Register) {
        return Some(RequestKey::Register);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(consumer: &str, stream: &str, session: &str) -> SignalMessage {
        SignalMessage::SessionGranted {
            consumer_id: consumer.to_string(),
            stream_id: stream.to_string(),
            session_id: session.to_string(),
        }
    }

    #[tokio::test]
    async fn test_response_reaches_pending_request() {
        let correlator = Correlator::new();
        let (rx, _) = correlator.register(RequestKey::Session {
            consumer_id: "A1".to_string(),
            stream_id: "p1".to_string(),
        });

        assert!(correlator.complete(granted("A1", "p1", "S1")));
        match rx.await.unwrap() {
            SignalMessage::SessionGranted { session_id, .. } => assert_eq!(session_id, "S1"),
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(correlator.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_stale_response_discarded() {
        let correlator = Correlator::new();
        let (_rx, _) = correlator.register(RequestKey::Session {
            consumer_id: "A1".to_string(),
            stream_id: "p1".to_string(),
        });

        // Different stream: identifiers match no pending request
        assert!(correlator.complete(granted("A1", "p2", "S9")));
        assert_eq!(correlator.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_response_discarded() {
        let correlator = Correlator::new();
        let (rx, _) = correlator.register(RequestKey::Register);

        let registered = SignalMessage::Registered {
            consumer_id: "A1".to_string(),
        };
        assert!(correlator.complete(registered.clone()));
        assert!(correlator.complete(registered));
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_superseded_request_resolves_with_error() {
        let correlator = Correlator::new();
        let (old, _) = correlator.register(RequestKey::Register);
        let (new, _) = correlator.register(RequestKey::Register);

        correlator.complete(SignalMessage::Registered {
            consumer_id: "A2".to_string(),
        });
        assert!(old.await.is_err());
        assert!(new.await.is_ok());
    }

    #[tokio::test]
    async fn test_stale_cancel_leaves_superseding_request() {
        let correlator = Correlator::new();
        let (_old, old_serial) = correlator.register(RequestKey::Register);
        let (new, _) = correlator.register(RequestKey::Register);

        // The first requester timing out must not tear down the second
        correlator.cancel(&RequestKey::Register, old_serial);
        assert_eq!(correlator.pending_len(), 1);

        correlator.complete(SignalMessage::Registered {
            consumer_id: "A2".to_string(),
        });
        match new.await.unwrap() {
            SignalMessage::Registered { consumer_id } => assert_eq!(consumer_id, "A2"),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_matched_to_most_specific_request() {
        let correlator = Correlator::new();
        let (_register, _) = correlator.register(RequestKey::Register);
        let (session, _) = correlator.register(RequestKey::Session {
            consumer_id: "A1".to_string(),
            stream_id: "p1".to_string(),
        });

        correlator.complete(SignalMessage::Error {
            code: "UNAVAILABLE".to_string(),
            message: "stream gone".to_string(),
            consumer_id: Some("A1".to_string()),
            stream_id: Some("p1".to_string()),
        });

        match session.await.unwrap() {
            SignalMessage::Error { code, .. } => assert_eq!(code, "UNAVAILABLE"),
            other => panic!("unexpected message: {:?}", other),
        }
        // Registration is still pending
        assert_eq!(correlator.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_non_response_not_consumed() {
        let correlator = Correlator::new();
        assert!(!correlator.complete(SignalMessage::Ping { timestamp: 1.0 }));
    }
}
