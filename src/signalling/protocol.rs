//! Signalling wire protocol
//!
//! Typed messages exchanged with the signalling service over the message
//! channel. All requests carry enough identifying fields for the correlator
//! to match a response to its request unambiguously.

use super::SignallingError;
use crate::transport::{Candidate, SessionDescription};
use serde::{Deserialize, Serialize};

/// One catalog entry describing a remote media producer
///
/// Identity is `id`; the human-chosen `name` is used to re-select a stream
/// across catalog refreshes because ids may rotate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    pub id: String,
    pub name: String,
}

/// The (consumer, stream, session) triple every negotiation message is
/// scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionScope {
    pub consumer_id: String,
    pub stream_id: String,
    pub session_id: String,
}

/// Candidate or description carried inside a negotiation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NegotiationPayload {
    Candidate(Candidate),
    Description(SessionDescription),
}

/// Signalling message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Consumer registration request
    Register,

    /// Registration response carrying the service-issued consumer id
    Registered { consumer_id: String },

    /// Stream catalog query
    ListStreams { consumer_id: String },

    /// Catalog response
    StreamList {
        consumer_id: String,
        streams: Vec<Stream>,
    },

    /// Request a session with one producer
    SessionRequest {
        consumer_id: String,
        stream_id: String,
    },

    /// Session grant carrying the service-minted session id
    SessionGranted {
        consumer_id: String,
        stream_id: String,
        session_id: String,
    },

    /// Candidate or description exchange, scoped to one session
    Negotiation {
        consumer_id: String,
        stream_id: String,
        session_id: String,
        payload: NegotiationPayload,
    },

    /// Session teardown notice (either direction)
    EndSession {
        consumer_id: String,
        stream_id: String,
        session_id: String,
        reason: Option<String>,
    },

    /// Error response
    Error {
        code: String,
        message: String,
        #[serde(default)]
        consumer_id: Option<String>,
        #[serde(default)]
        stream_id: Option<String>,
    },

    /// Keepalive
    Ping { timestamp: f64 },

    /// Keepalive response
    Pong { timestamp: f64 },
}

impl SignalMessage {
    /// Parse a signalling message from JSON
    pub fn from_json(json: &str) -> Result<Self, SignallingError> {
        serde_json::from_str(json)
            .map_err(|e| SignallingError::Protocol(format!("Invalid signalling message: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, SignallingError> {
        serde_json::to_string(self)
            .map_err(|e| SignallingError::Protocol(format!("Failed to serialize message: {}", e)))
    }

    /// Build a negotiation message for a session scope
    pub fn negotiation(scope: &SessionScope, payload: NegotiationPayload) -> Self {
        SignalMessage::Negotiation {
            consumer_id: scope.consumer_id.clone(),
            stream_id: scope.stream_id.clone(),
            session_id: scope.session_id.clone(),
            payload,
        }
    }

    /// Build an end-session notice for a session scope
    pub fn end_session(scope: &SessionScope, reason: &str) -> Self {
        SignalMessage::EndSession {
            consumer_id: scope.consumer_id.clone(),
            stream_id: scope.stream_id.clone(),
            session_id: scope.session_id.clone(),
            reason: Some(reason.to_string()),
        }
    }

    /// Get the session scope if this message carries one
    pub fn scope(&self) -> Option<SessionScope> {
        match self {
            SignalMessage::Negotiation {
                consumer_id,
                stream_id,
                session_id,
                ..
            }
            | SignalMessage::EndSession {
                consumer_id,
                stream_id,
                session_id,
                ..
            } => Some(SessionScope {
                consumer_id: consumer_id.clone(),
                stream_id: stream_id.clone(),
                session_id: session_id.clone(),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DescriptionKind;

    #[test]
    fn test_parse_registered() {
        let json = r#"{"type": "registered", "consumer_id": "A1"}"#;
        let msg = SignalMessage::from_json(json).unwrap();
        match msg {
            SignalMessage::Registered { consumer_id } => assert_eq!(consumer_id, "A1"),
            _ => panic!("Expected Registered"),
        }
    }

    #[test]
    fn test_parse_stream_list() {
        let json = r#"{"type": "stream_list", "consumer_id": "A1",
                       "streams": [{"id": "p1", "name": "cam"}]}"#;
        let msg = SignalMessage::from_json(json).unwrap();
        match msg {
            SignalMessage::StreamList { streams, .. } => {
                assert_eq!(streams.len(), 1);
                assert_eq!(streams[0].name, "cam");
            }
            _ => panic!("Expected StreamList"),
        }
    }

    #[test]
    fn test_negotiation_roundtrip() {
        let scope = SessionScope {
            consumer_id: "A1".to_string(),
            stream_id: "p1".to_string(),
            session_id: "S1".to_string(),
        };
        let msg = SignalMessage::negotiation(
            &scope,
            NegotiationPayload::Description(SessionDescription {
                sdp_type: DescriptionKind::Offer,
                sdp: "v=0\r\n...".to_string(),
            }),
        );
        let json = msg.to_json().unwrap();
        assert!(json.contains("negotiation"));
        assert!(json.contains("S1"));

        let parsed = SignalMessage::from_json(&json).unwrap();
        assert_eq!(parsed.scope(), Some(scope));
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_candidate_payload_field_names() {
        let payload = NegotiationPayload::Candidate(Candidate {
            candidate: "candidate:1 1 UDP 2122252543 10.0.0.1 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        });
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("sdpMid"));
        assert!(json.contains("sdpMLineIndex"));
    }

    #[test]
    fn test_error_without_ids() {
        let json = r#"{"type": "error", "code": "UNAVAILABLE", "message": "stream gone"}"#;
        let msg = SignalMessage::from_json(json).unwrap();
        match msg {
            SignalMessage::Error {
                code, consumer_id, ..
            } => {
                assert_eq!(code, "UNAVAILABLE");
                assert!(consumer_id.is_none());
            }
            _ => panic!("Expected Error"),
        }
    }

    #[test]
    fn test_unknown_message_rejected() {
        assert!(SignalMessage::from_json(r#"{"type": "bogus"}"#).is_err());
        assert!(SignalMessage::from_json("not json").is_err());
    }
}
