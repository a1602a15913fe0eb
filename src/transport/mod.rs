//! Transport capability boundary
//!
//! The engine that turns descriptions + candidates into an actual
//! media-carrying connection is opaque to the rest of the crate: it accepts
//! remote session descriptions and connectivity candidates, emits local ones,
//! and reports track arrival and connection loss through callbacks.

#[cfg(feature = "webrtc-transport")]
pub mod peer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Offer/answer role of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// A negotiation artifact describing a peer's media/transport capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: DescriptionKind,
    pub sdp: String,
}

/// One discovered network path endpoint proposed during connectivity
/// establishment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Opaque handle to an inbound media track
///
/// The session and manager pass this outward without interpreting it.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaHandle {
    pub track_id: String,
    pub kind: String,
}

/// An ICE server entry handed to the transport engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Configuration passed through unmodified at session construction
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    pub ice_servers: Vec<IceServer>,
}

/// Transport-related errors
#[derive(Debug)]
pub enum TransportError {
    /// Peer connection creation or teardown failed
    Connection(String),
    /// SDP processing failed
    Sdp(String),
    /// ICE candidate processing failed
    Ice(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connection(msg) => write!(f, "Connection failed: {}", msg),
            TransportError::Sdp(msg) => write!(f, "SDP error: {}", msg),
            TransportError::Ice(msg) => write!(f, "ICE error: {}", msg),
        }
    }
}

impl Error for TransportError {}

/// Callback for inbound track arrival
pub type TrackCallback = Box<dyn Fn(MediaHandle) + Send + Sync>;

/// Callback for fatal transport loss, with a human-readable reason
pub type ClosedCallback = Box<dyn Fn(String) + Send + Sync>;

/// Callback for locally gathered connectivity candidates
pub type LocalCandidateCallback = Box<dyn Fn(Candidate) + Send + Sync>;

/// Event hooks installed at transport creation
pub struct TransportEvents {
    pub on_track: TrackCallback,
    pub on_closed: ClosedCallback,
    pub on_local_candidate: LocalCandidateCallback,
}

/// One media-carrying peer connection, owned exclusively by its Session
#[async_trait]
pub trait TransportCapability: Send + Sync {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Generate the local (answering) description and install it
    async fn create_local_description(&self) -> Result<SessionDescription, TransportError>;

    async fn add_candidate(&self, candidate: Candidate) -> Result<(), TransportError>;

    /// Release the underlying connection. Must not fire `on_closed`.
    async fn close(&self);
}

/// Factory seam so tests and alternative engines can supply transports
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        config: &TransportConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn TransportCapability>, TransportError>;
}
