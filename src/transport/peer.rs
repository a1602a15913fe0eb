//! WebRTC peer connection transport
//!
//! Answering-side transport over webrtc-rs: the remote producer offers, we
//! answer with recvonly media and trickle our candidates back out through the
//! event hooks.

use super::{
    Candidate, DescriptionKind, IceServer, SessionDescription, TransportCapability,
    TransportConfig, TransportError, TransportEvents, TransportFactory,
};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Creates webrtc-rs backed transports
pub struct PeerTransportFactory;

#[async_trait]
impl TransportFactory for PeerTransportFactory {
    async fn create(
        &self,
        config: &TransportConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn TransportCapability>, TransportError> {
        let transport = PeerTransport::new(config, events).await?;
        Ok(Arc::new(transport))
    }
}

pub struct PeerTransport {
    peer_connection: Arc<RTCPeerConnection>,
    /// Set before an orderly close so the state callback does not report the
    /// resulting Closed transition as a failure
    locally_closed: Arc<AtomicBool>,
}

impl PeerTransport {
    async fn new(config: &TransportConfig, events: TransportEvents) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::Connection(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            TransportError::Connection(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: build_rtc_ice_servers(&config.ice_servers),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            TransportError::Connection(format!("Failed to create peer connection: {}", e))
        })?);

        let locally_closed = Arc::new(AtomicBool::new(false));
        let events = Arc::new(events);

        {
            let events = events.clone();
            peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
                let events = events.clone();
                Box::pin(async move {
                    let handle = super::MediaHandle {
                        track_id: track.id(),
                        kind: track.kind().to_string(),
                    };
                    debug!("transport: {} track {} arrived", handle.kind, handle.track_id);
                    (events.on_track)(handle);
                })
            }));
        }

        {
            let events = events.clone();
            peer_connection.on_ice_candidate(Box::new(move |candidate| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => (events.on_local_candidate)(Candidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                        Err(e) => warn!("transport: candidate serialization failed: {}", e),
                    }
                })
            }));
        }

        {
            let events = events.clone();
            let locally_closed = locally_closed.clone();
            peer_connection.on_peer_connection_state_change(Box::new(move |state| {
                let events = events.clone();
                let locally_closed = locally_closed.clone();
                Box::pin(async move {
                    debug!("transport: peer connection state {}", state);
                    // Disconnected can still recover; only Failed/Closed are
                    // terminal
                    let terminal = matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    );
                    if terminal && !locally_closed.load(Ordering::SeqCst) {
                        (events.on_closed)(format!("peer connection {}", state));
                    }
                })
            }));
        }

        Ok(Self {
            peer_connection,
            locally_closed,
        })
    }
}

#[async_trait]
impl TransportCapability for PeerTransport {
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let remote = match description.sdp_type {
            DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp),
            DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| TransportError::Sdp(format!("Invalid remote description: {}", e)))?;

        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to set remote description: {}", e)))
    }

    async fn create_local_description(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to create answer: {}", e)))?;

        // Trickle: candidates go out through on_ice_candidate as they are
        // gathered, so the answer is sent without waiting for gathering.
        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| TransportError::Sdp(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription {
            sdp_type: DescriptionKind::Answer,
            sdp: answer.sdp,
        })
    }

    async fn add_candidate(&self, candidate: Candidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Ice(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn close(&self) {
        self.locally_closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.peer_connection.close().await {
            warn!("transport: close failed: {}", e);
        }
    }
}

fn build_rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}
