//! Session lifecycle
//!
//! One negotiated transport session with a single producer. The session owns
//! the negotiation sub-state (remote description boundary, pending
//! candidates) and its transport capability; the orchestrator owns the
//! session.

use crate::signalling::protocol::{NegotiationPayload, SessionScope, Stream};
use crate::signalling::SignallingClient;
use crate::transport::{
    Candidate, MediaHandle, SessionDescription, TransportCapability, TransportConfig,
    TransportError, TransportEvents, TransportFactory,
};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Hooks the owner wires into a session at construction
pub struct SessionHooks {
    /// Remote connectivity candidate arrived for this session
    pub on_candidate: Box<dyn Fn(Candidate) + Send + Sync>,
    /// Remote session description arrived for this session
    pub on_description: Box<dyn Fn(SessionDescription) + Send + Sync>,
    /// Inbound media track surfaced by the transport
    pub on_track: Box<dyn Fn(MediaHandle) + Send + Sync>,
    /// Session is gone (transport failure or remote end notice).
    /// Invoked at most once.
    pub on_closed: Box<dyn Fn(String) + Send + Sync>,
}

/// A single negotiated session, acting as the answering side
pub struct Session {
    scope: SessionScope,
    stream: Stream,
    client: Arc<SignallingClient>,
    transport: Arc<dyn TransportCapability>,
    remote_set: bool,
    pending_candidates: VecDeque<Candidate>,
    closed: bool,
}

impl Session {
    /// Create the transport and subscribe to negotiation and end-session
    /// notices for this session's scope.
    pub async fn connect(
        scope: SessionScope,
        stream: Stream,
        client: Arc<SignallingClient>,
        factory: &Arc<dyn TransportFactory>,
        transport_config: &TransportConfig,
        hooks: SessionHooks,
    ) -> Result<Self, TransportError> {
        // Exactly-once guard shared by the transport failure path and the
        // remote end-session notice
        let closed_hook: Arc<dyn Fn(String) + Send + Sync> = {
            let fired = AtomicBool::new(false);
            let on_closed = hooks.on_closed;
            Arc::new(move |reason: String| {
                if !fired.swap(true, Ordering::SeqCst) {
                    on_closed(reason);
                }
            })
        };

        let on_local_candidate = {
            let client = client.clone();
            let scope = scope.clone();
            move |candidate: Candidate| {
                client.send_negotiation(&scope, NegotiationPayload::Candidate(candidate));
            }
        };

        let events = TransportEvents {
            on_track: hooks.on_track,
            on_closed: {
                let hook = closed_hook.clone();
                Box::new(move |reason| hook(reason))
            },
            on_local_candidate: Box::new(on_local_candidate),
        };
        let transport = factory.create(transport_config, events).await?;

        client.subscribe_negotiation(scope.clone(), hooks.on_candidate, hooks.on_description);
        client.subscribe_end_session(
            scope.clone(),
            Box::new(move |reason| closed_hook(reason)),
        );

        info!(
            "Session {} established with stream '{}' ({})",
            scope.session_id, stream.name, stream.id
        );

        Ok(Self {
            scope,
            stream,
            client,
            transport,
            remote_set: false,
            pending_candidates: VecDeque::new(),
            closed: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.scope.session_id
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Handle the remote session description.
    ///
    /// The first description makes this session the answering side: install
    /// it, generate and send back the local answer, then flush candidates
    /// that arrived early. Candidates must not reach the transport before a
    /// remote description exists.
    pub async fn on_incoming_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        if self.remote_set {
            warn!(
                "Session {}: ignoring extra remote description; renegotiation requires a new session",
                self.scope.session_id
            );
            return Ok(());
        }

        self.transport.set_remote_description(description).await?;
        self.remote_set = true;

        let answer = self.transport.create_local_description().await?;
        self.client
            .send_negotiation(&self.scope, NegotiationPayload::Description(answer));

        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.transport.add_candidate(candidate).await {
                warn!(
                    "Session {}: buffered candidate rejected: {}",
                    self.scope.session_id, e
                );
            }
        }
        Ok(())
    }

    /// Handle a remote connectivity candidate, buffering it in arrival order
    /// until the remote description exists.
    pub async fn on_incoming_candidate(
        &mut self,
        candidate: Candidate,
    ) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        if !self.remote_set {
            debug!(
                "Session {}: buffering candidate until remote description arrives",
                self.scope.session_id
            );
            self.pending_candidates.push_back(candidate);
            return Ok(());
        }
        self.transport.add_candidate(candidate).await
    }

    /// Release the transport and deregister the signalling filters.
    ///
    /// Idempotent. When `notify_remote` is set, a best-effort end-session
    /// notice is sent first.
    pub async fn end(&mut self, reason: &str, notify_remote: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.client.unsubscribe(&self.scope);
        if notify_remote {
            self.client.send_end_session(&self.scope, reason);
        }
        self.transport.close().await;
        info!("Session {} ended: {}", self.scope.session_id, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signalling::channel::SignallingChannel;
    use crate::signalling::protocol::SignalMessage;
    use crate::signalling::SignallingError;
    use crate::transport::DescriptionKind;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::time::Duration;

    struct RecordingChannel {
        sent: Mutex<Vec<SignalMessage>>,
    }

    impl SignallingChannel for RecordingChannel {
        fn send(&self, message: &SignalMessage) -> Result<(), SignallingError> {
            self.sent.lock().push(message.clone());
            Ok(())
        }

        fn close(&self) {}
    }

    /// Transport fake that records every operation in call order
    struct RecordingTransport {
        ops: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TransportCapability for RecordingTransport {
        async fn set_remote_description(
            &self,
            description: SessionDescription,
        ) -> Result<(), TransportError> {
            self.ops.lock().push(format!("remote:{}", description.sdp));
            Ok(())
        }

        async fn create_local_description(&self) -> Result<SessionDescription, TransportError> {
            self.ops.lock().push("local".to_string());
            Ok(SessionDescription {
                sdp_type: DescriptionKind::Answer,
                sdp: "v=0 answer".to_string(),
            })
        }

        async fn add_candidate(&self, candidate: Candidate) -> Result<(), TransportError> {
            self.ops.lock().push(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn close(&self) {
            self.ops.lock().push("close".to_string());
        }
    }

    struct RecordingFactory {
        ops: Arc<Mutex<Vec<String>>>,
        events: Mutex<Option<TransportEvents>>,
    }

    impl RecordingFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                ops: Arc::new(Mutex::new(Vec::new())),
                events: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl TransportFactory for RecordingFactory {
        async fn create(
            &self,
            _config: &TransportConfig,
            events: TransportEvents,
        ) -> Result<Arc<dyn TransportCapability>, TransportError> {
            *self.events.lock() = Some(events);
            Ok(Arc::new(RecordingTransport {
                ops: self.ops.clone(),
            }))
        }
    }

    fn scope() -> SessionScope {
        SessionScope {
            consumer_id: "A1".to_string(),
            stream_id: "p1".to_string(),
            session_id: "S1".to_string(),
        }
    }

    fn stream() -> Stream {
        Stream {
            id: "p1".to_string(),
            name: "cam".to_string(),
        }
    }

    fn candidate(label: &str) -> Candidate {
        Candidate {
            candidate: label.to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    fn offer() -> SessionDescription {
        SessionDescription {
            sdp_type: DescriptionKind::Offer,
            sdp: "v=0 offer".to_string(),
        }
    }

    fn noop_hooks() -> SessionHooks {
        SessionHooks {
            on_candidate: Box::new(|_| {}),
            on_description: Box::new(|_| {}),
            on_track: Box::new(|_| {}),
            on_closed: Box::new(|_| {}),
        }
    }

    async fn build_session(
        hooks: SessionHooks,
    ) -> (Session, Arc<RecordingFactory>, Arc<RecordingChannel>) {
        let channel = Arc::new(RecordingChannel {
            sent: Mutex::new(Vec::new()),
        });
        let client = Arc::new(SignallingClient::new(
            channel.clone(),
            Duration::from_millis(100),
        ));
        let factory = RecordingFactory::new();
        let factory_dyn: Arc<dyn TransportFactory> = factory.clone();
        let session = Session::connect(
            scope(),
            stream(),
            client,
            &factory_dyn,
            &TransportConfig::default(),
            hooks,
        )
        .await
        .unwrap();
        (session, factory, channel)
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_description() {
        let (mut session, factory, channel) = build_session(noop_hooks()).await;

        session.on_incoming_candidate(candidate("c1")).await.unwrap();
        session.on_incoming_candidate(candidate("c2")).await.unwrap();
        assert!(factory.ops.lock().is_empty());

        session.on_incoming_description(offer()).await.unwrap();

        let ops = factory.ops.lock().clone();
        assert_eq!(
            ops,
            vec!["remote:v=0 offer", "local", "candidate:c1", "candidate:c2"]
        );

        // The generated answer went back out, scoped to this session
        let answer = channel
            .sent
            .lock()
            .iter()
            .find_map(|m| match m {
                SignalMessage::Negotiation {
                    session_id,
                    payload: NegotiationPayload::Description(d),
                    ..
                } => Some((session_id.clone(), d.clone())),
                _ => None,
            })
            .expect("no answer sent");
        assert_eq!(answer.0, "S1");
        assert_eq!(answer.1.sdp_type, DescriptionKind::Answer);
    }

    #[tokio::test]
    async fn test_candidate_after_description_applied_immediately() {
        let (mut session, factory, _channel) = build_session(noop_hooks()).await;

        session.on_incoming_description(offer()).await.unwrap();
        session.on_incoming_candidate(candidate("c3")).await.unwrap();

        let ops = factory.ops.lock().clone();
        assert_eq!(ops.last().unwrap(), "candidate:c3");
    }

    #[tokio::test]
    async fn test_extra_description_ignored() {
        let (mut session, factory, _channel) = build_session(noop_hooks()).await;

        session.on_incoming_description(offer()).await.unwrap();
        session.on_incoming_description(offer()).await.unwrap();

        let remotes = factory
            .ops
            .lock()
            .iter()
            .filter(|op| op.starts_with("remote:"))
            .count();
        assert_eq!(remotes, 1);
    }

    #[tokio::test]
    async fn test_end_is_idempotent_and_notifies_remote() {
        let (mut session, factory, channel) = build_session(noop_hooks()).await;

        session.end("selection changed", true).await;
        session.end("selection changed", true).await;

        let closes = factory
            .ops
            .lock()
            .iter()
            .filter(|op| op.as_str() == "close")
            .count();
        assert_eq!(closes, 1);

        let notices = channel
            .sent
            .lock()
            .iter()
            .filter(|m| matches!(m, SignalMessage::EndSession { .. }))
            .count();
        assert_eq!(notices, 1);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_transport_failure_fires_closed_once() {
        let (closed_tx, mut closed_rx) = tokio::sync::mpsc::unbounded_channel();
        let hooks = SessionHooks {
            on_candidate: Box::new(|_| {}),
            on_description: Box::new(|_| {}),
            on_track: Box::new(|_| {}),
            on_closed: Box::new(move |reason| {
                let _ = closed_tx.send(reason);
            }),
        };
        let (_session, factory, _channel) = build_session(hooks).await;

        let events = factory.events.lock().take().unwrap();
        (events.on_closed)("transport failure".to_string());
        (events.on_closed)("transport failure".to_string());

        assert_eq!(closed_rx.recv().await.unwrap(), "transport failure");
        assert!(closed_rx.try_recv().is_err());
    }
}
