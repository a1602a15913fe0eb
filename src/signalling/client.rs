//! Signalling client
//!
//! Issues typed requests over the channel and parses typed responses through
//! the correlator. Unsolicited negotiation and end-session messages are
//! routed through per-session subscription filters; everything else that
//! matches no pending request is dropped.

use super::channel::{unix_time_secs, ChannelEvent, ChannelStatus, SignallingChannel};
use super::correlator::{Correlator, RequestKey};
use super::protocol::{NegotiationPayload, SessionScope, SignalMessage, Stream};
use super::SignallingError;
use crate::transport::{Candidate, SessionDescription};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

/// Callbacks receiving negotiation messages for one session scope
struct NegotiationSub {
    scope: SessionScope,
    on_candidate: Box<dyn Fn(Candidate) + Send + Sync>,
    on_description: Box<dyn Fn(SessionDescription) + Send + Sync>,
}

/// One-shot callback for the remote end-session notice
struct EndSub {
    scope: SessionScope,
    on_ended: Box<dyn FnOnce(String) + Send>,
}

/// Typed request/response client over the signalling channel
pub struct SignallingClient {
    channel: Arc<dyn SignallingChannel>,
    correlator: Correlator,
    negotiation: Mutex<Option<NegotiationSub>>,
    end_session: Mutex<Option<EndSub>>,
    open: AtomicBool,
    request_timeout: Duration,
}

impl SignallingClient {
    pub fn new(channel: Arc<dyn SignallingChannel>, request_timeout: Duration) -> Self {
        Self {
            channel,
            correlator: Correlator::new(),
            negotiation: Mutex::new(None),
            end_session: Mutex::new(None),
            open: AtomicBool::new(false),
            request_timeout,
        }
    }

    /// Whether the channel has reported Open more recently than Closed/Error
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close the underlying channel
    pub fn close(&self) {
        self.channel.close();
    }

    /// Consume channel events: responses feed the correlator, negotiation and
    /// end-session notices feed the subscription filters, status transitions
    /// are forwarded to `statuses`.
    pub fn spawn_dispatch(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        statuses: mpsc::UnboundedSender<ChannelStatus>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Status(status) => {
                        self.open
                            .store(status == ChannelStatus::Open, Ordering::SeqCst);
                        if statuses.send(status).is_err() {
                            break;
                        }
                    }
                    ChannelEvent::Message(message) => self.dispatch(message),
                }
            }
            debug!("signalling dispatch loop ended");
        })
    }

    fn dispatch(&self, message: SignalMessage) {
        match message {
            SignalMessage::Ping { timestamp } => {
                let _ = self.channel.send(&SignalMessage::Pong { timestamp });
            }
            SignalMessage::Pong { timestamp } => {
                let rtt_ms = (unix_time_secs() - timestamp).max(0.0) * 1000.0;
                debug!("signalling keepalive rtt {:.1} ms", rtt_ms);
            }
            SignalMessage::Negotiation { .. } => self.dispatch_negotiation(message),
            SignalMessage::EndSession { .. } => self.dispatch_end_session(message),
            other => {
                if !self.correlator.complete(other) {
                    debug!("signalling: ignoring unexpected message");
                }
            }
        }
    }

    fn dispatch_negotiation(&self, message: SignalMessage) {
        let SignalMessage::Negotiation {
            consumer_id,
            stream_id,
            session_id,
            payload,
        } = message
        else {
            return;
        };
        let scope = SessionScope {
            consumer_id,
            stream_id,
            session_id,
        };

        let guard = self.negotiation.lock();
        match guard.as_ref() {
            Some(sub) if sub.scope == scope => match payload {
                NegotiationPayload::Candidate(candidate) => (sub.on_candidate)(candidate),
                NegotiationPayload::Description(description) => (sub.on_description)(description),
            },
            _ => debug!(
                "signalling: dropping negotiation for inactive session {}",
                scope.session_id
            ),
        }
    }

    fn dispatch_end_session(&self, message: SignalMessage) {
        let Some(scope) = message.scope() else { return };
        let reason = match message {
            SignalMessage::EndSession { reason, .. } => {
                reason.unwrap_or_else(|| "ended by remote".to_string())
            }
            _ => return,
        };

        // Take the subscription before invoking it: fires at most once
        let sub = {
            let mut guard = self.end_session.lock();
            match guard.as_ref() {
                Some(sub) if sub.scope == scope => guard.take(),
                _ => None,
            }
        };
        match sub {
            Some(sub) => (sub.on_ended)(reason),
            None => debug!(
                "signalling: dropping end-session notice for inactive session {}",
                scope.session_id
            ),
        }
    }

    /// Register this consumer with the signalling service
    pub async fn register_consumer(&self) -> Result<String, SignallingError> {
        if !self.is_open() {
            return Err(SignallingError::Registration(
                "signalling channel is not open".to_string(),
            ));
        }

        let response = self
            .request(RequestKey::Register, &SignalMessage::Register)
            .await
            .map_err(SignallingError::Registration)?;
        match response {
            SignalMessage::Registered { consumer_id } => Ok(consumer_id),
            SignalMessage::Error { code, message, .. } => Err(SignallingError::Registration(
                format!("{}: {}", code, message),
            )),
            other => Err(SignallingError::Registration(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    /// Query the stream catalog
    pub async fn list_streams(&self, consumer_id: &str) -> Result<Vec<Stream>, SignallingError> {
        let key = RequestKey::StreamList {
            consumer_id: consumer_id.to_string(),
        };
        let request = SignalMessage::ListStreams {
            consumer_id: consumer_id.to_string(),
        };
        let response = self
            .request(key, &request)
            .await
            .map_err(SignallingError::TransientQuery)?;
        match response {
            SignalMessage::StreamList { streams, .. } => Ok(streams),
            SignalMessage::Error { code, message, .. } => Err(SignallingError::TransientQuery(
                format!("{}: {}", code, message),
            )),
            other => Err(SignallingError::TransientQuery(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    /// Request a session with one producer; returns the minted session id
    pub async fn request_session(
        &self,
        consumer_id: &str,
        stream_id: &str,
    ) -> Result<String, SignallingError> {
        let key = RequestKey::Session {
            consumer_id: consumer_id.to_string(),
            stream_id: stream_id.to_string(),
        };
        let request = SignalMessage::SessionRequest {
            consumer_id: consumer_id.to_string(),
            stream_id: stream_id.to_string(),
        };
        let response = self
            .request(key, &request)
            .await
            .map_err(SignallingError::SessionRequest)?;
        match response {
            SignalMessage::SessionGranted { session_id, .. } => Ok(session_id),
            SignalMessage::Error { code, message, .. } => Err(SignallingError::SessionRequest(
                format!("{}: {}", code, message),
            )),
            other => Err(SignallingError::SessionRequest(format!(
                "unexpected response: {:?}",
                other
            ))),
        }
    }

    async fn request(
        &self,
        key: RequestKey,
        request: &SignalMessage,
    ) -> Result<SignalMessage, String> {
        let (rx, serial) = self.correlator.register(key.clone());
        if let Err(e) = self.channel.send(request) {
            self.correlator.cancel(&key, serial);
            return Err(e.to_string());
        }
        match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err("request superseded".to_string()),
            Err(_) => {
                self.correlator.cancel(&key, serial);
                Err("timed out waiting for response".to_string())
            }
        }
    }

    /// Fire-and-forget delivery of a negotiation message; no acknowledgment
    /// is waited on.
    pub fn send_negotiation(&self, scope: &SessionScope, payload: NegotiationPayload) {
        let message = SignalMessage::negotiation(scope, payload);
        if let Err(e) = self.channel.send(&message) {
            warn!(
                "signalling: negotiation send failed for session {}: {}",
                scope.session_id, e
            );
        }
    }

    /// Fire-and-forget end-session notice
    pub fn send_end_session(&self, scope: &SessionScope, reason: &str) {
        let message = SignalMessage::end_session(scope, reason);
        if let Err(e) = self.channel.send(&message) {
            warn!(
                "signalling: end-session send failed for session {}: {}",
                scope.session_id, e
            );
        }
    }

    /// Install the negotiation filter for one session scope.
    ///
    /// Idempotent: re-subscribing replaces rather than duplicates the filter.
    pub fn subscribe_negotiation(
        &self,
        scope: SessionScope,
        on_candidate: Box<dyn Fn(Candidate) + Send + Sync>,
        on_description: Box<dyn Fn(SessionDescription) + Send + Sync>,
    ) {
        let mut guard = self.negotiation.lock();
        if let Some(previous) = guard.as_ref() {
            debug!(
                "signalling: replacing negotiation filter for session {}",
                previous.scope.session_id
            );
        }
        *guard = Some(NegotiationSub {
            scope,
            on_candidate,
            on_description,
        });
    }

    /// Install a one-shot filter for the remote end-session notice
    pub fn subscribe_end_session(
        &self,
        scope: SessionScope,
        on_ended: Box<dyn FnOnce(String) + Send>,
    ) {
        *self.end_session.lock() = Some(EndSub { scope, on_ended });
    }

    /// Remove filters installed for one session scope
    pub fn unsubscribe(&self, scope: &SessionScope) {
        let mut negotiation = self.negotiation.lock();
        if negotiation.as_ref().is_some_and(|sub| &sub.scope == scope) {
            *negotiation = None;
        }
        drop(negotiation);
        let mut end_session = self.end_session.lock();
        if end_session.as_ref().is_some_and(|sub| &sub.scope == scope) {
            *end_session = None;
        }
    }
}
