//! Stream manager
//!
//! Single-task orchestrator for the consumer lifecycle: connect the
//! signalling channel, register, poll the stream catalog, request a session
//! for the selected stream, and keep the session alive until it ends or the
//! selection changes. All state lives in one tokio task fed by an event
//! queue; async work is spawned and reports back through the same queue, so
//! handlers never race each other.

use crate::retry::RetryLoop;
use crate::session::{Session, SessionHooks};
use crate::signalling::protocol::{SessionScope, Stream};
use crate::signalling::{ChannelConnector, ChannelStatus, SignallingClient, SignallingError};
use crate::status::{Status, StatusFeed};
use crate::transport::{
    Candidate, MediaHandle, SessionDescription, TransportConfig, TransportFactory,
};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Tunables for the manager loop
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Delay between catalog polls and between session request retries
    pub poll_delay: Duration,
    /// Delay between channel connect and consumer register retries
    pub connect_retry_delay: Duration,
    /// How long a signalling request waits for its response
    pub request_timeout: Duration,
    pub transport: TransportConfig,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            poll_delay: Duration::from_secs(1),
            connect_retry_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(5),
            transport: TransportConfig::default(),
        }
    }
}

/// Where the manager currently is in the consumer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    Idle,
    Registering,
    Discovering,
    Requesting,
    Active,
    Recovering,
}

/// Everything that can wake the manager loop
enum ManagerEvent {
    ChannelStatus {
        generation: u64,
        status: ChannelStatus,
    },
    ConnectOutcome {
        generation: u64,
        result: Result<Arc<SignallingClient>, SignallingError>,
    },
    RegisterOutcome {
        generation: u64,
        result: Result<String, SignallingError>,
    },
    CatalogOutcome {
        generation: u64,
        result: Result<Vec<Stream>, SignallingError>,
    },
    SessionOutcome {
        generation: u64,
        consumer_id: String,
        stream: Stream,
        result: Result<String, SignallingError>,
    },
    RemoteDescription {
        session_id: String,
        description: SessionDescription,
    },
    RemoteCandidate {
        session_id: String,
        candidate: Candidate,
    },
    TrackAdded {
        session_id: String,
        handle: MediaHandle,
    },
    SessionClosed {
        session_id: String,
        reason: String,
    },
    ConnectTick,
    RegisterTick,
    PollTick,
    RequestTick,
    Close {
        reason: String,
    },
}

enum Wake {
    Event(ManagerEvent),
    Selection(Option<String>),
}

/// Handles returned to the embedder: observables plus shutdown control
pub struct ViewerHandles {
    /// Latest stream catalog from the signalling service
    pub streams: watch::Receiver<Vec<Stream>>,
    /// Media handle of the active session's inbound track, if any
    pub media: watch::Receiver<Option<MediaHandle>>,
    /// Signalling channel / registration status line
    pub signaller_status: watch::Receiver<Status>,
    /// Session lifecycle status line
    pub stream_status: watch::Receiver<Status>,
    queue: mpsc::UnboundedSender<ManagerEvent>,
    task: JoinHandle<()>,
}

impl ViewerHandles {
    /// Ask the manager to shut down: end the session (notifying the remote
    /// side), close the channel, and stop retrying.
    pub fn close(&self, reason: &str) {
        let _ = self.queue.send(ManagerEvent::Close {
            reason: reason.to_string(),
        });
    }

    /// Wait for the manager task to finish
    pub async fn closed(self) {
        let _ = self.task.await;
    }
}

pub struct StreamManager {
    settings: ManagerSettings,
    connector: Arc<dyn ChannelConnector>,
    factory: Arc<dyn TransportFactory>,
    queue: mpsc::UnboundedSender<ManagerEvent>,
    /// Bumped on every connect attempt; events stamped with an older
    /// generation belong to a channel that is already gone.
    generation: u64,
    state: ManagerState,
    client: Option<Arc<SignallingClient>>,
    consumer_id: Option<String>,
    catalog: Vec<Stream>,
    desired: Option<String>,
    session: Option<Session>,
    connect_retry: RetryLoop,
    register_retry: RetryLoop,
    poll_retry: RetryLoop,
    request_retry: RetryLoop,
    ended: Arc<AtomicBool>,
    streams_tx: watch::Sender<Vec<Stream>>,
    media_tx: watch::Sender<Option<MediaHandle>>,
    signaller: StatusFeed,
    streamstat: StatusFeed,
}

impl StreamManager {
    /// Spawn the manager task and hand back its observables.
    ///
    /// `selector` carries the desired stream name; publishing a new value
    /// retargets the manager, `None` just tears the current session down.
    pub fn start(
        settings: ManagerSettings,
        connector: Arc<dyn ChannelConnector>,
        factory: Arc<dyn TransportFactory>,
        selector: watch::Receiver<Option<String>>,
    ) -> ViewerHandles {
        let (queue, events) = mpsc::unbounded_channel();
        let (streams_tx, streams_rx) = watch::channel(Vec::new());
        let (media_tx, media_rx) = watch::channel(None);
        let signaller = StatusFeed::new("signaller", "disconnected");
        let streamstat = StatusFeed::new("stream", "idle");
        let signaller_rx = signaller.subscribe();
        let streamstat_rx = streamstat.subscribe();
        let ended = Arc::new(AtomicBool::new(false));

        let manager = Self {
            connect_retry: RetryLoop::new("connect", settings.connect_retry_delay, ended.clone()),
            register_retry: RetryLoop::new("register", settings.connect_retry_delay, ended.clone()),
            poll_retry: RetryLoop::new("catalog", settings.poll_delay, ended.clone()),
            request_retry: RetryLoop::new("session", settings.poll_delay, ended.clone()),
            settings,
            connector,
            factory,
            queue: queue.clone(),
            generation: 0,
            state: ManagerState::Idle,
            client: None,
            consumer_id: None,
            catalog: Vec::new(),
            desired: None,
            session: None,
            ended,
            streams_tx,
            media_tx,
            signaller,
            streamstat,
        };
        let task = tokio::spawn(manager.run(events, selector));

        ViewerHandles {
            streams: streams_rx,
            media: media_rx,
            signaller_status: signaller_rx,
            stream_status: streamstat_rx,
            queue,
            task,
        }
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ManagerEvent>,
        mut selector: watch::Receiver<Option<String>>,
    ) {
        self.desired = selector.borrow_and_update().clone();
        self.begin_connect();

        let mut selector_open = true;
        loop {
            let wake = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => Wake::Event(event),
                    None => break,
                },
                changed = selector.changed(), if selector_open => match changed {
                    Ok(()) => Wake::Selection(selector.borrow_and_update().clone()),
                    Err(_) => {
                        selector_open = false;
                        continue;
                    }
                },
            };
            match wake {
                Wake::Event(ManagerEvent::Close { reason }) => {
                    self.shutdown(&reason).await;
                    break;
                }
                Wake::Event(event) => self.handle(event).await,
                Wake::Selection(selection) => self.on_selection(selection).await,
            }
        }
        // A connect that completed after the close was queued still owns a
        // live channel; drain and close it before dropping the queue.
        while let Ok(event) = events.try_recv() {
            if let ManagerEvent::ConnectOutcome {
                result: Ok(client), ..
            } = event
            {
                debug!("closing signalling channel established after shutdown");
                client.close();
            }
        }
        debug!("manager loop ended");
    }

    async fn handle(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::ChannelStatus { generation, status } => {
                if generation != self.generation {
                    return;
                }
                match status {
                    ChannelStatus::Connecting => {}
                    ChannelStatus::Open => self.signaller.set("connected"),
                    ChannelStatus::Closed => self.on_channel_lost("connection closed").await,
                    ChannelStatus::Error(e) => {
                        self.on_channel_lost(&format!("connection error: {}", e)).await
                    }
                }
            }
            ManagerEvent::ConnectOutcome { generation, result } => {
                if generation != self.generation {
                    return;
                }
                self.connect_retry.finish();
                match result {
                    Ok(client) => {
                        self.client = Some(client);
                        self.signaller.set("connected");
                        self.begin_register();
                    }
                    Err(e) => {
                        warn!("signalling connect failed: {}", e);
                        self.signaller.set(format!("connection failed: {}", e));
                        self.connect_retry
                            .reschedule(&self.queue, || ManagerEvent::ConnectTick);
                    }
                }
            }
            ManagerEvent::RegisterOutcome { generation, result } => {
                if generation != self.generation {
                    return;
                }
                self.register_retry.finish();
                match result {
                    Ok(consumer_id) => {
                        info!("registered as consumer {}", consumer_id);
                        self.signaller.set(format!("registered as {}", consumer_id));
                        self.consumer_id = Some(consumer_id);
                        self.set_state(ManagerState::Discovering);
                        self.begin_poll();
                    }
                    Err(e) => {
                        warn!("registration failed: {}", e);
                        self.signaller.set(format!("registration failed: {}", e));
                        self.register_retry
                            .reschedule(&self.queue, || ManagerEvent::RegisterTick);
                    }
                }
            }
            ManagerEvent::CatalogOutcome { generation, result } => {
                if generation != self.generation {
                    return;
                }
                self.poll_retry.finish();
                match result {
                    Ok(streams) => {
                        if *self.streams_tx.borrow() != streams {
                            info!("stream catalog updated: {} entries", streams.len());
                            self.streams_tx.send_replace(streams.clone());
                        }
                        self.catalog = streams;
                        self.maybe_request().await;
                    }
                    Err(e) => debug!("catalog poll failed: {}", e),
                }
                self.poll_retry
                    .reschedule(&self.queue, || ManagerEvent::PollTick);
            }
            ManagerEvent::SessionOutcome {
                generation,
                consumer_id,
                stream,
                result,
            } => {
                if generation != self.generation {
                    return;
                }
                self.request_retry.finish();
                let stale = self.consumer_id.as_deref() != Some(consumer_id.as_str())
                    || self.desired.as_deref() != Some(stream.name.as_str())
                    || self.session.is_some();
                if stale {
                    if let Ok(session_id) = &result {
                        debug!(
                            "discarding stale session grant {} for '{}'",
                            session_id, stream.name
                        );
                    }
                    self.maybe_request().await;
                    return;
                }
                match result {
                    Ok(session_id) => self.adopt_session(consumer_id, stream, session_id).await,
                    Err(e) => {
                        warn!("session request for '{}' failed: {}", stream.name, e);
                        self.streamstat.set(format!("request failed: {}", e));
                        self.request_retry
                            .reschedule(&self.queue, || ManagerEvent::RequestTick);
                    }
                }
            }
            ManagerEvent::RemoteDescription {
                session_id,
                description,
            } => {
                let Some(session) = self.session.as_mut().filter(|s| s.id() == session_id) else {
                    debug!("dropping description for inactive session {}", session_id);
                    return;
                };
                if let Err(e) = session.on_incoming_description(description).await {
                    warn!("session {}: remote description rejected: {}", session_id, e);
                    self.fail_session(&format!("negotiation failed: {}", e)).await;
                }
            }
            ManagerEvent::RemoteCandidate {
                session_id,
                candidate,
            } => {
                let Some(session) = self.session.as_mut().filter(|s| s.id() == session_id) else {
                    debug!("dropping candidate for inactive session {}", session_id);
                    return;
                };
                if let Err(e) = session.on_incoming_candidate(candidate).await {
                    warn!("session {}: candidate rejected: {}", session_id, e);
                }
            }
            ManagerEvent::TrackAdded { session_id, handle } => {
                if self.session.as_ref().is_some_and(|s| s.id() == session_id) {
                    info!(
                        "session {}: {} track {} available",
                        session_id, handle.kind, handle.track_id
                    );
                    self.media_tx.send_replace(Some(handle));
                }
            }
            ManagerEvent::SessionClosed { session_id, reason } => {
                if !self.session.as_ref().is_some_and(|s| s.id() == session_id) {
                    debug!("ignoring close notice for inactive session {}", session_id);
                    return;
                }
                info!("session {} lost: {}", session_id, reason);
                if let Some(mut session) = self.session.take() {
                    session.end(&reason, false).await;
                }
                self.media_tx.send_replace(None);
                self.streamstat.set(format!("session ended: {}", reason));
                // An involuntary loss invalidates the consumer identity as
                // well, so recovery re-registers before requesting again.
                self.consumer_id = None;
                self.set_state(ManagerState::Recovering);
                self.begin_register();
            }
            ManagerEvent::ConnectTick => {
                if self.connect_retry.disarm() {
                    self.begin_connect();
                }
            }
            ManagerEvent::RegisterTick => {
                if self.register_retry.disarm() {
                    self.begin_register();
                }
            }
            ManagerEvent::PollTick => {
                if self.poll_retry.disarm() {
                    self.begin_poll();
                }
            }
            ManagerEvent::RequestTick => {
                if self.request_retry.disarm() {
                    self.maybe_request().await;
                }
            }
            ManagerEvent::Close { .. } => unreachable!("handled by the run loop"),
        }
    }

    fn begin_connect(&mut self) {
        if self.ended.load(Ordering::SeqCst) || !self.connect_retry.try_begin() {
            return;
        }
        self.generation += 1;
        let generation = self.generation;
        self.signaller.set("connecting");

        let connector = self.connector.clone();
        let queue = self.queue.clone();
        let request_timeout = self.settings.request_timeout;
        let ended = self.ended.clone();
        tokio::spawn(async move {
            let (channel_tx, channel_rx) = mpsc::unbounded_channel();
            match connector.connect(channel_tx).await {
                Ok(channel) => {
                    let client = Arc::new(SignallingClient::new(channel, request_timeout));
                    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
                    client.clone().spawn_dispatch(channel_rx, status_tx);
                    let status_queue = queue.clone();
                    tokio::spawn(async move {
                        while let Some(status) = status_rx.recv().await {
                            let event = ManagerEvent::ChannelStatus { generation, status };
                            if status_queue.send(event).is_err() {
                                break;
                            }
                        }
                    });
                    let outcome = ManagerEvent::ConnectOutcome {
                        generation,
                        result: Ok(client.clone()),
                    };
                    // The manager may have shut down while the connect was in
                    // flight; nobody will ever close this channel if the
                    // outcome cannot be delivered. Checking ended after the
                    // send pairs with the drain at the end of the run loop.
                    if queue.send(outcome).is_err() || ended.load(Ordering::SeqCst) {
                        debug!("closing signalling channel established after shutdown");
                        client.close();
                    }
                }
                Err(e) => {
                    let _ = queue.send(ManagerEvent::ConnectOutcome {
                        generation,
                        result: Err(e),
                    });
                }
            }
        });
    }

    fn begin_register(&mut self) {
        if self.ended.load(Ordering::SeqCst) {
            return;
        }
        let Some(client) = self.client.clone() else {
            self.begin_connect();
            return;
        };
        if !self.register_retry.try_begin() {
            return;
        }
        self.set_state(ManagerState::Registering);

        let generation = self.generation;
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let result = client.register_consumer().await;
            let _ = queue.send(ManagerEvent::RegisterOutcome { generation, result });
        });
    }

    fn begin_poll(&mut self) {
        if self.ended.load(Ordering::SeqCst) {
            return;
        }
        let (Some(client), Some(consumer_id)) = (self.client.clone(), self.consumer_id.clone())
        else {
            return;
        };
        if !self.poll_retry.try_begin() {
            return;
        }

        let generation = self.generation;
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let result = client.list_streams(&consumer_id).await;
            let _ = queue.send(ManagerEvent::CatalogOutcome { generation, result });
        });
    }

    /// Issue a session request when the selected stream is present in the
    /// catalog and nothing blocks it: no live session, no request already in
    /// flight, identity established.
    async fn maybe_request(&mut self) {
        if self.ended.load(Ordering::SeqCst) {
            return;
        }
        let Some(name) = self.desired.clone() else {
            if self.session.is_none() {
                self.streamstat.set("no stream selected");
            }
            return;
        };
        if self.session.is_some() {
            // Selection changes tear the old session down before requesting
            return;
        }
        let Some(client) = self.client.clone() else {
            self.begin_connect();
            return;
        };
        let Some(consumer_id) = self.consumer_id.clone() else {
            self.begin_register();
            return;
        };
        let Some(stream) = self.catalog.iter().find(|s| s.name == name).cloned() else {
            self.streamstat.set(format!("waiting for stream '{}'", name));
            return;
        };
        if !self.request_retry.try_begin() {
            return;
        }
        self.set_state(ManagerState::Requesting);
        self.streamstat.set(format!("requesting '{}'", name));

        let generation = self.generation;
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let result = client.request_session(&consumer_id, &stream.id).await;
            let _ = queue.send(ManagerEvent::SessionOutcome {
                generation,
                consumer_id,
                stream,
                result,
            });
        });
    }

    async fn adopt_session(&mut self, consumer_id: String, stream: Stream, session_id: String) {
        let Some(client) = self.client.clone() else {
            return;
        };
        let scope = SessionScope {
            consumer_id,
            stream_id: stream.id.clone(),
            session_id: session_id.clone(),
        };

        let hooks = SessionHooks {
            on_candidate: {
                let queue = self.queue.clone();
                let session_id = session_id.clone();
                Box::new(move |candidate| {
                    let _ = queue.send(ManagerEvent::RemoteCandidate {
                        session_id: session_id.clone(),
                        candidate,
                    });
                })
            },
            on_description: {
                let queue = self.queue.clone();
                let session_id = session_id.clone();
                Box::new(move |description| {
                    let _ = queue.send(ManagerEvent::RemoteDescription {
                        session_id: session_id.clone(),
                        description,
                    });
                })
            },
            on_track: {
                let queue = self.queue.clone();
                let session_id = session_id.clone();
                Box::new(move |handle| {
                    let _ = queue.send(ManagerEvent::TrackAdded {
                        session_id: session_id.clone(),
                        handle,
                    });
                })
            },
            on_closed: {
                let queue = self.queue.clone();
                let session_id = session_id.clone();
                Box::new(move |reason| {
                    let _ = queue.send(ManagerEvent::SessionClosed {
                        session_id: session_id.clone(),
                        reason,
                    });
                })
            },
        };

        match Session::connect(
            scope.clone(),
            stream.clone(),
            client,
            &self.factory,
            &self.settings.transport,
            hooks,
        )
        .await
        {
            Ok(session) => {
                self.set_state(ManagerState::Active);
                self.streamstat
                    .set(format!("streaming '{}' ({})", stream.name, session_id));
                self.session = Some(session);
            }
            Err(e) => {
                warn!("transport setup for session {} failed: {}", session_id, e);
                self.streamstat.set(format!("transport failed: {}", e));
                if let Some(client) = &self.client {
                    client.send_end_session(&scope, "transport setup failed");
                }
                self.request_retry
                    .reschedule(&self.queue, || ManagerEvent::RequestTick);
            }
        }
    }

    /// Local session failure: keep the consumer identity, drop the session,
    /// and retry the request after the usual delay.
    async fn fail_session(&mut self, reason: &str) {
        if let Some(mut session) = self.session.take() {
            session.end(reason, true).await;
        }
        self.media_tx.send_replace(None);
        self.streamstat.set(format!("session failed: {}", reason));
        self.set_state(ManagerState::Requesting);
        self.request_retry
            .reschedule(&self.queue, || ManagerEvent::RequestTick);
    }

    async fn on_channel_lost(&mut self, reason: &str) {
        if self.client.take().is_none() {
            return;
        }
        warn!("signalling channel lost: {}", reason);
        self.signaller.set(format!("disconnected: {}", reason));
        self.consumer_id = None;
        self.register_retry.reset();
        self.poll_retry.reset();
        self.request_retry.reset();
        if let Some(mut session) = self.session.take() {
            // No channel left, so there is nobody to notify
            session.end(reason, false).await;
            self.media_tx.send_replace(None);
            self.streamstat.set(format!("session ended: {}", reason));
        }
        self.set_state(ManagerState::Recovering);
        self.begin_connect();
    }

    async fn on_selection(&mut self, selection: Option<String>) {
        if selection == self.desired {
            return;
        }
        info!("stream selection changed to {:?}", selection);
        self.desired = selection;

        let keep = matches!(
            (&self.session, &self.desired),
            (Some(session), Some(name)) if session.stream().name == *name
        );
        if !keep {
            if let Some(mut session) = self.session.take() {
                session.end("selection changed", true).await;
                self.media_tx.send_replace(None);
            }
        }
        match &self.desired {
            Some(name) => self.streamstat.set(format!("selected '{}'", name)),
            None => self.streamstat.set("no stream selected"),
        }
        self.maybe_request().await;
    }

    async fn shutdown(&mut self, reason: &str) {
        info!("shutting down: {}", reason);
        self.ended.store(true, Ordering::SeqCst);
        if let Some(mut session) = self.session.take() {
            session.end(reason, true).await;
        }
        self.media_tx.send_replace(None);
        if let Some(client) = self.client.take() {
            client.close();
        }
        self.streamstat.set("closed");
        self.signaller.set("closed");
        self.set_state(ManagerState::Idle);
    }

    fn set_state(&mut self, next: ManagerState) {
        if self.state != next {
            debug!("manager state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}
