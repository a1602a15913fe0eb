//! Signalling channel
//!
//! A message-oriented channel to the signalling endpoint that can be opened,
//! sent to, and closed, with connection status transitions reported to the
//! owner. The production implementation is a WebSocket client.

use super::protocol::SignalMessage;
use super::SignallingError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tokio_tungstenite::tungstenite::protocol::Message;

/// Connection status of the signalling channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelStatus {
    Connecting,
    Open,
    Closed,
    Error(String),
}

/// Everything the channel reports upward
#[derive(Debug)]
pub enum ChannelEvent {
    Status(ChannelStatus),
    Message(SignalMessage),
}

/// An open message channel to the signalling service
pub trait SignallingChannel: Send + Sync {
    /// Queue a message for delivery. Best-effort once the writer is gone.
    fn send(&self, message: &SignalMessage) -> Result<(), SignallingError>;

    /// Initiate an orderly shutdown of the channel
    fn close(&self);
}

/// Opens signalling channels; the seam that lets tests script the service
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<Arc<dyn SignallingChannel>, SignallingError>;
}

/// WebSocket-backed signalling channel
pub struct WebSocketConnector {
    url: String,
    ping_interval: Duration,
}

impl WebSocketConnector {
    pub fn new(url: String, ping_interval: Duration) -> Self {
        Self { url, ping_interval }
    }
}

struct WebSocketChannel {
    outbound: mpsc::UnboundedSender<Message>,
}

impl SignallingChannel for WebSocketChannel {
    fn send(&self, message: &SignalMessage) -> Result<(), SignallingError> {
        let text = message.to_json()?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| SignallingError::Channel("signalling channel writer is gone".to_string()))
    }

    fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(
        &self,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<Arc<dyn SignallingChannel>, SignallingError> {
        let _ = events.send(ChannelEvent::Status(ChannelStatus::Connecting));

        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| {
                let _ = events.send(ChannelEvent::Status(ChannelStatus::Error(e.to_string())));
                SignallingError::Channel(format!("connect to {}: {}", self.url, e))
            })?;

        info!("Signalling channel connected to {}", self.url);

        let (write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let writer_handle = tokio::spawn(async move {
            let mut write = write;
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if write.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Periodic keepalive pings; the service answers with pong
        let outbound_tx_ping = outbound_tx.clone();
        let ping_interval = self.ping_interval;
        tokio::spawn(async move {
            let mut interval = time::interval(ping_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let ping = SignalMessage::Ping {
                    timestamp: unix_time_secs(),
                };
                let text = match ping.to_json() {
                    Ok(text) => text,
                    Err(_) => break,
                };
                if outbound_tx_ping.send(Message::Text(text)).is_err() {
                    break;
                }
            }
        });

        let _ = events.send(ChannelEvent::Status(ChannelStatus::Open));

        let outbound_tx_reader = outbound_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match SignalMessage::from_json(&text) {
                        Ok(message) => {
                            if events.send(ChannelEvent::Message(message)).is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("Dropping unparseable signalling message: {}", e),
                    },
                    Ok(Message::Binary(data)) => {
                        debug!("Ignoring binary signalling frame: {} bytes", data.len());
                    }
                    Ok(Message::Ping(ping)) => {
                        let _ = outbound_tx_reader.send(Message::Pong(ping));
                    }
                    Ok(Message::Pong(_)) => {}
                    Ok(Message::Frame(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Err(e) => {
                        warn!("Signalling channel error: {}", e);
                        let _ =
                            events.send(ChannelEvent::Status(ChannelStatus::Error(e.to_string())));
                        let _ = writer_handle.await;
                        return;
                    }
                }
            }
            let _ = events.send(ChannelEvent::Status(ChannelStatus::Closed));
            let _ = writer_handle.await;
        });

        Ok(Arc::new(WebSocketChannel {
            outbound: outbound_tx,
        }))
    }
}

/// Seconds since the unix epoch, for keepalive round-trip measurement
pub fn unix_time_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn recv_event(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("event stream ended")
    }

    /// Minimal signalling endpoint: answers the first register with a fixed
    /// consumer id, then closes.
    async fn spawn_echo_service() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut write, mut read) = ws.split();
            while let Some(Ok(msg)) = read.next().await {
                if let Message::Text(text) = msg {
                    if let Ok(SignalMessage::Register) = SignalMessage::from_json(&text) {
                        let reply = SignalMessage::Registered {
                            consumer_id: "A1".to_string(),
                        };
                        let _ = write.send(Message::Text(reply.to_json().unwrap())).await;
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_connect_send_and_receive() {
        let url = spawn_echo_service().await;
        let connector = WebSocketConnector::new(url, Duration::from_secs(60));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let channel = connector.connect(events_tx).await.unwrap();
        match recv_event(&mut events_rx).await {
            ChannelEvent::Status(ChannelStatus::Connecting) => {}
            other => panic!("expected Connecting, got {:?}", other),
        }
        match recv_event(&mut events_rx).await {
            ChannelEvent::Status(ChannelStatus::Open) => {}
            other => panic!("expected Open, got {:?}", other),
        }

        channel.send(&SignalMessage::Register).unwrap();
        match recv_event(&mut events_rx).await {
            ChannelEvent::Message(SignalMessage::Registered { consumer_id }) => {
                assert_eq!(consumer_id, "A1");
            }
            other => panic!("expected Registered, got {:?}", other),
        }

        // Service closes after replying
        match recv_event(&mut events_rx).await {
            ChannelEvent::Status(ChannelStatus::Closed) => {}
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error() {
        // Port from a listener we immediately drop, so nothing is listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let connector = WebSocketConnector::new(url, Duration::from_secs(60));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        assert!(connector.connect(events_tx).await.is_err());

        match recv_event(&mut events_rx).await {
            ChannelEvent::Status(ChannelStatus::Connecting) => {}
            other => panic!("expected Connecting, got {:?}", other),
        }
        match recv_event(&mut events_rx).await {
            ChannelEvent::Status(ChannelStatus::Error(_)) => {}
            other => panic!("expected Error, got {:?}", other),
        }
    }
}
