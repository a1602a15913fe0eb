//! streamview-core - WebRTC stream consumer
//!
//! Signalling client and session lifecycle manager for consuming remote
//! media streams: registers with a signalling service, discovers available
//! streams, negotiates a session for the selected one, and recovers when
//! the session or the channel is lost.

pub mod config;
pub mod manager;
pub mod retry;
pub mod session;
pub mod signalling;
pub mod status;
pub mod transport;

// Re-exports
pub use config::{Config, SignallingConfig, TransportSettings};
pub use manager::{ManagerSettings, StreamManager, ViewerHandles};
pub use signalling::{SignalMessage, SignallingClient, Stream, WebSocketConnector};
pub use status::Status;
pub use transport::{MediaHandle, TransportConfig, TransportFactory};
