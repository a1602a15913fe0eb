//! Signalling layer
//!
//! This module provides the out-of-band signalling used to bootstrap a peer
//! media session:
//! - Typed wire messages over a message-oriented channel
//! - Request/response correlation
//! - Consumer registration, catalog discovery, and session negotiation

pub mod channel;
pub mod client;
pub mod correlator;
pub mod protocol;

pub use channel::{ChannelConnector, ChannelEvent, ChannelStatus, WebSocketConnector};
pub use client::SignallingClient;
pub use protocol::{SignalMessage, SessionScope, Stream};

use std::error::Error;
use std::fmt;

/// Signalling-related errors
///
/// Everything here is recoverable from the orchestrator's point of view:
/// requests are retried by the caller, never internally.
#[derive(Debug)]
pub enum SignallingError {
    /// Transport to the signalling service is down
    Channel(String),
    /// Consumer registration failed
    Registration(String),
    /// Catalog query failed or timed out
    TransientQuery(String),
    /// Session request was rejected or timed out
    SessionRequest(String),
    /// Malformed or unexpected wire message
    Protocol(String),
}

impl fmt::Display for SignallingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignallingError::Channel(msg) => write!(f, "Channel error: {}", msg),
            SignallingError::Registration(msg) => write!(f, "Registration error: {}", msg),
            SignallingError::TransientQuery(msg) => write!(f, "Query error: {}", msg),
            SignallingError::SessionRequest(msg) => write!(f, "Session request error: {}", msg),
            SignallingError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl Error for SignallingError {}
