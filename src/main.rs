//! streamview-core - Main entry point
//!
//! Connects to a signalling service, consumes the selected remote stream,
//! and keeps the session alive until interrupted.

mod args;

use args::Args;
use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use streamview_core::config::Config;
use streamview_core::manager::StreamManager;
use streamview_core::signalling::WebSocketConnector;
use streamview_core::transport::TransportFactory;
use tokio::signal;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("STREAMVIEW_LOG").unwrap_or_else(|_| log_level.to_string()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("streamview-core v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = match args.load_config() {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };

    // Apply command line overrides
    if let Some(ref url) = args.url {
        config.signalling.url = url.clone();
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let factory = transport_factory()?;
    let connector = Arc::new(WebSocketConnector::new(
        config.signalling.url.clone(),
        std::time::Duration::from_secs(config.signalling.ping_interval_secs),
    ));

    let (selector_tx, selector_rx) = watch::channel(args.stream.clone());
    match &args.stream {
        Some(name) => info!("Consuming stream '{}'", name),
        None => warn!("No stream selected; waiting for a selection"),
    }

    let handles = StreamManager::start(config.manager_settings(), connector, factory, selector_rx);

    // Log observable changes
    let mut streams_rx = handles.streams.clone();
    tokio::spawn(async move {
        while streams_rx.changed().await.is_ok() {
            let names: Vec<String> = streams_rx.borrow().iter().map(|s| s.name.clone()).collect();
            info!("Available streams: {:?}", names);
        }
    });
    let mut media_rx = handles.media.clone();
    tokio::spawn(async move {
        while media_rx.changed().await.is_ok() {
            match media_rx.borrow().as_ref() {
                Some(handle) => info!("Receiving {} track {}", handle.kind, handle.track_id),
                None => info!("Media stopped"),
            }
        }
    });
    let mut signaller_rx = handles.signaller_status.clone();
    tokio::spawn(async move {
        while signaller_rx.changed().await.is_ok() {
            info!("Signaller: {}", signaller_rx.borrow().text);
        }
    });
    let mut stream_rx = handles.stream_status.clone();
    tokio::spawn(async move {
        while stream_rx.changed().await.is_ok() {
            info!("Stream: {}", stream_rx.borrow().text);
        }
    });

    // Wait for shutdown signal
    let _ = signal::ctrl_c().await;
    info!("Shutdown signal received");

    handles.close("shutdown");
    handles.closed().await;
    drop(selector_tx);

    info!("streamview-core stopped");
    Ok(())
}

#[cfg(feature = "webrtc-transport")]
fn transport_factory() -> Result<Arc<dyn TransportFactory>, Box<dyn std::error::Error>> {
    Ok(Arc::new(
        streamview_core::transport::peer::PeerTransportFactory,
    ))
}

#[cfg(not(feature = "webrtc-transport"))]
fn transport_factory() -> Result<Arc<dyn TransportFactory>, Box<dyn std::error::Error>> {
    Err("this build has no transport engine (webrtc-transport feature disabled)".into())
}
