use clap::Parser;
use std::path::PathBuf;

use streamview_core::config;

#[derive(Parser, Debug)]
#[command(name = "streamview-core")]
#[command(version = "0.2.0")]
#[command(about = "WebRTC stream consumer core", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/streamview-core.toml")]
    pub config: PathBuf,

    /// Signalling service URL (overrides the config file)
    #[arg(short, long)]
    pub url: Option<String>,

    /// Name of the stream to consume
    #[arg(short, long)]
    pub stream: Option<String>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }
}
