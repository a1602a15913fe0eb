//! Configuration management for streamview

use crate::manager::ManagerSettings;
use crate::transport::{IceServer, TransportConfig};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Signalling service configuration
    pub signalling: SignallingConfig,

    /// ICE/TURN transport configuration
    #[serde(default)]
    pub transport: TransportSettings,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignallingConfig {
    /// WebSocket URL of the signalling service
    pub url: String,

    /// Delay between catalog polls and session request retries in ms
    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,

    /// How long a signalling request waits for its response in ms
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Keepalive ping interval in seconds
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Delay between channel reconnect attempts in ms
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransportSettings {
    /// STUN server host
    #[serde(default)]
    pub stun_host: String,

    /// STUN server port
    #[serde(default)]
    pub stun_port: u16,

    /// TURN server host
    #[serde(default)]
    pub turn_host: String,

    /// TURN server port
    #[serde(default)]
    pub turn_port: u16,

    /// TURN transport protocol ("udp" or "tcp")
    #[serde(default)]
    pub turn_protocol: String,

    /// Use turns: scheme
    #[serde(default)]
    pub turn_tls: bool,

    /// Static TURN username
    #[serde(default)]
    pub turn_username: String,

    /// Static TURN password
    #[serde(default)]
    pub turn_password: String,

    /// Shared secret for TURN REST ephemeral credentials; takes precedence
    /// over the static username/password pair
    #[serde(default)]
    pub turn_shared_secret: String,

    /// Extra ICE servers used verbatim when no STUN/TURN host is configured
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signalling: SignallingConfig {
                url: "ws://127.0.0.1:8443/ws".to_string(),
                poll_delay_ms: default_poll_delay_ms(),
                request_timeout_ms: default_request_timeout_ms(),
                ping_interval_secs: default_ping_interval_secs(),
                connect_retry_ms: default_connect_retry_ms(),
            },
            transport: TransportSettings::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if !self.signalling.url.starts_with("ws://") && !self.signalling.url.starts_with("wss://") {
            return Err("Signalling url must use the ws:// or wss:// scheme".into());
        }

        if self.signalling.poll_delay_ms == 0 {
            return Err("Signalling poll_delay_ms must be non-zero".into());
        }

        if self.signalling.request_timeout_ms == 0 {
            return Err("Signalling request_timeout_ms must be non-zero".into());
        }

        if !self.transport.turn_host.is_empty() && self.transport.turn_port == 0 {
            return Err("TURN port must be set when a TURN host is configured".into());
        }

        match self.transport.turn_protocol.as_str() {
            "" | "udp" | "tcp" => {}
            _ => return Err("TURN protocol must be \"udp\" or \"tcp\"".into()),
        }

        Ok(())
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            poll_delay: Duration::from_millis(self.signalling.poll_delay_ms),
            connect_retry_delay: Duration::from_millis(self.signalling.connect_retry_ms),
            request_timeout: Duration::from_millis(self.signalling.request_timeout_ms),
            transport: self.transport.build(),
        }
    }
}

impl TransportSettings {
    /// Assemble the ICE server list. STUN and TURN hosts take precedence;
    /// the verbatim ice_servers list is the fallback.
    pub fn build(&self) -> TransportConfig {
        let mut servers = Vec::new();

        let has_stun = !self.stun_host.is_empty() && self.stun_port != 0;
        if has_stun {
            servers.push(IceServer {
                urls: vec![format!("stun:{}:{}", self.stun_host, self.stun_port)],
                username: None,
                credential: None,
            });
        }

        if !self.turn_host.is_empty() {
            let scheme = if self.turn_tls { "turns" } else { "turn" };
            let transport = if self.turn_protocol.is_empty() {
                "udp"
            } else {
                self.turn_protocol.as_str()
            };
            let url = format!(
                "{}:{}:{}?transport={}",
                scheme, self.turn_host, self.turn_port, transport
            );

            let (username, credential) = if !self.turn_shared_secret.is_empty() {
                // TURN REST: ephemeral credentials derived from the shared
                // secret, valid for 24 hours
                let ttl_secs: u64 = 24 * 60 * 60;
                let expiry = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs() + ttl_secs)
                    .unwrap_or(ttl_secs);
                let user = format!("{}:streamview", expiry);
                let password = hmac_sha1_base64(&self.turn_shared_secret, &user);
                (Some(user), Some(password))
            } else if !self.turn_username.is_empty() && !self.turn_password.is_empty() {
                (
                    Some(self.turn_username.clone()),
                    Some(self.turn_password.clone()),
                )
            } else {
                (None, None)
            };

            servers.push(IceServer {
                urls: vec![url],
                username,
                credential,
            });
        }

        if servers.is_empty() {
            servers = self.ice_servers.clone();
        }

        TransportConfig {
            ice_servers: servers,
        }
    }
}

fn hmac_sha1_base64(secret: &str, message: &str) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| Hmac::<Sha1>::new_from_slice(&[]).unwrap());
    mac.update(message.as_bytes());
    let result = mac.finalize().into_bytes();
    base64::engine::general_purpose::STANDARD.encode(result)
}

fn default_poll_delay_ms() -> u64 {
    1000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_ping_interval_secs() -> u64 {
    5
}

fn default_connect_retry_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_non_websocket_url() {
        let mut cfg = Config::default();
        cfg.signalling.url = "http://example.com".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_turn_host_without_port() {
        let mut cfg = Config::default();
        cfg.transport.turn_host = "turn.example.com".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn build_combines_stun_and_turn() {
        let settings = TransportSettings {
            stun_host: "stun.example.com".to_string(),
            stun_port: 3478,
            turn_host: "turn.example.com".to_string(),
            turn_port: 3478,
            turn_protocol: "tcp".to_string(),
            turn_username: "user".to_string(),
            turn_password: "pass".to_string(),
            ..TransportSettings::default()
        };
        let config = settings.build();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].urls[0], "stun:stun.example.com:3478");
        assert_eq!(
            config.ice_servers[1].urls[0],
            "turn:turn.example.com:3478?transport=tcp"
        );
        assert_eq!(config.ice_servers[1].username.as_deref(), Some("user"));
    }

    #[test]
    fn build_mints_rest_credentials_from_shared_secret() {
        let settings = TransportSettings {
            turn_host: "turn.example.com".to_string(),
            turn_port: 3478,
            turn_shared_secret: "s3cret".to_string(),
            // Static credentials are ignored when a shared secret is set
            turn_username: "user".to_string(),
            turn_password: "pass".to_string(),
            ..TransportSettings::default()
        };
        let config = settings.build();
        let server = &config.ice_servers[0];
        let username = server.username.as_deref().unwrap();
        assert!(username.ends_with(":streamview"));
        assert!(!server.credential.as_deref().unwrap().is_empty());
    }

    #[test]
    fn build_falls_back_to_verbatim_servers() {
        let settings = TransportSettings {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
            ..TransportSettings::default()
        };
        let config = settings.build();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(
            config.ice_servers[0].urls[0],
            "stun:stun.l.google.com:19302"
        );
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let path = PathBuf::from("/nonexistent/streamview-core.toml");
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.signalling.poll_delay_ms, 1000);
        assert_eq!(cfg.logging.level, "info");
    }
}
