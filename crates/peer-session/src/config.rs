//! Configuration types for the peer session core
//!
//! Configuration is read once at startup, either from `PEER_*` environment
//! variables or built in code. There is no hot reload.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Default relay host (public PeerJS-compatible cloud relay)
pub const DEFAULT_RELAY_HOST: &str = "0.peerjs.com";

/// Default relay API key
pub const DEFAULT_RELAY_KEY: &str = "peerjs";

/// Default STUN servers, in preference order
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Main configuration for the peer session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Relay host name
    pub relay_host: String,

    /// Relay port
    pub relay_port: u16,

    /// Relay mount path (must start and end with '/')
    pub relay_path: String,

    /// Use wss:// instead of ws://
    pub secure_transport: bool,

    /// Relay API key
    pub relay_key: String,

    /// ICE servers, in the order they are offered to the peer connection
    pub ice_servers: Vec<IceServerConfig>,

    /// ICE candidate pool size (pre-gathered candidates)
    pub ice_candidate_pool_size: u8,

    /// Relay heartbeat interval in milliseconds
    pub ping_interval_ms: u64,

    /// Base reconnect delay in milliseconds
    pub base_reconnect_delay_ms: u64,

    /// Ceiling for the reconnect delay in milliseconds
    pub max_reconnect_delay_ms: u64,

    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Case-insensitive label substring of the preferred camera
    pub preferred_camera_label: Option<String>,
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// STUN/TURN URLs for this server
    pub urls: Vec<String>,

    /// Username for TURN authentication
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,

    /// Credential for TURN authentication
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

impl IceServerConfig {
    /// Single-URL server without credentials
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: String::new(),
            credential: String::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_host: DEFAULT_RELAY_HOST.to_string(),
            relay_port: 443,
            relay_path: "/".to_string(),
            secure_transport: true,
            relay_key: DEFAULT_RELAY_KEY.to_string(),
            ice_servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServerConfig::new(*url))
                .collect(),
            ice_candidate_pool_size: 10,
            ping_interval_ms: 5000,
            base_reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 10000,
            max_reconnect_attempts: 5,
            preferred_camera_label: None,
        }
    }
}

impl SessionConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Load configuration from a variable map
    ///
    /// Unset variables keep their defaults. Recognized variables:
    /// `PEER_RELAY_HOST`, `PEER_RELAY_PORT`, `PEER_RELAY_PATH`,
    /// `PEER_RELAY_SECURE`, `PEER_RELAY_KEY`, `PEER_ICE_SERVERS`,
    /// `PEER_ICE_CANDIDATE_POOL_SIZE`, `PEER_PING_INTERVAL_MS`,
    /// `PEER_BASE_RECONNECT_DELAY_MS`, `PEER_MAX_RECONNECT_DELAY_MS`,
    /// `PEER_MAX_RECONNECT_ATTEMPTS`, `PEER_PREFERRED_CAMERA`.
    ///
    /// `PEER_ICE_SERVERS` is either a JSON array of `{"urls": [...]}`
    /// objects or a comma-separated list of single URLs.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(host) = vars.get("PEER_RELAY_HOST") {
            config.relay_host = host.clone();
        }
        if let Some(port) = vars.get("PEER_RELAY_PORT") {
            config.relay_port = parse_var("PEER_RELAY_PORT", port)?;
        }
        if let Some(path) = vars.get("PEER_RELAY_PATH") {
            config.relay_path = path.clone();
        }
        if let Some(secure) = vars.get("PEER_RELAY_SECURE") {
            config.secure_transport = parse_bool("PEER_RELAY_SECURE", secure)?;
        }
        if let Some(key) = vars.get("PEER_RELAY_KEY") {
            config.relay_key = key.clone();
        }
        if let Some(servers) = vars.get("PEER_ICE_SERVERS") {
            config.ice_servers = parse_ice_servers(servers)?;
        }
        if let Some(size) = vars.get("PEER_ICE_CANDIDATE_POOL_SIZE") {
            config.ice_candidate_pool_size = parse_var("PEER_ICE_CANDIDATE_POOL_SIZE", size)?;
        }
        if let Some(ms) = vars.get("PEER_PING_INTERVAL_MS") {
            config.ping_interval_ms = parse_var("PEER_PING_INTERVAL_MS", ms)?;
        }
        if let Some(ms) = vars.get("PEER_BASE_RECONNECT_DELAY_MS") {
            config.base_reconnect_delay_ms = parse_var("PEER_BASE_RECONNECT_DELAY_MS", ms)?;
        }
        if let Some(ms) = vars.get("PEER_MAX_RECONNECT_DELAY_MS") {
            config.max_reconnect_delay_ms = parse_var("PEER_MAX_RECONNECT_DELAY_MS", ms)?;
        }
        if let Some(n) = vars.get("PEER_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = parse_var("PEER_MAX_RECONNECT_ATTEMPTS", n)?;
        }
        if let Some(label) = vars.get("PEER_PREFERRED_CAMERA") {
            let label = label.trim();
            config.preferred_camera_label = (!label.is_empty()).then(|| label.to_string());
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `relay_host` is empty
    /// - `relay_path` does not start and end with '/'
    /// - `ice_servers` is empty or contains an entry without URLs
    /// - `ping_interval_ms` or `base_reconnect_delay_ms` is zero
    /// - `max_reconnect_delay_ms` is below `base_reconnect_delay_ms`
    pub fn validate(&self) -> Result<()> {
        if self.relay_host.trim().is_empty() {
            return Err(Error::InvalidConfig("relay_host must not be empty".to_string()));
        }

        if !self.relay_path.starts_with('/') || !self.relay_path.ends_with('/') {
            return Err(Error::InvalidConfig(format!(
                "relay_path must start and end with '/', got {}",
                self.relay_path
            )));
        }

        if self.ice_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one ICE server is required".to_string(),
            ));
        }
        if self.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return Err(Error::InvalidConfig(
                "Every ICE server needs at least one URL".to_string(),
            ));
        }

        if self.ping_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "ping_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.base_reconnect_delay_ms == 0 {
            return Err(Error::InvalidConfig(
                "base_reconnect_delay_ms must be greater than zero".to_string(),
            ));
        }

        if self.max_reconnect_delay_ms < self.base_reconnect_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "max_reconnect_delay_ms ({}) must be >= base_reconnect_delay_ms ({})",
                self.max_reconnect_delay_ms, self.base_reconnect_delay_ms
            )));
        }

        Ok(())
    }

    /// Build the relay WebSocket URL for a peer id and session token
    pub fn relay_url(&self, peer_id: &str, token: &str) -> Result<Url> {
        let scheme = if self.secure_transport { "wss" } else { "ws" };
        let base = format!(
            "{}://{}:{}{}peerjs",
            scheme, self.relay_host, self.relay_port, self.relay_path
        );

        let mut url = Url::parse(&base)
            .map_err(|e| Error::InvalidConfig(format!("Invalid relay URL {}: {}", base, e)))?;
        url.query_pairs_mut()
            .append_pair("key", &self.relay_key)
            .append_pair("id", peer_id)
            .append_pair("token", token);

        Ok(url)
    }

    /// Point the session at a different relay
    pub fn with_relay(mut self, host: &str, port: u16, secure: bool) -> Self {
        self.relay_host = host.to_string();
        self.relay_port = port;
        self.secure_transport = secure;
        self
    }

    /// Set the reconnect policy parameters
    pub fn with_reconnect(mut self, base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        self.base_reconnect_delay_ms = base_delay_ms;
        self.max_reconnect_delay_ms = max_delay_ms;
        self.max_reconnect_attempts = max_attempts;
        self
    }

    /// Set the preferred camera label substring
    pub fn with_preferred_camera(mut self, label: &str) -> Self {
        self.preferred_camera_label = Some(label.to_string());
        self
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::InvalidConfig(format!("{} is invalid ({}): {}", name, value, e)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::InvalidConfig(format!(
            "{} must be a boolean, got {}",
            name, other
        ))),
    }
}

fn parse_ice_servers(value: &str) -> Result<Vec<IceServerConfig>> {
    let value = value.trim();
    if value.starts_with('[') {
        return serde_json::from_str(value)
            .map_err(|e| Error::InvalidConfig(format!("PEER_ICE_SERVERS is not valid JSON: {}", e)));
    }

    Ok(value
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(IceServerConfig::new)
        .collect())
}
