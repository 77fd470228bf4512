//! Clash-compatible proxy configuration
//!
//! The config file carries a single proxy object in the Clash proxy schema
//! (the `vless` subset).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

fn default_connect_timeout() -> u64 {
    10
}

fn default_ws_path() -> String {
    "/".to_string()
}

/// Outbound protocol selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboundType {
    Vless,
}

/// Outbound transport network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Ws,
}

/// WebSocket transport options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsOpts {
    #[serde(default = "default_ws_path")]
    pub path: String,

    /// Extra headers sent with the upgrade request
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for WsOpts {
    fn default() -> Self {
        WsOpts {
            path: default_ws_path(),
            headers: HashMap::new(),
        }
    }
}

/// Proxy configuration, immutable per connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy name
    pub name: String,

    /// Proxy type
    #[serde(rename = "type")]
    pub proxy_type: OutboundType,

    /// Remote server address (IP or hostname)
    pub server: String,

    /// Remote server port
    pub port: u16,

    /// Client id, canonical hyphenated form
    pub uuid: Uuid,

    #[serde(default)]
    pub network: Network,

    #[serde(default)]
    pub tls: bool,

    /// Informational; UDP ASSOCIATE is always served
    #[serde(default)]
    pub udp: bool,

    /// SNI override
    #[serde(default)]
    pub servername: Option<String>,

    #[serde(rename = "skip-cert-verify", default)]
    pub skip_cert_verify: bool,

    #[serde(rename = "ws-opts", default)]
    pub ws_opts: Option<WsOpts>,

    /// Outbound establishment deadline in seconds (TCP connect, TLS
    /// handshake and WebSocket upgrade combined)
    #[serde(rename = "connect-timeout", default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl ProxyConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: ProxyConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("Proxy name cannot be empty"));
        }
        if self.server.is_empty() {
            return Err(Error::config("Proxy server cannot be empty"));
        }
        if self.port == 0 {
            return Err(Error::config("Proxy port cannot be 0"));
        }
        if self.connect_timeout == 0 {
            return Err(Error::config("connect-timeout cannot be 0"));
        }
        Ok(())
    }

    /// TLS SNI / WebSocket Host value
    pub fn server_name(&self) -> &str {
        self.servername.as_deref().unwrap_or(&self.server)
    }

    /// WebSocket upgrade path
    pub fn ws_path(&self) -> &str {
        self.ws_opts.as_ref().map(|o| o.path.as_str()).unwrap_or("/")
    }

    /// Extra WebSocket upgrade headers
    pub fn ws_headers(&self) -> Vec<(String, String)> {
        self.ws_opts
            .as_ref()
            .map(|o| o.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}
