use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::heartbeat::validate_heartbeat_header;

/// Heart-beat advertised when none is configured ("cx,cy" in ms).
pub const DEFAULT_HEARTBEAT: &str = "10000,10000";

/// Errors raised while building a [`SessionConfig`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid broker url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported url scheme '{0}' (expected ws or wss)")]
    UnsupportedScheme(String),
    #[error("invalid heart-beat '{0}' (expected \"<send-ms>,<recv-ms>\")")]
    InvalidHeartbeat(String),
}

/// Address of a STOMP-over-WebSocket broker endpoint.
///
/// Only `ws://` and `wss://` URLs are accepted. The port is always resolved,
/// falling back to the scheme default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerUrl {
    url: Url,
}

impl BrokerUrl {
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(input).map_err(|e| ConfigError::InvalidUrl {
            url: input.to_string(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ConfigError::InvalidUrl {
                url: input.to_string(),
                reason: "missing host".to_string(),
            });
        }
        Ok(Self { url })
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.scheme() == "wss" { 443 } else { 80 })
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl FromStr for BrokerUrl {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BrokerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Settings for a [`crate::StompSession`].
///
/// ```
/// use std::time::Duration;
/// use wsstomp::SessionConfig;
///
/// let config = SessionConfig::new("ws://localhost:8765/ws")?
///     .with_heartbeat("5000,5000")?
///     .with_connect_timeout(Duration::from_secs(5));
/// assert_eq!(config.broker_url.port(), 8765);
/// # Ok::<(), wsstomp::ConfigError>(())
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Broker endpoint (`brokerUrl`).
    pub broker_url: BrokerUrl,
    /// Value of the CONNECT `host` header. Defaults to the URL host.
    pub virtual_host: String,
    /// Optional `(login, passcode)` sent with CONNECT.
    pub credentials: Option<(String, String)>,
    /// Client `heart-beat` header ("cx,cy" in ms).
    pub heartbeat: String,
    /// Upper bound on transport open plus the CONNECTED handshake.
    pub connect_timeout: Option<Duration>,
}

impl SessionConfig {
    pub fn new(broker_url: &str) -> Result<Self, ConfigError> {
        let broker_url = BrokerUrl::parse(broker_url)?;
        Ok(Self {
            virtual_host: broker_url.host().to_string(),
            broker_url,
            credentials: None,
            heartbeat: DEFAULT_HEARTBEAT.to_string(),
            connect_timeout: None,
        })
    }

    pub fn with_credentials(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.credentials = Some((login.into(), passcode.into()));
        self
    }

    pub fn with_virtual_host(mut self, host: impl Into<String>) -> Self {
        self.virtual_host = host.into();
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: &str) -> Result<Self, ConfigError> {
        if validate_heartbeat_header(heartbeat).is_none() {
            return Err(ConfigError::InvalidHeartbeat(heartbeat.to_string()));
        }
        self.heartbeat = heartbeat.trim().to_string();
        Ok(self)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}
