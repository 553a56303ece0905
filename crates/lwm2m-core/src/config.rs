//! Client configuration.
//!
//! Configuration is loaded from JSON with camelCase keys. Every field has a
//! default, so a file only needs to name what differs. The configuration is
//! validated once at start and is immutable for the lifetime of a session.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Bootstrap is not supported")]
    BootstrapUnsupported,

    #[error("DTLS is enabled but no DTLS connector was supplied")]
    DtlsUnavailable,
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// LwM2M client configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Endpoint client name sent on registration.
    #[serde(alias = "endpoint")]
    pub client_name: String,

    pub server_host: String,

    pub server_port: u16,

    /// Local UDP port; 0 picks an ephemeral port.
    pub listen_port: u16,

    /// Resolve the server to an IPv4 address (otherwise IPv6 is preferred).
    #[serde(rename = "useIPv4")]
    pub use_ipv4: bool,

    #[serde(rename = "enableDTLS")]
    pub enable_dtls: bool,

    pub psk_identity: Option<String>,

    /// Pre-shared key as a hex string.
    pub psk_key: Option<String>,

    /// Registration lifetime in seconds.
    pub lifetime: u32,

    /// Largest datagram the client sends or accepts.
    pub max_packet_size: usize,

    /// Defer registration until explicitly triggered.
    pub lazy_start: bool,

    pub request_bootstrap: bool,

    /// Path to the objects file used to populate the resource store.
    pub objects_definitions: String,

    /// Keep the PSK out of debug output and logs.
    pub hide_sensitive_device_info: bool,

    pub transmission: TransmissionConfig,

    pub reconnect: ReconnectConfig,

    /// Upper bound on the time spent deregistering during stop.
    pub deregister_timeout_ms: u64,

    pub logging: LoggingConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "lwm2m-client".to_string(),
            server_host: "leshan.eclipseprojects.io".to_string(),
            server_port: 5683,
            listen_port: 56830,
            use_ipv4: true,
            enable_dtls: false,
            psk_identity: None,
            psk_key: None,
            lifetime: 300,
            max_packet_size: 1152,
            lazy_start: false,
            request_bootstrap: false,
            objects_definitions: "mapping.json".to_string(),
            hide_sensitive_device_info: true,
            transmission: TransmissionConfig::default(),
            reconnect: ReconnectConfig::default(),
            deregister_timeout_ms: 5000,
            logging: LoggingConfig::default(),
        }
    }
}

/// CoAP retransmission parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransmissionConfig {
    /// Initial acknowledgement timeout, doubled on every retransmission.
    pub ack_timeout_ms: u64,
    pub max_retransmit: u32,
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 2000,
            max_retransmit: 4,
        }
    }
}

/// Re-registration policy after a failed exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectConfig {
    pub attempts: u32,
    /// Delay before the first retry, doubled for each further attempt.
    pub backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Default filter directive for the log subscriber.
    pub level: String,
    /// Log every datagram with its decoded header.
    pub dump_messages: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dump_messages: false,
        }
    }
}

impl ClientConfig {
    /// Configuration for `client_name` talking to `host:port`, all else default.
    pub fn new(client_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_name: client_name.into(),
            server_host: host.into(),
            server_port: port,
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Check the configuration before any network activity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_name.trim().is_empty() {
            return Err(ConfigError::invalid("clientName", "must not be empty"));
        }
        if self.client_name.contains(['&', '?', '/']) {
            return Err(ConfigError::invalid(
                "clientName",
                "must not contain '&', '?' or '/'",
            ));
        }

        let host = self.server_host.trim();
        if host.is_empty() {
            return Err(ConfigError::invalid("serverHost", "must not be empty"));
        }
        if host.contains(char::is_whitespace) {
            return Err(ConfigError::invalid("serverHost", "must not contain whitespace"));
        }
        if self.server_port == 0 {
            return Err(ConfigError::invalid("serverPort", "must be between 1 and 65535"));
        }

        if self.lifetime == 0 {
            return Err(ConfigError::invalid("lifetime", "must be at least 1 second"));
        }
        if self.max_packet_size < 64 {
            return Err(ConfigError::invalid("maxPacketSize", "must be at least 64 bytes"));
        }
        if self.transmission.ack_timeout_ms == 0 {
            return Err(ConfigError::invalid("transmission.ackTimeoutMs", "must be positive"));
        }

        if self.request_bootstrap {
            return Err(ConfigError::BootstrapUnsupported);
        }

        if self.enable_dtls {
            if self.psk_identity.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::invalid(
                    "pskIdentity",
                    "required when DTLS is enabled",
                ));
            }
            match self.psk_key()? {
                Some(key) if !key.is_empty() => {}
                _ => {
                    return Err(ConfigError::invalid("pskKey", "required when DTLS is enabled"));
                }
            }
        }

        Ok(())
    }

    /// Decoded pre-shared key bytes.
    pub fn psk_key(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        self.psk_key
            .as_deref()
            .map(|key| hex::decode(key.trim()))
            .transpose()
            .map_err(|e| ConfigError::invalid("pskKey", format!("not valid hex: {}", e)))
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let psk_key = match (&self.psk_key, self.hide_sensitive_device_info) {
            (None, _) => None,
            (Some(_), true) => Some("<redacted>"),
            (Some(key), false) => Some(key.as_str()),
        };

        f.debug_struct("ClientConfig")
            .field("client_name", &self.client_name)
            .field("server_host", &self.server_host)
            .field("server_port", &self.server_port)
            .field("listen_port", &self.listen_port)
            .field("use_ipv4", &self.use_ipv4)
            .field("enable_dtls", &self.enable_dtls)
            .field("psk_identity", &self.psk_identity)
            .field("psk_key", &psk_key)
            .field("lifetime", &self.lifetime)
            .field("max_packet_size", &self.max_packet_size)
            .field("lazy_start", &self.lazy_start)
            .field("request_bootstrap", &self.request_bootstrap)
            .field("objects_definitions", &self.objects_definitions)
            .field("hide_sensitive_device_info", &self.hide_sensitive_device_info)
            .field("transmission", &self.transmission)
            .field("reconnect", &self.reconnect)
            .field("deregister_timeout_ms", &self.deregister_timeout_ms)
            .field("logging", &self.logging)
            .finish()
    }
}
