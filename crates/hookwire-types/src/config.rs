//! Configuration types, deserialized from `hookwire.toml`.
//!
//! Every section carries `#[serde(default)]` so a partial file only overrides
//! what it names.

use crate::protocol::EncryptionProtocol;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum single frame size (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Settings for one RPC server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the listener on.
    pub listen_addr: String,
    /// Whether the hybrid encryption protocol is offered.
    pub encryption: bool,
    /// RSA modulus size for the server keypair.
    pub rsa_bits: usize,
    /// Largest accepted request frame, in bytes.
    pub max_message_size: u32,
    /// How long a connection may take to deliver its request.
    pub read_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            encryption: true,
            rsa_bits: 2048,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            read_timeout_ms: 30_000,
        }
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Settings for an RPC client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub addr: String,
    /// Protocol requested at handshake.
    pub protocol: EncryptionProtocol,
    /// Fail the handshake instead of falling back to plaintext.
    pub require_encryption: bool,
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    /// Largest accepted reply frame, in bytes.
    pub max_message_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            protocol: EncryptionProtocol::Hybrid,
            require_encryption: false,
            connect_timeout_ms: 10_000,
            send_timeout_ms: 10_000,
            receive_timeout_ms: 10_000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    /// Defaults pointed at `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

/// Bounded fixed-backoff retry policy for layered callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first try).
    pub max_attempts: u32,
    /// Delay between attempts in milliseconds.
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Records (data-store) service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordsConfig {
    pub server: ServerConfig,
    /// Path of the JSON record file.
    pub store_path: PathBuf,
    /// Tokens accepted in the `service_token` named argument. Empty disables
    /// the check.
    pub service_tokens: Vec<String>,
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:2000".to_string(),
                ..ServerConfig::default()
            },
            store_path: PathBuf::from("students.json"),
            service_tokens: Vec::new(),
        }
    }
}

/// Evaluator service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub server: ServerConfig,
    /// Connection to the records service.
    pub records: ClientConfig,
    /// Retry policy for records calls.
    pub retry: RetryConfig,
    /// Presented to the records service as `service_token`.
    pub service_token: Option<String>,
    /// Random bytes per bearer token.
    pub token_bytes: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            records: ClientConfig::new("127.0.0.1:2000"),
            retry: RetryConfig::default(),
            service_token: None,
            token_bytes: 32,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookwireConfig {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    pub records: RecordsConfig,
    pub evaluator: EvaluatorConfig,
    /// Used by `hookwire call`.
    pub client: ClientConfig,
}

impl HookwireConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        let mut config: HookwireConfig = toml::from_str(contents)?;
        if config.log_level.is_empty() {
            config.log_level = "info".to_string();
        }
        Ok(config)
    }
}
