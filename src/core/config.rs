//! # Configuration Module
//!
//! Serde-backed configuration for the gateway: listener addresses, the
//! service registry, and the protobuf descriptor sources. Files are parsed
//! as YAML or JSON depending on the extension.
//!
//! Durations in the registry section are expressed in whole seconds to keep
//! the on-disk format flat.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::error::{GatewayError, GatewayResult};

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub proto: ProtoConfig,
}

/// Listener configuration. Ports are kept as `":8080"`-style strings so
/// they can be passed straight to bind calls and trimmed for registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub http_port: String,
    pub grpc_port: String,
    /// Host address advertised during self-registration.
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: ":8080".to_string(),
            grpc_port: ":50051".to_string(),
            host: "127.0.0.1".to_string(),
        }
    }
}

/// Service registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// When false, proxying and self-registration are disabled.
    pub enabled: bool,
    /// Registry kind: `consul`, `memory` (`etcd` and `nacos` are reserved).
    #[serde(rename = "type")]
    pub kind: String,
    /// Registry endpoint, e.g. `127.0.0.1:8500` for Consul.
    pub address: String,
    /// Name the gateway registers itself under.
    pub service_name: String,
    /// Instance id the gateway registers itself with.
    pub service_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Health check timeout in seconds.
    pub health_check_timeout: u64,
    /// TTL for TTL-style health checks, in seconds.
    pub health_check_ttl: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            kind: "consul".to_string(),
            address: "127.0.0.1:8500".to_string(),
            service_name: "dynagate".to_string(),
            service_id: "dynagate-1".to_string(),
            tags: Vec::new(),
            health_check_timeout: 5,
            health_check_ttl: 15,
        }
    }
}

impl RegistryConfig {
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout)
    }

    pub fn health_check_ttl(&self) -> Duration {
        Duration::from_secs(self.health_check_ttl)
    }
}

/// Protobuf descriptor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtoConfig {
    /// Primary protoset file loaded at startup.
    #[serde(default)]
    pub protoset_path: String,
    /// Additional per-service protoset sources.
    #[serde(default)]
    pub protosets: Vec<ProtoSetInfo>,
    #[serde(default)]
    pub hot_reload: HotReloadConfig,
}

/// A single protoset source. Either `path` (local file) or `url`
/// (artifact repository download) should be set; `url` wins when both are.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtoSetInfo {
    pub service_name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub url: String,
}

/// Hot-reload driver configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotReloadConfig {
    pub enabled: bool,
    /// Refresh period in seconds. Must be positive when enabled.
    #[serde(default)]
    pub check_period: i64,
    /// Bearer token sent with protoset downloads, when non-empty.
    #[serde(default)]
    pub auth_token: String,
}

impl Config {
    /// Load configuration from a YAML or JSON file, chosen by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&contents)?),
            Some("json") => Ok(serde_json::from_str(&contents)?),
            other => Err(GatewayError::config(format!(
                "unsupported config extension: {:?}",
                other
            ))),
        }
    }
}
