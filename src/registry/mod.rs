//! # Service Registry Module
//!
//! Abstraction over service registration and discovery. Implementations
//! expose the same capability set (register, deregister, discover, watch,
//! health-check) behind the [`Registry`] trait, and are selected by the
//! `registry.type` configuration value through [`build`]. Two backends ship
//! today: [`consul::ConsulRegistry`] over the Consul HTTP API and
//! [`memory::InMemoryRegistry`] for tests and single-node setups.

pub mod consul;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::config::RegistryConfig;
use crate::core::error::{GatewayError, GatewayResult};

/// A single backend instance as known to the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Globally unique instance id.
    pub id: String,
    /// Logical service name, e.g. `order.OrderService`.
    pub name: String,
    /// Host address.
    pub address: String,
    /// gRPC port.
    pub port: u16,
    /// Ordered tag list.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form metadata. Well-known keys: `http_port`, `weight`,
    /// `protocol`.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// The `"host:port"` dial target for this instance.
    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Load-balancing weight from `metadata["weight"]`. Missing,
    /// unparseable or non-positive values default to 1.
    pub fn weight(&self) -> u64 {
        self.metadata
            .get("weight")
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|weight| *weight > 0)
            .map(|weight| weight as u64)
            .unwrap_or(1)
    }
}

/// Service registration and discovery capability set.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Register an instance. Re-registering the same id replaces the
    /// previous registration.
    async fn register(&self, instance: ServiceInstance) -> GatewayResult<()>;

    /// Remove an instance by id.
    async fn deregister(&self, instance_id: &str) -> GatewayResult<()>;

    /// List the passing instances of a service. An empty list is a valid
    /// result, not an error.
    async fn discover(&self, service_name: &str) -> GatewayResult<Vec<ServiceInstance>>;

    /// Subscribe to instance-set changes for a service.
    async fn watch(&self, service_name: &str) -> GatewayResult<Box<dyn Watcher>>;

    /// Report an instance healthy (refreshes TTL-style checks).
    async fn health_check(&self, instance_id: &str) -> GatewayResult<()>;
}

impl std::fmt::Debug for dyn Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Registry")
    }
}

/// An infinite sequence of instance-set snapshots.
///
/// Each snapshot is the complete current set, not a delta, and snapshots
/// are emitted only when the registry's backing index advances. After
/// [`Watcher::stop`], the next [`Watcher::next`] fails promptly with a
/// cancellation error instead of blocking.
#[async_trait]
pub trait Watcher: Send {
    async fn next(&mut self) -> GatewayResult<Vec<ServiceInstance>>;

    fn stop(&mut self);
}

/// Build the configured registry.
///
/// Known kinds are enumerated right here instead of a process-wide factory
/// table, so composition has no hidden init-time side effects. Returns
/// `None` when the registry is disabled.
pub fn build(config: &RegistryConfig) -> GatewayResult<Option<Arc<dyn Registry>>> {
    if !config.enabled {
        return Ok(None);
    }

    match config.kind.as_str() {
        "consul" => Ok(Some(Arc::new(consul::ConsulRegistry::new(
            consul::ConsulConfig::from_registry_config(config),
        )?))),
        "memory" => Ok(Some(Arc::new(memory::InMemoryRegistry::new()))),
        other => Err(GatewayError::config(format!(
            "unsupported registry type: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_target() {
        let instance = ServiceInstance {
            id: "a".to_string(),
            name: "echo.Echo".to_string(),
            address: "127.0.0.1".to_string(),
            port: 50051,
            ..Default::default()
        };
        assert_eq!(instance.target(), "127.0.0.1:50051");
    }

    #[test]
    fn test_instance_weight_parsing() {
        let mut instance = ServiceInstance::default();
        assert_eq!(instance.weight(), 1);

        instance.metadata.insert("weight".into(), "3".into());
        assert_eq!(instance.weight(), 3);

        instance.metadata.insert("weight".into(), "-2".into());
        assert_eq!(instance.weight(), 1);

        instance.metadata.insert("weight".into(), "heavy".into());
        assert_eq!(instance.weight(), 1);
    }

    #[test]
    fn test_build_disabled_registry() {
        let config = RegistryConfig::default();
        assert!(build(&config).unwrap().is_none());
    }

    #[test]
    fn test_build_unsupported_kind() {
        let config = RegistryConfig {
            enabled: true,
            kind: "zookeeper".to_string(),
            ..Default::default()
        };
        let err = build(&config).unwrap_err();
        assert!(err.to_string().contains("unsupported registry type"));
    }

    #[test]
    fn test_build_memory_kind() {
        let config = RegistryConfig {
            enabled: true,
            kind: "memory".to_string(),
            ..Default::default()
        };
        assert!(build(&config).unwrap().is_some());
    }
}
