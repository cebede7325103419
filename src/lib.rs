//! # Dynagate
//!
//! A schema-agnostic API gateway for gRPC backends. Service schemas are
//! supplied at runtime as serialized `FileDescriptorSet` blobs, so the
//! gateway can proxy services it was never compiled against:
//!
//! - HTTP/JSON ingress is transcoded to unary gRPC through dynamic messages
//!   built from the descriptor registry.
//! - Native gRPC ingress is forwarded transparently: unary and streaming
//!   payloads are relayed as opaque wire frames, never deserialized.
//! - Backends are resolved through a pluggable service registry, a load
//!   balancer, and a keepalive-aware connection pool.
//! - Descriptor sets can be hot-reloaded from disk or an artifact
//!   repository without tearing in-flight requests.

pub mod core;
pub mod load_balancing;
pub mod proto;
pub mod proxy;
pub mod registry;
pub mod server;

// Re-export the types nearly every consumer touches
pub use crate::core::config::Config;
pub use crate::core::error::{GatewayError, GatewayResult};
