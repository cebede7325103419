//! # Connection Pool Module
//!
//! Target-keyed cache of long-lived gRPC channels. Channels are dialed
//! lazily with keepalive pings so one transport per backend is shared by
//! every request, and an entry observed to be unhealthy is evicted and
//! re-dialed under the write lock. The pool never retries and never caches
//! a failed dial; dial errors propagate to the caller as a retryable
//! condition.

use metrics::counter;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use crate::core::error::GatewayResult;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(3);

struct PoolEntry {
    channel: Channel,
    healthy: Arc<AtomicBool>,
}

/// Shared pool of gRPC client channels, keyed by `"host:port"`.
///
/// Concurrency: reads consult distinct entries in parallel; only entry
/// insertion and eviction serialize, with a double-check after taking the
/// write lock so losers of a dial race receive the winner's channel.
pub struct ConnectionPool {
    connections: RwLock<HashMap<String, PoolEntry>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Get the channel for a target, dialing a new one when the pool has
    /// no healthy entry.
    pub fn get(&self, target: &str) -> GatewayResult<Channel> {
        {
            let connections = self.connections.read();
            if let Some(entry) = connections.get(target) {
                if entry.healthy.load(Ordering::Acquire) {
                    counter!("gateway_pool_reused").increment(1);
                    return Ok(entry.channel.clone());
                }
            }
        }

        let mut connections = self.connections.write();
        // Double-check: another task may have replaced the entry while we
        // waited for the write lock.
        if let Some(entry) = connections.get(target) {
            if entry.healthy.load(Ordering::Acquire) {
                return Ok(entry.channel.clone());
            }
            connections.remove(target);
            debug!(target, "evicted unhealthy channel");
        }

        let channel = Self::dial(target)?;
        connections.insert(
            target.to_string(),
            PoolEntry {
                channel: channel.clone(),
                healthy: Arc::new(AtomicBool::new(true)),
            },
        );
        counter!("gateway_pool_dials").increment(1);
        info!(target, "dialed backend channel");
        Ok(channel)
    }

    /// Mark a target's channel unhealthy so the next `get` evicts and
    /// re-dials it. Called when the transport reports a connection-level
    /// failure.
    pub fn mark_unhealthy(&self, target: &str) {
        if let Some(entry) = self.connections.read().get(target) {
            entry.healthy.store(false, Ordering::Release);
            counter!("gateway_pool_marked_unhealthy").increment(1);
        }
    }

    /// Close and remove a target's channel.
    pub fn remove(&self, target: &str) {
        if self.connections.write().remove(target).is_some() {
            debug!(target, "removed channel");
        }
    }

    /// Close every channel and clear the pool.
    pub fn close(&self) {
        let mut connections = self.connections.write();
        let count = connections.len();
        connections.clear();
        if count > 0 {
            info!(count, "closed connection pool");
        }
    }

    /// Number of pooled channels.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Build the endpoint and start a lazy dial. Keepalive pings keep the
    /// transport verified while idle; the actual connection is established
    /// on first use, matching the non-blocking dial of the ingress path.
    fn dial(target: &str) -> GatewayResult<Channel> {
        let endpoint = Endpoint::from_shared(format!("http://{target}"))?
            .connect_timeout(Duration::from_secs(10))
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true);
        Ok(endpoint.connect_lazy())
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}
