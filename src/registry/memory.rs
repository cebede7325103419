//! In-process registry backed by a concurrent map. Used by the test suites
//! and by single-node deployments that have no external registry.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::registry::{Registry, ServiceInstance, Watcher};

/// Versioned snapshot of a service's instance set. The index advances on
/// every mutation so watchers can suppress duplicate emissions.
type Snapshot = (u64, Vec<ServiceInstance>);

struct ServiceEntry {
    index: u64,
    instances: Vec<ServiceInstance>,
    tx: watch::Sender<Snapshot>,
}

impl ServiceEntry {
    fn new() -> Self {
        let (tx, _) = watch::channel((0, Vec::new()));
        Self {
            index: 0,
            instances: Vec::new(),
            tx,
        }
    }

    fn publish(&mut self) {
        self.index += 1;
        let _ = self.tx.send((self.index, self.instances.clone()));
    }
}

/// In-memory [`Registry`] implementation.
///
/// All registered instances are considered passing; health checks only
/// verify that the instance is known.
pub struct InMemoryRegistry {
    services: DashMap<String, ServiceEntry>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn register(&self, instance: ServiceInstance) -> GatewayResult<()> {
        let mut entry = self
            .services
            .entry(instance.name.clone())
            .or_insert_with(ServiceEntry::new);

        match entry.instances.iter_mut().find(|i| i.id == instance.id) {
            Some(existing) => *existing = instance,
            None => entry.instances.push(instance),
        }
        entry.publish();
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> GatewayResult<()> {
        for mut entry in self.services.iter_mut() {
            let before = entry.instances.len();
            entry.instances.retain(|i| i.id != instance_id);
            if entry.instances.len() != before {
                entry.publish();
                return Ok(());
            }
        }
        debug!(instance_id, "deregister of unknown instance ignored");
        Ok(())
    }

    async fn discover(&self, service_name: &str) -> GatewayResult<Vec<ServiceInstance>> {
        Ok(self
            .services
            .get(service_name)
            .map(|entry| entry.instances.clone())
            .unwrap_or_default())
    }

    async fn watch(&self, service_name: &str) -> GatewayResult<Box<dyn Watcher>> {
        let rx = self
            .services
            .entry(service_name.to_string())
            .or_insert_with(ServiceEntry::new)
            .tx
            .subscribe();

        Ok(Box::new(InMemoryWatcher {
            rx,
            token: CancellationToken::new(),
            last_index: 0,
            primed: false,
        }))
    }

    async fn health_check(&self, instance_id: &str) -> GatewayResult<()> {
        let known = self
            .services
            .iter()
            .any(|entry| entry.instances.iter().any(|i| i.id == instance_id));
        if known {
            Ok(())
        } else {
            Err(GatewayError::internal(format!(
                "unknown instance: {instance_id}"
            )))
        }
    }
}

struct InMemoryWatcher {
    rx: watch::Receiver<Snapshot>,
    token: CancellationToken,
    last_index: u64,
    primed: bool,
}

#[async_trait]
impl Watcher for InMemoryWatcher {
    async fn next(&mut self) -> GatewayResult<Vec<ServiceInstance>> {
        // First call returns the current snapshot immediately, mirroring a
        // blocking query with index zero.
        if !self.primed {
            self.primed = true;
            let snapshot = self.rx.borrow_and_update().clone();
            self.last_index = snapshot.0;
            return Ok(snapshot.1);
        }

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return Err(GatewayError::Canceled),
                changed = self.rx.changed() => {
                    changed.map_err(|_| GatewayError::Canceled)?;
                    let snapshot = self.rx.borrow_and_update().clone();
                    if snapshot.0 == self.last_index {
                        continue;
                    }
                    self.last_index = snapshot.0;
                    return Ok(snapshot.1);
                }
            }
        }
    }

    fn stop(&mut self) {
        self.token.cancel();
    }
}
