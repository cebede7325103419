//! # Load Balancer Module
//!
//! Selection strategies over a discovered instance list. Selection is a
//! pure function with no I/O, no retries and no health probing; callers
//! treat a `None` result as a retryable "no backend" condition.
//!
//! Three strategies are provided:
//!
//! 1. **Round robin**: atomic counter modulo list length.
//! 2. **Random**: uniform pick from the list.
//! 3. **Weighted**: deterministic walk over cumulative weights read from
//!    `metadata["weight"]`.

use metrics::counter;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::registry::ServiceInstance;

/// A selection strategy over backend instances.
///
/// Implementations must be safe to share across request tasks; any
/// internal state is updated atomically.
pub trait LoadBalancer: Send + Sync {
    /// Select one instance from the list, or `None` when the list is
    /// empty.
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance>;

    /// Strategy name for logging and metrics.
    fn strategy(&self) -> &'static str;
}

/// Build the balancer for a configured strategy name. Unknown names fall
/// back to round robin.
pub fn for_strategy(name: &str) -> Box<dyn LoadBalancer> {
    match name {
        "random" => Box::new(RandomBalancer::new()),
        "weighted" => Box::new(WeightedBalancer::new()),
        _ => Box::new(RoundRobinBalancer::new()),
    }
}

/// Round-robin balancer.
///
/// The counter is incremented before indexing, so the first selection
/// returns index `1 % n`. Callers that line up expectations against the
/// selection sequence rely on this and it must be preserved.
pub struct RoundRobinBalancer {
    counter: AtomicU64,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }

        let turn = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let selected = &instances[(turn % instances.len() as u64) as usize];

        counter!("gateway_lb_selections").increment(1);
        debug!(
            instance_id = %selected.id,
            target = %selected.target(),
            strategy = "round_robin",
            "selected backend instance"
        );
        Some(selected)
    }

    fn strategy(&self) -> &'static str {
        "round_robin"
    }
}

/// Uniform random balancer.
pub struct RandomBalancer;

impl RandomBalancer {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RandomBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RandomBalancer {
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }

        let index = rand::thread_rng().gen_range(0..instances.len());
        let selected = &instances[index];

        counter!("gateway_lb_selections").increment(1);
        debug!(
            instance_id = %selected.id,
            target = %selected.target(),
            strategy = "random",
            "selected backend instance"
        );
        Some(selected)
    }

    fn strategy(&self) -> &'static str {
        "random"
    }
}

/// Weight-proportional balancer.
///
/// Weights come from `metadata["weight"]`; missing or unparseable values
/// count as 1. The counter advances on every selection and the instance
/// whose cumulative weight first exceeds `counter % total_weight` wins,
/// which yields an exactly weight-proportional sequence rather than a
/// probabilistic one.
pub struct WeightedBalancer {
    counter: AtomicU64,
}

impl WeightedBalancer {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for WeightedBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for WeightedBalancer {
    fn select<'a>(&self, instances: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }

        let total_weight: u64 = instances.iter().map(|i| i.weight()).sum();
        let turn = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        if total_weight == 0 {
            // All weights zero: degenerate to round robin.
            return Some(&instances[(turn % instances.len() as u64) as usize]);
        }

        let offset = turn % total_weight;
        let mut cumulative = 0u64;
        for instance in instances {
            cumulative += instance.weight();
            if offset < cumulative {
                counter!("gateway_lb_selections").increment(1);
                debug!(
                    instance_id = %instance.id,
                    target = %instance.target(),
                    weight = instance.weight(),
                    strategy = "weighted",
                    "selected backend instance"
                );
                return Some(instance);
            }
        }

        // Unreachable with a positive total weight; keep the walk total.
        Some(&instances[0])
    }

    fn strategy(&self) -> &'static str {
        "weighted"
    }
}
