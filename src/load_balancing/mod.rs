//! Load balancing strategies for backend instance selection.

pub mod balancer;

pub use balancer::{
    for_strategy, LoadBalancer, RandomBalancer, RoundRobinBalancer, WeightedBalancer,
};
