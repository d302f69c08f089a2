pub mod manager;
pub mod node;

use serde::{Deserialize, Serialize};

/// How the pool picks an egress endpoint for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RotationPolicy {
    /// Cycle through healthy proxies in order
    #[default]
    RoundRobin,
    /// Random healthy proxy on every request
    PerRequest,
    /// Keep one proxy per target host
    PerDomain,
    /// Keep one proxy for the whole job
    Sticky,
    /// Prefer the lowest observed latency
    SpeedBased,
    /// Prefer the highest recent success rate
    SuccessBased,
}

// Re-export common types
pub use manager::{ProxyLease, ProxyPool, ProxySelection};
pub use node::{HealthPolicy, ProxyHealth, ProxyNode, ProxyStatus};
