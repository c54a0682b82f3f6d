//! Cluster client configuration.

use std::fmt;
use std::time::Duration;

use crate::cluster::pool::{PoolConfig, DEFAULT_TIMEOUT};
use crate::cluster::registry::AddressTranslator;
use crate::cluster::NodeKey;
use crate::error::{Error, Result};

/// Default number of attempts per dispatched call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// What happens to pools of nodes that drop out of the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StalePoolPolicy {
    /// Close them right after the new snapshot is installed.
    Immediate,
    /// Remember them and close them at the next client `reset()` or `close()`.
    #[default]
    Deferred,
}

/// Settings for a [`ClusterClient`](crate::ClusterClient).
///
/// Usually built through [`ClusterClientBuilder`](crate::ClusterClientBuilder).
#[derive(Clone)]
pub struct ClusterConfig {
    /// Nodes used for the initial discovery and as refresh fallbacks.
    pub seeds: Vec<NodeKey>,
    /// Attempts per call, counting the first one. At least 1.
    pub max_attempts: u32,
    /// Wall-clock budget for one call including retries and backoff.
    pub max_total_retry_duration: Duration,
    /// Route read-only operations to a random replica of the slot.
    pub read_from_replicas: bool,
    /// Rewrites addresses reported by the cluster.
    pub address_translator: Option<AddressTranslator>,
    /// MOVED replies tolerated before a full topology refresh. At least 1.
    pub moved_refresh_threshold: u32,
    /// Handling of pools for nodes no longer in the topology.
    pub stale_pool_policy: StalePoolPolicy,
    /// Period of the background topology refresh, if any.
    pub topology_refresh_period: Option<Duration>,
    /// Reject `CLUSTER SLOTS` replies that leave slots unassigned.
    pub require_full_coverage: bool,
    /// Per-node pool settings.
    pub pool: PoolConfig,
}

impl ClusterConfig {
    /// Checks value constraints.
    ///
    /// An empty seed list is not a validation failure; it is reported by the
    /// initial discovery as `Error::TopologyUnavailable`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` describing the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::validation("max_attempts must be at least 1"));
        }
        if self.moved_refresh_threshold == 0 {
            return Err(Error::validation("moved_refresh_threshold must be at least 1"));
        }
        if self.pool.max_connections_per_node == 0 {
            return Err(Error::validation("max_connections_per_node must be at least 1"));
        }
        if self.topology_refresh_period == Some(Duration::ZERO) {
            return Err(Error::validation("topology_refresh_period must be non-zero"));
        }
        Ok(())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_total_retry_duration: DEFAULT_TIMEOUT * DEFAULT_MAX_ATTEMPTS,
            read_from_replicas: false,
            address_translator: None,
            moved_refresh_threshold: 1,
            stale_pool_policy: StalePoolPolicy::default(),
            topology_refresh_period: None,
            require_full_coverage: true,
            pool: PoolConfig::default(),
        }
    }
}

impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("seeds", &self.seeds)
            .field("max_attempts", &self.max_attempts)
            .field("max_total_retry_duration", &self.max_total_retry_duration)
            .field("read_from_replicas", &self.read_from_replicas)
            .field("address_translator", &self.address_translator.is_some())
            .field("moved_refresh_threshold", &self.moved_refresh_threshold)
            .field("stale_pool_policy", &self.stale_pool_policy)
            .field("topology_refresh_period", &self.topology_refresh_period)
            .field("require_full_coverage", &self.require_full_coverage)
            .field("pool", &self.pool)
            .finish()
    }
}
