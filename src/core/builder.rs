use std::sync::Arc;
use std::time::Duration;

use crate::cluster::{
    AddressTranslator, ClusterClient, ClusterConfig, NodeKey, PoolFactory, StalePoolPolicy,
    TcpPoolFactory,
};
use crate::error::Result;

/// Builder for configuring and creating a [`ClusterClient`].
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use slotmux::ClusterClientBuilder;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ClusterClientBuilder::new()
///     .seeds("127.0.0.1:7000,127.0.0.1:7001")
///     .max_attempts(5)
///     .read_from_replicas(true)
///     .topology_refresh_period(Duration::from_secs(30))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ClusterClientBuilder {
    seeds: Vec<String>,
    config: ClusterConfig,
    pool_factory: Option<Arc<dyn PoolFactory>>,
}

impl ClusterClientBuilder {
    /// Creates a new [`ClusterClientBuilder`] instance.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds seed nodes from a comma-separated address list.
    ///
    /// # Arguments
    ///
    /// * `addresses` - e.g. `"redis://10.0.0.1:7000,10.0.0.2:7000"`
    #[inline]
    pub fn seeds(mut self, addresses: impl Into<String>) -> Self {
        self.seeds.push(addresses.into());
        self
    }

    /// Adds one seed node.
    #[inline]
    pub fn seed(mut self, node: NodeKey) -> Self {
        self.config.seeds.push(node);
        self
    }

    /// Sets the number of attempts per call, counting the first.
    ///
    /// # Arguments
    ///
    /// * `attempts` - At least 1 (default: 5)
    #[inline]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Sets the wall-clock budget of one call, retries and backoff included.
    #[inline]
    pub fn max_total_retry_duration(mut self, duration: Duration) -> Self {
        self.config.max_total_retry_duration = duration;
        self
    }

    /// Sends read-only operations to replicas.
    #[inline]
    pub fn read_from_replicas(mut self, enabled: bool) -> Self {
        self.config.read_from_replicas = enabled;
        self
    }

    /// Installs an address translator for nodes reported by the cluster.
    ///
    /// # Arguments
    ///
    /// * `translate` - Returns the routable address, or `None` to keep the reported one
    #[inline]
    pub fn address_translator<F>(mut self, translate: F) -> Self
    where
        F: Fn(&NodeKey) -> Option<NodeKey> + Send + Sync + 'static,
    {
        let translator: AddressTranslator = Arc::new(translate);
        self.config.address_translator = Some(translator);
        self
    }

    /// Sets how many MOVED replies trigger a full topology refresh.
    #[inline]
    pub fn moved_refresh_threshold(mut self, threshold: u32) -> Self {
        self.config.moved_refresh_threshold = threshold;
        self
    }

    /// Sets what happens to pools of nodes that leave the topology.
    #[inline]
    pub fn stale_pool_policy(mut self, policy: StalePoolPolicy) -> Self {
        self.config.stale_pool_policy = policy;
        self
    }

    /// Refreshes the topology in the background every `period`.
    #[inline]
    pub fn topology_refresh_period(mut self, period: Duration) -> Self {
        self.config.topology_refresh_period = Some(period);
        self
    }

    /// Accepts or rejects topologies that leave slots unassigned.
    #[inline]
    pub fn require_full_coverage(mut self, required: bool) -> Self {
        self.config.require_full_coverage = required;
        self
    }

    /// Sets the maximum number of connections per node.
    #[inline]
    pub fn max_connections_per_node(mut self, max: usize) -> Self {
        self.config.pool.max_connections_per_node = max;
        self
    }

    /// Sets the connection timeout.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to wait for connection establishment
    #[inline]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.connection_timeout = timeout;
        self
    }

    /// Sets the read timeout for commands.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to wait for a response. `None` means no timeout.
    #[inline]
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.pool.read_timeout = timeout;
        self
    }

    /// Sets the write timeout for commands.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to wait for writes. `None` means no timeout.
    #[inline]
    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.pool.write_timeout = timeout;
        self
    }

    /// Sets how long a call waits for a pooled connection.
    #[inline]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.pool.acquire_timeout = timeout;
        self
    }

    /// Replaces the default TCP pools.
    #[inline]
    pub fn pool_factory(mut self, factory: Arc<dyn PoolFactory>) -> Self {
        self.pool_factory = Some(factory);
        self
    }

    fn into_parts(mut self) -> Result<(ClusterConfig, Arc<dyn PoolFactory>)> {
        for list in &self.seeds {
            for node in ClusterClient::parse_addresses(list)? {
                if !self.config.seeds.contains(&node) {
                    self.config.seeds.push(node);
                }
            }
        }
        let factory = match self.pool_factory {
            Some(factory) => factory,
            None => Arc::new(TcpPoolFactory::new(
                self.config.pool.clone(),
                self.config.read_from_replicas,
            )),
        };
        Ok((self.config, factory))
    }

    /// Builds the [`ClusterClient`] and runs the initial discovery.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`](crate::Error::Validation) for a bad
    /// address or setting, and
    /// [`Error::TopologyUnavailable`](crate::Error::TopologyUnavailable) when
    /// no seed is given or none answers.
    #[inline]
    pub async fn build(self) -> Result<ClusterClient> {
        let (config, factory) = self.into_parts()?;
        ClusterClient::from_config(config, factory).await
    }
}
