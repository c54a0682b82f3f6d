//! Redis Cluster client implementation.
//!
//! [`ClusterClient`] owns everything one logical connection to a cluster
//! needs: the configuration, the per-node pool registry, the slot topology,
//! the dispatcher and the optional periodic refresh task. Clones share that
//! state.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cluster::config::{ClusterConfig, StalePoolPolicy};
use crate::cluster::dispatcher::{Dispatcher, Route};
use crate::cluster::node::{Node, NodeKey};
use crate::cluster::pool::PoolFactory;
use crate::cluster::registry::NodeRegistry;
use crate::cluster::slot::{group_by_hash_slot, group_by_key_value_hash_slot};
use crate::cluster::topology::{self, SlotTopology};
use crate::core::builder::ClusterClientBuilder;
use crate::core::command::{self, expect_ok, frame_to_bool, frame_to_bytes, frame_to_int, frame_to_vec_bytes, Operation};
use crate::core::connection::Connection;
use crate::error::{Error, Result};

/// Redis Cluster client.
///
/// Routes every call to the node owning its slot and handles MOVED and ASK
/// redirects, connection failures and topology changes transparently.
///
/// # Example
///
/// ```no_run
/// # async fn example() -> slotmux::Result<()> {
/// use slotmux::ClusterClient;
/// use bytes::Bytes;
///
/// // Connect to Redis Cluster (comma-separated seed nodes)
/// let client = ClusterClient::connect("127.0.0.1:7000,127.0.0.1:7001").await?;
///
/// // Commands are automatically routed to correct node
/// client.set("key", Bytes::from("value")).await?;
/// let value = client.get("key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ClusterClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClusterConfig,
    registry: Arc<NodeRegistry>,
    topology: Arc<SlotTopology>,
    dispatcher: Dispatcher,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.get_mut().take() {
            task.abort();
        }
    }
}

/// A key remembering its position in the caller's input.
struct IndexedKey {
    index: usize,
    key: Bytes,
}

impl AsRef<[u8]> for IndexedKey {
    fn as_ref(&self) -> &[u8] {
        &self.key
    }
}

impl ClusterClient {
    /// Connects to a Redis Cluster using seed nodes.
    ///
    /// The address can be a single node or a comma-separated list of nodes.
    /// The client will discover the full cluster topology from the seed nodes.
    ///
    /// # Arguments
    ///
    /// * `addresses` - Seed node addresses (e.g., "redis://127.0.0.1:7000,127.0.0.1:7001")
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - An address cannot be parsed
    /// - No seed is given, or none of them answers (`Error::TopologyUnavailable`)
    pub async fn connect(addresses: &str) -> Result<Self> {
        Self::builder().seeds(addresses).build().await
    }

    /// Returns a builder for a client with custom settings.
    pub fn builder() -> ClusterClientBuilder {
        ClusterClientBuilder::new()
    }

    /// Creates a client from a complete configuration and pool factory.
    ///
    /// Validates `config`, runs the initial discovery against its seeds and
    /// starts the periodic refresh task when one is configured.
    ///
    /// # Errors
    ///
    /// - `Error::Validation` for an invalid configuration
    /// - `Error::TopologyUnavailable` when the seed list is empty or every
    ///   seed fails
    pub async fn from_config(config: ClusterConfig, factory: Arc<dyn PoolFactory>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(NodeRegistry::new(factory, config.address_translator.clone()));
        let topology = Arc::new(SlotTopology::new(registry.clone(), &config));
        topology.discover(&config.seeds).await?;
        let dispatcher = Dispatcher::new(topology.clone(), registry.clone(), &config);

        let refresh_task = config
            .topology_refresh_period
            .map(|period| spawn_periodic_refresh(topology.clone(), config.seeds.clone(), period));

        info!(
            seeds = config.seeds.len(),
            nodes = topology.nodes().len(),
            "connected to cluster"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                registry,
                topology,
                dispatcher,
                refresh_task: Mutex::new(refresh_task),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Parses a comma-separated list of addresses into node keys.
    ///
    /// Blank entries are skipped, so an empty string gives an empty list.
    pub(crate) fn parse_addresses(addresses: &str) -> Result<Vec<NodeKey>> {
        let mut parsed: Vec<NodeKey> = Vec::new();
        for addr in addresses.split(',') {
            let addr = addr.trim();
            if addr.is_empty() {
                continue;
            }
            let key = NodeKey::parse(addr)?;
            if !parsed.contains(&key) {
                parsed.push(key);
            }
        }
        Ok(parsed)
    }

    /// The configuration this client was built with.
    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Every node in the current topology, primaries and replicas.
    pub fn cluster_nodes(&self) -> HashMap<NodeKey, Node> {
        self.inner.topology.nodes()
    }

    /// Nodes owning at least one slot.
    pub fn primary_nodes(&self) -> HashMap<NodeKey, Node> {
        self.inner.topology.primary_nodes()
    }

    /// Returns the number of known nodes in the cluster.
    pub fn node_count(&self) -> usize {
        self.inner.topology.nodes().len()
    }

    /// Checks if the cluster covers all slots (0-16383).
    pub fn is_fully_covered(&self) -> bool {
        self.inner.topology.is_fully_covered()
    }

    /// Replaces the topology with the one reported by `conn`.
    ///
    /// # Errors
    ///
    /// Errors from `conn`, a malformed reply, or a coverage violation. The
    /// current topology is kept on error.
    pub async fn discover_cluster_nodes_and_slots(&self, conn: &mut dyn Connection) -> Result<()> {
        self.ensure_open()?;
        self.inner.topology.discover_from(conn).await
    }

    /// Rediscovers the topology now.
    ///
    /// # Returns
    ///
    /// `false` when another refresh was already running.
    ///
    /// # Errors
    ///
    /// `Error::TopologyUnavailable` when no node answered.
    pub async fn refresh_topology(&self) -> Result<bool> {
        self.ensure_open()?;
        self.inner
            .topology
            .refresh(None, &self.inner.config.seeds)
            .await
    }

    /// Drops the current topology. The next call rediscovers it.
    ///
    /// Under [`StalePoolPolicy::Deferred`], pools of nodes that dropped out of
    /// earlier topologies are closed here.
    pub fn reset(&self) {
        self.inner.topology.reset();
        if self.inner.config.stale_pool_policy == StalePoolPolicy::Deferred {
            for node in self.inner.topology.take_stale() {
                self.inner.registry.evict(&node);
            }
        }
    }

    /// Stops the refresh task, closes every pool and drops the topology.
    ///
    /// Later calls fail with `Error::TopologyUnavailable`. Calls already in
    /// flight stop at their next attempt, and a refresh still running in the
    /// background can no longer install a map or open a pool.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.inner.refresh_task.lock().take() {
            task.abort();
        }
        // The registry must be closed before the reset so nothing reinstalls a map.
        self.inner.registry.close_all();
        self.inner.topology.reset();
        self.inner.topology.take_stale();
        info!("cluster client closed");
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(topology::closed());
        }
        Ok(())
    }

    /// Runs `op` on the node serving `route`, a key or a slot.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::execute`].
    pub async fn execute<O>(&self, route: impl Into<Route>, op: &O) -> Result<O::Output>
    where
        O: Operation + ?Sized,
    {
        self.ensure_open()?;
        self.inner.dispatcher.execute(route.into(), op).await
    }

    /// Runs `op` on one node chosen round-robin.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::execute_keyless`].
    pub async fn execute_keyless<O>(&self, op: &O) -> Result<O::Output>
    where
        O: Operation + ?Sized,
    {
        self.ensure_open()?;
        self.inner.dispatcher.execute_keyless(op).await
    }

    /// Runs `op` on every primary and returns each reply.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::broadcast`].
    pub async fn broadcast<O>(&self, op: &O) -> Result<HashMap<NodeKey, O::Output>>
    where
        O: Operation + ?Sized,
        O::Output: PartialEq,
    {
        self.ensure_open()?;
        self.inner.dispatcher.broadcast(op).await
    }

    /// Gets a string value from Redis.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to retrieve
    ///
    /// # Returns
    ///
    /// Returns the value if the key exists, or None if the key does not exist.
    pub async fn get(&self, key: impl Into<Bytes>) -> Result<Option<Bytes>> {
        let key = key.into();
        let reply = self.execute(Route::Key(key.clone()), &command::get(key)).await?;
        frame_to_bytes(reply)
    }

    /// Sets a string value in Redis.
    ///
    /// # Arguments
    ///
    /// * `key` - The key to set
    /// * `value` - The value to store
    pub async fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Result<()> {
        let key = key.into();
        let reply = self
            .execute(Route::Key(key.clone()), &command::set(key, value))
            .await?;
        expect_ok(reply)
    }

    /// Sets a string value that expires after `ttl`.
    pub async fn set_with_expiry(
        &self,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        ttl: Duration,
    ) -> Result<()> {
        let key = key.into();
        let reply = self
            .execute(Route::Key(key.clone()), &command::set_with_expiry(key, value, ttl))
            .await?;
        expect_ok(reply)
    }

    /// Deletes a key from Redis.
    ///
    /// # Returns
    ///
    /// Returns 1 if the key was deleted, 0 if the key did not exist.
    pub async fn del(&self, key: impl Into<Bytes>) -> Result<i64> {
        let key = key.into();
        let reply = self.execute(Route::Key(key.clone()), &command::del(key)).await?;
        frame_to_int(reply)
    }

    /// Checks if a key exists in Redis.
    pub async fn exists(&self, key: impl Into<Bytes>) -> Result<bool> {
        let key = key.into();
        let reply = self.execute(Route::Key(key.clone()), &command::exists(key)).await?;
        frame_to_bool(reply)
    }

    /// Gets several keys that may live on different nodes.
    ///
    /// Keys are grouped by slot and one `MGET` runs per group, in slot order.
    /// Values come back in the order of `keys`.
    ///
    /// # Errors
    ///
    /// `Error::Validation` when `keys` is empty, otherwise the first failing
    /// group's error.
    pub async fn mget<K>(&self, keys: impl IntoIterator<Item = K>) -> Result<Vec<Option<Bytes>>>
    where
        K: Into<Bytes>,
    {
        let keys: Vec<IndexedKey> = keys
            .into_iter()
            .enumerate()
            .map(|(index, key)| IndexedKey {
                index,
                key: key.into(),
            })
            .collect();
        if keys.is_empty() {
            return Err(Error::validation("at least one key is required"));
        }

        let mut values = vec![None; keys.len()];
        for (slot, group) in group_by_hash_slot(keys) {
            let cmd = command::mget(group.iter().map(|k| k.key.clone()));
            let reply = frame_to_vec_bytes(self.execute(Route::Slot(slot), &cmd).await?)?;
            if reply.len() != group.len() {
                return Err(Error::Server {
                    message: format!("MGET returned {} values for {} keys", reply.len(), group.len()),
                });
            }
            for (key, value) in group.into_iter().zip(reply) {
                values[key.index] = value;
            }
        }
        Ok(values)
    }

    /// Sets several keys from an alternating `key, value, ...` sequence.
    ///
    /// One `MSET` runs per slot group, in slot order. Groups are not atomic
    /// with respect to each other.
    ///
    /// # Errors
    ///
    /// `Error::Validation` for an empty or odd-length sequence, otherwise the
    /// first failing group's error.
    pub async fn mset<K>(&self, keys_values: impl IntoIterator<Item = K>) -> Result<()>
    where
        K: Into<Bytes>,
    {
        let groups = group_by_key_value_hash_slot(keys_values.into_iter().map(Into::<Bytes>::into))?;
        if groups.is_empty() {
            return Err(Error::validation("at least one key is required"));
        }

        for (slot, pairs) in groups {
            debug!(slot, keys = pairs.len(), "MSET group");
            let reply = self.execute(Route::Slot(slot), &command::mset(pairs)).await?;
            expect_ok(reply)?;
        }
        Ok(())
    }

    /// Pings every primary.
    ///
    /// # Errors
    ///
    /// `Error::Broadcast` naming every node that did not answer `PONG`.
    pub async fn ping_all(&self) -> Result<()> {
        self.broadcast(&command::ping()).await.map(|_| ())
    }
}

fn spawn_periodic_refresh(
    topology: Arc<SlotTopology>,
    seeds: Vec<NodeKey>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match topology.refresh(None, &seeds).await {
                Ok(true) => debug!("periodic topology refresh done"),
                Ok(false) => debug!("periodic topology refresh skipped"),
                Err(e) => warn!(error = %e, "periodic topology refresh failed"),
            }
        }
    })
}

impl fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterClient")
            .field("config", &self.inner.config)
            .field("topology", &self.inner.topology)
            .field("registry", &self.inner.registry)
            .field("closed", &self.is_closed())
            .finish()
    }
}
