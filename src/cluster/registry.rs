//! Per-node pool registry.
//!
//! Maps each [`NodeKey`] to the single [`Pool`] shared by every slot that
//! points at that node. Pools are created lazily on first reference and live
//! until explicitly evicted, so topology refreshes do not churn connections.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::cluster::pool::{Pool, PoolFactory};
use crate::cluster::NodeKey;
use crate::error::{Error, Result};

/// Rewrites addresses reported by the cluster into routable ones.
///
/// Returning `None` keeps the reported address.
pub type AddressTranslator = Arc<dyn Fn(&NodeKey) -> Option<NodeKey> + Send + Sync>;

/// Registry of connection pools keyed by node.
pub struct NodeRegistry {
    factory: Arc<dyn PoolFactory>,
    translator: Option<AddressTranslator>,
    pools: RwLock<HashMap<NodeKey, Arc<dyn Pool>>>,
    closed: AtomicBool,
}

impl NodeRegistry {
    /// Creates an empty registry.
    ///
    /// # Arguments
    ///
    /// * `factory` - Builds a pool the first time a node is referenced
    /// * `translator` - Optional address rewrite applied by [`translate`](Self::translate)
    pub fn new(factory: Arc<dyn PoolFactory>, translator: Option<AddressTranslator>) -> Self {
        Self {
            factory,
            translator,
            pools: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Normalizes an address reported by the cluster and applies the translator.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the address cannot be parsed.
    pub fn translate(&self, raw: &str) -> Result<NodeKey> {
        let key = NodeKey::parse(raw)?;
        Ok(self.translate_key(key))
    }

    /// Applies the translator to an already normalized key.
    pub fn translate_key(&self, key: NodeKey) -> NodeKey {
        match &self.translator {
            Some(translate) => match translate(&key) {
                Some(mapped) => {
                    debug!(from = %key, to = %mapped, "translated node address");
                    mapped
                }
                None => key,
            },
            None => key,
        }
    }

    /// Returns the pool for `node`, creating it on first use.
    ///
    /// Concurrent first references build at most one pool; every caller gets
    /// the same instance.
    ///
    /// # Errors
    ///
    /// `Error::PoolClosed` once [`close_all`](Self::close_all) has run. No pool
    /// is created then.
    pub fn pool_for(&self, node: &NodeKey) -> Result<Arc<dyn Pool>> {
        if let Some(pool) = self.pools.read().get(node) {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write();
        if self.is_closed() {
            return Err(Error::PoolClosed { node: node.clone() });
        }
        Ok(pools
            .entry(node.clone())
            .or_insert_with(|| {
                debug!(node = %node, "creating connection pool");
                self.factory.create_pool(node)
            })
            .clone())
    }

    /// Returns true once [`close_all`](Self::close_all) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the pool for `node` if one exists.
    pub fn get(&self, node: &NodeKey) -> Option<Arc<dyn Pool>> {
        self.pools.read().get(node).cloned()
    }

    /// Returns true if a pool exists for `node`.
    pub fn contains(&self, node: &NodeKey) -> bool {
        self.pools.read().contains_key(node)
    }

    /// Number of registered pools.
    pub fn len(&self) -> usize {
        self.pools.read().len()
    }

    /// Returns true if no pool is registered.
    pub fn is_empty(&self) -> bool {
        self.pools.read().is_empty()
    }

    /// Keys of every registered pool.
    pub fn keys(&self) -> Vec<NodeKey> {
        self.pools.read().keys().cloned().collect()
    }

    /// Snapshot of every registered pool.
    pub fn nodes(&self) -> HashMap<NodeKey, Arc<dyn Pool>> {
        self.pools.read().clone()
    }

    /// Removes and closes the pool for `node`.
    ///
    /// # Returns
    ///
    /// true if a pool was registered
    pub fn evict(&self, node: &NodeKey) -> bool {
        let removed = self.pools.write().remove(node);
        match removed {
            Some(pool) => {
                pool.close();
                info!(node = %node, "evicted connection pool");
                true
            }
            None => false,
        }
    }

    /// Evicts every pool whose node is not in `keep`.
    ///
    /// # Returns
    ///
    /// The evicted keys.
    pub fn retain_only(&self, keep: &HashSet<NodeKey>) -> Vec<NodeKey> {
        let evicted: Vec<(NodeKey, Arc<dyn Pool>)> = {
            let mut pools = self.pools.write();
            let stale: Vec<NodeKey> = pools.keys().filter(|k| !keep.contains(*k)).cloned().collect();
            stale
                .into_iter()
                .filter_map(|k| pools.remove(&k).map(|pool| (k, pool)))
                .collect()
        };

        evicted
            .into_iter()
            .map(|(node, pool)| {
                pool.close();
                info!(node = %node, "evicted connection pool");
                node
            })
            .collect()
    }

    /// Closes and removes every pool. The registry stays closed: later
    /// [`pool_for`](Self::pool_for) calls fail.
    pub fn close_all(&self) {
        let pools: Vec<(NodeKey, Arc<dyn Pool>)> = {
            let mut pools = self.pools.write();
            self.closed.store(true, Ordering::Release);
            pools.drain().collect()
        };
        for (node, pool) in pools {
            pool.close();
            debug!(node = %node, "closed connection pool");
        }
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &self.keys())
            .field("translator", &self.translator.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}
