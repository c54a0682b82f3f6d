//! Cluster topology: the slot map and the live snapshot holding it.
//!
//! A [`SlotMap`] is an immutable slot → node table built from one
//! `CLUSTER SLOTS` reply. [`SlotTopology`] keeps the current map behind an
//! `Arc` and replaces it wholesale on every discovery, so readers always see
//! one complete map. MOVED redirects patch a single slot by copy-on-write.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::cluster::commands::cluster_slots;
use crate::cluster::config::{ClusterConfig, StalePoolPolicy};
use crate::cluster::node::{Node, NodeId, NodeKey, Role};
use crate::cluster::pool::Pool;
use crate::cluster::registry::NodeRegistry;
use crate::cluster::slot::SLOT_COUNT;
use crate::core::command::parse_frame_response;
use crate::core::connection::Connection;
use crate::error::{Error, Result};
use crate::proto::Frame;

pub(crate) const NO_SEEDS: &str = "No nodes to initialize cluster slots cache.";
pub(crate) const DISCOVERY_FAILED: &str = "Could not initialize cluster slots cache.";
pub(crate) const REFRESH_FAILED: &str = "Could not refresh cluster slots cache.";
pub(crate) const CLIENT_CLOSED: &str = "Cluster client is closed.";
const SLOTS_EMPTY: &str = "Cluster slots list is empty.";
const SLOTS_HOLES: &str = "Cluster slots have holes.";

/// A node entry exactly as reported by `CLUSTER SLOTS`, before translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedNode {
    /// Host as reported.
    pub host: String,
    /// Port as reported.
    pub port: u16,
    /// Node id, when the server sent one.
    pub id: Option<String>,
}

/// A range of hash slots and the nodes serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRange {
    /// Start of the slot range (inclusive)
    pub start: u16,
    /// End of the slot range (inclusive)
    pub end: u16,
    /// Primary node serving this slot range
    pub primary: ReportedNode,
    /// Replica nodes for this slot range
    pub replicas: Vec<ReportedNode>,
}

impl SlotRange {
    /// Returns true if the given slot is within this range.
    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Returns the number of slots in this range.
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Always false; ranges hold at least one slot.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Parses a `CLUSTER SLOTS` reply into slot ranges.
///
/// Ranges whose node list is empty are skipped. Node entries are
/// `[host, port, id?, ...]`; extra trailing fields are ignored.
///
/// # Errors
///
/// Returns `Error::Protocol` if the frame is not an array, a range is
/// malformed, or a slot lies outside 0..16384.
pub fn parse_cluster_slots(frame: &Frame) -> Result<Vec<SlotRange>> {
    let ranges = frame
        .as_array()
        .ok_or_else(|| Error::protocol("CLUSTER SLOTS response must be an array"))?;

    let mut parsed = Vec::with_capacity(ranges.len());
    for range in ranges {
        let items = range
            .as_array()
            .ok_or_else(|| Error::protocol("CLUSTER SLOTS entry must be an array"))?;
        if items.len() < 2 {
            return Err(Error::protocol("CLUSTER SLOTS entry is missing its slot bounds"));
        }

        let start = parse_slot(&items[0])?;
        let end = parse_slot(&items[1])?;
        if start > end {
            return Err(Error::protocol(format!(
                "CLUSTER SLOTS range {start}-{end} is inverted"
            )));
        }

        let mut nodes = items[2..].iter().map(parse_node);
        let Some(primary) = nodes.next().transpose()? else {
            continue;
        };
        let replicas = nodes.collect::<Result<Vec<_>>>()?;

        parsed.push(SlotRange {
            start,
            end,
            primary,
            replicas,
        });
    }

    Ok(parsed)
}

fn parse_slot(frame: &Frame) -> Result<u16> {
    frame
        .as_integer()
        .and_then(|n| u16::try_from(n).ok())
        .filter(|slot| *slot < SLOT_COUNT)
        .ok_or_else(|| Error::protocol(format!("invalid slot number: {}", frame.describe())))
}

fn parse_node(frame: &Frame) -> Result<ReportedNode> {
    let items = frame
        .as_array()
        .ok_or_else(|| Error::protocol("Node info must be an array"))?;
    if items.len() < 2 {
        return Err(Error::protocol(
            "Node info array must have at least 2 elements",
        ));
    }

    let host = items[0]
        .as_bytes()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .ok_or_else(|| Error::protocol("Node host must be a string"))?;
    let port = items[1]
        .as_integer()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| Error::protocol("Node port must be an integer"))?;
    let id = items
        .get(2)
        .and_then(Frame::as_bytes)
        .map(|b| String::from_utf8_lossy(b).into_owned());

    Ok(ReportedNode { host, port, id })
}

/// Immutable slot → node table.
#[derive(Clone)]
pub struct SlotMap {
    primaries: Vec<Option<NodeKey>>,
    replicas: Option<Vec<Option<Arc<[NodeKey]>>>>,
    nodes: HashMap<NodeKey, Node>,
}

impl SlotMap {
    /// Builds a map from parsed ranges.
    ///
    /// # Arguments
    ///
    /// * `ranges` - Output of [`parse_cluster_slots`]
    /// * `translate` - Maps a reported node to its routable key
    /// * `with_replicas` - Keep per-slot replica lists
    /// * `require_full_coverage` - Reject replies that do not assign every slot
    ///   exactly once
    ///
    /// # Errors
    ///
    /// `Error::InvalidTopology` on a coverage violation, or whatever
    /// `translate` returns.
    pub fn build<F>(
        ranges: &[SlotRange],
        translate: F,
        with_replicas: bool,
        require_full_coverage: bool,
    ) -> Result<Self>
    where
        F: Fn(&ReportedNode) -> Result<NodeKey>,
    {
        if require_full_coverage {
            check_coverage(ranges)?;
        }

        let mut map = SlotMap {
            primaries: vec![None; usize::from(SLOT_COUNT)],
            replicas: with_replicas.then(|| vec![None; usize::from(SLOT_COUNT)]),
            nodes: HashMap::new(),
        };

        for range in ranges {
            let primary = translate(&range.primary)?;
            map.add_node(&primary, Role::Primary, range.primary.id.as_deref());

            let mut replica_keys = Vec::with_capacity(range.replicas.len());
            for replica in &range.replicas {
                let key = translate(replica)?;
                map.add_node(&key, Role::Replica, replica.id.as_deref());
                replica_keys.push(key);
            }
            let replica_keys: Option<Arc<[NodeKey]>> =
                (!replica_keys.is_empty()).then(|| replica_keys.into());

            for slot in range.start..=range.end {
                let slot = usize::from(slot);
                map.primaries[slot] = Some(primary.clone());
                if let Some(replicas) = map.replicas.as_mut() {
                    replicas[slot] = replica_keys.clone();
                }
            }
        }

        Ok(map)
    }

    fn add_node(&mut self, key: &NodeKey, role: Role, id: Option<&str>) {
        let id = NodeId::new(id.filter(|id| !id.is_empty()).unwrap_or(key.as_str()));
        match self.nodes.get_mut(key) {
            Some(existing) => {
                if role == Role::Primary {
                    existing.role = Role::Primary;
                }
            }
            None => {
                self.nodes.insert(
                    key.clone(),
                    Node {
                        key: key.clone(),
                        role,
                        id,
                    },
                );
            }
        }
    }

    /// Primary owning `slot`.
    pub fn primary(&self, slot: u16) -> Option<&NodeKey> {
        self.primaries.get(usize::from(slot))?.as_ref()
    }

    /// Replicas of `slot`; `None` when there are none or replica tracking is off.
    pub fn replicas(&self, slot: u16) -> Option<&[NodeKey]> {
        self.replicas
            .as_ref()?
            .get(usize::from(slot))?
            .as_deref()
    }

    /// Every node in the map, primaries and replicas.
    pub fn nodes(&self) -> &HashMap<NodeKey, Node> {
        &self.nodes
    }

    /// Nodes currently owning at least one slot.
    pub fn primary_nodes(&self) -> HashMap<NodeKey, Node> {
        let owners: HashSet<&NodeKey> = self.primaries.iter().flatten().collect();
        owners
            .into_iter()
            .filter_map(|key| self.nodes.get(key).map(|node| (key.clone(), node.clone())))
            .collect()
    }

    /// Keys of every node in the map.
    pub fn node_keys(&self) -> HashSet<NodeKey> {
        self.nodes.keys().cloned().collect()
    }

    /// Returns true if every slot has a primary.
    pub fn is_fully_covered(&self) -> bool {
        self.primaries.iter().all(Option::is_some)
    }

    /// A copy with `slot` reassigned to `node`. The slot's replica list is
    /// dropped since it belonged to the previous owner.
    fn with_primary(&self, slot: u16, node: NodeKey) -> SlotMap {
        let mut patched = self.clone();
        let idx = usize::from(slot);
        patched.add_node(&node, Role::Primary, None);
        patched.primaries[idx] = Some(node);
        if let Some(replicas) = patched.replicas.as_mut() {
            replicas[idx] = None;
        }
        patched
    }
}

impl fmt::Debug for SlotMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotMap")
            .field("nodes", &self.nodes.len())
            .field("fully_covered", &self.is_fully_covered())
            .field("replicas", &self.replicas.is_some())
            .finish()
    }
}

fn check_coverage(ranges: &[SlotRange]) -> Result<()> {
    if ranges.is_empty() {
        return Err(Error::InvalidTopology {
            message: SLOTS_EMPTY.to_string(),
        });
    }

    let mut covered = vec![false; usize::from(SLOT_COUNT)];
    for range in ranges {
        for slot in range.start..=range.end {
            let seen = &mut covered[usize::from(slot)];
            if *seen {
                return Err(Error::InvalidTopology {
                    message: SLOTS_HOLES.to_string(),
                });
            }
            *seen = true;
        }
    }

    if covered.iter().all(|c| *c) {
        Ok(())
    } else {
        Err(Error::InvalidTopology {
            message: SLOTS_HOLES.to_string(),
        })
    }
}

/// Live slot topology shared by every call of one client.
pub struct SlotTopology {
    registry: Arc<NodeRegistry>,
    read_from_replicas: bool,
    require_full_coverage: bool,
    stale_pool_policy: StalePoolPolicy,
    snapshot: RwLock<Option<Arc<SlotMap>>>,
    stale: Mutex<HashSet<NodeKey>>,
    refresh_lock: tokio::sync::Mutex<()>,
    moved_since_refresh: AtomicU32,
}

impl SlotTopology {
    /// Creates an empty topology. Lookups fail until the first discovery.
    pub fn new(registry: Arc<NodeRegistry>, config: &ClusterConfig) -> Self {
        Self {
            registry,
            read_from_replicas: config.read_from_replicas,
            require_full_coverage: config.require_full_coverage,
            stale_pool_policy: config.stale_pool_policy,
            snapshot: RwLock::new(None),
            stale: Mutex::new(HashSet::new()),
            refresh_lock: tokio::sync::Mutex::new(()),
            moved_since_refresh: AtomicU32::new(0),
        }
    }

    /// The live map, if any.
    pub fn current(&self) -> Option<Arc<SlotMap>> {
        self.snapshot.read().clone()
    }

    /// The live map.
    ///
    /// # Errors
    ///
    /// `Error::TopologyUnavailable` before discovery or after `reset`.
    pub fn snapshot(&self) -> Result<Arc<SlotMap>> {
        self.current().ok_or_else(|| Error::TopologyUnavailable {
            message: "Cluster slots cache is empty.".to_string(),
            suppressed: Vec::new(),
        })
    }

    /// Discovers the topology through the first seed that answers.
    ///
    /// # Errors
    ///
    /// `Error::TopologyUnavailable` with no suppressed causes for an empty seed
    /// list, or with one cause per seed when all of them fail.
    pub async fn discover(&self, seeds: &[NodeKey]) -> Result<()> {
        self.ensure_open()?;
        if seeds.is_empty() {
            return Err(Error::TopologyUnavailable {
                message: NO_SEEDS.to_string(),
                suppressed: Vec::new(),
            });
        }

        let mut suppressed = Vec::with_capacity(seeds.len());
        for seed in seeds {
            info!(seed = %seed, "discovering cluster topology");
            match self.discover_via(seed).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(seed = %seed, error = %e, "cluster discovery failed");
                    suppressed.push(e);
                }
            }
        }

        Err(Error::TopologyUnavailable {
            message: DISCOVERY_FAILED.to_string(),
            suppressed,
        })
    }

    /// Runs `CLUSTER SLOTS` on `conn` and installs the resulting map.
    ///
    /// # Errors
    ///
    /// Connection errors from `conn`, `Error::Protocol` for a malformed reply
    /// or `Error::InvalidTopology` for a coverage violation. The live map is
    /// left untouched on error.
    pub async fn discover_from(&self, conn: &mut dyn Connection) -> Result<()> {
        self.ensure_open()?;
        let reply = conn.send_command(&cluster_slots().into_frame()).await?;
        let reply = parse_frame_response(reply)?;
        let ranges = parse_cluster_slots(&reply)?;
        let map = SlotMap::build(
            &ranges,
            |reported| {
                let key = NodeKey::from_host_port(&reported.host, reported.port)?;
                Ok(self.registry.translate_key(key))
            },
            self.read_from_replicas,
            self.require_full_coverage,
        )?;

        debug!(
            from = %conn.address(),
            ranges = ranges.len(),
            nodes = map.nodes().len(),
            "installing cluster topology"
        );
        self.install(map)
    }

    async fn discover_via(&self, node: &NodeKey) -> Result<()> {
        self.ensure_open()?;
        let pool = self.registry.pool_for(node)?;
        let mut conn = pool.acquire().await?;
        let result = self.discover_from(conn.as_mut()).await;
        match &result {
            Err(e) if e.is_connection_error() => pool.discard(conn),
            _ => pool.release(conn),
        }
        result
    }

    /// Rediscovers the topology unless another refresh is already running.
    ///
    /// Candidates are tried in order: `preferred`, the seeds, then every other
    /// known node in random order.
    ///
    /// # Returns
    ///
    /// `Ok(true)` after installing a new map, `Ok(false)` if a concurrent
    /// refresh was in progress.
    ///
    /// # Errors
    ///
    /// `Error::TopologyUnavailable` carrying one cause per candidate when none
    /// answered. The previous map stays live. Once the registry is closed the
    /// error is "Cluster client is closed." and no node is contacted.
    pub async fn refresh(&self, preferred: Option<&NodeKey>, seeds: &[NodeKey]) -> Result<bool> {
        self.ensure_open()?;
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            debug!("topology refresh already in progress");
            return Ok(false);
        };

        let mut known: Vec<NodeKey> = self
            .current()
            .map(|map| map.nodes().keys().cloned().collect())
            .unwrap_or_default();
        known.shuffle(&mut rand::rng());

        let mut candidates: Vec<NodeKey> = Vec::with_capacity(seeds.len() + known.len() + 1);
        for key in preferred.into_iter().chain(seeds).chain(&known) {
            if !candidates.contains(key) {
                candidates.push(key.clone());
            }
        }

        let mut suppressed = Vec::new();
        for node in &candidates {
            self.ensure_open()?;
            match self.discover_via(node).await {
                Ok(()) => {
                    info!(node = %node, "refreshed cluster topology");
                    return Ok(true);
                }
                Err(e) => {
                    debug!(node = %node, error = %e, "topology refresh attempt failed");
                    suppressed.push(e);
                }
            }
        }

        Err(Error::TopologyUnavailable {
            message: REFRESH_FAILED.to_string(),
            suppressed,
        })
    }

    /// Resolves the node serving `slot`.
    ///
    /// With `prefer_replica` and replicas known for the slot, a uniformly
    /// random replica is returned instead of the primary.
    ///
    /// # Errors
    ///
    /// - `Error::Validation` for a slot outside 0..16384
    /// - `Error::TopologyUnavailable` when no map is live
    /// - `Error::SlotNotCovered` when the live map has no owner for the slot
    pub fn resolve(&self, slot: u16, prefer_replica: bool) -> Result<NodeKey> {
        if slot >= SLOT_COUNT {
            return Err(Error::validation(format!("slot {slot} is out of range")));
        }
        let map = self.snapshot()?;
        if prefer_replica {
            if let Some(replicas) = map.replicas(slot) {
                let idx = rand::random_range(0..replicas.len());
                return Ok(replicas[idx].clone());
            }
        }
        map.primary(slot)
            .cloned()
            .ok_or(Error::SlotNotCovered { slot })
    }

    /// Replicas of `slot`, or `None` when there are none.
    pub fn replicas(&self, slot: u16) -> Option<Vec<NodeKey>> {
        self.current()?.replicas(slot).map(<[NodeKey]>::to_vec)
    }

    /// Pools of the replicas of `slot`, or `None` when there are none.
    pub fn replica_pools(&self, slot: u16) -> Option<Vec<Arc<dyn Pool>>> {
        let replicas = self.replicas(slot)?;
        replicas
            .iter()
            .map(|key| self.registry.pool_for(key))
            .collect::<Result<Vec<_>>>()
            .ok()
    }

    /// Every node of the live map.
    pub fn nodes(&self) -> HashMap<NodeKey, Node> {
        self.current()
            .map(|map| map.nodes().clone())
            .unwrap_or_default()
    }

    /// Primaries of the live map.
    pub fn primary_nodes(&self) -> HashMap<NodeKey, Node> {
        self.current()
            .map(|map| map.primary_nodes())
            .unwrap_or_default()
    }

    /// Returns true if a map is live and assigns every slot.
    pub fn is_fully_covered(&self) -> bool {
        self.current().is_some_and(|map| map.is_fully_covered())
    }

    /// Reassigns one slot after a MOVED redirect.
    ///
    /// Does nothing when no map is live, the slot already points at `node`, or
    /// the registry is closed.
    pub fn assign_slot(&self, slot: u16, node: NodeKey) {
        if slot >= SLOT_COUNT {
            return;
        }
        let guard = self.snapshot.upgradable_read();
        let Some(current) = guard.as_ref() else {
            return;
        };
        if current.primary(slot) == Some(&node) {
            return;
        }

        let patched = current.with_primary(slot, node.clone());
        let referenced = patched.node_keys();
        // Holding the upgradable guard keeps `reset` out until the swap is done.
        if self.registry.pool_for(&node).is_err() {
            return;
        }
        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
        *guard = Some(Arc::new(patched));
        drop(guard);

        debug!(slot, node = %node, "patched slot owner");
        self.collect_stale(&referenced);
    }

    /// Counts a MOVED redirect and returns the count since the last refresh.
    pub fn note_moved(&self) -> u32 {
        self.moved_since_refresh.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops the live map. Pools are not touched.
    pub fn reset(&self) {
        *self.snapshot.write() = None;
        self.moved_since_refresh.store(0, Ordering::Release);
        info!("cluster topology reset");
    }

    /// Removes and returns the nodes marked stale under the deferred policy.
    pub fn take_stale(&self) -> Vec<NodeKey> {
        self.stale.lock().drain().collect()
    }

    fn install(&self, map: SlotMap) -> Result<()> {
        let referenced = map.node_keys();
        {
            let mut snapshot = self.snapshot.write();
            self.ensure_open()?;
            for key in &referenced {
                self.registry.pool_for(key).map_err(|_| closed())?;
            }
            *snapshot = Some(Arc::new(map));
        }
        self.moved_since_refresh.store(0, Ordering::Release);
        self.collect_stale(&referenced);
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.registry.is_closed() {
            return Err(closed());
        }
        Ok(())
    }

    fn collect_stale(&self, referenced: &HashSet<NodeKey>) {
        match self.stale_pool_policy {
            StalePoolPolicy::Immediate => {
                self.registry.retain_only(referenced);
            }
            StalePoolPolicy::Deferred => {
                let mut stale = self.stale.lock();
                stale.retain(|key| !referenced.contains(key));
                for key in self.registry.keys() {
                    if !referenced.contains(&key) && stale.insert(key.clone()) {
                        debug!(node = %key, "node no longer in topology");
                    }
                }
            }
        }
    }
}

pub(crate) fn closed() -> Error {
    Error::TopologyUnavailable {
        message: CLIENT_CLOSED.to_string(),
        suppressed: Vec::new(),
    }
}

impl fmt::Debug for SlotTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTopology")
            .field("snapshot", &self.current())
            .field("read_from_replicas", &self.read_from_replicas)
            .field("stale_pool_policy", &self.stale_pool_policy)
            .finish()
    }
}
