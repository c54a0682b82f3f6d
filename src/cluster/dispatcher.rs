//! Redirect-aware command dispatch.
//!
//! [`Dispatcher`] runs an [`Operation`] against the node owning a slot and
//! keeps trying until it succeeds or a budget runs out. Each attempt is
//! classified into an [`AttemptOutcome`]; the retry loop is a match over that
//! outcome.
//!
//! Retry rules:
//!
//! - Connection failures discard the connection. Two in a row trigger a
//!   jittered backoff and a topology refresh (with fewer than 3 attempts, the
//!   refresh happens on the last attempt instead).
//! - `MOVED` patches the slot, may trigger a refresh, and retries on the new
//!   owner. It costs one attempt and no backoff.
//! - `ASK` retries once on the target after `ASKING`, leaving the topology alone.
//! - `TRYAGAIN` / `CLUSTERDOWN` back off and retry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use rand::seq::IndexedRandom;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::cluster::commands::asking;
use crate::cluster::config::ClusterConfig;
use crate::cluster::registry::NodeRegistry;
use crate::cluster::slot::{key_slot, SLOT_COUNT};
use crate::cluster::topology::{self, SlotTopology};
use crate::cluster::NodeKey;
use crate::core::command::{expect_ok, Operation};
use crate::core::connection::Connection;
use crate::error::{Error, Result};

const NO_ATTEMPTS_LEFT: &str = "No more cluster attempts left.";
const DEADLINE_EXCEEDED: &str = "Cluster retry deadline exceeded.";

/// Where a call should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// An explicit slot.
    Slot(u16),
    /// A key whose slot is computed with [`key_slot`].
    Key(Bytes),
}

impl Route {
    /// Routes by key.
    pub fn key(key: impl Into<Bytes>) -> Self {
        Route::Key(key.into())
    }

    /// The target slot.
    pub fn slot(&self) -> u16 {
        match self {
            Route::Slot(slot) => *slot,
            Route::Key(key) => key_slot(key),
        }
    }
}

impl From<u16> for Route {
    fn from(slot: u16) -> Self {
        Route::Slot(slot)
    }
}

impl From<&str> for Route {
    fn from(key: &str) -> Self {
        Route::Key(Bytes::copy_from_slice(key.as_bytes()))
    }
}

impl From<String> for Route {
    fn from(key: String) -> Self {
        Route::Key(Bytes::from(key))
    }
}

impl From<Bytes> for Route {
    fn from(key: Bytes) -> Self {
        Route::Key(key)
    }
}

/// Why a retryable attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Failure {
    Connection,
    Moved { slot: u16, node: NodeKey },
    Ask { node: NodeKey },
    Busy,
}

/// Result of one attempt. The connection has already been released or
/// discarded when this is returned.
#[derive(Debug)]
enum AttemptOutcome<T> {
    Success(T),
    Retry { failure: Failure, cause: Error },
    Fatal(Error),
}

/// How the next node is picked when no redirect is pending.
#[derive(Debug, Clone, Copy)]
enum Targeting {
    Slot { slot: u16, prefer_replica: bool },
    Keyless { any_node: bool },
}

#[derive(Debug, Clone)]
struct Redirect {
    node: NodeKey,
    asking: bool,
}

/// Per-call retry state.
struct AttemptContext {
    attempts_left: u32,
    deadline: Instant,
    consecutive_connection_failures: u32,
    errors: Vec<Error>,
    last_node: Option<NodeKey>,
}

impl AttemptContext {
    fn new(max_attempts: u32, budget: Duration) -> Self {
        Self {
            attempts_left: max_attempts,
            deadline: Instant::now() + budget,
            consecutive_connection_failures: 0,
            errors: Vec::new(),
            last_node: None,
        }
    }

    /// Jittered sleep before the next attempt, or `None` once the deadline
    /// has passed.
    fn backoff(&self) -> Option<Duration> {
        if self.attempts_left == 0 {
            return Some(Duration::ZERO);
        }
        let left = self.deadline.checked_duration_since(Instant::now())?;
        let millis_left = u64::try_from(left.as_millis()).unwrap_or(u64::MAX);
        let ceiling = millis_left / u64::from(self.attempts_left).pow(2);
        Some(Duration::from_millis(rand::random_range(0..=ceiling)))
    }

    fn exhausted(self, message: &str, source: Error) -> Error {
        Error::AttemptsExhausted {
            message: message.to_string(),
            last_node: self.last_node,
            source: Box::new(source),
            suppressed: self.errors,
        }
    }
}

/// Runs operations against the cluster with redirect handling and bounded
/// retries.
pub struct Dispatcher {
    topology: Arc<SlotTopology>,
    registry: Arc<NodeRegistry>,
    seeds: Vec<NodeKey>,
    max_attempts: u32,
    max_total_retry_duration: Duration,
    read_from_replicas: bool,
    moved_refresh_threshold: u32,
    next_keyless: AtomicUsize,
}

impl Dispatcher {
    /// Creates a dispatcher over a shared topology and registry.
    pub fn new(
        topology: Arc<SlotTopology>,
        registry: Arc<NodeRegistry>,
        config: &ClusterConfig,
    ) -> Self {
        Self {
            topology,
            registry,
            seeds: config.seeds.clone(),
            max_attempts: config.max_attempts.max(1),
            max_total_retry_duration: config.max_total_retry_duration,
            read_from_replicas: config.read_from_replicas,
            moved_refresh_threshold: config.moved_refresh_threshold.max(1),
            next_keyless: AtomicUsize::new(0),
        }
    }

    /// Runs `op` on the node serving `route`.
    ///
    /// Read-only operations go to a random replica of the slot when replica
    /// reads are enabled.
    ///
    /// # Errors
    ///
    /// - `Error::Validation` for a slot outside 0..16384
    /// - `Error::TopologyUnavailable` when no node is known at all
    /// - `Error::AttemptsExhausted` when the attempt or time budget runs out
    /// - any non-retryable error from `op`, unchanged
    #[instrument(level = "debug", skip_all, fields(slot = route.slot()))]
    pub async fn execute<O>(&self, route: Route, op: &O) -> Result<O::Output>
    where
        O: Operation + ?Sized,
    {
        let slot = route.slot();
        if slot >= SLOT_COUNT {
            return Err(Error::validation(format!("slot {slot} is out of range")));
        }
        let targeting = Targeting::Slot {
            slot,
            prefer_replica: self.read_from_replicas && op.read_only(),
        };
        self.run(targeting, op).await
    }

    /// Runs `op` on one node picked round-robin.
    ///
    /// Primaries are used unless replica reads are enabled and `op` is
    /// read-only, in which case every known node takes part. Redirects are not
    /// followed; they count as failed attempts.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute).
    #[instrument(level = "debug", skip_all)]
    pub async fn execute_keyless<O>(&self, op: &O) -> Result<O::Output>
    where
        O: Operation + ?Sized,
    {
        let targeting = Targeting::Keyless {
            any_node: self.read_from_replicas && op.read_only(),
        };
        self.run(targeting, op).await
    }

    /// Runs `op` once on every primary, concurrently.
    ///
    /// # Returns
    ///
    /// The reply of every primary.
    ///
    /// # Errors
    ///
    /// `Error::Broadcast` when any node failed, listing each failure, or when
    /// the replies are not all equal.
    #[instrument(level = "debug", skip_all)]
    pub async fn broadcast<O>(&self, op: &O) -> Result<HashMap<NodeKey, O::Output>>
    where
        O: Operation + ?Sized,
        O::Output: PartialEq,
    {
        let mut primaries: Vec<NodeKey> = self.topology.snapshot()?.primary_nodes().into_keys().collect();
        primaries.sort();

        let results = join_all(primaries.iter().map(|node| self.run_once(node, op))).await;
        let total = results.len();

        let mut replies = HashMap::with_capacity(total);
        let mut errors = Vec::new();
        for (node, result) in primaries.into_iter().zip(results) {
            match result {
                Ok(reply) => {
                    replies.insert(node, reply);
                }
                Err(e) => errors.push((node, e)),
            }
        }

        if !errors.is_empty() {
            return Err(Error::Broadcast {
                message: format!("broadcast failed on {} of {} nodes", errors.len(), total),
                errors,
            });
        }

        let mut values = replies.values();
        if let Some(first) = values.next() {
            if values.any(|reply| reply != first) {
                return Err(Error::Broadcast {
                    message: "broadcast replies differ between nodes".to_string(),
                    errors: Vec::new(),
                });
            }
        }

        Ok(replies)
    }

    async fn run<O>(&self, targeting: Targeting, op: &O) -> Result<O::Output>
    where
        O: Operation + ?Sized,
    {
        let mut ctx = AttemptContext::new(self.max_attempts, self.max_total_retry_duration);
        let mut redirect: Option<Redirect> = None;

        loop {
            if self.registry.is_closed() {
                return Err(topology::closed());
            }
            let (node, asking) = match &redirect {
                Some(Redirect { node, asking }) => (node.clone(), *asking),
                None => (self.pick(targeting).await?, false),
            };
            // ASK is one-shot; MOVED targets stick until a refresh clears them.
            if asking {
                redirect = None;
            }
            ctx.last_node = Some(node.clone());

            let (failure, cause) = match self.attempt(&node, asking, op).await {
                AttemptOutcome::Success(output) => return Ok(output),
                AttemptOutcome::Fatal(e) => return Err(e),
                AttemptOutcome::Retry { failure, cause } => (failure, cause),
            };
            ctx.attempts_left -= 1;
            debug!(node = %node, error = %cause, attempts_left = ctx.attempts_left, "attempt failed");

            let in_time = match failure {
                Failure::Connection => {
                    ctx.consecutive_connection_failures += 1;
                    match self.on_connection_problem(&ctx).await {
                        Some(refreshed) => {
                            if refreshed {
                                ctx.consecutive_connection_failures = 0;
                                redirect = None;
                            }
                            true
                        }
                        None => false,
                    }
                }
                Failure::Moved { slot, node: target } => {
                    ctx.consecutive_connection_failures = 0;
                    if let Targeting::Slot { .. } = targeting {
                        debug!(slot, from = %node, to = %target, "MOVED redirect");
                        self.topology.assign_slot(slot, target.clone());
                        if self.topology.note_moved() >= self.moved_refresh_threshold {
                            self.refresh(Some(&node)).await;
                        }
                        redirect = Some(Redirect {
                            node: target,
                            asking: false,
                        });
                    }
                    true
                }
                Failure::Ask { node: target } => {
                    ctx.consecutive_connection_failures = 0;
                    if let Targeting::Slot { .. } = targeting {
                        debug!(from = %node, to = %target, "ASK redirect");
                        redirect = Some(Redirect {
                            node: target,
                            asking: true,
                        });
                    }
                    true
                }
                Failure::Busy => {
                    ctx.consecutive_connection_failures = 0;
                    self.sleep_backoff(&ctx).await
                }
            };

            if !in_time || Instant::now() > ctx.deadline {
                return Err(ctx.exhausted(DEADLINE_EXCEEDED, cause));
            }
            if ctx.attempts_left == 0 {
                return Err(ctx.exhausted(NO_ATTEMPTS_LEFT, cause));
            }
            ctx.errors.push(cause);
        }
    }

    /// Applies the connection-problem rule.
    ///
    /// Returns `Some(true)` after a refresh, `Some(false)` when none was due,
    /// and `None` when the deadline passed before the backoff.
    async fn on_connection_problem(&self, ctx: &AttemptContext) -> Option<bool> {
        if self.max_attempts < 3 {
            if ctx.attempts_left == 0 {
                self.refresh(None).await;
                return Some(true);
            }
            return Some(false);
        }
        if ctx.consecutive_connection_failures < 2 {
            return Some(false);
        }
        if !self.sleep_backoff(ctx).await {
            return None;
        }
        self.refresh(None).await;
        Some(true)
    }

    /// Sleeps a jittered backoff. Returns false if the deadline has passed.
    async fn sleep_backoff(&self, ctx: &AttemptContext) -> bool {
        match ctx.backoff() {
            Some(delay) => {
                if !delay.is_zero() {
                    debug!(?delay, "backing off");
                    tokio::time::sleep(delay).await;
                }
                true
            }
            None => false,
        }
    }

    async fn refresh(&self, preferred: Option<&NodeKey>) -> Option<Error> {
        match self.topology.refresh(preferred, &self.seeds).await {
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, causes = e.suppressed().len(), "topology refresh failed");
                Some(e)
            }
        }
    }

    async fn pick(&self, targeting: Targeting) -> Result<NodeKey> {
        match targeting {
            Targeting::Slot {
                slot,
                prefer_replica,
            } => self.resolve(slot, prefer_replica).await,
            Targeting::Keyless { any_node } => self.next_keyless_node(any_node).await,
        }
    }

    async fn resolve(&self, slot: u16, prefer_replica: bool) -> Result<NodeKey> {
        match self.topology.resolve(slot, prefer_replica) {
            Ok(node) => return Ok(node),
            Err(e @ Error::Validation { .. }) => return Err(e),
            Err(e) => debug!(slot, error = %e, "slot not resolvable, refreshing"),
        }

        let refresh_error = self.refresh(None).await;
        if let Ok(node) = self.topology.resolve(slot, prefer_replica) {
            return Ok(node);
        }

        // Any primary will answer with MOVED if it does not own the slot.
        let primaries: Vec<NodeKey> = self.topology.primary_nodes().into_keys().collect();
        match primaries.choose(&mut rand::rng()) {
            Some(node) => Ok(node.clone()),
            None => Err(Error::TopologyUnavailable {
                message: format!("No known cluster node can serve slot {slot}."),
                suppressed: refresh_error.into_iter().collect(),
            }),
        }
    }

    async fn next_keyless_node(&self, any_node: bool) -> Result<NodeKey> {
        let mut nodes = self.keyless_candidates(any_node);
        if nodes.is_empty() {
            let refresh_error = self.refresh(None).await;
            nodes = self.keyless_candidates(any_node);
            if nodes.is_empty() {
                return Err(Error::TopologyUnavailable {
                    message: "No known cluster node for keyless command.".to_string(),
                    suppressed: refresh_error.into_iter().collect(),
                });
            }
        }
        let idx = self.next_keyless.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Ok(nodes.swap_remove(idx))
    }

    fn keyless_candidates(&self, any_node: bool) -> Vec<NodeKey> {
        let mut nodes: Vec<NodeKey> = if any_node {
            self.topology.nodes().into_keys().collect()
        } else {
            self.topology.primary_nodes().into_keys().collect()
        };
        nodes.sort();
        nodes
    }

    async fn run_once<O>(&self, node: &NodeKey, op: &O) -> Result<O::Output>
    where
        O: Operation + ?Sized,
    {
        match self.attempt(node, false, op).await {
            AttemptOutcome::Success(output) => Ok(output),
            AttemptOutcome::Retry { cause, .. } | AttemptOutcome::Fatal(cause) => Err(cause),
        }
    }

    /// One attempt on `node`. The connection goes back to its pool, or is
    /// discarded after a connection-level error, before this returns.
    async fn attempt<O>(&self, node: &NodeKey, asking: bool, op: &O) -> AttemptOutcome<O::Output>
    where
        O: Operation + ?Sized,
    {
        let pool = match self.registry.pool_for(node) {
            Ok(pool) => pool,
            Err(e) => return self.classify(e),
        };
        let mut conn = match pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => return self.classify(e),
        };

        let result = if asking {
            match send_asking(conn.as_mut()).await {
                Ok(()) => op.run(conn.as_mut()).await,
                Err(e) => Err(e),
            }
        } else {
            op.run(conn.as_mut()).await
        };

        match result {
            Ok(output) => {
                pool.release(conn);
                AttemptOutcome::Success(output)
            }
            Err(e) => {
                if e.is_connection_error() {
                    pool.discard(conn);
                } else {
                    pool.release(conn);
                }
                self.classify(e)
            }
        }
    }

    fn classify<T>(&self, error: Error) -> AttemptOutcome<T> {
        let failure = match &error {
            Error::Moved { slot, address } => match self.registry.translate(address) {
                Ok(node) => Failure::Moved { slot: *slot, node },
                Err(e) => return AttemptOutcome::Fatal(e),
            },
            Error::Ask { address, .. } => match self.registry.translate(address) {
                Ok(node) => Failure::Ask { node },
                Err(e) => return AttemptOutcome::Fatal(e),
            },
            e if e.is_cluster_busy() => Failure::Busy,
            e if e.is_connection_error() => Failure::Connection,
            _ => return AttemptOutcome::Fatal(error),
        };
        AttemptOutcome::Retry {
            failure,
            cause: error,
        }
    }
}

async fn send_asking(conn: &mut dyn Connection) -> Result<()> {
    let reply = conn.send_command(&asking().into_frame()).await?;
    expect_ok(reply)
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("seeds", &self.seeds)
            .field("max_attempts", &self.max_attempts)
            .field("max_total_retry_duration", &self.max_total_retry_duration)
            .field("read_from_replicas", &self.read_from_replicas)
            .field("moved_refresh_threshold", &self.moved_refresh_threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::{get, ping, Cmd};
    use crate::proto::Frame;
    use crate::testing::{
        command_name, connection_reset, node, single_node_slots, slot_range, slots_reply,
        MockCluster, MockEvent,
    };
    use async_trait::async_trait;

    const A: &str = "127.0.0.1:7000";
    const B: &str = "127.0.0.1:7001";
    const C: &str = "127.0.0.1:7002";

    struct Harness {
        cluster: MockCluster,
        topology: Arc<SlotTopology>,
        dispatcher: Dispatcher,
    }

    fn config(max_attempts: u32) -> ClusterConfig {
        ClusterConfig {
            seeds: vec![node(A)],
            max_attempts,
            max_total_retry_duration: Duration::from_secs(10),
            ..ClusterConfig::default()
        }
    }

    async fn harness(cluster: MockCluster, config: ClusterConfig) -> Harness {
        let registry = Arc::new(NodeRegistry::new(
            cluster.factory(),
            config.address_translator.clone(),
        ));
        let topology = Arc::new(SlotTopology::new(registry.clone(), &config));
        topology.discover(&config.seeds).await.unwrap();
        let dispatcher = Dispatcher::new(topology.clone(), registry, &config);
        cluster.clear_events();
        Harness {
            cluster,
            topology,
            dispatcher,
        }
    }

    fn two_primaries() -> Frame {
        slots_reply(vec![slot_range(0, 8191, A, &[]), slot_range(8192, 16383, B, &[])])
    }

    fn command(node_addr: &str, name: &str, ok: bool) -> MockEvent {
        MockEvent::Command {
            node: node(node_addr),
            name: name.to_string(),
            ok,
        }
    }

    fn get_k() -> Cmd {
        Cmd::new("GET").arg("k")
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_failures_then_success() {
        let cluster = MockCluster::with_slots(single_node_slots(A, &[]));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            cluster.on_command(move |_, _| {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(connection_reset())
                } else {
                    Ok(Frame::bulk("bar"))
                }
            });
        }
        let h = harness(cluster, config(3)).await;

        let reply = h.dispatcher.execute(Route::key("foo"), &get("foo")).await.unwrap();
        assert_eq!(reply, Frame::bulk("bar"));
        assert_eq!(
            h.cluster.significant_events(),
            vec![
                command(A, "GET", false),
                MockEvent::Discard(node(A)),
                command(A, "GET", false),
                MockEvent::Discard(node(A)),
                command(A, "CLUSTER SLOTS", true),
                MockEvent::Release(node(A)),
                command(A, "GET", true),
                MockEvent::Release(node(A)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_attempts_refresh_on_last() {
        let cluster = MockCluster::with_slots(single_node_slots(A, &[]));
        cluster.on_command(|_, _| Err(connection_reset()));
        let h = harness(cluster, config(2)).await;

        let err = h.dispatcher.execute(Route::Slot(0), &get_k()).await.unwrap_err();
        assert!(err.to_string().starts_with(NO_ATTEMPTS_LEFT));
        assert_eq!(err.suppressed().len(), 1);
        assert_eq!(
            h.cluster.significant_events(),
            vec![
                command(A, "GET", false),
                MockEvent::Discard(node(A)),
                command(A, "GET", false),
                MockEvent::Discard(node(A)),
                command(A, "CLUSTER SLOTS", true),
                MockEvent::Release(node(A)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_exhausted_carries_causes() {
        let cluster = MockCluster::with_slots(single_node_slots(A, &[]));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            cluster.on_command(move |_, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(Frame::error("TRYAGAIN Multiple keys request during rehashing of slot"))
                } else {
                    Err(connection_reset())
                }
            });
        }
        let h = harness(cluster, config(3)).await;

        let err = h.dispatcher.execute(Route::Slot(0), &get_k()).await.unwrap_err();
        match err {
            Error::AttemptsExhausted {
                message,
                last_node,
                source,
                suppressed,
            } => {
                assert_eq!(message, NO_ATTEMPTS_LEFT);
                assert_eq!(last_node, Some(node(A)));
                assert!(matches!(*source, Error::Io { .. }));
                assert_eq!(suppressed.len(), 2);
                assert!(matches!(suppressed[0], Error::TryAgain { .. }));
                assert!(matches!(suppressed[1], Error::Io { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded() {
        struct SlowFailure;

        #[async_trait]
        impl Operation for SlowFailure {
            type Output = ();

            async fn run(&self, _conn: &mut dyn Connection) -> Result<()> {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(connection_reset())
            }
        }

        let cluster = MockCluster::with_slots(single_node_slots(A, &[]));
        let config = ClusterConfig {
            max_total_retry_duration: Duration::ZERO,
            ..config(5)
        };
        let h = harness(cluster, config).await;

        let err = h.dispatcher.execute(Route::Slot(0), &SlowFailure).await.unwrap_err();
        assert!(err.to_string().starts_with(DEADLINE_EXCEEDED));
        assert!(err.suppressed().is_empty());
        assert_eq!(h.cluster.significant_events(), vec![MockEvent::Discard(node(A))]);
    }

    #[tokio::test]
    async fn test_moved_patches_slot_and_retries() {
        let cluster = MockCluster::with_slots(two_primaries());
        cluster.on_command(|n, _| {
            if *n == node(A) {
                Ok(Frame::error(&format!("MOVED 100 {C}")))
            } else {
                Ok(Frame::bulk("v"))
            }
        });
        let config = ClusterConfig {
            moved_refresh_threshold: 100,
            ..config(5)
        };
        let h = harness(cluster, config).await;

        let reply = h.dispatcher.execute(Route::Slot(100), &get_k()).await.unwrap();
        assert_eq!(reply, Frame::bulk("v"));
        assert_eq!(h.topology.resolve(100, false).unwrap(), node(C));
        assert_eq!(h.topology.resolve(101, false).unwrap(), node(A));
        assert_eq!(
            h.cluster.significant_events(),
            vec![
                command(A, "GET", false),
                MockEvent::Release(node(A)),
                command(C, "GET", true),
                MockEvent::Release(node(C)),
            ]
        );
    }

    #[tokio::test]
    async fn test_moved_consumes_an_attempt() {
        let cluster = MockCluster::with_slots(two_primaries());
        cluster.on_command(|_, _| Ok(Frame::error(&format!("MOVED 100 {C}"))));
        let config = ClusterConfig {
            moved_refresh_threshold: 100,
            ..config(1)
        };
        let h = harness(cluster, config).await;

        let err = h.dispatcher.execute(Route::Slot(100), &get_k()).await.unwrap_err();
        match err {
            Error::AttemptsExhausted { source, .. } => {
                assert!(matches!(*source, Error::Moved { slot: 100, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_moved_refreshes_from_redirecting_node() {
        let cluster = MockCluster::with_slots(two_primaries());
        cluster.on_command(|n, _| {
            if *n == node(B) {
                Ok(Frame::error(&format!("MOVED 9000 {A}")))
            } else {
                Ok(Frame::bulk("v"))
            }
        });
        let config = ClusterConfig {
            seeds: vec![node(A)],
            ..config(5)
        };
        let h = harness(cluster, config).await;

        h.dispatcher.execute(Route::Slot(9000), &get_k()).await.unwrap();
        assert_eq!(
            h.cluster.significant_events(),
            vec![
                command(B, "GET", false),
                MockEvent::Release(node(B)),
                command(B, "CLUSTER SLOTS", true),
                MockEvent::Release(node(B)),
                command(A, "GET", true),
                MockEvent::Release(node(A)),
            ]
        );
    }

    #[tokio::test]
    async fn test_ask_sends_asking_and_keeps_topology() {
        let cluster = MockCluster::with_slots(two_primaries());
        cluster.on_command(|n, _| {
            if *n == node(A) {
                Ok(Frame::error(&format!("ASK 100 {B}")))
            } else {
                Ok(Frame::bulk("v"))
            }
        });
        let h = harness(cluster, config(5)).await;

        let reply = h.dispatcher.execute(Route::Slot(100), &get_k()).await.unwrap();
        assert_eq!(reply, Frame::bulk("v"));
        assert_eq!(h.topology.resolve(100, false).unwrap(), node(A));
        assert_eq!(
            h.cluster.significant_events(),
            vec![
                command(A, "GET", false),
                MockEvent::Release(node(A)),
                command(B, "ASKING", true),
                command(B, "GET", true),
                MockEvent::Release(node(B)),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_backs_off_and_retries() {
        let cluster = MockCluster::with_slots(single_node_slots(A, &[]));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            cluster.on_command(move |_, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(Frame::error("CLUSTERDOWN The cluster is down"))
                } else {
                    Ok(Frame::simple("OK"))
                }
            });
        }
        let h = harness(cluster, config(3)).await;

        let reply = h.dispatcher.execute(Route::Slot(7), &get_k()).await.unwrap();
        assert_eq!(reply, Frame::simple("OK"));
        assert_eq!(
            h.cluster.significant_events(),
            vec![
                command(A, "GET", false),
                MockEvent::Release(node(A)),
                command(A, "GET", true),
                MockEvent::Release(node(A)),
            ]
        );
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let cluster = MockCluster::with_slots(single_node_slots(A, &[]));
        cluster.on_command(|_, _| Ok(Frame::error("WRONGTYPE Operation against a key")));
        let h = harness(cluster, config(5)).await;

        let err = h.dispatcher.execute(Route::Slot(7), &get_k()).await.unwrap_err();
        assert!(matches!(err, Error::Server { .. }));
        assert_eq!(
            h.cluster.significant_events(),
            vec![command(A, "GET", false), MockEvent::Release(node(A))]
        );
    }

    #[tokio::test]
    async fn test_invalid_slot_is_rejected() {
        let cluster = MockCluster::with_slots(single_node_slots(A, &[]));
        let h = harness(cluster, config(5)).await;

        let err = h.dispatcher.execute(Route::Slot(20000), &get_k()).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(h.cluster.events().is_empty());
    }

    #[tokio::test]
    async fn test_uncovered_slot_refreshes_then_falls_back() {
        let cluster = MockCluster::with_slots(slots_reply(vec![slot_range(0, 100, A, &[])]));
        let config = ClusterConfig {
            require_full_coverage: false,
            ..config(5)
        };
        let h = harness(cluster, config).await;

        h.dispatcher.execute(Route::Slot(5000), &get_k()).await.unwrap();
        assert_eq!(
            h.cluster.significant_events(),
            vec![
                command(A, "CLUSTER SLOTS", true),
                MockEvent::Release(node(A)),
                command(A, "GET", true),
                MockEvent::Release(node(A)),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_topology_and_no_nodes() {
        let cluster = MockCluster::with_slots(single_node_slots(A, &[]));
        let h = harness(cluster, config(5)).await;
        h.topology.reset();
        h.cluster.set_unreachable(&node(A), true);

        let err = h.dispatcher.execute(Route::Slot(0), &get_k()).await.unwrap_err();
        assert!(matches!(err, Error::TopologyUnavailable { .. }));
        assert_eq!(err.suppressed().len(), 1);
    }

    #[tokio::test]
    async fn test_read_only_prefers_replica() {
        let cluster = MockCluster::with_slots(single_node_slots(A, &[B]));
        let config = ClusterConfig {
            read_from_replicas: true,
            ..config(5)
        };
        let h = harness(cluster, config).await;

        h.dispatcher.execute(Route::key("foo"), &get("foo")).await.unwrap();
        h.dispatcher.execute(Route::key("foo"), &get_k()).await.unwrap();
        assert_eq!(
            h.cluster.significant_events(),
            vec![
                command(B, "GET", true),
                MockEvent::Release(node(B)),
                command(A, "GET", true),
                MockEvent::Release(node(A)),
            ]
        );
    }

    #[tokio::test]
    async fn test_keyless_round_robin() {
        let cluster = MockCluster::with_slots(two_primaries());
        let h = harness(cluster, config(5)).await;

        for _ in 0..4 {
            h.dispatcher.execute_keyless(&ping()).await.unwrap();
        }
        let targets: Vec<NodeKey> = h
            .cluster
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Command { node, .. } => Some(node),
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec![node(A), node(B), node(A), node(B)]);
    }

    #[tokio::test]
    async fn test_keyless_read_only_uses_replicas() {
        let cluster = MockCluster::with_slots(single_node_slots(A, &[B]));
        let config = ClusterConfig {
            read_from_replicas: true,
            ..config(5)
        };
        let h = harness(cluster, config).await;

        let dbsize = Cmd::new("DBSIZE").mark_read_only();
        h.dispatcher.execute_keyless(&dbsize).await.unwrap();
        h.dispatcher.execute_keyless(&dbsize).await.unwrap();
        h.dispatcher.execute_keyless(&ping()).await.unwrap();
        let targets: Vec<NodeKey> = h
            .cluster
            .events()
            .into_iter()
            .filter_map(|e| match e {
                MockEvent::Command { node, .. } => Some(node),
                _ => None,
            })
            .collect();
        assert_eq!(targets, vec![node(A), node(B), node(A)]);
    }

    #[tokio::test]
    async fn test_broadcast_agreeing_replies() {
        let cluster = MockCluster::with_slots(two_primaries());
        let h = harness(cluster, config(5)).await;

        let replies = h.dispatcher.broadcast(&ping()).await.unwrap();
        assert_eq!(replies.len(), 2);
        assert!(replies.values().all(|r| *r == Frame::simple("OK")));
    }

    #[tokio::test]
    async fn test_broadcast_disagreement_is_error() {
        let cluster = MockCluster::with_slots(two_primaries());
        cluster.on_command(|n, _| Ok(Frame::Integer(i64::from(n.port()))));
        let h = harness(cluster, config(5)).await;

        let err = h.dispatcher.broadcast(&Cmd::new("DBSIZE")).await.unwrap_err();
        assert_eq!(err.to_string(), "broadcast replies differ between nodes");
    }

    #[tokio::test]
    async fn test_broadcast_partial_failure() {
        let cluster = MockCluster::with_slots(two_primaries());
        cluster.on_command(|n, frame| {
            assert_eq!(command_name(frame), "FLUSHALL");
            if *n == node(B) {
                Err(connection_reset())
            } else {
                Ok(Frame::simple("OK"))
            }
        });
        let h = harness(cluster, config(5)).await;

        match h.dispatcher.broadcast(&Cmd::new("FLUSHALL")).await.unwrap_err() {
            Error::Broadcast { message, errors } => {
                assert_eq!(message, "broadcast failed on 1 of 2 nodes");
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].0, node(B));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_route_conversions() {
        assert_eq!(Route::from(42u16).slot(), 42);
        assert_eq!(Route::from("foo").slot(), key_slot("foo"));
        assert_eq!(Route::key("{user1000}.a").slot(), Route::from("{user1000}.b".to_string()).slot());
    }
}
