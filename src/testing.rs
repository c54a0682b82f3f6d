//! In-memory cluster doubles for tests.
//!
//! [`MockCluster`] is a [`PoolFactory`] whose pools hand out scripted
//! connections. `CLUSTER SLOTS`, `ASKING` and `READONLY` are answered
//! automatically; every other command goes to a handler installed with
//! [`MockCluster::on_command`]. Pool and connection activity is recorded as a
//! list of [`MockEvent`]s so tests can assert the exact order of
//! acquire/send/release/discard calls.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::cluster::pool::{Pool, PoolFactory};
use crate::cluster::NodeKey;
use crate::core::connection::Connection;
use crate::error::{Error, Result};
use crate::proto::Frame;

type Handler = Arc<dyn Fn(&NodeKey, &Frame) -> Result<Frame> + Send + Sync>;

/// One recorded pool or connection interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// A pool was created for the node.
    PoolCreated(NodeKey),
    /// `acquire` was called on the node's pool.
    Acquire(NodeKey),
    /// A command was sent; `ok` is false for `Err` results and error replies.
    Command {
        /// Target node.
        node: NodeKey,
        /// Upper-cased command name, with the subcommand for `CLUSTER`.
        name: String,
        /// Whether the reply was a success.
        ok: bool,
    },
    /// A connection went back to its pool.
    Release(NodeKey),
    /// A connection was discarded.
    Discard(NodeKey),
    /// The node's pool was closed.
    Close(NodeKey),
}

impl MockEvent {
    /// Returns true for `Acquire` and `PoolCreated`, which most assertions skip.
    pub fn is_bookkeeping(&self) -> bool {
        matches!(self, MockEvent::Acquire(_) | MockEvent::PoolCreated(_))
    }
}

struct MockState {
    slots: Mutex<Frame>,
    handler: Mutex<Option<Handler>>,
    unreachable: Mutex<HashSet<NodeKey>>,
    events: Mutex<Vec<MockEvent>>,
    pools_created: AtomicUsize,
}

impl MockState {
    fn record(&self, event: MockEvent) {
        self.events.lock().push(event);
    }

    fn respond(&self, node: &NodeKey, name: &str, frame: &Frame) -> Result<Frame> {
        match name {
            "CLUSTER SLOTS" => Ok(self.slots.lock().clone()),
            "ASKING" | "READONLY" => Ok(Frame::simple("OK")),
            _ => {
                let handler = self.handler.lock().clone();
                match handler {
                    Some(handler) => handler(node, frame),
                    None => Ok(Frame::simple("OK")),
                }
            }
        }
    }
}

/// A scripted cluster usable as a [`PoolFactory`].
#[derive(Clone)]
pub struct MockCluster {
    state: Arc<MockState>,
}

impl MockCluster {
    /// Creates a cluster whose `CLUSTER SLOTS` reply is an empty array.
    pub fn new() -> Self {
        Self::with_slots(Frame::Array(Vec::new()))
    }

    /// Creates a cluster answering `CLUSTER SLOTS` with `reply`.
    pub fn with_slots(reply: Frame) -> Self {
        Self {
            state: Arc::new(MockState {
                slots: Mutex::new(reply),
                handler: Mutex::new(None),
                unreachable: Mutex::new(HashSet::new()),
                events: Mutex::new(Vec::new()),
                pools_created: AtomicUsize::new(0),
            }),
        }
    }

    /// Replaces the `CLUSTER SLOTS` reply.
    pub fn set_slots(&self, reply: Frame) {
        *self.state.slots.lock() = reply;
    }

    /// Installs the handler for every command other than `CLUSTER SLOTS`,
    /// `ASKING` and `READONLY`. Without one, commands get `+OK`.
    pub fn on_command<F>(&self, handler: F)
    where
        F: Fn(&NodeKey, &Frame) -> Result<Frame> + Send + Sync + 'static,
    {
        *self.state.handler.lock() = Some(Arc::new(handler));
    }

    /// Makes `acquire` on the node's pool fail with a connection-refused error.
    pub fn set_unreachable(&self, node: &NodeKey, unreachable: bool) {
        let mut nodes = self.state.unreachable.lock();
        if unreachable {
            nodes.insert(node.clone());
        } else {
            nodes.remove(node);
        }
    }

    /// Recorded events, oldest first.
    pub fn events(&self) -> Vec<MockEvent> {
        self.state.events.lock().clone()
    }

    /// Recorded events without `Acquire` and `PoolCreated` entries.
    pub fn significant_events(&self) -> Vec<MockEvent> {
        self.events()
            .into_iter()
            .filter(|e| !e.is_bookkeeping())
            .collect()
    }

    /// Forgets every recorded event.
    pub fn clear_events(&self) {
        self.state.events.lock().clear();
    }

    /// Number of pools built through this factory.
    pub fn pools_created(&self) -> usize {
        self.state.pools_created.load(Ordering::SeqCst)
    }

    /// A standalone connection to `node`, not owned by any pool.
    pub fn connection(&self, node: &NodeKey) -> MockConnection {
        MockConnection {
            node: node.clone(),
            state: self.state.clone(),
        }
    }

    /// This cluster as a shareable factory.
    pub fn factory(&self) -> Arc<dyn PoolFactory> {
        Arc::new(self.clone())
    }
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolFactory for MockCluster {
    fn create_pool(&self, node: &NodeKey) -> Arc<dyn Pool> {
        self.state.pools_created.fetch_add(1, Ordering::SeqCst);
        self.state.record(MockEvent::PoolCreated(node.clone()));
        Arc::new(MockPool {
            node: node.clone(),
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Pool handed out by [`MockCluster`].
pub struct MockPool {
    node: NodeKey,
    state: Arc<MockState>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPool")
            .field("node", &self.node)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Pool for MockPool {
    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        self.state.record(MockEvent::Acquire(self.node.clone()));
        if self.is_closed() {
            return Err(Error::PoolClosed {
                node: self.node.clone(),
            });
        }
        if self.state.unreachable.lock().contains(&self.node) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused").into());
        }
        Ok(Box::new(MockConnection {
            node: self.node.clone(),
            state: self.state.clone(),
        }))
    }

    fn release(&self, _conn: Box<dyn Connection>) {
        self.state.record(MockEvent::Release(self.node.clone()));
    }

    fn discard(&self, _conn: Box<dyn Connection>) {
        self.state.record(MockEvent::Discard(self.node.clone()));
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.record(MockEvent::Close(self.node.clone()));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connection handed out by [`MockPool`].
pub struct MockConnection {
    node: NodeKey,
    state: Arc<MockState>,
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("node", &self.node)
            .finish()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send_command(&mut self, frame: &Frame) -> Result<Frame> {
        let name = command_name(frame);
        let result = self.state.respond(&self.node, &name, frame);
        let ok = matches!(&result, Ok(reply) if !matches!(reply, Frame::Error(_)));
        self.state.record(MockEvent::Command {
            node: self.node.clone(),
            name,
            ok,
        });
        result
    }

    fn address(&self) -> &NodeKey {
        &self.node
    }
}

/// Upper-cased command name of a request frame; `CLUSTER` keeps its subcommand.
pub fn command_name(frame: &Frame) -> String {
    let args = frame.as_array().unwrap_or_default();
    let word = |i: usize| {
        args.get(i)
            .and_then(Frame::as_bytes)
            .map(|b| String::from_utf8_lossy(b).to_ascii_uppercase())
            .unwrap_or_default()
    };
    let name = word(0);
    if name == "CLUSTER" {
        format!("{name} {}", word(1))
    } else {
        name
    }
}

/// The `i`-th argument of a request frame.
pub fn command_arg(frame: &Frame, i: usize) -> Option<Bytes> {
    match frame.as_array()?.get(i)? {
        Frame::BulkString(Some(b)) => Some(b.clone()),
        _ => None,
    }
}

/// A `CLUSTER SLOTS` node entry `[host, port, id]` for `host:port`.
pub fn node_entry(address: &str) -> Frame {
    let (host, port) = address.rsplit_once(':').unwrap_or((address, "6379"));
    let port: i64 = port.parse().unwrap_or(6379);
    Frame::Array(vec![
        Frame::bulk(Bytes::copy_from_slice(host.as_bytes())),
        Frame::Integer(port),
        Frame::bulk(Bytes::from(format!("id-{address}"))),
    ])
}

/// A `CLUSTER SLOTS` range entry.
pub fn slot_range(start: u16, end: u16, primary: &str, replicas: &[&str]) -> Frame {
    let mut entry = vec![
        Frame::Integer(i64::from(start)),
        Frame::Integer(i64::from(end)),
        node_entry(primary),
    ];
    entry.extend(replicas.iter().map(|r| node_entry(r)));
    Frame::Array(entry)
}

/// A `CLUSTER SLOTS` reply from range entries.
pub fn slots_reply(ranges: Vec<Frame>) -> Frame {
    Frame::Array(ranges)
}

/// A reply assigning every slot to `primary`.
pub fn single_node_slots(primary: &str, replicas: &[&str]) -> Frame {
    slots_reply(vec![slot_range(0, 16383, primary, replicas)])
}

/// A connection-level failure, as a handler result.
pub fn connection_reset() -> Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer").into()
}

/// Parses a node address, panicking on bad input.
pub fn node(address: &str) -> NodeKey {
    match NodeKey::parse(address) {
        Ok(key) => key,
        Err(e) => panic!("bad test address {address:?}: {e}"),
    }
}
