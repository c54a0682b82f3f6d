//! Connection pooling for Redis Cluster nodes.
//!
//! The dispatcher only talks to the [`Pool`] and [`PoolFactory`] traits. The
//! default implementation, [`TcpPool`], keeps a bounded set of TCP connections
//! per node and reuses idle ones.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::cluster::commands::readonly;
use crate::cluster::NodeKey;
use crate::core::command::expect_ok;
use crate::core::connection::{Connection, TcpConnection};
use crate::error::{Error, Result};
use crate::proto::Frame;

/// Configuration for the per-node connection pools.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of connections per node
    pub max_connections_per_node: usize,
    /// How long `acquire` waits for a free connection
    pub acquire_timeout: Duration,
    /// TCP connect timeout
    pub connection_timeout: Duration,
    /// Per-reply read timeout
    pub read_timeout: Option<Duration>,
    /// Per-command write timeout
    pub write_timeout: Option<Duration>,
}

/// Default connect and read timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_node: 10,
            acquire_timeout: DEFAULT_TIMEOUT,
            connection_timeout: DEFAULT_TIMEOUT,
            read_timeout: Some(DEFAULT_TIMEOUT),
            write_timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

/// A pool of connections to one node.
#[async_trait]
pub trait Pool: Send + Sync + fmt::Debug {
    /// Takes a connection, opening one if none is idle.
    ///
    /// # Errors
    ///
    /// Connection-level errors (`Io`, `Timeout`, `PoolClosed`) when no
    /// connection can be handed out.
    async fn acquire(&self) -> Result<Box<dyn Connection>>;

    /// Returns a healthy connection for reuse.
    fn release(&self, conn: Box<dyn Connection>);

    /// Drops a connection that must not be reused.
    fn discard(&self, conn: Box<dyn Connection>);

    /// Closes the pool. Later `acquire` calls fail with `Error::PoolClosed`;
    /// connections released afterwards are dropped.
    fn close(&self);

    /// Whether [`close`](Pool::close) has been called.
    fn is_closed(&self) -> bool;
}

/// Builds a pool for a node the first time it is referenced.
pub trait PoolFactory: Send + Sync {
    /// Creates a pool for `node`. Must not perform network IO.
    fn create_pool(&self, node: &NodeKey) -> Arc<dyn Pool>;
}

/// A pooled TCP connection. Holds its pool slot until dropped.
#[derive(Debug)]
struct PooledConnection {
    inner: TcpConnection,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Connection for PooledConnection {
    async fn send_command(&mut self, frame: &Frame) -> Result<Frame> {
        self.inner.send_command(frame).await
    }

    fn address(&self) -> &NodeKey {
        self.inner.address()
    }
}

/// Bounded TCP connection pool for one node.
///
/// At most `max_connections_per_node` connections exist at once, idle or in
/// use. A caller that finds none idle either opens a new one or waits for a
/// release, up to `acquire_timeout`.
pub struct TcpPool {
    node: NodeKey,
    config: PoolConfig,
    read_only: bool,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    permits: Arc<Semaphore>,
    returned: Notify,
    closed: AtomicBool,
}

impl TcpPool {
    /// Creates an empty pool. No connection is opened until `acquire`.
    ///
    /// # Arguments
    ///
    /// * `node` - The node this pool connects to
    /// * `config` - Pool limits and timeouts
    /// * `read_only` - Send `READONLY` on every new connection
    pub fn new(node: NodeKey, config: PoolConfig, read_only: bool) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_connections_per_node.max(1)));
        Self {
            node,
            config,
            read_only,
            idle: Mutex::new(Vec::new()),
            permits,
            returned: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn closed_error(&self) -> Error {
        Error::PoolClosed {
            node: self.node.clone(),
        }
    }

    async fn open(&self, permit: OwnedSemaphorePermit) -> Result<Box<dyn Connection>> {
        let conn = TcpConnection::connect(&self.node, self.config.connection_timeout).await?;
        let mut conn = PooledConnection {
            inner: conn.with_timeouts(self.config.read_timeout, self.config.write_timeout),
            _permit: permit,
        };
        if self.read_only {
            let reply = conn.send_command(&readonly().into_frame()).await?;
            expect_ok(reply)?;
        }
        debug!(node = %self.node, "opened connection");
        Ok(Box::new(conn))
    }

    async fn acquire_inner(&self) -> Result<Box<dyn Connection>> {
        loop {
            if self.is_closed() {
                return Err(self.closed_error());
            }
            let idle = self.idle.lock().pop();
            if let Some(conn) = idle {
                return Ok(conn);
            }
            tokio::select! {
                permit = self.permits.clone().acquire_owned() => {
                    let permit = permit.map_err(|_| self.closed_error())?;
                    return self.open(permit).await;
                }
                _ = self.returned.notified() => continue,
            }
        }
    }
}

#[async_trait]
impl Pool for TcpPool {
    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        let after = self.config.acquire_timeout;
        tokio::time::timeout(after, self.acquire_inner())
            .await
            .map_err(|_| Error::Timeout {
                operation: "pool acquire",
                after,
            })?
    }

    fn release(&self, conn: Box<dyn Connection>) {
        if self.is_closed() {
            return;
        }
        self.idle.lock().push(conn);
        self.returned.notify_one();
    }

    fn discard(&self, conn: Box<dyn Connection>) {
        debug!(node = %self.node, "discarding connection");
        drop(conn);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.permits.close();
        self.idle.lock().clear();
        self.returned.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TcpPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPool")
            .field("node", &self.node)
            .field("idle", &self.idle_count())
            .field("available_permits", &self.permits.available_permits())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Creates a [`TcpPool`] per node.
#[derive(Debug, Clone)]
pub struct TcpPoolFactory {
    config: PoolConfig,
    read_only: bool,
}

impl TcpPoolFactory {
    /// Creates a factory. With `read_only` set, every connection issues
    /// `READONLY` so replicas accept reads.
    pub fn new(config: PoolConfig, read_only: bool) -> Self {
        Self { config, read_only }
    }
}

impl PoolFactory for TcpPoolFactory {
    fn create_pool(&self, node: &NodeKey) -> Arc<dyn Pool> {
        Arc::new(TcpPool::new(node.clone(), self.config.clone(), self.read_only))
    }
}
