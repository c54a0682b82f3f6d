use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::cluster::NodeKey;

/// Result type alias for slotmux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the cluster client and its collaborators.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An IO error occurred.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// A connect, read, write or acquire step did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// The step that timed out.
        operation: &'static str,
        /// The configured limit.
        after: Duration,
    },

    /// A protocol error occurred.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// The pool for a node has been closed.
    #[error("connection pool for {node} is closed")]
    PoolClosed {
        /// The node whose pool was closed.
        node: NodeKey,
    },

    /// The server returned an error.
    #[error("server error: {message}")]
    Server {
        /// Error message from server.
        message: String,
    },

    /// Caller input was rejected before anything was sent.
    #[error("validation error: {message}")]
    Validation {
        /// Description of the invalid input.
        message: String,
    },

    /// Key moved to another node (permanent redirect).
    ///
    /// The slot for the requested key has been migrated to a different node.
    /// The slot map should be updated and the command retried on the new node.
    #[error("MOVED to slot {slot} at {address}")]
    Moved {
        /// The slot number (0-16383).
        slot: u16,
        /// The address of the node owning this slot (e.g., "127.0.0.1:7001").
        address: String,
    },

    /// Temporary redirect during migration (ASK redirect).
    ///
    /// The command must be retried on the target after an ASKING command.
    /// The slot map is NOT updated for ASK redirects.
    #[error("ASK to slot {slot} at {address}")]
    Ask {
        /// The slot number (0-16383).
        slot: u16,
        /// The address of the node temporarily handling this slot.
        address: String,
    },

    /// The slot is being resharded and the command should be retried shortly.
    #[error("TRYAGAIN {message}")]
    TryAgain {
        /// Rest of the server message.
        message: String,
    },

    /// The cluster is down or cannot serve the slot right now.
    #[error("CLUSTERDOWN {message}")]
    ClusterDown {
        /// Rest of the server message.
        message: String,
    },

    /// Multi-key operation with keys in different slots.
    ///
    /// Use hash tags `{...}` to ensure keys are in the same slot.
    #[error("CROSSSLOT keys in multi-key operation map to different slots")]
    CrossSlot,

    /// A topology snapshot exists but no node owns the slot.
    #[error("slot {slot} is not served by any known node")]
    SlotNotCovered {
        /// The uncovered slot.
        slot: u16,
    },

    /// A `CLUSTER SLOTS` reply was well-formed but unusable.
    #[error("invalid cluster topology: {message}")]
    InvalidTopology {
        /// Why the reply was rejected.
        message: String,
    },

    /// No usable slot map could be obtained.
    #[error("{message}")]
    TopologyUnavailable {
        /// Summary of the failure.
        message: String,
        /// One cause per node that was tried, in order.
        suppressed: Vec<Error>,
    },

    /// The attempt or time budget of a dispatched call ran out.
    #[error("{message} (last node: {}): {source}", display_node(.last_node))]
    AttemptsExhausted {
        /// Which budget ran out.
        message: String,
        /// The node targeted by the final attempt.
        last_node: Option<NodeKey>,
        /// The most recent cause.
        source: Box<Error>,
        /// Every earlier cause, oldest first.
        suppressed: Vec<Error>,
    },

    /// A broadcast failed on some nodes or got differing replies.
    #[error("{message}")]
    Broadcast {
        /// Summary of the failure.
        message: String,
        /// Per-node failures.
        errors: Vec<(NodeKey, Error)>,
    },
}

fn display_node(node: &Option<NodeKey>) -> String {
    node.as_ref()
        .map_or_else(|| "none".to_string(), |n| n.to_string())
}

impl Error {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Causes carried alongside the primary error, oldest first.
    ///
    /// Empty for every variant other than `TopologyUnavailable` and
    /// `AttemptsExhausted`.
    pub fn suppressed(&self) -> &[Error] {
        match self {
            Error::TopologyUnavailable { suppressed, .. }
            | Error::AttemptsExhausted { suppressed, .. } => suppressed,
            _ => &[],
        }
    }

    /// Returns true when the connection that produced this error can no longer
    /// be trusted and should be discarded instead of returned to its pool.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::Io { .. } | Error::Timeout { .. } | Error::Protocol { .. } | Error::PoolClosed { .. }
        )
    }

    /// Returns true for MOVED and ASK redirects.
    pub fn is_redirect(&self) -> bool {
        matches!(self, Error::Moved { .. } | Error::Ask { .. })
    }

    /// Returns true for TRYAGAIN and CLUSTERDOWN replies.
    pub fn is_cluster_busy(&self) -> bool {
        matches!(self, Error::TryAgain { .. } | Error::ClusterDown { .. })
    }
}
