//! # Cluster
//!
//! Redis Cluster support with automatic slot-based routing, topology discovery,
//! and redirect handling (MOVED/ASK).
//!
//! ## Features
//!
//! - **Slot-based routing**: Automatically routes commands to correct nodes
//! - **Topology discovery**: Uses CLUSTER SLOTS to map slots to nodes
//! - **Redirect handling**: Handles MOVED and ASK redirects transparently
//! - **Connection pooling**: One pool per node, shared by all its slots
//! - **Hash tags**: Supports Redis hash tags `{...}` for multi-key operations
//!
//! ## Layers
//!
//! - [`slot`] - Key to slot hashing and per-slot grouping
//! - [`NodeRegistry`] - Per-node pools and address translation
//! - [`SlotTopology`] - The slot map snapshot, discovery and refresh
//! - [`Dispatcher`] - Retry and redirect state machine
//! - [`ClusterClient`] - The facade tying them together

mod client;
pub mod commands;
mod config;
mod dispatcher;
mod errors;
mod node;
pub mod pool;
mod registry;
pub mod slot;
mod topology;

pub use client::ClusterClient;
pub use config::{ClusterConfig, StalePoolPolicy, DEFAULT_MAX_ATTEMPTS};
pub use dispatcher::{Dispatcher, Route};
pub use errors::parse_redis_error;
pub use node::{Node, NodeId, NodeKey, Role, DEFAULT_PORT};
pub use pool::{Pool, PoolConfig, PoolFactory, TcpPool, TcpPoolFactory};
pub use registry::{AddressTranslator, NodeRegistry};
pub use slot::{
    ensure_same_slot, group_by_hash_slot, group_by_key_value_hash_slot, key_slot, SLOT_COUNT,
};
pub use topology::{parse_cluster_slots, ReportedNode, SlotMap, SlotRange, SlotTopology};
