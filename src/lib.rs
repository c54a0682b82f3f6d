//! # Slotmux
//!
//! Async Redis Cluster client core: a shared slot topology cache and a
//! redirect-aware dispatcher on top of per-node connection pools.
//!
//! Keys map to one of 16384 hash slots. The client learns which node owns each
//! slot from `CLUSTER SLOTS`, routes every call there, follows `MOVED` and `ASK`
//! redirects, refreshes the topology after repeated failures and gives up once
//! its attempt or time budget is spent.
//!
//! ## Features
//!
//! - `test-utils` - In-memory cluster doubles in [`testing`]
//!
//! ## Example
//!
//! ```no_run
//! use slotmux::ClusterClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClusterClient::connect("redis://127.0.0.1:7000,127.0.0.1:7001").await?;
//!     client.set("{user1000}.name", "alice").await?;
//!     let name = client.get("{user1000}.name").await?;
//!     println!("{name:?}");
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod cluster;
pub mod core;
pub mod proto;

mod error;

#[cfg(test)]
mod stress;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Re-export high-level client types for convenience
pub use crate::cluster::{key_slot, ClusterClient, ClusterConfig, Route};
pub use crate::core::builder::ClusterClientBuilder;
pub use crate::core::command::{Cmd, Operation};
pub use crate::error::{Error, Result};
