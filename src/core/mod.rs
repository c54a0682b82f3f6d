//! # Core
//!
//! Connection handling and command construction shared by the cluster layer.
//!
//! ## Modules
//!
//! - [`connection`] - The `Connection` trait and its TCP implementation
//! - [`command`] - Command builders, the `Operation` trait and reply helpers
//! - [`builder`] - Cluster client builder
//!

/// Cluster client builder.
pub mod builder;
/// Command construction helpers.
pub mod command;
/// Low-level connection management.
pub mod connection;
