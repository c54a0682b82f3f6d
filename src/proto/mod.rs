//! RESP (Redis Serialization Protocol) framing.
//!
//! ## Modules
//!
//! - [`codec`] - Encoder and decoder for RESP2 frames
//! - [`frame`] - Frame types representing RESP data structures

pub mod codec;
pub mod frame;

pub use frame::Frame;
