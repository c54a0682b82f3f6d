//! Parsing utilities for Redis Cluster error responses.
//!
//! Redis Cluster uses special error responses for redirects and transient
//! unavailability:
//! - `MOVED <slot> <host>:<port>` - Permanent redirect
//! - `ASK <slot> <host>:<port>` - Temporary redirect during migration
//! - `TRYAGAIN ...` - Multi-key request during resharding
//! - `CLUSTERDOWN ...` - Cluster is unavailable

use crate::cluster::slot::SLOT_COUNT;
use crate::Error;

/// Parses a Redis error message and converts cluster replies to typed errors.
///
/// # Arguments
///
/// * `error_msg` - The error line from Redis without the leading `-`
///   (e.g., b"MOVED 3999 127.0.0.1:7000")
///
/// # Returns
///
/// - `Error::Moved` for MOVED redirects
/// - `Error::Ask` for ASK redirects
/// - `Error::TryAgain` for TRYAGAIN errors
/// - `Error::ClusterDown` for CLUSTERDOWN errors
/// - `Error::CrossSlot` for CROSSSLOT errors
/// - `Error::Server` for everything else
///
/// # Examples
///
/// ```
/// use slotmux::cluster::parse_redis_error;
/// use slotmux::Error;
///
/// let err = parse_redis_error(b"MOVED 3999 127.0.0.1:7001");
/// assert!(matches!(err, Error::Moved { slot: 3999, .. }));
/// ```
pub fn parse_redis_error(error_msg: &[u8]) -> Error {
    let msg = String::from_utf8_lossy(error_msg);
    let msg = msg.trim();

    if let Some(stripped) = msg.strip_prefix("MOVED ") {
        if let Some((slot, address)) = parse_redirect(stripped) {
            return Error::Moved { slot, address };
        }
    }

    if let Some(stripped) = msg.strip_prefix("ASK ") {
        if let Some((slot, address)) = parse_redirect(stripped) {
            return Error::Ask { slot, address };
        }
    }

    if let Some(rest) = msg.strip_prefix("TRYAGAIN") {
        return Error::TryAgain {
            message: rest.trim().to_string(),
        };
    }

    if let Some(rest) = msg.strip_prefix("CLUSTERDOWN") {
        return Error::ClusterDown {
            message: rest.trim().to_string(),
        };
    }

    if msg.starts_with("CROSSSLOT") {
        return Error::CrossSlot;
    }

    Error::Server {
        message: msg.to_string(),
    }
}

/// Parses redirect arguments: "<slot> <host>:<port>"
///
/// # Returns
///
/// Some((slot, address)) if parsing succeeds and the slot is in range, None otherwise
fn parse_redirect(args: &str) -> Option<(u16, String)> {
    let mut parts = args.split_whitespace();
    let slot: u16 = parts.next()?.parse().ok()?;
    let address = parts.next()?.to_string();
    if parts.next().is_some() || slot >= SLOT_COUNT {
        return None;
    }

    Some((slot, address))
}
