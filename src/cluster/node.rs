//! Node identity types.
//!
//! A [`NodeKey`] is the normalized `host:port` address used to key pools and
//! topology entries. A [`Node`] adds the role and server-assigned id learned
//! during discovery.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use url::Url;

use crate::error::{Error, Result};

/// Port used when an address does not name one.
pub const DEFAULT_PORT: u16 = 6379;

/// Normalized `host:port` identity of a cluster node.
///
/// Normalization strips a `redis://` or `rediss://` scheme, lowercases the host,
/// keeps IPv6 literals bracketed and fills in [`DEFAULT_PORT`]. Clones are cheap.
///
/// # Examples
///
/// ```
/// use slotmux::cluster::NodeKey;
///
/// let key = NodeKey::parse("redis://Redis-A.local").unwrap();
/// assert_eq!(key.as_str(), "redis-a.local:6379");
/// assert_eq!(NodeKey::parse("::1:7000").unwrap().as_str(), "[::1]:7000");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(Arc<str>);

impl NodeKey {
    /// Parses and normalizes an address.
    ///
    /// Accepts `host`, `host:port`, `[v6]:port`, bare `v6:port` as printed by
    /// `MOVED` replies, and `redis://` / `rediss://` URLs.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for an empty host, a bad port or an
    /// unsupported scheme.
    pub fn parse(address: &str) -> Result<Self> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("node address is empty"));
        }

        // Unbracketed IPv6 literal with a trailing port, e.g. "2001:db8::1:6379".
        if !trimmed.contains("://") && !trimmed.starts_with('[') && trimmed.matches(':').count() > 1 {
            let (host, port) = trimmed
                .rsplit_once(':')
                .ok_or_else(|| Error::validation(format!("invalid node address {trimmed:?}")))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::validation(format!("invalid port in node address {trimmed:?}")))?;
            return Self::from_host_port(host, port);
        }

        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("redis://{trimmed}")
        };

        let url = Url::parse(&with_scheme)
            .map_err(|e| Error::validation(format!("invalid node address {trimmed:?}: {e}")))?;

        match url.scheme() {
            "redis" | "rediss" => {}
            other => {
                return Err(Error::validation(format!(
                    "unsupported scheme {other:?} in node address {trimmed:?}"
                )))
            }
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::validation(format!("node address {trimmed:?} has no host")))?;

        Self::from_host_port(host, url.port().unwrap_or(DEFAULT_PORT))
    }

    /// Builds a key from a host and port as reported by `CLUSTER SLOTS`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the host is empty.
    pub fn from_host_port(host: &str, port: u16) -> Result<Self> {
        let host = host.trim();
        if host.is_empty() {
            return Err(Error::validation("node host is empty"));
        }

        let host = host.to_ascii_lowercase();
        let key = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Ok(Self(key.into()))
    }

    /// Returns the normalized `host:port` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the host part, with brackets for IPv6 literals.
    pub fn host(&self) -> &str {
        self.0.rsplit_once(':').map_or(&self.0, |(host, _)| host)
    }

    /// Returns the port part.
    pub fn port(&self) -> u16 {
        self.0
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for NodeKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique identifier for a Redis node in the cluster.
///
/// Node IDs are 40-character hex strings assigned by Redis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a new NodeId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the node ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Role a node plays for the slots it appears in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Owns slots and accepts writes.
    Primary,
    /// Read-only copy of a primary.
    Replica,
}

/// A node learned from discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Normalized address, after translation.
    pub key: NodeKey,
    /// Role in the current snapshot.
    pub role: Role,
    /// Server-assigned id, or the address when the server did not report one.
    pub id: NodeId,
}

impl Node {
    /// Returns true for primaries.
    pub fn is_primary(&self) -> bool {
        self.role == Role::Primary
    }

    /// Returns true for replicas.
    pub fn is_replica(&self) -> bool {
        self.role == Role::Replica
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let key = NodeKey::parse("127.0.0.1:7000").unwrap();
        assert_eq!(key.as_str(), "127.0.0.1:7000");
        assert_eq!(key.host(), "127.0.0.1");
        assert_eq!(key.port(), 7000);
    }

    #[test]
    fn test_parse_default_port() {
        let key = NodeKey::parse("localhost").unwrap();
        assert_eq!(key.as_str(), "localhost:6379");
        assert_eq!(key.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_parse_strips_scheme_and_lowercases() {
        let a = NodeKey::parse("redis://Redis-A.Example.com:7001").unwrap();
        let b = NodeKey::parse("redis-a.example.com:7001").unwrap();
        assert_eq!(a, b);
        assert_eq!(
            NodeKey::parse("rediss://node:7002").unwrap().as_str(),
            "node:7002"
        );
    }

    #[test]
    fn test_parse_ipv6() {
        assert_eq!(NodeKey::parse("[::1]:7000").unwrap().as_str(), "[::1]:7000");
        assert_eq!(NodeKey::parse("[::1]").unwrap().as_str(), "[::1]:6379");
        assert_eq!(
            NodeKey::parse("2001:db8::1:6380").unwrap().as_str(),
            "[2001:db8::1]:6380"
        );
        let key = NodeKey::parse("[::1]:7000").unwrap();
        assert_eq!(key.host(), "[::1]");
        assert_eq!(key.port(), 7000);
    }

    #[test]
    fn test_from_host_port() {
        assert_eq!(
            NodeKey::from_host_port("10.0.0.5", 7000).unwrap().as_str(),
            "10.0.0.5:7000"
        );
        assert_eq!(
            NodeKey::from_host_port("fe80::1", 7000).unwrap().as_str(),
            "[fe80::1]:7000"
        );
        assert!(NodeKey::from_host_port("", 7000).is_err());
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(matches!(NodeKey::parse(""), Err(Error::Validation { .. })));
        assert!(matches!(
            NodeKey::parse("localhost:99999"),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            NodeKey::parse("localhost:abc"),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            NodeKey::parse("http://localhost:6379"),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            NodeKey::parse("redis://:6379"),
            Err(Error::Validation { .. })
        ));
    }

    #[test]
    fn test_from_str() {
        let key: NodeKey = "node-1:7000".parse().unwrap();
        assert_eq!(key.to_string(), "node-1:7000");
    }

    #[test]
    fn test_node_roles() {
        let node = Node {
            key: NodeKey::parse("127.0.0.1:7000").unwrap(),
            role: Role::Primary,
            id: NodeId::new("abc"),
        };
        assert!(node.is_primary());
        assert!(!node.is_replica());
        assert_eq!(node.id.as_str(), "abc");
    }
}
