//! Redis Cluster command builders.
//!
//! Builders for the cluster management commands used for topology discovery,
//! redirect handling and replica reads.

use crate::core::command::Cmd;

/// Creates a CLUSTER SLOTS command.
///
/// Returns information about which cluster slots are mapped to which Redis instances.
/// This is the primary method for discovering cluster topology.
///
/// # Response Format
///
/// An array of `[start, end, primary, replica...]` entries, where each node
/// is `[host, port, id, ...]`.
pub fn cluster_slots() -> Cmd {
    Cmd::new("CLUSTER").arg("SLOTS")
}

/// Creates an ASKING command.
///
/// Sent before retrying a command that received an ASK redirect. ASKING is a
/// one-time flag: it only affects the immediately following command.
pub fn asking() -> Cmd {
    Cmd::new("ASKING")
}

/// Creates a READONLY command, enabling reads on a replica connection.
pub fn readonly() -> Cmd {
    Cmd::new("READONLY")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Frame;

    #[test]
    fn test_cluster_slots_cmd() {
        assert_eq!(
            cluster_slots().into_frame(),
            Frame::Array(vec![Frame::bulk("CLUSTER"), Frame::bulk("SLOTS")])
        );
    }

    #[test]
    fn test_asking_and_readonly_cmd() {
        assert_eq!(asking().into_frame(), Frame::Array(vec![Frame::bulk("ASKING")]));
        assert_eq!(
            readonly().into_frame(),
            Frame::Array(vec![Frame::bulk("READONLY")])
        );
    }
}
