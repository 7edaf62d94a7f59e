//! The record of one version's mutations, as written to the WAL and later
//! drained into the commitment store (§4.6).
//!
//! Grounded on the reference's `StateDiff` (`wal.rs`), adapted from
//! content-hash identity to this crate's `NodeKey` identity.

use crate::node_key::NodeKey;
use serde::{Deserialize, Serialize};

/// Everything `SaveVersion` produced for one version: nodes newly assigned a
/// key, and nodes orphaned (no longer reachable from the new root).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub version: u64,
    pub root_key: Option<NodeKey>,
    /// Newly persisted nodes, already in their encoded wire form.
    pub puts: Vec<(NodeKey, Vec<u8>)>,
    /// Nodes that became unreachable from `root_key` and may be deleted.
    pub orphans: Vec<NodeKey>,
}

impl ChangeSet {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            root_key: None,
            puts: Vec::new(),
            orphans: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.orphans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_changeset_reports_empty() {
        assert!(ChangeSet::new(1).is_empty());
    }

    #[test]
    fn changeset_with_puts_is_not_empty() {
        let mut cs = ChangeSet::new(1);
        cs.puts.push((NodeKey::new(1, 1), vec![1]));
        assert!(!cs.is_empty());
    }
}
