//! `NodeKey`: the 12-byte `(version, sequence)` identity of a persisted node.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Identity of a node once it has been assigned during `SaveVersion`.
/// `sequence == 1` always identifies the root for its version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub version: u64,
    pub sequence: u32,
}

impl NodeKey {
    pub const ENCODED_LEN: usize = 12;

    pub fn new(version: u64, sequence: u32) -> Self {
        Self { version, sequence }
    }

    /// The root key for `version`.
    pub fn root(version: u64) -> Self {
        Self { version, sequence: 1 }
    }

    pub fn is_root(&self) -> bool {
        self.sequence == 1
    }

    /// Serializes to the canonical 12-byte big-endian form:
    /// `version:u64 | sequence:u32`.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.version.to_be_bytes());
        out[8..].copy_from_slice(&self.sequence.to_be_bytes());
        out
    }

    /// Parses a 12-byte big-endian `(version, sequence)` pair.
    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() != Self::ENCODED_LEN {
            return Err(Error::Corruption(format!(
                "node key must be {} bytes, got {}",
                Self::ENCODED_LEN,
                b.len()
            )));
        }
        let mut version_bytes = [0u8; 8];
        version_bytes.copy_from_slice(&b[..8]);
        let mut sequence_bytes = [0u8; 4];
        sequence_bytes.copy_from_slice(&b[8..]);
        Ok(Self {
            version: u64::from_be_bytes(version_bytes),
            sequence: u32::from_be_bytes(sequence_bytes),
        })
    }
}

impl std::fmt::Display for NodeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.version, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let nk = NodeKey::new(42, 7);
        let bytes = nk.to_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(NodeKey::from_bytes(&bytes).unwrap(), nk);
    }

    #[test]
    fn root_key_has_sequence_one() {
        let nk = NodeKey::root(5);
        assert!(nk.is_root());
        assert_eq!(nk.sequence, 1);
    }

    #[test]
    fn big_endian_ordering_preserves_version_order() {
        let a = NodeKey::new(1, u32::MAX).to_bytes();
        let b = NodeKey::new(2, 0).to_bytes();
        assert!(a < b);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(NodeKey::from_bytes(&[0u8; 11]).is_err());
        assert!(NodeKey::from_bytes(&[0u8; 13]).is_err());
    }
}
