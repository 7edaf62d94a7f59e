//! Node data record, hash computation, and the canonical wire encoding.
//!
//! Hash pre-image and serialized layout are bit-exact with the reference
//! implementation (see spec §4.2) — this is a hard requirement, not a style
//! choice. Any change here changes every root hash this crate produces.

use crate::node_key::NodeKey;
use crate::varint::{decode_bytes, decode_varint, encode_bytes, encode_varint};
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};

/// A child reference as stored on an inner [`Node`]: either not yet faulted
/// into the pool (known only by its persistent key) or resident in a pool
/// frame. Kept as a sum type, per the design notes, so a ghost child can
/// never be confused with "no child" the way a bare `Option` would allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildRef {
    /// Not loaded; identified by its persistent key.
    Ghost(ChildKey),
    /// Loaded into the buffer pool at this frame id.
    Resident(usize),
}

/// The persistent identity of a child, as encoded on disk. Almost always
/// [`ChildKey::Modern`]; [`ChildKey::Legacy`] exists only so this crate can
/// decode the legacy 32-byte-hash child form without losing information,
/// per the `mode` bits in §4.2's serialized layout. This crate never emits
/// `Legacy` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKey {
    Modern(NodeKey),
    Legacy([u8; 32]),
}

/// `mode` bit for "left child uses the legacy 32-byte-hash form".
const MODE_LEGACY_LEFT: i64 = 0x01;
/// `mode` bit for "right child uses the legacy 32-byte-hash form".
const MODE_LEGACY_RIGHT: i64 = 0x02;

/// A node in the tree. Leaves have `subtree_height == 0`, no children, and a
/// non-null `value`; inner nodes have exactly two children and an empty
/// `value`.
#[derive(Debug, Clone)]
pub struct Node {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub hash: Option<[u8; 32]>,
    pub node_key: Option<NodeKey>,
    pub left: Option<ChildRef>,
    pub right: Option<ChildRef>,
    pub size: i64,
    pub subtree_height: i8,
    /// The version at which this node was created (part of the hash pre-image).
    pub version: u64,

    // --- buffer pool metadata (§4.4) ---
    pub frame_id: usize,
    pub use_bit: bool,
    pub dirty: bool,
    pub overflow: bool,
}

impl Node {
    /// Builds a new working leaf. `hash`/`node_key` are unset until `SaveVersion`.
    pub fn new_leaf(key: Vec<u8>, value: Vec<u8>, version: u64) -> Self {
        Self {
            key,
            value,
            hash: None,
            node_key: None,
            left: None,
            right: None,
            size: 1,
            subtree_height: 0,
            version,
            frame_id: usize::MAX,
            use_bit: false,
            dirty: false,
            overflow: false,
        }
    }

    /// Builds a new working inner node. Caller must set `size`/`subtree_height`.
    pub fn new_inner(
        key: Vec<u8>,
        left: ChildRef,
        right: ChildRef,
        size: i64,
        subtree_height: i8,
        version: u64,
    ) -> Self {
        Self {
            key,
            value: Vec::new(),
            hash: None,
            node_key: None,
            left: Some(left),
            right: Some(right),
            size,
            subtree_height,
            version,
            frame_id: usize::MAX,
            use_bit: false,
            dirty: false,
            overflow: false,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.subtree_height == 0
    }

    #[inline]
    pub fn is_working(&self) -> bool {
        self.hash.is_none()
    }

    /// Computes `SHA256("")`, the canonical empty-tree root hash.
    pub fn empty_hash() -> [u8; 32] {
        let digest = Sha256::digest([]);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }

    /// Computes and caches the leaf hash pre-image per §4.2 step 4.
    pub fn hash_leaf(&mut self) -> [u8; 32] {
        debug_assert!(self.is_leaf());
        let value_hash = Sha256::digest(&self.value);
        let mut preimage = Vec::with_capacity(16 + self.key.len() + 32);
        encode_varint(&mut preimage, self.subtree_height as i64);
        encode_varint(&mut preimage, self.size);
        encode_varint(&mut preimage, self.version as i64);
        encode_bytes(&mut preimage, &self.key);
        encode_bytes(&mut preimage, &value_hash);
        let digest = Sha256::digest(&preimage);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        self.hash = Some(out);
        out
    }

    /// Computes and caches the inner-node hash pre-image per §4.2 step 5.
    /// `left_hash`/`right_hash` must already be computed by the caller
    /// (post-order traversal guarantees this).
    pub fn hash_inner(&mut self, left_hash: [u8; 32], right_hash: [u8; 32]) -> [u8; 32] {
        debug_assert!(!self.is_leaf());
        let mut preimage = Vec::with_capacity(16 + 2 * (1 + 32));
        encode_varint(&mut preimage, self.subtree_height as i64);
        encode_varint(&mut preimage, self.size);
        encode_varint(&mut preimage, self.version as i64);
        encode_bytes(&mut preimage, &left_hash);
        encode_bytes(&mut preimage, &right_hash);
        let digest = Sha256::digest(&preimage);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        self.hash = Some(out);
        out
    }

    /// Serializes an identified leaf to its on-disk form (§4.2).
    pub fn encode_leaf(&self) -> Result<Vec<u8>> {
        debug_assert!(self.is_leaf());
        if self.hash.is_none() {
            return Err(Error::Corruption("cannot encode a working node".into()));
        }
        let mut buf = Vec::new();
        encode_varint(&mut buf, self.subtree_height as i64);
        encode_varint(&mut buf, self.size);
        encode_bytes(&mut buf, &self.key);
        encode_bytes(&mut buf, &self.value);
        Ok(buf)
    }

    /// Serializes an identified inner node to its on-disk form (§4.2), given
    /// its children's persistent keys. Always writes the modern
    /// `(version, sequence)` child-key form; this crate never emits the
    /// legacy 32-byte-hash form, though [`Node::decode`] can read it.
    pub fn encode_inner(&self, left_key: NodeKey, right_key: NodeKey) -> Result<Vec<u8>> {
        debug_assert!(!self.is_leaf());
        let hash = self
            .hash
            .ok_or_else(|| Error::Corruption("cannot encode a working node".into()))?;
        let mut buf = Vec::new();
        encode_varint(&mut buf, self.subtree_height as i64);
        encode_varint(&mut buf, self.size);
        encode_bytes(&mut buf, &self.key);
        encode_bytes(&mut buf, &hash);
        encode_varint(&mut buf, 0); // mode: both children in modern form
        encode_child_key(&mut buf, ChildKey::Modern(left_key));
        encode_child_key(&mut buf, ChildKey::Modern(right_key));
        Ok(buf)
    }

    /// Serializes a node whose children are both identified `Ghost`
    /// references, dispatching to [`Node::encode_leaf`] or
    /// [`Node::encode_inner`] as appropriate. `Tree::finalize_node` calls the
    /// two specific encoders directly since it already has the children's
    /// keys to hand; this is the convenience path for callers that don't.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.is_leaf() {
            self.encode_leaf()
        } else {
            let left_key = expect_modern(child_key_of(self.left.as_ref())?)?;
            let right_key = expect_modern(child_key_of(self.right.as_ref())?)?;
            self.encode_inner(left_key, right_key)
        }
    }

    /// Decodes a node previously written by [`Node::encode`], given the
    /// [`NodeKey`] it was stored under (leaves don't self-describe height;
    /// a leaf's `version` and resident `node_key` are supplied from context).
    pub fn decode(node_key: NodeKey, version: u64, buf: &[u8]) -> Result<Self> {
        let (height, n) = decode_varint(buf)?;
        let buf = &buf[n..];
        let height: i8 = height
            .try_into()
            .map_err(|_| Error::Corruption("height out of i8 range".into()))?;

        let (size, n) = decode_varint(buf)?;
        let buf = &buf[n..];

        let (key, n) = decode_bytes(buf)?;
        let key = key.to_vec();
        let buf = &buf[n..];

        if height == 0 {
            let (value, _) = decode_bytes(buf)?;
            let mut node = Node::new_leaf(key, value.to_vec(), version);
            node.size = size;
            node.node_key = Some(node_key);
            node.hash_leaf();
            return Ok(node);
        }

        let (hash, n) = decode_bytes(buf)?;
        if hash.len() != 32 {
            return Err(Error::Corruption("node hash must be 32 bytes".into()));
        }
        let mut hash_arr = [0u8; 32];
        hash_arr.copy_from_slice(hash);
        let buf = &buf[n..];

        let (mode, n) = decode_varint(buf)?;
        if !(0..=3).contains(&mode) {
            return Err(Error::Corruption(format!("invalid mode {mode}")));
        }
        let buf = &buf[n..];

        let (left_key, consumed) = decode_child_key(buf, mode & MODE_LEGACY_LEFT != 0)?;
        let buf = &buf[consumed..];
        let (right_key, _) = decode_child_key(buf, mode & MODE_LEGACY_RIGHT != 0)?;

        let mut node = Node::new_inner(
            key,
            ChildRef::Ghost(left_key),
            ChildRef::Ghost(right_key),
            size,
            height,
            version,
        );
        node.node_key = Some(node_key);
        node.hash = Some(hash_arr);
        Ok(node)
    }
}

fn child_key_of(child: Option<&ChildRef>) -> Result<ChildKey> {
    match child {
        Some(ChildRef::Ghost(k)) => Ok(*k),
        Some(ChildRef::Resident(_)) => Err(Error::Corruption(
            "cannot encode a node whose children are not yet identified".into(),
        )),
        None => Err(Error::Corruption("inner node missing child".into())),
    }
}

fn expect_modern(key: ChildKey) -> Result<NodeKey> {
    match key {
        ChildKey::Modern(nk) => Ok(nk),
        ChildKey::Legacy(_) => Err(Error::Corruption(
            "cannot encode a legacy-form child key".into(),
        )),
    }
}

fn encode_child_key(buf: &mut Vec<u8>, key: ChildKey) {
    match key {
        ChildKey::Modern(nk) => {
            encode_varint(buf, nk.version as i64);
            encode_varint(buf, nk.sequence as i64);
        }
        ChildKey::Legacy(hash) => {
            encode_bytes(buf, &hash);
        }
    }
}

fn decode_child_key(buf: &[u8], legacy: bool) -> Result<(ChildKey, usize)> {
    if legacy {
        let (hash, n) = decode_bytes(buf)?;
        if hash.len() != 32 {
            return Err(Error::Corruption("legacy child hash must be 32 bytes".into()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(hash);
        Ok((ChildKey::Legacy(arr), n))
    } else {
        let (version, n1) = decode_varint(buf)?;
        let (sequence, n2) = decode_varint(&buf[n1..])?;
        let sequence: u32 = sequence
            .try_into()
            .map_err(|_| Error::Corruption("child sequence out of u32 range".into()))?;
        Ok((
            ChildKey::Modern(NodeKey::new(version as u64, sequence)),
            n1 + n2,
        ))
    }
}
