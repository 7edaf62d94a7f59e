//! `cowavl`: a versioned, authenticated key-value store built on a
//! copy-on-write AVL-balanced Merkle tree.
//!
//! Writes accumulate against a working tree (see [`tree::Tree`]); calling
//! [`tree::Tree::save_version`] seals the current edits into an immutable,
//! content-addressed version with its own root hash, sharing every untouched
//! subtree with the versions before it. The root hash after applying a given
//! sequence of edits is bit-identical to the canonical IAVL reference
//! implementation this crate's node encoding and hashing are grounded on.
//!
//! The three subsystems mirror the reference's own layering: [`tree`] is the
//! mutable AVL+ structure itself, [`pool`] is the bounded buffer pool that
//! keeps its working set off the heap once it outgrows memory, and [`cache`]
//! plus [`wal`] durably log and checkpoint committed versions into a
//! [`store::CommitmentStore`].

mod cache;
mod changeset;
mod config;
mod error;
mod metrics;
mod node;
mod node_key;
mod pool;
mod store;
mod tree;
mod varint;
mod wal;

pub use cache::DeferredCache;
pub use changeset::ChangeSet;
pub use config::{TreeConfig, TreeConfigBuilder};
pub use error::{Error, ErrorCode, Result};
pub use metrics::{metrics, set_sink, MetricsSink, NopSink};
pub use node::{ChildKey, ChildRef, Node};
pub use node_key::NodeKey;
pub use pool::BufferPool;
pub use store::{CommitmentStore, MemoryStore, RedbStore};
pub use tree::Tree;
pub use wal::{RecordRef, WalReader, WalWriter};
