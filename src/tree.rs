//! The mutable CoW AVL+ tree: `Set`/`Remove`/`Get`/`SaveVersion` (§4.3).
//!
//! Grounded on the reference's root `tree.go` (`set`/`remove`/`rebalance`/
//! `rotateLeft`/`rotateRight`/`FadeNode`) for the shape of the copy-on-write
//! edit and rebalance, and on `v3/tree.go`'s `recursiveSet`/`recursiveRemove`
//! for the `newKey` propagation on collapse (a removal that empties one side
//! of an inner node promotes the other side, and threads the vacated split
//! key up through right-descent ancestors only — `v3/tree.go`'s own comment
//! calls this "new leftmost leaf key for tree after successfully removing
//! 'key' if changed").
//!
//! Every node this module creates during an edit is a *working* node
//! (`hash == None`, `node_key == None`) until `save_version` identifies it.
//! Nodes are addressed throughout by buffer-pool frame id, not by pointer;
//! an untouched child stays a [`ChildRef::Ghost`] for as long as nothing
//! needs to read it, so a removal that only restructures one side of the
//! tree never faults in the other.

use crate::cache::DeferredCache;
use crate::changeset::ChangeSet;
use crate::config::TreeConfig;
use crate::error::{Error, Result};
use crate::node::{ChildKey, ChildRef, Node};
use crate::node_key::NodeKey;
use crate::pool::BufferPool;
use crate::store::CommitmentStore;
use crate::wal::WalWriter;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// A versioned, authenticated key-value store backed by a CoW AVL+ Merkle
/// tree (§1, §4.3). One `Tree` owns one buffer pool and one deferred write
/// cache; it is not `Sync` by design — see §5, foreground operations are
/// single-threaded from the caller's perspective.
pub struct Tree {
    pool: BufferPool,
    cache: Arc<DeferredCache>,
    config: TreeConfig,
    root: Option<usize>,
    version: u64,
    pending_orphans: Vec<NodeKey>,
}

/// Outcome of descending into a subtree to remove a key, threading the
/// `v3/tree.go` `newKey` propagation (§4.3) through the recursion without
/// eagerly resolving untouched siblings.
enum RemoveOutcome {
    NotFound,
    Removed {
        new_subroot: Option<ChildRef>,
        new_key: Option<Vec<u8>>,
        value: Vec<u8>,
    },
}

impl Tree {
    /// Opens a fresh, empty tree (version 0) backed by `store` for
    /// persisted nodes and a WAL rooted at `wal_path`.
    pub fn new(
        config: TreeConfig,
        store: Arc<dyn CommitmentStore>,
        wal_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let wal = Arc::new(WalWriter::open(wal_path)?);
        let cache = DeferredCache::new(
            store,
            wal,
            config.checkpoint_interval,
            config.async_checkpoint,
        );
        Ok(Self {
            pool: BufferPool::new(config.pool_capacity),
            cache,
            config,
            root: None,
            version: 0,
            pending_orphans: Vec::new(),
        })
    }

    /// Re-opens the tree at an already-committed version, faulting its root
    /// in from the commitment store on first access. Replaying the WAL
    /// itself into working-tree state is an external-collaborator concern
    /// (§1's change-set iterator) layered above this core.
    pub fn load_version(&mut self, version: u64) -> Result<()> {
        let root_key = NodeKey::root(version);
        let fid = self.resolve(ChildRef::Ghost(ChildKey::Modern(root_key)))?;
        self.root = Some(fid);
        self.version = version;
        Ok(())
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Synchronously drains the deferred cache's hot generation into the
    /// commitment store, used during shutdown (§4.6).
    pub fn checkpoint(&mut self) -> Result<()> {
        self.cache.checkpoint()?;
        self.sync_pool_with_checkpoints()
    }

    /// Reconciles buffer-pool residents against everything the checkpointer
    /// (foreground or background) has durably flushed since the last call:
    /// resident arena frames are marked clean and become evictable again;
    /// resident overflow frames are detached (§4.4's `FlushNode`). Run at
    /// the start of `save_version` so a long-running tree's pool doesn't
    /// silently fill up with nodes that were already persisted pages ago.
    fn sync_pool_with_checkpoints(&mut self) -> Result<()> {
        for key in self.cache.take_completed() {
            self.pool.mark_clean_by_key(key)?;
        }
        Ok(())
    }

    pub fn size(&mut self) -> Result<i64> {
        match self.root {
            None => Ok(0),
            Some(fid) => Ok(self.pool.get(fid)?.size),
        }
    }

    pub fn height(&mut self) -> Result<i8> {
        match self.root {
            None => Ok(0),
            Some(fid) => Ok(self.pool.get(fid)?.subtree_height),
        }
    }

    /// Returns `SHA256("")` for an empty tree, otherwise the root's cached
    /// hash as of the most recent `save_version` (§4.3).
    pub fn root_hash(&mut self) -> Result<[u8; 32]> {
        match self.root {
            None => Ok(Node::empty_hash()),
            Some(fid) => self
                .pool
                .get(fid)?
                .hash
                .ok_or_else(|| Error::Corruption("root has no hash; call save_version first".into())),
        }
    }

    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(root_fid) = self.root else {
            return Ok(None);
        };
        self.get_recursive(root_fid, key)
    }

    fn get_recursive(&mut self, frame_id: usize, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let (is_leaf, node_key, left, right) = {
            let n = self.pool.get(frame_id)?;
            (n.is_leaf(), n.key.clone(), n.left, n.right)
        };
        if is_leaf {
            if key == node_key.as_slice() {
                Ok(Some(self.pool.get(frame_id)?.value.clone()))
            } else {
                Ok(None)
            }
        } else if key < node_key.as_slice() {
            let lfid = self.resolve(left.expect("inner node missing left child"))?;
            self.get_recursive(lfid, key)
        } else {
            let rfid = self.resolve(right.expect("inner node missing right child"))?;
            self.get_recursive(rfid, key)
        }
    }

    /// Applies `Set(key, value)`, returning `true` iff `key` already existed
    /// (§4.3). The new node(s) are stamped with the version this edit would
    /// save at, not the tree's last-saved version.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<bool> {
        if value.is_empty() {
            return Err(Error::InvalidArgument("value must not be empty".into()));
        }
        let version = self.pending_version();
        match self.root {
            None => {
                let leaf = Node::new_leaf(key, value, version);
                let fid = self.pool.put(leaf)?;
                self.root = Some(fid);
                Ok(false)
            }
            Some(root_fid) => {
                let (new_root, updated) = self.set_recursive(root_fid, &key, &value, version)?;
                self.root = Some(new_root);
                Ok(updated)
            }
        }
    }

    fn set_recursive(
        &mut self,
        frame_id: usize,
        key: &[u8],
        value: &[u8],
        version: u64,
    ) -> Result<(usize, bool)> {
        let (is_leaf, node_key) = {
            let n = self.pool.get(frame_id)?;
            (n.is_leaf(), n.key.clone())
        };

        if is_leaf {
            use std::cmp::Ordering::*;
            return match key.cmp(node_key.as_slice()) {
                Equal => {
                    self.orphan(frame_id)?;
                    let leaf = Node::new_leaf(key.to_vec(), value.to_vec(), version);
                    let fid = self.pool.put(leaf)?;
                    Ok((fid, true))
                }
                Less => {
                    let new_leaf = Node::new_leaf(key.to_vec(), value.to_vec(), version);
                    let new_fid = self.pool.put(new_leaf)?;
                    let inner = Node::new_inner(
                        node_key,
                        ChildRef::Resident(new_fid),
                        ChildRef::Resident(frame_id),
                        2,
                        1,
                        version,
                    );
                    let fid = self.pool.put(inner)?;
                    Ok((fid, false))
                }
                Greater => {
                    let new_leaf = Node::new_leaf(key.to_vec(), value.to_vec(), version);
                    let new_fid = self.pool.put(new_leaf)?;
                    let inner = Node::new_inner(
                        key.to_vec(),
                        ChildRef::Resident(frame_id),
                        ChildRef::Resident(new_fid),
                        2,
                        1,
                        version,
                    );
                    let fid = self.pool.put(inner)?;
                    Ok((fid, false))
                }
            };
        }

        let (left_ref, right_ref, size, height) = {
            let n = self.pool.get(frame_id)?;
            (
                n.left.expect("inner node missing left child"),
                n.right.expect("inner node missing right child"),
                n.size,
                n.subtree_height,
            )
        };
        self.orphan(frame_id)?;

        let go_left = key < node_key.as_slice();
        let (new_child_fid, updated) = if go_left {
            let lfid = self.resolve(left_ref)?;
            self.set_recursive(lfid, key, value, version)?
        } else {
            let rfid = self.resolve(right_ref)?;
            self.set_recursive(rfid, key, value, version)?
        };

        let (final_left, final_right) = if go_left {
            (ChildRef::Resident(new_child_fid), right_ref)
        } else {
            (left_ref, ChildRef::Resident(new_child_fid))
        };

        if updated {
            // Shape unchanged: reuse the size/height captured before the
            // recursion touched anything (§4.3 step 4).
            let n_prime = Node::new_inner(node_key, final_left, final_right, size, height, version);
            let fid = self.pool.put(n_prime)?;
            Ok((fid, true))
        } else {
            let n_prime = Node::new_inner(node_key, final_left, final_right, 0, 0, version);
            let fid = self.pool.put(n_prime)?;
            self.recompute_size_height(fid)?;
            let balanced = self.rebalance(fid, version)?;
            Ok((balanced, false))
        }
    }

    /// Applies `Remove(key)`, returning `(previous value, removed)` (§4.3).
    /// Absent keys are a no-op: `(None, false)`, root hash unchanged.
    pub fn remove(&mut self, key: &[u8]) -> Result<(Option<Vec<u8>>, bool)> {
        let version = self.pending_version();
        let Some(root_fid) = self.root else {
            return Ok((None, false));
        };
        match self.remove_recursive(root_fid, key, version)? {
            RemoveOutcome::NotFound => Ok((None, false)),
            RemoveOutcome::Removed {
                new_subroot, value, ..
            } => {
                self.root = match new_subroot {
                    None => None,
                    Some(child_ref) => Some(self.resolve(child_ref)?),
                };
                Ok((Some(value), true))
            }
        }
    }

    fn remove_recursive(
        &mut self,
        frame_id: usize,
        key: &[u8],
        version: u64,
    ) -> Result<RemoveOutcome> {
        let (is_leaf, node_key) = {
            let n = self.pool.get(frame_id)?;
            (n.is_leaf(), n.key.clone())
        };

        if is_leaf {
            if key == node_key.as_slice() {
                let value = self.pool.get(frame_id)?.value.clone();
                self.orphan(frame_id)?;
                return Ok(RemoveOutcome::Removed {
                    new_subroot: None,
                    new_key: None,
                    value,
                });
            }
            return Ok(RemoveOutcome::NotFound);
        }

        let (left_ref, right_ref) = {
            let n = self.pool.get(frame_id)?;
            (
                n.left.expect("inner node missing left child"),
                n.right.expect("inner node missing right child"),
            )
        };

        if key < node_key.as_slice() {
            let left_fid = self.resolve(left_ref)?;
            let outcome = self.remove_recursive(left_fid, key, version)?;
            let (new_left, new_key_below, value) = match outcome {
                RemoveOutcome::NotFound => return Ok(RemoveOutcome::NotFound),
                RemoveOutcome::Removed {
                    new_subroot,
                    new_key,
                    value,
                } => (new_subroot, new_key, value),
            };
            self.orphan(frame_id)?;
            match new_left {
                None => Ok(RemoveOutcome::Removed {
                    new_subroot: Some(right_ref),
                    new_key: Some(node_key),
                    value,
                }),
                Some(new_left_ref) => {
                    let inner = Node::new_inner(node_key, new_left_ref, right_ref, 0, 0, version);
                    let fid = self.pool.put(inner)?;
                    self.recompute_size_height(fid)?;
                    let balanced = self.rebalance(fid, version)?;
                    Ok(RemoveOutcome::Removed {
                        new_subroot: Some(ChildRef::Resident(balanced)),
                        new_key: new_key_below,
                        value,
                    })
                }
            }
        } else {
            let right_fid = self.resolve(right_ref)?;
            let outcome = self.remove_recursive(right_fid, key, version)?;
            let (new_right, new_key_below, value) = match outcome {
                RemoveOutcome::NotFound => return Ok(RemoveOutcome::NotFound),
                RemoveOutcome::Removed {
                    new_subroot,
                    new_key,
                    value,
                } => (new_subroot, new_key, value),
            };
            self.orphan(frame_id)?;
            match new_right {
                None => Ok(RemoveOutcome::Removed {
                    new_subroot: Some(left_ref),
                    new_key: None,
                    value,
                }),
                Some(new_right_ref) => {
                    let effective_key = new_key_below.unwrap_or(node_key);
                    let inner =
                        Node::new_inner(effective_key, left_ref, new_right_ref, 0, 0, version);
                    let fid = self.pool.put(inner)?;
                    self.recompute_size_height(fid)?;
                    let balanced = self.rebalance(fid, version)?;
                    Ok(RemoveOutcome::Removed {
                        new_subroot: Some(ChildRef::Resident(balanced)),
                        new_key: None,
                        value,
                    })
                }
            }
        }
    }

    /// Resolves a child reference to a resident frame id, faulting it in
    /// from the deferred cache / commitment store if it is still a ghost
    /// (§4.2's `getLeftChild`/`getRightChild`).
    fn resolve(&mut self, child: ChildRef) -> Result<usize> {
        match child {
            ChildRef::Resident(fid) => {
                self.pool.get(fid)?;
                Ok(fid)
            }
            ChildRef::Ghost(ChildKey::Modern(key)) => {
                let cache = self.cache.clone();
                self.pool.fault_in(key, move || {
                    let bytes = cache
                        .get(key)?
                        .ok_or_else(|| Error::Corruption(format!("expected node {key} not found in commitment store")))?;
                    Node::decode(key, key.version, &bytes)
                })
            }
            ChildRef::Ghost(ChildKey::Legacy(_)) => Err(Error::Corruption(
                "cannot resolve a legacy hash-addressed child; this store has none".into(),
            )),
        }
    }

    /// Reads `(size, subtree_height)` off a child, faulting it in if needed.
    fn child_size_height(&mut self, child: ChildRef) -> Result<(i64, i8)> {
        let fid = self.resolve(child)?;
        let n = self.pool.get(fid)?;
        Ok((n.size, n.subtree_height))
    }

    fn recompute_size_height(&mut self, frame_id: usize) -> Result<()> {
        let (left, right) = {
            let n = self.pool.get(frame_id)?;
            (
                n.left.expect("inner node missing left child"),
                n.right.expect("inner node missing right child"),
            )
        };
        let (left_size, left_height) = self.child_size_height(left)?;
        let (right_size, right_height) = self.child_size_height(right)?;
        let n = self.pool.get_mut(frame_id)?;
        n.size = left_size + right_size;
        n.subtree_height = 1 + left_height.max(right_height);
        Ok(())
    }

    fn balance_factor(&mut self, frame_id: usize) -> Result<i32> {
        let (left, right) = {
            let n = self.pool.get(frame_id)?;
            (
                n.left.expect("inner node missing left child"),
                n.right.expect("inner node missing right child"),
            )
        };
        let (_, left_height) = self.child_size_height(left)?;
        let (_, right_height) = self.child_size_height(right)?;
        Ok(left_height as i32 - right_height as i32)
    }

    /// Rebalances the subtree at `frame_id`, returning the (possibly new)
    /// root frame id of the balanced subtree (§4.3's Rebalance rules).
    fn rebalance(&mut self, frame_id: usize, version: u64) -> Result<usize> {
        let balance = self.balance_factor(frame_id)?;
        if balance > 1 {
            let left_ref = self.pool.get(frame_id)?.left.expect("inner node missing left child");
            let left_fid = self.resolve(left_ref)?;
            if self.balance_factor(left_fid)? >= 0 {
                self.rotate_right(frame_id, version)
            } else {
                let new_left = self.rotate_left(left_fid, version)?;
                self.pool.get_mut(frame_id)?.left = Some(ChildRef::Resident(new_left));
                self.rotate_right(frame_id, version)
            }
        } else if balance < -1 {
            let right_ref = self.pool.get(frame_id)?.right.expect("inner node missing right child");
            let right_fid = self.resolve(right_ref)?;
            if self.balance_factor(right_fid)? <= 0 {
                self.rotate_left(frame_id, version)
            } else {
                let new_right = self.rotate_right(right_fid, version)?;
                self.pool.get_mut(frame_id)?.right = Some(ChildRef::Resident(new_right));
                self.rotate_left(frame_id, version)
            }
        } else {
            Ok(frame_id)
        }
    }

    /// Single left rotation. `n_fid` must be a working node (it always is —
    /// rebalance only ever rotates a node freshly built by `set`/`remove`).
    /// The pivot may still be a persisted, clean node; if so it is orphaned
    /// rather than freed outright, since its on-disk image is now stale.
    fn rotate_left(&mut self, n_fid: usize, version: u64) -> Result<usize> {
        let (n_key, n_left, n_right) = {
            let n = self.pool.get(n_fid)?;
            (
                n.key.clone(),
                n.left.expect("inner node missing left child"),
                n.right.expect("inner node missing right child"),
            )
        };
        let pivot_fid = self.resolve(n_right)?;
        let (p_key, p_left, p_right) = {
            let p = self.pool.get(pivot_fid)?;
            (
                p.key.clone(),
                p.left.expect("inner node missing left child"),
                p.right.expect("inner node missing right child"),
            )
        };
        self.orphan(pivot_fid)?;
        self.orphan(n_fid)?;

        let new_left = Node::new_inner(n_key, n_left, p_left, 0, 0, version);
        let new_left_fid = self.pool.put(new_left)?;
        self.recompute_size_height(new_left_fid)?;

        let new_root = Node::new_inner(p_key, ChildRef::Resident(new_left_fid), p_right, 0, 0, version);
        let new_root_fid = self.pool.put(new_root)?;
        self.recompute_size_height(new_root_fid)?;
        Ok(new_root_fid)
    }

    /// Single right rotation, symmetric to [`Tree::rotate_left`].
    fn rotate_right(&mut self, n_fid: usize, version: u64) -> Result<usize> {
        let (n_key, n_left, n_right) = {
            let n = self.pool.get(n_fid)?;
            (
                n.key.clone(),
                n.left.expect("inner node missing left child"),
                n.right.expect("inner node missing right child"),
            )
        };
        let pivot_fid = self.resolve(n_left)?;
        let (p_key, p_left, p_right) = {
            let p = self.pool.get(pivot_fid)?;
            (
                p.key.clone(),
                p.left.expect("inner node missing left child"),
                p.right.expect("inner node missing right child"),
            )
        };
        self.orphan(pivot_fid)?;
        self.orphan(n_fid)?;

        let new_right = Node::new_inner(n_key, p_right, n_right, 0, 0, version);
        let new_right_fid = self.pool.put(new_right)?;
        self.recompute_size_height(new_right_fid)?;

        let new_root = Node::new_inner(p_key, p_left, ChildRef::Resident(new_right_fid), 0, 0, version);
        let new_root_fid = self.pool.put(new_root)?;
        self.recompute_size_height(new_root_fid)?;
        Ok(new_root_fid)
    }

    /// Queues a displaced node's key for deletion at the next checkpoint
    /// (nodes that never made it past being `working` have no key and are
    /// simply freed) and returns its frame to the pool.
    fn orphan(&mut self, frame_id: usize) -> Result<()> {
        let node_key = self.pool.get(frame_id)?.node_key;
        if let Some(key) = node_key {
            self.pending_orphans.push(key);
        }
        self.pool.return_frame(frame_id)
    }

    /// The version that a node created *right now* would be saved under.
    /// Mirrors the `initialVersion` adjustment `save_version` applies, so a
    /// node's `version` field (baked into its hash pre-image at creation
    /// time) never disagrees with the `nodeKey.version` `save_version`
    /// later assigns it.
    fn pending_version(&self) -> u64 {
        let mut v = self.version + 1;
        if v == 1 && self.config.initial_version > 0 {
            v = self.config.initial_version;
        }
        v
    }

    /// Seals the working tree: assigns `(version, sequence)` and a hash to
    /// every working node in post-order, appends the version's change set
    /// to the WAL, and advances `version` (§4.3's `SaveVersion`).
    ///
    /// The root always receives `sequence == 1`, achieved here by reserving
    /// it and assigning every other working node a sequence starting at 2
    /// during the post-order walk, then finalizing the root last.
    pub fn save_version(&mut self) -> Result<([u8; 32], u64)> {
        self.sync_pool_with_checkpoints()?;
        let next_version = self.pending_version();
        if next_version > u32::MAX as u64 {
            return Err(Error::VersionOverflow);
        }

        let mut change_set = ChangeSet::new(next_version);
        let mut sequence = 2u32;

        let root_hash = match self.root {
            None => Node::empty_hash(),
            Some(root_fid) => {
                let is_leaf = self.pool.get(root_fid)?.is_leaf();
                if !is_leaf {
                    let (left, right) = {
                        let n = self.pool.get(root_fid)?;
                        (
                            n.left.expect("inner node missing left child"),
                            n.right.expect("inner node missing right child"),
                        )
                    };
                    self.assign_node_key(left, next_version, &mut sequence, &mut change_set)?;
                    self.assign_node_key(right, next_version, &mut sequence, &mut change_set)?;
                }
                if self.pool.get(root_fid)?.hash.is_none() {
                    self.finalize_node(root_fid, next_version, 1, &mut change_set)?;
                }
                let n = self.pool.get(root_fid)?;
                change_set.root_key = n.node_key;
                n.hash.expect("root must have a hash after finalize")
            }
        };

        change_set.orphans = std::mem::take(&mut self.pending_orphans);

        debug!(
            target: "cowavl::tree",
            version = next_version,
            puts = change_set.puts.len(),
            orphans = change_set.orphans.len(),
            "save_version"
        );
        self.cache.record(&change_set)?;
        self.version = next_version;
        Ok((root_hash, self.version))
    }

    /// Assigns a `(version, sequence)` and hash to `child` and everything
    /// beneath it that is still `working`, in post-order. A `Ghost` child
    /// is already persisted from a prior version and is left untouched; a
    /// `Resident` child whose hash is already set was faulted in from the
    /// store this edit and likewise needs no reassignment.
    fn assign_node_key(
        &mut self,
        child: ChildRef,
        version: u64,
        sequence: &mut u32,
        change_set: &mut ChangeSet,
    ) -> Result<()> {
        let ChildRef::Resident(frame_id) = child else {
            return Ok(());
        };
        if self.pool.get(frame_id)?.hash.is_some() {
            return Ok(());
        }
        let is_leaf = self.pool.get(frame_id)?.is_leaf();
        if !is_leaf {
            let (left, right) = {
                let n = self.pool.get(frame_id)?;
                (
                    n.left.expect("inner node missing left child"),
                    n.right.expect("inner node missing right child"),
                )
            };
            self.assign_node_key(left, version, sequence, change_set)?;
            self.assign_node_key(right, version, sequence, change_set)?;
        }
        let seq = *sequence;
        *sequence += 1;
        self.finalize_node(frame_id, version, seq, change_set)
    }

    /// Resolves `child` to residency and returns its `(node_key, hash)`.
    /// Used by `finalize_node` to read the identity of a child that may
    /// either already have been assigned this version (resident) or be a
    /// persisted node from an earlier one (ghost, faulted in here).
    fn child_identity(&mut self, child: ChildRef) -> Result<(NodeKey, [u8; 32])> {
        let fid = self.resolve(child)?;
        let n = self.pool.get(fid)?;
        let node_key = n
            .node_key
            .ok_or_else(|| Error::Corruption("child has no node key at save time".into()))?;
        let hash = n
            .hash
            .ok_or_else(|| Error::Corruption("child has no hash at save time".into()))?;
        Ok((node_key, hash))
    }

    fn finalize_node(
        &mut self,
        frame_id: usize,
        version: u64,
        sequence: u32,
        change_set: &mut ChangeSet,
    ) -> Result<()> {
        let node_key = NodeKey::new(version, sequence);
        let is_leaf = self.pool.get(frame_id)?.is_leaf();
        let bytes = if is_leaf {
            let n = self.pool.get_mut(frame_id)?;
            n.hash_leaf();
            n.node_key = Some(node_key);
            n.encode_leaf()?
        } else {
            let (left, right) = {
                let n = self.pool.get(frame_id)?;
                (
                    n.left.expect("inner node missing left child"),
                    n.right.expect("inner node missing right child"),
                )
            };
            let (left_key, left_hash) = self.child_identity(left)?;
            let (right_key, right_hash) = self.child_identity(right)?;
            let n = self.pool.get_mut(frame_id)?;
            n.hash_inner(left_hash, right_hash);
            n.node_key = Some(node_key);
            n.encode_inner(left_key, right_key)?
        };
        self.pool.register(frame_id, node_key);
        change_set.puts.push((node_key, bytes));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn harness() -> (Tree, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn CommitmentStore> = Arc::new(MemoryStore::new());
        let config = TreeConfig::builder().async_checkpoint(false).build();
        let tree = Tree::new(config, store, dir.path().join("wal.log")).unwrap();
        (tree, dir)
    }

    #[test]
    fn empty_tree_root_hash_is_sha256_of_empty_string() {
        let (mut tree, _dir) = harness();
        let expected = Node::empty_hash();
        assert_eq!(tree.root_hash().unwrap(), expected);
    }

    #[test]
    fn empty_tree_save_version_is_legal_and_advances() {
        let (mut tree, _dir) = harness();
        let (hash, version) = tree.save_version().unwrap();
        assert_eq!(hash, Node::empty_hash());
        assert_eq!(version, 1);
    }

    #[test]
    fn single_leaf_at_root_has_size_one_height_zero() {
        let (mut tree, _dir) = harness();
        tree.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        assert_eq!(tree.size().unwrap(), 1);
        assert_eq!(tree.height().unwrap(), 0);
    }

    #[test]
    fn smoke_three_keys_in_order() {
        let (mut tree, _dir) = harness();
        tree.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        tree.set(b"b".to_vec(), b"2".to_vec()).unwrap();
        tree.set(b"c".to_vec(), b"3".to_vec()).unwrap();
        tree.save_version().unwrap();
        assert_eq!(tree.size().unwrap(), 3);
        assert_eq!(tree.height().unwrap(), 2);
        assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(tree.get(b"c").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn set_existing_key_reports_updated_true_then_get_sees_new_value() {
        let (mut tree, _dir) = harness();
        let first = tree.set(b"k".to_vec(), b"v1".to_vec()).unwrap();
        let second = tree.set(b"k".to_vec(), b"v2".to_vec()).unwrap();
        assert!(!first);
        assert!(second);
        assert_eq!(tree.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn remove_existing_key_then_get_is_absent() {
        let (mut tree, _dir) = harness();
        tree.set(b"k".to_vec(), b"v".to_vec()).unwrap();
        let (value, removed) = tree.remove(b"k").unwrap();
        assert_eq!(value, Some(b"v".to_vec()));
        assert!(removed);
        assert_eq!(tree.get(b"k").unwrap(), None);
    }

    #[test]
    fn remove_absent_key_is_a_no_op() {
        let (mut tree, _dir) = harness();
        tree.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        tree.save_version().unwrap();
        let before = tree.root_hash().unwrap();
        let (value, removed) = tree.remove(b"missing").unwrap();
        assert_eq!(value, None);
        assert!(!removed);
        tree.save_version().unwrap();
        assert_eq!(tree.root_hash().unwrap(), before);
    }

    #[test]
    fn in_order_traversal_yields_strictly_increasing_keys() {
        let (mut tree, _dir) = harness();
        let keys: [&[u8]; 6] = [b"m", b"a", b"z", b"c", b"x", b"b"];
        for k in keys {
            tree.set(k.to_vec(), b"v".to_vec()).unwrap();
        }
        tree.save_version().unwrap();
        let mut sorted: Vec<_> = keys.to_vec();
        sorted.sort();
        for k in sorted {
            assert_eq!(tree.get(k).unwrap(), Some(b"v".to_vec()));
        }
    }

    #[test]
    fn root_key_for_every_version_is_sequence_one() {
        let (mut tree, _dir) = harness();
        tree.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        let (_, v1) = tree.save_version().unwrap();
        assert_eq!(v1, 1);
        tree.set(b"b".to_vec(), b"2".to_vec()).unwrap();
        let (_, v2) = tree.save_version().unwrap();
        assert_eq!(v2, 2);
        // The root is always resident right after save_version.
        let root_fid = tree.root.unwrap();
        let node_key = tree.pool.get(root_fid).unwrap().node_key.unwrap();
        assert_eq!(node_key, NodeKey::new(2, 1));
    }

    #[test]
    fn many_inserts_then_deletes_converges_back_to_empty() {
        let (mut tree, _dir) = harness();
        let keys: Vec<Vec<u8>> = (0..64u32).map(|i| i.to_be_bytes().to_vec()).collect();
        for k in &keys {
            tree.set(k.clone(), b"v".to_vec()).unwrap();
        }
        tree.save_version().unwrap();
        assert_eq!(tree.size().unwrap(), 64);

        for k in &keys {
            let (_, removed) = tree.remove(k).unwrap();
            assert!(removed);
        }
        tree.save_version().unwrap();
        assert_eq!(tree.size().unwrap(), 0);
        assert_eq!(tree.root_hash().unwrap(), Node::empty_hash());
    }

    #[test]
    fn commutativity_of_independent_puts_after_save_version() {
        let store: Arc<dyn CommitmentStore> = Arc::new(MemoryStore::new());
        let dir1 = tempfile::tempdir().unwrap();
        let config = TreeConfig::builder().async_checkpoint(false).build();
        let mut a = Tree::new(config.clone(), store.clone(), dir1.path().join("wal.log")).unwrap();
        a.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        a.set(b"b".to_vec(), b"2".to_vec()).unwrap();
        a.set(b"c".to_vec(), b"3".to_vec()).unwrap();
        let (hash_a, _) = a.save_version().unwrap();

        let store2: Arc<dyn CommitmentStore> = Arc::new(MemoryStore::new());
        let dir2 = tempfile::tempdir().unwrap();
        let mut b = Tree::new(config, store2, dir2.path().join("wal.log")).unwrap();
        b.set(b"c".to_vec(), b"3".to_vec()).unwrap();
        b.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        b.set(b"b".to_vec(), b"2".to_vec()).unwrap();
        let (hash_b, _) = b.save_version().unwrap();

        assert_eq!(hash_a, hash_b);
    }

    #[test]
    fn pool_capacity_equal_to_block_working_set_causes_no_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn CommitmentStore> = Arc::new(MemoryStore::new());
        let config = TreeConfig::builder()
            .async_checkpoint(false)
            .pool_capacity(64)
            .build();
        let mut tree = Tree::new(config, store, dir.path().join("wal.log")).unwrap();
        for i in 0..8u32 {
            tree.set(i.to_be_bytes().to_vec(), b"v".to_vec()).unwrap();
        }
        let (_, _) = tree.save_version().unwrap();
        assert_eq!(tree.pool.dirty_count(), tree_node_count(&mut tree));
    }

    #[test]
    fn checkpoint_clears_pool_dirty_bits_for_flushed_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn CommitmentStore> = Arc::new(MemoryStore::new());
        let config = TreeConfig::builder().async_checkpoint(false).build();
        let mut tree = Tree::new(config, store, dir.path().join("wal.log")).unwrap();

        tree.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        tree.set(b"b".to_vec(), b"2".to_vec()).unwrap();
        tree.save_version().unwrap();
        let dirty_before = tree.pool.dirty_count();
        assert!(dirty_before > 0, "freshly saved nodes must be dirty");

        tree.checkpoint().unwrap();
        assert_eq!(
            tree.pool.dirty_count(),
            0,
            "checkpoint must mark every flushed resident node clean"
        );
    }

    #[test]
    fn fresh_leaf_created_by_a_plain_set_survives_pool_pressure_before_save_version() {
        // A pool this small forces the very first two-key insert straight
        // into the eviction path before anything has been saved. Before
        // `BufferPool::put` forced working nodes dirty, the first leaf's
        // frame would report clean and the clock evictor could reclaim it
        // while it was still the only copy of that leaf's data — the
        // failure this guards against doesn't need a rebalance or a large
        // workload to reach, just a second `Set`.
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn CommitmentStore> = Arc::new(MemoryStore::new());
        let config = TreeConfig::builder()
            .async_checkpoint(false)
            .pool_capacity(2)
            .build();
        let mut tree = Tree::new(config, store, dir.path().join("wal.log")).unwrap();

        tree.set(b"a".to_vec(), b"1".to_vec()).unwrap();
        tree.set(b"b".to_vec(), b"2".to_vec()).unwrap();

        assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.get(b"b").unwrap(), Some(b"2".to_vec()));
        tree.save_version().unwrap();
        assert_eq!(tree.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(tree.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    fn tree_node_count(tree: &mut Tree) -> usize {
        fn count(tree: &mut Tree, child: Option<ChildRef>) -> usize {
            let Some(child) = child else { return 0 };
            let fid = tree.resolve(child).unwrap();
            let (is_leaf, left, right) = {
                let n = tree.pool.get(fid).unwrap();
                (n.is_leaf(), n.left, n.right)
            };
            if is_leaf {
                1
            } else {
                1 + count(tree, left) + count(tree, right)
            }
        }
        match tree.root {
            None => 0,
            Some(fid) => {
                let (left, right) = {
                    let n = tree.pool.get(fid).unwrap();
                    (n.left, n.right)
                };
                1 + count(tree, left) + count(tree, right)
            }
        }
    }
}
