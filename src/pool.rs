//! Fixed-capacity buffer pool with clock eviction (§4.4).
//!
//! Frames hold working and resident [`Node`]s. Eviction scans the clock hand
//! and checks the `use` bit *before* the `dirty` bit — a frame with its use
//! bit set is spared and has the bit cleared for next time; only a frame
//! that is both unused and clean is reclaimed on the same pass. This
//! ordering is authoritative (see the reference's `v6/pool.go`); a variant
//! that checks dirty before use exists elsewhere in the reference lineage
//! but produces different eviction behavior and is not what this crate
//! implements.

use crate::error::{Error, Result};
use crate::metrics::metrics;
use crate::node::Node;
use crate::node_key::NodeKey;
use std::collections::HashMap;

/// A slot in the pool. `None` means the frame is free.
struct Frame {
    node: Option<Node>,
}

/// Fixed-size arena of node frames plus clock-eviction bookkeeping.
///
/// Frame ids are stable for the lifetime of a resident node: `get` and
/// `get_mut` borrow by id, `put` yields a fresh id for a new node, and
/// `evict`/`return_frame` free an id back to the pool.
///
/// `page_table` maps a persisted node's [`NodeKey`] to the frame holding it,
/// so that re-descending into an already-faulted-in node is a lookup, not a
/// re-fetch from the commitment store. Working nodes (no `NodeKey` yet)
/// never enter the page table.
pub struct BufferPool {
    frames: Vec<Frame>,
    free_list: Vec<usize>,
    clock_hand: usize,
    dirty_count: usize,
    /// Off-arena slots, indexed by `frame_id - capacity`. Kept slotted (not
    /// a plain `Vec<Node>`) so a mid-vector detach never shifts another
    /// overflow node's id out from under a `ChildRef::Resident` or
    /// `page_table` entry that still points at it.
    overflow: Vec<Option<Node>>,
    overflow_free: Vec<usize>,
    capacity: usize,
    page_table: HashMap<NodeKey, usize>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        let mut frames = Vec::with_capacity(capacity);
        let mut free_list = Vec::with_capacity(capacity);
        for i in 0..capacity {
            frames.push(Frame { node: None });
            free_list.push(capacity - 1 - i);
        }
        Self {
            frames,
            free_list,
            clock_hand: 0,
            dirty_count: 0,
            overflow: Vec::new(),
            overflow_free: Vec::new(),
            capacity,
            page_table: HashMap::new(),
        }
    }

    /// Returns the frame holding `key`, if it is already resident.
    pub fn lookup(&self, key: NodeKey) -> Option<usize> {
        self.page_table.get(&key).copied()
    }

    /// Faults `key` into the pool via `loader` if it is not already
    /// resident, returning the frame id either way.
    pub fn fault_in<F>(&mut self, key: NodeKey, loader: F) -> Result<usize>
    where
        F: FnOnce() -> Result<Node>,
    {
        if let Some(frame_id) = self.lookup(key) {
            self.get(frame_id)?;
            return Ok(frame_id);
        }
        let node = loader()?;
        debug_assert_eq!(node.node_key, Some(key));
        let frame_id = self.put(node)?;
        self.page_table.insert(key, frame_id);
        Ok(frame_id)
    }

    /// Records that `frame_id` now holds the node identified by `key`, for
    /// nodes that only acquire a [`NodeKey`] after residency (i.e. working
    /// nodes identified by `SaveVersion`, as opposed to nodes faulted in by
    /// [`BufferPool::fault_in`], which registers them itself).
    pub fn register(&mut self, frame_id: usize, key: NodeKey) {
        self.page_table.insert(key, frame_id);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_count
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow.len() - self.overflow_free.len()
    }

    /// Inserts `node` into the pool, returning its frame id. Sets the node's
    /// `use_bit`. A working node (no `node_key` yet) exists nowhere but this
    /// frame, so it is forced dirty regardless of what the caller passed in —
    /// otherwise the clock evictor could reclaim it before it is ever
    /// durably written (§4.4, §4.6). May evict another frame, or allocate an
    /// overflow slot if the dirty fraction already exceeds half of capacity.
    pub fn put(&mut self, mut node: Node) -> Result<usize> {
        metrics().inc_pool_get();

        if node.node_key.is_none() {
            node.dirty = true;
        }

        if self.dirty_count > self.capacity / 2 {
            node.use_bit = true;
            node.overflow = true;
            if node.dirty {
                self.dirty_count += 1;
            }
            metrics().inc_pool_overflow();
            let idx = match self.overflow_free.pop() {
                Some(idx) => {
                    self.overflow[idx] = Some(node);
                    idx
                }
                None => {
                    self.overflow.push(Some(node));
                    self.overflow.len() - 1
                }
            };
            return Ok(self.capacity + idx);
        }

        let frame_id = match self.free_list.pop() {
            Some(id) => id,
            None => self.evict()?,
        };

        node.use_bit = true;
        node.frame_id = frame_id;
        node.overflow = false;
        if node.dirty {
            self.dirty_count += 1;
        }
        self.frames[frame_id].node = Some(node);
        Ok(frame_id)
    }

    pub fn get(&mut self, frame_id: usize) -> Result<&Node> {
        self.node_mut_raw(frame_id)?.use_bit = true;
        Ok(&*self.node_mut_raw(frame_id)?)
    }

    pub fn get_mut(&mut self, frame_id: usize) -> Result<&mut Node> {
        let node = self.node_mut_raw(frame_id)?;
        node.use_bit = true;
        if !node.dirty {
            node.dirty = true;
            self.dirty_count += 1;
        }
        Ok(node)
    }

    /// Releases a frame back to the pool without eviction (used once a node
    /// is durably written and has no more in-memory references).
    pub fn return_frame(&mut self, frame_id: usize) -> Result<()> {
        metrics().inc_pool_return();
        if frame_id >= self.capacity {
            let idx = frame_id - self.capacity;
            let slot = self
                .overflow
                .get_mut(idx)
                .ok_or_else(|| Error::Corruption("invalid overflow frame id".into()))?;
            let node = slot
                .take()
                .ok_or_else(|| Error::Corruption("overflow frame already empty".into()))?;
            self.overflow_free.push(idx);
            if node.dirty {
                self.dirty_count -= 1;
            }
            if let Some(key) = node.node_key {
                self.page_table.remove(&key);
            }
            return Ok(());
        }
        let slot = &mut self.frames[frame_id];
        if let Some(node) = slot.node.take() {
            if node.dirty {
                self.dirty_count -= 1;
            }
            if let Some(key) = node.node_key {
                self.page_table.remove(&key);
            }
        }
        self.free_list.push(frame_id);
        Ok(())
    }

    /// Clears the dirty bit on a frame once its node has been flushed.
    pub fn mark_clean(&mut self, frame_id: usize) -> Result<()> {
        let node = self.node_mut_raw(frame_id)?;
        if node.dirty {
            node.dirty = false;
            self.dirty_count -= 1;
        }
        Ok(())
    }

    /// Reconciles a checkpoint's `FlushNode` against a resident node
    /// identified by key, if it is still resident (§4.4). An arena frame is
    /// simply marked clean, becoming eligible for eviction again; an
    /// overflow frame is detached outright, since overflow nodes bypass the
    /// arena and have no frame worth keeping once durable. A key with no
    /// resident frame (already orphaned and returned, or never faulted back
    /// in) is a no-op.
    pub fn mark_clean_by_key(&mut self, key: NodeKey) -> Result<()> {
        let Some(frame_id) = self.page_table.get(&key).copied() else {
            return Ok(());
        };
        if frame_id >= self.capacity {
            self.return_frame(frame_id)
        } else {
            self.mark_clean(frame_id)
        }
    }

    /// Looks up a frame by id, whether it lives in the fixed arena or the
    /// overflow area.
    fn node_mut_raw(&mut self, frame_id: usize) -> Result<&mut Node> {
        if frame_id >= self.capacity {
            let idx = frame_id - self.capacity;
            return self
                .overflow
                .get_mut(idx)
                .ok_or_else(|| Error::Corruption("invalid overflow frame id".into()))?
                .as_mut()
                .ok_or_else(|| Error::Corruption("overflow frame is empty".into()));
        }
        self.frames
            .get_mut(frame_id)
            .ok_or(Error::Corruption("invalid frame id".into()))?
            .node
            .as_mut()
            .ok_or(Error::Corruption("frame is empty".into()))
    }

    /// Runs the clock hand until a clean, unused frame is reclaimed.
    /// Panics (surfaced as [`Error::PoolExhausted`]) if a full two laps of
    /// the arena turn up nothing reclaimable.
    fn evict(&mut self) -> Result<usize> {
        let budget = self.capacity.saturating_mul(2);
        for _ in 0..budget {
            let idx = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % self.capacity;

            let reclaim = match &mut self.frames[idx].node {
                None => true,
                Some(node) => {
                    if node.use_bit {
                        node.use_bit = false;
                        metrics().inc_pool_evict_miss();
                        false
                    } else if node.dirty {
                        false
                    } else {
                        true
                    }
                }
            };

            if reclaim {
                if let Some(node) = self.frames[idx].node.take() {
                    if node.dirty {
                        self.dirty_count -= 1;
                    }
                    if let Some(key) = node.node_key {
                        self.page_table.remove(&key);
                    }
                }
                metrics().inc_pool_evict();
                return Ok(idx);
            }
        }
        Err(Error::PoolExhausted)
    }
}
