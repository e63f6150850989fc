//! Discardable-memory heap.
//!
//! A single arena carved into variable-size nodes. Every node sits on one
//! circular, doubly linked chain anchored at a locked sentinel:
//!
//! ```text
//! sentinel -> [resident | free]* (address order, tiling the arena) -> [discarded]* -> sentinel
//! ```
//!
//! Nodes live in a slab and are named by [`NodeRef`] (slot index plus
//! generation). Moving a block only rewrites its `base`, so a `NodeRef` stays
//! valid across compaction, eviction and reallocation; it goes stale only once
//! the node is freed.

mod node;

pub use node::{AllocFlags, MemoryNode, NodeFlags, NodeRef};

use thiserror::Error;

/// Allocation granularity in bytes.
pub const HEAP_ALIGN: usize = 4;

const SENTINEL: u32 = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("out of memory: requested {requested} bytes with {free} bytes free")]
    OutOfMemory { requested: usize, free: usize },

    #[error("stale or unknown node reference {0:?}")]
    StaleNode(NodeRef),

    #[error("node {0:?} is already locked")]
    DoubleLock(NodeRef),

    #[error("node {0:?} is locked")]
    Locked(NodeRef),

    #[error("node {0:?} is not discardable")]
    NotDiscardable(NodeRef),

    #[error("the sentinel node cannot be handed out")]
    Sentinel,

    #[error("invalid allocation flags {0:?}")]
    InvalidFlags(AllocFlags),

    #[error("heap chain corrupted: {0}")]
    Corrupted(String),
}

pub type HeapResult<T> = std::result::Result<T, HeapError>;

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    occupied: bool,
    node: MemoryNode,
}

/// Reclamation stages tried in order when no free node fits a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reclaim {
    Merge,
    Slide,
    Evict,
}

#[derive(Debug, Clone)]
pub struct Heap {
    arena: Vec<u8>,
    slots: Vec<Slot>,
    vacant: Vec<u32>,
    clock: u64,
}

fn round_up(size: usize) -> usize {
    size.max(1).div_ceil(HEAP_ALIGN) * HEAP_ALIGN
}

impl Heap {
    /// Creates a heap managing `size` bytes (rounded down to [`HEAP_ALIGN`]).
    pub fn new(size: usize) -> Self {
        let size = size - size % HEAP_ALIGN;
        let sentinel = MemoryNode {
            prev: SENTINEL,
            next: SENTINEL,
            base: size,
            len: 0,
            last_access: 0,
            flags: NodeFlags::SENTINEL | NodeFlags::LOCKED,
        };
        let mut heap = Self {
            arena: vec![0; size],
            slots: vec![Slot {
                generation: 0,
                occupied: true,
                node: sentinel,
            }],
            vacant: Vec::new(),
            clock: 0,
        };
        if size > 0 {
            let free = heap.new_slot(MemoryNode::free(0, size));
            heap.link_before(free, SENTINEL);
        }
        heap
    }

    /// Total arena size in bytes.
    pub fn size(&self) -> usize {
        self.arena.len()
    }

    /// Current value of the access clock.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn node(&self, node: NodeRef) -> HeapResult<&MemoryNode> {
        let idx = self.validate(node)?;
        Ok(self.n(idx))
    }

    /// Allocates a block of `size` bytes.
    ///
    /// Discardable requests never fail: when even evicting every unlocked
    /// discardable block leaves no room they come back as a discarded
    /// placeholder, as do `NO_ALLOC` requests and zero-length discardable ones.
    pub fn allocate(&mut self, flags: AllocFlags, size: usize) -> HeapResult<NodeRef> {
        let class = flags.class().ok_or(HeapError::InvalidFlags(flags))?;
        let idx = self.new_slot(MemoryNode::placeholder(class, self.clock));

        if flags.contains(AllocFlags::NO_ALLOC) {
            if !class.contains(NodeFlags::DISCARDABLE) {
                self.release_slot(idx);
                return Err(HeapError::InvalidFlags(flags));
            }
            self.park(idx);
            return Ok(self.node_ref(idx));
        }

        match self.place(idx, flags, size) {
            Ok(()) => {
                log::trace!("heap: allocated {:?} ({} bytes, {:?})", self.node_ref(idx), size, class);
                Ok(self.node_ref(idx))
            }
            Err(e) => {
                self.release_slot(idx);
                Err(e)
            }
        }
    }

    /// Locks a resident node and hands out its bytes.
    ///
    /// Returns `None` without locking when the node is discarded or empty.
    pub fn lock(&mut self, node: NodeRef) -> HeapResult<Option<&mut [u8]>> {
        let idx = self.validate(node)?;
        let current = self.n(idx);
        if current.is_locked() {
            return Err(HeapError::DoubleLock(node));
        }
        if current.is_discarded() || current.is_empty() {
            return Ok(None);
        }

        let now = self.tick();
        let locked = self.n_mut(idx);
        locked.flags |= NodeFlags::LOCKED;
        locked.last_access = now;
        let (base, end) = (locked.base, locked.end());
        Ok(Some(&mut self.arena[base..end]))
    }

    pub fn unlock(&mut self, node: NodeRef) -> HeapResult<()> {
        let idx = self.validate(node)?;
        let now = self.tick();
        let current = self.n_mut(idx);
        current.flags.remove(NodeFlags::LOCKED);
        current.last_access = now;
        Ok(())
    }

    /// Refreshes the node's access time so it is evicted last.
    pub fn touch(&mut self, node: NodeRef) -> HeapResult<()> {
        let idx = self.validate(node)?;
        let now = self.tick();
        self.n_mut(idx).last_access = now;
        Ok(())
    }

    /// Resident bytes of a node, `None` while discarded.
    pub fn data(&self, node: NodeRef) -> HeapResult<Option<&[u8]>> {
        let idx = self.validate(node)?;
        let current = self.n(idx);
        if current.is_discarded() {
            return Ok(None);
        }
        Ok(Some(&self.arena[current.base..current.end()]))
    }

    pub fn data_mut(&mut self, node: NodeRef) -> HeapResult<Option<&mut [u8]>> {
        let idx = self.validate(node)?;
        let current = self.n(idx);
        if current.is_discarded() {
            return Ok(None);
        }
        let (base, end) = (current.base, current.end());
        Ok(Some(&mut self.arena[base..end]))
    }

    /// Resizes or reclassifies a node in place of its old region.
    ///
    /// The same `NodeRef` names the new region. Contents survive up to the
    /// smaller of the two sizes. On failure the node goes back to its old
    /// size and contents when that region can still be placed; otherwise it
    /// is left discarded.
    pub fn reallocate(&mut self, node: NodeRef, size: usize, flags: AllocFlags) -> HeapResult<()> {
        let idx = self.validate(node)?;
        let flags = flags - AllocFlags::NO_ALLOC;
        let class = flags.class().ok_or(HeapError::InvalidFlags(flags))?;
        let current = self.n(idx);
        if current.is_locked() {
            return Err(HeapError::Locked(node));
        }

        let resident = !current.is_discarded();
        let parked = size == 0 && class.contains(NodeFlags::DISCARDABLE);
        let same_shape = if resident {
            !parked && current.len == round_up(size)
        } else {
            parked
        };
        if same_shape {
            let current = self.n_mut(idx);
            current.flags = (current.flags - NodeFlags::CLASS) | class;
            return Ok(());
        }

        let (base, len) = (current.base, current.len);
        let (old_class, old_access) = (current.flags & NodeFlags::CLASS, current.last_access);
        let old = if resident {
            self.arena[base..base + len].to_vec()
        } else {
            Vec::new()
        };
        let keep = if parked { 0 } else { len.min(round_up(size)) };
        if resident {
            let free = self.new_slot(MemoryNode::free(base, len));
            self.link_before(free, idx);
        }
        self.unlink(idx);
        let detached = self.n_mut(idx);
        detached.flags = class | NodeFlags::DISCARDED;
        detached.base = 0;
        detached.len = 0;
        if resident {
            self.merge_free();
        }

        if let Err(e) = self.place(idx, flags, size) {
            self.restore(idx, old_class, old_access, &old);
            return Err(e);
        }

        let placed = self.n(idx);
        if keep > 0 && !old.is_empty() && !placed.is_discarded() {
            let base = placed.base;
            self.arena[base..base + keep].copy_from_slice(&old[..keep]);
        }
        Ok(())
    }

    /// Drops a discardable node's contents, leaving a placeholder.
    pub fn discard(&mut self, node: NodeRef) -> HeapResult<()> {
        let idx = self.validate(node)?;
        let current = self.n(idx);
        if current.is_locked() {
            return Err(HeapError::Locked(node));
        }
        if !current.flags.contains(NodeFlags::DISCARDABLE) {
            return Err(HeapError::NotDiscardable(node));
        }
        if !current.is_discarded() {
            self.discard_idx(idx);
        }
        Ok(())
    }

    /// Returns the node's memory to the free list. `node` is stale afterwards.
    pub fn free(&mut self, node: NodeRef) -> HeapResult<()> {
        let idx = self.validate(node)?;
        let current = self.n(idx);
        if current.is_locked() {
            return Err(HeapError::Locked(node));
        }

        if current.is_discarded() || current.is_empty() {
            self.unlink(idx);
            self.release_slot(idx);
            return Ok(());
        }

        let (base, len) = (current.base, current.len);
        let free = self.new_slot(MemoryNode::free(base, len));
        self.link_before(free, idx);
        self.unlink(idx);
        self.release_slot(idx);
        self.merge_around(free);
        Ok(())
    }

    /// Merges free runs and slides relocatable blocks towards the arena start.
    pub fn compact(&mut self) {
        self.merge_free();
        self.slide();
    }

    pub fn free_bytes(&self) -> usize {
        self.nodes().filter(|(_, n)| n.is_free()).map(|(_, n)| n.len).sum()
    }

    pub fn largest_free(&self) -> usize {
        self.nodes()
            .filter(|(_, n)| n.is_free())
            .map(|(_, n)| n.len)
            .max()
            .unwrap_or(0)
    }

    /// Every node except the sentinel, in chain order.
    pub fn nodes(&self) -> Nodes<'_> {
        Nodes {
            heap: self,
            at: self.n(SENTINEL).next,
        }
    }

    /// Walks the chain and verifies its structural invariants.
    pub fn check_integrity(&self) -> HeapResult<()> {
        let corrupt = |msg: String| Err(HeapError::Corrupted(msg));

        let sentinel = self.n(SENTINEL);
        if sentinel.flags != NodeFlags::SENTINEL | NodeFlags::LOCKED {
            return corrupt(format!("sentinel flags are {:?}", sentinel.flags));
        }

        let mut visited = 0usize;
        let mut cursor = 0usize;
        let mut in_tail = false;
        let mut idx = SENTINEL;
        loop {
            let next = self.n(idx).next;
            match self.slots.get(next as usize) {
                Some(slot) if slot.occupied => {}
                _ => return corrupt(format!("node {idx} links to vacant slot {next}")),
            }
            if self.n(next).prev != idx {
                return corrupt(format!("back link of node {next} does not point at {idx}"));
            }
            if next == SENTINEL {
                break;
            }

            visited += 1;
            if visited >= self.slots.len() {
                return corrupt("chain does not return to the sentinel".to_string());
            }

            let node = self.n(next);
            if node.is_sentinel() {
                return corrupt(format!("second sentinel at slot {next}"));
            }
            if node.is_discarded() {
                in_tail = true;
                if node.len != 0 {
                    return corrupt(format!("discarded node {next} has length {}", node.len));
                }
            } else {
                if in_tail {
                    return corrupt(format!("node {next} is resident after a discarded node"));
                }
                if node.base != cursor {
                    return corrupt(format!(
                        "node {next} starts at {} but the previous block ends at {cursor}",
                        node.base
                    ));
                }
                if node.len == 0 {
                    return corrupt(format!("resident node {next} is empty"));
                }
                cursor = node.end();
            }
            idx = next;
        }

        if cursor != self.arena.len() {
            return corrupt(format!("chain covers {cursor} of {} bytes", self.arena.len()));
        }
        let occupied = self.slots.iter().filter(|s| s.occupied).count();
        if occupied != visited + 1 {
            return corrupt(format!("{} nodes are not on the chain", occupied - visited - 1));
        }
        Ok(())
    }

    /// Finds room for the unlinked node `idx` and links it in.
    fn place(&mut self, idx: u32, flags: AllocFlags, size: usize) -> HeapResult<()> {
        let discardable = self.n(idx).flags.contains(NodeFlags::DISCARDABLE);
        if size == 0 && discardable {
            self.park(idx);
            return Ok(());
        }

        let size = round_up(size);
        let mut stage = Reclaim::Merge;
        loop {
            if let Some(free) = self.first_fit(size) {
                self.carve(free, idx, size);
                if flags.contains(AllocFlags::ZERO_INIT) {
                    let node = self.n(idx);
                    let (base, end) = (node.base, node.end());
                    self.arena[base..end].fill(0);
                }
                return Ok(());
            }

            stage = match stage {
                Reclaim::Merge => {
                    self.merge_free();
                    Reclaim::Slide
                }
                Reclaim::Slide => {
                    self.slide();
                    Reclaim::Evict
                }
                Reclaim::Evict => match self.least_recent_evictable() {
                    Some(victim) => {
                        log::debug!(
                            "heap: evicting {:?} ({} bytes) to satisfy a {} byte request",
                            self.node_ref(victim),
                            self.n(victim).len,
                            size
                        );
                        self.discard_idx(victim);
                        self.slide();
                        Reclaim::Evict
                    }
                    None => break,
                },
            };
        }

        if discardable {
            log::debug!("heap: exhausted, {} byte discardable request left discarded", size);
            self.park(idx);
            return Ok(());
        }
        Err(HeapError::OutOfMemory {
            requested: size,
            free: self.free_bytes(),
        })
    }

    fn first_fit(&self, size: usize) -> Option<u32> {
        let mut idx = self.n(SENTINEL).next;
        while idx != SENTINEL {
            let node = self.n(idx);
            if node.is_discarded() {
                break;
            }
            if node.is_free() && node.len >= size {
                return Some(idx);
            }
            idx = node.next;
        }
        None
    }

    /// Gives the front `size` bytes of the free node `free` to `idx`.
    fn carve(&mut self, free: u32, idx: u32, size: usize) {
        let (base, free_len) = (self.n(free).base, self.n(free).len);
        let now = self.tick();
        let node = self.n_mut(idx);
        node.base = base;
        node.len = size;
        node.last_access = now;
        node.flags.remove(NodeFlags::DISCARDED);
        self.link_before(idx, free);

        if free_len == size {
            self.unlink(free);
            self.release_slot(free);
        } else {
            let rest = self.n_mut(free);
            rest.base = base + size;
            rest.len = free_len - size;
        }
    }

    /// Puts a detached node back with its old class and contents after a
    /// failed reallocation. Parks it when there is no room left.
    fn restore(&mut self, idx: u32, class: NodeFlags, last_access: u64, old: &[u8]) {
        self.n_mut(idx).flags = class | NodeFlags::DISCARDED;
        if old.is_empty() {
            self.park(idx);
            return;
        }
        // a discardable class parks itself when nothing fits
        if self.place(idx, AllocFlags::empty(), old.len()).is_err() {
            self.park(idx);
            return;
        }
        let node = self.n_mut(idx);
        node.last_access = last_access;
        if node.is_discarded() {
            return;
        }
        let base = node.base;
        self.arena[base..base + old.len()].copy_from_slice(old);
    }

    /// Links `idx` as a discarded placeholder at the chain tail.
    fn park(&mut self, idx: u32) {
        let node = self.n_mut(idx);
        node.base = 0;
        node.len = 0;
        node.flags |= NodeFlags::DISCARDED;
        self.link_before(idx, SENTINEL);
    }

    fn discard_idx(&mut self, idx: u32) {
        let (base, len) = (self.n(idx).base, self.n(idx).len);
        let free = self.new_slot(MemoryNode::free(base, len));
        self.link_before(free, idx);
        self.unlink(idx);
        self.park(idx);
        self.merge_around(free);
    }

    fn least_recent_evictable(&self) -> Option<u32> {
        let mut best: Option<(u64, u32)> = None;
        let mut idx = self.n(SENTINEL).next;
        while idx != SENTINEL {
            let node = self.n(idx);
            if node.is_evictable() && best.map_or(true, |(t, _)| node.last_access < t) {
                best = Some((node.last_access, idx));
            }
            idx = node.next;
        }
        best.map(|(_, idx)| idx)
    }

    fn merge_free(&mut self) {
        let mut idx = self.n(SENTINEL).next;
        while idx != SENTINEL {
            let next = self.n(idx).next;
            if self.n(idx).is_free() && next != SENTINEL && self.n(next).is_free() {
                let extra = self.n(next).len;
                self.n_mut(idx).len += extra;
                self.unlink(next);
                self.release_slot(next);
                continue;
            }
            idx = next;
        }
    }

    /// Folds `free` into free neighbours on either side.
    fn merge_around(&mut self, free: u32) {
        let next = self.n(free).next;
        if next != SENTINEL && self.n(next).is_free() {
            let extra = self.n(next).len;
            self.n_mut(free).len += extra;
            self.unlink(next);
            self.release_slot(next);
        }
        let prev = self.n(free).prev;
        if prev != SENTINEL && self.n(prev).is_free() {
            let extra = self.n(free).len;
            self.n_mut(prev).len += extra;
            self.unlink(free);
            self.release_slot(free);
        }
    }

    /// Slides every slidable block down to the end of its predecessor, then
    /// re-tiles the gaps with free nodes.
    fn slide(&mut self) {
        let mut kept = Vec::new();
        let mut cursor = 0usize;
        let mut moved = 0usize;
        let mut idx = self.n(SENTINEL).next;
        while idx != SENTINEL {
            let node = self.n(idx);
            let next = node.next;
            if node.is_discarded() {
                break;
            }
            if node.is_free() {
                self.unlink(idx);
                self.release_slot(idx);
                idx = next;
                continue;
            }

            if node.is_slidable() {
                let (base, len) = (node.base, node.len);
                if base != cursor {
                    self.arena.copy_within(base..base + len, cursor);
                    self.n_mut(idx).base = cursor;
                    moved += 1;
                }
                cursor += len;
            } else {
                cursor = node.end();
            }
            kept.push(idx);
            idx = next;
        }

        let mut end = 0usize;
        for &idx in &kept {
            let base = self.n(idx).base;
            if base > end {
                let free = self.new_slot(MemoryNode::free(end, base - end));
                self.link_before(free, idx);
            }
            end = self.n(idx).end();
        }
        if end < self.arena.len() {
            let free = self.new_slot(MemoryNode::free(end, self.arena.len() - end));
            let after = kept.last().copied().unwrap_or(SENTINEL);
            let before = self.n(after).next;
            self.link_before(free, before);
        }

        if moved > 0 {
            log::debug!("heap: compaction moved {} blocks, {} bytes free", moved, self.free_bytes());
        }
    }

    fn validate(&self, node: NodeRef) -> HeapResult<u32> {
        if node.index == SENTINEL {
            return Err(HeapError::Sentinel);
        }
        match self.slots.get(node.index as usize) {
            Some(slot) if slot.occupied && slot.generation == node.generation && !slot.node.is_free() => {
                Ok(node.index)
            }
            _ => Err(HeapError::StaleNode(node)),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn node_ref(&self, idx: u32) -> NodeRef {
        NodeRef {
            index: idx,
            generation: self.slots[idx as usize].generation,
        }
    }

    fn n(&self, idx: u32) -> &MemoryNode {
        &self.slots[idx as usize].node
    }

    fn n_mut(&mut self, idx: u32) -> &mut MemoryNode {
        &mut self.slots[idx as usize].node
    }

    fn new_slot(&mut self, node: MemoryNode) -> u32 {
        match self.vacant.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                slot.occupied = true;
                slot.node = node;
                idx
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    occupied: true,
                    node,
                });
                (self.slots.len() - 1) as u32
            }
        }
    }

    fn release_slot(&mut self, idx: u32) {
        let slot = &mut self.slots[idx as usize];
        slot.occupied = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(idx);
    }

    fn link_before(&mut self, idx: u32, before: u32) {
        let prev = self.n(before).prev;
        let node = self.n_mut(idx);
        node.prev = prev;
        node.next = before;
        self.n_mut(prev).next = idx;
        self.n_mut(before).prev = idx;
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next) = (self.n(idx).prev, self.n(idx).next);
        self.n_mut(prev).next = next;
        self.n_mut(next).prev = prev;
    }
}

/// Iterator returned by [`Heap::nodes`].
pub struct Nodes<'a> {
    heap: &'a Heap,
    at: u32,
}

impl<'a> Iterator for Nodes<'a> {
    type Item = (NodeRef, &'a MemoryNode);

    fn next(&mut self) -> Option<Self::Item> {
        if self.at == SENTINEL {
            return None;
        }
        let idx = self.at;
        let slot = &self.heap.slots[idx as usize];
        self.at = slot.node.next;
        Some((
            NodeRef {
                index: idx,
                generation: slot.generation,
            },
            &slot.node,
        ))
    }
}
