use bitflags::bitflags;

bitflags! {
    /// Flags accepted by [`Heap::allocate`](super::Heap::allocate) and
    /// [`Heap::reallocate`](super::Heap::reallocate).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u16 {
        const FIXED = 0x0001;
        const MOVABLE = 0x0002;
        const DISCARDABLE = 0x0004;
        /// Create a discarded placeholder without reserving any memory.
        const NO_ALLOC = 0x0008;
        const ZERO_INIT = 0x0020;
    }
}

bitflags! {
    /// State bits carried by every node in the chain.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct NodeFlags: u16 {
        const FREE = 0x0001;
        const FIXED = 0x0002;
        const MOVABLE = 0x0004;
        const DISCARDABLE = 0x0008;
        const DISCARDED = 0x0100;
        const LOCKED = 0x0200;
        const SENTINEL = 0x0400;

        const CLASS = Self::FIXED.bits() | Self::MOVABLE.bits() | Self::DISCARDABLE.bits();
    }
}

impl AllocFlags {
    /// Node class requested by these flags, `None` when the combination is
    /// meaningless (no class, or fixed together with movable/discardable).
    pub(crate) fn class(self) -> Option<NodeFlags> {
        let relocatable = self.intersects(AllocFlags::MOVABLE | AllocFlags::DISCARDABLE);
        if self.contains(AllocFlags::FIXED) {
            return (!relocatable).then_some(NodeFlags::FIXED);
        }
        if self.contains(AllocFlags::DISCARDABLE) {
            Some(NodeFlags::DISCARDABLE | NodeFlags::MOVABLE)
        } else if self.contains(AllocFlags::MOVABLE) {
            Some(NodeFlags::MOVABLE)
        } else {
            None
        }
    }
}

/// Reference to a node: slab index plus the generation it was issued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl NodeRef {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// One block of the arena, or a placeholder for a discarded block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryNode {
    pub(crate) prev: u32,
    pub(crate) next: u32,
    pub(crate) base: usize,
    pub(crate) len: usize,
    pub(crate) last_access: u64,
    pub(crate) flags: NodeFlags,
}

impl MemoryNode {
    pub(crate) fn free(base: usize, len: usize) -> Self {
        Self {
            prev: 0,
            next: 0,
            base,
            len,
            last_access: 0,
            flags: NodeFlags::FREE,
        }
    }

    pub(crate) fn placeholder(class: NodeFlags, last_access: u64) -> Self {
        Self {
            prev: 0,
            next: 0,
            base: 0,
            len: 0,
            last_access,
            flags: class | NodeFlags::DISCARDED,
        }
    }

    /// Start of the block in the arena, `None` while discarded.
    pub fn base(&self) -> Option<usize> {
        (!self.is_discarded()).then_some(self.base)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn last_access(&self) -> u64 {
        self.last_access
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn is_free(&self) -> bool {
        self.flags.contains(NodeFlags::FREE)
    }

    pub fn is_discarded(&self) -> bool {
        self.flags.contains(NodeFlags::DISCARDED)
    }

    pub fn is_locked(&self) -> bool {
        self.flags.contains(NodeFlags::LOCKED)
    }

    pub fn is_sentinel(&self) -> bool {
        self.flags.contains(NodeFlags::SENTINEL)
    }

    /// Holds live bytes in the arena.
    pub fn is_resident(&self) -> bool {
        !self
            .flags
            .intersects(NodeFlags::FREE | NodeFlags::DISCARDED | NodeFlags::SENTINEL)
    }

    pub(crate) fn end(&self) -> usize {
        self.base + self.len
    }

    /// Compaction may slide this block.
    pub(crate) fn is_slidable(&self) -> bool {
        self.flags.contains(NodeFlags::MOVABLE)
            && !self.flags.intersects(NodeFlags::FIXED | NodeFlags::LOCKED)
    }

    pub(crate) fn is_evictable(&self) -> bool {
        self.flags.contains(NodeFlags::DISCARDABLE) && self.is_resident() && !self.is_locked()
    }
}
