//! Resource handle table.
//!
//! A [`Handle`] packs a descriptor index (high 9 bits) and a byte offset into
//! that resource (low 23 bits). The table owns the heap, keeps one
//! [`ResourceDescriptor`] per index record, and makes a resource resident on
//! demand when it is resolved. One descriptor may be configured as the
//! media-paged resource: it is too large to hold, so only the window declared
//! with [`HandleTable::declare_paged_range`] is ever read.

mod index;

pub use index::{build_index, parse_index, IndexRecord, IndexRevision, ResourceFlags, NAME_LEN, SIZE_MASK};

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ResourceConfig;
use crate::heap::{AllocFlags, Heap, HeapError, NodeFlags, NodeRef};
use crate::vfs::StreamProvider;

pub const HANDLE_SHIFT: u32 = 23;
pub const OFFSET_MASK: u32 = 0x007F_FFFF;
pub const MAX_DESCRIPTORS: usize = 1 << (32 - HANDLE_SHIFT);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u32);

impl Handle {
    pub const fn new(index: usize, offset: u32) -> Self {
        Handle(((index as u32) << HANDLE_SHIFT) | (offset & OFFSET_MASK))
    }

    /// Descriptor index.
    pub const fn index(self) -> usize {
        (self.0 >> HANDLE_SHIFT) as usize
    }

    /// Byte offset within the resource.
    pub const fn offset(self) -> u32 {
        self.0 & OFFSET_MASK
    }
}

impl From<u32> for Handle {
    fn from(raw: u32) -> Self {
        Handle(raw)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("index {name:?} could not be opened")]
    MissingIndex {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("index is corrupt: {len} bytes is not a whole number of {record}-byte records")]
    CorruptIndex { len: usize, record: usize },

    #[error("index lists {count} resources, handles address at most {max}")]
    TooManyResources { count: usize, max: usize },

    #[error("I/O error reading the index")]
    Io(#[from] io::Error),

    #[error("short read of {name:?}: wanted {wanted} bytes")]
    ShortRead {
        name: String,
        wanted: usize,
        #[source]
        source: io::Error,
    },

    #[error("handle {0} names no resource")]
    BadHandle(Handle),

    #[error("residency of handle {0} was never initialised")]
    NotInitialized(Handle),

    #[error("resource behind handle {0} is not resident")]
    NotResident(Handle),

    #[error("offset of handle {handle} is past the end of a {size}-byte resource")]
    OffsetOutOfRange { handle: Handle, size: usize },

    #[error("no paged resource is configured or listed in the index")]
    NoPagedResource,

    #[error("invalid paged range {base}..{top}")]
    InvalidPagedRange { base: Handle, top: Handle },

    #[error("handle {handle} is outside the current paged range")]
    OutsidePagedRange { handle: Handle },

    #[error("paged range {base}..{top} overlaps the unread range {pending_base}..{pending_top}")]
    OverlappingPagedRange {
        base: Handle,
        top: Handle,
        pending_base: Handle,
        pending_top: Handle,
    },

    #[error("{current} is already pinned, cannot pin {requested}")]
    AlreadyPinned { current: Handle, requested: Handle },

    #[error("handle {0} is not the pinned resource")]
    NotPinned(Handle),

    #[error("the paged resource cannot be pinned (handle {0})")]
    PagedNotPinnable(Handle),

    #[error(transparent)]
    Heap(#[from] HeapError),
}

pub type ResourceResult<T> = std::result::Result<T, ResourceError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    name: String,
    size: u32,
    flags: ResourceFlags,
    media: u32,
    node: Option<NodeRef>,
}

impl From<IndexRecord> for ResourceDescriptor {
    fn from(record: IndexRecord) -> Self {
        Self {
            name: record.name,
            size: record.size,
            flags: record.flags - ResourceFlags::LOADED,
            media: record.media,
            node: None,
        }
    }
}

impl ResourceDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size in bytes as rated by the index.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn flags(&self) -> ResourceFlags {
        self.flags
    }

    pub fn media(&self) -> u32 {
        self.media
    }

    pub fn node(&self) -> Option<NodeRef> {
        self.node
    }

    pub fn is_preload(&self) -> bool {
        self.flags.contains(ResourceFlags::PRELOAD)
    }
}

/// Streaming window of the media-paged resource. `top` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedRange {
    pub base: Handle,
    pub top: Handle,
    pub backing_path: String,
}

impl PagedRange {
    pub fn len(&self) -> usize {
        self.top.0.saturating_sub(self.base.0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.top.0 <= self.base.0
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.base <= handle && handle < self.top
    }

    fn overlaps(&self, other: &PagedRange) -> bool {
        self.base < other.top && other.base < self.top
    }
}

#[derive(Debug, Clone)]
struct PagedState {
    range: PagedRange,
    loaded: bool,
}

pub struct HandleTable<P: StreamProvider> {
    heap: Heap,
    provider: P,
    config: ResourceConfig,
    descriptors: Vec<ResourceDescriptor>,
    paged_index: Option<usize>,
    paged: Option<PagedState>,
    pinned: Option<usize>,
    current_media: u32,
}

/// Reads `buf.len()` bytes at `offset` of `name`, reopening the stream for
/// every attempt.
fn read_exact_at<P: StreamProvider>(
    provider: &mut P,
    name: &str,
    offset: u64,
    buf: &mut [u8],
    attempts: u32,
) -> ResourceResult<()> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = provider.open(name).and_then(|mut stream| {
            stream.seek(SeekFrom::Start(offset))?;
            stream.read_exact(buf)
        });
        match result {
            Ok(()) => return Ok(()),
            Err(source) if attempt >= attempts => {
                return Err(ResourceError::ShortRead {
                    name: name.to_string(),
                    wanted: buf.len(),
                    source,
                })
            }
            Err(e) => {
                log::warn!("read of {} failed (attempt {}/{}): {}", name, attempt, attempts, e);
                attempt += 1;
            }
        }
    }
}

impl<P: StreamProvider> HandleTable<P> {
    pub fn new(config: ResourceConfig, provider: P) -> Self {
        Self {
            heap: Heap::new(config.heap_size),
            provider,
            config,
            descriptors: Vec::new(),
            paged_index: None,
            paged: None,
            pinned: None,
            current_media: 0,
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    /// Opens the configured index resource and builds the descriptor table.
    pub fn load_index(&mut self) -> ResourceResult<()> {
        let name = self.config.index_name.clone();
        let stream = self
            .provider
            .open(&name)
            .map_err(|source| ResourceError::MissingIndex { name, source })?;
        self.load_index_from(stream)
    }

    /// Builds the descriptor table from an already open index stream.
    pub fn load_index_from(&mut self, mut reader: impl Read) -> ResourceResult<()> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let records = parse_index(&bytes, self.config.index_revision)?;

        self.release_all()?;
        self.paged_index = self.config.paged_resource.as_deref().and_then(|paged| {
            records
                .iter()
                .position(|record| record.name.eq_ignore_ascii_case(paged))
        });
        self.descriptors = records.into_iter().map(ResourceDescriptor::from).collect();

        log::info!(
            "index: {} resources, {} preloaded",
            self.descriptors.len(),
            self.descriptors.iter().filter(|d| d.is_preload()).count()
        );
        Ok(())
    }

    /// Gives every descriptor a node: preloaded resources are read now into
    /// fixed memory, the rest start as discarded placeholders.
    pub fn initialize_residency(&mut self) -> ResourceResult<()> {
        for index in 0..self.descriptors.len() {
            let descriptor = &self.descriptors[index];
            if descriptor.node.is_some() {
                continue;
            }
            if descriptor.is_preload() {
                let size = descriptor.size as usize;
                let node = self.heap.allocate(AllocFlags::FIXED, size)?;
                self.descriptors[index].node = Some(node);
                self.read_resource(index)?;
            } else {
                let node = self
                    .heap
                    .allocate(AllocFlags::DISCARDABLE | AllocFlags::NO_ALLOC, 0)?;
                self.descriptors[index].node = Some(node);
            }
        }
        Ok(())
    }

    /// Makes the resource behind `handle` resident and returns its bytes from
    /// the handle's offset onwards.
    pub fn resolve(&mut self, handle: Handle) -> ResourceResult<&[u8]> {
        let index = handle.index();
        let descriptor = self
            .descriptors
            .get(index)
            .ok_or(ResourceError::BadHandle(handle))?;
        let node = descriptor.node.ok_or(ResourceError::NotInitialized(handle))?;
        let (preload, size) = (descriptor.is_preload(), descriptor.size as usize);
        if size == 0 && Some(index) != self.paged_index {
            // empty resources have no backing memory to fill
            if handle.offset() != 0 {
                return Err(ResourceError::OffsetOutOfRange { handle, size });
            }
            return Ok(&[]);
        }

        let (start, end) = if Some(index) == self.paged_index {
            let range = self.page_in(handle, node)?;
            ((handle.0 - range.base.0) as usize, range.len())
        } else {
            if !preload && self.heap.node(node)?.is_discarded() {
                self.heap.reallocate(node, size, AllocFlags::DISCARDABLE)?;
                self.read_resource(index)?;
            }
            (handle.offset() as usize, size)
        };

        self.heap.touch(node)?;
        let data = self
            .heap
            .data(node)?
            .ok_or(ResourceError::NotResident(handle))?;
        if start > end || end > data.len() {
            return Err(ResourceError::OffsetOutOfRange { handle, size: end });
        }
        Ok(&data[start..end])
    }

    /// Sets the streaming window of the paged resource and drops whatever
    /// window was resident before.
    pub fn declare_paged_range(
        &mut self,
        base: Handle,
        top: Handle,
        backing_path: impl Into<String>,
    ) -> ResourceResult<()> {
        let index = self.paged_index.ok_or(ResourceError::NoPagedResource)?;
        if top <= base || base.index() != index || Handle(top.0 - 1).index() != index {
            return Err(ResourceError::InvalidPagedRange { base, top });
        }

        let range = PagedRange {
            base,
            top,
            backing_path: backing_path.into(),
        };
        if let Some(pending) = self.paged.as_ref().filter(|state| !state.loaded) {
            if pending.range != range && pending.range.overlaps(&range) {
                return Err(ResourceError::OverlappingPagedRange {
                    base,
                    top,
                    pending_base: pending.range.base,
                    pending_top: pending.range.top,
                });
            }
        }

        if let Some(node) = self.descriptors[index].node {
            if !self.heap.node(node)?.is_discarded() {
                self.heap.discard(node)?;
            }
        }
        self.descriptors[index].flags.remove(ResourceFlags::LOADED);
        log::debug!("paged range {}..{} from {}", base, top, range.backing_path);
        self.paged = Some(PagedState { range, loaded: false });
        Ok(())
    }

    pub fn paged_range(&self) -> Option<&PagedRange> {
        self.paged.as_ref().map(|state| &state.range)
    }

    /// Pins the resource behind `handle` resident until `unlock_resident`.
    /// Only one resource is pinned at a time.
    pub fn lock_resident(&mut self, handle: Handle) -> ResourceResult<()> {
        let index = handle.index();
        let descriptor = self
            .descriptors
            .get(index)
            .ok_or(ResourceError::BadHandle(handle))?;
        if descriptor.is_preload() {
            return Ok(());
        }
        if Some(index) == self.paged_index {
            return Err(ResourceError::PagedNotPinnable(handle));
        }
        match self.pinned {
            Some(current) if current == index => return Ok(()),
            Some(current) => {
                return Err(ResourceError::AlreadyPinned {
                    current: Handle::new(current, 0),
                    requested: handle,
                })
            }
            None => {}
        }

        let node = descriptor.node.ok_or(ResourceError::NotInitialized(handle))?;
        let size = descriptor.size as usize;
        let discarded = self.heap.node(node)?.is_discarded();
        self.heap.reallocate(node, size, AllocFlags::MOVABLE)?;
        if discarded {
            self.read_resource(index)?;
        }
        self.heap.lock(node)?;
        self.pinned = Some(index);
        log::debug!("pinned {}", self.descriptors[index].name);
        Ok(())
    }

    pub fn unlock_resident(&mut self, handle: Handle) -> ResourceResult<()> {
        let index = handle.index();
        let descriptor = self
            .descriptors
            .get(index)
            .ok_or(ResourceError::BadHandle(handle))?;
        if descriptor.is_preload() {
            return Ok(());
        }
        if self.pinned != Some(index) {
            return Err(ResourceError::NotPinned(handle));
        }

        let node = descriptor.node.ok_or(ResourceError::NotInitialized(handle))?;
        let size = descriptor.size as usize;
        self.heap.unlock(node)?;
        self.heap.reallocate(node, size, AllocFlags::DISCARDABLE)?;
        self.pinned = None;
        Ok(())
    }

    pub fn pinned(&self) -> Option<Handle> {
        self.pinned.map(|index| Handle::new(index, 0))
    }

    /// Marks the resource as recently used.
    pub fn touch(&mut self, handle: Handle) -> ResourceResult<()> {
        let node = self.node_of(handle)?;
        self.heap.touch(node)?;
        Ok(())
    }

    pub fn is_resident(&self, handle: Handle) -> ResourceResult<bool> {
        let node = self.node_of(handle)?;
        Ok(!self.heap.node(node)?.is_discarded())
    }

    pub fn descriptor(&self, handle: Handle) -> ResourceResult<&ResourceDescriptor> {
        self.descriptors
            .get(handle.index())
            .ok_or(ResourceError::BadHandle(handle))
    }

    pub fn descriptors(&self) -> &[ResourceDescriptor] {
        &self.descriptors
    }

    /// Handle of the first byte of the resource called `name`.
    pub fn find(&self, name: &str) -> Option<Handle> {
        self.descriptors
            .iter()
            .position(|d| d.name.eq_ignore_ascii_case(name))
            .map(|index| Handle::new(index, 0))
    }

    /// Sets the mask of the media currently available.
    pub fn set_current_media(&mut self, mask: u32) {
        self.current_media = mask;
    }

    pub fn current_media(&self) -> u32 {
        self.current_media
    }

    /// Whether reading `handle` needs media other than the current one.
    pub fn requires_media_change(&self, handle: Handle) -> ResourceResult<bool> {
        let media = self.descriptor(handle)?.media;
        Ok(media != 0 && media & self.current_media == 0)
    }

    fn node_of(&self, handle: Handle) -> ResourceResult<NodeRef> {
        self.descriptor(handle)?
            .node
            .ok_or(ResourceError::NotInitialized(handle))
    }

    /// Reads an ordinary resource into its (already sized) node.
    fn read_resource(&mut self, index: usize) -> ResourceResult<()> {
        let handle = Handle::new(index, 0);
        let descriptor = &self.descriptors[index];
        let node = descriptor.node.ok_or(ResourceError::NotInitialized(handle))?;
        let size = descriptor.size as usize;
        let name = descriptor.name.clone();
        if descriptor.flags.contains(ResourceFlags::COMPRESSED) {
            log::warn!("{}: compressed resource is read as stored", name);
        }

        let free = self.heap.free_bytes();
        let attempts = self.config.read_attempts;
        let result = match self.heap.lock(node)? {
            Some(buf) => read_exact_at(&mut self.provider, &name, 0, &mut buf[..size], attempts),
            None => {
                return Err(HeapError::OutOfMemory {
                    requested: size,
                    free,
                }
                .into())
            }
        };
        self.heap.unlock(node)?;

        if let Err(e) = result {
            if self.heap.node(node)?.flags().contains(NodeFlags::DISCARDABLE) {
                self.heap.discard(node)?;
            }
            return Err(e);
        }
        self.descriptors[index].flags |= ResourceFlags::LOADED;
        log::debug!("loaded {} ({} bytes)", name, size);
        Ok(())
    }

    /// Makes the declared window of the paged resource resident.
    fn page_in(&mut self, handle: Handle, node: NodeRef) -> ResourceResult<PagedRange> {
        let range = match self.paged.as_ref() {
            Some(state) if state.range.contains(handle) => state.range.clone(),
            _ => return Err(ResourceError::OutsidePagedRange { handle }),
        };
        if !self.heap.node(node)?.is_discarded() {
            return Ok(range);
        }

        let len = range.len();
        let offset = u64::from(range.base.offset());
        self.heap.reallocate(node, len, AllocFlags::DISCARDABLE)?;
        let free = self.heap.free_bytes();
        let attempts = self.config.read_attempts;
        let result = match self.heap.lock(node)? {
            Some(buf) => read_exact_at(
                &mut self.provider,
                &range.backing_path,
                offset,
                &mut buf[..len],
                attempts,
            ),
            None => {
                return Err(HeapError::OutOfMemory {
                    requested: len,
                    free,
                }
                .into())
            }
        };
        self.heap.unlock(node)?;
        if let Err(e) = result {
            self.heap.discard(node)?;
            return Err(e);
        }

        if let Some(state) = self.paged.as_mut() {
            state.loaded = true;
        }
        self.descriptors[handle.index()].flags |= ResourceFlags::LOADED;
        log::debug!("paged in {} bytes of {} at {:#x}", len, range.backing_path, offset);
        Ok(range)
    }

    fn release_all(&mut self) -> ResourceResult<()> {
        for descriptor in self.descriptors.drain(..) {
            if let Some(node) = descriptor.node {
                if self.heap.node(node)?.is_locked() {
                    self.heap.unlock(node)?;
                }
                self.heap.free(node)?;
            }
        }
        self.pinned = None;
        self.paged = None;
        self.paged_index = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfigBuilder;
    use crate::vfs::MemProvider;
    use pretty_assertions::assert_eq;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
    }

    fn table_with(
        records: &[IndexRecord],
        files: &[(&str, Vec<u8>)],
        heap_size: usize,
    ) -> HandleTable<MemProvider> {
        let mut provider =
            MemProvider::new().with_file("INDEX", build_index(records, IndexRevision::Current));
        for (name, bytes) in files {
            provider.insert(*name, bytes.clone());
        }
        let config = ResourceConfigBuilder::new().with_heap_size(heap_size).get();
        let mut table = HandleTable::new(config, provider);
        table.load_index().unwrap();
        table.initialize_residency().unwrap();
        table
    }

    #[test]
    fn discarded_resource_is_reread_exactly_once() {
        let content = pattern(100, 3);
        let mut table = table_with(
            &[IndexRecord::new("TEST.DAT", 100, ResourceFlags::DISCARDABLE)],
            &[("TEST.DAT", content.clone())],
            4096,
        );
        let handle = Handle::new(0, 0);
        assert_eq!(table.provider().opens_of("TEST.DAT"), 0);
        assert!(!table.is_resident(handle).unwrap());

        assert_eq!(table.resolve(handle).unwrap(), &content[..]);
        assert_eq!(table.provider().opens_of("TEST.DAT"), 1);
        assert_eq!(table.resolve(Handle::new(0, 10)).unwrap(), &content[10..]);
        assert_eq!(table.provider().opens_of("TEST.DAT"), 1);

        let node = table.descriptor(handle).unwrap().node().unwrap();
        table.heap_mut().discard(node).unwrap();
        let before = table.provider().bytes_read();
        assert_eq!(table.resolve(handle).unwrap(), &content[..]);
        assert_eq!(table.provider().opens_of("TEST.DAT"), 2);
        assert_eq!(table.provider().bytes_read() - before, 100);
        assert!(table.descriptor(handle).unwrap().flags().contains(ResourceFlags::LOADED));
    }

    #[test]
    fn empty_resource_resolves_to_no_bytes() {
        let mut table = table_with(
            &[IndexRecord::new("EMPTY.DAT", 0, ResourceFlags::DISCARDABLE)],
            &[("EMPTY.DAT", Vec::new())],
            256,
        );
        assert_eq!(table.resolve(Handle::new(0, 0)).unwrap(), &[] as &[u8]);
        assert_eq!(table.provider().opens_of("EMPTY.DAT"), 0);
        assert!(matches!(
            table.resolve(Handle::new(0, 1)),
            Err(ResourceError::OffsetOutOfRange { size: 0, .. })
        ));
        table.heap().check_integrity().unwrap();
    }

    #[test]
    fn reversed_range_is_empty() {
        let range = PagedRange {
            base: Handle::new(0, 0x200),
            top: Handle::new(0, 0x100),
            backing_path: "CD1.DAT".to_string(),
        };
        assert_eq!(range.len(), 0);
        assert!(range.is_empty());
        assert!(!range.contains(Handle::new(0, 0x180)));
    }

    #[test]
    fn preloaded_resources_never_hit_the_backing_store_again() {
        let boot = pattern(16, 9);
        let mut table = table_with(
            &[
                IndexRecord::new("BOOT.DAT", 16, ResourceFlags::PRELOAD),
                IndexRecord::new("BIG.DAT", 2048, ResourceFlags::DISCARDABLE),
            ],
            &[("BOOT.DAT", boot.clone()), ("BIG.DAT", pattern(2048, 1))],
            2048 + 64,
        );
        assert_eq!(table.provider().opens_of("BOOT.DAT"), 1);

        for _ in 0..3 {
            assert_eq!(table.resolve(Handle::new(0, 0)).unwrap(), &boot[..]);
            table.resolve(Handle::new(1, 0)).unwrap();
            let big = table.descriptor(Handle::new(1, 0)).unwrap().node().unwrap();
            table.heap_mut().discard(big).unwrap();
        }
        assert_eq!(table.provider().opens_of("BOOT.DAT"), 1);
        assert_eq!(table.provider().opens_of("BIG.DAT"), 3);
    }

    #[test]
    fn missing_and_corrupt_index() {
        let mut table = HandleTable::new(ResourceConfig::default(), MemProvider::new());
        assert!(matches!(
            table.load_index(),
            Err(ResourceError::MissingIndex { ref name, .. }) if name == "INDEX"
        ));

        let provider = MemProvider::new().with_file("INDEX", vec![0u8; 30]);
        let mut table = HandleTable::new(ResourceConfig::default(), provider);
        assert!(matches!(
            table.load_index(),
            Err(ResourceError::CorruptIndex { len: 30, record: 24 })
        ));
    }

    #[test]
    fn bad_handles() {
        let mut table = table_with(
            &[IndexRecord::new("TEST.DAT", 8, ResourceFlags::DISCARDABLE)],
            &[("TEST.DAT", pattern(8, 0))],
            256,
        );
        assert!(matches!(
            table.resolve(Handle::new(4, 0)),
            Err(ResourceError::BadHandle(_))
        ));
        assert!(matches!(
            table.resolve(Handle::new(0, 9)),
            Err(ResourceError::OffsetOutOfRange { size: 8, .. })
        ));
    }

    #[test]
    fn paged_resource_reads_only_the_window() {
        let disc = pattern(1024, 5);
        let mut table = table_with(
            &[
                IndexRecord::new("TEST.DAT", 8, ResourceFlags::DISCARDABLE),
                IndexRecord::new("CDPLAY", SIZE_MASK, ResourceFlags::DISCARDABLE),
            ],
            &[("TEST.DAT", pattern(8, 0)), ("CD1.DAT", disc.clone())],
            4096,
        );

        assert!(matches!(
            table.resolve(Handle::new(1, 300)),
            Err(ResourceError::OutsidePagedRange { .. })
        ));

        table
            .declare_paged_range(Handle::new(1, 256), Handle::new(1, 512), "CD1.DAT")
            .unwrap();
        let before = table.provider().bytes_read();
        assert_eq!(table.resolve(Handle::new(1, 300)).unwrap(), &disc[300..512]);
        assert_eq!(table.provider().bytes_read() - before, 256);
        assert_eq!(table.resolve(Handle::new(1, 256)).unwrap(), &disc[256..512]);
        assert_eq!(table.provider().opens_of("CD1.DAT"), 1);

        assert!(matches!(
            table.resolve(Handle::new(1, 100)),
            Err(ResourceError::OutsidePagedRange { .. })
        ));
        assert!(matches!(
            table.resolve(Handle::new(1, 512)),
            Err(ResourceError::OutsidePagedRange { .. })
        ));
    }

    #[test]
    fn redeclaring_an_unread_range_is_rejected() {
        let disc = pattern(1024, 5);
        let mut table = table_with(
            &[IndexRecord::new("CDPLAY", SIZE_MASK, ResourceFlags::DISCARDABLE)],
            &[("CD1.DAT", disc.clone())],
            4096,
        );
        let (a_base, a_top) = (Handle::new(0, 0), Handle::new(0, 256));
        let (b_base, b_top) = (Handle::new(0, 128), Handle::new(0, 640));

        table.declare_paged_range(a_base, a_top, "CD1.DAT").unwrap();
        assert!(matches!(
            table.declare_paged_range(b_base, b_top, "CD1.DAT"),
            Err(ResourceError::OverlappingPagedRange { .. })
        ));
        table.declare_paged_range(a_base, a_top, "CD1.DAT").unwrap();

        assert_eq!(table.resolve(a_base).unwrap(), &disc[..256]);
        table.declare_paged_range(b_base, b_top, "CD1.DAT").unwrap();
        assert!(!table.is_resident(b_base).unwrap());
        assert_eq!(table.resolve(Handle::new(0, 600)).unwrap(), &disc[600..640]);
        assert_eq!(table.paged_range().unwrap().len(), 512);

        assert!(matches!(
            table.declare_paged_range(b_top, b_base, "CD1.DAT"),
            Err(ResourceError::InvalidPagedRange { .. })
        ));
    }

    #[test]
    fn paging_needs_a_paged_descriptor() {
        let mut table = table_with(
            &[IndexRecord::new("TEST.DAT", 8, ResourceFlags::DISCARDABLE)],
            &[("TEST.DAT", pattern(8, 0))],
            256,
        );
        assert!(matches!(
            table.declare_paged_range(Handle::new(0, 0), Handle::new(0, 4), "X"),
            Err(ResourceError::NoPagedResource)
        ));
    }

    #[test]
    fn pinned_scene_survives_pressure() {
        let scene = pattern(64, 11);
        let mut table = table_with(
            &[
                IndexRecord::new("SCENE1.SCN", 64, ResourceFlags::DISCARDABLE),
                IndexRecord::new("SCENE2.SCN", 64, ResourceFlags::DISCARDABLE),
            ],
            &[("SCENE1.SCN", scene.clone()), ("SCENE2.SCN", pattern(64, 12))],
            128,
        );
        let scene1 = Handle::new(0, 0);
        let scene2 = Handle::new(1, 0);

        table.lock_resident(scene1).unwrap();
        assert_eq!(table.pinned(), Some(scene1));
        assert!(table.heap_mut().allocate(AllocFlags::FIXED, 64).is_ok());
        assert!(matches!(
            table.heap_mut().allocate(AllocFlags::FIXED, 64),
            Err(HeapError::OutOfMemory { .. })
        ));
        assert_eq!(table.resolve(scene1).unwrap(), &scene[..]);

        assert!(matches!(
            table.lock_resident(scene2),
            Err(ResourceError::AlreadyPinned { current, .. }) if current == scene1
        ));
        assert!(matches!(
            table.unlock_resident(scene2),
            Err(ResourceError::NotPinned(_))
        ));

        table.unlock_resident(scene1).unwrap();
        assert_eq!(table.pinned(), None);
        let node = table.descriptor(scene1).unwrap().node().unwrap();
        assert!(table.heap().node(node).unwrap().flags().contains(NodeFlags::DISCARDABLE));
        table.heap_mut().discard(node).unwrap();
    }

    #[test]
    fn failed_reads_are_retried() {
        let content = pattern(32, 2);
        let mut table = table_with(
            &[IndexRecord::new("TEST.DAT", 32, ResourceFlags::DISCARDABLE)],
            &[("TEST.DAT", content.clone())],
            256,
        );
        table.provider_mut().fail_next_opens("TEST.DAT", 2);
        assert_eq!(table.resolve(Handle::new(0, 0)).unwrap(), &content[..]);

        let node = table.descriptor(Handle::new(0, 0)).unwrap().node().unwrap();
        table.heap_mut().discard(node).unwrap();
        table.provider_mut().fail_next_opens("TEST.DAT", 3);
        assert!(matches!(
            table.resolve(Handle::new(0, 0)),
            Err(ResourceError::ShortRead { wanted: 32, .. })
        ));
        assert!(!table.is_resident(Handle::new(0, 0)).unwrap());
        table.heap().check_integrity().unwrap();
    }

    #[test]
    fn truncated_backing_file_is_a_short_read() {
        let mut table = table_with(
            &[IndexRecord::new("TEST.DAT", 32, ResourceFlags::DISCARDABLE)],
            &[("TEST.DAT", pattern(20, 2))],
            256,
        );
        assert!(matches!(
            table.resolve(Handle::new(0, 0)),
            Err(ResourceError::ShortRead { .. })
        ));
        assert_eq!(table.provider().opens_of("TEST.DAT"), 3);
    }

    #[test]
    fn media_affinity() {
        let mut table = table_with(
            &[
                IndexRecord::new("ANY.DAT", 4, ResourceFlags::DISCARDABLE),
                IndexRecord::new("DISC2.DAT", 4, ResourceFlags::DISCARDABLE).with_media(0b10),
            ],
            &[],
            256,
        );
        table.set_current_media(0b01);
        assert!(!table.requires_media_change(Handle::new(0, 0)).unwrap());
        assert!(table.requires_media_change(Handle::new(1, 0)).unwrap());
        table.set_current_media(0b11);
        assert!(!table.requires_media_change(Handle::new(1, 0)).unwrap());
        assert_eq!(table.find("disc2.dat"), Some(Handle::new(1, 0)));
    }

    #[test]
    fn compressed_resources_load_as_stored() {
        let stored = pattern(12, 40);
        let mut table = table_with(
            &[IndexRecord::new(
                "PACKED.DAT",
                12,
                ResourceFlags::DISCARDABLE | ResourceFlags::COMPRESSED,
            )],
            &[("PACKED.DAT", stored.clone())],
            256,
        );
        assert_eq!(table.resolve(Handle::new(0, 0)).unwrap(), &stored[..]);
    }

    #[test]
    fn handle_packing() {
        let handle = Handle::new(0x34, 0x1B_3C4F);
        assert_eq!(handle.index(), 0x34);
        assert_eq!(handle.offset(), 0x1B_3C4F);
        assert_eq!(Handle(0x1A2B_3C4F).index(), 0x34);
        assert_eq!(handle.to_string(), "1A1B3C4F");
    }
}
