//! glitter-core
//!
//! The memory side of the glitter runtime: a fixed-budget heap of fixed,
//! movable and discardable blocks, and the resource handle table that pages
//! game resources in and out of it on demand.

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod handle;
pub mod heap;
pub mod vfs;

pub use config::{ResourceConfig, ResourceConfigBuilder};
pub use handle::{
    Handle, HandleTable, IndexRecord, IndexRevision, PagedRange, ResourceDescriptor, ResourceError,
    ResourceFlags, ResourceResult,
};
pub use heap::{AllocFlags, Heap, HeapError, HeapResult, MemoryNode, NodeFlags, NodeRef};
pub use vfs::{DirProvider, MemProvider, StreamProvider};
