use serde::{Deserialize, Serialize};

use crate::handle::IndexRevision;

/// Configuration of the heap and the resource handle table.
/// Please use [`ResourceConfigBuilder`] if you want to build it from code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Arena size handed to the heap, in bytes.
    pub(crate) heap_size: usize,
    /// Name of the index resource opened by `load_index`.
    pub(crate) index_name: String,
    pub(crate) index_revision: IndexRevision,
    /// Name of the descriptor streamed through the paged range, if any.
    pub(crate) paged_resource: Option<String>,
    /// How many times a failed or short read is attempted before giving up.
    pub(crate) read_attempts: u32,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            heap_size: 5 * 1024 * 1024,
            index_name: "INDEX".to_string(),
            index_revision: IndexRevision::Current,
            paged_resource: Some("CDPLAY".to_string()),
            read_attempts: 3,
        }
    }
}

impl ResourceConfig {
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn index_revision(&self) -> IndexRevision {
        self.index_revision
    }

    pub fn paged_resource(&self) -> Option<&str> {
        self.paged_resource.as_deref()
    }

    pub fn read_attempts(&self) -> u32 {
        self.read_attempts
    }
}

/// `ResourceConfigBuilder` is a convenience builder to create a `ResourceConfig` from code.
#[derive(Default)]
pub struct ResourceConfigBuilder {
    config: ResourceConfig,
}

impl ResourceConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_heap_size(mut self, heap_size: usize) -> Self {
        self.config.heap_size = heap_size;
        self
    }

    pub fn with_index_name(mut self, index_name: impl Into<String>) -> Self {
        self.config.index_name = index_name.into();
        self
    }

    pub fn with_index_revision(mut self, revision: IndexRevision) -> Self {
        self.config.index_revision = revision;
        self
    }

    /// Sets the descriptor name streamed through the paged range; `None`
    /// disables paging.
    pub fn with_paged_resource(mut self, name: Option<String>) -> Self {
        self.config.paged_resource = name;
        self
    }

    pub fn with_read_attempts(mut self, attempts: u32) -> Self {
        self.config.read_attempts = attempts.max(1);
        self
    }

    /// Retrieves the configuration built
    pub fn get(self) -> ResourceConfig {
        self.config
    }
}
