use serde::{Deserialize, Serialize};

use crate::decode::ScriptVersion;

/// Interpreter settings.
/// Please use [`ScriptConfigBuilder`] if you want to build it from code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    pub(crate) version: ScriptVersion,
    /// Maximum number of simultaneously live contexts.
    pub(crate) pool_size: usize,
    /// Number of script globals; 0 when they come from a save file.
    pub(crate) global_count: usize,
    /// Instructions a context may run in one scheduler turn.
    pub(crate) turn_budget: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            version: ScriptVersion::V2,
            pool_size: 80,
            global_count: 0,
            turn_budget: 10_000,
        }
    }
}

impl ScriptConfig {
    pub fn version(&self) -> ScriptVersion {
        self.version
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn global_count(&self) -> usize {
        self.global_count
    }

    pub fn turn_budget(&self) -> usize {
        self.turn_budget
    }
}

/// `ScriptConfigBuilder` is a convenience builder to create a `ScriptConfig` from code.
#[derive(Default)]
pub struct ScriptConfigBuilder {
    config: ScriptConfig,
}

impl ScriptConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: ScriptVersion) -> Self {
        self.config.version = version;
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.config.pool_size = pool_size;
        self
    }

    pub fn with_global_count(mut self, count: usize) -> Self {
        self.config.global_count = count;
        self
    }

    pub fn with_turn_budget(mut self, budget: usize) -> Self {
        self.config.turn_budget = budget.max(1);
        self
    }

    /// Retrieves the configuration built
    pub fn get(self) -> ScriptConfig {
        self.config
    }
}
