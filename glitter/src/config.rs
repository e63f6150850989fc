use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use glitter_core::ResourceConfig;
use glitter_script::ScriptConfig;
use log::LevelFilter;
use serde::{Deserialize, Serialize};

/// Logger configuration of the tool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct LoggerConfig {
    /// Level for the glitter crates.
    pub app_level_filter: LevelFilter,
    /// Level for everything else.
    pub level_filter: LevelFilter,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            app_level_filter: LevelFilter::Info,
            level_filter: LevelFilter::Warn,
        }
    }
}

impl LoggerConfig {
    pub fn install(&self) {
        let mut builder = env_logger::Builder::new();
        builder.filter_level(self.level_filter);
        for module in ["glitter", "glitter_core", "glitter_script"] {
            builder.filter_module(module, self.app_level_filter);
        }
        builder.parse_default_env();
        let _ = builder.try_init();
    }
}

/// Everything the tool reads from its TOML file.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ToolConfig {
    pub resources: ResourceConfig,
    pub script: ScriptConfig,
    pub logger: LoggerConfig,
}

impl ToolConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("parse tool config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
    }

    /// The file at `path`, or the defaults when no path was given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glitter_core::IndexRevision;
    use glitter_script::ScriptVersion;
    use pretty_assertions::assert_eq;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = ToolConfig::from_toml(
            r#"
            [resources]
            heap_size = 65536
            index_revision = "Legacy"

            [script]
            version = "V1"

            [logger]
            app_level_filter = "Trace"
            "#,
        )
        .unwrap();

        assert_eq!(config.resources.heap_size(), 65536);
        assert_eq!(config.resources.index_revision(), IndexRevision::Legacy);
        assert_eq!(config.resources.index_name(), "INDEX");
        assert_eq!(config.script.version(), ScriptVersion::V1);
        assert_eq!(config.script.pool_size(), 80);
        assert_eq!(config.logger.app_level_filter, LevelFilter::Trace);
        assert_eq!(config.logger.level_filter, LevelFilter::Warn);
    }

    #[test]
    fn empty_file_is_the_default() {
        assert_eq!(ToolConfig::from_toml("").unwrap(), ToolConfig::default());
    }

    #[test]
    fn unknown_values_are_errors() {
        assert!(ToolConfig::from_toml("[script]\nversion = \"V9\"").is_err());
    }
}
