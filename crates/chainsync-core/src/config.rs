//! Indexing service configuration and state types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::EventSourceDescriptor;

/// Log level per component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Global default level: "trace" | "debug" | "info" | "warn" | "error"
    #[serde(default = "default_level")]
    pub level: String,
    /// Override per component: component_name → level
    #[serde(default)]
    pub components: HashMap<String, String>,
    /// Emit JSON structured logs (true) or human-readable text (false)
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            components: HashMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Filter directive string, e.g. `"info,chainsync_service=debug"`.
    pub fn directives(&self) -> String {
        let mut directives = self.level.clone();
        let mut components: Vec<_> = self.components.iter().collect();
        components.sort();
        for (component, level) in components {
            directives.push_str(&format!(",{}={}", component.replace('-', "_"), level));
        }
        directives
    }
}

/// Configuration for an indexing service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingConfig {
    /// Unique name for this indexer (appears in logs).
    pub id: String,
    /// Chain being indexed (e.g. `"ethereum"`).
    pub chain: String,
    /// Configured event sources.
    #[serde(default)]
    pub sources: Vec<EventSourceDescriptor>,
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            chain: "ethereum".into(),
            sources: vec![],
            log: LogConfig::default(),
        }
    }
}

impl IndexingConfig {
    /// Check source names are unique and every source declares at least one event.
    pub fn validate(&self) -> Result<(), IndexerError> {
        for (i, source) in self.sources.iter().enumerate() {
            if source.name.is_empty() || source.name.contains(':') {
                return Err(IndexerError::Config(format!(
                    "invalid source name '{}'",
                    source.name
                )));
            }
            if source.events.is_empty() {
                return Err(IndexerError::Config(format!(
                    "source '{}' declares no events",
                    source.name
                )));
            }
            if self.sources[..i].iter().any(|s| s.name == source.name) {
                return Err(IndexerError::Config(format!(
                    "duplicate source '{}'",
                    source.name
                )));
            }
        }
        Ok(())
    }
}

/// Runtime state of the indexing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    /// Not yet reset; nothing to index into.
    Uninitialized,
    /// Ready, waiting for the next checkpoint.
    Idle,
    /// Dispatching events.
    Processing,
    /// Rewinding the store after a reorg.
    ReorgRecovery,
    /// A handler failed; a reset is required.
    Halted,
    /// Terminated by `kill()`.
    Killed,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Idle => write!(f, "idle"),
            Self::Processing => write!(f, "processing"),
            Self::ReorgRecovery => write!(f, "reorg-recovery"),
            Self::Halted => write!(f, "halted"),
            Self::Killed => write!(f, "killed"),
        }
    }
}
