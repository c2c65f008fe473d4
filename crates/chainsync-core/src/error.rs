//! Error types for the chainsync pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreVersion;
use crate::types::LogEvent;

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Aggregator error: {0}")]
    Aggregator(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Stale store version {actual}: current version is {expected}")]
    StaleVersion {
        expected: StoreVersion,
        actual: StoreVersion,
    },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Handler error in '{event}': {reason}")]
    Handler { event: String, reason: String },

    #[error("Indexing service was killed")]
    Killed,

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the error came from a write through a superseded store version.
    pub fn is_stale_version(&self) -> bool {
        matches!(self, Self::StaleVersion { .. })
    }

    /// Returns `true` if the error originates from infrastructure (aggregator or store I/O).
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Aggregator(_) | Self::Storage(_))
    }
}

/// Sticky record of the first user-handler failure since the last reset.
///
/// While set, event dispatch and reorg handling refuse to make progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineError {
    /// Label of the failing function (`"<source>:<event>"` or `"setup"`).
    pub label: String,
    /// Block number of the failing event; `None` for setup.
    pub block_number: Option<u64>,
    /// Log id of the failing event; `None` for setup.
    pub log_id: Option<String>,
    /// Block timestamp of the failing event (`0` for setup).
    pub timestamp: u64,
    /// Rendered error chain.
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

impl PipelineError {
    pub fn new(label: impl Into<String>, event: Option<&LogEvent>, error: &anyhow::Error) -> Self {
        Self {
            label: label.into(),
            block_number: event.map(|e| e.block.number),
            log_id: event.map(|e| e.log.id.clone()),
            timestamp: event.map(|e| e.block.timestamp).unwrap_or(0),
            reason: format!("{error:#}"),
            occurred_at: Utc::now(),
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.block_number {
            Some(block) => write!(f, "'{}' failed at block {block}: {}", self.label, self.reason),
            None => write!(f, "'{}' failed: {}", self.label, self.reason),
        }
    }
}

impl From<&PipelineError> for IndexerError {
    fn from(e: &PipelineError) -> Self {
        Self::Handler {
            event: e.label.clone(),
            reason: e.reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_version_display() {
        let err = IndexerError::StaleVersion {
            expected: StoreVersion::new(3),
            actual: StoreVersion::new(2),
        };
        assert!(err.is_stale_version());
        assert_eq!(
            err.to_string(),
            "Stale store version v2: current version is v3"
        );
    }

    #[test]
    fn pipeline_error_renders_context() {
        let err = anyhow::anyhow!("balance underflow").context("Token:Transfer handler");
        let pe = PipelineError::new("Token:Transfer", None, &err);
        assert_eq!(pe.timestamp, 0);
        assert!(pe.reason.contains("balance underflow"));
        assert_eq!(
            IndexerError::from(&pe).to_string(),
            format!("Handler error in 'Token:Transfer': {}", pe.reason)
        );
    }

    #[test]
    fn infrastructure_classification() {
        assert!(IndexerError::Aggregator("down".into()).is_infrastructure());
        assert!(IndexerError::Storage("disk".into()).is_infrastructure());
        assert!(!IndexerError::Killed.is_infrastructure());
    }
}
