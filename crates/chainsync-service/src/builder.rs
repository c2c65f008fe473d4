//! Fluent builder API for creating indexing services.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainsync_core::{EventFilter, EventSourceDescriptor, MemoryAggregator};
//! use chainsync_service::IndexingServiceBuilder;
//! # fn store() -> Arc<dyn chainsync_core::RecordStore> { unimplemented!() }
//!
//! let token = EventSourceDescriptor::new(
//!     "Token",
//!     EventFilter::address("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
//! )
//! .event("Transfer(address,address,uint256)");
//!
//! let service = IndexingServiceBuilder::new()
//!     .id("usdc")
//!     .chain("ethereum")
//!     .source(token.clone())
//!     .aggregator(Arc::new(MemoryAggregator::new(vec![token], 100)))
//!     .store(store())
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

use chainsync_core::aggregator::EventAggregator;
use chainsync_core::config::{IndexingConfig, LogConfig};
use chainsync_core::error::IndexerError;
use chainsync_core::store::RecordStore;
use chainsync_core::types::EventSourceDescriptor;

use crate::service::IndexingService;

/// Fluent builder for [`IndexingService`].
#[derive(Default)]
pub struct IndexingServiceBuilder {
    config: IndexingConfig,
    aggregator: Option<Arc<dyn EventAggregator>>,
    store: Option<Arc<dyn RecordStore>>,
}

impl IndexingServiceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing config (e.g. loaded from a file).
    pub fn config(mut self, config: IndexingConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the indexer ID (used in logs).
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Set the chain being indexed.
    pub fn chain(mut self, chain: impl Into<String>) -> Self {
        self.config.chain = chain.into();
        self
    }

    /// Add an event source.
    pub fn source(mut self, source: EventSourceDescriptor) -> Self {
        self.config.sources.push(source);
        self
    }

    /// Set the log configuration.
    pub fn log(mut self, log: LogConfig) -> Self {
        self.config.log = log;
        self
    }

    pub fn aggregator(mut self, aggregator: Arc<dyn EventAggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }

    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the `IndexingConfig` only.
    pub fn build_config(self) -> IndexingConfig {
        self.config
    }

    /// Validate the config and build the service.
    pub fn build(self) -> Result<IndexingService, IndexerError> {
        self.config.validate()?;
        let aggregator = self
            .aggregator
            .ok_or_else(|| IndexerError::Config("an event aggregator is required".into()))?;
        let store = self
            .store
            .ok_or_else(|| IndexerError::Config("a record store is required".into()))?;
        Ok(IndexingService::new(self.config, aggregator, store))
    }
}
