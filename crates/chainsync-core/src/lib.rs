//! chainsync-core: foundation for the reorg-safe event indexing service.
//!
//! # Architecture
//!
//! ```text
//! IndexingService (chainsync-service)
//!      ├── CheckpointScheduler (watermark → next fetch window)
//!      ├── EventAggregator     (ordered event pages + finality checkpoint)
//!      ├── HandlerRegistry     ((source, selector) → indexing function)
//!      ├── IndexingContext/Db  (versioned entity facade for handlers)
//!      ├── RecordStore         (versioned, revertible entity store)
//!      └── IndexingMetrics     (matched / handled / processed counters)
//! ```

pub mod aggregator;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod scheduler;
pub mod schema;
pub mod selector;
pub mod store;
pub mod types;

pub use aggregator::{AggregatorEvent, EventAggregator, EventPageStream, MemoryAggregator};
pub use config::{IndexingConfig, LogConfig, ServiceState};
pub use context::{Db, IndexingContext};
pub use error::{IndexerError, PipelineError};
pub use handler::{EventHandler, HandlerEntry, HandlerRegistry, IndexingFunctions, SetupHandler};
pub use metrics::{IndexingMetrics, MetricsSnapshot};
pub use scheduler::{CheckpointScheduler, FetchRange};
pub use schema::{ColumnType, Schema, Table};
pub use selector::{EventSelector, EventSignature};
pub use store::{Record, RecordStore, StoreVersion};
pub use types::{
    Block, EventFilter, EventPage, EventSourceDescriptor, Log, LogEvent, PageMetadata,
    SourceEventCount, Transaction,
};
