//! chainsync-service: the indexing service and its builder.

pub mod builder;
pub mod service;

pub use builder::IndexingServiceBuilder;
pub use service::IndexingService;
