//! `chainsync replay`: drive an indexing service over a recorded fixture.
//!
//! A fixture is a JSON file holding the indexer config, the decoded events
//! the aggregator should serve, and a script of checkpoint / reorg steps:
//!
//! ```json
//! {
//!   "config": { "id": "usdc", "chain": "ethereum", "sources": [ ... ] },
//!   "page_size": 100,
//!   "events": [ ... ],
//!   "steps": [ { "checkpoint": 10 }, { "reorg": 6 }, { "checkpoint": 12 } ]
//! }
//! ```
//!
//! Every declared event is stored in an `Event` table by a built-in handler.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use chainsync_core::{
    ColumnType, EventAggregator, EventHandler, IndexingConfig, IndexingContext, IndexingFunctions,
    LogEvent, MemoryAggregator, MetricsSnapshot, Schema, Table,
};
use chainsync_service::IndexingServiceBuilder;
use chainsync_storage::MemoryRecordStore;

/// Entity written by the built-in handler.
pub const EVENT_TABLE: &str = "Event";

#[derive(Debug, Clone, Deserialize)]
pub struct Fixture {
    pub config: IndexingConfig,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub events: Vec<LogEvent>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_page_size() -> usize {
    100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Finalize everything up to this timestamp, then process.
    Checkpoint(u64),
    /// Reorg back to this common ancestor timestamp.
    Reorg(u64),
}

/// What a replay prints.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub watermark: Option<u64>,
    pub records: usize,
    pub pipeline_error: Option<String>,
    pub metrics: MetricsSnapshot,
}

pub fn load(path: &Path) -> anyhow::Result<Fixture> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading fixture {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing fixture {}", path.display()))
}

fn schema() -> Schema {
    Schema::new().table(
        EVENT_TABLE,
        Table::default()
            .column("source", ColumnType::String)
            .column("name", ColumnType::String)
            .column("block_number", ColumnType::Int)
            .column("timestamp", ColumnType::Int)
            .column("params", ColumnType::Json),
    )
}

/// Stores each event it sees as an `Event` row keyed by log id.
struct StoreEvent;

#[async_trait]
impl EventHandler for StoreEvent {
    async fn handle(&self, event: &LogEvent, ctx: &IndexingContext) -> anyhow::Result<()> {
        ctx.db()
            .create(
                EVENT_TABLE,
                &event.log.id,
                json!({
                    "source": event.source,
                    "name": event.name,
                    "block_number": event.block.number,
                    "timestamp": event.block.timestamp,
                    "params": event.params,
                }),
            )
            .await?;
        Ok(())
    }
}

pub async fn run(fixture: Fixture) -> anyhow::Result<ReplayReport> {
    let aggregator = Arc::new(MemoryAggregator::new(
        fixture.config.sources.clone(),
        fixture.page_size.max(1),
    ));
    let store = Arc::new(MemoryRecordStore::new());

    let mut functions = IndexingFunctions::new();
    for source in &fixture.config.sources {
        for sig in &source.events {
            functions = functions.on(format!("{}:{}", source.name, sig.name()), Arc::new(StoreEvent));
        }
    }

    let service = IndexingServiceBuilder::new()
        .config(fixture.config)
        .aggregator(aggregator.clone())
        .store(store.clone())
        .build()?;
    service.reset(schema(), functions).await?;

    let total = fixture.events.len();
    let kept = aggregator.push_events(fixture.events);
    info!(total, kept, "Fixture events loaded");

    for step in fixture.steps {
        match step {
            Step::Checkpoint(timestamp) => {
                aggregator.set_checkpoint(timestamp);
                service.process_events().await?;
            }
            Step::Reorg(timestamp) => {
                aggregator.reorg(timestamp);
                service.handle_reorg(timestamp).await?;
                service.process_events().await?;
            }
        }
    }
    info!(checkpoint = aggregator.checkpoint(), "Replay finished");

    let report = ReplayReport {
        watermark: service.watermark(),
        records: store.records(EVENT_TABLE).len(),
        pipeline_error: service.pipeline_error().map(|e| e.to_string()),
        metrics: service.metrics().snapshot(),
    };
    service.kill();
    Ok(report)
}
