//! Shared fixtures for indexing service tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;

use chainsync_core::{
    Block, ColumnType, Db, EventFilter, EventHandler, EventSignature, EventSourceDescriptor,
    IndexerError, IndexingContext, Log, LogEvent, MemoryAggregator, Record, RecordStore, Schema,
    SetupHandler, StoreVersion, Table, Transaction,
};
use chainsync_service::{IndexingService, IndexingServiceBuilder};
use chainsync_storage::MemoryRecordStore;

pub const TOKEN: &str = "0xaa";
pub const TRANSFER_SIG: &str = "Transfer(address,address,uint256)";
pub const APPROVAL_SIG: &str = "Approval(address,address,uint256)";

pub fn sources() -> Vec<EventSourceDescriptor> {
    vec![EventSourceDescriptor::new("Token", EventFilter::address(TOKEN))
        .event(TRANSFER_SIG)
        .event(APPROVAL_SIG)]
}

pub fn schema() -> Schema {
    Schema::new()
        .table(
            "Transfer",
            Table::default()
                .column("from", ColumnType::String)
                .column("to", ColumnType::String)
                .column("amount", ColumnType::BigInt)
                .column("timestamp", ColumnType::Int),
        )
        .table(
            "Account",
            Table::default().column("received", ColumnType::Int),
        )
}

fn event(name: &str, signature: &str, ts: u64, log_index: u32, to: &str) -> LogEvent {
    LogEvent {
        source: "Token".into(),
        name: name.into(),
        params: json!({ "from": "0xf00", "to": to, "value": "1000" }),
        log: Log {
            id: format!("0xb{ts}-{log_index}"),
            address: TOKEN.into(),
            topics: vec![EventSignature::new(signature).selector().to_string()],
            data: "0x".into(),
            log_index,
        },
        block: Block {
            number: ts,
            hash: format!("0xb{ts}"),
            parent_hash: format!("0xb{}", ts.saturating_sub(1)),
            timestamp: ts,
        },
        transaction: Transaction {
            hash: format!("0xt{ts}-{log_index}"),
            from: "0xf00".into(),
            to: Some(TOKEN.into()),
            index: log_index,
        },
    }
}

pub fn transfer(ts: u64, log_index: u32, to: &str) -> LogEvent {
    event("Transfer", TRANSFER_SIG, ts, log_index, to)
}

pub fn approval(ts: u64, log_index: u32) -> LogEvent {
    event("Approval", APPROVAL_SIG, ts, log_index, "0xspender")
}

pub struct Harness {
    pub service: Arc<IndexingService>,
    pub aggregator: Arc<MemoryAggregator>,
    pub store: Arc<MemoryRecordStore>,
}

pub fn harness(page_size: usize) -> Harness {
    let aggregator = Arc::new(MemoryAggregator::new(sources(), page_size));
    let store = Arc::new(MemoryRecordStore::new());
    let service = service_over(aggregator.clone(), store.clone());
    Harness {
        service: Arc::new(service),
        aggregator,
        store,
    }
}

pub fn service_over(
    aggregator: Arc<MemoryAggregator>,
    store: Arc<dyn RecordStore>,
) -> IndexingService {
    let mut builder = IndexingServiceBuilder::new().id("test").chain("ethereum");
    for source in sources() {
        builder = builder.source(source);
    }
    builder.aggregator(aggregator).store(store).build().unwrap()
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

/// Writes a `Transfer` row and bumps the recipient's `Account.received`.
pub struct RecordTransfer;

#[async_trait]
impl EventHandler for RecordTransfer {
    async fn handle(&self, event: &LogEvent, ctx: &IndexingContext) -> anyhow::Result<()> {
        let to = event.params["to"].as_str().unwrap_or_default().to_string();
        ctx.db()
            .create(
                "Transfer",
                &event.log.id,
                json!({
                    "from": event.params["from"],
                    "to": to,
                    "amount": event.params["value"],
                    "timestamp": event.block.timestamp,
                }),
            )
            .await?;
        let received = ctx
            .db()
            .find("Account", &to)
            .await?
            .and_then(|r| r.get("received").and_then(|v| v.as_u64()))
            .unwrap_or(0);
        ctx.db()
            .upsert(
                "Account",
                &to,
                json!({ "received": 1 }),
                json!({ "received": received + 1 }),
            )
            .await?;
        Ok(())
    }
}

/// Records every event and context block it was called with.
#[derive(Default)]
pub struct Recorder {
    pub seen: Mutex<Vec<(LogEvent, Option<Block>)>>,
}

#[async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, event: &LogEvent, ctx: &IndexingContext) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((event.clone(), ctx.block.clone()));
        Ok(())
    }
}

/// Fails on events at `fail_at`, succeeds elsewhere.
pub struct FailAt(pub u64);

#[async_trait]
impl EventHandler for FailAt {
    async fn handle(&self, event: &LogEvent, _ctx: &IndexingContext) -> anyhow::Result<()> {
        if event.block.timestamp == self.0 {
            anyhow::bail!("boom at {}", self.0);
        }
        Ok(())
    }
}

/// Parks until released, keeping a clone of the handler's `Db` facade.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
    pub db: Mutex<Option<Db>>,
}

#[async_trait]
impl EventHandler for Gate {
    async fn handle(&self, _event: &LogEvent, ctx: &IndexingContext) -> anyhow::Result<()> {
        *self.db.lock().unwrap() = Some(ctx.db().clone());
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

/// Setup function that seeds an account.
pub struct SeedAccount;

#[async_trait]
impl SetupHandler for SeedAccount {
    async fn setup(&self, ctx: &IndexingContext) -> anyhow::Result<()> {
        ctx.db()
            .create("Account", "0xtreasury", json!({ "received": 0 }))
            .await?;
        Ok(())
    }
}

pub struct FailingSetup;

#[async_trait]
impl SetupHandler for FailingSetup {
    async fn setup(&self, _ctx: &IndexingContext) -> anyhow::Result<()> {
        anyhow::bail!("setup exploded")
    }
}

/// Setup function that never finishes on its own.
#[derive(Default)]
pub struct ParkedSetup {
    pub entered: Notify,
}

#[async_trait]
impl SetupHandler for ParkedSetup {
    async fn setup(&self, _ctx: &IndexingContext) -> anyhow::Result<()> {
        self.entered.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }
}

// ─── Stores ───────────────────────────────────────────────────────────────────

/// `MemoryRecordStore` whose `revert` parks until released.
#[derive(Default)]
pub struct GatedRevertStore {
    pub inner: MemoryRecordStore,
    pub entered: Notify,
    pub release: Notify,
}

#[async_trait]
impl RecordStore for GatedRevertStore {
    async fn rebuild(&self, schema: &Schema) -> Result<StoreVersion, IndexerError> {
        self.inner.rebuild(schema).await
    }

    fn version(&self) -> Option<StoreVersion> {
        self.inner.version()
    }

    async fn create(
        &self,
        version: StoreVersion,
        entity: &str,
        id: &str,
        timestamp: u64,
        data: Value,
    ) -> Result<Record, IndexerError> {
        self.inner.create(version, entity, id, timestamp, data).await
    }

    async fn update(
        &self,
        version: StoreVersion,
        entity: &str,
        id: &str,
        timestamp: u64,
        patch: Value,
    ) -> Result<Record, IndexerError> {
        self.inner.update(version, entity, id, timestamp, patch).await
    }

    async fn upsert(
        &self,
        version: StoreVersion,
        entity: &str,
        id: &str,
        timestamp: u64,
        create: Value,
        patch: Value,
    ) -> Result<Record, IndexerError> {
        self.inner
            .upsert(version, entity, id, timestamp, create, patch)
            .await
    }

    async fn delete(
        &self,
        version: StoreVersion,
        entity: &str,
        id: &str,
        timestamp: u64,
    ) -> Result<bool, IndexerError> {
        self.inner.delete(version, entity, id, timestamp).await
    }

    async fn find(
        &self,
        version: StoreVersion,
        entity: &str,
        id: &str,
    ) -> Result<Option<Record>, IndexerError> {
        self.inner.find(version, entity, id).await
    }

    async fn find_many(
        &self,
        version: StoreVersion,
        entity: &str,
        filter: Option<&Value>,
    ) -> Result<Vec<Record>, IndexerError> {
        self.inner.find_many(version, entity, filter).await
    }

    async fn revert(&self, version: StoreVersion, safe_timestamp: u64) -> Result<(), IndexerError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.revert(version, safe_timestamp).await
    }
}
