//! Indexing context: what a handler sees while it runs.
//!
//! The [`Db`] facade is bound to one [`StoreVersion`] and one block
//! timestamp. Every write is validated against the schema, stamped with that
//! timestamp, and awaited, so it is visible to the next handler (and to
//! external readers) as soon as the call returns. A facade outliving a reset
//! keeps its old version and its writes fail with `StaleVersion`.

use std::sync::Arc;

use serde_json::Value;

use crate::error::IndexerError;
use crate::schema::Schema;
use crate::store::{Record, RecordStore, StoreVersion};
use crate::types::Block;

/// Context passed to indexing functions.
#[derive(Clone)]
pub struct IndexingContext {
    /// The indexer's chain slug (e.g. `"ethereum"`).
    pub chain: String,
    /// The block being processed; `None` during setup.
    pub block: Option<Block>,
    db: Db,
}

impl IndexingContext {
    pub fn new(chain: impl Into<String>, block: Option<Block>, db: Db) -> Self {
        Self {
            chain: chain.into(),
            block,
            db,
        }
    }

    /// Entity operations scoped to the current store version.
    pub fn db(&self) -> &Db {
        &self.db
    }
}

/// Entity facade over a [`RecordStore`], pinned to one store version.
#[derive(Clone)]
pub struct Db {
    store: Arc<dyn RecordStore>,
    schema: Arc<Schema>,
    version: StoreVersion,
    timestamp: u64,
}

impl Db {
    pub fn new(
        store: Arc<dyn RecordStore>,
        schema: Arc<Schema>,
        version: StoreVersion,
        timestamp: u64,
    ) -> Self {
        Self {
            store,
            schema,
            version,
            timestamp,
        }
    }

    /// The store version this facade writes to.
    pub fn version(&self) -> StoreVersion {
        self.version
    }

    /// Timestamp every write through this facade is stamped with.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub async fn create(&self, entity: &str, id: &str, data: Value) -> Result<Record, IndexerError> {
        let data = with_id(id, data)?;
        self.schema.validate_record(entity, &data)?;
        self.store
            .create(self.version, entity, id, self.timestamp, data)
            .await
    }

    pub async fn update(&self, entity: &str, id: &str, patch: Value) -> Result<Record, IndexerError> {
        self.schema.validate_patch(entity, &patch)?;
        self.store
            .update(self.version, entity, id, self.timestamp, patch)
            .await
    }

    /// Create the record if missing, otherwise apply `patch`.
    pub async fn upsert(
        &self,
        entity: &str,
        id: &str,
        create: Value,
        patch: Value,
    ) -> Result<Record, IndexerError> {
        let create = with_id(id, create)?;
        self.schema.validate_record(entity, &create)?;
        self.schema.validate_patch(entity, &patch)?;
        self.store
            .upsert(self.version, entity, id, self.timestamp, create, patch)
            .await
    }

    pub async fn delete(&self, entity: &str, id: &str) -> Result<bool, IndexerError> {
        self.schema.get(entity)?;
        self.store
            .delete(self.version, entity, id, self.timestamp)
            .await
    }

    pub async fn find(&self, entity: &str, id: &str) -> Result<Option<Record>, IndexerError> {
        self.schema.get(entity)?;
        self.store.find(self.version, entity, id).await
    }

    pub async fn find_many(
        &self,
        entity: &str,
        filter: Option<&Value>,
    ) -> Result<Vec<Record>, IndexerError> {
        self.schema.get(entity)?;
        self.store.find_many(self.version, entity, filter).await
    }
}

fn with_id(id: &str, data: Value) -> Result<Value, IndexerError> {
    match data {
        Value::Object(mut obj) => {
            obj.insert("id".into(), Value::String(id.to_string()));
            Ok(Value::Object(obj))
        }
        other => Err(IndexerError::Schema(format!(
            "record '{id}' must be a JSON object, got {other}"
        ))),
    }
}
