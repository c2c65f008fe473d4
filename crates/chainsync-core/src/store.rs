//! Record store contract: the versioned, revertible entity store that
//! indexing handlers write into.
//!
//! Every operation takes the [`StoreVersion`] it was issued against. A store
//! rebuild produces a fresh version, and any call carrying an older one fails
//! with [`IndexerError::StaleVersion`] instead of touching the new data.
//!
//! Writes are stamped with the block timestamp of the event that caused them,
//! which is what [`RecordStore::revert`] rewinds by.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::IndexerError;
use crate::schema::Schema;

/// Opaque generation token of a record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreVersion(u64);

impl StoreVersion {
    pub fn new(generation: u64) -> Self {
        Self(generation)
    }

    /// The version following this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for StoreVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A stored entity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Primary key.
    pub id: String,
    /// Column values (JSON object, including `id`).
    pub data: Value,
}

impl Record {
    /// Read a single column.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }
}

/// Trait for versioned entity stores.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Discard every table and recreate them from `schema` under a new version.
    async fn rebuild(&self, schema: &Schema) -> Result<StoreVersion, IndexerError>;

    /// The current version, or `None` if the store was never built.
    fn version(&self) -> Option<StoreVersion>;

    /// Insert a new record. Fails if `id` already exists.
    async fn create(
        &self,
        version: StoreVersion,
        entity: &str,
        id: &str,
        timestamp: u64,
        data: Value,
    ) -> Result<Record, IndexerError>;

    /// Merge `patch` into an existing record. Fails if `id` does not exist.
    async fn update(
        &self,
        version: StoreVersion,
        entity: &str,
        id: &str,
        timestamp: u64,
        patch: Value,
    ) -> Result<Record, IndexerError>;

    /// Insert `create` if `id` does not exist, otherwise merge `patch`.
    async fn upsert(
        &self,
        version: StoreVersion,
        entity: &str,
        id: &str,
        timestamp: u64,
        create: Value,
        patch: Value,
    ) -> Result<Record, IndexerError>;

    /// Delete a record. Returns `false` if it did not exist.
    async fn delete(
        &self,
        version: StoreVersion,
        entity: &str,
        id: &str,
        timestamp: u64,
    ) -> Result<bool, IndexerError>;

    /// Find a record by primary key.
    async fn find(
        &self,
        version: StoreVersion,
        entity: &str,
        id: &str,
    ) -> Result<Option<Record>, IndexerError>;

    /// List records ordered by id, optionally keeping only those whose columns
    /// equal every field of `filter`.
    async fn find_many(
        &self,
        version: StoreVersion,
        entity: &str,
        filter: Option<&Value>,
    ) -> Result<Vec<Record>, IndexerError>;

    /// Discard every change stamped after `safe_timestamp`. Changes stamped
    /// exactly at `safe_timestamp` are kept.
    async fn revert(&self, version: StoreVersion, safe_timestamp: u64) -> Result<(), IndexerError>;
}

/// Returns `true` if every field of `filter` equals the same field of `data`.
pub fn matches_filter(data: &Value, filter: &Value) -> bool {
    match filter.as_object() {
        Some(fields) => fields.iter().all(|(k, v)| data.get(k) == Some(v)),
        None => true,
    }
}

/// Shallow-merge `patch` into `base`; `id` is never overwritten.
pub fn merge_patch(base: &mut Value, patch: &Value) {
    if let (Some(base), Some(patch)) = (base.as_object_mut(), patch.as_object()) {
        for (k, v) in patch {
            if k != "id" {
                base.insert(k.clone(), v.clone());
            }
        }
    }
}
