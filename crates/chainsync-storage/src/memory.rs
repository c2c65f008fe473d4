//! In-memory record store.
//!
//! Keeps every row as a short history of timestamped versions so that a
//! revert can restore the state as of any earlier timestamp. A deleted row is
//! a version with no data. All data is lost when the process exits.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

use chainsync_core::error::IndexerError;
use chainsync_core::schema::Schema;
use chainsync_core::store::{matches_filter, merge_patch, Record, RecordStore, StoreVersion};

#[derive(Debug, Clone)]
struct RowVersion {
    timestamp: u64,
    data: Option<Value>,
}

type Table = BTreeMap<String, Vec<RowVersion>>;

#[derive(Default)]
struct Inner {
    version: Option<StoreVersion>,
    tables: HashMap<String, Table>,
}

impl Inner {
    fn check(&self, version: StoreVersion) -> Result<(), IndexerError> {
        match self.version {
            Some(current) if current == version => Ok(()),
            Some(current) => Err(IndexerError::StaleVersion {
                expected: current,
                actual: version,
            }),
            None => Err(IndexerError::Storage("record store was never built".into())),
        }
    }

    fn table(&mut self, version: StoreVersion, entity: &str) -> Result<&mut Table, IndexerError> {
        self.check(version)?;
        self.tables
            .get_mut(entity)
            .ok_or_else(|| IndexerError::Storage(format!("no table for entity '{entity}'")))
    }
}

fn current(history: Option<&Vec<RowVersion>>) -> Option<&Value> {
    history.and_then(|h| h.last()).and_then(|v| v.data.as_ref())
}

/// Record a new version of a row. Several writes at the same timestamp
/// collapse into one version.
fn write(table: &mut Table, id: &str, timestamp: u64, data: Option<Value>) {
    let history = table.entry(id.to_string()).or_default();
    match history.last_mut() {
        Some(last) if last.timestamp == timestamp => last.data = data,
        _ => history.push(RowVersion { timestamp, data }),
    }
}

/// In-memory, versioned record store.
#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
    reverts: AtomicU64,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of revert calls that reached the store.
    pub fn revert_count(&self) -> u64 {
        self.reverts.load(Ordering::SeqCst)
    }

    /// Current rows of `entity` in the live version, for external readers.
    pub fn records(&self, entity: &str) -> Vec<Record> {
        let inner = self.inner.lock().unwrap();
        inner
            .tables
            .get(entity)
            .map(|table| {
                table
                    .iter()
                    .filter_map(|(id, h)| {
                        current(Some(h)).map(|data| Record {
                            id: id.clone(),
                            data: data.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn rebuild(&self, schema: &Schema) -> Result<StoreVersion, IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        let version = inner
            .version
            .map(StoreVersion::next)
            .unwrap_or_else(|| StoreVersion::new(1));
        inner.version = Some(version);
        inner.tables = schema
            .entity_names()
            .map(|name| (name.to_string(), Table::new()))
            .collect();
        debug!(%version, tables = inner.tables.len(), "record store rebuilt");
        Ok(version)
    }

    fn version(&self) -> Option<StoreVersion> {
        self.inner.lock().unwrap().version
    }

    async fn create(
        &self,
        version: StoreVersion,
        entity: &str,
        id: &str,
        timestamp: u64,
        data: Value,
    ) -> Result<Record, IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        let table = inner.table(version, entity)?;
        if current(table.get(id)).is_some() {
            return Err(IndexerError::Storage(format!(
                "{entity} '{id}' already exists"
            )));
        }
        write(table, id, timestamp, Some(data.clone()));
        Ok(Record {
            id: id.to_string(),
            data,
        })
    }

    async fn update(
        &self,
        version: StoreVersion,
        entity: &str,
        id: &str,
        timestamp: u64,
        patch: Value,
    ) -> Result<Record, IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        let table = inner.table(version, entity)?;
        let mut data = current(table.get(id))
            .cloned()
            .ok_or_else(|| IndexerError::Storage(format!("{entity} '{id}' not found")))?;
        merge_patch(&mut data, &patch);
        write(table, id, timestamp, Some(data.clone()));
        Ok(Record {
            id: id.to_string(),
            data,
        })
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
        let mut inner = self.inner.lock().unwrap();
        let table = inner.table(version, entity)?;
        let data = match current(table.get(id)).cloned() {
            Some(mut existing) => {
                merge_patch(&mut existing, &patch);
                existing
            }
            None => create,
        };
        write(table, id, timestamp, Some(data.clone()));
        Ok(Record {
            id: id.to_string(),
            data,
        })
    }

    async fn delete(
        &self,
        version: StoreVersion,
        entity: &str,
        id: &str,
        timestamp: u64,
    ) -> Result<bool, IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        let table = inner.table(version, entity)?;
        if current(table.get(id)).is_none() {
            return Ok(false);
        }
        write(table, id, timestamp, None);
        Ok(true)
    }

    async fn find(
        &self,
        version: StoreVersion,
        entity: &str,
        id: &str,
    ) -> Result<Option<Record>, IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        let table = inner.table(version, entity)?;
        Ok(current(table.get(id)).map(|data| Record {
            id: id.to_string(),
            data: data.clone(),
        }))
    }

    async fn find_many(
        &self,
        version: StoreVersion,
        entity: &str,
        filter: Option<&Value>,
    ) -> Result<Vec<Record>, IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        let table = inner.table(version, entity)?;
        Ok(table
            .iter()
            .filter_map(|(id, h)| current(Some(h)).map(|data| (id, data)))
            .filter(|(_, data)| filter.map_or(true, |f| matches_filter(data, f)))
            .map(|(id, data)| Record {
                id: id.clone(),
                data: data.clone(),
            })
            .collect())
    }

    async fn revert(&self, version: StoreVersion, safe_timestamp: u64) -> Result<(), IndexerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.check(version)?;
        self.reverts.fetch_add(1, Ordering::SeqCst);
        let mut discarded = 0usize;
        for table in inner.tables.values_mut() {
            for history in table.values_mut() {
                let before = history.len();
                history.retain(|v| v.timestamp <= safe_timestamp);
                discarded += before - history.len();
            }
            table.retain(|_, history| !history.is_empty());
        }
        debug!(%version, safe_timestamp, discarded, "record store reverted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsync_core::schema::{ColumnType, Table as SchemaTable};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new().table(
            "Account",
            SchemaTable::default().column("balance", ColumnType::Int),
        )
    }

    async fn built() -> (MemoryRecordStore, StoreVersion) {
        let store = MemoryRecordStore::new();
        let v = store.rebuild(&schema()).await.unwrap();
        (store, v)
    }

    #[tokio::test]
    async fn create_find_update() {
        let (store, v) = built().await;
        store
            .create(v, "Account", "a", 1, json!({ "id": "a", "balance": 1 }))
            .await
            .unwrap();
        assert!(store
            .create(v, "Account", "a", 2, json!({ "id": "a", "balance": 9 }))
            .await
            .is_err());

        let updated = store
            .update(v, "Account", "a", 2, json!({ "balance": 5 }))
            .await
            .unwrap();
        assert_eq!(updated.data["balance"], 5);
        let found = store.find(v, "Account", "a").await.unwrap().unwrap();
        assert_eq!(found.data, json!({ "id": "a", "balance": 5 }));
        assert!(store
            .update(v, "Account", "missing", 2, json!({ "balance": 1 }))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn revert_keeps_changes_at_safe_timestamp() {
        let (store, v) = built().await;
        store
            .create(v, "Account", "a", 4, json!({ "id": "a", "balance": 1 }))
            .await
            .unwrap();
        store
            .update(v, "Account", "a", 6, json!({ "balance": 2 }))
            .await
            .unwrap();
        store
            .update(v, "Account", "a", 8, json!({ "balance": 3 }))
            .await
            .unwrap();
        store
            .create(v, "Account", "b", 9, json!({ "id": "b", "balance": 7 }))
            .await
            .unwrap();

        store.revert(v, 6).await.unwrap();

        let a = store.find(v, "Account", "a").await.unwrap().unwrap();
        assert_eq!(a.data["balance"], 2);
        assert!(store.find(v, "Account", "b").await.unwrap().is_none());
        assert_eq!(store.revert_count(), 1);
    }

    #[tokio::test]
    async fn revert_restores_deleted_rows() {
        let (store, v) = built().await;
        store
            .create(v, "Account", "a", 1, json!({ "id": "a", "balance": 1 }))
            .await
            .unwrap();
        assert!(store.delete(v, "Account", "a", 5).await.unwrap());
        assert!(!store.delete(v, "Account", "a", 5).await.unwrap());
        assert!(store.find(v, "Account", "a").await.unwrap().is_none());

        store.revert(v, 3).await.unwrap();
        assert!(store.find(v, "Account", "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_version_fails_fast() {
        let (store, old) = built().await;
        store
            .create(old, "Account", "a", 1, json!({ "id": "a", "balance": 1 }))
            .await
            .unwrap();

        let new = store.rebuild(&schema()).await.unwrap();
        assert!(new > old);
        assert!(store.records("Account").is_empty());

        let err = store
            .create(old, "Account", "b", 2, json!({ "id": "b", "balance": 1 }))
            .await
            .unwrap_err();
        assert!(err.is_stale_version());
        assert!(store.revert(old, 0).await.unwrap_err().is_stale_version());
        assert!(store.find_many(new, "Account", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upsert_and_find_many() {
        let (store, v) = built().await;
        store
            .upsert(v, "Account", "a", 1, json!({ "id": "a", "balance": 1 }), json!({ "balance": 99 }))
            .await
            .unwrap();
        store
            .upsert(v, "Account", "a", 2, json!({ "id": "a", "balance": 1 }), json!({ "balance": 2 }))
            .await
            .unwrap();
        store
            .create(v, "Account", "b", 2, json!({ "id": "b", "balance": 2 }))
            .await
            .unwrap();

        let all = store.find_many(v, "Account", None).await.unwrap();
        assert_eq!(all.len(), 2);
        let twos = store
            .find_many(v, "Account", Some(&json!({ "balance": 2 })))
            .await
            .unwrap();
        assert_eq!(twos.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn unbuilt_store_rejects_writes() {
        let store = MemoryRecordStore::new();
        let err = store
            .find(StoreVersion::new(1), "Account", "a")
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::Storage(_)));
    }
}
