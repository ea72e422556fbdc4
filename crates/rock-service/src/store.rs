//! Document storage handed to service handlers.
//!
//! Documents are JSON objects addressed by `(shard, table, pk)`. Drivers are
//! picked by name through [`open_store`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Field holding a document's primary key.
pub const PK_FIELD: &str = "id";

/// Storage capability used by handlers.
#[async_trait]
pub trait Store: Send + Sync {
    /// Driver name.
    fn driver(&self) -> &str;

    /// Inserts or replaces a document and returns its key.
    ///
    /// A string `id` field is used as the key; otherwise one is generated
    /// and written back into the document.
    async fn put(&self, shard: &str, table: &str, document: Value) -> StoreResult<String>;

    /// Fetches one document.
    async fn get(&self, shard: &str, table: &str, pk: &str) -> StoreResult<Option<Value>>;

    /// Documents whose top-level fields equal every field of `query`.
    async fn filter(&self, shard: &str, table: &str, query: &Map<String, Value>)
    -> StoreResult<Vec<Value>>;

    /// Merges `changes` into an existing document and returns the result.
    async fn edit(
        &self,
        shard: &str,
        table: &str,
        pk: &str,
        changes: Map<String, Value>,
    ) -> StoreResult<Value>;

    /// Removes a document. Returns whether it existed.
    async fn remove(&self, shard: &str, table: &str, pk: &str) -> StoreResult<bool>;

    /// Releases the store. Later calls fail with [`StoreError::Closed`].
    async fn close(&self);
}

/// Resolves a driver name to a store.
pub fn open_store(driver: &str) -> StoreResult<Arc<dyn Store>> {
    match driver {
        MemoryStore::DRIVER => Ok(Arc::new(MemoryStore::new())),
        other => Err(StoreError::UnknownDriver(other.to_string())),
    }
}

type Table = BTreeMap<String, Map<String, Value>>;

/// In-process store. Tables keep documents ordered by key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<(String, String), Table>>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub const DRIVER: &'static str = "memory";

    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

fn key(shard: &str, table: &str) -> (String, String) {
    (shard.to_string(), table.to_string())
}

fn matches(document: &Map<String, Value>, query: &Map<String, Value>) -> bool {
    query
        .iter()
        .all(|(field, expected)| document.get(field) == Some(expected))
}

#[async_trait]
impl Store for MemoryStore {
    fn driver(&self) -> &str {
        Self::DRIVER
    }

    async fn put(&self, shard: &str, table: &str, document: Value) -> StoreResult<String> {
        self.check_open()?;
        let Value::Object(mut document) = document else {
            return Err(StoreError::InvalidDocument(
                "document must be a JSON object".into(),
            ));
        };

        let pk = match document.get(PK_FIELD) {
            Some(Value::String(pk)) if !pk.is_empty() => pk.clone(),
            Some(Value::String(_)) | None | Some(Value::Null) => {
                let pk = uuid::Uuid::new_v4().to_string();
                document.insert(PK_FIELD.into(), Value::String(pk.clone()));
                pk
            }
            Some(other) => {
                return Err(StoreError::InvalidDocument(format!(
                    "{PK_FIELD:?} must be a string, got {other}"
                )));
            }
        };

        debug!(shard, table, pk = %pk, "put");
        self.tables
            .write()
            .await
            .entry(key(shard, table))
            .or_default()
            .insert(pk.clone(), document);
        Ok(pk)
    }

    async fn get(&self, shard: &str, table: &str, pk: &str) -> StoreResult<Option<Value>> {
        self.check_open()?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(&key(shard, table))
            .and_then(|t| t.get(pk))
            .cloned()
            .map(Value::Object))
    }

    async fn filter(
        &self,
        shard: &str,
        table: &str,
        query: &Map<String, Value>,
    ) -> StoreResult<Vec<Value>> {
        self.check_open()?;
        let tables = self.tables.read().await;
        let Some(table) = tables.get(&key(shard, table)) else {
            return Ok(Vec::new());
        };
        Ok(table
            .values()
            .filter(|doc| matches(doc, query))
            .cloned()
            .map(Value::Object)
            .collect())
    }

    async fn edit(
        &self,
        shard: &str,
        table: &str,
        pk: &str,
        changes: Map<String, Value>,
    ) -> StoreResult<Value> {
        self.check_open()?;
        if let Some(new_pk) = changes.get(PK_FIELD)
            && new_pk.as_str() != Some(pk)
        {
            return Err(StoreError::InvalidDocument(format!(
                "{PK_FIELD:?} cannot be changed"
            )));
        }

        let mut tables = self.tables.write().await;
        let document = tables
            .get_mut(&key(shard, table))
            .and_then(|t| t.get_mut(pk))
            .ok_or_else(|| StoreError::NotFound {
                shard: shard.to_string(),
                table: table.to_string(),
                pk: pk.to_string(),
            })?;
        document.extend(changes);
        debug!(shard, table, pk, "edit");
        Ok(Value::Object(document.clone()))
    }

    async fn remove(&self, shard: &str, table: &str, pk: &str) -> StoreResult<bool> {
        self.check_open()?;
        let mut tables = self.tables.write().await;
        let removed = tables
            .get_mut(&key(shard, table))
            .and_then(|t| t.remove(pk))
            .is_some();
        debug!(shard, table, pk, removed, "remove");
        Ok(removed)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.tables.write().await.clear();
            debug!(driver = Self::DRIVER, "Store closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn put_then_get() {
        let store = MemoryStore::new();
        let pk = store
            .put("main", "users", json!({"id": "u1", "name": "ada"}))
            .await
            .unwrap();
        assert_eq!(pk, "u1");
        assert_eq!(
            store.get("main", "users", "u1").await.unwrap(),
            Some(json!({"id": "u1", "name": "ada"}))
        );
        assert_eq!(store.get("main", "users", "u2").await.unwrap(), None);
        assert_eq!(store.get("other", "users", "u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_generates_missing_key() {
        let store = MemoryStore::new();
        let pk = store.put("main", "users", json!({"name": "bob"})).await.unwrap();
        assert!(uuid::Uuid::parse_str(&pk).is_ok());
        let doc = store.get("main", "users", &pk).await.unwrap().unwrap();
        assert_eq!(doc["id"], pk.as_str());
    }

    #[tokio::test]
    async fn put_rejects_non_objects_and_bad_keys() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.put("main", "users", json!([1, 2])).await,
            Err(StoreError::InvalidDocument(_))
        ));
        assert!(matches!(
            store.put("main", "users", json!({"id": 7})).await,
            Err(StoreError::InvalidDocument(_))
        ));
    }

    #[tokio::test]
    async fn filter_by_equality() {
        let store = MemoryStore::new();
        store.put("main", "users", json!({"id": "a", "role": "admin"})).await.unwrap();
        store.put("main", "users", json!({"id": "b", "role": "user"})).await.unwrap();
        store.put("main", "users", json!({"id": "c", "role": "admin"})).await.unwrap();

        let admins = store
            .filter("main", "users", &object(json!({"role": "admin"})))
            .await
            .unwrap();
        let ids: Vec<_> = admins.iter().map(|d| d["id"].clone()).collect();
        assert_eq!(ids, vec![json!("a"), json!("c")]);

        let all = store.filter("main", "users", &Map::new()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(store.filter("main", "empty", &Map::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn edit_merges_and_reports_missing() {
        let store = MemoryStore::new();
        store.put("main", "users", json!({"id": "a", "n": 1, "keep": true})).await.unwrap();

        let edited = store
            .edit("main", "users", "a", object(json!({"n": 2})))
            .await
            .unwrap();
        assert_eq!(edited, json!({"id": "a", "n": 2, "keep": true}));

        assert!(matches!(
            store.edit("main", "users", "zz", Map::new()).await,
            Err(StoreError::NotFound { pk, .. }) if pk == "zz"
        ));
        assert!(matches!(
            store.edit("main", "users", "a", object(json!({"id": "b"}))).await,
            Err(StoreError::InvalidDocument(_))
        ));
    }

    #[tokio::test]
    async fn remove_and_close() {
        let store = MemoryStore::new();
        store.put("main", "users", json!({"id": "a"})).await.unwrap();
        assert!(store.remove("main", "users", "a").await.unwrap());
        assert!(!store.remove("main", "users", "a").await.unwrap());

        store.close().await;
        assert!(matches!(
            store.get("main", "users", "a").await,
            Err(StoreError::Closed)
        ));
    }

    #[test]
    fn driver_lookup() {
        let store = open_store("memory").unwrap();
        assert_eq!(store.driver(), "memory");
        assert!(matches!(
            open_store("rethinkdb"),
            Err(StoreError::UnknownDriver(name)) if name == "rethinkdb"
        ));
    }
}
