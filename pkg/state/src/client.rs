use async_trait::async_trait;
use pkg_constants::state::REGISTRY_PREFIX;
use serde_json::Value;
use slatedb::Db;
use slatedb::WriteBatch;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::path::Path;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StateError};
use crate::store::{Collection, DocumentStore, Query};
use crate::txn::{DocKey, Operation, stage};
use crate::watch::{EventLog, Notifier};

/// Persistent document store backed by SlateDB on a local filesystem.
/// In production this would use S3/R2/MinIO via the `object_store` crate.
///
/// Documents are JSON values under `/registry/<collection>/<id>`. Transactions
/// are serialized by a process-local mutex: assertions are evaluated against
/// the current values and all writes land in one atomic `WriteBatch`.
#[derive(Clone)]
pub struct StateStore {
    db: Db,
    txn_lock: Arc<Mutex<()>>,
    pub event_log: EventLog,
}

fn collection_prefix(collection: Collection) -> String {
    format!("{}{}/", REGISTRY_PREFIX, collection.as_str())
}

fn doc_key(collection: Collection, id: &str) -> String {
    format!("{}{}", collection_prefix(collection), id)
}

fn decode(collection: Collection, id: &str, bytes: &[u8]) -> Result<Value> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt {
        collection,
        id: id.to_string(),
        reason: e.to_string(),
    })
}

impl StateStore {
    /// Open (or create) a state store rooted at `path` on the local filesystem.
    pub async fn new(path: &str) -> Result<Self> {
        info!("Opening SlateDB state store at {}", path);

        // Ensure the data directory exists before opening the object store
        std::fs::create_dir_all(path).map_err(|e| {
            StateError::storage(format!("Failed to create data directory {}: {}", path, e))
        })?;

        let object_store = Arc::new(LocalFileSystem::new_with_prefix(path).map_err(|e| {
            StateError::storage(format!("Failed to create local object store: {}", e))
        })?);
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(|e| StateError::storage(format!("Failed to open SlateDB: {}", e)))?;
        Ok(Self {
            db,
            txn_lock: Arc::new(Mutex::new(())),
            event_log: EventLog::new(),
        })
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>> {
        match self.db.get(doc_key(collection, id).as_bytes()).await {
            Ok(Some(bytes)) => Ok(Some(decode(collection, id, &bytes)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StateError::storage(format!("SlateDB get failed: {}", e))),
        }
    }

    /// Gracefully close the state store.
    pub async fn close(self) -> Result<()> {
        info!("Closing SlateDB state store");
        self.db
            .close()
            .await
            .map_err(|e| StateError::storage(format!("SlateDB close failed: {}", e)))
    }
}

#[async_trait]
impl DocumentStore for StateStore {
    async fn find_one(&self, collection: Collection, id: &str) -> Result<Value> {
        self.get(collection, id)
            .await?
            .ok_or_else(|| StateError::NotFound {
                collection,
                id: id.to_string(),
            })
    }

    async fn find_all(&self, collection: Collection, query: &Query) -> Result<Vec<(String, Value)>> {
        let prefix = collection_prefix(collection);
        let scan = match query {
            Query::IdPrefix(id_prefix) => format!("{}{}", prefix, id_prefix),
        };
        let mut iter = self
            .db
            .scan_prefix(scan.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("SlateDB scan_prefix failed: {}", e)))?;

        let mut results = Vec::new();
        while let Some(kv) = iter
            .next()
            .await
            .map_err(|e| StateError::storage(format!("SlateDB scan failed: {}", e)))?
        {
            let key = String::from_utf8_lossy(&kv.key).to_string();
            let id = key.strip_prefix(&prefix).unwrap_or(&key).to_string();
            let doc = decode(collection, &id, &kv.value)?;
            if query.matches(&id) {
                results.push((id, doc));
            }
        }
        Ok(results)
    }

    async fn apply(&self, ops: &[Operation]) -> Result<()> {
        let _guard = self.txn_lock.lock().await;

        let mut touched: HashMap<DocKey, Option<Value>> = HashMap::new();
        for op in ops {
            let key = op.key();
            if !touched.contains_key(&key) {
                let current = self.get(op.collection, &op.id).await?;
                touched.insert(key, current);
            }
        }
        let changes = stage(ops, &mut touched)?;

        let mut batch = WriteBatch::new();
        for change in &changes {
            let key = doc_key(change.collection, &change.id);
            match &change.value {
                Some(doc) => batch.put(key.as_bytes(), serde_json::to_vec(doc)?),
                None => batch.delete(key.as_bytes()),
            }
        }
        self.db
            .write(batch)
            .await
            .map_err(|e| StateError::storage(format!("SlateDB write failed: {}", e)))?;
        debug!("committed transaction touching {} documents", changes.len());

        self.event_log.emit(&changes);
        Ok(())
    }

    fn watch(&self, collection: Collection, id_prefix: &str) -> Notifier {
        self.event_log.notifier(collection, id_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::Assert;
    use serde_json::json;

    #[tokio::test]
    async fn test_slatedb_transactions() {
        let dir = std::env::temp_dir().join(format!("leasekeeper-state-{}", uuid::Uuid::new_v4()));
        let store = StateStore::new(dir.to_str().unwrap()).await.unwrap();

        store
            .apply(&[Operation::new(Collection::Leases, "ns#a#")
                .assert(Assert::Missing)
                .insert(json!({"holder": "a/0", "version": "1"}))])
            .await
            .unwrap();

        let conflict = store
            .apply(&[Operation::new(Collection::Leases, "ns#a#")
                .assert(Assert::Missing)
                .insert(json!({"holder": "a/1", "version": "1"}))])
            .await;
        assert!(matches!(conflict, Err(StateError::Aborted)));

        let found = store
            .find_all(Collection::Leases, &Query::IdPrefix("ns#".into()))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "ns#a#");
        assert_eq!(found[0].1["holder"], "a/0");

        store
            .apply(&[Operation::new(Collection::Leases, "ns#a#")
                .assert(Assert::field_eq("version", "1"))
                .remove()])
            .await
            .unwrap();
        assert!(matches!(
            store.find_one(Collection::Leases, "ns#a#").await,
            Err(StateError::NotFound { .. })
        ));

        store.close().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
