//! In-process document store.
//!
//! Backs tests and single-process deployments. It counts committed
//! transactions and supports hooks that run just before the next
//! transaction, which is how tests interleave a "concurrent writer".

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::error::{Result, StateError};
use crate::store::{Collection, DocumentStore, Query};
use crate::txn::{Change, DocKey, Operation, stage};
use crate::watch::{EventLog, Notifier};

pub type Docs = BTreeMap<DocKey, Value>;
type Hook = Box<dyn FnOnce(&mut Docs) + Send>;

struct Inner {
    docs: Docs,
    before_hooks: VecDeque<Hook>,
}

#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    txn_count: Arc<AtomicU64>,
    pub event_log: EventLog,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                docs: BTreeMap::new(),
                before_hooks: VecDeque::new(),
            })),
            txn_count: Arc::new(AtomicU64::new(0)),
            event_log: EventLog::new(),
        }
    }

    /// Number of transactions committed so far.
    pub fn txn_count(&self) -> u64 {
        self.txn_count.load(Ordering::SeqCst)
    }

    /// Queue a hook that mutates the raw documents right before the next
    /// transaction attempt is evaluated. Hooks run one per attempt, in order.
    pub async fn add_before_hook(&self, hook: impl FnOnce(&mut Docs) + Send + 'static) {
        self.inner.lock().await.before_hooks.push_back(Box::new(hook));
    }

    /// Write a raw document, bypassing assertions (and the transaction count).
    pub async fn put_raw(&self, collection: Collection, id: &str, doc: Value) {
        let mut inner = self.inner.lock().await;
        inner.docs.insert((collection, id.to_string()), doc.clone());
        self.event_log.emit(&[Change {
            collection,
            id: id.to_string(),
            value: Some(doc),
        }]);
    }

    /// Read a raw document without going through [`DocumentStore::find_one`].
    pub async fn get_raw(&self, collection: Collection, id: &str) -> Option<Value> {
        self.inner
            .lock()
            .await
            .docs
            .get(&(collection, id.to_string()))
            .cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find_one(&self, collection: Collection, id: &str) -> Result<Value> {
        self.get_raw(collection, id)
            .await
            .ok_or_else(|| StateError::NotFound {
                collection,
                id: id.to_string(),
            })
    }

    async fn find_all(&self, collection: Collection, query: &Query) -> Result<Vec<(String, Value)>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .docs
            .iter()
            .filter(|((c, id), _)| *c == collection && query.matches(id))
            .map(|((_, id), doc)| (id.clone(), doc.clone()))
            .collect())
    }

    async fn apply(&self, ops: &[Operation]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(hook) = inner.before_hooks.pop_front() {
            hook(&mut inner.docs);
        }

        let mut touched: HashMap<DocKey, Option<Value>> = HashMap::new();
        for op in ops {
            let key = op.key();
            let current = inner.docs.get(&key).cloned();
            touched.entry(key).or_insert(current);
        }
        let changes = stage(ops, &mut touched)?;

        for change in &changes {
            let key = (change.collection, change.id.clone());
            match &change.value {
                Some(doc) => {
                    inner.docs.insert(key, doc.clone());
                }
                None => {
                    inner.docs.remove(&key);
                }
            }
        }
        self.txn_count.fetch_add(1, Ordering::SeqCst);
        drop(inner);
        self.event_log.emit(&changes);
        Ok(())
    }

    fn watch(&self, collection: Collection, id_prefix: &str) -> Notifier {
        self.event_log.notifier(collection, id_prefix)
    }
}
