//! Conditional operations and the bounded retry loop that runs them.
//!
//! A transaction is a list of [`Operation`]s, each optionally asserting
//! something about one document before optionally mutating it. Stores apply
//! a list atomically or not at all. [`TxnRunner`] asks a
//! [`TransactionBuilder`] for a fresh list on every attempt, so a builder
//! can resynchronise whatever state it derives the list from before retrying.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

use crate::error::{Result, StateError};
use crate::store::{Collection, DocumentStore};

pub type DocKey = (Collection, String);

/// Precondition checked against a document's state at commit time.
#[derive(Debug, Clone, PartialEq)]
pub enum Assert {
    /// The document must not exist.
    Missing,
    /// The document must exist.
    Exists,
    /// The document must exist and each listed top-level field must equal its value.
    FieldsEq(Map<String, Value>),
}

impl Assert {
    /// Convenience for a single-field equality assertion.
    pub fn field_eq(field: &str, value: impl Into<Value>) -> Self {
        let mut fields = Map::new();
        fields.insert(field.to_string(), value.into());
        Assert::FieldsEq(fields)
    }

    fn holds(&self, current: Option<&Value>) -> bool {
        match (self, current) {
            (Assert::Missing, current) => current.is_none(),
            (Assert::Exists, current) => current.is_some(),
            (Assert::FieldsEq(_), None) => false,
            (Assert::FieldsEq(fields), Some(doc)) => fields
                .iter()
                .all(|(field, expected)| doc.get(field) == Some(expected)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Create the document. Aborts if it already exists.
    Insert(Value),
    /// Overwrite top-level fields (`$set`). Aborts if the document is missing.
    Set(Map<String, Value>),
    /// Delete the document. Aborts if it is missing.
    Remove,
}

/// One step of a transaction: assert-then-mutate on a single document.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub collection: Collection,
    pub id: String,
    pub assert: Option<Assert>,
    pub mutation: Option<Mutation>,
}

impl Operation {
    pub fn new(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
            assert: None,
            mutation: None,
        }
    }

    pub fn assert(mut self, assert: Assert) -> Self {
        self.assert = Some(assert);
        self
    }

    pub fn insert(mut self, doc: Value) -> Self {
        self.mutation = Some(Mutation::Insert(doc));
        self
    }

    pub fn set(mut self, fields: Map<String, Value>) -> Self {
        self.mutation = Some(Mutation::Set(fields));
        self
    }

    pub fn remove(mut self) -> Self {
        self.mutation = Some(Mutation::Remove);
        self
    }

    pub fn key(&self) -> DocKey {
        (self.collection, self.id.clone())
    }
}

/// Final state of a document touched by a committed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub collection: Collection,
    pub id: String,
    /// `None` when the document was removed.
    pub value: Option<Value>,
}

/// Evaluate `ops` in order against `docs`, which must hold the pre-transaction
/// state of every document the ops reference. Returns the changes to commit.
pub(crate) fn stage(ops: &[Operation], docs: &mut HashMap<DocKey, Option<Value>>) -> Result<Vec<Change>> {
    let mut touched: Vec<DocKey> = Vec::new();

    for op in ops {
        let key = op.key();
        let current = docs.get(&key).cloned().flatten();

        if let Some(assert) = &op.assert
            && !assert.holds(current.as_ref())
        {
            return Err(StateError::Aborted);
        }

        let next = match (&op.mutation, current) {
            (None, _) => continue,
            (Some(Mutation::Insert(_)), Some(_)) => return Err(StateError::Aborted),
            (Some(Mutation::Insert(doc)), None) => Some(doc.clone()),
            (Some(Mutation::Set(_)), None) | (Some(Mutation::Remove), None) => {
                return Err(StateError::Aborted);
            }
            (Some(Mutation::Set(fields)), Some(mut doc)) => {
                let Some(object) = doc.as_object_mut() else {
                    return Err(StateError::Corrupt {
                        collection: op.collection,
                        id: op.id.clone(),
                        reason: "document is not an object".to_string(),
                    });
                };
                for (field, value) in fields {
                    object.insert(field.clone(), value.clone());
                }
                Some(doc)
            }
            (Some(Mutation::Remove), Some(_)) => None,
        };

        docs.insert(key.clone(), next);
        if !touched.contains(&key) {
            touched.push(key);
        }
    }

    Ok(touched
        .into_iter()
        .map(|key| {
            let value = docs.get(&key).cloned().flatten();
            Change {
                collection: key.0,
                id: key.1,
                value,
            }
        })
        .collect())
}

/// Produces the operations for one transaction attempt.
///
/// `attempt` is zero on the first call and increments on every retry. An
/// empty list means there is nothing to do; the runner then succeeds without
/// touching the store.
#[async_trait]
pub trait TransactionBuilder: Send {
    type Error: From<StateError> + Send;

    async fn build(&mut self, attempt: u32) -> std::result::Result<Vec<Operation>, Self::Error>;
}

/// Runs transactions against a store, rebuilding and retrying on abort.
#[derive(Clone)]
pub struct TxnRunner {
    store: Arc<dyn DocumentStore>,
    max_attempts: u32,
}

impl TxnRunner {
    pub fn new(store: Arc<dyn DocumentStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run `builder` until one attempt commits, the builder fails, or every
    /// attempt aborts ([`StateError::ExcessiveContention`]).
    pub async fn run<B: TransactionBuilder>(&self, builder: &mut B) -> std::result::Result<(), B::Error> {
        for attempt in 0..self.max_attempts {
            let ops = builder.build(attempt).await?;
            if ops.is_empty() {
                return Ok(());
            }
            match self.store.apply(&ops).await {
                Ok(()) => return Ok(()),
                Err(StateError::Aborted) => {
                    trace!("transaction attempt {} aborted", attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StateError::ExcessiveContention {
            attempts: self.max_attempts,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    fn docs_with(id: &str, doc: Option<Value>) -> HashMap<DocKey, Option<Value>> {
        let mut docs = HashMap::new();
        docs.insert((Collection::Leases, id.to_string()), doc);
        docs
    }

    #[test]
    fn test_assertions() {
        let doc = json!({"holder": "a", "version": "1"});
        assert!(Assert::Missing.holds(None));
        assert!(!Assert::Missing.holds(Some(&doc)));
        assert!(Assert::Exists.holds(Some(&doc)));
        assert!(Assert::field_eq("holder", "a").holds(Some(&doc)));
        assert!(!Assert::field_eq("holder", "b").holds(Some(&doc)));
        assert!(!Assert::field_eq("holder", "a").holds(None));
    }

    #[test]
    fn test_stage_set_merges_fields() {
        let mut docs = docs_with("x", Some(json!({"holder": "a", "version": "1"})));
        let mut fields = Map::new();
        fields.insert("version".into(), json!("2"));
        let ops = vec![
            Operation::new(Collection::Leases, "x")
                .assert(Assert::field_eq("version", "1"))
                .set(fields),
        ];
        let changes = stage(&ops, &mut docs).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes[0].value,
            Some(json!({"holder": "a", "version": "2"}))
        );
    }

    #[test]
    fn test_stage_aborts_on_failed_assertion_or_conflict() {
        let mut docs = docs_with("x", Some(json!({"version": "1"})));
        let ops = vec![Operation::new(Collection::Leases, "x").insert(json!({}))];
        assert!(matches!(stage(&ops, &mut docs), Err(StateError::Aborted)));

        let mut docs = docs_with("x", None);
        let ops = vec![Operation::new(Collection::Leases, "x").remove()];
        assert!(matches!(stage(&ops, &mut docs), Err(StateError::Aborted)));

        let mut docs = docs_with("x", Some(json!({"version": "1"})));
        let ops = vec![
            Operation::new(Collection::Leases, "x").assert(Assert::field_eq("version", "0")),
        ];
        assert!(matches!(stage(&ops, &mut docs), Err(StateError::Aborted)));
    }

    #[test]
    fn test_stage_sees_earlier_operations() {
        let mut docs = docs_with("x", None);
        let ops = vec![
            Operation::new(Collection::Leases, "x").insert(json!({"v": 1})),
            Operation::new(Collection::Leases, "x").assert(Assert::field_eq("v", 1)).remove(),
        ];
        let changes = stage(&ops, &mut docs).unwrap();
        assert_eq!(changes, vec![Change {
            collection: Collection::Leases,
            id: "x".to_string(),
            value: None,
        }]);
    }

    /// Inserts `id`, asserting it is missing; counts calls.
    struct InsertBuilder {
        id: String,
        calls: u32,
    }

    #[async_trait]
    impl TransactionBuilder for InsertBuilder {
        type Error = StateError;

        async fn build(&mut self, attempt: u32) -> Result<Vec<Operation>> {
            assert_eq!(attempt, self.calls);
            self.calls += 1;
            Ok(vec![
                Operation::new(Collection::Leases, self.id.clone())
                    .assert(Assert::Missing)
                    .insert(json!({"_id": self.id})),
            ])
        }
    }

    #[tokio::test]
    async fn test_runner_retries_then_gives_up() {
        let store = Arc::new(MemoryStore::new());
        let runner = TxnRunner::new(store.clone(), 3);

        let mut first = InsertBuilder { id: "x".into(), calls: 0 };
        runner.run(&mut first).await.unwrap();
        assert_eq!(first.calls, 1);

        let mut second = InsertBuilder { id: "x".into(), calls: 0 };
        let err = runner.run(&mut second).await.unwrap_err();
        assert!(matches!(err, StateError::ExcessiveContention { attempts: 3 }));
        assert_eq!(second.calls, 3);
        assert_eq!(store.txn_count(), 1);
    }

    struct NoopBuilder;

    #[async_trait]
    impl TransactionBuilder for NoopBuilder {
        type Error = StateError;

        async fn build(&mut self, _attempt: u32) -> Result<Vec<Operation>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_empty_transaction_skips_store() {
        let store = Arc::new(MemoryStore::new());
        let runner = TxnRunner::new(store.clone(), 3);
        runner.run(&mut NoopBuilder).await.unwrap();
        assert_eq!(store.txn_count(), 0);
    }
}
