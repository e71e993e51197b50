//! Lease client: claim, extend and expire leases in one namespace.
//!
//! The client keeps a cache of every lease in its namespace. The cache is a
//! hint: every write asserts the document version it was derived from, and
//! any retry first refreshes the cache from the store before rebuilding.
//!
//! Expiry times are local. When a refresh sees a lease version for the first
//! time, its expiry is `local now + duration`; later refreshes that see the
//! same version keep the expiry computed then. A process therefore measures
//! a lease from the moment it first observed the write, never from the
//! writer's clock.
//!
//! A client is not safe for concurrent use; every mutating method takes
//! `&mut self`. The manager owns one client per namespace.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use pkg_state::{Assert, Collection, DocumentStore, Operation, Query, TransactionBuilder, TxnRunner};
use pkg_types::lease::{
    DocumentError, FIELD_DURATION, FIELD_VERSION, FIELD_WRITER, FIELD_WRITTEN, LeaseDocument,
};
use pkg_types::validate::validate_identity;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, add_duration, to_nanos};
use crate::error::{LeaseError, Result};
use crate::token::FencingAssertion;

pub struct ClientConfig {
    /// Identity written into every document this client writes.
    pub id: String,
    pub namespace: String,
    pub collection: Collection,
    pub store: Arc<dyn DocumentStore>,
    pub clock: Arc<dyn Clock>,
    /// Transaction attempts before giving up with a contention error.
    pub max_attempts: u32,
}

/// What a holder asks for when claiming or extending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub holder: String,
    pub duration: Duration,
}

impl Request {
    pub fn new(holder: impl Into<String>, duration: Duration) -> Self {
        Self {
            holder: holder.into(),
            duration,
        }
    }
}

/// Snapshot of one lease as this process understands it.
#[derive(Debug, Clone, PartialEq)]
pub struct Info {
    pub holder: String,
    /// Local time after which this process considers the lease expired.
    pub expiry: DateTime<Utc>,
    /// Process that last wrote the lease.
    pub writer: String,
    /// Fence a caller can add to its own transaction.
    pub assertion: FencingAssertion,
}

#[derive(Debug, Clone, PartialEq)]
struct Entry {
    holder: String,
    expiry: DateTime<Utc>,
    writer: String,
    version: String,
}

/// The immutable half of a client, shared with transaction builders.
struct Context {
    writer: String,
    namespace: String,
    collection: Collection,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    session: String,
}

impl Context {
    fn doc_id(&self, name: &str) -> String {
        LeaseDocument::doc_id(&self.namespace, name)
    }

    fn document(&self, name: &str, request: &Request, now: DateTime<Utc>, version: &str) -> LeaseDocument {
        LeaseDocument {
            id: self.doc_id(name),
            namespace: self.namespace.clone(),
            name: name.to_string(),
            holder: request.holder.clone(),
            duration: duration_nanos(request.duration),
            writer: self.writer.clone(),
            written: to_nanos(now),
            version: version.to_string(),
        }
    }
}

/// The mutable half of a client.
#[derive(Default)]
struct Cache {
    entries: HashMap<String, Entry>,
    /// Offset of each writer's clock from ours, fixed at first observation.
    skews: HashMap<String, TimeDelta>,
    minted: u64,
}

impl Cache {
    async fn refresh(&mut self, ctx: &Context) -> Result<()> {
        let query = Query::IdPrefix(LeaseDocument::namespace_prefix(&ctx.namespace));
        let docs = ctx.store.find_all(ctx.collection, &query).await?;
        let now = ctx.clock.now();

        let mut entries = HashMap::with_capacity(docs.len());
        let mut skews = self.skews.clone();
        for (id, value) in docs {
            let doc = LeaseDocument::from_value(value).map_err(|source| LeaseError::Corrupt {
                id: id.clone(),
                source,
            })?;
            if doc.id != id {
                return Err(LeaseError::Corrupt {
                    id: id.clone(),
                    source: DocumentError::Invalid {
                        id: doc.id,
                        field: "_id",
                        reason: format!("stored under '{}'", id),
                    },
                });
            }

            if doc.written != 0 {
                let written = DateTime::from_timestamp_nanos(doc.written);
                skews.entry(doc.writer.clone()).or_insert(now - written);
            }

            let entry = match self.entries.get(&doc.name) {
                Some(cached) if cached.version == doc.version => cached.clone(),
                _ => Entry {
                    expiry: add_duration(now, doc.duration()),
                    holder: doc.holder,
                    writer: doc.writer,
                    version: doc.version,
                },
            };
            entries.insert(doc.name, entry);
        }

        self.entries = entries;
        self.skews = skews;
        Ok(())
    }

    fn mint_version(&mut self, ctx: &Context) -> String {
        self.minted += 1;
        format!("{}:{}:{}", ctx.writer, ctx.session, self.minted)
    }
}

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

fn validate_request(name: &str, request: &Request) -> Result<()> {
    validate_identity("lease name", name).map_err(|e| LeaseError::NotValid(e.to_string()))?;
    validate_identity("holder", &request.holder).map_err(|e| LeaseError::NotValid(e.to_string()))?;
    if request.duration.is_zero() {
        return Err(LeaseError::NotValid("lease duration must be positive".to_string()));
    }
    Ok(())
}

pub struct Client {
    ctx: Context,
    runner: TxnRunner,
    cache: Cache,
}

impl Client {
    /// Create a client and load the namespace's current leases.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        validate_identity("client id", &config.id).map_err(|e| LeaseError::NotValid(e.to_string()))?;
        validate_identity("namespace", &config.namespace)
            .map_err(|e| LeaseError::NotValid(e.to_string()))?;

        let runner = TxnRunner::new(config.store.clone(), config.max_attempts);
        let mut client = Self {
            ctx: Context {
                writer: config.id,
                namespace: config.namespace,
                collection: config.collection,
                store: config.store,
                clock: config.clock,
                session: uuid::Uuid::new_v4().simple().to_string(),
            },
            runner,
            cache: Cache::default(),
        };
        client.refresh().await?;
        Ok(client)
    }

    pub fn namespace(&self) -> &str {
        &self.ctx.namespace
    }

    /// Copy of every cached lease, keyed by name.
    pub fn leases(&self) -> HashMap<String, Info> {
        self.cache
            .entries
            .iter()
            .map(|(name, entry)| {
                let info = Info {
                    holder: entry.holder.clone(),
                    expiry: entry.expiry,
                    writer: entry.writer.clone(),
                    assertion: FencingAssertion::LeaseHeld {
                        collection: self.ctx.collection,
                        id: self.ctx.doc_id(name),
                        holder: entry.holder.clone(),
                    },
                };
                (name.clone(), info)
            })
            .collect()
    }

    /// Observed clock offset of `writer` relative to this process.
    pub fn skew(&self, writer: &str) -> Option<TimeDelta> {
        self.cache.skews.get(writer).copied()
    }

    pub fn skews(&self) -> &HashMap<String, TimeDelta> {
        &self.cache.skews
    }

    /// Re-read every lease in the namespace. A corrupt document fails the
    /// whole refresh and leaves the cache untouched.
    pub async fn refresh(&mut self) -> Result<()> {
        self.cache.refresh(&self.ctx).await
    }

    /// Take an unheld lease. Fails with `Invalid` if the cache shows the
    /// lease held, even by the same holder.
    pub async fn claim_lease(&mut self, name: &str, request: Request) -> Result<()> {
        validate_request(name, &request)?;
        let mut txn = ClaimTxn {
            ctx: &self.ctx,
            cache: &mut self.cache,
            name,
            request: &request,
            claimed: None,
        };
        self.runner.run(&mut txn).await?;
        if let Some(entry) = txn.claimed.take() {
            self.cache.entries.insert(name.to_string(), entry);
        }
        Ok(())
    }

    /// Push out the expiry of a lease held by `request.holder`. Requests
    /// that would not move the expiry later succeed without writing.
    pub async fn extend_lease(&mut self, name: &str, request: Request) -> Result<()> {
        validate_request(name, &request)?;
        let mut txn = ExtendTxn {
            ctx: &self.ctx,
            cache: &mut self.cache,
            name,
            request: &request,
            extended: None,
        };
        self.runner.run(&mut txn).await?;
        if let Some(entry) = txn.extended.take() {
            self.cache.entries.insert(name.to_string(), entry);
        }
        Ok(())
    }

    /// Remove a lease whose cached expiry has passed.
    pub async fn expire_lease(&mut self, name: &str) -> Result<()> {
        let mut txn = ExpireTxn {
            ctx: &self.ctx,
            cache: &mut self.cache,
            name,
            expired: false,
        };
        self.runner.run(&mut txn).await?;
        if txn.expired {
            self.cache.entries.remove(name);
        }
        Ok(())
    }
}

struct ClaimTxn<'a> {
    ctx: &'a Context,
    cache: &'a mut Cache,
    name: &'a str,
    request: &'a Request,
    claimed: Option<Entry>,
}

#[async_trait]
impl<'a> TransactionBuilder for ClaimTxn<'a> {
    type Error = LeaseError;

    async fn build(&mut self, attempt: u32) -> Result<Vec<Operation>> {
        if attempt > 0 {
            self.cache.refresh(self.ctx).await?;
        }
        if self.cache.entries.contains_key(self.name) {
            return Err(LeaseError::Invalid(format!(
                "lease {:?} already held",
                self.name
            )));
        }

        let now = self.ctx.clock.now();
        let version = self.cache.mint_version(self.ctx);
        let doc = self.ctx.document(self.name, self.request, now, &version);
        let value = doc.to_value().map_err(|e| LeaseError::NotValid(e.to_string()))?;

        self.claimed = Some(Entry {
            holder: self.request.holder.clone(),
            expiry: add_duration(now, self.request.duration),
            writer: self.ctx.writer.clone(),
            version,
        });
        Ok(vec![
            Operation::new(self.ctx.collection, doc.id)
                .assert(Assert::Missing)
                .insert(value),
        ])
    }
}

struct ExtendTxn<'a> {
    ctx: &'a Context,
    cache: &'a mut Cache,
    name: &'a str,
    request: &'a Request,
    extended: Option<Entry>,
}

#[async_trait]
impl<'a> TransactionBuilder for ExtendTxn<'a> {
    type Error = LeaseError;

    async fn build(&mut self, attempt: u32) -> Result<Vec<Operation>> {
        self.extended = None;
        if attempt > 0 {
            self.cache.refresh(self.ctx).await?;
        }
        let Some(entry) = self.cache.entries.get(self.name) else {
            return Err(LeaseError::Invalid(format!("lease {:?} not held", self.name)));
        };
        if entry.holder != self.request.holder {
            return Err(LeaseError::Invalid(format!(
                "lease {:?} held by {:?}, not {:?}",
                self.name, entry.holder, self.request.holder
            )));
        }

        let now = self.ctx.clock.now();
        if entry.expiry < now {
            return Err(LeaseError::Invalid(format!(
                "lease {:?} expired at {}",
                self.name, entry.expiry
            )));
        }
        let expiry = add_duration(now, self.request.duration);
        if expiry <= entry.expiry {
            return Ok(Vec::new());
        }
        let current_version = entry.version.clone();

        let version = self.cache.mint_version(self.ctx);
        let mut fields = Map::new();
        fields.insert(FIELD_DURATION.to_string(), Value::from(duration_nanos(self.request.duration)));
        fields.insert(FIELD_WRITER.to_string(), Value::from(self.ctx.writer.clone()));
        fields.insert(FIELD_WRITTEN.to_string(), Value::from(to_nanos(now)));
        fields.insert(FIELD_VERSION.to_string(), Value::from(version.clone()));

        self.extended = Some(Entry {
            holder: self.request.holder.clone(),
            expiry,
            writer: self.ctx.writer.clone(),
            version,
        });
        Ok(vec![
            Operation::new(self.ctx.collection, self.ctx.doc_id(self.name))
                .assert(Assert::field_eq(FIELD_VERSION, current_version))
                .set(fields),
        ])
    }
}

struct ExpireTxn<'a> {
    ctx: &'a Context,
    cache: &'a mut Cache,
    name: &'a str,
    expired: bool,
}

#[async_trait]
impl<'a> TransactionBuilder for ExpireTxn<'a> {
    type Error = LeaseError;

    async fn build(&mut self, attempt: u32) -> Result<Vec<Operation>> {
        self.expired = false;
        if attempt > 0 {
            self.cache.refresh(self.ctx).await?;
        }
        let Some(entry) = self.cache.entries.get(self.name) else {
            return Err(LeaseError::Invalid(format!("lease {:?} not held", self.name)));
        };
        let now = self.ctx.clock.now();
        if entry.expiry >= now {
            return Err(LeaseError::Invalid(format!(
                "lease {:?} does not expire until {}",
                self.name, entry.expiry
            )));
        }

        self.expired = true;
        Ok(vec![
            Operation::new(self.ctx.collection, self.ctx.doc_id(self.name))
                .assert(Assert::field_eq(FIELD_VERSION, entry.version.clone()))
                .remove(),
        ])
    }
}
