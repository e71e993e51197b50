//! Lease manager: the concurrency-safe front end to the lease clients.
//!
//! One worker task per namespace owns that namespace's [`Client`]. Every
//! claim, check and wait is a message to the worker, so the client is only
//! ever touched by one task. The worker also sweeps expired leases on a
//! timer and refreshes its cache whenever the store reports a change.
//!
//! Callers hold cheap cloneable handles ([`Claimer`], [`Checker`],
//! [`Token`]). Once the manager is killed, every pending and future call
//! through those handles fails with [`LeaseError::Stopped`].

use pkg_constants::lease::{
    DEFAULT_MAX_SLEEP, MANAGER_REQUEST_BUFFER, MIN_SWEEP_INTERVAL, SKEW_WARNING_THRESHOLD,
};
use pkg_constants::state::DEFAULT_MAX_TXN_ATTEMPTS;
use pkg_state::{Collection, DocumentStore, Notifier, StateError};
use pkg_types::lease::LeaseDocument;
use pkg_types::validate::validate_identity;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::client::{Client, ClientConfig, Info, Request};
use crate::clock::{Clock, until};
use crate::error::{LeaseError, Result};
use crate::secretary::Secretary;
use crate::token::FencingAssertion;

/// A namespace the manager serves, with the rules its names must follow.
#[derive(Clone)]
pub struct NamespaceConfig {
    pub name: String,
    pub secretary: Arc<dyn Secretary>,
}

pub struct ManagerConfig {
    /// Identity written into every lease document this manager writes.
    pub writer: String,
    pub store: Arc<dyn DocumentStore>,
    pub clock: Arc<dyn Clock>,
    pub namespaces: Vec<NamespaceConfig>,
    /// Longest the worker sleeps between expiry sweeps.
    pub max_sleep: Duration,
    pub max_txn_attempts: u32,
}

impl ManagerConfig {
    pub fn new(writer: impl Into<String>, store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            writer: writer.into(),
            store,
            clock,
            namespaces: Vec::new(),
            max_sleep: DEFAULT_MAX_SLEEP,
            max_txn_attempts: DEFAULT_MAX_TXN_ATTEMPTS,
        }
    }

    pub fn with_namespace(mut self, name: impl Into<String>, secretary: Arc<dyn Secretary>) -> Self {
        self.namespaces.push(NamespaceConfig {
            name: name.into(),
            secretary,
        });
        self
    }

    pub fn with_max_sleep(mut self, max_sleep: Duration) -> Self {
        self.max_sleep = max_sleep;
        self
    }
}

enum Command {
    Claim {
        name: String,
        request: Request,
        reply: oneshot::Sender<Result<()>>,
    },
    Check {
        name: String,
        holder: String,
        reply: oneshot::Sender<Result<FencingAssertion>>,
    },
    Block {
        name: String,
        reply: oneshot::Sender<()>,
    },
}

fn not_valid(e: anyhow::Error) -> LeaseError {
    LeaseError::NotValid(e.to_string())
}

/// Connection from a caller to one namespace's worker.
#[derive(Clone)]
struct Handle {
    namespace: String,
    secretary: Arc<dyn Secretary>,
    commands: mpsc::Sender<Command>,
    dying: watch::Receiver<bool>,
}

impl Handle {
    /// Send `command` and wait for its reply, giving up when the manager
    /// dies or `cancel` resolves.
    async fn call<T>(
        &self,
        command: Command,
        reply: oneshot::Receiver<T>,
        cancel: impl Future<Output = ()>,
    ) -> Result<T> {
        let mut dying = self.dying.clone();
        if *dying.borrow_and_update() {
            return Err(LeaseError::Stopped);
        }
        tokio::pin!(cancel);

        tokio::select! {
            sent = self.commands.send(command) => sent.map_err(|_| LeaseError::Stopped)?,
            _ = dying.changed() => return Err(LeaseError::Stopped),
            _ = &mut cancel => return Err(LeaseError::WaitCancelled),
        }

        tokio::select! {
            biased;
            result = reply => result.map_err(|_| LeaseError::Stopped),
            _ = dying.changed() => Err(LeaseError::Stopped),
            _ = &mut cancel => Err(LeaseError::WaitCancelled),
        }
    }
}

/// Claims leases in one namespace.
#[derive(Clone)]
pub struct Claimer {
    handle: Handle,
}

impl Claimer {
    /// Claim `name` for `holder`, or extend it if `holder` already has it.
    /// Fails with `ClaimDenied` if someone else holds it.
    pub async fn claim(&self, name: &str, holder: &str, duration: Duration) -> Result<()> {
        let secretary = &self.handle.secretary;
        secretary.check_lease(name).map_err(not_valid)?;
        secretary.check_holder(holder).map_err(not_valid)?;
        secretary.check_duration(duration).map_err(not_valid)?;

        let (reply, rx) = oneshot::channel();
        let command = Command::Claim {
            name: name.to_string(),
            request: Request::new(holder, duration),
            reply,
        };
        self.handle.call(command, rx, std::future::pending::<()>()).await?
    }

    /// Resolve once `name` is no longer held. Returns `WaitCancelled` if
    /// `cancel` resolves first.
    pub async fn wait_until_expired(&self, name: &str, cancel: impl Future<Output = ()>) -> Result<()> {
        self.handle.secretary.check_lease(name).map_err(not_valid)?;
        let (reply, rx) = oneshot::channel();
        let command = Command::Block {
            name: name.to_string(),
            reply,
        };
        self.handle.call(command, rx, cancel).await
    }

    pub fn namespace(&self) -> &str {
        &self.handle.namespace
    }
}

/// Builds tokens for leases in one namespace.
#[derive(Clone)]
pub struct Checker {
    handle: Handle,
}

impl Checker {
    pub fn token(&self, name: &str, holder: &str) -> Token {
        Token {
            handle: self.handle.clone(),
            name: name.to_string(),
            holder: holder.to_string(),
        }
    }
}

/// A claim that `holder` holds lease `name`, checkable at any time.
#[derive(Clone)]
pub struct Token {
    handle: Handle,
    name: String,
    holder: String,
}

impl Token {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Confirm the lease is still held by the token's holder and return an
    /// assertion to merge into writes that depend on it. Fails with
    /// `NotHeld` otherwise.
    pub async fn check(&self) -> Result<FencingAssertion> {
        let secretary = &self.handle.secretary;
        secretary.check_lease(&self.name).map_err(not_valid)?;
        secretary.check_holder(&self.holder).map_err(not_valid)?;

        let (reply, rx) = oneshot::channel();
        let command = Command::Check {
            name: self.name.clone(),
            holder: self.holder.clone(),
            reply,
        };
        self.handle.call(command, rx, std::future::pending::<()>()).await?
    }
}

struct NamespaceHandle {
    handle: Handle,
    leases: watch::Receiver<HashMap<String, Info>>,
}

pub struct Manager {
    namespaces: HashMap<String, NamespaceHandle>,
    dying: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Manager {
    /// Load every namespace and start its worker.
    pub async fn start(config: ManagerConfig) -> Result<Self> {
        validate_identity("writer", &config.writer).map_err(not_valid)?;
        if config.max_sleep.is_zero() {
            return Err(LeaseError::NotValid("max sleep must be positive".to_string()));
        }

        let (dying, dying_rx) = watch::channel(false);
        let mut namespaces = HashMap::new();
        let mut tasks = Vec::new();

        for ns in config.namespaces {
            if namespaces.contains_key(&ns.name) {
                return Err(LeaseError::NotValid(format!("duplicate namespace {:?}", ns.name)));
            }
            // Subscribe before the initial load so no change slips between them.
            let notifier = config
                .store
                .watch(Collection::Leases, &LeaseDocument::namespace_prefix(&ns.name));
            let client = Client::new(ClientConfig {
                id: config.writer.clone(),
                namespace: ns.name.clone(),
                collection: Collection::Leases,
                store: config.store.clone(),
                clock: config.clock.clone(),
                max_attempts: config.max_txn_attempts,
            })
            .await?;

            let (commands_tx, commands_rx) = mpsc::channel(MANAGER_REQUEST_BUFFER);
            let (leases_tx, leases_rx) = watch::channel(client.leases());
            let worker = Worker {
                client,
                clock: config.clock.clone(),
                commands: commands_rx,
                leases: leases_tx,
                dying: dying_rx.clone(),
                notifier,
                blocks: HashMap::new(),
                warned_skews: HashSet::new(),
                max_sleep: config.max_sleep,
                max_attempts: config.max_txn_attempts.max(1),
                backoff: false,
            };
            tasks.push(worker.start());

            namespaces.insert(
                ns.name.clone(),
                NamespaceHandle {
                    handle: Handle {
                        namespace: ns.name,
                        secretary: ns.secretary,
                        commands: commands_tx,
                        dying: dying_rx.clone(),
                    },
                    leases: leases_rx,
                },
            );
        }

        info!(
            "Lease manager started (writer={}, namespaces={})",
            config.writer,
            namespaces.len()
        );
        Ok(Self {
            namespaces,
            dying,
            tasks,
        })
    }

    fn namespace(&self, namespace: &str) -> Result<&NamespaceHandle> {
        self.namespaces
            .get(namespace)
            .ok_or_else(|| LeaseError::NotValid(format!("unknown lease namespace {:?}", namespace)))
    }

    pub fn claimer(&self, namespace: &str) -> Result<Claimer> {
        Ok(Claimer {
            handle: self.namespace(namespace)?.handle.clone(),
        })
    }

    pub fn checker(&self, namespace: &str) -> Result<Checker> {
        Ok(Checker {
            handle: self.namespace(namespace)?.handle.clone(),
        })
    }

    pub fn token(&self, namespace: &str, name: &str, holder: &str) -> Result<Token> {
        Ok(self.checker(namespace)?.token(name, holder))
    }

    /// Last snapshot of the namespace's leases published by its worker.
    pub fn leases(&self, namespace: &str) -> Result<HashMap<String, Info>> {
        Ok(self.namespace(namespace)?.leases.borrow().clone())
    }

    /// Ask every worker to stop. Idempotent.
    pub fn kill(&self) {
        self.dying.send_replace(true);
    }

    pub fn is_dying(&self) -> bool {
        *self.dying.borrow()
    }

    /// Wait for every worker to exit.
    pub async fn wait(self) -> Result<()> {
        let mut failed = false;
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Lease manager worker failed: {}", e);
                failed = true;
            }
        }
        if failed {
            return Err(LeaseError::Stopped);
        }
        info!("Lease manager stopped");
        Ok(())
    }

    pub async fn stop(self) -> Result<()> {
        self.kill();
        self.wait().await
    }
}

struct Worker {
    client: Client,
    clock: Arc<dyn Clock>,
    commands: mpsc::Receiver<Command>,
    leases: watch::Sender<HashMap<String, Info>>,
    dying: watch::Receiver<bool>,
    notifier: Notifier,
    blocks: HashMap<String, Vec<oneshot::Sender<()>>>,
    warned_skews: HashSet<String>,
    max_sleep: Duration,
    max_attempts: u32,
    /// Set while refreshes fail, so a broken store is not polled hot.
    backoff: bool,
}

impl Worker {
    fn start(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Lease worker started (namespace={}, max_sleep={}ms)",
                self.client.namespace(),
                self.max_sleep.as_millis()
            );
            let mut watching = true;
            loop {
                if *self.dying.borrow_and_update() {
                    break;
                }
                let sleep = self.next_sleep();
                tokio::select! {
                    _ = self.dying.changed() => break,
                    command = self.commands.recv() => match command {
                        Some(command) => self.handle(command).await,
                        None => break,
                    },
                    changed = self.notifier.changed(), if watching => {
                        if changed {
                            self.refresh().await;
                        } else {
                            debug!("Change notifications closed for namespace {}", self.client.namespace());
                            watching = false;
                        }
                    }
                    _ = tokio::time::sleep(sleep) => self.tick().await,
                }
            }
            info!("Lease worker stopped (namespace={})", self.client.namespace());
        })
    }

    fn next_sleep(&self) -> Duration {
        if self.backoff {
            return self.max_sleep;
        }
        let now = self.clock.now();
        let next_expiry = self.client.leases().values().map(|info| info.expiry).min();
        match next_expiry {
            // Wake just after expiry; leases are only expired strictly after it.
            Some(expiry) => until(now, expiry)
                .saturating_add(Duration::from_millis(1))
                .min(self.max_sleep)
                .max(MIN_SWEEP_INTERVAL),
            None => self.max_sleep,
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Claim {
                name,
                request,
                reply,
            } => {
                let result = self.claim(&name, request).await;
                if let Err(e) = &result {
                    log_failure("claim", self.client.namespace(), &name, e);
                }
                let _ = reply.send(result);
            }
            Command::Check {
                name,
                holder,
                reply,
            } => {
                let result = self.check(&name, &holder).await;
                let _ = reply.send(result);
            }
            Command::Block { name, reply } => {
                if self.client.leases().contains_key(&name) {
                    self.blocks.entry(name).or_default().push(reply);
                } else {
                    let _ = reply.send(());
                }
            }
        }
    }

    async fn claim(&mut self, name: &str, request: Request) -> Result<()> {
        for attempt in 0..self.max_attempts {
            let current = self.client.leases().remove(name);
            let now = self.clock.now();
            let result = match current {
                None => self.client.claim_lease(name, request.clone()).await,
                // Past its local expiry the lease may not be extended; clear it first.
                Some(info) if info.expiry < now => match self.client.expire_lease(name).await {
                    Ok(()) => {
                        debug!("Lease {} held by {} expired before claim", name, info.holder);
                        self.client.claim_lease(name, request.clone()).await
                    }
                    Err(e) => Err(e),
                },
                Some(info) if info.holder == request.holder => {
                    self.client.extend_lease(name, request.clone()).await
                }
                Some(Info { holder, .. }) => {
                    debug!(
                        "Claim of {} by {} denied: held by {}",
                        name, request.holder, holder
                    );
                    return Err(LeaseError::ClaimDenied);
                }
            };
            match result {
                Ok(()) => {
                    self.publish();
                    return Ok(());
                }
                Err(LeaseError::Invalid(reason)) => {
                    trace!("Claim of {} attempt {} invalid ({}); refreshing", name, attempt, reason);
                    self.client.refresh().await?;
                    self.publish();
                }
                Err(e) => return Err(e),
            }
        }
        Err(LeaseError::State(StateError::ExcessiveContention {
            attempts: self.max_attempts,
        }))
    }

    async fn check(&mut self, name: &str, holder: &str) -> Result<FencingAssertion> {
        if let Some(assertion) = self.held_by(name, holder) {
            return Ok(assertion);
        }
        self.client.refresh().await?;
        self.publish();
        self.held_by(name, holder).ok_or(LeaseError::NotHeld)
    }

    fn held_by(&self, name: &str, holder: &str) -> Option<FencingAssertion> {
        self.client
            .leases()
            .remove(name)
            .filter(|info| info.holder == holder && info.expiry >= self.clock.now())
            .map(|info| info.assertion)
    }

    async fn refresh(&mut self) -> bool {
        match self.client.refresh().await {
            Ok(()) => {
                self.backoff = false;
                self.warn_skews();
                self.publish();
                true
            }
            Err(e) => {
                error!(
                    "Lease refresh failed for namespace {}: {}",
                    self.client.namespace(),
                    e
                );
                self.backoff = true;
                false
            }
        }
    }

    /// Refresh, then expire every lease whose local expiry has passed.
    async fn tick(&mut self) {
        if !self.refresh().await {
            return;
        }
        let now = self.clock.now();
        let expired: Vec<String> = self
            .client
            .leases()
            .into_iter()
            .filter(|(_, info)| info.expiry < now)
            .map(|(name, _)| name)
            .collect();

        for name in expired {
            match self.client.expire_lease(&name).await {
                Ok(()) => info!("Lease {} in {} expired", name, self.client.namespace()),
                Err(e) => log_failure("expire", self.client.namespace(), &name, &e),
            }
        }
        self.publish();
    }

    fn warn_skews(&mut self) {
        let threshold = SKEW_WARNING_THRESHOLD.as_millis() as u64;
        for (writer, skew) in self.client.skews() {
            let millis = skew.num_milliseconds().unsigned_abs();
            if millis > threshold && self.warned_skews.insert(writer.clone()) {
                warn!(
                    "Clock of writer {} appears {}ms away from ours (namespace={})",
                    writer,
                    skew.num_milliseconds(),
                    self.client.namespace()
                );
            }
        }
    }

    /// Publish the lease snapshot and wake waiters whose lease is gone.
    fn publish(&mut self) {
        let leases = self.client.leases();
        self.blocks.retain(|name, waiters| {
            if leases.contains_key(name) {
                waiters.retain(|waiter| !waiter.is_closed());
                !waiters.is_empty()
            } else {
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(());
                }
                false
            }
        });
        self.leases.send_replace(leases);
    }
}

fn log_failure(op: &str, namespace: &str, name: &str, e: &LeaseError) {
    match e {
        LeaseError::ClaimDenied | LeaseError::NotHeld | LeaseError::Invalid(_) => {
            debug!("Lease {} of {} in {}: {}", op, name, namespace, e)
        }
        LeaseError::Corrupt { .. } => error!("Lease {} of {} in {}: {}", op, name, namespace, e),
        _ => warn!("Lease {} of {} in {}: {}", op, name, namespace, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::secretary::IdentitySecretary;
    use chrono::{DateTime, Utc};
    use pkg_state::{MemoryStore, Operation};
    use serde_json::json;
    use tokio::time::timeout;

    const NS: &str = "singular";

    fn start_time() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    async fn start(writer: &str, store: &MemoryStore, clock: &ManualClock) -> Manager {
        let config = ManagerConfig::new(writer, Arc::new(store.clone()), Arc::new(clock.clone()))
            .with_namespace(NS, Arc::new(IdentitySecretary))
            .with_max_sleep(Duration::from_millis(20));
        Manager::start(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_claim_extend_and_deny() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start_time());
        let manager = start("machine-0", &store, &clock).await;
        let claimer = manager.claimer(NS).unwrap();

        claimer.claim("controller", "unit-0", secs(30)).await.unwrap();
        assert!(matches!(
            claimer.claim("controller", "unit-1", secs(30)).await,
            Err(LeaseError::ClaimDenied)
        ));

        clock.advance(secs(10));
        claimer.claim("controller", "unit-0", secs(30)).await.unwrap();
        let leases = manager.leases(NS).unwrap();
        assert_eq!(leases["controller"].holder, "unit-0");
        assert_eq!(leases["controller"].expiry, start_time() + chrono::TimeDelta::seconds(40));

        manager.stop().await.unwrap();
    }

    /// A manager whose sweeps are too far apart to run during a test.
    async fn start_unswept(store: &MemoryStore, clock: &ManualClock) -> Manager {
        let config = ManagerConfig::new("machine-0", Arc::new(store.clone()), Arc::new(clock.clone()))
            .with_namespace(NS, Arc::new(IdentitySecretary))
            .with_max_sleep(secs(3600));
        Manager::start(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_claim_after_unswept_expiry_starts_new_term() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start_time());
        let manager = start_unswept(&store, &clock).await;
        let claimer = manager.claimer(NS).unwrap();
        claimer.claim("controller", "unit-0", secs(30)).await.unwrap();

        clock.advance(secs(3600));
        claimer.claim("controller", "unit-0", secs(30)).await.unwrap();
        let leases = manager.leases(NS).unwrap();
        assert_eq!(
            leases["controller"].expiry,
            start_time() + chrono::TimeDelta::seconds(3630)
        );
        // claim, expire, claim
        assert_eq!(store.txn_count(), 3);

        clock.advance(secs(3600));
        claimer.claim("controller", "unit-1", secs(30)).await.unwrap();
        assert_eq!(manager.leases(NS).unwrap()["controller"].holder, "unit-1");
        assert_eq!(store.txn_count(), 5);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_check_fails_after_unswept_expiry() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start_time());
        let manager = start_unswept(&store, &clock).await;
        manager
            .claimer(NS)
            .unwrap()
            .claim("controller", "unit-0", secs(30))
            .await
            .unwrap();
        let token = manager.token(NS, "controller", "unit-0").unwrap();

        clock.advance(secs(30));
        token.check().await.unwrap();

        clock.advance(secs(3600));
        assert!(matches!(token.check().await, Err(LeaseError::NotHeld)));

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_checked_by_secretary() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start_time());
        let manager = start("machine-0", &store, &clock).await;
        let claimer = manager.claimer(NS).unwrap();

        assert!(matches!(
            claimer.claim("two words", "unit-0", secs(30)).await,
            Err(LeaseError::NotValid(_))
        ));
        assert!(matches!(
            claimer.claim("controller", "", secs(30)).await,
            Err(LeaseError::NotValid(_))
        ));
        assert!(matches!(
            claimer.claim("controller", "unit-0", Duration::ZERO).await,
            Err(LeaseError::NotValid(_))
        ));
        assert!(matches!(manager.claimer("nope"), Err(LeaseError::NotValid(_))));
        assert_eq!(store.txn_count(), 0);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_token_check_and_fence() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start_time());
        let manager = start("machine-0", &store, &clock).await;
        manager
            .claimer(NS)
            .unwrap()
            .claim("controller", "unit-0", secs(30))
            .await
            .unwrap();

        let token = manager.token(NS, "controller", "unit-0").unwrap();
        let assertion = token.check().await.unwrap();
        let mut ops = vec![Operation::new(Collection::Leases, "settings").insert(json!({"v": 1}))];
        assertion.merge_into(&mut ops);
        store.apply(&ops).await.unwrap();

        let other = manager.token(NS, "controller", "unit-1").unwrap();
        assert!(matches!(other.check().await, Err(LeaseError::NotHeld)));
        let missing = manager.token(NS, "nothing", "unit-0").unwrap();
        assert!(matches!(missing.check().await, Err(LeaseError::NotHeld)));

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_until_expired_woken_by_sweep() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start_time());
        let manager = start("machine-0", &store, &clock).await;
        let claimer = manager.claimer(NS).unwrap();
        claimer.claim("controller", "unit-0", secs(30)).await.unwrap();

        let waiting = claimer.clone();
        let waiter = tokio::spawn(async move {
            waiting
                .wait_until_expired("controller", std::future::pending::<()>())
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        clock.advance(secs(31));
        let result = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(store.get_raw(Collection::Leases, "singular#controller#").await.is_none());
        assert!(manager.leases(NS).unwrap().is_empty());

        // Unheld leases resolve at once.
        claimer
            .wait_until_expired("controller", std::future::pending::<()>())
            .await
            .unwrap();
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_cancelled() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start_time());
        let manager = start("machine-0", &store, &clock).await;
        let claimer = manager.claimer(NS).unwrap();
        claimer.claim("controller", "unit-0", secs(30)).await.unwrap();

        let result = claimer
            .wait_until_expired("controller", tokio::time::sleep(Duration::from_millis(30)))
            .await;
        assert!(matches!(result, Err(LeaseError::WaitCancelled)));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_stops_waiters_and_callers() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start_time());
        let manager = start("machine-0", &store, &clock).await;
        let claimer = manager.claimer(NS).unwrap();
        claimer.claim("controller", "unit-0", secs(30)).await.unwrap();

        let waiting = claimer.clone();
        let waiter = tokio::spawn(async move {
            waiting
                .wait_until_expired("controller", std::future::pending::<()>())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.kill();
        let result = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
        assert!(matches!(result, Err(LeaseError::Stopped)));
        assert!(manager.is_dying());
        manager.wait().await.unwrap();

        assert!(matches!(
            claimer.claim("controller", "unit-0", secs(30)).await,
            Err(LeaseError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_two_managers_hand_over_lease() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start_time());
        let a = start("machine-0", &store, &clock).await;
        let b = start("machine-1", &store, &clock).await;
        let claim_a = a.claimer(NS).unwrap();
        let claim_b = b.claimer(NS).unwrap();

        claim_a.claim("controller", "unit-0", secs(30)).await.unwrap();
        assert!(matches!(
            claim_b.claim("controller", "unit-1", secs(30)).await,
            Err(LeaseError::ClaimDenied)
        ));
        let token = b.token(NS, "controller", "unit-0").unwrap();
        token.check().await.unwrap();

        let waiting = claim_b.clone();
        let waiter = tokio::spawn(async move {
            waiting
                .wait_until_expired("controller", std::future::pending::<()>())
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        clock.advance(secs(31));
        timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        claim_b.claim("controller", "unit-1", secs(30)).await.unwrap();
        assert!(matches!(token.check().await, Err(LeaseError::NotHeld)));
        let stale = a.token(NS, "controller", "unit-0").unwrap();
        assert!(matches!(stale.check().await, Err(LeaseError::NotHeld)));

        a.stop().await.unwrap();
        b.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_serialized() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(start_time());
        let manager = start("machine-0", &store, &clock).await;
        let claimer = manager.claimer(NS).unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let claimer = claimer.clone();
            handles.push(tokio::spawn(async move {
                claimer
                    .claim("controller", &format!("unit-{}", i), secs(30))
                    .await
            }));
        }
        let mut granted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => granted += 1,
                Err(LeaseError::ClaimDenied) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(granted, 1);
        assert_eq!(store.txn_count(), 1);
        manager.stop().await.unwrap();
    }
}
