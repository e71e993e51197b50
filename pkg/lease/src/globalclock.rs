//! Global virtual clock.
//!
//! A single document in the `globalclock` collection holds a nanosecond
//! counter. One updater advances it with conditional `$set` writes; any
//! number of readers turn it into a "virtual now". The counter never moves
//! backwards: every advance asserts the value it was computed from.

use chrono::{DateTime, Utc};
use pkg_constants::lease::GLOBAL_CLOCK_DOC_ID;
use pkg_state::{Assert, Collection, DocumentStore, Operation, StateError};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{LeaseError, Result};

pub const FIELD_TIME: &str = "time";

fn to_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

async fn read_time(store: &dyn DocumentStore) -> Result<Option<i64>> {
    match store.find_one(Collection::GlobalClock, GLOBAL_CLOCK_DOC_ID).await {
        Ok(doc) => match doc.get(FIELD_TIME).and_then(Value::as_i64) {
            Some(t) => Ok(Some(t)),
            None => Err(StateError::Corrupt {
                collection: Collection::GlobalClock,
                id: GLOBAL_CLOCK_DOC_ID.to_string(),
                reason: format!("missing or non-integer {:?} field", FIELD_TIME),
            }
            .into()),
        },
        Err(StateError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Advances the global clock. Run at most one per deployment; a second
/// updater makes both see `ConcurrentUpdate` until one backs off.
pub struct GlobalClockUpdater {
    store: Arc<dyn DocumentStore>,
    last: i64,
}

impl GlobalClockUpdater {
    /// Load the current time, creating the clock document at zero if needed.
    pub async fn new(store: Arc<dyn DocumentStore>) -> Result<Self> {
        let last = match read_time(store.as_ref()).await? {
            Some(t) => t,
            None => {
                let op = Operation::new(Collection::GlobalClock, GLOBAL_CLOCK_DOC_ID)
                    .assert(Assert::Missing)
                    .insert(json!({ "_id": GLOBAL_CLOCK_DOC_ID, FIELD_TIME: 0 }));
                match store.apply(&[op]).await {
                    Ok(()) => 0,
                    // Someone else created it first.
                    Err(StateError::Aborted) => read_time(store.as_ref()).await?.unwrap_or(0),
                    Err(e) => return Err(e.into()),
                }
            }
        };
        Ok(Self { store, last })
    }

    /// The time as of this updater's last successful read or write.
    pub fn time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.last)
    }

    /// Move the clock forward by `d`. If the stored value changed since our
    /// last read, nothing is written, the new value is loaded and
    /// `ConcurrentUpdate` is returned.
    pub async fn advance(&mut self, d: Duration) -> Result<()> {
        let next = self.last.saturating_add(to_nanos(d));
        let mut fields = Map::new();
        fields.insert(FIELD_TIME.to_string(), Value::from(next));
        let op = Operation::new(Collection::GlobalClock, GLOBAL_CLOCK_DOC_ID)
            .assert(Assert::field_eq(FIELD_TIME, self.last))
            .set(fields);

        match self.store.apply(&[op]).await {
            Ok(()) => {
                self.last = next;
                Ok(())
            }
            Err(StateError::Aborted) => {
                if let Some(t) = read_time(self.store.as_ref()).await? {
                    self.last = t;
                }
                Err(LeaseError::ConcurrentUpdate)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Reads the global clock.
#[derive(Clone)]
pub struct GlobalClockReader {
    store: Arc<dyn DocumentStore>,
}

impl GlobalClockReader {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Current global time; the Unix epoch if the clock was never started.
    pub async fn now(&self) -> Result<DateTime<Utc>> {
        let nanos = read_time(self.store.as_ref()).await?.unwrap_or(0);
        Ok(DateTime::from_timestamp_nanos(nanos))
    }
}

/// Background task advancing the global clock by the local time that
/// actually elapsed between ticks.
pub struct GlobalClockWorker {
    updater: GlobalClockUpdater,
    interval: Duration,
    dying: watch::Receiver<bool>,
}

impl GlobalClockWorker {
    pub fn new(updater: GlobalClockUpdater, interval: Duration, dying: watch::Receiver<bool>) -> Self {
        Self {
            updater,
            interval,
            dying,
        }
    }

    /// Start the worker loop as a background task.
    pub fn start(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "GlobalClockWorker started (interval={}ms, time={})",
                self.interval.as_millis(),
                self.updater.time()
            );
            let mut interval = tokio::time::interval(self.interval);
            interval.tick().await;
            let mut last = Instant::now();
            loop {
                tokio::select! {
                    _ = self.dying.changed() => break,
                    _ = interval.tick() => {}
                }
                let now = Instant::now();
                match self.updater.advance(now - last).await {
                    Ok(()) => {}
                    Err(LeaseError::ConcurrentUpdate) => {
                        debug!("Global clock advanced elsewhere; now {}", self.updater.time())
                    }
                    Err(e) => {
                        warn!("GlobalClockWorker advance error: {}", e);
                        continue;
                    }
                }
                last = now;
            }
            info!("GlobalClockWorker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_state::MemoryStore;

    #[tokio::test]
    async fn test_advance_and_read() {
        let store = MemoryStore::new();
        let reader = GlobalClockReader::new(Arc::new(store.clone()));
        assert_eq!(reader.now().await.unwrap(), DateTime::from_timestamp_nanos(0));

        let mut updater = GlobalClockUpdater::new(Arc::new(store.clone())).await.unwrap();
        updater.advance(Duration::from_secs(2)).await.unwrap();
        updater.advance(Duration::from_millis(500)).await.unwrap();
        assert_eq!(
            reader.now().await.unwrap(),
            DateTime::from_timestamp_nanos(2_500_000_000)
        );
    }

    #[tokio::test]
    async fn test_concurrent_updaters() {
        let store = MemoryStore::new();
        let mut a = GlobalClockUpdater::new(Arc::new(store.clone())).await.unwrap();
        let mut b = GlobalClockUpdater::new(Arc::new(store.clone())).await.unwrap();

        a.advance(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(
            b.advance(Duration::from_secs(5)).await,
            Err(LeaseError::ConcurrentUpdate)
        ));
        // b picked up a's write and can continue from it.
        assert_eq!(b.time(), DateTime::from_timestamp_nanos(1_000_000_000));
        b.advance(Duration::from_secs(1)).await.unwrap();

        let reader = GlobalClockReader::new(Arc::new(store));
        assert_eq!(
            reader.now().await.unwrap(),
            DateTime::from_timestamp_nanos(2_000_000_000)
        );
    }

    #[tokio::test]
    async fn test_corrupt_clock_document() {
        let store = MemoryStore::new();
        store
            .put_raw(Collection::GlobalClock, GLOBAL_CLOCK_DOC_ID, json!({"time": "soon"}))
            .await;
        let reader = GlobalClockReader::new(Arc::new(store));
        assert!(matches!(
            reader.now().await,
            Err(LeaseError::State(StateError::Corrupt { .. }))
        ));
    }

    #[tokio::test]
    async fn test_worker_advances_until_killed() {
        let store = MemoryStore::new();
        let updater = GlobalClockUpdater::new(Arc::new(store.clone())).await.unwrap();
        let (dying, dying_rx) = watch::channel(false);
        let task = GlobalClockWorker::new(updater, Duration::from_millis(10), dying_rx).start();

        tokio::time::sleep(Duration::from_millis(60)).await;
        dying.send_replace(true);
        task.await.unwrap();

        let reader = GlobalClockReader::new(Arc::new(store));
        assert!(reader.now().await.unwrap() > DateTime::from_timestamp_nanos(0));
    }
}
