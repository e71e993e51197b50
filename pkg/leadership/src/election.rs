use pkg_types::validate::unit_application;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{LeadershipError, Result};
use crate::leadership::Claimer;

/// Keeps one unit leader of its application for as long as it can.
///
/// While leader, the claim is renewed every half duration. While another
/// unit leads, the loop blocks until that leadership is released and then
/// claims straight away.
pub struct LeaderElection {
    claimer: Claimer,
    application: String,
    unit: String,
    duration: Duration,
    renew_interval: Duration,
    leader_tx: watch::Sender<bool>,
    leader_rx: watch::Receiver<bool>,
}

impl LeaderElection {
    pub fn new(claimer: Claimer, unit: &str, duration: Duration) -> Result<Self> {
        let application = unit_application(unit)
            .ok_or_else(|| LeadershipError::NotValid(format!("{:?} is not a unit name", unit)))?
            .to_string();
        let (leader_tx, leader_rx) = watch::channel(false);
        Ok(Self {
            claimer,
            application,
            unit: unit.to_string(),
            duration,
            renew_interval: duration / 2,
            leader_tx,
            leader_rx,
        })
    }

    /// Get a receiver to observe leadership changes.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.leader_rx.clone()
    }

    pub fn is_leader(&self) -> bool {
        *self.leader_rx.borrow()
    }

    /// Claim or renew. `Ok(false)` means another unit leads.
    async fn try_acquire_or_renew(&self) -> Result<bool> {
        match self
            .claimer
            .claim_leadership(&self.application, &self.unit, self.duration)
            .await
        {
            Ok(()) => Ok(true),
            Err(LeadershipError::ClaimDenied) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn set_leader(&self, is_leader: bool) {
        let was_leader = *self.leader_rx.borrow();
        if is_leader && !was_leader {
            info!("{} is now leader of {}", self.unit, self.application);
        } else if !is_leader && was_leader {
            warn!(
                "Leadership of {} lost by {}; another unit took over",
                self.application, self.unit
            );
        }
        self.leader_tx.send_replace(is_leader);
    }

    /// Start the election loop as a background task. It runs until `dying`
    /// flips or the lease manager stops.
    pub fn start(self, dying: watch::Receiver<bool>) -> (tokio::task::JoinHandle<()>, watch::Receiver<bool>) {
        let rx = self.leader_rx.clone();
        let handle = tokio::spawn(async move {
            info!(
                "LeaderElection started (unit={}, application={}, duration={}s, renew={}ms)",
                self.unit,
                self.application,
                self.duration.as_secs(),
                self.renew_interval.as_millis()
            );

            loop {
                if *dying.borrow() {
                    break;
                }
                let mut wait = dying.clone();
                let pause = match self.try_acquire_or_renew().await {
                    Ok(true) => {
                        self.set_leader(true);
                        true
                    }
                    Ok(false) => {
                        self.set_leader(false);
                        debug!("{} waiting for leadership of {} to be released", self.unit, self.application);
                        let cancel = async move {
                            let _ = wait.changed().await;
                        };
                        match self
                            .claimer
                            .block_until_leadership_released(&self.application, cancel)
                            .await
                        {
                            Ok(()) => continue,
                            Err(LeadershipError::WaitCancelled | LeadershipError::Stopped) => break,
                            Err(e) => {
                                warn!("Leader election wait error: {}", e);
                                true
                            }
                        }
                    }
                    Err(LeadershipError::Stopped) => break,
                    Err(e) => {
                        warn!("Leader election error: {}", e);
                        self.set_leader(false);
                        true
                    }
                };

                if pause {
                    let mut wait = dying.clone();
                    tokio::select! {
                        _ = wait.changed() => break,
                        _ = tokio::time::sleep(self.renew_interval) => {}
                    }
                }
            }
            self.leader_tx.send_replace(false);
            info!("LeaderElection stopped (unit={})", self.unit);
        });

        (handle, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leadership::namespace_config;
    use chrono::DateTime;
    use pkg_lease::{Manager, ManagerConfig, ManualClock};
    use pkg_state::MemoryStore;
    use std::sync::Arc;
    use tokio::time::timeout;

    async fn start_manager(writer: &str, store: &MemoryStore, clock: &ManualClock) -> Manager {
        let mut config = ManagerConfig::new(writer, Arc::new(store.clone()), Arc::new(clock.clone()))
            .with_max_sleep(Duration::from_millis(20));
        config.namespaces.push(namespace_config());
        Manager::start(config).await.unwrap()
    }

    #[tokio::test]
    async fn test_rejects_non_unit_names() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let manager = start_manager("machine-0", &store, &clock).await;
        let claimer = Claimer::new(&manager).unwrap();
        assert!(matches!(
            LeaderElection::new(claimer, "mysql", Duration::from_secs(30)),
            Err(LeadershipError::NotValid(_))
        ));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_failover_after_leader_stops() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        let manager_a = start_manager("machine-0", &store, &clock).await;
        let manager_b = start_manager("machine-1", &store, &clock).await;
        let (dying_a, dying_a_rx) = watch::channel(false);
        let (dying_b, dying_b_rx) = watch::channel(false);

        let election_a = LeaderElection::new(
            Claimer::new(&manager_a).unwrap(),
            "mysql/0",
            Duration::from_secs(30),
        )
        .unwrap();
        let (task_a, mut leader_a) = election_a.start(dying_a_rx);
        timeout(Duration::from_secs(5), leader_a.wait_for(|v| *v))
            .await
            .unwrap()
            .unwrap();

        let election_b = LeaderElection::new(
            Claimer::new(&manager_b).unwrap(),
            "mysql/1",
            Duration::from_secs(30),
        )
        .unwrap();
        let (task_b, mut leader_b) = election_b.start(dying_b_rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!*leader_b.borrow());

        dying_a.send_replace(true);
        task_a.await.unwrap();
        manager_a.stop().await.unwrap();

        clock.advance(Duration::from_secs(31));
        timeout(Duration::from_secs(5), leader_b.wait_for(|v| *v))
            .await
            .unwrap()
            .unwrap();

        dying_b.send_replace(true);
        timeout(Duration::from_secs(5), task_b).await.unwrap().unwrap();
        assert!(!*leader_b.borrow());
        manager_b.stop().await.unwrap();
    }
}
