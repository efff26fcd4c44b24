//! Periodic restart scheduler
//!
//! One task polls the coordinator on a fixed interval and cycles the engine
//! at most once per tick, however many changes arrived since the last one.

use crate::coordinator::RestartCoordinator;
use crate::error::Error;
use crate::supervisor::{EngineSupervisor, RestartReport};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Restarting,
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing pending, or the pending restart is not due yet
    Clean,
    Restarted { inbounds: usize },
    Unchanged,
    /// A restart was already running; the change stays pending
    Deferred,
    Failed,
}

pub struct RestartScheduler {
    coordinator: Arc<RestartCoordinator>,
    supervisor: Arc<EngineSupervisor>,
    interval: Duration,
    state: Mutex<SchedulerState>,
}

impl RestartScheduler {
    pub fn new(
        coordinator: Arc<RestartCoordinator>,
        supervisor: Arc<EngineSupervisor>,
        interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            supervisor,
            interval,
            state: Mutex::new(SchedulerState::Idle),
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.lock()
    }

    /// Restart the engine if a change is pending
    pub async fn tick(&self) -> TickOutcome {
        if !self.coordinator.test_and_clear_if_dirty() {
            return TickOutcome::Clean;
        }
        self.run_claimed_restart().await
    }

    /// Restart for a change this tick already claimed from the coordinator
    async fn run_claimed_restart(&self) -> TickOutcome {
        *self.state.lock() = SchedulerState::Restarting;
        let result = self.supervisor.restart(false).await;
        *self.state.lock() = SchedulerState::Idle;

        match result {
            Ok(RestartReport::Restarted { inbounds }) => {
                info!(inbounds, "Scheduled engine restart completed");
                TickOutcome::Restarted { inbounds }
            }
            Ok(RestartReport::Unchanged) => TickOutcome::Unchanged,
            Err(Error::RestartInProgress) => {
                // A forced restart claimed the permit after we cleared the flag
                debug!("Restart already in progress, keeping change pending");
                self.coordinator.mark_dirty();
                TickOutcome::Deferred
            }
            Err(e) => {
                let (tags, phase) = self
                    .supervisor
                    .last_outcome()
                    .map(|outcome| (outcome.inbounds, outcome.failed_phase))
                    .unwrap_or_default();
                error!(error = %e, tags = ?tags, phase = ?phase, "Scheduled engine restart failed");
                TickOutcome::Failed
            }
        }
    }

    /// Tick on the configured interval until shutdown is signalled
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Restart scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                changed = shutdown_rx.changed() => {
                    // A dropped sender also means shutdown
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Restart scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbound::NewInbound;
    use crate::supervisor::tests::{harness, socks, Harness};
    use std::sync::atomic::Ordering;

    fn scheduler(h: &Harness, interval: Duration) -> Arc<RestartScheduler> {
        Arc::new(RestartScheduler::new(
            h.coordinator.clone(),
            h.supervisor.clone(),
            interval,
        ))
    }

    #[tokio::test]
    async fn test_tick_without_changes_is_clean() {
        let h = harness();
        let scheduler = scheduler(&h, Duration::from_secs(10));

        assert_eq!(scheduler.tick().await, TickOutcome::Clean);
        assert_eq!(h.engine.start_count(), 0);
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_many_changes_one_restart() {
        let h = harness();
        let scheduler = scheduler(&h, Duration::from_secs(10));

        for port in [1000, 2000, 3000] {
            h.registry.add(&h.admin, NewInbound::new(port, socks())).unwrap();
            h.coordinator.mark_dirty();
        }

        assert_eq!(scheduler.tick().await, TickOutcome::Restarted { inbounds: 3 });
        assert_eq!(scheduler.tick().await, TickOutcome::Clean);
        assert_eq!(h.engine.start_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_restart_is_not_retried() {
        let h = harness();
        let scheduler = scheduler(&h, Duration::from_secs(10));
        h.engine.fail_starts.store(1, Ordering::SeqCst);

        h.coordinator.mark_dirty();
        assert_eq!(scheduler.tick().await, TickOutcome::Failed);
        assert!(!h.coordinator.is_dirty());
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        // No retry until something changes again
        assert_eq!(scheduler.tick().await, TickOutcome::Clean);
        assert_eq!(h.engine.start_count(), 1);

        h.coordinator.mark_dirty();
        assert_eq!(scheduler.tick().await, TickOutcome::Restarted { inbounds: 0 });
        assert_eq!(h.engine.start_count(), 2);
    }

    #[tokio::test]
    async fn test_tick_leaves_change_pending_while_restart_runs() {
        let h = harness();
        let scheduler = scheduler(&h, Duration::from_secs(10));

        let permit = h.coordinator.begin_restart().unwrap();
        h.coordinator.mark_dirty();
        assert_eq!(scheduler.tick().await, TickOutcome::Clean);
        assert!(h.coordinator.is_dirty());
        drop(permit);

        assert_eq!(scheduler.tick().await, TickOutcome::Restarted { inbounds: 0 });
    }

    #[tokio::test]
    async fn test_claimed_change_deferred_when_permit_taken() {
        let h = harness();
        let scheduler = scheduler(&h, Duration::from_secs(10));

        // The tick claims the change, then a forced restart wins the permit
        h.coordinator.mark_dirty();
        assert!(h.coordinator.test_and_clear_if_dirty());
        let permit = h.coordinator.begin_restart().unwrap();

        assert_eq!(scheduler.run_claimed_restart().await, TickOutcome::Deferred);
        assert!(h.coordinator.is_dirty());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(h.engine.start_count(), 0);
        drop(permit);

        // The change is picked up by the next tick
        assert_eq!(scheduler.tick().await, TickOutcome::Restarted { inbounds: 0 });
        assert!(!h.coordinator.is_dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_sender_dropped() {
        let h = harness();
        let scheduler = scheduler(&h, Duration::from_secs(10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(shutdown_rx).await })
        };
        drop(shutdown_tx);

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("scheduler exits once the shutdown sender is gone")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_shutdown() {
        let h = harness();
        let scheduler = scheduler(&h, Duration::from_secs(10));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(shutdown_rx).await })
        };

        h.registry.add(&h.admin, NewInbound::new(1000, socks())).unwrap();
        h.coordinator.mark_dirty();

        // Not yet due
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.engine.start_count(), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.engine.start_count(), 1);
        assert_eq!(h.engine.last_start().unwrap().tags(), vec!["inbound-1000"]);

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
