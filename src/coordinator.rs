//! Restart coordination
//!
//! Collapses any number of configuration changes into one engine restart.
//! Handlers call [`RestartCoordinator::mark_dirty`]; the scheduler calls
//! [`RestartCoordinator::test_and_clear_if_dirty`] once per tick and the
//! supervisor holds a [`RestartPermit`] while the engine is cycled.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Source of monotonic time
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

#[derive(Debug, Default)]
struct RestartState {
    needs_restart: bool,
    restarting: bool,
    /// When the last restart attempt finished, successful or not
    last_restart: Option<Instant>,
}

/// Owner of the "needs restart" and "restart in progress" flags
pub struct RestartCoordinator {
    state: Mutex<RestartState>,
    min_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl RestartCoordinator {
    pub fn new(min_interval: Duration) -> Self {
        Self::with_clock(min_interval, Arc::new(SystemClock))
    }

    pub fn with_clock(min_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(RestartState::default()),
            min_interval,
            clock,
        }
    }

    /// Record that the live engine configuration is stale
    pub fn mark_dirty(&self) {
        self.state.lock().needs_restart = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().needs_restart
    }

    pub fn is_restarting(&self) -> bool {
        self.state.lock().restarting
    }

    /// Claim the pending restart, if any
    ///
    /// Returns true for exactly one caller per dirty period. While a restart
    /// is in flight, or the previous one finished less than the minimum
    /// interval ago, the flag stays set and false is returned.
    pub fn test_and_clear_if_dirty(&self) -> bool {
        let mut state = self.state.lock();
        if !state.needs_restart {
            return false;
        }
        if state.restarting {
            debug!("Restart pending, another restart is in progress");
            return false;
        }
        if let Some(last) = state.last_restart {
            let elapsed = self.clock.now().saturating_duration_since(last);
            if elapsed < self.min_interval {
                debug!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    min_interval_ms = self.min_interval.as_millis() as u64,
                    "Restart pending, minimum interval not reached"
                );
                return false;
            }
        }
        state.needs_restart = false;
        true
    }

    /// Enter the exclusive restart phase
    pub fn begin_restart(&self) -> Result<RestartPermit<'_>> {
        let mut state = self.state.lock();
        if state.restarting {
            return Err(Error::RestartInProgress);
        }
        state.restarting = true;
        Ok(RestartPermit { coordinator: self })
    }

    fn finish_restart(&self) {
        let mut state = self.state.lock();
        state.restarting = false;
        state.last_restart = Some(self.clock.now());
    }
}

/// Exclusive right to restart the engine; released on drop
pub struct RestartPermit<'a> {
    coordinator: &'a RestartCoordinator,
}

impl Drop for RestartPermit<'_> {
    fn drop(&mut self) {
        self.coordinator.finish_restart();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_initial_state() {
        let coordinator = RestartCoordinator::new(Duration::ZERO);
        assert!(!coordinator.is_dirty());
        assert!(!coordinator.is_restarting());
        assert!(!coordinator.test_and_clear_if_dirty());
    }

    #[test]
    fn test_mark_dirty_is_idempotent() {
        let coordinator = RestartCoordinator::new(Duration::ZERO);
        coordinator.mark_dirty();
        coordinator.mark_dirty();
        coordinator.mark_dirty();

        assert!(coordinator.test_and_clear_if_dirty());
        assert!(!coordinator.test_and_clear_if_dirty());
    }

    #[test]
    fn test_concurrent_mark_then_clear() {
        let coordinator = Arc::new(RestartCoordinator::new(Duration::ZERO));

        let markers: Vec<_> = (0..16)
            .map(|_| {
                let c = coordinator.clone();
                std::thread::spawn(move || c.mark_dirty())
            })
            .collect();
        for handle in markers {
            handle.join().unwrap();
        }

        let winners = Arc::new(AtomicUsize::new(0));
        let clearers: Vec<_> = (0..16)
            .map(|_| {
                let c = coordinator.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if c.test_and_clear_if_dirty() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in clearers {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_dirty());
    }

    #[test]
    fn test_no_mark_no_winner() {
        let coordinator = Arc::new(RestartCoordinator::new(Duration::ZERO));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let c = coordinator.clone();
                std::thread::spawn(move || c.test_and_clear_if_dirty())
            })
            .collect();
        for handle in handles {
            assert!(!handle.join().unwrap());
        }
    }

    #[test]
    fn test_permit_is_exclusive() {
        let coordinator = RestartCoordinator::new(Duration::ZERO);

        let permit = coordinator.begin_restart().unwrap();
        assert!(coordinator.is_restarting());
        assert!(matches!(
            coordinator.begin_restart(),
            Err(Error::RestartInProgress)
        ));

        drop(permit);
        assert!(!coordinator.is_restarting());
        assert!(coordinator.begin_restart().is_ok());
    }

    #[test]
    fn test_dirty_held_while_restarting() {
        let coordinator = RestartCoordinator::new(Duration::ZERO);

        let permit = coordinator.begin_restart().unwrap();
        coordinator.mark_dirty();
        assert!(!coordinator.test_and_clear_if_dirty());
        assert!(coordinator.is_dirty());

        drop(permit);
        assert!(coordinator.test_and_clear_if_dirty());
    }

    #[test]
    fn test_min_interval_defers_restart() {
        let clock = Arc::new(ManualClock::new());
        let coordinator = RestartCoordinator::with_clock(Duration::from_secs(30), clock.clone());

        // Nothing restarted yet: no interval to wait for
        coordinator.mark_dirty();
        assert!(coordinator.test_and_clear_if_dirty());
        drop(coordinator.begin_restart().unwrap());

        coordinator.mark_dirty();
        clock.advance(Duration::from_secs(10));
        assert!(!coordinator.test_and_clear_if_dirty());
        assert!(coordinator.is_dirty());

        clock.advance(Duration::from_secs(20));
        assert!(coordinator.test_and_clear_if_dirty());
        assert!(!coordinator.is_dirty());
    }
}
