//! The shared event condition the control loop serialises on.
//!
//! Worker completion, console message arrival, and shutdown all signal the
//! same condition. Waiters subscribe before checking their predicate, so a
//! signal raised between the check and the wait is never lost.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

/// Locks a mutex, recovering the inner state if a holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct EventCondition {
    epoch: watch::Sender<u64>,
}

impl EventCondition {
    #[must_use]
    pub fn new() -> Self {
        let (epoch, _) = watch::channel(0);
        Self { epoch }
    }

    /// Wakes every current waiter.
    pub fn signal(&self) {
        self.epoch.send_modify(|value| *value = value.wrapping_add(1));
    }

    #[must_use]
    pub fn subscribe(&self) -> EventWaiter {
        EventWaiter {
            epoch: self.epoch.subscribe(),
        }
    }
}

impl Default for EventCondition {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct EventWaiter {
    epoch: watch::Receiver<u64>,
}

impl EventWaiter {
    /// Waits for the next signal after the last one this waiter observed.
    pub async fn wait(&mut self) {
        if self.epoch.changed().await.is_err() {
            // Condition dropped; treat as a wake so callers re-check state.
        }
    }

    /// As [`EventWaiter::wait`], bounded by `timeout`.
    pub async fn wait_timeout(&mut self, timeout: Duration) {
        drop(tokio::time::timeout(timeout, self.epoch.changed()).await);
    }
}
