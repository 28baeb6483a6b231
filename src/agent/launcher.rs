//! Bounded worker pool with incremental start-up.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::AgentResult;
use crate::sync::{EventCondition, lock_unpoisoned};

use super::worker::WorkerFactory;

/// Observable state of one started worker slot. Slots that have not been
/// started yet are pending capacity and have no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerState {
    Starting,
    Running,
    Finished,
    Destroyed,
}

impl WorkerState {
    fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Finished | WorkerState::Destroyed)
    }
}

struct WorkerSlot {
    state: WorkerState,
    kill: watch::Sender<bool>,
    killed: bool,
}

struct LauncherState {
    /// Effective pool size; shrinks when further starts are capped.
    limit: usize,
    slots: Vec<WorkerSlot>,
}

/// Starts workers in increments up to the configured pool size, tracks their
/// termination on the shared condition, and supports both graceful capping
/// and forced destruction.
pub(crate) struct WorkerLauncher {
    factory: Box<dyn WorkerFactory>,
    shared: Arc<LauncherShared>,
}

struct LauncherShared {
    condition: Arc<EventCondition>,
    state: Mutex<LauncherState>,
}

impl WorkerLauncher {
    pub(crate) fn new(
        number_of_workers: usize,
        factory: Box<dyn WorkerFactory>,
        condition: Arc<EventCondition>,
    ) -> Self {
        Self {
            factory,
            shared: Arc::new(LauncherShared {
                condition,
                state: Mutex::new(LauncherState {
                    limit: number_of_workers,
                    slots: Vec::with_capacity(number_of_workers),
                }),
            }),
        }
    }

    /// Starts up to `count` more workers, bounded by the remaining capacity.
    /// Returns true iff further starts remain possible.
    pub(crate) fn start_some_workers(&self, count: usize) -> AgentResult<bool> {
        let mut state = lock_unpoisoned(&self.shared.state);
        let available = state.limit.saturating_sub(state.slots.len());
        for _ in 0..count.min(available) {
            let worker_number = state.slots.len();
            let (kill_tx, kill_rx) = watch::channel(false);
            state.slots.push(WorkerSlot {
                state: WorkerState::Starting,
                kill: kill_tx,
                killed: false,
            });

            match self.factory.create(worker_number) {
                Ok(worker) => {
                    debug!("Starting worker {}", worker.name());
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        supervise(shared, worker_number, worker, kill_rx).await;
                    });
                }
                Err(err) => {
                    warn!("Failed to create worker {}: {}", worker_number, err);
                    state.slots[worker_number].state = WorkerState::Finished;
                    self.shared.condition.signal();
                }
            }
        }
        Ok(state.slots.len() < state.limit)
    }

    /// Starts every remaining worker at once.
    pub(crate) fn start_all_workers(&self) -> AgentResult<()> {
        let remaining = {
            let state = lock_unpoisoned(&self.shared.state);
            state.limit.saturating_sub(state.slots.len())
        };
        self.start_some_workers(remaining)?;
        Ok(())
    }

    /// Caps the pool at the workers started so far.
    pub(crate) fn dont_start_any_more(&self) {
        {
            let mut state = lock_unpoisoned(&self.shared.state);
            state.limit = state.slots.len();
        }
        self.shared.condition.signal();
    }

    /// Caps the pool and forces every non-terminal worker to terminate.
    pub(crate) fn destroy_all_workers(&self) {
        {
            let mut state = lock_unpoisoned(&self.shared.state);
            state.limit = state.slots.len();
            for slot in &mut state.slots {
                if !slot.state.is_terminal() {
                    slot.killed = true;
                    if slot.kill.send(true).is_err() {
                        // Supervision already finished; slot is about to turn
                        // terminal anyway.
                    }
                }
            }
        }
        self.shared.condition.signal();
    }

    /// True iff no capacity remains and every started worker is terminal.
    pub(crate) fn all_finished(&self) -> bool {
        let state = lock_unpoisoned(&self.shared.state);
        state.slots.len() == state.limit
            && state.slots.iter().all(|slot| slot.state.is_terminal())
    }

    /// Blocks until every started worker reaches a terminal state.
    pub(crate) async fn shutdown(&self) {
        let mut waiter = self.shared.condition.subscribe();
        loop {
            {
                let state = lock_unpoisoned(&self.shared.state);
                if state.slots.iter().all(|slot| slot.state.is_terminal()) {
                    return;
                }
            }
            waiter.wait().await;
        }
    }

    #[cfg(test)]
    pub(crate) fn started_count(&self) -> usize {
        lock_unpoisoned(&self.shared.state).slots.len()
    }

    #[cfg(test)]
    fn worker_states(&self) -> Vec<WorkerState> {
        lock_unpoisoned(&self.shared.state)
            .slots
            .iter()
            .map(|slot| slot.state)
            .collect()
    }
}

async fn supervise(
    shared: Arc<LauncherShared>,
    worker_number: usize,
    worker: Box<dyn super::worker::Worker>,
    kill: watch::Receiver<bool>,
) {
    let name = worker.name().to_owned();
    {
        let mut state = lock_unpoisoned(&shared.state);
        state.slots[worker_number].state = WorkerState::Running;
    }
    shared.condition.signal();

    let result = worker.run(kill).await;

    {
        let mut state = lock_unpoisoned(&shared.state);
        let slot = &mut state.slots[worker_number];
        slot.state = if slot.killed {
            WorkerState::Destroyed
        } else {
            WorkerState::Finished
        };
    }
    match result {
        Ok(code) => info!("Worker {} exited with code {}", name, code),
        Err(err) => warn!("Worker {} failed: {}", name, err),
    }
    shared.condition.signal();
}

/// Periodic ramp-up driver: starts `increment` workers every tick and stops
/// itself once the pool is full.
pub(crate) async fn ramp_up(launcher: Arc<WorkerLauncher>, increment: usize, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The initial batch was started by the control loop; the first tick of a
    // tokio interval fires immediately, so consume it before ramping.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match launcher.start_some_workers(increment) {
            Ok(true) => {}
            Ok(false) => {
                debug!("Ramp-up complete");
                return;
            }
            Err(err) => {
                warn!("Failed to start workers during ramp-up: {}", err);
                return;
            }
        }
    }
}
