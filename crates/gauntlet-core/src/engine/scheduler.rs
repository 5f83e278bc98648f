//! Scheduler loop: fixed-interval polling of the pending-run queue.
//!
//! The semaphore only limits how much work this process requests per tick.
//! Correctness against double execution comes from the atomic claim in the
//! store, which stays safe under overlapping ticks and multiple process
//! instances.

use crate::engine::executor::RunExecutor;
use crate::storage::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Poll interval.
    pub tick: Duration,
    /// Maximum runs this process executes concurrently.
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            max_concurrent: 3,
        }
    }
}

pub struct Scheduler {
    store: Store,
    executor: Arc<RunExecutor>,
    slots: Arc<Semaphore>,
    tick: Duration,
    tasks: Mutex<JoinSet<()>>,
}

impl Scheduler {
    pub fn new(store: Store, executor: Arc<RunExecutor>, config: SchedulerConfig) -> Self {
        Self {
            store,
            executor,
            slots: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            tick: config.tick,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Poll forever. A failing run, claim, or fetch never stops the loop.
    pub async fn run(&self) {
        info!(tick_secs = self.tick.as_secs_f64(), "scheduler started");
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.reap_finished().await;
            self.tick_once().await;
        }
    }

    /// One poll: fetch up to the free-slot budget of pending runs in FIFO
    /// order, claim each, and dispatch the winners. Returns how many runs
    /// were dispatched.
    pub async fn tick_once(&self) -> usize {
        let budget = self.slots.available_permits();
        if budget == 0 {
            return 0;
        }
        let pending = match self.store.fetch_pending(budget) {
            Ok(pending) => pending,
            Err(e) => {
                error!("fetching pending runs failed: {e}");
                return 0;
            }
        };

        let mut dispatched = 0;
        for run in pending {
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            match self.store.claim_run(run.id) {
                Ok(true) => {}
                Ok(false) => {
                    // Another claimant won, or the run was withdrawn.
                    debug!(run = run.id, "run no longer pending, skipping");
                    continue;
                }
                Err(e) => {
                    error!(run = run.id, "claim failed: {e}");
                    continue;
                }
            }

            debug!(run = run.id, "run claimed, dispatching");
            let executor = self.executor.clone();
            self.tasks.lock().await.spawn(async move {
                let _permit = permit;
                if let Err(e) = executor.execute(&run).await {
                    error!(run = run.id, "run execution failed: {e:#}");
                }
            });
            dispatched += 1;
        }
        dispatched
    }

    /// Wait for every dispatched run to finish. Used on shutdown and by
    /// tests.
    pub async fn drain(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("run task panicked: {e}");
            }
        }
    }

    async fn reap_finished(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(res) = tasks.try_join_next() {
            if let Err(e) = res {
                error!("run task panicked: {e}");
            }
        }
    }
}
