//! Run loop: claims due runs and executes them on a bounded worker pool.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use remedy_store::Store;
use remedy_types::{Run, RunStatus, channels, now};

use crate::error::Result;
use crate::notifier::Notifier;
use crate::runner::Runner;

const ERROR_BACKOFF: Duration = Duration::from_secs(5);
const MIN_IDLE: Duration = Duration::from_millis(50);

/// Pool size and polling cadence.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub workers: usize,
    pub poll_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            workers: 5,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Claims scheduled runs whose time has come and hands each to the runner.
///
/// The database claim decides ownership; the in-memory `claimed` set only
/// stops this process from claiming a run it is already executing within a
/// single tick.
pub struct Scheduler {
    store: Arc<Store>,
    runner: Arc<Runner>,
    notifier: Notifier,
    settings: SchedulerSettings,
    permits: Arc<Semaphore>,
    claimed: Mutex<HashSet<Uuid>>,
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        runner: Arc<Runner>,
        notifier: Notifier,
        settings: SchedulerSettings,
    ) -> Self {
        let workers = settings.workers.max(1);
        Self {
            store,
            runner,
            notifier,
            settings,
            permits: Arc::new(Semaphore::new(workers)),
            claimed: Mutex::new(HashSet::new()),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Signal the cancellation token of a run executing in this process.
    /// Returns `false` when the run is not executing here.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.tokens.lock().get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Runs currently executing in this process.
    pub fn in_flight(&self) -> usize {
        self.claimed.lock().len()
    }

    /// Fail runs left `running` by a previous process. A run is only ever
    /// `running` while a worker holds it, so any found at startup were
    /// interrupted mid-action.
    pub fn recover(&self) -> Result<usize> {
        let mut recovered = 0;
        for run in self.store.runs_with_status(RunStatus::Running)? {
            if self.claimed.lock().contains(&run.id) {
                continue;
            }
            warn!(run_id = %run.id, "Failing run interrupted by restart");
            self.runner.fail_run(run.id, "interrupted")?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Wake due sleepers and start as many due runs as there are free
    /// workers. Returns the number of runs started.
    pub fn tick(self: &Arc<Self>) -> Result<usize> {
        let woken = self.store.wake_sleeping_runs()?;
        if !woken.is_empty() {
            debug!(runs = woken.len(), "Woke sleeping runs");
        }

        let mut started = 0;
        loop {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let exclude = self.claimed.lock().clone();
            let Some(run) = self.store.claim_next_run(&exclude)? else {
                break;
            };
            self.spawn(run, permit);
            started += 1;
        }
        Ok(started)
    }

    /// Drive [`tick`](Self::tick) until `shutdown`, waking on run
    /// notifications, on the next due time, or at the poll interval.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut wake = self
            .notifier
            .subscribe(&[channels::RUN_CREATED, channels::RUN_UPDATED]);
        match self.recover() {
            Ok(0) => {}
            Ok(n) => info!(runs = n, "Recovered interrupted runs"),
            Err(e) => error!(error = %e, "Failed to recover interrupted runs"),
        }
        info!(workers = self.settings.workers, "Scheduler started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = self.tick() {
                error!(error = %e, "Scheduler tick failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => continue,
                }
            }

            let idle = self.idle_for();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wake.wait(idle) => {}
            }
        }

        self.drain(self.settings.poll_interval * 6).await;
        info!("Scheduler stopped");
    }

    /// Wait for in-flight runs to finish, up to `grace`.
    pub async fn drain(&self, grace: Duration) {
        let workers = self.settings.workers.max(1) as u32;
        match tokio::time::timeout(grace, self.permits.acquire_many(workers)).await {
            Ok(Ok(_all)) => {}
            _ => warn!(in_flight = self.in_flight(), "Runs still executing at shutdown"),
        }
    }

    fn idle_for(&self) -> Duration {
        let poll = self.settings.poll_interval;
        if self.permits.available_permits() == 0 {
            return poll;
        }
        match self.store.next_due_time() {
            Ok(Some(due)) => (due - now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .clamp(MIN_IDLE, poll),
            Ok(None) => poll,
            Err(e) => {
                warn!(error = %e, "Failed to read next due time");
                poll
            }
        }
    }

    fn spawn(self: &Arc<Self>, run: Run, permit: OwnedSemaphorePermit) {
        let run_id = run.id;
        let token = CancellationToken::new();
        self.claimed.lock().insert(run_id);
        self.tokens.lock().insert(run_id, token.clone());
        debug!(run_id = %run_id, "Claimed run");

        let this = self.clone();
        tokio::spawn(async move {
            let runner = this.runner.clone();
            let task = tokio::spawn(async move { runner.execute(run, &token).await });

            match task.await {
                Ok(Ok(outcome)) => debug!(run_id = %run_id, ?outcome, "Run released"),
                Ok(Err(e)) => {
                    error!(run_id = %run_id, error = %e, "Run execution failed");
                    if let Err(e) = this.runner.fail_run(run_id, &e.to_string()) {
                        error!(run_id = %run_id, error = %e, "Failed to mark run failed");
                    }
                }
                Err(e) if e.is_panic() => {
                    error!(run_id = %run_id, error = %e, "Run task panicked");
                    if let Err(e) = this.runner.fail_run(run_id, "internal") {
                        error!(run_id = %run_id, error = %e, "Failed to mark run failed");
                    }
                }
                Err(e) => warn!(run_id = %run_id, error = %e, "Run task aborted"),
            }

            this.claimed.lock().remove(&run_id);
            this.tokens.lock().remove(&run_id);
            drop(permit);
            // A worker is free again.
            this.notifier.publish(channels::RUN_UPDATED);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactStore;
    use crate::cel::CelEngine;
    use remedy_config::RemedyConfig;
    use remedy_types::{ExecAction, Playbook, PlaybookAction, PlaybookSpec};

    fn scheduler(store: Arc<Store>, workers: usize) -> (Arc<Scheduler>, Notifier, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let notifier = Notifier::new();
        let runner = Arc::new(Runner::new(
            store.clone(),
            notifier.clone(),
            Arc::new(CelEngine::new()),
            Arc::new(RemedyConfig::default()),
            Some(ArtifactStore::at(dir.path())),
        ));
        let scheduler = Arc::new(Scheduler::new(
            store,
            runner,
            notifier.clone(),
            SchedulerSettings {
                workers,
                poll_interval: Duration::from_millis(200),
            },
        ));
        (scheduler, notifier, dir)
    }

    fn scheduled(store: &Store, script: &str) -> Run {
        let pb = store
            .upsert_playbook(&Playbook::new(
                format!("p-{}", Uuid::new_v4()),
                PlaybookSpec {
                    actions: vec![PlaybookAction {
                        name: "only".into(),
                        exec: Some(ExecAction {
                            script: script.into(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            ))
            .unwrap();
        let run = Run::new(pb.id);
        store.insert_run(&run).unwrap();
        run
    }

    async fn wait_for(store: &Store, id: Uuid, status: RunStatus) {
        for _ in 0..100 {
            if store.require_run(id).unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("run {id} never reached {status}");
    }

    #[tokio::test]
    async fn test_tick_respects_pool_size() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (scheduler, _, _dir) = scheduler(store.clone(), 1);
        let a = scheduled(&store, "sleep 0.3");
        let b = scheduled(&store, "true");

        assert_eq!(scheduler.tick().unwrap(), 1);
        assert_eq!(scheduler.tick().unwrap(), 0);
        assert_eq!(scheduler.in_flight(), 1);

        wait_for(&store, a.id, RunStatus::Completed).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(scheduler.tick().unwrap(), 1);
        wait_for(&store, b.id, RunStatus::Completed).await;
    }

    #[tokio::test]
    async fn test_cancel_signals_executing_run() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (scheduler, _, _dir) = scheduler(store.clone(), 2);
        let run = scheduled(&store, "sleep 5");
        assert_eq!(scheduler.tick().unwrap(), 1);

        store.cancel_run(run.id).unwrap();
        assert!(scheduler.cancel(run.id));
        for _ in 0..100 {
            if scheduler.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(scheduler.in_flight(), 0);
        let done = store.require_run(run.id).unwrap();
        assert_eq!(done.status, RunStatus::Cancelled);
        let action = store.get_action_by_name(run.id, "only").unwrap().unwrap();
        assert_eq!(action.error.as_deref(), Some("cancelled"));
        assert!(!scheduler.cancel(run.id));
    }

    #[tokio::test]
    async fn test_run_loop_picks_up_new_runs() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (scheduler, notifier, _dir) = scheduler(store.clone(), 2);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(scheduler.clone().run(shutdown.clone()));

        let run = scheduled(&store, "echo hi");
        notifier.publish(channels::RUN_CREATED);
        wait_for(&store, run.id, RunStatus::Completed).await;

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_recover_fails_orphaned_runs() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (scheduler, _, _dir) = scheduler(store.clone(), 1);
        let run = scheduled(&store, "true");
        assert!(store.claim_run(run.id).unwrap());

        assert_eq!(scheduler.recover().unwrap(), 1);
        let failed = store.require_run(run.id).unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("interrupted"));
    }
}
