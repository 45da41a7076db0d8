use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::artifact::{ArtifactSink, ArtifactStore};
use crate::broadcast::JobEventKind;
use crate::db::history_repo::{self, RunRow};
use crate::db::{format_timestamp, Database};
use crate::error::{StartError, StoreError};
use crate::job::{
    FailureCleanup, JobErrorInfo, JobKey, JobRecord, JobStatus, JobUpdate, Phase, PhaseContext,
    PhaseError,
};
use crate::store::JobRecordStore;

use super::active::{ActiveJob, ActiveJobs};

/// How an invocation's runner task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed { phase: Option<String> },
    /// Cancellation observed; this invocation's artifacts were removed.
    Cancelled { artifacts_removed: usize },
    /// The record was failed from outside, by the watchdog.
    TimedOut,
    /// The record now belongs to a different invocation.
    Superseded,
    /// The runner shut down before the invocation got a worker slot.
    Interrupted,
}

/// Executes job phase lists as background tokio tasks.
///
/// `start` returns as soon as the record is `processing`; all outcomes are
/// observed through the record store.
pub struct JobRunner {
    store: Arc<JobRecordStore>,
    artifacts: Arc<dyn ArtifactStore>,
    history: Option<Database>,
    active: Arc<ActiveJobs>,
    permits: Arc<Semaphore>,
}

impl JobRunner {
    pub fn new(
        store: Arc<JobRecordStore>,
        artifacts: Arc<dyn ArtifactStore>,
        max_concurrent_jobs: usize,
    ) -> Self {
        Self {
            store,
            artifacts,
            history: None,
            active: Arc::new(ActiveJobs::default()),
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
        }
    }

    /// Records one history row per settled invocation in `db`.
    pub fn with_history(mut self, db: Database) -> Self {
        self.history = Some(db);
        self
    }

    pub fn store(&self) -> &Arc<JobRecordStore> {
        &self.store
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Starts a new invocation of `phases` for `key` and returns the fresh
    /// `processing` record. Must be called from within a Tokio runtime.
    pub fn start(&self, key: &JobKey, phases: Vec<Phase>) -> Result<JobRecord, StartError> {
        if self.permits.is_closed() {
            return Err(StartError::ShuttingDown);
        }

        // Held across begin + spawn + insert so a settling runner and a new
        // start for the same key cannot interleave.
        let mut active = self.active.lock();
        if let Some(existing) = active.get(key) {
            let record = self.store.get(key);
            if record.is_processing() {
                return Err(StartError::AlreadyProcessing {
                    key: key.clone(),
                    job_id: record.job_id.unwrap_or_else(|| existing.job_id.clone()),
                });
            }
            return Err(StartError::StillSettling {
                key: key.clone(),
                job_id: existing.job_id.clone(),
            });
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let total = phases.len() as u32;
        let record = self.store.begin(key, &job_id, total)?;

        let (done_tx, done_rx) = watch::channel(false);
        let admitted = Arc::new(AtomicBool::new(false));
        let settlement = Settlement {
            store: Arc::clone(&self.store),
            history: self.history.clone(),
            active: Arc::clone(&self.active),
            key: key.clone(),
            job_id: job_id.clone(),
            done: done_tx,
        };
        let invocation = Invocation {
            store: Arc::clone(&self.store),
            artifacts: Arc::clone(&self.artifacts),
            permits: Arc::clone(&self.permits),
            key: key.clone(),
            job_id: job_id.clone(),
            phases,
            admitted: Arc::clone(&admitted),
        };

        let span = info_span!("job", key = %key, job_id = %job_id, total_phases = total);
        let handle = tokio::spawn(invocation.run(settlement).instrument(span));

        active.insert(
            key.clone(),
            ActiveJob {
                job_id: job_id.clone(),
                abort: handle.abort_handle(),
                done: done_rx,
                admitted,
            },
        );

        info!(key = %key, job_id = %job_id, "Job started with {} phases", total);
        Ok(record)
    }

    /// Whether a runner task for `key` has not settled yet.
    pub fn is_running(&self, key: &JobKey) -> bool {
        self.active.job_id(key).is_some()
    }

    /// Whether the invocation for `key` is still waiting for a worker slot.
    pub fn is_queued(&self, key: &JobKey) -> bool {
        self.active.is_queued(key)
    }

    pub fn running_job_id(&self, key: &JobKey) -> Option<String> {
        self.active.job_id(key)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Resolves once the current invocation for `key` has settled, including
    /// artifact cleanup after cancellation. Returns immediately if none runs.
    pub async fn wait(&self, key: &JobKey) {
        let Some(mut done) = self.active.done_receiver(key) else {
            return;
        };
        // A dropped sender also means the task is gone.
        let _ = done.wait_for(|settled| *settled).await;
    }

    /// Aborts the runner task of `job_id`. The record is left as it is; the
    /// caller decides its terminal state.
    pub fn abort(&self, key: &JobKey, job_id: &str) -> bool {
        let active = self.active.lock();
        match active.get(key) {
            Some(entry) if entry.job_id == job_id => {
                entry.abort.abort();
                true
            }
            _ => false,
        }
    }

    /// Stops accepting starts and waits up to `grace` for active invocations.
    ///
    /// Invocations still running after that are aborted and stay
    /// `processing`; startup recovery resolves them on the next launch.
    pub async fn shutdown(&self, grace: Duration) {
        self.permits.close();
        let keys = self.active.keys();
        info!("Shutting down job runner, {} invocations active", keys.len());

        let all_settled = async {
            for key in &keys {
                self.wait(key).await;
            }
        };
        if tokio::time::timeout(grace, all_settled).await.is_err() {
            for key in &keys {
                if let Some(job_id) = self.active.job_id(key) {
                    warn!(key = %key, job_id = %job_id, "Aborting job at shutdown");
                    self.abort(key, &job_id);
                }
            }
            for key in &keys {
                self.wait(key).await;
            }
        }
        info!("Job runner stopped");
    }
}

/// The state one spawned runner task owns.
struct Invocation {
    store: Arc<JobRecordStore>,
    artifacts: Arc<dyn ArtifactStore>,
    permits: Arc<Semaphore>,
    key: JobKey,
    job_id: String,
    phases: Vec<Phase>,
    admitted: Arc<AtomicBool>,
}

impl Invocation {
    async fn run(self, settlement: Settlement) -> RunOutcome {
        let _settlement = settlement;
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Runner shut down before the job got a worker slot");
                return RunOutcome::Interrupted;
            }
        };

        // Time spent queued does not count towards staleness.
        let outcome = match self.write(JobUpdate::new()) {
            Ok(true) => {
                self.admitted.store(true, Ordering::Release);
                self.run_phases().await
            }
            Ok(false) => self.abandon(),
            Err(e) => self.store_failure(e, None),
        };
        info!(outcome = ?outcome, "Job runner finished");
        outcome
    }

    async fn run_phases(&self) -> RunOutcome {
        let total = self.phases.len() as u32;
        if total == 0 {
            return match self.write(JobUpdate::completed(Utc::now())) {
                Ok(true) => RunOutcome::Completed,
                Ok(false) => self.abandon(),
                Err(e) => self.store_failure(e, None),
            };
        }

        for (i, phase) in self.phases.iter().enumerate() {
            let index = i as u32;

            // Doubles as the cancellation check: it only lands while the
            // record is still processing under this job id.
            match self.write(JobUpdate::new().current_phase(&phase.name)) {
                Ok(true) => {}
                Ok(false) => return self.abandon(),
                Err(e) => return self.store_failure(e, Some(&phase.name)),
            }

            let ctx = PhaseContext {
                key: self.key.clone(),
                job_id: self.job_id.clone(),
                phase: phase.name.clone(),
                phase_index: index,
                total_phases: total,
                artifacts: ArtifactSink::new(
                    Arc::clone(&self.artifacts),
                    self.key.clone(),
                    &self.job_id,
                    &phase.name,
                ),
            };

            debug!(phase = %phase.name, "Running phase {} of {}", index + 1, total);
            let result = AssertUnwindSafe(phase.executor.execute(&ctx))
                .catch_unwind()
                .instrument(info_span!("phase", name = %phase.name, index))
                .await
                .unwrap_or_else(|payload| Err(PhaseError::from_panic(payload)));

            if let Err(err) = result {
                return self.fail_phase(phase, err);
            }

            let update = if index + 1 == total {
                JobUpdate::completed(Utc::now()).phase_index(total)
            } else {
                JobUpdate::new().phase_index(index + 1)
            };
            match self.write(update) {
                Ok(true) => {}
                Ok(false) => return self.abandon(),
                Err(e) => return self.store_failure(e, Some(&phase.name)),
            }
        }

        RunOutcome::Completed
    }

    /// Conditional write: `false` means the record is no longer ours to change.
    fn write(&self, update: JobUpdate) -> Result<bool, StoreError> {
        self.store
            .update_if(&self.key, Some(&self.job_id), update)
            .map(|written| written.is_some())
    }

    fn fail_phase(&self, phase: &Phase, err: PhaseError) -> RunOutcome {
        warn!(phase = %phase.name, error = %err, "Phase failed");

        if phase.executor.failure_cleanup() == FailureCleanup::DiscardPhase {
            match self.artifacts.delete_for_phase(&self.job_id, &phase.name) {
                Ok(removed) => debug!(phase = %phase.name, removed, "Discarded failed phase output"),
                Err(e) => error!(phase = %phase.name, error = %e, "Failed to discard phase output"),
            }
        }

        let mut info = JobErrorInfo::new(err.message, Some(phase.name.clone()));
        if let Some(details) = err.details {
            info = info.with_details(details);
        }

        match self.write(JobUpdate::failed(info, Utc::now())) {
            Ok(true) => RunOutcome::Failed {
                phase: Some(phase.name.clone()),
            },
            // A cancellation that landed during the phase wins.
            Ok(false) => self.abandon(),
            Err(e) => self.store_failure(e, Some(&phase.name)),
        }
    }

    /// Handles a rejected conditional write.
    fn abandon(&self) -> RunOutcome {
        let record = self.store.get(&self.key);
        let owned = record.job_id.as_deref() == Some(self.job_id.as_str());

        match record.status {
            JobStatus::Cancelled if owned => {
                let removed = match self.artifacts.delete_for_job(&self.job_id) {
                    Ok(n) => n,
                    Err(e) => {
                        error!(error = %e, "Failed to remove partial results after cancellation");
                        0
                    }
                };
                info!(removed, "Cancellation observed, partial results removed");
                RunOutcome::Cancelled {
                    artifacts_removed: removed,
                }
            }
            JobStatus::Failed if owned => {
                warn!("Job was failed by the watchdog, stopping");
                RunOutcome::TimedOut
            }
            _ => {
                warn!(current = ?record.job_id, "Job record was superseded, stopping");
                RunOutcome::Superseded
            }
        }
    }

    /// Best-effort failure write after the store itself errored.
    fn store_failure(&self, err: StoreError, phase: Option<&str>) -> RunOutcome {
        error!(error = %err, "Failed to persist job progress");
        let info = JobErrorInfo::new(
            format!("failed to persist progress: {}", err),
            phase.map(str::to_string),
        );
        if let Err(e) = self
            .store
            .update_if(&self.key, Some(&self.job_id), JobUpdate::failed(info, Utc::now()))
        {
            error!(error = %e, "Failed to record job failure");
        }
        RunOutcome::Failed {
            phase: phase.map(str::to_string),
        }
    }
}

/// Runs when a runner task ends for any reason, including abort.
///
/// Records history and publishes `Settled` before releasing the key, then
/// wakes waiters.
struct Settlement {
    store: Arc<JobRecordStore>,
    history: Option<Database>,
    active: Arc<ActiveJobs>,
    key: JobKey,
    job_id: String,
    done: watch::Sender<bool>,
}

impl Drop for Settlement {
    fn drop(&mut self) {
        let record = self.store.get(&self.key);
        if record.job_id.as_deref() == Some(self.job_id.as_str()) {
            if record.status.is_terminal() {
                if let Some(ref db) = self.history {
                    if let Err(e) = history_repo::record_run(db, &run_row(&record, &self.job_id)) {
                        log::warn!("Failed to record run history for {}: {}", self.key, e);
                    }
                }
                self.store.publish(&self.key, JobEventKind::Settled);
            } else {
                log::warn!(
                    "Runner for {} ({}) stopped while the record is still {}",
                    self.key,
                    self.job_id,
                    record.status
                );
            }
        }

        self.active.remove_if(&self.key, &self.job_id);
        self.done.send_replace(true);
    }
}

fn run_row(record: &JobRecord, job_id: &str) -> RunRow {
    let finished_at = record.completed_at.unwrap_or(record.last_updated);
    let started_at = record.started_at.unwrap_or(finished_at);
    RunRow {
        job_id: job_id.to_string(),
        resource_id: record.resource_id.clone(),
        job_type: record.job_type.to_string(),
        outcome: record.status.to_string(),
        phases_completed: record.progress.phase_index,
        total_phases: record.progress.total_phases,
        error: record.error.as_ref().map(|e| e.message.clone()),
        started_at: format_timestamp(started_at),
        finished_at: format_timestamp(finished_at),
        duration_ms: (finished_at - started_at).num_milliseconds().max(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactStore;
    use crate::job::{JobType, PhaseExecutor};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    struct Succeed;

    #[async_trait]
    impl PhaseExecutor for Succeed {
        async fn execute(&self, ctx: &PhaseContext) -> Result<(), PhaseError> {
            ctx.artifacts
                .write("row", serde_json::json!({"phase": ctx.phase}))?;
            Ok(())
        }
    }

    struct Fail {
        cleanup: FailureCleanup,
    }

    #[async_trait]
    impl PhaseExecutor for Fail {
        async fn execute(&self, ctx: &PhaseContext) -> Result<(), PhaseError> {
            ctx.artifacts.write("row", serde_json::json!({}))?;
            Err(PhaseError::new("extraction service returned 502")
                .with_details(serde_json::json!({"status": 502})))
        }

        fn failure_cleanup(&self) -> FailureCleanup {
            self.cleanup
        }
    }

    struct Panics;

    #[async_trait]
    impl PhaseExecutor for Panics {
        async fn execute(&self, _ctx: &PhaseContext) -> Result<(), PhaseError> {
            panic!("malformed sheet");
        }
    }

    /// Signals `entered` and then blocks until `release` is notified.
    struct Gate {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl PhaseExecutor for Gate {
        async fn execute(&self, ctx: &PhaseContext) -> Result<(), PhaseError> {
            ctx.artifacts.write("row", serde_json::json!({}))?;
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    fn gate() -> (Gate, Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        (
            Gate {
                entered: Arc::clone(&entered),
                release: Arc::clone(&release),
            },
            entered,
            release,
        )
    }

    fn runner() -> JobRunner {
        let store = Arc::new(JobRecordStore::default());
        JobRunner::new(store, Arc::new(MemoryArtifactStore::new()), 4)
    }

    fn key() -> JobKey {
        JobKey::new("doc-1", JobType::DocumentProcessing)
    }

    #[tokio::test]
    async fn test_runs_all_phases_to_completion() {
        let runner = runner();
        let record = runner
            .start(
                &key(),
                vec![
                    Phase::new("parse", Succeed),
                    Phase::new("extract", Succeed),
                    Phase::new("store", Succeed),
                ],
            )
            .unwrap();
        assert_eq!(record.status, JobStatus::Processing);

        runner.wait(&key()).await;

        let done = runner.store().get(&key());
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress.phase_index, 3);
        assert_eq!(done.progress.percentage, 100);
        assert!(done.completed_at.is_some());
        assert_eq!(done.current_phase.as_deref(), Some("store"));
        assert!(!runner.is_running(&key()));

        let artifacts = runner
            .artifacts()
            .list_for_job(done.job_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(artifacts.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_phase_list_completes() {
        let runner = runner();
        runner.start(&key(), Vec::new()).unwrap();
        runner.wait(&key()).await;

        let done = runner.store().get(&key());
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress.percentage, 100);
    }

    #[tokio::test]
    async fn test_failing_phase_is_terminal() {
        let runner = runner();
        runner
            .start(
                &key(),
                vec![
                    Phase::new("parse", Succeed),
                    Phase::new("extract", Fail { cleanup: FailureCleanup::Keep }),
                    Phase::new("store", Succeed),
                ],
            )
            .unwrap();
        runner.wait(&key()).await;

        let done = runner.store().get(&key());
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.progress.phase_index, 1);
        let error = done.error.unwrap();
        assert_eq!(error.phase.as_deref(), Some("extract"));
        assert_eq!(error.message, "extraction service returned 502");
        assert_eq!(error.details, Some(serde_json::json!({"status": 502})));

        // Kept for reuse by a retry.
        let job_id = done.job_id.unwrap();
        assert_eq!(runner.artifacts().list_for_job(&job_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_discard_phase_cleanup_removes_only_failed_phase_output() {
        let runner = runner();
        runner
            .start(
                &key(),
                vec![
                    Phase::new("parse", Succeed),
                    Phase::new("extract", Fail { cleanup: FailureCleanup::DiscardPhase }),
                ],
            )
            .unwrap();
        runner.wait(&key()).await;

        let job_id = runner.store().get(&key()).job_id.unwrap();
        let left = runner.artifacts().list_for_job(&job_id).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].phase, "parse");
    }

    #[tokio::test]
    async fn test_panicking_phase_fails_the_job() {
        let runner = runner();
        runner
            .start(&key(), vec![Phase::new("parse", Panics)])
            .unwrap();
        runner.wait(&key()).await;

        let done = runner.store().get(&key());
        assert_eq!(done.status, JobStatus::Failed);
        let error = done.error.unwrap();
        assert_eq!(error.message, "phase panicked: malformed sheet");
        assert_eq!(error.phase.as_deref(), Some("parse"));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_processing() {
        let runner = runner();
        let (gate, entered, release) = gate();
        let first = runner
            .start(&key(), vec![Phase::new("parse", gate)])
            .unwrap();
        entered.notified().await;

        let err = runner
            .start(&key(), vec![Phase::new("parse", Succeed)])
            .unwrap_err();
        match err {
            StartError::AlreadyProcessing { job_id, .. } => {
                assert_eq!(Some(job_id), first.job_id)
            }
            other => panic!("unexpected error: {other}"),
        }

        release.notify_one();
        runner.wait(&key()).await;
        assert_eq!(runner.store().get(&key()).job_id, first.job_id);
    }

    #[tokio::test]
    async fn test_cancel_between_phases_stops_and_cleans_up() {
        let runner = runner();
        let (gate, entered, release) = gate();
        runner
            .start(
                &key(),
                vec![
                    Phase::new("parse", Succeed),
                    Phase::new("extract", gate),
                    Phase::new("store", Succeed),
                ],
            )
            .unwrap();
        entered.notified().await;

        runner
            .store()
            .update_if(&key(), None, JobUpdate::cancelled(Utc::now()))
            .unwrap();

        // Cancelled but not yet settled: a new start must wait.
        let err = runner
            .start(&key(), vec![Phase::new("parse", Succeed)])
            .unwrap_err();
        assert!(matches!(err, StartError::StillSettling { .. }));

        release.notify_one();
        runner.wait(&key()).await;

        let done = runner.store().get(&key());
        assert_eq!(done.status, JobStatus::Cancelled);
        assert_eq!(done.progress.phase_index, 1);
        let job_id = done.job_id.unwrap();
        assert!(runner.artifacts().list_for_job(&job_id).unwrap().is_empty());

        // Settled now, so a restart goes through.
        let restarted = runner.start(&key(), Vec::new()).unwrap();
        assert_ne!(restarted.job_id.as_deref(), Some(job_id.as_str()));
    }

    #[tokio::test]
    async fn test_queued_job_waits_for_a_worker_slot() {
        let runner = JobRunner::new(
            Arc::new(JobRecordStore::default()),
            Arc::new(MemoryArtifactStore::new()),
            1,
        );
        let busy = key();
        let queued = JobKey::new("doc-2", JobType::DocumentProcessing);
        let (gate, entered, release) = gate();

        runner.start(&busy, vec![Phase::new("parse", gate)]).unwrap();
        entered.notified().await;
        runner
            .start(&queued, vec![Phase::new("parse", Succeed)])
            .unwrap();
        tokio::task::yield_now().await;

        assert!(!runner.is_queued(&busy));
        assert!(runner.is_queued(&queued));
        let waiting = runner.store().get(&queued);
        assert_eq!(waiting.status, JobStatus::Processing);
        assert!(waiting.current_phase.is_none());

        release.notify_one();
        runner.wait(&busy).await;
        runner.wait(&queued).await;

        let done = runner.store().get(&queued);
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.last_updated >= waiting.last_updated);
        assert!(!runner.is_queued(&queued));
    }

    #[tokio::test]
    async fn test_abort_settles_the_key() {
        let runner = runner();
        let (gate, entered, _release) = gate();
        let record = runner
            .start(&key(), vec![Phase::new("parse", gate)])
            .unwrap();
        entered.notified().await;

        let job_id = record.job_id.unwrap();
        runner
            .store()
            .update_if(
                &key(),
                Some(&job_id),
                JobUpdate::failed(JobErrorInfo::new("timed out", None), Utc::now()),
            )
            .unwrap();
        assert!(runner.abort(&key(), &job_id));
        runner.wait(&key()).await;

        assert!(!runner.is_running(&key()));
        assert_eq!(runner.store().get(&key()).status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_settled_runs_are_recorded_in_history() {
        let db = Database::open_in_memory().unwrap();
        let store = Arc::new(JobRecordStore::default());
        store.set_database(db.clone());
        let runner = JobRunner::new(store, Arc::new(MemoryArtifactStore::new()), 2)
            .with_history(db.clone());

        let mut events = runner.store().broadcaster().subscribe();
        runner
            .start(&key(), vec![Phase::new("parse", Fail { cleanup: FailureCleanup::Keep })])
            .unwrap();
        runner.wait(&key()).await;

        let runs = history_repo::query_runs(&db, "doc-1", "document_processing", 10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, "failed");
        assert_eq!(runs[0].phases_completed, 0);
        assert_eq!(
            runs[0].error.as_deref(),
            Some("extraction service returned 502")
        );

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert_eq!(kinds.last(), Some(&JobEventKind::Settled));
    }

    #[tokio::test]
    async fn test_start_after_shutdown_is_rejected() {
        let runner = runner();
        runner.shutdown(Duration::from_millis(10)).await;
        let err = runner.start(&key(), Vec::new()).unwrap_err();
        assert!(matches!(err, StartError::ShuttingDown));
    }
}
