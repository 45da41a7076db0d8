//! Periodic in-process staleness sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::stale::StaleJobRecovery;

/// Background task that sweeps for stale records on a fixed interval.
/// Stops when dropped.
pub struct Watchdog {
    handle: JoinHandle<()>,
}

impl Watchdog {
    /// Starts sweeping every `interval` with `threshold`. The first sweep
    /// runs one interval after the call.
    pub fn spawn(recovery: Arc<StaleJobRecovery>, interval: Duration, threshold: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let report = recovery.sweep(threshold);
                if !report.is_empty() {
                    log::warn!(
                        "Watchdog: {} timed out, {} restarted, {} failed",
                        report.timed_out.len(),
                        report.restarted.len(),
                        report.failed.len()
                    );
                }
            }
        });

        log::info!(
            "Watchdog started (interval {}s, threshold {}s)",
            interval.as_secs(),
            threshold.as_secs()
        );
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactStore;
    use crate::config::RecoveryConfig;
    use crate::job::{JobKey, JobStatus, JobType, PhaseRegistry};
    use crate::runner::JobRunner;
    use crate::store::JobRecordStore;

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fails_orphans_after_interval() {
        let store = Arc::new(JobRecordStore::default());
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&store),
            Arc::new(MemoryArtifactStore::new()),
            1,
        ));
        let recovery = Arc::new(StaleJobRecovery::new(
            runner,
            Arc::new(PhaseRegistry::new()),
            RecoveryConfig::default(),
        ));
        let key = JobKey::new("doc-1", JobType::DocumentProcessing);
        store.begin(&key, "job-old", 2).unwrap();

        let watchdog = Watchdog::spawn(recovery, Duration::from_secs(60), Duration::ZERO);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(store.get(&key).is_processing());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.get(&key).status, JobStatus::Failed);
        assert!(watchdog.is_running());
        watchdog.stop();
    }
}
