//! Reconciles records left `processing` with no runner able to finish them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RecoveryConfig;
use crate::db::format_timestamp;
use crate::job::{JobErrorInfo, JobKey, JobRecord, JobStatus, JobUpdate, PhaseRegistry};
use crate::runner::JobRunner;

pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";
pub const TIMED_OUT_MESSAGE: &str = "timed out";

/// What to do with an abandoned invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Mark it failed and keep its partial results for inspection.
    #[default]
    Fail,
    /// Discard its partial results and run the job again from the start.
    Restart,
}

/// Keys touched by one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub restarted: Vec<JobKey>,
    pub failed: Vec<JobKey>,
    /// Live invocations stopped by the watchdog.
    pub timed_out: Vec<JobKey>,
    /// Processing records younger than the threshold or still queued for a
    /// worker slot.
    pub skipped: usize,
}

impl RecoveryReport {
    /// True when nothing was changed.
    pub fn is_empty(&self) -> bool {
        self.restarted.is_empty() && self.failed.is_empty() && self.timed_out.is_empty()
    }
}

pub struct StaleJobRecovery {
    runner: Arc<JobRunner>,
    registry: Arc<PhaseRegistry>,
    config: RecoveryConfig,
}

impl StaleJobRecovery {
    pub fn new(runner: Arc<JobRunner>, registry: Arc<PhaseRegistry>, config: RecoveryConfig) -> Self {
        Self {
            runner,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Startup pass. Run it before status is served so no client ever sees
    /// a record that can no longer make progress.
    pub fn run_startup(&self) -> RecoveryReport {
        let report = self.sweep(self.config.startup_threshold());
        log::info!(
            "Startup recovery: {} restarted, {} failed, {} skipped",
            report.restarted.len(),
            report.failed.len(),
            report.skipped
        );
        report
    }

    /// Resolves every `processing` record whose `last_updated` is at least
    /// `threshold` old. Records owned by a live runner are timed out; orphans
    /// are handled according to their job type's policy.
    pub fn sweep(&self, threshold: Duration) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        for record in self.runner.store().list_by_status(JobStatus::Processing) {
            let age = (now - record.last_updated).to_std().unwrap_or(Duration::ZERO);
            if age < threshold {
                report.skipped += 1;
                continue;
            }

            let key = record.key();
            match self.runner.running_job_id(&key) {
                Some(live) if record.job_id.as_deref() == Some(live.as_str()) => {
                    if self.runner.is_queued(&key) {
                        // No phase has run yet; its clock starts with the worker slot.
                        report.skipped += 1;
                    } else if self.time_out(&record, &live, threshold) {
                        report.timed_out.push(key);
                    }
                }
                Some(live) => {
                    log::warn!(
                        "Record {} is owned by {:?} but runner {} is live, leaving it",
                        key,
                        record.job_id,
                        live
                    );
                }
                None => match self.config.policy_for(key.job_type) {
                    RecoveryPolicy::Fail => {
                        if self.fail_orphan(&record, now) {
                            report.failed.push(key);
                        }
                    }
                    RecoveryPolicy::Restart => {
                        if self.restart_orphan(&record, now) {
                            report.restarted.push(key);
                        } else if self.runner.store().get(&key).status == JobStatus::Failed {
                            report.failed.push(key);
                        }
                    }
                },
            }
        }

        report
    }

    fn time_out(&self, record: &JobRecord, job_id: &str, threshold: Duration) -> bool {
        let key = record.key();
        let error = JobErrorInfo::new(TIMED_OUT_MESSAGE, record.current_phase.clone()).with_details(
            serde_json::json!({
                "lastUpdated": format_timestamp(record.last_updated),
                "thresholdSecs": threshold.as_secs(),
            }),
        );

        match self
            .runner
            .store()
            .update_if(&key, Some(job_id), JobUpdate::failed(error, Utc::now()))
        {
            Ok(Some(_)) => {
                log::warn!(
                    "Job {} for {} made no progress for {}s, timing it out",
                    job_id,
                    key,
                    threshold.as_secs()
                );
                self.runner.abort(&key, job_id);
                true
            }
            // Finished between the scan and the write.
            Ok(None) => false,
            Err(e) => {
                log::error!("Failed to time out job {} for {}: {}", job_id, key, e);
                false
            }
        }
    }

    fn fail_orphan(&self, record: &JobRecord, now: DateTime<Utc>) -> bool {
        let key = record.key();
        let error = JobErrorInfo::new(INTERRUPTED_MESSAGE, record.current_phase.clone()).with_details(
            serde_json::json!({
                "jobId": record.job_id,
                "lastUpdated": format_timestamp(record.last_updated),
            }),
        );

        match self
            .runner
            .store()
            .update_if(&key, record.job_id.as_deref(), JobUpdate::failed(error, now))
        {
            Ok(Some(_)) => {
                log::warn!(
                    "Marked abandoned job {:?} for {} as failed",
                    record.job_id,
                    key
                );
                true
            }
            Ok(None) => false,
            Err(e) => {
                log::error!("Failed to mark abandoned job for {} as failed: {}", key, e);
                false
            }
        }
    }

    fn restart_orphan(&self, record: &JobRecord, now: DateTime<Utc>) -> bool {
        let key = record.key();
        let Some(phases) = self.registry.phases_for(&key) else {
            log::warn!(
                "No phase plan for {}, failing abandoned job instead of restarting",
                key.job_type
            );
            self.fail_orphan(record, now);
            return false;
        };

        if let Some(ref job_id) = record.job_id {
            match self.runner.artifacts().delete_for_job(job_id) {
                Ok(removed) => {
                    log::debug!("Removed {} partial results of abandoned job {}", removed, job_id)
                }
                Err(e) => log::error!("Failed to remove partial results of {}: {}", job_id, e),
            }
        }

        if !self.fail_orphan(record, now) {
            return false;
        }

        match self.runner.start(&key, phases) {
            Ok(started) => {
                log::info!(
                    "Restarted abandoned job for {} as {:?}",
                    key,
                    started.job_id
                );
                true
            }
            Err(e) => {
                log::error!("Failed to restart abandoned job for {}: {}", key, e);
                false
            }
        }
    }
}
