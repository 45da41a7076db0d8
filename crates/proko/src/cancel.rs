//! Cancellation coordinator.
//!
//! A request flips the record to `cancelled` right away so pollers see it on
//! their next read. The runner notices on its next conditional write, which
//! happens before every phase, and then removes what the invocation wrote.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::error::StoreError;
use crate::job::{JobKey, JobStatus, JobUpdate};
use crate::runner::JobRunner;

/// Result of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The record is now `cancelled`; cleanup may still be running.
    Requested { job_id: String },
    /// Nothing was processing. The record was not touched.
    NotRunning { status: JobStatus },
}

impl CancelOutcome {
    pub fn was_requested(&self) -> bool {
        matches!(self, CancelOutcome::Requested { .. })
    }
}

pub struct CancellationCoordinator {
    runner: Arc<JobRunner>,
}

impl CancellationCoordinator {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self { runner }
    }

    /// Marks a processing job as cancelled without waiting for the runner.
    ///
    /// Idle and terminal records report [`CancelOutcome::NotRunning`]; that
    /// is a normal answer, not an error.
    pub fn request_cancel(&self, key: &JobKey) -> Result<CancelOutcome, StoreError> {
        let store = self.runner.store();
        match store.update_if(key, None, JobUpdate::cancelled(Utc::now()))? {
            Some(record) => {
                let job_id = record.job_id.unwrap_or_default();
                log::info!("Cancellation requested for {} (job {})", key, job_id);
                Ok(CancelOutcome::Requested { job_id })
            }
            None => {
                let status = store.get(key).status;
                log::debug!("Cancel for {} ignored, job is {}", key, status);
                Ok(CancelOutcome::NotRunning { status })
            }
        }
    }

    /// Requests cancellation and resolves once the runner has settled and
    /// the invocation's partial results are gone.
    pub async fn cancel_and_wait(&self, key: &JobKey) -> Result<CancelOutcome, StoreError> {
        let outcome = self.request_cancel(key)?;
        if outcome.was_requested() {
            self.runner.wait(key).await;
        }
        Ok(outcome)
    }
}
