//! Read side of the protocol: what clients poll.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::broadcast::JobProgressEvent;
use crate::db::history_repo::{self, DailyStatRow, RunRow};
use crate::db::{Database, DatabaseError};
use crate::job::{JobKey, JobRecord, JobStatus, JobType};
use crate::store::JobRecordStore;

/// Every tracked job of one parent resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub resource_id: String,
    pub jobs: BTreeMap<JobType, JobRecord>,
}

impl ResourceStatus {
    pub fn job(&self, job_type: JobType) -> Option<&JobRecord> {
        self.jobs.get(&job_type)
    }

    pub fn any_processing(&self) -> bool {
        self.jobs.values().any(JobRecord::is_processing)
    }

    /// Nothing left to wait for: every job is idle or terminal.
    pub fn all_settled(&self) -> bool {
        !self.any_processing()
    }

    /// Whether the step gated on `job_type` may be offered to the user.
    pub fn is_unlocked(&self, job_type: JobType) -> bool {
        self.job(job_type)
            .is_some_and(|r| r.status == JobStatus::Completed)
    }
}

/// Non-blocking status reads, served from the record store's cache.
#[derive(Clone)]
pub struct StatusService {
    store: Arc<JobRecordStore>,
    history: Option<Database>,
}

impl StatusService {
    pub fn new(store: Arc<JobRecordStore>) -> Self {
        Self {
            store,
            history: None,
        }
    }

    pub fn with_history(mut self, db: Database) -> Self {
        self.history = Some(db);
        self
    }

    pub fn get_status(&self, resource_id: &str) -> ResourceStatus {
        let jobs = self
            .store
            .list_for_resource(resource_id)
            .into_iter()
            .map(|record| (record.job_type, record))
            .collect();
        ResourceStatus {
            resource_id: resource_id.to_string(),
            jobs,
        }
    }

    pub fn get_job(&self, key: &JobKey) -> JobRecord {
        self.store.get(key)
    }

    /// True only for `completed`; a cancelled or failed job keeps the next
    /// step locked.
    pub fn is_unlocked(&self, key: &JobKey) -> bool {
        self.store.get(key).status == JobStatus::Completed
    }

    /// Push alternative to polling; carries the same records.
    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.store.broadcaster().subscribe()
    }

    /// Most recent settled invocations of a key, newest first.
    pub fn history(&self, key: &JobKey, limit: u32) -> Result<Vec<RunRow>, DatabaseError> {
        match self.history {
            Some(ref db) => {
                history_repo::query_runs(db, &key.resource_id, key.job_type.as_str(), limit)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Daily outcome counts, optionally bounded by `YYYY-MM-DD` dates.
    pub fn daily_stats(
        &self,
        from_date: Option<&str>,
        to_date: Option<&str>,
    ) -> Result<Vec<DailyStatRow>, DatabaseError> {
        match self.history {
            Some(ref db) => history_repo::daily_stats(db, from_date, to_date),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobUpdate;
    use chrono::Utc;

    fn service() -> StatusService {
        StatusService::new(Arc::new(JobRecordStore::default()))
    }

    #[test]
    fn test_status_of_unknown_resource_is_empty() {
        let status = service().get_status("nope");
        assert!(status.jobs.is_empty());
        assert!(status.all_settled());
    }

    #[test]
    fn test_status_groups_jobs_by_type() {
        let service = service();
        let docs = JobKey::new("brand-1", JobType::DocumentProcessing);
        let items = JobKey::new("brand-1", JobType::ItemGeneration);
        service.store.register(&docs).unwrap();
        service.store.begin(&items, "job-1", 4).unwrap();
        service
            .store
            .register(&JobKey::new("brand-2", JobType::DocumentProcessing))
            .unwrap();

        let status = service.get_status("brand-1");
        assert_eq!(status.jobs.len(), 2);
        assert!(status.any_processing());
        assert_eq!(
            status.job(JobType::ItemGeneration).unwrap().job_id.as_deref(),
            Some("job-1")
        );
        assert!(!status.is_unlocked(JobType::DocumentProcessing));
    }

    #[test]
    fn test_only_completed_unlocks() {
        let service = service();
        let key = JobKey::new("brand-1", JobType::DocumentProcessing);
        service.store.begin(&key, "job-1", 2).unwrap();
        assert!(!service.is_unlocked(&key));

        service
            .store
            .update(&key, JobUpdate::cancelled(Utc::now()))
            .unwrap();
        assert!(!service.is_unlocked(&key));

        service.store.begin(&key, "job-2", 2).unwrap();
        service
            .store
            .update(&key, JobUpdate::completed(Utc::now()))
            .unwrap();
        assert!(service.is_unlocked(&key));
        assert!(service.get_status("brand-1").is_unlocked(JobType::DocumentProcessing));
    }

    #[test]
    fn test_history_without_database_is_empty() {
        let key = JobKey::new("brand-1", JobType::DeckGeneration);
        assert!(service().history(&key, 10).unwrap().is_empty());
        assert!(service().daily_stats(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_resource_status_serializes_by_job_type() {
        let service = service();
        service
            .store
            .register(&JobKey::new("brand-1", JobType::DeckGeneration))
            .unwrap();
        let json = serde_json::to_value(service.get_status("brand-1")).unwrap();
        assert_eq!(json["resourceId"], "brand-1");
        assert_eq!(json["jobs"]["deck_generation"]["status"], "idle");
    }
}
