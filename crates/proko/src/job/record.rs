//! Job record: the durable status object for one (resource, job type) key.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of background job tracked on a parent resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Line sheet / purchase order parsing into structured product records.
    DocumentProcessing,
    /// AI category and item generation for a collection.
    ItemGeneration,
    /// Training deck assembly.
    DeckGeneration,
}

impl JobType {
    pub const ALL: [JobType; 3] = [
        JobType::DocumentProcessing,
        JobType::ItemGeneration,
        JobType::DeckGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::DocumentProcessing => "document_processing",
            JobType::ItemGeneration => "item_generation",
            JobType::DeckGeneration => "deck_generation",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document_processing" => Ok(JobType::DocumentProcessing),
            "item_generation" => Ok(JobType::ItemGeneration),
            "deck_generation" => Ok(JobType::DeckGeneration),
            other => Err(format!("unknown job type '{}'", other)),
        }
    }
}

/// Lifecycle status of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed and cancelled records only change through a fresh start.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether an in-place update may move a record from `self` to `next`.
    ///
    /// Entering `Processing` is not an update; it goes through
    /// [`JobRecordStore::begin`](crate::store::JobRecordStore::begin).
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Processing => next == JobStatus::Processing || next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(JobStatus::Idle),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Address of a job record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobKey {
    pub resource_id: String,
    pub job_type: JobType,
}

impl JobKey {
    pub fn new(resource_id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            resource_id: resource_id.into(),
            job_type,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_id, self.job_type)
    }
}

/// Phase-granular progress of one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub phase_index: u32,
    pub total_phases: u32,
    pub percentage: u8,
}

impl JobProgress {
    /// Computes progress for `phase_index` of `total_phases`.
    ///
    /// 100 is reserved for completed invocations; a processing record caps at 99.
    pub fn compute(phase_index: u32, total_phases: u32, completed: bool) -> Self {
        let percentage = if completed {
            100
        } else if total_phases == 0 {
            0
        } else {
            let raw = (u64::from(phase_index) * 100) / u64::from(total_phases);
            raw.min(99) as u8
        };
        Self {
            phase_index,
            total_phases,
            percentage,
        }
    }
}

/// Structured failure information, present only on failed records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobErrorInfo {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl JobErrorInfo {
    pub fn new(message: impl Into<String>, phase: Option<String>) -> Self {
        Self {
            message: message.into(),
            phase,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Status of one (resource, job type) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub resource_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    pub progress: JobProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorInfo>,
}

impl JobRecord {
    /// An idle record, as created alongside its parent resource.
    pub fn idle(key: &JobKey, now: DateTime<Utc>) -> Self {
        Self {
            resource_id: key.resource_id.clone(),
            job_type: key.job_type,
            status: JobStatus::Idle,
            job_id: None,
            started_at: None,
            completed_at: None,
            last_updated: now,
            current_phase: None,
            progress: JobProgress::default(),
            error: None,
        }
    }

    /// A freshly started invocation. Replaces whatever the key held before.
    pub fn started(key: &JobKey, job_id: &str, total_phases: u32, now: DateTime<Utc>) -> Self {
        Self {
            resource_id: key.resource_id.clone(),
            job_type: key.job_type,
            status: JobStatus::Processing,
            job_id: Some(job_id.to_string()),
            started_at: Some(now),
            completed_at: None,
            last_updated: now,
            current_phase: None,
            progress: JobProgress::compute(0, total_phases, false),
            error: None,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.resource_id.clone(), self.job_type)
    }

    pub fn is_processing(&self) -> bool {
        self.status == JobStatus::Processing
    }

    /// Time since the last write, in whole seconds.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_updated).num_seconds()
    }

    /// Merges a partial update and refreshes `last_updated`.
    ///
    /// A lower `phase_index` than the current one is ignored so progress
    /// never moves backwards within an invocation.
    pub fn apply(&mut self, update: &JobUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(ref phase) = update.current_phase {
            self.current_phase = phase.clone();
        }
        if let Some(completed_at) = update.completed_at {
            self.completed_at = Some(completed_at);
        }
        if let Some(ref error) = update.error {
            self.error = Some(error.clone());
        }

        let mut phase_index = self.progress.phase_index;
        if let Some(next) = update.phase_index {
            if next >= phase_index {
                phase_index = next;
            } else {
                log::warn!(
                    "Ignoring backwards progress for {} ({} -> {})",
                    self.key(),
                    phase_index,
                    next
                );
            }
        }
        let total = self.progress.total_phases;
        self.progress = JobProgress::compute(
            phase_index.min(total),
            total,
            self.status == JobStatus::Completed,
        );
        self.last_updated = now;
    }
}

/// Partial update merged into a [`JobRecord`]. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub current_phase: Option<Option<String>>,
    pub phase_index: Option<u32>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<JobErrorInfo>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn current_phase(mut self, phase: impl Into<String>) -> Self {
        self.current_phase = Some(Some(phase.into()));
        self
    }

    pub fn phase_index(mut self, index: u32) -> Self {
        self.phase_index = Some(index);
        self
    }

    /// Terminal success.
    pub fn completed(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            completed_at: Some(now),
            ..Default::default()
        }
    }

    /// Terminal failure carrying the error record.
    pub fn failed(error: JobErrorInfo, now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            completed_at: Some(now),
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn cancelled(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            completed_at: Some(now),
            ..Default::default()
        }
    }
}
