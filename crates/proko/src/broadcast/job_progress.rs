//! Job progress broadcaster for real-time status streaming.
//!
//! Polling the status service stays the primary contract; this channel is the
//! push alternative and carries the same `JobRecord` snapshots.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{JobKey, JobRecord, JobStatus};

/// What caused a progress event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    /// Idle record created with its parent resource.
    Registered,
    Started,
    PhaseStarted,
    PhaseCompleted,
    Completed,
    Failed,
    /// Status flipped to cancelled; cleanup may still be running.
    CancelRequested,
    /// The invocation's runner has finished, including any cleanup.
    Settled,
}

impl JobEventKind {
    /// Derives the event kind from the record a write produced.
    pub fn for_record(record: &JobRecord, phase_changed: bool) -> Self {
        match record.status {
            JobStatus::Idle => JobEventKind::Registered,
            JobStatus::Completed => JobEventKind::Completed,
            JobStatus::Failed => JobEventKind::Failed,
            JobStatus::Cancelled => JobEventKind::CancelRequested,
            JobStatus::Processing if phase_changed => JobEventKind::PhaseStarted,
            JobStatus::Processing => JobEventKind::PhaseCompleted,
        }
    }
}

/// Progress event for a job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgressEvent {
    pub kind: JobEventKind,
    /// Snapshot of the record after the write.
    pub record: JobRecord,
    /// Human-readable description.
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl JobProgressEvent {
    pub fn new(kind: JobEventKind, record: JobRecord) -> Self {
        let message = describe(kind, &record);
        Self {
            kind,
            record,
            message,
            timestamp: Utc::now(),
        }
    }

    pub fn key(&self) -> JobKey {
        self.record.key()
    }
}

fn describe(kind: JobEventKind, record: &JobRecord) -> String {
    let phase = record.current_phase.as_deref().unwrap_or("-");
    match kind {
        JobEventKind::Registered => "Job registered".to_string(),
        JobEventKind::Started => "Job queued for processing".to_string(),
        JobEventKind::PhaseStarted => format!(
            "Running phase {} of {}: {}",
            record.progress.phase_index + 1,
            record.progress.total_phases,
            phase
        ),
        JobEventKind::PhaseCompleted => format!(
            "Finished phase {} ({}%)",
            phase, record.progress.percentage
        ),
        JobEventKind::Completed => "Processing completed successfully".to_string(),
        JobEventKind::Failed => match record.error {
            Some(ref e) => format!("Processing failed: {}", e.message),
            None => "Processing failed".to_string(),
        },
        JobEventKind::CancelRequested => "Cancellation requested".to_string(),
        JobEventKind::Settled => format!("Job settled as {}", record.status),
    }
}

/// Broadcasts job progress events for streaming.
#[derive(Clone)]
pub struct JobProgressBroadcaster {
    sender: Arc<broadcast::Sender<JobProgressEvent>>,
}

impl JobProgressBroadcaster {
    /// Creates a new job progress broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: JobProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    /// Creates a new subscriber for progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobErrorInfo, JobType};

    fn record(status: JobStatus) -> JobRecord {
        let key = JobKey::new("doc-1", JobType::DocumentProcessing);
        let mut record = JobRecord::started(&key, "job-1", 3, Utc::now());
        record.status = status;
        record
    }

    #[test]
    fn test_broadcaster_send_receive() {
        let broadcaster = JobProgressBroadcaster::new(10);
        let mut rx = broadcaster.subscribe();

        broadcaster.send(JobProgressEvent::new(
            JobEventKind::Started,
            record(JobStatus::Processing),
        ));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.kind, JobEventKind::Started);
        assert_eq!(received.record.job_id.as_deref(), Some("job-1"));
        assert_eq!(received.message, "Job queued for processing");
    }

    #[test]
    fn test_send_without_subscribers_is_ok() {
        let broadcaster = JobProgressBroadcaster::default();
        broadcaster.send(JobProgressEvent::new(
            JobEventKind::Completed,
            record(JobStatus::Completed),
        ));
    }

    #[test]
    fn test_kind_for_record() {
        assert_eq!(
            JobEventKind::for_record(&record(JobStatus::Processing), true),
            JobEventKind::PhaseStarted
        );
        assert_eq!(
            JobEventKind::for_record(&record(JobStatus::Processing), false),
            JobEventKind::PhaseCompleted
        );
        assert_eq!(
            JobEventKind::for_record(&record(JobStatus::Cancelled), false),
            JobEventKind::CancelRequested
        );
    }

    #[test]
    fn test_failed_message_includes_error() {
        let mut failed = record(JobStatus::Failed);
        failed.error = Some(JobErrorInfo::new("PDF has no pages", Some("parse".into())));
        let event = JobProgressEvent::new(JobEventKind::Failed, failed);
        assert_eq!(event.message, "Processing failed: PDF has no pages");
    }

    #[test]
    fn test_phase_started_message() {
        let mut running = record(JobStatus::Processing);
        running.current_phase = Some("extract_items".to_string());
        let event = JobProgressEvent::new(JobEventKind::PhaseStarted, running);
        assert_eq!(event.message, "Running phase 1 of 3: extract_items");
    }
}
