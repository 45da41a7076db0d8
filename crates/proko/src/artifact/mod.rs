//! Durable artifact store written incrementally by phase executors.
//!
//! Every artifact is tagged with the invocation (`job_id`) and phase that
//! produced it, so cancellation can remove exactly what one invocation wrote
//! and leave earlier completed runs untouched.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;
use crate::job::{JobKey, JobType};

pub use memory::MemoryArtifactStore;
pub use sqlite::SqliteArtifactStore;

/// A partial result persisted by a phase (generated category, product, item...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub resource_id: String,
    pub job_type: JobType,
    pub job_id: String,
    pub phase: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Storage seam for phase output.
pub trait ArtifactStore: Send + Sync {
    fn put(&self, artifact: Artifact) -> Result<(), ArtifactError>;

    /// Removes everything one invocation wrote. Returns the number removed.
    fn delete_for_job(&self, job_id: &str) -> Result<usize, ArtifactError>;

    /// Removes what a single phase of one invocation wrote.
    fn delete_for_phase(&self, job_id: &str, phase: &str) -> Result<usize, ArtifactError>;

    fn list_for_job(&self, job_id: &str) -> Result<Vec<Artifact>, ArtifactError>;

    fn list_for_resource(&self, resource_id: &str) -> Result<Vec<Artifact>, ArtifactError>;
}

/// Write handle given to a phase executor, pre-tagged with its invocation.
#[derive(Clone)]
pub struct ArtifactSink {
    store: Arc<dyn ArtifactStore>,
    key: JobKey,
    job_id: String,
    phase: String,
}

impl ArtifactSink {
    pub fn new(store: Arc<dyn ArtifactStore>, key: JobKey, job_id: &str, phase: &str) -> Self {
        Self {
            store,
            key,
            job_id: job_id.to_string(),
            phase: phase.to_string(),
        }
    }

    /// Persists one artifact and returns its id.
    pub fn write(&self, kind: &str, payload: serde_json::Value) -> Result<String, ArtifactError> {
        let artifact = Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            resource_id: self.key.resource_id.clone(),
            job_type: self.key.job_type,
            job_id: self.job_id.clone(),
            phase: self.phase.clone(),
            kind: kind.to_string(),
            payload,
            created_at: Utc::now(),
        };
        let id = artifact.id.clone();
        self.store.put(artifact)?;
        Ok(id)
    }

    /// Serializes `value` and persists it.
    pub fn write_json<T: Serialize>(&self, kind: &str, value: &T) -> Result<String, ArtifactError> {
        let payload = serde_json::to_value(value)?;
        self.write(kind, payload)
    }

    /// Artifacts this invocation has written so far, from any phase.
    pub fn written_so_far(&self) -> Result<Vec<Artifact>, ArtifactError> {
        self.store.list_for_job(&self.job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_tags_artifacts() {
        let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
        let key = JobKey::new("doc-1", JobType::DocumentProcessing);
        let sink = ArtifactSink::new(Arc::clone(&store), key, "job-1", "parse");

        let id = sink
            .write_json("product", &serde_json::json!({"sku": "A-100"}))
            .unwrap();

        let written = sink.written_so_far().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].id, id);
        assert_eq!(written[0].job_id, "job-1");
        assert_eq!(written[0].phase, "parse");
        assert_eq!(written[0].resource_id, "doc-1");
        assert_eq!(written[0].payload["sku"], "A-100");
    }
}
