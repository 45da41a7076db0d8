use std::sync::RwLock;

use super::{Artifact, ArtifactStore};
use crate::error::ArtifactError;

/// In-process artifact store, used in tests and when no database is attached.
#[derive(Default)]
pub struct MemoryArtifactStore {
    artifacts: RwLock<Vec<Artifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn remove_where<F>(&self, predicate: F) -> Result<usize, ArtifactError>
    where
        F: Fn(&Artifact) -> bool,
    {
        let mut artifacts = self
            .artifacts
            .write()
            .map_err(|_| ArtifactError::LockPoisoned)?;
        let before = artifacts.len();
        artifacts.retain(|a| !predicate(a));
        Ok(before - artifacts.len())
    }

    fn collect_where<F>(&self, predicate: F) -> Result<Vec<Artifact>, ArtifactError>
    where
        F: Fn(&Artifact) -> bool,
    {
        let artifacts = self
            .artifacts
            .read()
            .map_err(|_| ArtifactError::LockPoisoned)?;
        Ok(artifacts.iter().filter(|a| predicate(a)).cloned().collect())
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(&self, artifact: Artifact) -> Result<(), ArtifactError> {
        self.artifacts
            .write()
            .map_err(|_| ArtifactError::LockPoisoned)?
            .push(artifact);
        Ok(())
    }

    fn delete_for_job(&self, job_id: &str) -> Result<usize, ArtifactError> {
        self.remove_where(|a| a.job_id == job_id)
    }

    fn delete_for_phase(&self, job_id: &str, phase: &str) -> Result<usize, ArtifactError> {
        self.remove_where(|a| a.job_id == job_id && a.phase == phase)
    }

    fn list_for_job(&self, job_id: &str) -> Result<Vec<Artifact>, ArtifactError> {
        self.collect_where(|a| a.job_id == job_id)
    }

    fn list_for_resource(&self, resource_id: &str) -> Result<Vec<Artifact>, ArtifactError> {
        self.collect_where(|a| a.resource_id == resource_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobType;
    use chrono::Utc;

    fn artifact(id: &str, job_id: &str, phase: &str) -> Artifact {
        Artifact {
            id: id.to_string(),
            resource_id: "res-1".to_string(),
            job_type: JobType::ItemGeneration,
            job_id: job_id.to_string(),
            phase: phase.to_string(),
            kind: "item".to_string(),
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_delete_for_job_leaves_other_invocations() {
        let store = MemoryArtifactStore::new();
        store.put(artifact("a1", "old-job", "generate")).unwrap();
        store.put(artifact("a2", "new-job", "generate")).unwrap();
        store.put(artifact("a3", "new-job", "categorize")).unwrap();

        assert_eq!(store.delete_for_job("new-job").unwrap(), 2);

        let remaining = store.list_for_resource("res-1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "a1");
    }

    #[test]
    fn test_delete_for_phase() {
        let store = MemoryArtifactStore::new();
        store.put(artifact("a1", "job", "categorize")).unwrap();
        store.put(artifact("a2", "job", "generate")).unwrap();

        assert_eq!(store.delete_for_phase("job", "generate").unwrap(), 1);
        let remaining = store.list_for_job("job").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].phase, "categorize");
    }
}
