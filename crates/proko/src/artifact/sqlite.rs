use super::{Artifact, ArtifactStore};
use crate::db::artifact_repo::{self, ArtifactRow};
use crate::db::{format_timestamp, parse_timestamp, Database};
use crate::error::ArtifactError;
use crate::job::JobType;

/// Artifact store backed by the `artifacts` table.
#[derive(Clone)]
pub struct SqliteArtifactStore {
    db: Database,
}

impl SqliteArtifactStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn to_row(artifact: &Artifact) -> Result<ArtifactRow, ArtifactError> {
        Ok(ArtifactRow {
            id: artifact.id.clone(),
            resource_id: artifact.resource_id.clone(),
            job_type: artifact.job_type.to_string(),
            job_id: artifact.job_id.clone(),
            phase: artifact.phase.clone(),
            kind: artifact.kind.clone(),
            payload: serde_json::to_string(&artifact.payload)?,
            created_at: format_timestamp(artifact.created_at),
        })
    }

    /// Rows with an unknown job type are skipped with a warning.
    fn from_rows(rows: Vec<ArtifactRow>) -> Result<Vec<Artifact>, ArtifactError> {
        let mut artifacts = Vec::with_capacity(rows.len());
        for row in rows {
            let job_type = match row.job_type.parse::<JobType>() {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("Skipping artifact {}: {}", row.id, e);
                    continue;
                }
            };
            artifacts.push(Artifact {
                payload: serde_json::from_str(&row.payload)?,
                created_at: parse_timestamp(&row.created_at),
                id: row.id,
                resource_id: row.resource_id,
                job_type,
                job_id: row.job_id,
                phase: row.phase,
                kind: row.kind,
            });
        }
        Ok(artifacts)
    }
}

impl ArtifactStore for SqliteArtifactStore {
    fn put(&self, artifact: Artifact) -> Result<(), ArtifactError> {
        let row = Self::to_row(&artifact)?;
        artifact_repo::insert(&self.db, &row)?;
        Ok(())
    }

    fn delete_for_job(&self, job_id: &str) -> Result<usize, ArtifactError> {
        Ok(artifact_repo::delete_for_job(&self.db, job_id)?)
    }

    fn delete_for_phase(&self, job_id: &str, phase: &str) -> Result<usize, ArtifactError> {
        Ok(artifact_repo::delete_for_phase(&self.db, job_id, phase)?)
    }

    fn list_for_job(&self, job_id: &str) -> Result<Vec<Artifact>, ArtifactError> {
        Self::from_rows(artifact_repo::find_for_job(&self.db, job_id)?)
    }

    fn list_for_resource(&self, resource_id: &str) -> Result<Vec<Artifact>, ArtifactError> {
        Self::from_rows(artifact_repo::find_for_resource(&self.db, resource_id)?)
    }
}
