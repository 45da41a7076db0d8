//! Artifact repository — CRUD operations for the `artifacts` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw artifact row. `payload` holds JSON text.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRow {
    pub id: String,
    pub resource_id: String,
    pub job_type: String,
    pub job_id: String,
    pub phase: String,
    pub kind: String,
    pub payload: String,
    pub created_at: String,
}

impl ArtifactRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            resource_id: row.get("resource_id")?,
            job_type: row.get("job_type")?,
            job_id: row.get("job_id")?,
            phase: row.get("phase")?,
            kind: row.get("kind")?,
            payload: row.get("payload")?,
            created_at: row.get("created_at")?,
        })
    }
}

pub fn insert(db: &Database, artifact: &ArtifactRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO artifacts (id, resource_id, job_type, job_id, phase, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                artifact.id,
                artifact.resource_id,
                artifact.job_type,
                artifact.job_id,
                artifact.phase,
                artifact.kind,
                artifact.payload,
                artifact.created_at,
            ],
        )?;
        Ok(())
    })
}

pub fn delete_for_job(db: &Database, job_id: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute("DELETE FROM artifacts WHERE job_id = ?1", params![job_id])?;
        Ok(n)
    })
}

pub fn delete_for_phase(db: &Database, job_id: &str, phase: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "DELETE FROM artifacts WHERE job_id = ?1 AND phase = ?2",
            params![job_id, phase],
        )?;
        Ok(n)
    })
}

pub fn find_for_job(db: &Database, job_id: &str) -> Result<Vec<ArtifactRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM artifacts WHERE job_id = ?1 ORDER BY created_at")?;
        let rows = stmt
            .query_map(params![job_id], ArtifactRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

pub fn find_for_resource(
    db: &Database,
    resource_id: &str,
) -> Result<Vec<ArtifactRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM artifacts WHERE resource_id = ?1 ORDER BY created_at")?;
        let rows = stmt
            .query_map(params![resource_id], ArtifactRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
