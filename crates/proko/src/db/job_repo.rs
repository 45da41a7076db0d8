//! Job record repository — persistence for the `job_records` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// A raw job record row from the database.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub resource_id: String,
    pub job_type: String,
    pub status: String,
    pub job_id: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub last_updated: String,
    pub current_phase: Option<String>,
    pub phase_index: u32,
    pub total_phases: u32,
    pub percentage: u8,
    /// JSON-encoded error record.
    pub error: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            resource_id: row.get("resource_id")?,
            job_type: row.get("job_type")?,
            status: row.get("status")?,
            job_id: row.get("job_id")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            last_updated: row.get("last_updated")?,
            current_phase: row.get("current_phase")?,
            phase_index: row.get("phase_index")?,
            total_phases: row.get("total_phases")?,
            percentage: row.get("percentage")?,
            error: row.get("error")?,
        })
    }
}

/// Inserts or replaces the row for `(resource_id, job_type)`.
pub fn upsert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO job_records (resource_id, job_type, status, job_id, started_at,
             completed_at, last_updated, current_phase, phase_index, total_phases,
             percentage, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(resource_id, job_type) DO UPDATE SET
               status = excluded.status,
               job_id = excluded.job_id,
               started_at = excluded.started_at,
               completed_at = excluded.completed_at,
               last_updated = excluded.last_updated,
               current_phase = excluded.current_phase,
               phase_index = excluded.phase_index,
               total_phases = excluded.total_phases,
               percentage = excluded.percentage,
               error = excluded.error",
            params![
                job.resource_id,
                job.job_type,
                job.status,
                job.job_id,
                job.started_at,
                job.completed_at,
                job.last_updated,
                job.current_phase,
                job.phase_index,
                job.total_phases,
                job.percentage,
                job.error,
            ],
        )?;
        Ok(())
    })
}

/// Finds the row for a key.
pub fn find(
    db: &Database,
    resource_id: &str,
    job_type: &str,
) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM job_records WHERE resource_id = ?1 AND job_type = ?2")?;
        let mut rows = stmt.query_map(params![resource_id, job_type], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Every stored row.
pub fn all(db: &Database) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM job_records")?;
        let rows = stmt
            .query_map([], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes every row of a resource. Returns the number deleted.
pub fn delete_for_resource(db: &Database, resource_id: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let n = conn.execute(
            "DELETE FROM job_records WHERE resource_id = ?1",
            params![resource_id],
        )?;
        Ok(n)
    })
}
