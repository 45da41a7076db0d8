//! Run history repository — one row per settled invocation, plus daily
//! aggregates computed from those rows.

use rusqlite::{params, Row};
use serde::Serialize;

use super::{Database, DatabaseError};

/// A settled invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRow {
    pub job_id: String,
    pub resource_id: String,
    pub job_type: String,
    /// `completed`, `failed` or `cancelled`.
    pub outcome: String,
    pub phases_completed: u32,
    pub total_phases: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: i64,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            job_id: row.get("job_id")?,
            resource_id: row.get("resource_id")?,
            job_type: row.get("job_type")?,
            outcome: row.get("outcome")?,
            phases_completed: row.get("phases_completed")?,
            total_phases: row.get("total_phases")?,
            error: row.get("error")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            duration_ms: row.get("duration_ms")?,
        })
    }
}

/// Records a settled invocation. Re-recording the same job id overwrites it.
pub fn record_run(db: &Database, run: &RunRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT OR REPLACE INTO job_runs (job_id, resource_id, job_type, outcome,
             phases_completed, total_phases, error, started_at, finished_at, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                run.job_id,
                run.resource_id,
                run.job_type,
                run.outcome,
                run.phases_completed,
                run.total_phases,
                run.error,
                run.started_at,
                run.finished_at,
                run.duration_ms,
            ],
        )?;
        Ok(())
    })
}

/// Most recent runs for one key, newest first.
pub fn query_runs(
    db: &Database,
    resource_id: &str,
    job_type: &str,
    limit: u32,
) -> Result<Vec<RunRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM job_runs WHERE resource_id = ?1 AND job_type = ?2
             ORDER BY finished_at DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![resource_id, job_type, limit], RunRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Aggregated outcomes for one day and job type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStatRow {
    pub date: String,
    pub job_type: String,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub avg_duration_ms: i64,
}

/// Daily statistics, newest day first, optionally bounded by `from_date`/`to_date`
/// (inclusive, `YYYY-MM-DD`).
pub fn daily_stats(
    db: &Database,
    from_date: Option<&str>,
    to_date: Option<&str>,
) -> Result<Vec<DailyStatRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(from) = from_date {
            conditions.push(format!("substr(finished_at, 1, 10) >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(from.to_string()));
        }
        if let Some(to) = to_date {
            conditions.push(format!("substr(finished_at, 1, 10) <= ?{}", param_values.len() + 1));
            param_values.push(Box::new(to.to_string()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT substr(finished_at, 1, 10) AS day, job_type,
             COUNT(*),
             SUM(CASE WHEN outcome = 'completed' THEN 1 ELSE 0 END),
             SUM(CASE WHEN outcome = 'failed' THEN 1 ELSE 0 END),
             SUM(CASE WHEN outcome = 'cancelled' THEN 1 ELSE 0 END),
             CAST(AVG(duration_ms) AS INTEGER)
             FROM job_runs {} GROUP BY day, job_type ORDER BY day DESC, job_type",
            where_clause
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_ref.as_slice(), |row| {
                Ok(DailyStatRow {
                    date: row.get(0)?,
                    job_type: row.get(1)?,
                    total: row.get(2)?,
                    completed: row.get(3)?,
                    failed: row.get(4)?,
                    cancelled: row.get(5)?,
                    avg_duration_ms: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
