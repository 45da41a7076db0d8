//! Job record store with write-through database persistence.
//!
//! The in-memory cache is authoritative while the process runs; every write
//! goes to the database first and only then replaces the cached record, all
//! under the cache's write lock so writes to one key are totally ordered.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use crate::broadcast::{JobEventKind, JobProgressBroadcaster, JobProgressEvent};
use crate::db::job_repo::{self, JobRow};
use crate::db::{format_timestamp, parse_timestamp, Database};
use crate::error::{StartError, StoreError};
use crate::job::{JobErrorInfo, JobKey, JobProgress, JobRecord, JobStatus, JobType, JobUpdate};

// ─── Row conversion ─────────────────────────────────────────────────────────

fn record_to_row(record: &JobRecord) -> Result<JobRow, StoreError> {
    let error = match record.error {
        Some(ref e) => Some(serde_json::to_string(e).map_err(crate::db::DatabaseError::from)?),
        None => None,
    };
    Ok(JobRow {
        resource_id: record.resource_id.clone(),
        job_type: record.job_type.to_string(),
        status: record.status.to_string(),
        job_id: record.job_id.clone(),
        started_at: record.started_at.map(format_timestamp),
        completed_at: record.completed_at.map(format_timestamp),
        last_updated: format_timestamp(record.last_updated),
        current_phase: record.current_phase.clone(),
        phase_index: record.progress.phase_index,
        total_phases: record.progress.total_phases,
        percentage: record.progress.percentage,
        error,
    })
}

/// Converts a stored row. Rows with an unknown job type are unusable and
/// yield `None`; an unknown status is read as failed so it cannot block a
/// fresh start forever.
fn row_to_record(row: &JobRow) -> Option<JobRecord> {
    let job_type = match row.job_type.parse::<JobType>() {
        Ok(t) => t,
        Err(e) => {
            log::warn!("Skipping job record for '{}': {}", row.resource_id, e);
            return None;
        }
    };
    let status = row.status.parse::<JobStatus>().unwrap_or_else(|e| {
        log::warn!(
            "{} for {}/{}, treating as failed",
            e,
            row.resource_id,
            row.job_type
        );
        JobStatus::Failed
    });
    let error: Option<JobErrorInfo> = row.error.as_deref().and_then(|s| {
        serde_json::from_str(s)
            .map_err(|e| log::warn!("Unreadable error column for {}: {}", row.resource_id, e))
            .ok()
    });

    Some(JobRecord {
        resource_id: row.resource_id.clone(),
        job_type,
        status,
        job_id: row.job_id.clone(),
        started_at: row.started_at.as_deref().map(parse_timestamp),
        completed_at: row.completed_at.as_deref().map(parse_timestamp),
        last_updated: parse_timestamp(&row.last_updated),
        current_phase: row.current_phase.clone(),
        progress: JobProgress::compute(
            row.phase_index,
            row.total_phases,
            status == JobStatus::Completed,
        ),
        error,
    })
}

// ─── JobRecordStore ─────────────────────────────────────────────────────────

/// Durable, read-after-write consistent storage of job records keyed by
/// (resource id, job type).
pub struct JobRecordStore {
    cache: RwLock<HashMap<JobKey, JobRecord>>,
    database: RwLock<Option<Database>>,
    broadcaster: JobProgressBroadcaster,
}

impl JobRecordStore {
    pub fn new(broadcaster: JobProgressBroadcaster) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            database: RwLock::new(None),
            broadcaster,
        }
    }

    /// Attaches the database used for write-through persistence.
    pub fn set_database(&self, db: Database) {
        match self.database.write() {
            Ok(mut guard) => *guard = Some(db),
            Err(poisoned) => *poisoned.into_inner() = Some(db),
        }
    }

    fn get_database(&self) -> Option<Database> {
        match self.database.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn broadcaster(&self) -> &JobProgressBroadcaster {
        &self.broadcaster
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, HashMap<JobKey, JobRecord>> {
        match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job record cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, HashMap<JobKey, JobRecord>> {
        match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job record cache lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Runs `f` against the current record under the write lock. When `f`
    /// returns a new record it is persisted, cached and broadcast.
    fn mutate<E, F>(&self, key: &JobKey, f: F) -> Result<Option<JobRecord>, E>
    where
        E: From<StoreError>,
        F: FnOnce(Option<&JobRecord>, DateTime<Utc>) -> Result<Option<(JobRecord, JobEventKind)>, E>,
    {
        let event = {
            let mut cache = self.write_cache();
            let now = Utc::now();
            let Some((record, kind)) = f(cache.get(key), now)? else {
                return Ok(None);
            };

            if let Some(db) = self.get_database() {
                let row = record_to_row(&record)?;
                job_repo::upsert(&db, &row).map_err(StoreError::from)?;
            }

            cache.insert(key.clone(), record.clone());
            JobProgressEvent::new(kind, record)
        };

        let record = event.record.clone();
        self.broadcaster.send(event);
        Ok(Some(record))
    }

    /// Current record for a key; a synthesized idle record if none exists.
    pub fn get(&self, key: &JobKey) -> JobRecord {
        self.read_cache()
            .get(key)
            .cloned()
            .unwrap_or_else(|| JobRecord::idle(key, Utc::now()))
    }

    /// Whether a record has ever been stored for the key.
    pub fn contains(&self, key: &JobKey) -> bool {
        self.read_cache().contains_key(key)
    }

    /// Creates the idle record for a key if it does not exist yet.
    pub fn register(&self, key: &JobKey) -> Result<JobRecord, StoreError> {
        let created = self.mutate::<StoreError, _>(key, |current, now| {
            Ok(match current {
                Some(_) => None,
                None => Some((JobRecord::idle(key, now), JobEventKind::Registered)),
            })
        })?;
        Ok(created.unwrap_or_else(|| self.get(key)))
    }

    /// Merges a partial update into a processing record.
    ///
    /// Idle and terminal records are immutable outside [`begin`](Self::begin).
    pub fn update(&self, key: &JobKey, update: JobUpdate) -> Result<JobRecord, StoreError> {
        let updated = self.mutate::<StoreError, _>(key, |current, now| {
            let mut record = current
                .cloned()
                .unwrap_or_else(|| JobRecord::idle(key, now));
            let to = update.status.unwrap_or(record.status);
            if !record.status.can_transition_to(to) {
                return Err(StoreError::InvalidTransition {
                    key: key.clone(),
                    from: record.status,
                    to,
                });
            }
            let phase_changed = update.current_phase.is_some();
            record.apply(&update, now);
            let kind = JobEventKind::for_record(&record, phase_changed);
            Ok(Some((record, kind)))
        })?;
        Ok(updated.unwrap_or_else(|| self.get(key)))
    }

    /// Merges `update` only while the record is processing and, when
    /// `expected_job_id` is given, still owned by that invocation.
    ///
    /// Returns `None` without writing when the guard fails.
    pub fn update_if(
        &self,
        key: &JobKey,
        expected_job_id: Option<&str>,
        update: JobUpdate,
    ) -> Result<Option<JobRecord>, StoreError> {
        self.mutate::<StoreError, _>(key, |current, now| {
            let Some(current) = current else {
                return Ok(None);
            };
            let owned = match expected_job_id {
                Some(id) => current.job_id.as_deref() == Some(id),
                None => true,
            };
            if !current.is_processing() || !owned {
                return Ok(None);
            }
            let phase_changed = update.current_phase.is_some();
            let mut record = current.clone();
            record.apply(&update, now);
            let kind = JobEventKind::for_record(&record, phase_changed);
            Ok(Some((record, kind)))
        })
    }

    /// Starts a new invocation: the atomic check-and-set behind `start`.
    ///
    /// Rejected while the key is processing; otherwise the record is replaced
    /// by a fresh one (new job id, cleared error, phase index 0).
    pub fn begin(
        &self,
        key: &JobKey,
        job_id: &str,
        total_phases: u32,
    ) -> Result<JobRecord, StartError> {
        let started = self.mutate::<StartError, _>(key, |current, now| {
            if let Some(current) = current.filter(|r| r.is_processing()) {
                return Err(StartError::AlreadyProcessing {
                    key: key.clone(),
                    job_id: current.job_id.clone().unwrap_or_default(),
                });
            }
            let record = JobRecord::started(key, job_id, total_phases, now);
            Ok(Some((record, JobEventKind::Started)))
        })?;
        Ok(started.unwrap_or_else(|| self.get(key)))
    }

    /// Re-publishes the current record under the given event kind.
    pub fn publish(&self, key: &JobKey, kind: JobEventKind) {
        self.broadcaster
            .send(JobProgressEvent::new(kind, self.get(key)));
    }

    /// All records with the given status.
    pub fn list_by_status(&self, status: JobStatus) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .read_cache()
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.last_updated.cmp(&b.last_updated));
        records
    }

    /// All records stored for a resource, ordered by job type.
    pub fn list_for_resource(&self, resource_id: &str) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .read_cache()
            .values()
            .filter(|r| r.resource_id == resource_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.job_type);
        records
    }

    /// Returns the count of records by status: (processing, completed, failed, cancelled).
    pub fn counts(&self) -> (usize, usize, usize, usize) {
        let cache = self.read_cache();
        let mut counts = (0, 0, 0, 0);
        for record in cache.values() {
            match record.status {
                JobStatus::Processing => counts.0 += 1,
                JobStatus::Completed => counts.1 += 1,
                JobStatus::Failed => counts.2 += 1,
                JobStatus::Cancelled => counts.3 += 1,
                JobStatus::Idle => {}
            }
        }
        counts
    }

    /// Deletes every record of a resource, which must have nothing processing.
    pub fn remove_resource(&self, resource_id: &str) -> Result<usize, StoreError> {
        let mut cache = self.write_cache();
        if let Some(busy) = cache
            .values()
            .find(|r| r.resource_id == resource_id && r.is_processing())
        {
            return Err(StoreError::ResourceBusy {
                resource_id: resource_id.to_string(),
                job_type: busy.job_type.to_string(),
            });
        }

        if let Some(db) = self.get_database() {
            job_repo::delete_for_resource(&db, resource_id)?;
        }

        let before = cache.len();
        cache.retain(|k, _| k.resource_id != resource_id);
        Ok(before - cache.len())
    }

    /// Loads every stored record into the cache. Call once at startup,
    /// before recovery and before serving status.
    pub fn load_from_database(&self) -> Result<usize, StoreError> {
        let Some(db) = self.get_database() else {
            return Ok(0);
        };

        let rows = job_repo::all(&db)?;
        let mut cache = self.write_cache();
        let mut loaded = 0;
        for record in rows.iter().filter_map(row_to_record) {
            cache.insert(record.key(), record);
            loaded += 1;
        }

        log::info!("Loaded {} job records from database into cache", loaded);
        Ok(loaded)
    }
}

impl Default for JobRecordStore {
    fn default() -> Self {
        Self::new(JobProgressBroadcaster::default())
    }
}
