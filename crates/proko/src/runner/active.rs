//! Registry of invocations whose runner task has not settled yet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::job::JobKey;

/// Handle to a live runner task.
pub(crate) struct ActiveJob {
    pub job_id: String,
    pub abort: AbortHandle,
    pub done: watch::Receiver<bool>,
    /// Set once the task holds a worker slot.
    pub admitted: Arc<AtomicBool>,
}

/// Keys with a live runner task. At most one entry per key.
#[derive(Default)]
pub(crate) struct ActiveJobs {
    inner: Mutex<HashMap<JobKey, ActiveJob>>,
}

impl ActiveJobs {
    pub fn lock(&self) -> MutexGuard<'_, HashMap<JobKey, ActiveJob>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Active job map lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Removes the entry only if it still belongs to `job_id`.
    pub fn remove_if(&self, key: &JobKey, job_id: &str) -> bool {
        let mut map = self.lock();
        if map.get(key).is_some_and(|a| a.job_id == job_id) {
            map.remove(key);
            true
        } else {
            false
        }
    }

    pub fn job_id(&self, key: &JobKey) -> Option<String> {
        self.lock().get(key).map(|a| a.job_id.clone())
    }

    /// True while the task for `key` is still waiting for a worker slot.
    pub fn is_queued(&self, key: &JobKey) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|a| !a.admitted.load(Ordering::Acquire))
    }

    pub fn done_receiver(&self, key: &JobKey) -> Option<watch::Receiver<bool>> {
        self.lock().get(key).map(|a| a.done.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn keys(&self) -> Vec<JobKey> {
        self.lock().keys().cloned().collect()
    }
}
