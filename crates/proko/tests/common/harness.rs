//! Test harness for isolated orchestrator instances.
//!
//! Each harness owns a temporary directory with its own SQLite file, so an
//! orchestrator can be shut down and reopened on the same data to simulate a
//! process restart.

#![allow(dead_code)]

use std::path::PathBuf;

use tempfile::TempDir;

use proko::config::Config;
use proko::recovery::RecoveryPolicy;
use proko::{JobType, Orchestrator, PhaseRegistry};

pub struct TestHarness {
    temp_dir: TempDir,
    pub db_path: PathBuf,
    pub config: Config,
}

impl TestHarness {
    /// Watchdog disabled, no shutdown grace, four concurrent jobs.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("data").join("proko.db");

        let mut config = Config::default();
        config.database_path = Some(db_path.to_string_lossy().to_string());
        config.runner.max_concurrent_jobs = 4;
        config.runner.shutdown_grace_secs = 0;
        config.recovery.watchdog_interval_secs = 0;

        Self {
            temp_dir,
            db_path,
            config,
        }
    }

    pub fn with_policy(mut self, job_type: JobType, policy: RecoveryPolicy) -> Self {
        self.config.recovery.policies.insert(job_type, policy);
        self
    }

    /// Opens an orchestrator on the harness database. Must run inside a
    /// Tokio runtime.
    pub fn open(&self, registry: PhaseRegistry) -> Orchestrator {
        Orchestrator::open(self.config.clone(), registry).expect("Failed to open orchestrator")
    }
}
