//! Wires the store, runner, cancellation, recovery and status service into
//! the one handle an application embeds.

use std::sync::Arc;

use log::{info, warn};

use crate::artifact::{ArtifactStore, MemoryArtifactStore, SqliteArtifactStore};
use crate::broadcast::JobProgressBroadcaster;
use crate::cancel::{CancelOutcome, CancellationCoordinator};
use crate::config::Config;
use crate::db::Database;
use crate::error::{ConfigError, ProkoError, StartError, StoreError};
use crate::job::{JobKey, JobRecord, JobType, Phase, PhaseRegistry};
use crate::recovery::{RecoveryReport, StaleJobRecovery, Watchdog};
use crate::runner::JobRunner;
use crate::status::{PollingPolicy, ResourceStatus, StatusService};
use crate::store::JobRecordStore;

/// Job orchestration for one process.
///
/// Construction runs startup recovery before anything can read status, then
/// starts the watchdog. All constructors must be called within a Tokio
/// runtime.
pub struct Orchestrator {
    config: Config,
    database: Database,
    registry: Arc<PhaseRegistry>,
    store: Arc<JobRecordStore>,
    runner: Arc<JobRunner>,
    cancellation: CancellationCoordinator,
    recovery: Arc<StaleJobRecovery>,
    status: StatusService,
    watchdog: Option<Watchdog>,
    startup_report: RecoveryReport,
}

impl Orchestrator {
    /// Opens (or creates) the database named by the config.
    pub fn open(config: Config, registry: PhaseRegistry) -> Result<Self, ProkoError> {
        let path = config.database_path().ok_or_else(|| ConfigError::Validation {
            message: "No database_path configured and no home directory found".to_string(),
        })?;
        let db = Database::open(&path)?;
        info!("Job database opened at {}", path.display());
        Self::with_database(config, registry, db)
    }

    /// Runs against a fresh in-memory database.
    pub fn open_in_memory(config: Config, registry: PhaseRegistry) -> Result<Self, ProkoError> {
        Self::with_database(config, registry, Database::open_in_memory()?)
    }

    pub fn with_database(
        config: Config,
        registry: PhaseRegistry,
        db: Database,
    ) -> Result<Self, ProkoError> {
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(SqliteArtifactStore::new(db.clone()));
        Self::assemble(config, registry, db, artifacts)
    }

    /// Like [`with_database`](Self::with_database) with artifacts kept in memory.
    pub fn with_memory_artifacts(
        config: Config,
        registry: PhaseRegistry,
        db: Database,
    ) -> Result<Self, ProkoError> {
        Self::assemble(config, registry, db, Arc::new(MemoryArtifactStore::new()))
    }

    fn assemble(
        config: Config,
        registry: PhaseRegistry,
        db: Database,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Result<Self, ProkoError> {
        let broadcaster = JobProgressBroadcaster::new(config.runner.progress_channel_capacity);
        let store = Arc::new(JobRecordStore::new(broadcaster));
        store.set_database(db.clone());
        store.load_from_database()?;

        let runner = Arc::new(
            JobRunner::new(
                Arc::clone(&store),
                artifacts,
                config.runner.max_concurrent_jobs,
            )
            .with_history(db.clone()),
        );
        let registry = Arc::new(registry);
        let recovery = Arc::new(StaleJobRecovery::new(
            Arc::clone(&runner),
            Arc::clone(&registry),
            config.recovery.clone(),
        ));

        let startup_report = recovery.run_startup();

        let watchdog = match config.recovery.watchdog_interval() {
            Some(interval) => Some(Watchdog::spawn(
                Arc::clone(&recovery),
                interval,
                config.recovery.staleness_threshold(),
            )),
            None => {
                warn!("Watchdog disabled; stuck jobs are only resolved at startup");
                None
            }
        };

        let status = StatusService::new(Arc::clone(&store)).with_history(db.clone());
        let cancellation = CancellationCoordinator::new(Arc::clone(&runner));

        info!(
            "Orchestrator ready ({} concurrent jobs)",
            config.runner.max_concurrent_jobs
        );

        Ok(Self {
            config,
            database: db,
            registry,
            store,
            runner,
            cancellation,
            recovery,
            status,
            watchdog,
            startup_report,
        })
    }

    /// Creates the idle record of every job type for a new resource.
    pub fn register_resource(&self, resource_id: &str) -> Result<ResourceStatus, StoreError> {
        for job_type in JobType::ALL {
            self.store.register(&JobKey::new(resource_id, job_type))?;
        }
        Ok(self.status.get_status(resource_id))
    }

    /// Deletes the job records of a resource that is itself being deleted.
    pub fn remove_resource(&self, resource_id: &str) -> Result<usize, StoreError> {
        let removed = self.store.remove_resource(resource_id)?;
        info!("Removed {} job records of resource {}", removed, resource_id);
        Ok(removed)
    }

    /// Starts the registered plan for the key's job type.
    pub fn start(&self, key: &JobKey) -> Result<JobRecord, StartError> {
        let phases = self
            .registry
            .phases_for(key)
            .ok_or_else(|| StartError::NoPlan(key.job_type.to_string()))?;
        self.runner.start(key, phases)
    }

    /// Starts an explicit phase list.
    pub fn start_with(&self, key: &JobKey, phases: Vec<Phase>) -> Result<JobRecord, StartError> {
        self.runner.start(key, phases)
    }

    pub fn request_cancel(&self, key: &JobKey) -> Result<CancelOutcome, StoreError> {
        self.cancellation.request_cancel(key)
    }

    pub async fn cancel_and_wait(&self, key: &JobKey) -> Result<CancelOutcome, StoreError> {
        self.cancellation.cancel_and_wait(key).await
    }

    pub fn get_status(&self, resource_id: &str) -> ResourceStatus {
        self.status.get_status(resource_id)
    }

    pub fn status(&self) -> &StatusService {
        &self.status
    }

    pub fn polling_policy(&self) -> PollingPolicy {
        PollingPolicy::from_config(&self.config.polling)
    }

    /// Runs a staleness sweep now instead of waiting for the watchdog.
    pub fn sweep_stale(&self) -> RecoveryReport {
        self.recovery.sweep(self.config.recovery.staleness_threshold())
    }

    /// What the startup pass did.
    pub fn startup_report(&self) -> &RecoveryReport {
        &self.startup_report
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    pub fn store(&self) -> &Arc<JobRecordStore> {
        &self.store
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stops the watchdog and the runner. Jobs still running after the
    /// configured grace period stay `processing` for the next startup.
    pub async fn shutdown(&self) {
        if let Some(ref watchdog) = self.watchdog {
            watchdog.stop();
        }
        self.runner.shutdown(self.config.runner.shutdown_grace()).await;
        info!("Orchestrator shut down");
    }
}
