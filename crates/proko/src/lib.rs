pub mod artifact;
pub mod broadcast;
pub mod cancel;
pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod recovery;
pub mod runner;
pub mod status;
pub mod store;
pub mod telemetry;

pub use artifact::{Artifact, ArtifactSink, ArtifactStore};
pub use broadcast::{JobEventKind, JobProgressBroadcaster, JobProgressEvent, LogBroadcaster};
pub use cancel::{CancelOutcome, CancellationCoordinator};
pub use config::{load_config, Config};
pub use error::{ArtifactError, ConfigError, PollError, ProkoError, Result, StartError, StoreError};
pub use job::{
    FailureCleanup, JobErrorInfo, JobKey, JobRecord, JobStatus, JobType, JobUpdate, Phase,
    PhaseContext, PhaseError, PhaseExecutor, PhaseRegistry,
};
pub use orchestrator::Orchestrator;
pub use recovery::{RecoveryPolicy, RecoveryReport, StaleJobRecovery, Watchdog};
pub use runner::JobRunner;
pub use status::{Poller, PollingPolicy, ResourceStatus, StatusService, StatusSource};
pub use store::JobRecordStore;
