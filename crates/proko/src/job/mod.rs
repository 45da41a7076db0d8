//! Job data model and phase definitions.

pub mod phase;
pub mod record;

pub use phase::{FailureCleanup, Phase, PhaseContext, PhaseError, PhaseExecutor, PhaseRegistry};
pub use record::{JobErrorInfo, JobKey, JobProgress, JobRecord, JobStatus, JobType, JobUpdate};
