//! Phases: the ordered units of work a job runs, and the executor seam
//! through which parsing, AI generation and deck assembly plug in.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::record::{JobKey, JobType};
use crate::artifact::ArtifactSink;
use crate::error::ArtifactError;

/// Error raised by a phase executor. Stored verbatim on the failed record.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct PhaseError {
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl PhaseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Converts a caught panic payload into a phase error.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Self::new(format!("phase panicked: {}", message))
    }
}

impl From<ArtifactError> for PhaseError {
    fn from(err: ArtifactError) -> Self {
        PhaseError::new(format!("failed to persist partial result: {}", err))
    }
}

/// What happens to a failed phase's own artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureCleanup {
    /// Keep them; a retry may reuse them or an operator may inspect them.
    #[default]
    Keep,
    /// Delete what the failing phase wrote in this invocation.
    DiscardPhase,
}

/// Everything a phase executor gets to see about the invocation it runs in.
pub struct PhaseContext {
    pub key: JobKey,
    pub job_id: String,
    pub phase: String,
    pub phase_index: u32,
    pub total_phases: u32,
    pub artifacts: ArtifactSink,
}

/// One step of a job: document parsing, category extraction, item generation...
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self, ctx: &PhaseContext) -> Result<(), PhaseError>;

    fn failure_cleanup(&self) -> FailureCleanup {
        FailureCleanup::Keep
    }
}

/// A named phase bound to its executor.
#[derive(Clone)]
pub struct Phase {
    pub name: String,
    pub executor: Arc<dyn PhaseExecutor>,
}

impl Phase {
    pub fn new(name: impl Into<String>, executor: impl PhaseExecutor + 'static) -> Self {
        Self {
            name: name.into(),
            executor: Arc::new(executor),
        }
    }

    pub fn from_arc(name: impl Into<String>, executor: Arc<dyn PhaseExecutor>) -> Self {
        Self {
            name: name.into(),
            executor,
        }
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase").field("name", &self.name).finish()
    }
}

type PlanFn = dyn Fn(&str) -> Vec<Phase> + Send + Sync;

/// Maps each job type to the phase list it runs for a given resource.
///
/// Recovery needs this to re-run an abandoned job after a process restart,
/// when the original phase list no longer exists in memory.
#[derive(Default, Clone)]
pub struct PhaseRegistry {
    plans: HashMap<JobType, Arc<PlanFn>>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, job_type: JobType, plan: F) -> &mut Self
    where
        F: Fn(&str) -> Vec<Phase> + Send + Sync + 'static,
    {
        self.plans.insert(job_type, Arc::new(plan));
        self
    }

    pub fn contains(&self, job_type: JobType) -> bool {
        self.plans.contains_key(&job_type)
    }

    /// Phase list for a key, or `None` when its job type has no plan.
    pub fn phases_for(&self, key: &JobKey) -> Option<Vec<Phase>> {
        self.plans
            .get(&key.job_type)
            .map(|plan| plan(&key.resource_id))
    }
}
