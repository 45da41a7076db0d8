//! Phase executors with scripted behavior.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use proko::{Phase, PhaseContext, PhaseError, PhaseExecutor};

/// Writes one artifact and succeeds.
pub struct Step {
    pub runs: Arc<AtomicUsize>,
}

impl Step {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl PhaseExecutor for Step {
    async fn execute(&self, ctx: &PhaseContext) -> Result<(), PhaseError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        ctx.artifacts.write(
            "product",
            serde_json::json!({ "phase": ctx.phase, "index": ctx.phase_index }),
        )?;
        Ok(())
    }
}

/// Writes one artifact and then fails.
pub struct Failing {
    pub message: String,
}

#[async_trait]
impl PhaseExecutor for Failing {
    async fn execute(&self, ctx: &PhaseContext) -> Result<(), PhaseError> {
        ctx.artifacts.write("product", serde_json::json!({ "partial": true }))?;
        Err(PhaseError::new(self.message.clone()))
    }
}

/// Shared switch for [`Gated`] phases.
#[derive(Clone, Default)]
pub struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

impl Gate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves once a gated phase has started and written its artifact.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.release.notify_one();
    }

    pub fn phase(&self, name: &str) -> Phase {
        Phase::new(name, Gated { gate: self.clone() })
    }
}

/// Writes one artifact, then blocks until its gate opens.
pub struct Gated {
    gate: Gate,
}

#[async_trait]
impl PhaseExecutor for Gated {
    async fn execute(&self, ctx: &PhaseContext) -> Result<(), PhaseError> {
        ctx.artifacts.write("product", serde_json::json!({ "phase": ctx.phase }))?;
        self.gate.entered.notify_one();
        self.gate.release.notified().await;
        Ok(())
    }
}

/// `n` succeeding phases named `phase-1` .. `phase-n`.
pub fn steps(n: usize) -> Vec<Phase> {
    (1..=n)
        .map(|i| Phase::new(format!("phase-{}", i), Step::new()))
        .collect()
}
