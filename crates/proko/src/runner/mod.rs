//! Job runner: executes phase lists in the background, one invocation per key.

mod active;
pub mod job_runner;

pub use job_runner::{JobRunner, RunOutcome};
