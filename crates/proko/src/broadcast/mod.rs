//! Broadcasting modules for real-time event streaming.
//!
//! These broadcasters can be used by any integration (HTTP server-sent
//! events, desktop shells, tests) that prefers push over polling.

pub mod job_progress;
pub mod log_broadcaster;

pub use job_progress::{JobEventKind, JobProgressBroadcaster, JobProgressEvent};
pub use log_broadcaster::{BroadcastLayer, LogBroadcaster, LogEvent};
