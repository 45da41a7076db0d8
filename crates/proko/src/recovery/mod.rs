//! Stale-job recovery: the startup pass and the in-process watchdog.

pub mod stale;
pub mod watchdog;

pub use stale::{
    RecoveryPolicy, RecoveryReport, StaleJobRecovery, INTERRUPTED_MESSAGE, TIMED_OUT_MESSAGE,
};
pub use watchdog::Watchdog;
