//! Status API and the polling contract clients follow.

pub mod poller;
pub mod service;

pub use poller::{Poller, PollingPolicy, StatusSource};
pub use service::{ResourceStatus, StatusService};
