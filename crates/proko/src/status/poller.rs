//! Client-side polling discipline.
//!
//! Poll every 2-3 seconds while any job of the resource is processing; stop
//! once all are idle or terminal. A first fetch that already shows
//! `processing` (the client reloaded mid-run) simply resumes polling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::PollingConfig;
use crate::error::PollError;

use super::service::{ResourceStatus, StatusService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingPolicy {
    interval: Duration,
}

impl PollingPolicy {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(2500);
    pub const MIN_INTERVAL: Duration = Duration::from_millis(2000);
    pub const MAX_INTERVAL: Duration = Duration::from_millis(3000);

    /// The interval is clamped to 2-3 s.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.clamp(Self::MIN_INTERVAL, Self::MAX_INTERVAL),
        }
    }

    pub fn from_config(config: &PollingConfig) -> Self {
        Self::new(Duration::from_millis(config.interval_ms))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn should_poll(&self, status: &ResourceStatus) -> bool {
        status.any_processing()
    }
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_INTERVAL)
    }
}

/// Where a poller reads status from: the in-process service, or a client
/// wrapping an HTTP endpoint.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, resource_id: &str) -> Result<ResourceStatus, PollError>;
}

#[async_trait]
impl StatusSource for StatusService {
    async fn fetch_status(&self, resource_id: &str) -> Result<ResourceStatus, PollError> {
        Ok(self.get_status(resource_id))
    }
}

#[async_trait]
impl<T: StatusSource + ?Sized> StatusSource for Arc<T> {
    async fn fetch_status(&self, resource_id: &str) -> Result<ResourceStatus, PollError> {
        (**self).fetch_status(resource_id).await
    }
}

pub struct Poller<S> {
    source: S,
    policy: PollingPolicy,
    max_polls: Option<u32>,
}

impl<S: StatusSource> Poller<S> {
    pub fn new(source: S, policy: PollingPolicy) -> Self {
        Self {
            source,
            policy,
            max_polls: None,
        }
    }

    /// Gives up with [`PollError::GaveUp`] after `max_polls` fetches.
    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = Some(max_polls);
        self
    }

    pub async fn poll_until_settled(&self, resource_id: &str) -> Result<ResourceStatus, PollError> {
        self.poll_with(resource_id, |_| {}).await
    }

    /// Like [`poll_until_settled`](Self::poll_until_settled), handing every
    /// fetched status to `on_update`.
    pub async fn poll_with<F>(
        &self,
        resource_id: &str,
        mut on_update: F,
    ) -> Result<ResourceStatus, PollError>
    where
        F: FnMut(&ResourceStatus) + Send,
    {
        let mut polls = 0u32;
        loop {
            let status = self.source.fetch_status(resource_id).await?;
            polls += 1;
            on_update(&status);

            if !self.policy.should_poll(&status) {
                return Ok(status);
            }
            if self.max_polls.is_some_and(|max| polls >= max) {
                return Err(PollError::GaveUp { polls });
            }
            tokio::time::sleep(self.policy.interval()).await;
        }
    }
}
