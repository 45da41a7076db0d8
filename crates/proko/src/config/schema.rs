use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::JobType;
use crate::recovery::RecoveryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Defaults to `~/.proko/data/proko.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

impl Config {
    pub fn database_path(&self) -> Option<PathBuf> {
        match self.database_path {
            Some(ref path) => Some(PathBuf::from(path)),
            None => crate::db::default_database_path(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: None,
            runner: RunnerConfig::default(),
            recovery: RecoveryConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_progress_channel_capacity")]
    pub progress_channel_capacity: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_max_concurrent_jobs() -> usize {
    num_cpus::get()
}

fn default_progress_channel_capacity() -> usize {
    100
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

impl RunnerConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            progress_channel_capacity: default_progress_channel_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Age of `last_updated` after which the watchdog treats a processing
    /// record as stuck.
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,
    /// Age threshold for the startup pass. 0 resolves every processing
    /// record, since a fresh single-node process owns none of them.
    #[serde(default)]
    pub startup_threshold_secs: u64,
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    #[serde(default)]
    pub default_policy: RecoveryPolicy,
    #[serde(default)]
    pub policies: HashMap<JobType, RecoveryPolicy>,
}

fn default_staleness_threshold_secs() -> u64 {
    600
}

fn default_watchdog_interval_secs() -> u64 {
    60
}

impl RecoveryConfig {
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    pub fn startup_threshold(&self) -> Duration {
        Duration::from_secs(self.startup_threshold_secs)
    }

    /// `None` when the watchdog is disabled.
    pub fn watchdog_interval(&self) -> Option<Duration> {
        (self.watchdog_interval_secs > 0).then(|| Duration::from_secs(self.watchdog_interval_secs))
    }

    pub fn policy_for(&self, job_type: JobType) -> RecoveryPolicy {
        self.policies
            .get(&job_type)
            .copied()
            .unwrap_or(self.default_policy)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_secs: default_staleness_threshold_secs(),
            startup_threshold_secs: 0,
            watchdog_interval_secs: default_watchdog_interval_secs(),
            default_policy: RecoveryPolicy::default(),
            policies: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    2500
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}
