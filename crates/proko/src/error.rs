use std::path::PathBuf;
use thiserror::Error;

use crate::job::{JobKey, JobStatus};

#[derive(Error, Debug)]
pub enum ProkoError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Start rejected: {0}")]
    Start(#[from] StartError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Invalid status transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: JobKey,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Resource '{resource_id}' has a job in progress ({job_type})")]
    ResourceBusy {
        resource_id: String,
        job_type: String,
    },
}

#[derive(Error, Debug)]
pub enum StartError {
    #[error("Job {job_id} is already processing for {key}")]
    AlreadyProcessing { key: JobKey, job_id: String },

    #[error("Job {job_id} for {key} is still settling after cancellation")]
    StillSettling { key: JobKey, job_id: String },

    #[error("No phase plan registered for job type '{0}'")]
    NoPlan(String),

    #[error("Job runner is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Failed to serialize artifact payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Artifact store lock poisoned")]
    LockPoisoned,
}

#[derive(Error, Debug)]
pub enum PollError {
    #[error("Failed to fetch status: {0}")]
    Fetch(String),

    #[error("Still processing after {polls} polls")]
    GaveUp { polls: u32 },
}

pub type Result<T> =std::result::Result<T, ProkoError>;
