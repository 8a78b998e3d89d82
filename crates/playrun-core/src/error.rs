//! Error types for the runner core

use crate::types::RunId;
use thiserror::Error;

/// Runner error type
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Unknown job or unusable job catalog
    #[error("Launch error: {0}")]
    Launch(String),

    /// An exclusive job already has an active run
    #[error("Job {job} is already running as {holder}")]
    AdmissionConflict { job: String, holder: RunId },

    /// The OS refused to create the child process
    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(String),

    /// A run's metadata record could not be written
    #[error("Failed to persist metadata for run {run_id}: {reason}")]
    MetadataPersist { run_id: RunId, reason: String },

    /// A signal could not be delivered
    #[error("Termination error: {0}")]
    Termination(String),

    /// A secret file could not be removed
    #[error("Failed to remove secret file {path}: {reason}")]
    SecretCleanup { path: String, reason: String },

    /// Unknown run id
    #[error("Run {0} not found")]
    NotFound(RunId),

    /// The run has already finished
    #[error("Run {0} is no longer running")]
    Gone(RunId),

    /// A run with this id is already active
    #[error("Run {0} is already active")]
    DuplicateRun(RunId),

    /// The caller-supplied options could not be translated
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for runner operations
pub type Result<T> = std::result::Result<T, RunnerError>;

impl RunnerError {
    /// Create a launch error for a job missing from the catalog
    pub fn unknown_job(job: &str) -> Self {
        Self::Launch(format!("Job {} not found", job))
    }

    /// Create a metadata persistence error for a run
    pub fn persist(run_id: &RunId, reason: impl ToString) -> Self {
        Self::MetadataPersist {
            run_id: run_id.clone(),
            reason: reason.to_string(),
        }
    }
}

impl From<nix::errno::Errno> for RunnerError {
    fn from(errno: nix::errno::Errno) -> Self {
        Self::Io(std::io::Error::from(errno))
    }
}
