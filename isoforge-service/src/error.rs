// Service Errors
// Error type shared by the job registry, configuration and workspace layers

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The build request was rejected before a job was created
    #[error("Invalid build request: {0}")]
    Validation(String),

    #[error("Build not found: {0}")]
    NotFound(String),

    /// The job exists but has not completed yet
    #[error("Build {id} is not complete (status: {status})")]
    NotReady { id: String, status: String },

    /// The job completed but its artifact is gone from disk
    #[error("Artifact for build {id} not found at {}", .path.display())]
    ArtifactMissing { id: String, path: PathBuf },

    #[error("Workspace directory {} is unusable: {source}", .path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}
