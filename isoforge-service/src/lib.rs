// isoforge Service Library
// Build orchestration for unattended-install Ubuntu Server images

pub mod config;
pub mod error;
pub mod jobs;
pub mod pipeline;
pub mod runners;
pub mod userdata;
pub mod workspace;

// Re-export commonly used types
pub use config::{ServiceConfig, DEFAULT_SIGNING_KEY};
pub use error::{ServiceError, ServiceResult};
pub use workspace::Workspace;

// Re-export job types
pub use jobs::{Job, JobRegistry, JobStatus, JobSummary, StepState};

// Re-export pipeline types
pub use pipeline::{
    progress_channel, BuildError, BuildEvent, BuildPipeline, BuildRequest, ImageMeta, LogLevel,
    PipelineSettings, ProgressReceiver, ProgressSender, Release, ReleaseFamily, SourceMode,
    StageError, StageName,
};

// Re-export runner types
pub use runners::{CommandError, CommandOutput, CommandRunner, Invocation, SystemRunner};
