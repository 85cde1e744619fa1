pub mod models;
pub mod registry;

pub use models::{Job, JobStatus, JobSummary, StepState};
pub use registry::JobRegistry;
