pub mod api;
pub mod error;
pub mod handlers;

pub use api::RpcServer;
pub use error::{RpcError, RpcResult};
pub use handlers::GenerateRequest;

// Re-export types needed by clients
pub use isoforge_service::{Job, JobRegistry, JobStatus, JobSummary};
pub use isoforge_service;
