// Pipeline Errors
// Stage failures and their underlying causes

use super::models::StageName;
use crate::runners::CommandError;

use std::io;
use thiserror::Error;

/// Why a stage failed
#[derive(Debug, Error)]
pub enum BuildError {
    /// An external tool failed
    #[error("{action}: {source}")]
    Command {
        action: String,
        #[source]
        source: CommandError,
    },

    /// Missing tools or network
    #[error("{0}")]
    Environment(String),

    /// Signature or digest mismatch
    #[error("{0}")]
    Integrity(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    InvalidImage(String),
}

impl BuildError {
    pub fn command(action: impl Into<String>) -> impl FnOnce(CommandError) -> BuildError {
        let action = action.into();
        move |source| BuildError::Command { action, source }
    }

    /// stderr of the failing invocation, when the failure came from one
    pub fn command_stderr(&self) -> Option<&str> {
        match self {
            BuildError::Command { source, .. } => source.stderr(),
            _ => None,
        }
    }
}

/// A failed stage with its cause
#[derive(Debug, Error)]
#[error("{stage} stage failed: {source}")]
pub struct StageError {
    pub stage: StageName,
    #[source]
    pub source: BuildError,
}

pub(crate) trait IoResultExt<T> {
    fn io_context<F>(self, context: F) -> Result<T, BuildError>
    where
        F: FnOnce() -> String;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn io_context<F>(self, context: F) -> Result<T, BuildError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| BuildError::Io {
            context: context(),
            source,
        })
    }
}
