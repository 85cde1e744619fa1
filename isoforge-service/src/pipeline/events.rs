// Build Events
// Progress reporting emitted by the pipeline while a build runs

use super::models::StageName;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for build progress events
pub type ProgressSender = mpsc::UnboundedSender<BuildEvent>;

/// Receiver for build progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<BuildEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a build, in stage-execution order
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    /// Stage began executing
    StageStarted { stage: StageName },

    /// Stage finished successfully
    StageCompleted {
        stage: StageName,
        progress: u8,
        duration: Duration,
    },

    /// Human-readable progress message
    Log { level: LogLevel, message: String },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl BuildEvent {
    pub fn stage_started(stage: StageName) -> Self {
        Self::StageStarted { stage }
    }

    pub fn stage_completed(stage: StageName, duration: Duration) -> Self {
        Self::StageCompleted {
            stage,
            progress: stage.progress(),
            duration,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Log {
            level: LogLevel::Error,
            message: message.into(),
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: BuildEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: BuildEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: BuildEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
