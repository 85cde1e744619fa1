// Job Models
// The status record a client polls while a build runs

use crate::pipeline::{BuildEvent, LogLevel, StageName};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Highest progress a job reports before it is marked completed
const RUNNING_PROGRESS_CAP: u8 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Running,
    Completed,
}

/// One build attempt.
///
/// Once the status is terminal the record no longer changes, and exactly one
/// of `error` and `output` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub steps: HashMap<StageName, StepState>,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    /// UNIX seconds
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
}

impl Job {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: JobStatus::Running,
            progress: 0,
            steps: HashMap::new(),
            logs: Vec::new(),
            error: None,
            output: None,
            created_at: unix_now(),
            finished_at: None,
        }
    }

    /// Fold one pipeline event into the record. Ignored once terminal.
    pub fn apply(&mut self, event: &BuildEvent) {
        if self.status.is_terminal() {
            return;
        }

        match event {
            BuildEvent::StageStarted { stage } => {
                self.steps.insert(*stage, StepState::Running);
            }
            BuildEvent::StageCompleted {
                stage, progress, ..
            } => {
                self.steps.insert(*stage, StepState::Completed);
                let capped = (*progress).min(RUNNING_PROGRESS_CAP);
                self.progress = self.progress.max(capped);
            }
            BuildEvent::Log { level, message } => {
                let line = match level {
                    LogLevel::Info => message.clone(),
                    LogLevel::Warning => format!("WARNING: {}", message),
                    LogLevel::Error => format!("ERROR: {}", message),
                };
                self.logs.push(line);
            }
        }
    }

    pub fn complete(&mut self, output: PathBuf) {
        if self.status.is_terminal() {
            return;
        }
        self.logs
            .push(format!("Build completed successfully: {}", output.display()));
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.output = Some(output);
        self.finished_at = Some(unix_now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        let error = error.into();
        self.logs.push(format!("Build failed: {}", error));
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(unix_now());
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            created_at: self.created_at,
        }
    }
}

/// Listing entry for a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub created_at: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
