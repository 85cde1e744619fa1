// Service Configuration
// YAML-backed settings for the workspace, command runner, release mirror and API server

use crate::error::{ServiceError, ServiceResult};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ubuntu archive signing key used to verify release checksum manifests
pub const DEFAULT_SIGNING_KEY: &str = "843938DF228D22F7B3742BC0D94AA3F0EFE21092";

/// Top-level configuration, every section optional in the file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub workspace: WorkspaceConfig,
    pub commands: CommandConfig,
    pub release: ReleaseConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Base directory for all build trees (default: <cache dir>/isoforge)
    pub root: PathBuf,
    /// Give every job its own tree under `<root>/jobs/<id>`
    pub isolate_jobs: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        let root = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("isoforge");

        Self {
            root,
            isolate_jobs: true,
        }
    }
}

/// Severity used when logging successful command invocations
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvocationLogLevel {
    Trace,
    #[default]
    Debug,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandConfig {
    pub log_invocations: bool,
    pub log_level: InvocationLogLevel,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
    /// Per-attempt timeout; `None` lets commands run as long as they need
    pub timeout_secs: Option<u64>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            log_invocations: true,
            log_level: InvocationLogLevel::Debug,
            retry_attempts: 3,
            retry_delay_secs: 5,
            timeout_secs: None,
        }
    }
}

impl CommandConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReleaseConfig {
    /// Release mirror; the codename is appended directly
    pub mirror_url: String,
    pub keyserver: String,
    pub signing_key: String,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            mirror_url: "https://releases.ubuntu.com/".to_string(),
            keyserver: "hkp://keyserver.ubuntu.com".to_string(),
            signing_key: DEFAULT_SIGNING_KEY.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Parse configuration from a YAML string
    pub fn from_yaml(content: &str) -> ServiceResult<Self> {
        serde_yaml::from_str(content).map_err(|e| ServiceError::Config(e.to_string()))
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> ServiceResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ServiceError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Load from `path` when given, otherwise fall back to defaults
    pub fn load(path: Option<&Path>) -> ServiceResult<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace.root = root.into();
        self
    }
}
