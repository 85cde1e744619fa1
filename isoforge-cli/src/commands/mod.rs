pub mod build;
pub mod check_user_data;
pub mod serve;

use std::path::{Path, PathBuf};

use color_eyre::Result;
use isoforge_service::ServiceConfig;

/// Load the config file (or defaults) and apply a workspace override
pub fn load_config(path: Option<&Path>, workspace: Option<PathBuf>) -> Result<ServiceConfig> {
    let config = ServiceConfig::load(path)?;
    Ok(match workspace {
        Some(root) => config.with_workspace_root(root),
        None => config,
    })
}
