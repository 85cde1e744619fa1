use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use isoforge_service::userdata;

/// Check an autoinstall user-data file
#[derive(Args, Debug)]
pub struct CheckUserDataArgs {
    /// Path to the user-data file
    pub file: PathBuf,
}

pub fn execute(args: CheckUserDataArgs) -> Result<()> {
    let path = &args.file;

    if !path.exists() {
        color_eyre::eyre::bail!("User-data file not found: {}", path.display());
    }

    output::status("Checking", &path.display().to_string());
    let content = std::fs::read(path)?;

    match userdata::validate(&content) {
        Ok(()) => {
            if !content.starts_with(userdata::CLOUD_CONFIG_HEADER.as_bytes()) {
                output::warning("missing '#cloud-config' header; builds add it automatically");
            }
            output::success("User-data is valid");
            Ok(())
        }
        Err(e) => {
            output::failure(&e.to_string());
            std::process::exit(1);
        }
    }
}
