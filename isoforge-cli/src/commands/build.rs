use crate::output;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use color_eyre::Result;

use isoforge_service::{
    progress_channel, userdata, BuildEvent, BuildPipeline, BuildRequest, LogLevel,
    PipelineSettings, Release, SystemRunner, Workspace,
};

/// Build one image in-process and stream its progress
#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Local source image
    #[arg(long, value_name = "PATH", required_unless_present = "release")]
    pub source_iso: Option<PathBuf>,

    /// Release to download (focal, jammy, noble); with --source-iso, overrides
    /// the release read from the image name
    #[arg(long, value_name = "NAME")]
    pub release: Option<String>,

    /// Output image name (placed in the download cache) or absolute path
    #[arg(long, short = 'o', value_name = "NAME")]
    pub output: String,

    /// Autoinstall user-data file
    #[arg(long, value_name = "FILE")]
    pub user_data: PathBuf,

    /// Extra package to bundle (can be repeated)
    #[arg(long = "package", short = 'p', value_name = "PKG")]
    pub packages: Vec<String>,

    /// Boot the HWE kernel
    #[arg(long)]
    pub hwe: bool,

    /// Refresh md5sum.txt instead of clearing it
    #[arg(long)]
    pub md5: bool,

    /// Verify the downloaded image against the signed SHA256SUMS
    #[arg(long)]
    pub verify: bool,

    /// Workspace directory
    #[arg(long, short = 'w', value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// YAML configuration file
    #[arg(long, short = 'c', value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl BuildArgs {
    fn request(&self, user_data: &[u8]) -> Result<BuildRequest> {
        let release = self
            .release
            .as_deref()
            .map(str::parse::<Release>)
            .transpose()?;

        let request = match (&self.source_iso, release) {
            (Some(path), release) => {
                let mut request = BuildRequest::local(path, self.output.clone());
                request.release = release;
                request
            }
            (None, Some(release)) => BuildRequest::download(release, self.output.clone()),
            (None, None) => color_eyre::eyre::bail!("Either --source-iso or --release is required"),
        };

        let request = request
            .with_user_data(userdata::with_cloud_config_header(user_data))
            .with_packages(self.packages.iter().cloned())
            .with_hwe_kernel(self.hwe)
            .with_checksum_update(self.md5)
            .with_signature_verification(self.verify);
        request.validate()?;
        Ok(request)
    }
}

pub async fn execute(args: BuildArgs) -> Result<()> {
    let config = super::load_config(args.config.as_deref(), args.workspace.clone())?;

    if !args.user_data.exists() {
        color_eyre::eyre::bail!("User-data file not found: {}", args.user_data.display());
    }
    let user_data = std::fs::read(&args.user_data)?;
    userdata::validate(&user_data)?;
    let request = args.request(&user_data)?;
    tracing::debug!(
        destination = %request.destination,
        packages = request.packages.len(),
        "build request accepted"
    );

    let workspace = Workspace::new(&config.workspace.root);
    workspace.create()?;
    output::status("Workspace", &workspace.root().display().to_string());

    let (tx, mut rx) = progress_channel();
    let runner = Arc::new(SystemRunner::from_config(&config.commands));
    let pipeline = BuildPipeline::new(runner, workspace)
        .with_settings(PipelineSettings::from_config(&config))
        .with_progress(tx);

    println!();
    output::header(&format!("Building {}", args.output));

    // Spawn the build in the background
    let build_handle = tokio::spawn(async move { pipeline.execute(&request).await });

    // Process events in the foreground
    while let Some(event) = rx.recv().await {
        match &event {
            BuildEvent::StageStarted { stage } => {
                output::stage_started(stage.as_str(), stage.progress());
            }
            BuildEvent::StageCompleted {
                stage, duration, ..
            } => {
                output::stage_completed(stage.as_str(), *duration);
            }
            BuildEvent::Log { level, message } => match level {
                LogLevel::Error => output::error(message),
                LogLevel::Warning => output::warning(message),
                LogLevel::Info => output::build_log(message),
            },
        }
    }

    println!();
    match build_handle.await? {
        Ok(image) => {
            output::success(&format!("Image written to {}", image.display()));
            Ok(())
        }
        Err(e) => {
            output::failure(&e.to_string());
            std::process::exit(1);
        }
    }
}
