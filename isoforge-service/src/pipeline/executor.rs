// Build Pipeline
// Runs the ordered build stages for one request against one workspace

use super::bootcfg::{
    self, AUTOINSTALL_KEYWORD, GRUB_NOCLOUD, ISOLINUX_NOCLOUD,
};
use super::checksum;
use super::error::{BuildError, IoResultExt, StageError};
use super::events::{BuildEvent, EventSender, ProgressSender};
use super::models::{BuildRequest, ImageMeta, Release, ReleaseFamily, SourceMode, StageName};
use super::packages;
use super::recipe::{self, IsoRecipe, ISOHYBRID_MBR};
use crate::config::ServiceConfig;
use crate::runners::{CommandError, CommandOutput, CommandRunner, Invocation};
use crate::workspace::{Workspace, GRUB_CONFIG, LOOPBACK_CONFIG};

use regex::Regex;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Matches release image names on the mirror listing
pub const ISO_NAME_PATTERN: &str = r"ubuntu-(\d{2}\.04)(\.\d+)?-live-server-amd64\.iso";

/// Label codename for images whose release cannot be determined
const UNKNOWN_RELEASE: &str = "unknown";

/// A tool the pipeline needs and the packages that provide it
struct RequiredTool {
    command: &'static str,
    packages: &'static [&'static str],
}

const REQUIRED_TOOLS: &[RequiredTool] = &[
    RequiredTool {
        command: "xorriso",
        packages: &["xorriso", "isolinux", "binutils", "fakeroot"],
    },
    RequiredTool {
        command: "sed",
        packages: &["sed"],
    },
    RequiredTool {
        command: "curl",
        packages: &["curl"],
    },
    RequiredTool {
        command: "gpg",
        packages: &["gpg"],
    },
    RequiredTool {
        command: "7z",
        packages: &["p7zip-full"],
    },
    RequiredTool {
        command: "dpkg-scanpackages",
        packages: &["dpkg-dev"],
    },
    RequiredTool {
        command: "aptitude",
        packages: &["aptitude"],
    },
];

/// Knobs the stages read; everything else comes from the request
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Release mirror; the codename is appended directly
    pub mirror_url: String,
    pub keyserver: String,
    pub signing_key: String,
    /// Attempts for retried invocations (network, package manager, key fetch)
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// Hybrid MBR template required by legacy images
    pub isohybrid_mbr: PathBuf,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

impl PipelineSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            mirror_url: config.release.mirror_url.clone(),
            keyserver: config.release.keyserver.clone(),
            signing_key: config.release.signing_key.clone(),
            retry_attempts: config.commands.retry_attempts,
            retry_delay: config.commands.retry_delay(),
            isohybrid_mbr: PathBuf::from(ISOHYBRID_MBR),
        }
    }

    fn release_url(&self, release: Release) -> String {
        format!("{}{}", self.mirror_url, release.codename())
    }
}

/// Executes the build stages in order, aborting on the first failure
pub struct BuildPipeline {
    runner: Arc<dyn CommandRunner>,
    workspace: Workspace,
    settings: PipelineSettings,
    progress: Option<ProgressSender>,
}

impl BuildPipeline {
    pub fn new(runner: Arc<dyn CommandRunner>, workspace: Workspace) -> Self {
        Self {
            runner,
            workspace,
            settings: PipelineSettings::default(),
            progress: None,
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set progress event sender
    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Run every applicable stage and return the path of the produced image
    pub async fn execute(&self, request: &BuildRequest) -> Result<PathBuf, StageError> {
        let hint = release_hint(request);

        self.run_stage(StageName::Prepare, self.prepare_environment(hint))
            .await?;

        let (image, release) = match &request.source {
            SourceMode::Download { release } => {
                let image = self
                    .run_stage(StageName::Download, self.download_image(*release))
                    .await?;
                if request.verify_signature {
                    self.run_stage(StageName::Verify, self.verify_image(&image))
                        .await?;
                }
                (image, Some(*release))
            }
            SourceMode::Local { path } => {
                self.run_stage(
                    StageName::Upload,
                    self.use_local_image(path, hint, request.verify_signature),
                )
                .await?
            }
        };
        let family = release.map_or(ReleaseFamily::Current, |r| r.family());

        self.run_stage(StageName::Extract, self.extract_image(family, &image))
            .await?;
        self.run_stage(
            StageName::Inject,
            self.inject_config(family, &request.user_data),
        )
        .await?;

        if !request.packages.is_empty() {
            self.run_stage(StageName::Packages, self.prepare_packages(&request.packages))
                .await?;
        }

        self.run_stage(StageName::Kernel, self.add_kernel_parameters(family))
            .await?;
        self.run_stage(StageName::Hwe, self.configure_hwe(family, request.hwe_kernel))
            .await?;
        self.run_stage(
            StageName::Md5,
            self.update_checksums(family, request.update_checksums),
        )
        .await?;

        self.run_stage(
            StageName::Repackage,
            self.repackage(family, release, &request.destination),
        )
        .await
    }

    /// Wrap one stage with start/completion events and stage-qualified errors
    async fn run_stage<T, F>(&self, stage: StageName, work: F) -> Result<T, StageError>
    where
        F: Future<Output = Result<T, BuildError>>,
    {
        tracing::info!(%stage, "stage started");
        self.progress.send_event(BuildEvent::stage_started(stage));
        self.progress.send_event(BuildEvent::info(stage.start_message()));

        let start = Instant::now();
        match work.await {
            Ok(value) => {
                let duration = start.elapsed();
                tracing::info!(%stage, ?duration, "stage completed");
                self.progress
                    .send_event(BuildEvent::stage_completed(stage, duration));
                Ok(value)
            }
            Err(source) => {
                tracing::error!(%stage, error = %source, "stage failed");
                Err(StageError { stage, source })
            }
        }
    }

    fn log(&self, message: impl Into<String>) {
        self.progress.send_event(BuildEvent::info(message));
    }

    fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.progress.send_event(BuildEvent::warning(message));
    }

    /// Copy a failed invocation's output into the build log: stdout as
    /// info lines, then stderr as errors
    fn log_failure(&self, err: &CommandError) {
        let non_empty = |text: &str| {
            text.lines()
                .filter(|line| !line.trim().is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        };

        for line in err.stdout().map(non_empty).unwrap_or_default() {
            self.progress.send_event(BuildEvent::info(line));
        }
        for line in err.stderr().map(non_empty).unwrap_or_default() {
            self.progress.send_event(BuildEvent::error(line));
        }
    }

    async fn run(&self, invocation: Invocation) -> Result<CommandOutput, CommandError> {
        let result = self.runner.run(&invocation).await;
        if let Err(err) = &result {
            self.log_failure(err);
        }
        result
    }

    async fn run_retrying(&self, invocation: Invocation) -> Result<CommandOutput, CommandError> {
        let result = self
            .runner
            .run_with_retries(
                &invocation,
                self.settings.retry_attempts,
                self.settings.retry_delay,
            )
            .await;
        if let Err(err) = &result {
            self.log_failure(err);
        }
        result
    }

    // prepare

    async fn prepare_environment(&self, release: Option<Release>) -> Result<(), BuildError> {
        let missing: Vec<&RequiredTool> = REQUIRED_TOOLS
            .iter()
            .filter(|tool| self.runner.locate(tool.command).is_none())
            .collect();

        if missing.is_empty() {
            self.log("All required tools are installed");
        } else {
            let commands: Vec<&str> = missing.iter().map(|tool| tool.command).collect();
            self.log(format!("Missing tools: {}", commands.join(", ")));

            self.log("Checking network connectivity...");
            let ping = Invocation::parse("ping -c 1 -w 1 8.8.8.8").map_err(BuildError::command(
                "invalid connectivity check",
            ))?;
            self.run_retrying(ping).await.map_err(|e| {
                BuildError::Environment(format!("network connectivity check failed: {}", e))
            })?;

            self.log("Updating package index...");
            self.run_retrying(Invocation::new("apt-get").args(["update", "-y"]))
                .await
                .map_err(BuildError::command("failed to update package index"))?;

            let packages: Vec<&str> = missing
                .iter()
                .flat_map(|tool| tool.packages.iter().copied())
                .collect();
            self.log(format!("Installing packages: {}", packages.join(" ")));
            self.run_retrying(Invocation::new("apt-get").args(["install", "-y"]).args(packages))
                .await
                .map_err(BuildError::command("failed to install required packages"))?;
        }

        if release.map(|r| r.family()) == Some(ReleaseFamily::Legacy)
            && !self.settings.isohybrid_mbr.exists()
        {
            return Err(BuildError::Environment(format!(
                "{} not found; install the 'isolinux' package",
                self.settings.isohybrid_mbr.display()
            )));
        }

        Ok(())
    }

    // download / upload

    async fn download_image(&self, release: Release) -> Result<PathBuf, BuildError> {
        let url = self.settings.release_url(release);
        self.log(format!("Fetching release page {}", url));

        let page = self
            .run_retrying(Invocation::new("curl").args(["-fsSL", url.as_str()]))
            .await
            .map_err(BuildError::command("failed to fetch release page"))?;

        let pattern = Regex::new(ISO_NAME_PATTERN)
            .map_err(|e| BuildError::InvalidImage(format!("invalid image pattern: {}", e)))?;
        let file_name = pattern
            .find(&page.stdout)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                BuildError::InvalidImage(format!("no installer image listed at {}", url))
            })?;

        let image = self.workspace.download_file(&file_name);
        if image.is_file() {
            self.log(format!("Using cached image {}", image.display()));
            return Ok(image);
        }

        self.log(format!("Downloading {}", file_name));
        self.fetch_file(&format!("{}/{}", url, file_name), &image)
            .await?;
        self.log(format!("Saved image to {}", image.display()));
        Ok(image)
    }

    /// Download `url` to `dest` through a private partial file, so a shared
    /// download cache never exposes half-written files
    async fn fetch_file(&self, url: &str, dest: &Path) -> Result<(), BuildError> {
        let file_name = dest
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let partial = dest.with_file_name(format!(
            "{}.{}.part",
            file_name,
            uuid::Uuid::new_v4().simple()
        ));

        let fetched = self
            .run_retrying(
                Invocation::new("curl")
                    .args(["-fsSL", "-o"])
                    .path_arg(&partial)
                    .arg(url),
            )
            .await;

        if let Err(err) = fetched {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(BuildError::command(format!("failed to download {}", url))(err));
        }

        tokio::fs::rename(&partial, dest)
            .await
            .io_context(|| format!("failed to move download into {}", dest.display()))
    }

    async fn use_local_image(
        &self,
        path: &Path,
        hint: Option<Release>,
        verify_requested: bool,
    ) -> Result<(PathBuf, Option<Release>), BuildError> {
        if !path.is_file() {
            return Err(BuildError::InvalidImage(format!(
                "local image not found: {}",
                path.display()
            )));
        }

        if verify_requested {
            self.warn("Signature verification only applies to downloaded images; skipping");
        }

        match hint {
            Some(release) => {
                self.log(format!("Using local image {} ({})", path.display(), release));
            }
            None => self.warn(format!(
                "Cannot determine the release of {}, assuming a grub-only layout",
                path.display()
            )),
        }
        Ok((path.to_path_buf(), hint))
    }

    // verify

    async fn verify_image(&self, image: &Path) -> Result<(), BuildError> {
        let release = ImageMeta::parse(image)
            .and_then(|meta| meta.release)
            .ok_or_else(|| {
                BuildError::InvalidImage(format!("unrecognized image name {}", image.display()))
            })?;
        let suffix = image
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| release.codename().to_string());

        let sums = self.workspace.sha256sums_file(&suffix);
        let signature = self.workspace.sha256sums_signature(&suffix);
        let keyring = self.workspace.keyring_file(&self.settings.signing_key);
        let base_url = self.settings.release_url(release);

        if sums.is_file() && signature.is_file() {
            self.log("Using cached SHA256SUMS and SHA256SUMS.gpg");
        } else {
            self.log("Downloading SHA256SUMS and SHA256SUMS.gpg...");
            self.fetch_file(&format!("{}/SHA256SUMS", base_url), &sums)
                .await?;
            self.fetch_file(&format!("{}/SHA256SUMS.gpg", base_url), &signature)
                .await?;
        }

        if keyring.is_file() {
            self.log(format!("Using signing key from {}", keyring.display()));
        } else {
            self.log("Receiving Ubuntu signing key...");
            self.run_retrying(
                Invocation::new("gpg")
                    .args(["--no-default-keyring", "--keyring"])
                    .path_arg(&keyring)
                    .args(["--keyserver", self.settings.keyserver.as_str()])
                    .args(["--recv-keys", self.settings.signing_key.as_str()]),
            )
            .await
            .map_err(BuildError::command("failed to receive signing key"))?;
        }

        let verified = self
            .run(
                Invocation::new("gpg")
                    .arg("--keyring")
                    .path_arg(&keyring)
                    .arg("--verify")
                    .path_arg(&signature)
                    .path_arg(&sums),
            )
            .await;

        // gpg leaves a backup keyring next to the real one
        let backup = keyring.with_file_name(format!(
            "{}~",
            keyring
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        if backup.exists() {
            if let Err(e) = tokio::fs::remove_file(&backup).await {
                self.warn(format!("Failed to remove {}: {}", backup.display(), e));
            }
        }

        verified.map_err(|e| {
            BuildError::Integrity(format!("signature verification of SHA256SUMS failed: {}", e))
        })?;
        self.log("SHA256SUMS signature is valid");

        let image_path = image.to_path_buf();
        let digest = blocking(move || checksum::sha256_file(&image_path))
            .await
            .io_context(|| format!("failed to hash {}", image.display()))?;

        let manifest = tokio::fs::read_to_string(&sums)
            .await
            .io_context(|| format!("failed to read {}", sums.display()))?;

        if !checksum::manifest_lists_digest(&manifest, &digest) {
            return Err(BuildError::Integrity(format!(
                "SHA-256 digest {} of {} is not listed in SHA256SUMS",
                digest,
                image.display()
            )));
        }

        self.log(format!("Image digest {} verified", digest));
        Ok(())
    }

    // extract

    async fn extract_image(&self, family: ReleaseFamily, image: &Path) -> Result<(), BuildError> {
        let build_dir = self.workspace.build_dir();
        let invocation = recipe::extract_invocation(family, image, &build_dir);
        self.log(format!("Extracting with {}", invocation.program));

        self.run(invocation)
            .await
            .map_err(BuildError::command("failed to extract image"))?;

        let leftover = self.workspace.boot_leftover_dir();
        match family {
            ReleaseFamily::Legacy => {
                remove_dir_if_exists(&leftover)
                    .await
                    .io_context(|| format!("failed to remove {}", leftover.display()))?;
            }
            ReleaseFamily::Current => {
                let boot = self.workspace.boot_dir();
                remove_dir_if_exists(&boot)
                    .await
                    .io_context(|| format!("failed to remove {}", boot.display()))?;
                if leftover.exists() {
                    tokio::fs::rename(&leftover, &boot).await.io_context(|| {
                        format!("failed to move boot images to {}", boot.display())
                    })?;
                }
            }
        }

        let tree = build_dir.clone();
        blocking(move || make_tree_accessible(&tree))
            .await
            .io_context(|| format!("failed to set permissions under {}", build_dir.display()))?;

        self.log(format!("Extracted to {}", build_dir.display()));
        Ok(())
    }

    // inject

    async fn inject_config(&self, family: ReleaseFamily, user_data: &[u8]) -> Result<(), BuildError> {
        let user_data_file = self.workspace.user_data_file();
        tokio::fs::write(&user_data_file, user_data)
            .await
            .io_context(|| format!("failed to write {}", user_data_file.display()))?;

        let meta_data = self.workspace.meta_data_file();
        tokio::fs::write(&meta_data, b"")
            .await
            .io_context(|| format!("failed to create {}", meta_data.display()))?;

        let mut targets = vec![(self.workspace.grub_config(), GRUB_NOCLOUD)];
        if family == ReleaseFamily::Legacy {
            targets.push((self.workspace.txt_config(), ISOLINUX_NOCLOUD));
            targets.push((self.workspace.loopback_config(), GRUB_NOCLOUD));
        }
        self.patch_configs(targets).await?;

        self.log("Added user-data and NoCloud datasource");
        Ok(())
    }

    async fn patch_configs(&self, targets: Vec<(PathBuf, &'static str)>) -> Result<(), BuildError> {
        for (path, directive) in targets {
            let file = path.clone();
            let patched = blocking(move || bootcfg::patch_boot_file(&file, directive))
                .await
                .io_context(|| format!("failed to patch {}", path.display()))?;
            if patched {
                self.log(format!("Patched {}", path.display()));
            }
        }
        Ok(())
    }

    // packages

    async fn prepare_packages(&self, requested: &[String]) -> Result<(), BuildError> {
        let names = packages::normalize_package_list(requested);
        if names.is_empty() {
            self.log("Package list is empty after removing comments");
            return Ok(());
        }

        let packages_dir = self.workspace.packages_dir();
        for name in &names {
            let deps = self.resolve_dependencies(name).await?;
            if deps.is_empty() {
                self.warn(format!("No dependencies found for {}", name));
                continue;
            }

            self.log(format!("Downloading {} packages for {}", deps.len(), name));
            for dep in &deps {
                let download = Invocation::new("apt-get")
                    .args(["download", dep.as_str()])
                    .current_dir(&packages_dir);
                if let Err(e) = self.runner.run(&download).await {
                    self.warn(format!("Failed to download {}: {}", dep, e));
                }
            }
        }

        self.log("Building local package index...");
        let scan = self
            .run(Invocation::new("dpkg-scanpackages").arg("./").current_dir(&packages_dir))
            .await
            .map_err(BuildError::command("failed to scan packages"))?;
        let index_dir = packages_dir.clone();
        blocking(move || packages::write_package_index(&index_dir, &scan.stdout))
            .await
            .io_context(|| format!("failed to write package index in {}", packages_dir.display()))?;

        let script = self.workspace.script_file(packages::INSTALL_SCRIPT);
        let (script_path, script_names) = (script.clone(), names.clone());
        blocking(move || packages::write_install_script(&script_path, &script_names))
            .await
            .io_context(|| format!("failed to write {}", script.display()))?;

        self.log(format!("Prepared {} packages", names.len()));
        Ok(())
    }

    /// Dependency closure from apt-cache, falling back to aptitude's
    /// "Provided by" list when apt-cache fails or prints nothing
    async fn resolve_dependencies(&self, package: &str) -> Result<Vec<String>, BuildError> {
        let primary = Invocation::new("apt-cache").args([
            "depends",
            "--recurse",
            "--no-recommends",
            "--no-suggests",
            "--no-conflicts",
            "--no-breaks",
            "--no-replaces",
            "--no-enhances",
            "--no-pre-depends",
            package,
        ]);

        let raw = match self.runner.run(&primary).await {
            Ok(output) if !output.stdout.trim().is_empty() => output.stdout,
            _ => {
                self.log(format!("apt-cache gave nothing for {}, trying aptitude", package));
                let output = self
                    .run(Invocation::new("aptitude").args(["show", package]))
                    .await
                    .map_err(BuildError::command(format!(
                        "failed to resolve dependencies for {}",
                        package
                    )))?;
                packages::parse_provided_by(&output.stdout)
            }
        };

        Ok(packages::filter_dependencies(&raw))
    }

    // kernel / hwe

    async fn add_kernel_parameters(&self, family: ReleaseFamily) -> Result<(), BuildError> {
        let mut targets = vec![(self.workspace.grub_config(), AUTOINSTALL_KEYWORD)];
        if family == ReleaseFamily::Legacy {
            targets.push((self.workspace.loopback_config(), AUTOINSTALL_KEYWORD));
            targets.push((self.workspace.txt_config(), AUTOINSTALL_KEYWORD));
        }
        self.patch_configs(targets).await?;
        self.log("Kernel command lines request autoinstall");
        Ok(())
    }

    async fn configure_hwe(&self, family: ReleaseFamily, enabled: bool) -> Result<(), BuildError> {
        if !enabled {
            self.log("HWE kernel not requested");
            return Ok(());
        }

        let grub = self.workspace.grub_config();
        let grub_file = grub.clone();
        let content = blocking(move || bootcfg::read_if_exists(&grub_file))
            .await
            .io_context(|| format!("failed to read {}", grub.display()))?;
        if !content.as_deref().is_some_and(bootcfg::has_hwe_kernel) {
            self.warn("Source image has no HWE kernel, keeping the regular kernel");
            return Ok(());
        }

        let mut targets = vec![grub];
        if family == ReleaseFamily::Legacy {
            targets.push(self.workspace.txt_config());
            targets.push(self.workspace.loopback_config());
        }
        for path in targets {
            let file = path.clone();
            blocking(move || bootcfg::swap_kernel_file(&file))
                .await
                .io_context(|| format!("failed to update {}", path.display()))?;
        }

        self.log("Boot entries use the HWE kernel");
        Ok(())
    }

    // md5

    async fn update_checksums(&self, family: ReleaseFamily, update: bool) -> Result<(), BuildError> {
        let manifest = self.workspace.md5sum_file();
        let target = manifest.clone();
        if update {
            let mut files = vec![GRUB_CONFIG];
            if family == ReleaseFamily::Legacy {
                files.push(LOOPBACK_CONFIG);
            }
            let build_dir = self.workspace.build_dir();
            blocking(move || checksum::update_md5sum(&target, &build_dir, &files))
                .await
                .io_context(|| format!("failed to update {}", manifest.display()))?;
            self.log("Updated md5sum.txt");
        } else {
            blocking(move || checksum::clear_md5sum(&target))
                .await
                .io_context(|| format!("failed to clear {}", manifest.display()))?;
            self.log("Cleared md5sum.txt");
        }
        Ok(())
    }

    // repackage

    async fn repackage(
        &self,
        family: ReleaseFamily,
        release: Option<Release>,
        destination: &str,
    ) -> Result<PathBuf, BuildError> {
        if !destination.ends_with(".iso") {
            return Err(BuildError::InvalidImage(format!(
                "destination {} must end with .iso",
                destination
            )));
        }

        let output = self.workspace.artifact_path(destination);
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .io_context(|| format!("failed to create {}", parent.display()))?;
        }

        let codename = release.map_or(UNKNOWN_RELEASE, |r| r.codename());
        let recipe = IsoRecipe::new(family, recipe::volume_label(codename), output.clone());
        self.log(format!("Writing {} (label {})", output.display(), recipe.label()));

        self.run(recipe.invocation(&self.workspace.build_dir()))
            .await
            .map_err(BuildError::command("failed to repackage image"))?;

        Ok(output)
    }
}

/// Release a request targets before the image is inspected: the explicit one,
/// the download release, or whatever a local image's file name says
fn release_hint(request: &BuildRequest) -> Option<Release> {
    request.release.or_else(|| match &request.source {
        SourceMode::Download { release } => Some(*release),
        SourceMode::Local { path } => ImageMeta::parse(path).and_then(|meta| meta.release),
    })
}

/// Run filesystem work on the blocking pool
async fn blocking<T, F>(work: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        .and_then(|result| result)
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Extracted trees come out read-only; open everything up to 0755
#[cfg(unix)]
fn make_tree_accessible(root: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.map_err(io::Error::from)?;
        if entry.file_type().is_symlink() {
            continue;
        }
        std::fs::set_permissions(entry.path(), std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_tree_accessible(_root: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::events::{progress_channel, LogLevel, ProgressReceiver};
    use crate::runners::scripted::{fail, ok, ScriptedRunner};
    use std::fs;
    use tempfile::TempDir;

    const IMAGE_NAME: &str = "ubuntu-22.04.5-live-server-amd64.iso";
    const FOCAL_IMAGE_NAME: &str = "ubuntu-20.04.6-live-server-amd64.iso";

    const GRUB_CFG: &str = "\
set timeout=30
menuentry \"Try or Install Ubuntu Server\" {
\tset gfxpayload=keep
\tlinux\t/casper/vmlinuz  ---
\tinitrd\t/casper/initrd
}
menuentry \"Ubuntu Server with the HWE kernel\" {
\tlinux\t/casper/hwe-vmlinuz  ---
\tinitrd\t/casper/hwe-initrd
}
";

    const TXT_CFG: &str = "\
default live-install
label live-install
  menu label ^Install Ubuntu Server
  kernel /casper/vmlinuz
  append  initrd=/casper/initrd quiet  ---
";

    /// Value following `flag`, or the argument glued to it (`-o/path`)
    fn flag_value(inv: &Invocation, flag: &str) -> Option<String> {
        let mut args = inv.args.iter();
        while let Some(arg) = args.next() {
            if arg == flag {
                return args.next().cloned();
            }
            if let Some(rest) = arg.strip_prefix(flag) {
                if !rest.is_empty() {
                    return Some(rest.to_string());
                }
            }
        }
        None
    }

    /// Runner that fakes 7z extraction and xorriso packaging on disk
    fn image_tools() -> ScriptedRunner {
        ScriptedRunner::new()
            .on("7z", |inv| {
                let out = PathBuf::from(flag_value(inv, "-o").unwrap());
                fs::create_dir_all(out.join("boot/grub")).unwrap();
                fs::write(out.join("boot/grub/grub.cfg"), GRUB_CFG).unwrap();
                fs::write(out.join("md5sum.txt"), "1111  ./boot/grub/grub.cfg\n").unwrap();
                fs::create_dir_all(out.join("[BOOT]")).unwrap();
                fs::write(out.join("[BOOT]/1-Boot-NoEmul.img"), "mbr").unwrap();
                ok("Everything is Ok")
            })
            .on("xorriso", |inv| {
                let out = flag_value(inv, "-o").unwrap();
                fs::write(out, "repackaged").unwrap();
                ok("")
            })
    }

    /// Runner that fakes a legacy image: xorriso both extracts and repackages
    fn legacy_tools() -> ScriptedRunner {
        ScriptedRunner::new().on("xorriso", |inv| {
            if inv.args.first().map(String::as_str) == Some("-osirrox") {
                let out = PathBuf::from(inv.args.last().unwrap());
                fs::create_dir_all(out.join("boot/grub")).unwrap();
                fs::create_dir_all(out.join("isolinux")).unwrap();
                fs::create_dir_all(out.join("[BOOT]")).unwrap();
                fs::write(out.join("boot/grub/grub.cfg"), GRUB_CFG).unwrap();
                fs::write(out.join("boot/grub/loopback.cfg"), GRUB_CFG).unwrap();
                fs::write(out.join("isolinux/txt.cfg"), TXT_CFG).unwrap();
                fs::write(
                    out.join("md5sum.txt"),
                    "2222  ./boot/grub/loopback.cfg\n3333  ./casper/vmlinuz\n",
                )
                .unwrap();
                fs::write(out.join("[BOOT]/Boot-NoEmul.img"), "mbr").unwrap();
            } else {
                fs::write(flag_value(inv, "-o").unwrap(), "repackaged").unwrap();
            }
            ok("")
        })
    }

    struct Fixture {
        _dir: TempDir,
        workspace: Workspace,
        image: PathBuf,
    }

    fn fixture() -> Fixture {
        fixture_with_image(IMAGE_NAME)
    }

    fn fixture_with_image(name: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let workspace = Workspace::new(dir.path().join("ws"));
        workspace.create().unwrap();
        let image = dir.path().join(name);
        fs::write(&image, "iso image").unwrap();
        Fixture {
            _dir: dir,
            workspace,
            image,
        }
    }

    fn settings() -> PipelineSettings {
        PipelineSettings {
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1),
            ..PipelineSettings::default()
        }
    }

    fn pipeline(runner: Arc<ScriptedRunner>, fx: &Fixture) -> (BuildPipeline, ProgressReceiver) {
        pipeline_with(runner, fx, settings())
    }

    fn pipeline_with(
        runner: Arc<ScriptedRunner>,
        fx: &Fixture,
        settings: PipelineSettings,
    ) -> (BuildPipeline, ProgressReceiver) {
        let (tx, rx) = progress_channel();
        let pipeline = BuildPipeline::new(runner, fx.workspace.clone())
            .with_settings(settings)
            .with_progress(tx);
        (pipeline, rx)
    }

    fn drain(rx: &mut ProgressReceiver) -> Vec<BuildEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn completed_stages(events: &[BuildEvent]) -> Vec<StageName> {
        events
            .iter()
            .filter_map(|event| match event {
                BuildEvent::StageCompleted { stage, .. } => Some(*stage),
                _ => None,
            })
            .collect()
    }

    fn user_data() -> &'static str {
        "#cloud-config\nautoinstall:\n  version: 1\n"
    }

    #[tokio::test]
    async fn test_local_build_runs_all_mandatory_stages() {
        let fx = fixture();
        let runner = Arc::new(image_tools());
        let (pipeline, mut rx) = pipeline(runner.clone(), &fx);

        let request = BuildRequest::local(&fx.image, "out.iso").with_user_data(user_data());
        let output = pipeline.execute(&request).await.unwrap();

        assert_eq!(output, fx.workspace.download_file("out.iso"));
        assert_eq!(fs::read_to_string(&output).unwrap(), "repackaged");

        let events = drain(&mut rx);
        assert_eq!(
            completed_stages(&events),
            vec![
                StageName::Prepare,
                StageName::Upload,
                StageName::Extract,
                StageName::Inject,
                StageName::Kernel,
                StageName::Hwe,
                StageName::Md5,
                StageName::Repackage,
            ]
        );

        let grub = fs::read_to_string(fx.workspace.grub_config()).unwrap();
        assert!(grub.contains("\tlinux /casper/vmlinuz autoinstall ds=nocloud\\;s=/cdrom/ ---"));
        assert_eq!(grub.matches("autoinstall").count(), 2);
        assert_eq!(
            fs::read_to_string(fx.workspace.user_data_file()).unwrap(),
            user_data()
        );
        assert!(fx.workspace.meta_data_file().is_file());
        assert_eq!(fs::read_to_string(fx.workspace.md5sum_file()).unwrap(), "");

        // [BOOT] moved next to the build tree for the current recipe
        assert!(fx.workspace.boot_dir().join("1-Boot-NoEmul.img").is_file());
        assert!(!fx.workspace.boot_leftover_dir().exists());

        let xorriso = runner.calls_to("xorriso");
        assert_eq!(xorriso.len(), 1);
        assert_eq!(
            xorriso[0].current_dir.as_deref(),
            Some(fx.workspace.build_dir().as_path())
        );
        assert!(xorriso[0]
            .args
            .contains(&"ubuntu-server-jammy-autoinstall".to_string()));
        assert!(runner.calls_to("apt-get").is_empty());
    }

    #[tokio::test]
    async fn test_hwe_and_md5_update() {
        let fx = fixture();
        let (pipeline, _rx) = pipeline(Arc::new(image_tools()), &fx);

        let request = BuildRequest::local(&fx.image, "out.iso")
            .with_user_data(user_data())
            .with_hwe_kernel(true)
            .with_checksum_update(true);
        pipeline.execute(&request).await.unwrap();

        let grub = fs::read_to_string(fx.workspace.grub_config()).unwrap();
        assert!(!grub.contains("/casper/vmlinuz"));
        assert!(grub.contains("\tinitrd\t/casper/hwe-initrd"));

        let expected = checksum::md5_file(&fx.workspace.grub_config()).unwrap();
        assert_eq!(
            fs::read_to_string(fx.workspace.md5sum_file()).unwrap(),
            format!("{}  ./boot/grub/grub.cfg\n", expected)
        );
    }

    #[tokio::test]
    async fn test_verify_digest_mismatch_fails_before_extract() {
        let fx = fixture();
        let runner = Arc::new(image_tools().on("curl", |inv| {
            match flag_value(inv, "-o") {
                Some(dest) => {
                    let url = inv.args.last().unwrap();
                    let body = if url.ends_with("SHA256SUMS") {
                        format!("{} *{}\n", "0".repeat(64), IMAGE_NAME)
                    } else {
                        "payload".to_string()
                    };
                    fs::write(dest, body).unwrap();
                    ok("")
                }
                None => ok(&format!("<a href=\"{0}\">{0}</a>", IMAGE_NAME)),
            }
        }));
        let (pipeline, mut rx) = pipeline(runner.clone(), &fx);

        let request = BuildRequest::download(Release::Jammy, "out.iso")
            .with_user_data(user_data())
            .with_signature_verification(true);
        let err = pipeline.execute(&request).await.unwrap_err();

        assert_eq!(err.stage, StageName::Verify);
        assert!(matches!(err.source, BuildError::Integrity(_)));
        assert!(err.to_string().starts_with("verify stage failed:"));

        let events = drain(&mut rx);
        assert_eq!(
            completed_stages(&events),
            vec![StageName::Prepare, StageName::Download]
        );
        assert!(!events.contains(&BuildEvent::stage_started(StageName::Extract)));
        assert!(runner.calls_to("7z").is_empty());

        // image was fetched into the shared cache under its release name
        assert!(fx.workspace.download_file(IMAGE_NAME).is_file());
        let gpg = runner.calls_to("gpg");
        assert_eq!(gpg.len(), 2);
        assert!(gpg[0].args.contains(&"--recv-keys".to_string()));
        assert!(gpg[1].args.contains(&"--verify".to_string()));
    }

    #[tokio::test]
    async fn test_verify_accepts_listed_digest() {
        let fx = fixture();
        let cached = fx.workspace.download_file(IMAGE_NAME);
        fs::write(&cached, "iso image").unwrap();
        let digest = checksum::sha256_file(&cached).unwrap();

        let runner = Arc::new(image_tools().on("curl", move |inv| {
            match flag_value(inv, "-o") {
                Some(dest) => {
                    fs::write(dest, format!("{} *{}\n", digest, IMAGE_NAME)).unwrap();
                    ok("")
                }
                None => ok(IMAGE_NAME),
            }
        }));
        let (pipeline, mut rx) = pipeline(runner.clone(), &fx);

        let request = BuildRequest::download(Release::Jammy, "out.iso")
            .with_user_data(user_data())
            .with_signature_verification(true);
        pipeline.execute(&request).await.unwrap();

        let stages = completed_stages(&drain(&mut rx));
        assert_eq!(&stages[..3], &[StageName::Prepare, StageName::Download, StageName::Verify]);
        // page fetch plus the two manifest files; the image itself was cached
        assert_eq!(runner.calls_to("curl").len(), 3);
        assert!(fx
            .workspace
            .sha256sums_file("ubuntu-22.04.5-live-server-amd64")
            .is_file());
    }

    #[tokio::test]
    async fn test_packages_fall_back_to_aptitude() {
        let fx = fixture();
        let runner = Arc::new(
            image_tools()
                .on("apt-cache", |inv| {
                    if inv.args.last().map(String::as_str) == Some("curl") {
                        ok("curl\n  Depends: libc6\nlibc6\nlibc6:i386\n")
                    } else {
                        ok("")
                    }
                })
                .on("aptitude", |_| ok("Package: vim\nProvided by: vim-nox (2:9.1)\n"))
                .on("apt-get", |inv| {
                    if inv.args.contains(&"libc6".to_string()) {
                        fail(inv, "E: Can't select candidate version")
                    } else {
                        ok("")
                    }
                })
                .on("dpkg-scanpackages", |_| ok("Package: curl\n")),
        );
        let (pipeline, mut rx) = pipeline(runner.clone(), &fx);

        let request = BuildRequest::local(&fx.image, "out.iso")
            .with_user_data(user_data())
            .with_packages(["curl", "vim"]);
        pipeline.execute(&request).await.unwrap();

        let aptitude = runner.calls_to("aptitude");
        assert_eq!(aptitude.len(), 1);
        assert_eq!(aptitude[0].args, vec!["show", "vim"]);

        let downloads: Vec<String> = runner
            .calls_to("apt-get")
            .iter()
            .map(|inv| inv.args[1].clone())
            .collect();
        assert_eq!(downloads, vec!["curl", "libc6", "vim-nox"]);
        assert!(runner
            .calls_to("apt-get")
            .iter()
            .all(|inv| inv.current_dir.as_deref() == Some(fx.workspace.packages_dir().as_path())));

        assert!(fx.workspace.packages_dir().join("Packages.gz").is_file());
        let script = fs::read_to_string(fx.workspace.script_file(packages::INSTALL_SCRIPT)).unwrap();
        assert!(script.ends_with("apt-get install -y curl\napt-get install -y vim\n"));

        let events = drain(&mut rx);
        assert!(completed_stages(&events).contains(&StageName::Packages));
        assert!(events.iter().any(|event| matches!(
            event,
            BuildEvent::Log { level: LogLevel::Warning, message } if message.contains("libc6")
        )));
    }

    #[tokio::test]
    async fn test_unresolvable_package_fails_stage() {
        let fx = fixture();
        let runner = Arc::new(
            image_tools()
                .on("apt-cache", |inv| fail(inv, "E: No packages found"))
                .on("aptitude", |inv| fail(inv, "Unable to locate package")),
        );
        let (pipeline, _rx) = pipeline(runner, &fx);

        let request = BuildRequest::local(&fx.image, "out.iso")
            .with_user_data(user_data())
            .with_packages(["nonexistent"]);
        let err = pipeline.execute(&request).await.unwrap_err();
        assert_eq!(err.stage, StageName::Packages);
    }

    #[tokio::test]
    async fn test_missing_tools_check_network_first() {
        let fx = fixture();
        let runner = Arc::new(image_tools().missing("7z").missing("aptitude"));
        let (pipeline, _rx) = pipeline(runner.clone(), &fx);

        let request = BuildRequest::local(&fx.image, "out.iso").with_user_data(user_data());
        pipeline.execute(&request).await.unwrap();

        let calls = runner.calls();
        let lines: Vec<String> = calls.iter().take(3).map(|inv| inv.command_line()).collect();
        assert_eq!(
            lines,
            vec![
                "ping -c 1 -w 1 8.8.8.8",
                "apt-get update -y",
                "apt-get install -y p7zip-full aptitude",
            ]
        );
    }

    #[tokio::test]
    async fn test_network_failure_stops_install() {
        let fx = fixture();
        let runner = Arc::new(
            image_tools()
                .missing("xorriso")
                .on("ping", |inv| fail(inv, "Network is unreachable")),
        );
        let (pipeline, mut rx) = pipeline(runner.clone(), &fx);

        let request = BuildRequest::local(&fx.image, "out.iso").with_user_data(user_data());
        let err = pipeline.execute(&request).await.unwrap_err();

        assert_eq!(err.stage, StageName::Prepare);
        assert!(matches!(err.source, BuildError::Environment(_)));
        assert!(err.to_string().contains("3 attempts"));
        assert_eq!(runner.calls_to("ping").len(), 3);
        assert!(runner.calls_to("apt-get").is_empty());

        let events = drain(&mut rx);
        assert!(events.contains(&BuildEvent::error("Network is unreachable")));
    }

    #[tokio::test]
    async fn test_extract_failure_logs_command_output() {
        let fx = fixture();
        let runner = Arc::new(ScriptedRunner::new().on("7z", |inv| {
            Err(CommandError::Failed {
                command: inv.command_line(),
                exit_code: Some(2),
                stdout: "Scanning the drive for archives:\n\n1 file, 9 bytes\n".to_string(),
                stderr: "ERROR: Can not open the file as archive".to_string(),
            })
        }));
        let (pipeline, mut rx) = pipeline(runner, &fx);

        let request = BuildRequest::local(&fx.image, "out.iso").with_user_data(user_data());
        let err = pipeline.execute(&request).await.unwrap_err();

        assert_eq!(err.stage, StageName::Extract);
        assert_eq!(
            err.source.command_stderr(),
            Some("ERROR: Can not open the file as archive")
        );
        let events = drain(&mut rx);
        let position = |wanted: &BuildEvent| events.iter().position(|event| event == wanted);
        let scanning = position(&BuildEvent::info("Scanning the drive for archives:")).unwrap();
        let summary = position(&BuildEvent::info("1 file, 9 bytes")).unwrap();
        let error = position(&BuildEvent::error("ERROR: Can not open the file as archive")).unwrap();
        assert!(scanning < summary && summary < error);
        assert!(!completed_stages(&events).contains(&StageName::Extract));
    }

    #[tokio::test]
    async fn test_legacy_build_patches_every_boot_config() {
        let fx = fixture_with_image(FOCAL_IMAGE_NAME);
        let mbr = fx.workspace.root().join("isohdpfx.bin");
        fs::write(&mbr, "mbr").unwrap();
        let runner = Arc::new(legacy_tools());
        let (pipeline, mut rx) = pipeline_with(
            runner.clone(),
            &fx,
            PipelineSettings {
                isohybrid_mbr: mbr,
                ..settings()
            },
        );

        let request = BuildRequest::local(&fx.image, "focal.iso")
            .with_user_data(user_data())
            .with_hwe_kernel(true)
            .with_checksum_update(true);
        let output = pipeline.execute(&request).await.unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap(), "repackaged");
        assert_eq!(completed_stages(&drain(&mut rx)).len(), 8);

        // xorriso extracts; the El Torito leftovers are dropped
        assert!(runner.calls_to("7z").is_empty());
        assert!(!fx.workspace.boot_leftover_dir().exists());
        assert!(!fx.workspace.boot_dir().exists());

        let txt = fs::read_to_string(fx.workspace.txt_config()).unwrap();
        assert!(txt.contains(
            "  append initrd=/casper/hwe-initrd quiet autoinstall ds=nocloud;s=/cdrom/ ---"
        ));
        assert!(txt.contains("  kernel /casper/hwe-vmlinuz"));

        for config in [fx.workspace.grub_config(), fx.workspace.loopback_config()] {
            let content = fs::read_to_string(&config).unwrap();
            assert!(content.contains(
                "\tlinux /casper/hwe-vmlinuz autoinstall ds=nocloud\\;s=/cdrom/ ---"
            ));
            assert!(!content.contains("/casper/vmlinuz"));
            assert!(!content.contains("/casper/initrd"));
        }

        let grub_md5 = checksum::md5_file(&fx.workspace.grub_config()).unwrap();
        let loopback_md5 = checksum::md5_file(&fx.workspace.loopback_config()).unwrap();
        assert_eq!(
            fs::read_to_string(fx.workspace.md5sum_file()).unwrap(),
            format!(
                "{}  ./boot/grub/loopback.cfg\n3333  ./casper/vmlinuz\n{}  ./boot/grub/grub.cfg\n",
                loopback_md5, grub_md5
            )
        );

        let xorriso = runner.calls_to("xorriso");
        assert_eq!(xorriso.len(), 2);
        assert!(xorriso[1]
            .args
            .contains(&"ubuntu-server-focal-autoinstall".to_string()));
        assert!(xorriso[1].args.contains(&"-isohybrid-mbr".to_string()));
    }

    #[tokio::test]
    async fn test_legacy_build_requires_isohybrid_mbr() {
        let fx = fixture_with_image(FOCAL_IMAGE_NAME);
        let runner = Arc::new(legacy_tools());
        let (pipeline, _rx) = pipeline_with(
            runner.clone(),
            &fx,
            PipelineSettings {
                isohybrid_mbr: fx.workspace.root().join("missing-isohdpfx.bin"),
                ..settings()
            },
        );

        let request = BuildRequest::local(&fx.image, "focal.iso").with_user_data(user_data());
        let err = pipeline.execute(&request).await.unwrap_err();

        assert_eq!(err.stage, StageName::Prepare);
        assert!(matches!(err.source, BuildError::Environment(_)));
        assert!(err.to_string().contains("missing-isohdpfx.bin"));
        assert!(runner.calls_to("xorriso").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_local_image_uses_current_layout() {
        let fx = fixture();
        let custom = fx.workspace.root().join("custom.iso");
        fs::write(&custom, "iso").unwrap();
        let runner = Arc::new(image_tools());
        let (pipeline, _rx) = pipeline(runner.clone(), &fx);

        let request = BuildRequest::local(&custom, "out.iso").with_user_data(user_data());
        let output = pipeline.execute(&request).await.unwrap();
        assert!(output.is_file());

        let explicit = BuildRequest {
            release: Some(Release::Noble),
            ..request
        };
        pipeline.execute(&explicit).await.unwrap();

        let labels: Vec<String> = runner
            .calls_to("xorriso")
            .iter()
            .map(|inv| inv.args[4].clone())
            .collect();
        assert_eq!(
            labels,
            vec![
                "ubuntu-server-unknown-autoinstall",
                "ubuntu-server-noble-autoinstall"
            ]
        );
        assert_eq!(runner.calls_to("7z").len(), 2);
    }

    #[tokio::test]
    async fn test_missing_local_image() {
        let fx = fixture();
        let (pipeline, _rx) = pipeline(Arc::new(image_tools()), &fx);

        let request = BuildRequest::local(fx.workspace.root().join("nope.iso"), "out.iso")
            .with_user_data(user_data());
        let err = pipeline.execute(&request).await.unwrap_err();
        assert_eq!(err.stage, StageName::Upload);
        assert!(matches!(err.source, BuildError::InvalidImage(_)));
    }
}
