// Pipeline Models
// Build requests, releases and stage names

use crate::error::{ServiceError, ServiceResult};
use crate::workspace;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Supported Ubuntu Server releases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Release {
    Focal,
    Jammy,
    Noble,
}

impl Release {
    pub const ALL: [Release; 3] = [Release::Focal, Release::Jammy, Release::Noble];

    pub fn codename(&self) -> &'static str {
        match self {
            Release::Focal => "focal",
            Release::Jammy => "jammy",
            Release::Noble => "noble",
        }
    }

    pub fn version(&self) -> &'static str {
        match self {
            Release::Focal => "20.04",
            Release::Jammy => "22.04",
            Release::Noble => "24.04",
        }
    }

    pub fn family(&self) -> ReleaseFamily {
        match self {
            Release::Focal => ReleaseFamily::Legacy,
            Release::Jammy | Release::Noble => ReleaseFamily::Current,
        }
    }

    /// Match a point-release version such as `22.04.5`
    pub fn from_version(version: &str) -> Option<Release> {
        Self::ALL
            .into_iter()
            .find(|release| version.starts_with(release.version()))
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.codename())
    }
}

impl FromStr for Release {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|release| release.codename() == s)
            .ok_or_else(|| {
                ServiceError::Validation(format!(
                    "release must be one of: focal, jammy, noble (got '{}')",
                    s
                ))
            })
    }
}

/// Image layout family; decides extraction tool, boot configs and packaging recipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseFamily {
    /// isolinux + grub layout, extracted with xorriso
    Legacy,
    /// grub-only layout with appended EFI partition, extracted with 7z
    Current,
}

/// Fields parsed from an installer image file name such as
/// `ubuntu-22.04.5-live-server-amd64.iso`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageMeta {
    pub distro: String,
    pub version: String,
    pub build: String,
    pub variant: String,
    pub arch: String,
    pub release: Option<Release>,
}

impl ImageMeta {
    pub fn parse(path: &Path) -> Option<ImageMeta> {
        let stem = path.file_stem()?.to_str()?;
        let parts: Vec<&str> = stem.split('-').collect();
        if parts.len() < 5 {
            return None;
        }

        Some(ImageMeta {
            distro: parts[0].to_string(),
            version: parts[1].to_string(),
            build: parts[2].to_string(),
            variant: parts[3].to_string(),
            arch: parts[4].to_string(),
            release: Release::from_version(parts[1]),
        })
    }
}

/// Where the source image comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceMode {
    /// An image already on disk
    Local { path: PathBuf },
    /// Fetch the current point release from the mirror
    Download { release: Release },
}

/// Caller parameters for one build. Never mutated once accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub source: SourceMode,
    /// Release to target; for local images it is otherwise derived from the file name
    pub release: Option<Release>,
    /// Artifact file name (written to the download cache) or absolute path
    pub destination: String,
    /// Injected verbatim as `user-data`
    pub user_data: Vec<u8>,
    pub packages: Vec<String>,
    pub hwe_kernel: bool,
    pub update_checksums: bool,
    pub verify_signature: bool,
}

impl BuildRequest {
    pub fn local(path: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self::with_source(SourceMode::Local { path: path.into() }, destination)
    }

    pub fn download(release: Release, destination: impl Into<String>) -> Self {
        let mut request = Self::with_source(SourceMode::Download { release }, destination);
        request.release = Some(release);
        request
    }

    fn with_source(source: SourceMode, destination: impl Into<String>) -> Self {
        Self {
            source,
            release: None,
            destination: destination.into(),
            user_data: Vec::new(),
            packages: Vec::new(),
            hwe_kernel: false,
            update_checksums: false,
            verify_signature: false,
        }
    }

    pub fn with_user_data(mut self, user_data: impl Into<Vec<u8>>) -> Self {
        self.user_data = user_data.into();
        self
    }

    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_hwe_kernel(mut self, enabled: bool) -> Self {
        self.hwe_kernel = enabled;
        self
    }

    pub fn with_checksum_update(mut self, enabled: bool) -> Self {
        self.update_checksums = enabled;
        self
    }

    pub fn with_signature_verification(mut self, enabled: bool) -> Self {
        self.verify_signature = enabled;
        self
    }

    /// Structural validation only; nothing here touches the filesystem
    pub fn validate(&self) -> ServiceResult<()> {
        match &self.source {
            SourceMode::Local { path } if path.as_os_str().is_empty() => {
                return Err(ServiceError::Validation(
                    "a source image path is required for local builds".to_string(),
                ));
            }
            SourceMode::Download { release } => {
                if let Some(requested) = self.release {
                    if requested != *release {
                        return Err(ServiceError::Validation(format!(
                            "download release '{}' conflicts with target release '{}'",
                            release, requested
                        )));
                    }
                }
            }
            SourceMode::Local { .. } => {}
        }

        if !self.destination.ends_with(".iso") {
            return Err(ServiceError::Validation(
                "destination must end with .iso extension".to_string(),
            ));
        }

        let destination = Path::new(&self.destination);
        if destination.is_relative() && !workspace::is_contained(&self.destination) {
            return Err(ServiceError::Validation(format!(
                "destination '{}' must not leave the output directory",
                self.destination
            )));
        }

        if self.user_data.is_empty() {
            return Err(ServiceError::Validation("user-data is required".to_string()));
        }

        Ok(())
    }
}

/// Named build stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Prepare,
    Download,
    Upload,
    Verify,
    Extract,
    Inject,
    Packages,
    Kernel,
    Hwe,
    Md5,
    Repackage,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Prepare => "prepare",
            StageName::Download => "download",
            StageName::Upload => "upload",
            StageName::Verify => "verify",
            StageName::Extract => "extract",
            StageName::Inject => "inject",
            StageName::Packages => "packages",
            StageName::Kernel => "kernel",
            StageName::Hwe => "hwe",
            StageName::Md5 => "md5",
            StageName::Repackage => "repackage",
        }
    }

    /// Job progress once the stage completes
    pub fn progress(&self) -> u8 {
        match self {
            StageName::Prepare => 10,
            StageName::Upload => 20,
            StageName::Download => 30,
            StageName::Verify => 40,
            StageName::Extract => 50,
            StageName::Inject => 60,
            StageName::Packages => 65,
            StageName::Kernel => 70,
            StageName::Hwe => 80,
            StageName::Md5 => 90,
            StageName::Repackage => 100,
        }
    }

    /// Message logged when the stage starts
    pub fn start_message(&self) -> &'static str {
        match self {
            StageName::Prepare => "Preparing build environment...",
            StageName::Download => "Downloading source image...",
            StageName::Upload => "Using local source image...",
            StageName::Verify => "Verifying source image signature and digest...",
            StageName::Extract => "Extracting image contents...",
            StageName::Inject => "Injecting user-data configuration...",
            StageName::Packages => "Preparing additional packages...",
            StageName::Kernel => "Adding autoinstall kernel parameters...",
            StageName::Hwe => "Configuring HWE kernel if requested...",
            StageName::Md5 => "Updating md5sum.txt if requested...",
            StageName::Repackage => "Repackaging installer image...",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
