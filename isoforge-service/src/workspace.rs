// Workspace Paths
// Canonical locations of every intermediate artifact under one build root

use crate::config::WorkspaceConfig;
use crate::error::{ServiceError, ServiceResult};

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

pub const GRUB_CONFIG: &str = "boot/grub/grub.cfg";
pub const LOOPBACK_CONFIG: &str = "boot/grub/loopback.cfg";
pub const TXT_CONFIG: &str = "isolinux/txt.cfg";
pub const MD5SUM_FILE: &str = "md5sum.txt";
pub const META_DATA_FILE: &str = "meta-data";
pub const USER_DATA_FILE: &str = "user-data";

/// Directory tree a build runs in.
///
/// Every path is derived from `root` except the download cache, which may be
/// shared between workspaces so release images are fetched once. Repackaged
/// images go to the output directory, `<root>/download` unless overridden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
    download_dir: PathBuf,
    output_dir: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let download_dir = root.join("download");
        Self {
            output_dir: download_dir.clone(),
            root,
            download_dir,
        }
    }

    /// Use `download_dir` as the download cache instead of `<root>/download`
    pub fn with_download_dir(mut self, download_dir: impl Into<PathBuf>) -> Self {
        self.download_dir = download_dir.into();
        self
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Workspace for one job. Isolated jobs live under `<base>/jobs/<id>`,
    /// write their image to `<base>/jobs/<id>/output` and share
    /// `<base>/download`; otherwise every job uses `<base>` directly.
    pub fn for_job(config: &WorkspaceConfig, job_id: &str) -> Self {
        if config.isolate_jobs {
            let root = config.root.join("jobs").join(job_id);
            Self::new(&root)
                .with_download_dir(config.root.join("download"))
                .with_output_dir(root.join("output"))
        } else {
            Self::new(&config.root)
        }
    }

    /// Create the directory skeleton, failing on the first directory that
    /// cannot be created
    pub fn create(&self) -> ServiceResult<()> {
        let dirs = [
            self.root.clone(),
            self.download_dir(),
            self.output_dir(),
            self.build_dir(),
            self.mount_dir(),
            self.packages_dir(),
            self.scripts_dir(),
        ];

        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|source| ServiceError::Workspace {
                path: dir.clone(),
                source,
            })?;
        }

        tracing::debug!(root = %self.root.display(), "workspace ready");
        Ok(())
    }

    /// Remove the extracted tree and the boot images beside it. The download
    /// cache and the output directory are left alone.
    pub fn remove_scratch(&self) -> ServiceResult<()> {
        for dir in [self.build_dir(), self.boot_dir(), self.config_dir()] {
            match fs::remove_dir_all(&dir) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    return Err(ServiceError::Workspace {
                        path: dir,
                        source: e,
                    });
                }
                _ => {}
            }
        }

        tracing::debug!(root = %self.root.display(), "scratch tree removed");
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // Top-level directories

    pub fn download_dir(&self) -> PathBuf {
        self.download_dir.clone()
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone()
    }

    pub fn build_dir(&self) -> PathBuf {
        self.root.join("build")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn boot_dir(&self) -> PathBuf {
        self.root.join("BOOT")
    }

    // Directories inside the build tree

    pub fn mount_dir(&self) -> PathBuf {
        self.build_dir().join("mnt")
    }

    /// Where 7z leaves the El Torito boot images
    pub fn boot_leftover_dir(&self) -> PathBuf {
        self.build_dir().join("[BOOT]")
    }

    pub fn packages_dir(&self) -> PathBuf {
        self.mount_dir().join("packages")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.mount_dir().join("script")
    }

    // Files

    pub fn download_file(&self, name: &str) -> PathBuf {
        self.download_dir.join(name)
    }

    pub fn script_file(&self, name: &str) -> PathBuf {
        self.scripts_dir().join(name)
    }

    pub fn build_file(&self, rel: &str) -> PathBuf {
        self.build_dir().join(rel)
    }

    pub fn md5sum_file(&self) -> PathBuf {
        self.build_file(MD5SUM_FILE)
    }

    pub fn grub_config(&self) -> PathBuf {
        self.build_file(GRUB_CONFIG)
    }

    pub fn loopback_config(&self) -> PathBuf {
        self.build_file(LOOPBACK_CONFIG)
    }

    pub fn txt_config(&self) -> PathBuf {
        self.build_file(TXT_CONFIG)
    }

    pub fn meta_data_file(&self) -> PathBuf {
        self.build_file(META_DATA_FILE)
    }

    pub fn user_data_file(&self) -> PathBuf {
        self.build_file(USER_DATA_FILE)
    }

    pub fn sha256sums_file(&self, suffix: &str) -> PathBuf {
        self.download_file(&format!("SHA256SUMS-{}", suffix))
    }

    pub fn sha256sums_signature(&self, suffix: &str) -> PathBuf {
        self.download_file(&format!("SHA256SUMS-{}.gpg", suffix))
    }

    pub fn keyring_file(&self, key_id: &str) -> PathBuf {
        self.download_file(&format!("{}.keyring", key_id))
    }

    /// Where the repackage stage writes `destination`
    pub fn artifact_path(&self, destination: &str) -> PathBuf {
        let dest = Path::new(destination);
        if dest.is_absolute() {
            dest.to_path_buf()
        } else {
            self.output_dir.join(destination)
        }
    }

    /// Candidate artifact locations in lookup order, without duplicates
    pub fn artifact_candidates(&self, destination: &str, cwd: &Path) -> Vec<PathBuf> {
        let dest = Path::new(destination);
        let mut candidates = vec![self.artifact_path(destination)];
        if dest.is_absolute() {
            candidates.push(dest.to_path_buf());
        }
        candidates.push(absolutize(dest, cwd));
        candidates.push(cwd.join(dest));

        let mut unique: Vec<PathBuf> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if !unique.contains(&candidate) {
                unique.push(candidate);
            }
        }
        unique
    }

    /// First existing candidate, or the canonical path when none exists yet
    pub fn resolve_artifact(&self, destination: &str) -> PathBuf {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let candidates = self.artifact_candidates(destination, &cwd);

        if let Some(found) = candidates.iter().find(|path| path.is_file()) {
            return found.clone();
        }

        tracing::warn!(
            destination,
            candidates = ?candidates,
            "artifact not found at any candidate location"
        );
        self.artifact_path(destination)
    }
}

/// Whether `destination` stays inside the directory it is joined to: relative
/// and free of `..` components
pub fn is_contained(destination: &str) -> bool {
    Path::new(destination)
        .components()
        .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

/// Lexically resolve `path` against `cwd`, dropping `.` and folding `..`
fn absolutize(path: &Path, cwd: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
