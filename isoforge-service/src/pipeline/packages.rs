// Extra Packages
// Package list normalization, resolver output filtering and the local apt repository

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

pub const INSTALL_SCRIPT: &str = "install-pkgs.sh";

const EXCLUDED_ARCH: &str = "i386";

/// Trim names and drop blank lines and `#` comments
pub fn normalize_package_list(packages: &[String]) -> Vec<String> {
    packages
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Extract real package names from resolver output.
///
/// `apt-cache depends --recurse` prints each package at column zero and its
/// relations indented below it, with virtual packages in angle brackets. Only
/// column-zero alphanumeric lines are names. Foreign-architecture entries are
/// skipped and duplicates removed, keeping first-seen order.
pub fn filter_dependencies(raw: &str) -> Vec<String> {
    let mut deps: Vec<String> = Vec::new();
    for line in raw.lines() {
        let starts_alnum = line
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric());
        if !starts_alnum || line.contains(EXCLUDED_ARCH) {
            continue;
        }
        let name = line.trim().to_string();
        if !deps.contains(&name) {
            deps.push(name);
        }
    }
    deps
}

/// Pull provider names out of `aptitude show` output (`Provided by: a, b`).
///
/// The result is one name per line so it can go through
/// [`filter_dependencies`] like primary resolver output.
pub fn parse_provided_by(raw: &str) -> String {
    let mut names = Vec::new();
    for line in raw.lines() {
        if let Some(rest) = line.trim_start().strip_prefix("Provided by:") {
            names.extend(
                rest.split([',', '|'])
                    .filter_map(|name| name.split_whitespace().next())
                    .map(str::to_string),
            );
        }
    }
    names.join("\n")
}

/// Write `Packages` and a best-compression `Packages.gz` into `dir`
pub fn write_package_index(dir: &Path, index: &str) -> io::Result<()> {
    fs::write(dir.join("Packages"), index)?;

    let file = fs::File::create(dir.join("Packages.gz"))?;
    let mut encoder = GzEncoder::new(file, Compression::best());
    encoder.write_all(index.as_bytes())?;
    encoder.finish()?;
    Ok(())
}

/// Script run on the installed system to install packages from the image
pub fn render_install_script(packages: &[String]) -> String {
    let mut script = String::from(
        "#!/bin/bash\n\
         # Packages are served from /mnt/packages/ on the installed system\n\
         cp /etc/apt/sources.list /etc/apt/sources.list.bak\n\
         echo 'deb [trusted=yes] file:///mnt/packages/ ./' > /etc/apt/sources.list\n\
         apt-get update\n",
    );
    for package in packages {
        script.push_str("apt-get install -y ");
        script.push_str(package);
        script.push('\n');
    }
    script
}

/// Write the install script with mode 0755
pub fn write_install_script(path: &Path, packages: &[String]) -> io::Result<()> {
    fs::write(path, render_install_script(packages))?;
    set_executable(path)
}

#[cfg(unix)]
fn set_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
