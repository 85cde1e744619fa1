// Checksums
// md5sum.txt maintenance and SHA-256 manifest checks

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

/// Upsert the entry for `rel` (a path relative to the image root).
///
/// An existing line for the same path is rewritten in place, keeping its path
/// spelling; later duplicates are dropped. Otherwise a `./rel` line is
/// appended. Untouched lines keep their order.
pub fn upsert_md5_entry(content: &str, rel: &str, digest: &str) -> String {
    let wanted = normalize_entry_path(rel);
    let mut replaced = false;
    let mut lines: Vec<String> = Vec::new();

    for line in content.lines() {
        match entry_path(line) {
            Some(path) if normalize_entry_path(path) == wanted => {
                if !replaced {
                    lines.push(format!("{}  {}", digest, path));
                    replaced = true;
                }
            }
            _ => lines.push(line.to_string()),
        }
    }

    if !replaced {
        lines.push(format!("{}  ./{}", digest, wanted));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn entry_path(line: &str) -> Option<&str> {
    let mut fields = line.split_whitespace();
    fields.next()?;
    fields.next()
}

fn normalize_entry_path(path: &str) -> &str {
    path.trim_start_matches("./").trim_start_matches('/')
}

/// Hex md5 of a file's contents
pub fn md5_file(path: &Path) -> io::Result<String> {
    let data = fs::read(path)?;
    Ok(format!("{:x}", md5::compute(data)))
}

/// Refresh the md5sum.txt entries for `files` (relative to `root`)
pub fn update_md5sum(manifest: &Path, root: &Path, files: &[&str]) -> io::Result<()> {
    let mut content = match fs::read_to_string(manifest) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    for rel in files {
        let digest = md5_file(&root.join(rel))?;
        content = upsert_md5_entry(&content, rel, &digest);
    }

    fs::write(manifest, content)
}

/// Create or truncate md5sum.txt so the installer skips its integrity check
pub fn clear_md5sum(manifest: &Path) -> io::Result<()> {
    File::create(manifest).map(|_| ())
}

/// Hex SHA-256 of a file, streamed
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Whether a SHA256SUMS manifest lists `digest`
pub fn manifest_lists_digest(manifest: &str, digest: &str) -> bool {
    manifest.lines().any(|line| {
        line.split_whitespace()
            .next()
            .is_some_and(|listed| listed.eq_ignore_ascii_case(digest))
    })
}
