// Boot Config Patching
// Line-level edits to grub/isolinux kernel command lines

use std::fs;
use std::io;
use std::path::Path;

/// Directive that makes subiquity read user-data from the image root (grub quoting)
pub const GRUB_NOCLOUD: &str = "autoinstall ds=nocloud\\;s=/cdrom/";
/// Same directive for isolinux, which needs no escaping
pub const ISOLINUX_NOCLOUD: &str = "autoinstall ds=nocloud;s=/cdrom/";
pub const AUTOINSTALL_KEYWORD: &str = "autoinstall";

const END_MARKER: &str = "---";
const REFERENCE_TOKEN: &str = "quiet";

const KERNEL_SWAPS: [(&str, &str); 2] = [
    ("/casper/vmlinuz", "/casper/hwe-vmlinuz"),
    ("/casper/initrd", "/casper/hwe-initrd"),
];

/// Insert `directive` into every `linux`/`append` line that ends with `---`
/// and does not mention `autoinstall` yet.
///
/// The directive goes right after `quiet`, or before `---` when there is no
/// `quiet`. Leading whitespace is kept; inner whitespace is collapsed.
/// Returns `None` when nothing needed patching.
pub fn patch_boot_config(content: &str, directive: &str) -> Option<String> {
    let mut modified = false;
    let lines: Vec<String> = content
        .split('\n')
        .map(|line| match patch_line(line, directive) {
            Some(patched) => {
                modified = true;
                patched
            }
            None => line.to_string(),
        })
        .collect();

    modified.then(|| lines.join("\n"))
}

fn patch_line(line: &str, directive: &str) -> Option<String> {
    let body = line.trim_start_matches([' ', '\t']);
    let indent = &line[..line.len() - body.len()];

    let is_kernel_line = body.starts_with("append") || body.starts_with("linux");
    let trimmed = line.trim_end_matches([' ', '\t', '\r']);
    if !is_kernel_line || !trimmed.ends_with(END_MARKER) || line.contains(AUTOINSTALL_KEYWORD) {
        return None;
    }

    let args = trimmed[..trimmed.len() - END_MARKER.len()].trim();
    let mut parts: Vec<&str> = args.split_whitespace().collect();
    match parts.iter().position(|part| *part == REFERENCE_TOKEN) {
        Some(index) => parts.insert(index + 1, directive),
        None => parts.push(directive),
    }

    Some(format!("{}{} {}", indent, parts.join(" "), END_MARKER))
}

/// Point kernel and initrd paths at the HWE variants
pub fn swap_kernel_variant(content: &str) -> String {
    content
        .split('\n')
        .map(|line| {
            KERNEL_SWAPS
                .iter()
                .fold(line.to_string(), |acc, (from, to)| acc.replace(from, to))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Whether the image ships an HWE kernel
pub fn has_hwe_kernel(grub_content: &str) -> bool {
    grub_content.contains("hwe-vmlinuz")
}

/// Patch a config file in place. Missing files are skipped and reported as
/// unchanged.
pub fn patch_boot_file(path: &Path, directive: &str) -> io::Result<bool> {
    let Some(content) = read_if_exists(path)? else {
        return Ok(false);
    };

    match patch_boot_config(&content, directive) {
        Some(patched) => {
            fs::write(path, patched)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Apply [`swap_kernel_variant`] to a file in place, skipping missing files
pub fn swap_kernel_file(path: &Path) -> io::Result<bool> {
    let Some(content) = read_if_exists(path)? else {
        return Ok(false);
    };

    let swapped = swap_kernel_variant(&content);
    if swapped == content {
        return Ok(false);
    }
    fs::write(path, swapped)?;
    Ok(true)
}

pub(crate) fn read_if_exists(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
