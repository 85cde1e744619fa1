// Tool Recipes
// Extraction and packaging invocations selected by release family

use super::models::ReleaseFamily;
use crate::runners::Invocation;

use std::path::{Path, PathBuf};

/// MBR template shipped by the isolinux package, needed for legacy images
pub const ISOHYBRID_MBR: &str = "/usr/lib/ISOLINUX/isohdpfx.bin";

/// Volume label for the repackaged image
pub fn volume_label(codename: &str) -> String {
    format!("ubuntu-server-{}-autoinstall", codename)
}

/// Unpack `image` into `build_dir`
pub fn extract_invocation(family: ReleaseFamily, image: &Path, build_dir: &Path) -> Invocation {
    match family {
        ReleaseFamily::Legacy => Invocation::new("xorriso")
            .args(["-osirrox", "on", "-indev"])
            .path_arg(image)
            .args(["-extract", "/"])
            .path_arg(build_dir),
        ReleaseFamily::Current => Invocation::new("7z")
            .args(["-y", "x"])
            .path_arg(image)
            .arg(format!("-o{}", build_dir.display())),
    }
}

/// Packaging recipe for one release family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoRecipe {
    /// isolinux El Torito boot plus EFI image, hybrid MBR from the host
    Legacy { label: String, output: PathBuf },
    /// grub2 MBR with the EFI partition appended as GPT; reads `../BOOT`
    Current { label: String, output: PathBuf },
}

impl IsoRecipe {
    pub fn new(family: ReleaseFamily, label: String, output: PathBuf) -> Self {
        match family {
            ReleaseFamily::Legacy => IsoRecipe::Legacy { label, output },
            ReleaseFamily::Current => IsoRecipe::Current { label, output },
        }
    }

    pub fn label(&self) -> &str {
        match self {
            IsoRecipe::Legacy { label, .. } | IsoRecipe::Current { label, .. } => label,
        }
    }

    pub fn output(&self) -> &Path {
        match self {
            IsoRecipe::Legacy { output, .. } | IsoRecipe::Current { output, .. } => output,
        }
    }

    /// xorriso invocation; must run with the build tree as working directory
    pub fn invocation(&self, build_dir: &Path) -> Invocation {
        let base = Invocation::new("xorriso")
            .args(["-as", "mkisofs", "-r", "-V", self.label(), "-o"])
            .path_arg(self.output());

        let inv = match self {
            IsoRecipe::Legacy { .. } => base.args([
                "-J",
                "-b",
                "isolinux/isolinux.bin",
                "-c",
                "isolinux/boot.cat",
                "-no-emul-boot",
                "-boot-load-size",
                "4",
                "-isohybrid-mbr",
                ISOHYBRID_MBR,
                "-boot-info-table",
                "-input-charset",
                "utf-8",
                "-eltorito-alt-boot",
                "-e",
                "boot/grub/efi.img",
                "-no-emul-boot",
                "-isohybrid-gpt-basdat",
                ".",
            ]),
            IsoRecipe::Current { .. } => base.args([
                "--grub2-mbr",
                "../BOOT/1-Boot-NoEmul.img",
                "-partition_offset",
                "16",
                "--mbr-force-bootable",
                "-append_partition",
                "2",
                "28732ac11ff8d211ba4b00a0c93ec93b",
                "../BOOT/2-Boot-NoEmul.img",
                "-appended_part_as_gpt",
                "-iso_mbr_part_type",
                "a2a0d0ebe5b9334487c068b6b72699c7",
                "-c",
                "/boot.catalog",
                "-b",
                "/boot/grub/i386-pc/eltorito.img",
                "-no-emul-boot",
                "-boot-load-size",
                "4",
                "-boot-info-table",
                "--grub2-boot-info",
                "-eltorito-alt-boot",
                "-e",
                "--interval:appended_partition_2:::",
                "-no-emul-boot",
                ".",
            ]),
        };

        inv.current_dir(build_dir)
    }
}
