//! Helpers for mounting partitions of the image being assembled and
//! describing them in `/etc/fstab`.

use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use osbake_utils::CommandRunExt;

/// The name of the kernel filesystem driver for a configured filesystem type.
///
/// All FAT variants are handled by `vfat`; everything else maps to itself.
pub fn kernel_fs_type(fs: &str) -> &str {
    match fs {
        "fat12" | "fat16" | "fat32" | "msdos" => "vfat",
        o => o,
    }
}

/// Mount `source` on `target`, creating `target` if needed.
#[context("Mounting {source} on {target}")]
pub fn mount(source: &Utf8Path, target: &Utf8Path, fstype: &str, options: &[String]) -> Result<()> {
    std::fs::create_dir_all(target).with_context(|| format!("Creating {target}"))?;
    let mut cmd = Command::new("mount");
    cmd.args(["-t", kernel_fs_type(fstype)]);
    if !options.is_empty() {
        cmd.args(["-o", options.join(",").as_str()]);
    }
    cmd.arg(source).arg(target);
    cmd.log_debug().run_capture_stderr()
}

/// Unmount the filesystem at `target`.
#[context("Unmounting {target}")]
pub fn unmount(target: &Utf8Path) -> Result<()> {
    tracing::debug!("Unmounting {target}");
    rustix::mount::unmount(target.as_std_path(), rustix::mount::UnmountFlags::empty())?;
    Ok(())
}

/// One line of `/etc/fstab`, keyed by filesystem UUID.
///
/// ```text
/// UUID=<uuid>  <target>  <fstype>  <options>  <dump>  <pass>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Filesystem UUID
    pub uuid: String,
    /// Mount point inside the booted system
    pub target: String,
    /// Filesystem type as understood by mount(8)
    pub fstype: String,
    /// Options beyond `defaults`
    pub options: Vec<String>,
    /// fsck pass number
    pub passno: u8,
}

impl MountSpec {
    /// Construct a new mount that uses the provided uuid as a source.
    pub fn new_uuid_src(uuid: &str, target: &str, fstype: &str) -> Self {
        Self {
            uuid: uuid.to_owned(),
            target: target.to_owned(),
            fstype: kernel_fs_type(fstype).to_owned(),
            options: Vec::new(),
            passno: 0,
        }
    }

    /// Append a mount option
    pub fn push_option(&mut self, opt: &str) {
        self.options.push(opt.to_owned());
    }

    /// Render as a tab separated fstab line, without trailing newline.
    pub fn to_fstab(&self) -> String {
        let options = std::iter::once("defaults")
            .chain(self.options.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "UUID={}\t{}\t{}\t{}\t0\t{}",
            self.uuid, self.target, self.fstype, options, self.passno
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_fs_type() {
        assert_eq!(kernel_fs_type("fat32"), "vfat");
        assert_eq!(kernel_fs_type("fat16"), "vfat");
        assert_eq!(kernel_fs_type("vfat"), "vfat");
        assert_eq!(kernel_fs_type("ext4"), "ext4");
        assert_eq!(kernel_fs_type("btrfs"), "btrfs");
    }

    #[test]
    fn test_mountspec() {
        let mut ms = MountSpec::new_uuid_src("965eb3c7", "/boot/firmware", "fat32");
        similar_asserts::assert_eq!(
            ms.to_fstab(),
            "UUID=965eb3c7\t/boot/firmware\tvfat\tdefaults\t0\t0"
        );
        ms.push_option("ro");
        ms.push_option("relatime");
        ms.passno = 2;
        similar_asserts::assert_eq!(
            ms.to_fstab(),
            "UUID=965eb3c7\t/boot/firmware\tvfat\tdefaults,ro,relatime\t0\t2"
        );
    }
}
