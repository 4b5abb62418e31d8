//! Moving the root filesystem built so far into the mounted image.
//!
//! After this action, subsequent actions operate on the image's mounted
//! filesystems rather than the scratch root.

use anyhow::{Context as _, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::Deserialize;

use super::default_true;
use crate::action::{describe_or, Action};
use crate::context::Context;
use crate::task::Task;

const FSTAB: &str = "etc/fstab";
const KERNEL_CMDLINE: &str = "etc/kernel/cmdline";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct FilesystemDeployAction {
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_true")]
    setup_fstab: bool,
    #[serde(default = "default_true")]
    setup_kernel_cmdline: bool,
    /// Extra kernel arguments, after the `root=` argument.
    #[serde(default)]
    append_kernel_cmdline: Option<String>,
}

/// Replace `/etc/fstab` in `root`.
#[context("Writing /etc/fstab")]
fn write_fstab(root: &Dir, fstab: &str) -> Result<()> {
    if fstab.is_empty() {
        anyhow::bail!(
            "No fstab was generated; is there an image-partition action before this one?"
        );
    }
    root.create_dir_all("etc")?;
    root.atomic_write(FSTAB, fstab)?;
    Ok(())
}

/// Append the root argument and `extra` to `/etc/kernel/cmdline` in `root`,
/// keeping what is already there.
#[context("Writing /etc/kernel/cmdline")]
fn write_kernel_cmdline(root: &Dir, kernel_root: &str, extra: Option<&str>) -> Result<()> {
    if kernel_root.is_empty() {
        anyhow::bail!(
            "No root filesystem argument was generated; \
             is there an image-partition action before this one?"
        );
    }
    let existing = match root.read_to_string(KERNEL_CMDLINE) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let args = [existing.trim(), kernel_root, extra.unwrap_or_default().trim()]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    root.create_dir_all("etc/kernel")?;
    root.atomic_write(KERNEL_CMDLINE, format!("{args}\n"))?;
    Ok(())
}

#[context("Copying {src} to {dest}")]
fn copy_tree(src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    Task::new("filesystem-deploy", "cp")
        .args(["-a", format!("{src}/.").as_str(), dest.as_str()])
        .run()
}

impl Action for FilesystemDeployAction {
    fn run(&mut self, ctx: &mut Context) -> Result<()> {
        let src = ctx.rootdir.clone();
        let dest = ctx.image_mntdir.clone();
        std::fs::create_dir_all(&dest).with_context(|| format!("Creating {dest}"))?;
        tracing::info!("Deploying {src} into {dest}");
        copy_tree(&src, &dest)?;
        ctx.rootdir = dest;

        let root = Dir::open_ambient_dir(&ctx.rootdir, cap_std::ambient_authority())
            .with_context(|| format!("Opening {}", ctx.rootdir))?;
        if self.setup_fstab {
            write_fstab(&root, &ctx.image_fstab)?;
        }
        if self.setup_kernel_cmdline {
            write_kernel_cmdline(
                &root,
                &ctx.image_kernel_root,
                self.append_kernel_cmdline.as_deref(),
            )?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        describe_or(self.description.as_deref(), || "Deploy filesystem into image".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use cap_std_ext::cap_tempfile;

    const FSTAB_CONTENT: &str = "UUID=0e6b2d1c\t/\text4\tdefaults\t0\t1\n";

    #[test]
    fn test_write_fstab() -> Result<()> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        assert!(write_fstab(&td, "").is_err());
        td.create_dir("etc")?;
        td.write(FSTAB, "# old\n")?;
        write_fstab(&td, FSTAB_CONTENT)?;
        assert_eq!(td.read_to_string(FSTAB)?, FSTAB_CONTENT);
        Ok(())
    }

    #[test]
    fn test_write_kernel_cmdline() -> Result<()> {
        let td = cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        assert!(write_kernel_cmdline(&td, "", None).is_err());
        write_kernel_cmdline(&td, "root=UUID=1234", Some("console=ttyS0 "))?;
        assert_eq!(
            td.read_to_string(KERNEL_CMDLINE)?,
            "root=UUID=1234 console=ttyS0\n"
        );

        td.write(KERNEL_CMDLINE, "quiet\n")?;
        write_kernel_cmdline(&td, "root=UUID=1234", None)?;
        assert_eq!(td.read_to_string(KERNEL_CMDLINE)?, "quiet root=UUID=1234\n");
        Ok(())
    }

    #[test]
    fn test_deploy() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        std::fs::create_dir_all(ctx.rootdir.join("etc/kernel"))?;
        std::fs::write(ctx.rootdir.join("etc/hostname"), "rpi\n")?;
        std::fs::write(ctx.rootdir.join("etc/kernel/cmdline"), "quiet\n")?;
        ctx.image_fstab = FSTAB_CONTENT.into();
        ctx.image_kernel_root = "root=UUID=0e6b2d1c".into();
        let orig_root = ctx.rootdir.clone();
        let mut a: FilesystemDeployAction =
            serde_yaml::from_str("append-kernel-cmdline: console=ttyS0\n")?;

        a.run(&mut ctx)?;
        let mnt = ctx.image_mntdir.clone();
        assert_eq!(ctx.rootdir, mnt);
        assert_eq!(ctx.origin("filesystem").unwrap(), mnt);
        assert_eq!(std::fs::read_to_string(mnt.join("etc/hostname"))?, "rpi\n");
        assert_eq!(std::fs::read_to_string(mnt.join("etc/fstab"))?, FSTAB_CONTENT);
        assert_eq!(
            std::fs::read_to_string(mnt.join("etc/kernel/cmdline"))?,
            "quiet root=UUID=0e6b2d1c console=ttyS0\n"
        );

        // Deploying again over the same mount directory gives the same files
        ctx.rootdir = orig_root;
        a.run(&mut ctx)?;
        assert_eq!(std::fs::read_to_string(mnt.join("etc/hostname"))?, "rpi\n");
        assert_eq!(std::fs::read_to_string(mnt.join("etc/fstab"))?, FSTAB_CONTENT);
        assert_eq!(
            std::fs::read_to_string(mnt.join("etc/kernel/cmdline"))?,
            "quiet root=UUID=0e6b2d1c console=ttyS0\n"
        );
        Ok(())
    }

    #[test]
    fn test_deploy_without_partitioning() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        let orig_root = ctx.rootdir.clone();
        let mut a: FilesystemDeployAction = serde_yaml::from_str("{}")?;
        assert!(a.run(&mut ctx).is_err());
        ctx.rootdir = orig_root;
        let mut a: FilesystemDeployAction =
            serde_yaml::from_str("setup-fstab: false\nsetup-kernel-cmdline: false\n")?;
        a.run(&mut ctx)?;
        Ok(())
    }
}
