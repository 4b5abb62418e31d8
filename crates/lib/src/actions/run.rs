//! Running a command or script, on the host or in the target root.
//!
//! ```yaml
//! - action: run
//!   chroot: true
//!   script: scripts/setup-user.sh user
//!
//! - action: run
//!   postprocess: true
//!   command: bmaptool create rpi.img > rpi.img.bmap
//! ```
//!
//! Scripts are looked up relative to the recipe directory. In the root
//! their directory is visible as `/tmp/script`.
//!
//! Chrooted commands run in a systemd-nspawn container by default. Commands
//! that need to create device nodes can ask for `chroot-method: chroot`
//! instead; that method can't bind the script directory, so it only takes
//! `command`.

use anyhow::{anyhow, Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::action::{describe_or, Action};
use crate::context::Context;
use crate::machine::Machine;
use crate::task::{ChrootMethod, Task};

const SCRIPT_MOUNT: &str = "/tmp/script";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct RunAction {
    #[serde(default)]
    description: Option<String>,
    /// Run inside the target root.
    #[serde(default)]
    chroot: bool,
    /// How to enter the root when `chroot` is set.
    #[serde(default)]
    chroot_method: Option<ChrootMethod>,
    /// Run in the artifact directory, typically after the image is done.
    #[serde(default)]
    postprocess: bool,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    command: Option<String>,
    /// Prefix for the output of the command in the log.
    #[serde(default)]
    label: Option<String>,
    #[serde(skip)]
    script_path: Option<Utf8PathBuf>,
    #[serde(skip)]
    script_args: Vec<String>,
}

impl RunAction {
    fn script_dir(&self) -> Option<&Utf8Path> {
        self.script_path.as_deref().and_then(|p| p.parent())
    }

    /// The shell command line to run.
    fn cmdline(&self) -> Result<String> {
        let Some(script) = self.script_path.as_deref() else {
            return self
                .command
                .clone()
                .ok_or_else(|| anyhow!("No command configured"));
        };
        let script = if self.chroot {
            let name = script
                .file_name()
                .ok_or_else(|| anyhow!("Invalid script path {script}"))?;
            Utf8Path::new(SCRIPT_MOUNT).join(name)
        } else {
            script.to_owned()
        };
        let words = std::iter::once(script.as_str())
            .chain(self.script_args.iter().map(|s| s.as_str()));
        shlex::try_join(words).map_err(|e| anyhow!("Quoting script command line: {e}"))
    }

    fn chroot_task(&self, ctx: &Context, label: String) -> Task {
        let method = self.chroot_method.unwrap_or(ChrootMethod::Nspawn);
        let mut task = Task::for_context(ctx, label, "sh").chroot(&ctx.rootdir, method);
        if let Some(dir) = self.script_dir() {
            task = task.bind_mount(dir, SCRIPT_MOUNT);
        }
        task
    }

    fn default_label(&self) -> String {
        let first = match (self.script_path.as_deref(), self.command.as_deref()) {
            (Some(p), _) => p.file_name(),
            (None, Some(c)) => c.split_whitespace().next(),
            (None, None) => None,
        };
        first
            .map(|w| w.rsplit('/').next().unwrap_or(w).to_owned())
            .unwrap_or_else(|| "run".into())
    }
}

impl Action for RunAction {
    fn verify(&mut self, ctx: &mut Context) -> Result<()> {
        match (self.script.as_deref(), self.command.as_deref()) {
            (Some(_), Some(_)) => anyhow::bail!("Only one of script and command may be set"),
            (None, None) => anyhow::bail!("One of script or command is required"),
            (None, Some(c)) if c.trim().is_empty() => anyhow::bail!("command is empty"),
            _ => {}
        }
        if self.chroot && self.postprocess {
            anyhow::bail!("chroot and postprocess can't be combined");
        }
        match self.chroot_method {
            Some(_) if !self.chroot => anyhow::bail!("chroot-method requires chroot"),
            Some(ChrootMethod::None) => anyhow::bail!("Invalid chroot-method none"),
            Some(ChrootMethod::Chroot) if self.script.is_some() => {
                anyhow::bail!("chroot-method chroot can't run a script, use command")
            }
            _ => {}
        }
        if let Some(script) = self.script.as_deref() {
            let words =
                shlex::split(script).ok_or_else(|| anyhow!("Invalid script line {script:?}"))?;
            let (path, args) = words
                .split_first()
                .ok_or_else(|| anyhow!("script is empty"))?;
            let path = ctx.scope.recipe_dir.join(path);
            if !path.is_file() {
                anyhow::bail!("Script {path} not found");
            }
            self.script_path = Some(path);
            self.script_args = args.to_vec();
        }
        Ok(())
    }

    fn pre_machine(
        &mut self,
        _ctx: &mut Context,
        machine: &mut dyn Machine,
        _args: &mut Vec<String>,
    ) -> Result<()> {
        if let Some(dir) = self.script_dir() {
            machine.add_volume(dir);
        }
        Ok(())
    }

    fn run(&mut self, ctx: &mut Context) -> Result<()> {
        let cmdline = self.cmdline()?;
        let label = self.label.clone().unwrap_or_else(|| self.default_label());
        let task = if self.chroot {
            self.chroot_task(ctx, label)
        } else {
            let mut task = Task::new(label, "sh")
                .env("ROOTDIR", ctx.rootdir.as_str())
                .env("ARTIFACTDIR", ctx.artifactdir.as_str())
                .env("RECIPEDIR", ctx.scope.recipe_dir.as_str())
                .env("IMAGEMNTDIR", ctx.image_mntdir.as_str());
            if let Some(image) = ctx.image.as_deref() {
                task = task.env("IMAGE", image.as_str());
            }
            for (k, v) in &ctx.environ_vars {
                task = task.env(k, v);
            }
            if self.postprocess {
                task = task.cwd(&ctx.artifactdir);
            }
            task
        };
        task.args(["-c", cmdline.as_str()])
            .run()
            .with_context(|| format!("Running {cmdline}"))
    }

    fn describe(&self) -> String {
        describe_or(self.description.as_deref(), || {
            let what = self.script.as_deref().or(self.command.as_deref()).unwrap_or_default();
            let where_ = if self.chroot { " (chroot)" } else { "" };
            format!("Run {what}{where_}")
        })
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::context::tests::test_context;
    use crate::machine::tests::MockMachine;

    fn run_action(ctx: &mut Context, yaml: &str) -> Result<RunAction> {
        let mut a: RunAction = serde_yaml::from_str(yaml)?;
        a.verify(ctx)?;
        a.run(ctx)?;
        Ok(a)
    }

    #[test]
    fn test_verify() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        for yaml in [
            "label: x\n",
            "command: ls\nscript: foo.sh\n",
            "command: ' '\n",
            "command: ls\nchroot: true\npostprocess: true\n",
            "script: missing.sh\n",
            "command: ls\nchroot-method: chroot\n",
            "command: ls\nchroot: true\nchroot-method: none\n",
            "command: ls\nchroot: true\nchroot-method: bogus\n",
        ] {
            let mut a: RunAction = serde_yaml::from_str(yaml)?;
            assert!(a.verify(&mut ctx).is_err(), "{yaml}");
        }
        Ok(())
    }

    #[test]
    fn test_host_command_environment() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        ctx.environ_vars.insert("SUITE".into(), "trixie".into());
        run_action(
            &mut ctx,
            r#"command: echo "$ROOTDIR $RECIPEDIR $SUITE" > "$ARTIFACTDIR/env""#,
        )?;
        let env = std::fs::read_to_string(ctx.artifactdir.join("env"))?;
        assert_eq!(env, format!("{} {} trixie\n", ctx.rootdir, ctx.scope.recipe_dir));
        Ok(())
    }

    #[test]
    fn test_postprocess() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        run_action(&mut ctx, "postprocess: true\ncommand: pwd > where\n")?;
        let cwd = std::fs::read_to_string(ctx.artifactdir.join("where"))?;
        assert_eq!(cwd.trim_end(), ctx.artifactdir.as_str());
        Ok(())
    }

    #[test]
    fn test_script() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        let scripts = ctx.scope.recipe_dir.join("scripts");
        std::fs::create_dir(&scripts)?;
        let script = scripts.join("hello.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"hello $1\" > \"$ARTIFACTDIR/hello\"\n")?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;

        let mut a: RunAction = serde_yaml::from_str("script: scripts/hello.sh 'big world'\n")?;
        a.verify(&mut ctx)?;
        assert_eq!(a.default_label(), "hello.sh");
        let mut machine = MockMachine::default();
        a.pre_machine(&mut ctx, &mut machine, &mut Vec::new())?;
        assert_eq!(machine.volumes, [scripts.clone()]);
        a.run(&mut ctx)?;
        let out = std::fs::read_to_string(ctx.artifactdir.join("hello"))?;
        assert_eq!(out, "hello big world\n");
        Ok(())
    }

    #[test]
    fn test_chroot_cmdline() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        std::fs::write(ctx.scope.recipe_dir.join("setup.sh"), "")?;
        let mut a: RunAction = serde_yaml::from_str("chroot: true\nscript: setup.sh user\n")?;
        a.verify(&mut ctx)?;
        assert_eq!(a.cmdline()?, "/tmp/script/setup.sh user");
        assert_eq!(a.describe(), "Run setup.sh user (chroot)");
        Ok(())
    }

    #[test]
    fn test_chroot_method() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        let yaml = "chroot: true\nchroot-method: chroot\ncommand: mknod /dev/null c 1 3\n";
        let mut a: RunAction = serde_yaml::from_str(yaml)?;
        a.verify(&mut ctx)?;
        let cmd = a.chroot_task(&ctx, "mknod".into()).command();
        assert_eq!(cmd.get_program(), "chroot");
        assert_eq!(cmd.get_args().next(), Some(ctx.rootdir.as_os_str()));

        let mut a: RunAction = serde_yaml::from_str("chroot: true\ncommand: true\n")?;
        a.verify(&mut ctx)?;
        let cmd = a.chroot_task(&ctx, "true".into()).command();
        assert_eq!(cmd.get_program(), "systemd-nspawn");

        std::fs::write(ctx.scope.recipe_dir.join("setup.sh"), "")?;
        let yaml = "chroot: true\nchroot-method: chroot\nscript: setup.sh\n";
        let mut a: RunAction = serde_yaml::from_str(yaml)?;
        assert!(a.verify(&mut ctx).is_err());
        Ok(())
    }
}
