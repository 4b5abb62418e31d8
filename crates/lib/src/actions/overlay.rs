//! Copying a directory tree or file into the target root.

use anyhow::{Context as _, Result};
use camino::Utf8Path;
use serde::Deserialize;

use crate::action::{describe_or, Action};
use crate::context::{Context, ORIGIN_RECIPE};
use crate::task::Task;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct OverlayAction {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    origin: Option<String>,
    source: String,
    /// Path inside the root; the root itself if unset.
    #[serde(default)]
    destination: Option<String>,
}

impl OverlayAction {
    fn origin(&self) -> &str {
        self.origin.as_deref().unwrap_or(ORIGIN_RECIPE)
    }
}

impl Action for OverlayAction {
    fn verify(&mut self, _ctx: &mut Context) -> Result<()> {
        if self.source.is_empty() {
            anyhow::bail!("source is required");
        }
        if Utf8Path::new(&self.source).is_absolute() {
            anyhow::bail!("source {} must be relative to its origin", self.source);
        }
        Ok(())
    }

    fn run(&mut self, ctx: &mut Context) -> Result<()> {
        let src = ctx.require_origin(self.origin())?.join(&self.source);
        let dest = match self.destination.as_deref() {
            Some(d) => ctx.rootdir.join(d.trim_start_matches('/')),
            None => ctx.rootdir.clone(),
        };
        tracing::info!("Overlaying {src} on {dest}");
        let src = if src.is_dir() {
            std::fs::create_dir_all(&dest).with_context(|| format!("Creating {dest}"))?;
            format!("{src}/.")
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
            }
            src.into_string()
        };
        Task::new("overlay", "cp")
            .args(["-a", src.as_str(), dest.as_str()])
            .run()
    }

    fn describe(&self) -> String {
        describe_or(self.description.as_deref(), || {
            let dest = self.destination.as_deref().unwrap_or("/");
            format!("Overlay {}:{} on {dest}", self.origin(), self.source)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;

    #[test]
    fn test_overlay_dir() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        let overlay = ctx.scope.recipe_dir.join("overlay/etc/apt");
        std::fs::create_dir_all(&overlay)?;
        std::fs::write(
            overlay.join("sources.list"),
            "deb http://deb.debian.org/debian trixie main\n",
        )?;
        std::fs::create_dir_all(ctx.rootdir.join("etc"))?;
        std::fs::write(ctx.rootdir.join("etc/hostname"), "rpi\n")?;

        let mut a: OverlayAction = serde_yaml::from_str("source: overlay\n")?;
        a.verify(&mut ctx)?;
        a.run(&mut ctx)?;
        assert!(ctx.rootdir.join("etc/apt/sources.list").is_file());
        // Existing content is kept
        assert!(ctx.rootdir.join("etc/hostname").is_file());
        Ok(())
    }

    #[test]
    fn test_overlay_file() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        std::fs::write(ctx.artifactdir.join("config.txt"), "arm_64bit=1\n")?;
        let mut a: OverlayAction = serde_yaml::from_str(
            "origin: artifacts\nsource: config.txt\ndestination: /boot/firmware/config.txt\n",
        )?;
        a.verify(&mut ctx)?;
        a.run(&mut ctx)?;
        let copied = std::fs::read_to_string(ctx.rootdir.join("boot/firmware/config.txt"))?;
        assert_eq!(copied, "arm_64bit=1\n");
        Ok(())
    }

    #[test]
    fn test_overlay_errors() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut ctx = test_context(&td);
        let mut a: OverlayAction = serde_yaml::from_str("source: /etc\n")?;
        assert!(a.verify(&mut ctx).is_err());
        let mut a: OverlayAction = serde_yaml::from_str("origin: firmware\nsource: x\n")?;
        a.verify(&mut ctx)?;
        assert!(a.run(&mut ctx).is_err());
        Ok(())
    }
}
