//! The lifecycle shared by all recipe actions.
//!
//! Every action goes through up to six phases, driven by
//! [`crate::pipeline`]:
//!
//! - `verify`: validate configuration, without side effects
//! - `pre_machine` or `pre_no_machine`: host side preparation, depending on
//!   whether the build runs in a fakemachine
//! - `run`: the actual work, inside the fakemachine if there is one
//! - `cleanup`: undo what `run` set up; owed to every action whose `run` began
//! - `post_machine`: host side finalization
//! - `post_machine_cleanup`: undo the host side preparation; owed to every
//!   action whose pre-machine phase ran

use anyhow::Result;
use serde::Deserialize;

use crate::actions::{
    FilesystemDeployAction, ImagePartitionAction, OverlayAction, RawAction, RecipeAction,
    RunAction,
};
use crate::context::Context;
use crate::machine::Machine;

pub(crate) trait Action {
    fn verify(&mut self, _ctx: &mut Context) -> Result<()> {
        Ok(())
    }

    /// Prepare to run inside `machine`; arguments pushed onto `args` are
    /// appended to the command line of the guest.
    fn pre_machine(
        &mut self,
        _ctx: &mut Context,
        _machine: &mut dyn Machine,
        _args: &mut Vec<String>,
    ) -> Result<()> {
        Ok(())
    }

    fn pre_no_machine(&mut self, _ctx: &mut Context) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, _ctx: &mut Context) -> Result<()> {
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut Context) -> Result<()> {
        Ok(())
    }

    fn post_machine(&mut self, _ctx: &mut Context) -> Result<()> {
        Ok(())
    }

    fn post_machine_cleanup(&mut self, _ctx: &mut Context) -> Result<()> {
        Ok(())
    }

    /// Human readable summary, used in logs.
    fn describe(&self) -> String;
}

/// An action as configured in a recipe, selected by its `action` key.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub(crate) enum ActionKind {
    ImagePartition(ImagePartitionAction),
    Raw(RawAction),
    FilesystemDeploy(FilesystemDeployAction),
    Run(RunAction),
    Overlay(OverlayAction),
    Recipe(RecipeAction),
}

impl ActionKind {
    fn inner(&mut self) -> &mut dyn Action {
        match self {
            ActionKind::ImagePartition(a) => a,
            ActionKind::Raw(a) => a,
            ActionKind::FilesystemDeploy(a) => a,
            ActionKind::Run(a) => a,
            ActionKind::Overlay(a) => a,
            ActionKind::Recipe(a) => a,
        }
    }

    fn inner_ref(&self) -> &dyn Action {
        match self {
            ActionKind::ImagePartition(a) => a,
            ActionKind::Raw(a) => a,
            ActionKind::FilesystemDeploy(a) => a,
            ActionKind::Run(a) => a,
            ActionKind::Overlay(a) => a,
            ActionKind::Recipe(a) => a,
        }
    }
}

impl Action for ActionKind {
    fn verify(&mut self, ctx: &mut Context) -> Result<()> {
        self.inner().verify(ctx)
    }

    fn pre_machine(
        &mut self,
        ctx: &mut Context,
        machine: &mut dyn Machine,
        args: &mut Vec<String>,
    ) -> Result<()> {
        self.inner().pre_machine(ctx, machine, args)
    }

    fn pre_no_machine(&mut self, ctx: &mut Context) -> Result<()> {
        self.inner().pre_no_machine(ctx)
    }

    fn run(&mut self, ctx: &mut Context) -> Result<()> {
        self.inner().run(ctx)
    }

    fn cleanup(&mut self, ctx: &mut Context) -> Result<()> {
        self.inner().cleanup(ctx)
    }

    fn post_machine(&mut self, ctx: &mut Context) -> Result<()> {
        self.inner().post_machine(ctx)
    }

    fn post_machine_cleanup(&mut self, ctx: &mut Context) -> Result<()> {
        self.inner().post_machine_cleanup(ctx)
    }

    fn describe(&self) -> String {
        self.inner_ref().describe()
    }
}

/// Use the configured description if there is one.
pub(crate) fn describe_or(description: Option<&str>, f: impl FnOnce() -> String) -> String {
    description.map(ToOwned::to_owned).unwrap_or_else(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_parse_kinds() {
        let actions: Vec<ActionKind> = serde_yaml::from_str(indoc! { r#"
            - action: overlay
              source: overlays/etc
            - action: run
              description: Set hostname
              chroot: true
              command: echo myhost > /etc/hostname
            - action: filesystem-deploy
              append-kernel-cmdline: console=ttyS0
        "# })
        .unwrap();
        assert_eq!(actions.len(), 3);
        assert!(matches!(actions[0], ActionKind::Overlay(_)));
        assert_eq!(actions[1].describe(), "Set hostname");
        assert!(matches!(actions[2], ActionKind::FilesystemDeploy(_)));
    }

    #[test]
    fn test_parse_unknown() {
        // Unknown kinds and unknown fields are both rejected
        let r: Result<Vec<ActionKind>, _> = serde_yaml::from_str("- action: debootstrap\n");
        assert!(r.is_err());
        let r: Result<Vec<ActionKind>, _> =
            serde_yaml::from_str("- action: overlay\n  source: foo\n  sauce: bar\n");
        assert!(r.is_err());
        let r: Result<Vec<ActionKind>, _> = serde_yaml::from_str("- source: foo\n");
        assert!(r.is_err());
    }
}
