//! Driving a list of actions through their lifecycle.
//!
//! Where each phase runs depends on whether we are inside the fakemachine
//! and whether one is available:
//!
//! | where                 | host                                   | guest          |
//! |-----------------------|----------------------------------------|----------------|
//! | with a fakemachine    | pre_machine, post_machine(_cleanup)    | run, cleanup   |
//! | without               | everything but pre_machine             |                |
//!
//! Cleanups are owed only to actions which reached the matching phase and
//! are always attempted, in reverse order, even when something failed.

use anyhow::{Context as _, Result};
use osbake_utils::ResultExt;

use crate::action::Action;
use crate::context::{BuildState, Context};
use crate::debug_shell::debug_shell;
use crate::machine::{Machine, MachineEnv};

/// How far an action got.
#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    pre_ran: bool,
    run_began: bool,
}

#[derive(Debug)]
struct Pipeline<'a, A> {
    actions: &'a mut [A],
    progress: Vec<Progress>,
}

/// Mark the build as failed, and give the user a chance to look around
/// the first time this happens.
fn failed(ctx: &mut Context, e: anyhow::Error, action: &str, stage: &str) -> anyhow::Error {
    let first = ctx.state() == BuildState::Success;
    ctx.mark_failed();
    let e = e.context(format!("Action `{action}` failed at stage {stage}"));
    if first && ctx.debug_shell.is_some() {
        tracing::error!("{e:#}");
        debug_shell(ctx);
    }
    e
}

/// Keep the first error, logging any later ones.
pub(crate) fn merge(first: Result<()>, later: Result<()>) -> Result<()> {
    match (first, later) {
        (Err(e), later) => {
            later.log_err_default();
            Err(e)
        }
        (Ok(()), later) => later,
    }
}

impl<'a, A: Action> Pipeline<'a, A> {
    fn new(actions: &'a mut [A]) -> Self {
        let progress = vec![Progress::default(); actions.len()];
        Self { actions, progress }
    }

    fn verify(&mut self, ctx: &mut Context) -> Result<()> {
        for a in self.actions.iter_mut() {
            a.verify(ctx)
                .with_context(|| format!("Verifying action `{}`", a.describe()))?;
        }
        Ok(())
    }

    fn pre_no_machine(&mut self, ctx: &mut Context) -> Result<()> {
        for (a, p) in self.actions.iter_mut().zip(self.progress.iter_mut()) {
            p.pre_ran = true;
            if let Err(e) = a.pre_no_machine(ctx) {
                return Err(failed(ctx, e, &a.describe(), "PreNoMachine"));
            }
        }
        Ok(())
    }

    fn pre_machine(
        &mut self,
        ctx: &mut Context,
        machine: &mut dyn Machine,
        args: &mut Vec<String>,
    ) -> Result<()> {
        for (a, p) in self.actions.iter_mut().zip(self.progress.iter_mut()) {
            p.pre_ran = true;
            if let Err(e) = a.pre_machine(ctx, machine, args) {
                return Err(failed(ctx, e, &a.describe(), "PreMachine"));
            }
        }
        Ok(())
    }

    /// Run every action, stopping at the first failure, then clean up after
    /// every action which started running.
    fn run(&mut self, ctx: &mut Context) -> Result<()> {
        let mut r = Ok(());
        for (a, p) in self.actions.iter_mut().zip(self.progress.iter_mut()) {
            p.run_began = true;
            tracing::info!("==> {}", a.describe());
            if let Err(e) = a.run(ctx) {
                r = Err(failed(ctx, e, &a.describe(), "Run"));
                break;
            }
        }
        let cleanup = self.cleanup(ctx);
        merge(r, cleanup)
    }

    fn cleanup(&mut self, ctx: &mut Context) -> Result<()> {
        let mut r = Ok(());
        for (a, p) in self.actions.iter_mut().zip(&self.progress).rev() {
            if !p.run_began {
                continue;
            }
            if let Err(e) = a.cleanup(ctx) {
                let e = failed(ctx, e, &a.describe(), "Cleanup");
                r = merge(r, Err(e));
            }
        }
        r
    }

    fn post_machine(&mut self, ctx: &mut Context) -> Result<()> {
        for (a, p) in self.actions.iter_mut().zip(&self.progress) {
            if !p.pre_ran {
                continue;
            }
            if let Err(e) = a.post_machine(ctx) {
                return Err(failed(ctx, e, &a.describe(), "PostMachine"));
            }
        }
        Ok(())
    }

    fn post_machine_cleanup(&mut self, ctx: &mut Context) -> Result<()> {
        let mut r = Ok(());
        for (a, p) in self.actions.iter_mut().zip(&self.progress).rev() {
            if !p.pre_ran {
                continue;
            }
            if let Err(e) = a.post_machine_cleanup(ctx) {
                let e = failed(ctx, e, &a.describe(), "PostMachineCleanup");
                r = merge(r, Err(e));
            }
        }
        r
    }

    /// Finalization on the host is owed to every action whose pre-phase
    /// ran, whatever the outcome of running the build.
    fn host_phases(&mut self, ctx: &mut Context) -> Result<()> {
        self.pre_no_machine(ctx)?;
        let r = self.run(ctx);
        let post = self.post_machine(ctx);
        merge(r, post)
    }

    fn machine_phases(
        &mut self,
        ctx: &mut Context,
        machine: &mut dyn Machine,
        mut args: Vec<String>,
    ) -> Result<()> {
        self.pre_machine(ctx, machine, &mut args)?;
        let r = match machine.run(&args) {
            Ok(0) => Ok(()),
            Ok(code) => Err(anyhow::anyhow!(
                "Build failed inside the fakemachine (exit code {code})"
            )),
            Err(e) => Err(e),
        };
        if r.is_err() {
            ctx.mark_failed();
        }
        let post = self.post_machine(ctx);
        merge(r, post)
    }
}

/// Check every action's configuration.
pub(crate) fn verify<A: Action>(ctx: &mut Context, actions: &mut [A]) -> Result<()> {
    Pipeline::new(actions).verify(ctx)
}

/// Execute all phases of `actions` that belong where we are running.
///
/// When a fakemachine is used, `args` is the command line the guest is
/// started with; actions may extend it.
pub(crate) fn execute<A: Action>(
    ctx: &mut Context,
    actions: &mut [A],
    env: MachineEnv,
    machine: Option<&mut dyn Machine>,
    args: Vec<String>,
) -> Result<()> {
    let mut pipeline = Pipeline::new(actions);
    pipeline.verify(ctx)?;
    if env.inside {
        return pipeline.run(ctx);
    }
    let r = match machine.filter(|_| env.available) {
        Some(machine) => pipeline.machine_phases(ctx, machine, args),
        None => pipeline.host_phases(ctx),
    };
    let cleanup = pipeline.post_machine_cleanup(ctx);
    merge(r, cleanup)
}
