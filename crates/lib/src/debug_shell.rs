//! Interactive inspection of a failed build.

use std::process::Command;

use anyhow::Context as _;
use osbake_utils::{CommandRunExt, ResultExt};

use crate::context::Context;

/// Open the configured shell in the scratch directory and wait for it to
/// exit. Does nothing unless a debug shell was requested.
pub(crate) fn debug_shell(ctx: &Context) {
    let Some(shell) = ctx.debug_shell.as_deref() else {
        return;
    };
    tracing::info!("Starting debug shell in {}; exit it to continue", ctx.scratchdir);
    let mut cmd = Command::new(shell);
    cmd.current_dir(&ctx.scratchdir)
        .env("ROOTDIR", &ctx.rootdir)
        .env("ARTIFACTDIR", &ctx.artifactdir)
        .env("PS1", "(osbake-debug) \\w # ");
    if let Some(image) = ctx.image.as_deref() {
        cmd.env("IMAGE", image);
    }
    cmd.run_inherited()
        .with_context(|| format!("Running debug shell {shell}"))
        .log_err_default()
}
