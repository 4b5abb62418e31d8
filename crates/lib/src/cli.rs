//! # osbake command line interface
//!
//! Command line tool to build operating system images from YAML recipes.

use std::collections::BTreeMap;
use std::ffi::OsString;

use anyhow::{anyhow, Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};

use crate::context::Context;
use crate::machine::{Fakemachine, FakemachineOpts, Machine, MachineEnv};
use crate::pipeline;
use crate::recipe::Recipe;
use crate::task::host_architecture;

/// Parse a `KEY:VALUE` argument.
fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once(':')
        .ok_or_else(|| format!("expected KEY:VALUE, got {s:?}"))?;
    if k.is_empty() {
        return Err(format!("empty key in {s:?}"));
    }
    Ok((k.to_owned(), v.to_owned()))
}

/// Options for building an image from a recipe.
#[derive(Debug, clap::Args, PartialEq, Eq)]
pub(crate) struct BuildOpts {
    /// Path to the recipe file
    pub(crate) recipe: Option<Utf8PathBuf>,

    /// Template variable for the recipe, as KEY:VALUE
    #[clap(long, short = 't', value_name = "KEY:VALUE", value_parser = parse_key_value)]
    pub(crate) template_var: Vec<(String, String)>,

    /// Directory for the generated artifacts; defaults to the current directory
    #[clap(long)]
    pub(crate) artifactdir: Option<Utf8PathBuf>,

    /// Image device to use, as set up by the host
    #[clap(long, hide = true)]
    pub(crate) internal_image: Option<Utf8PathBuf>,

    /// Do not use a fakemachine, even if one is available
    #[clap(long)]
    pub(crate) disable_fakemachine: bool,

    /// Fakemachine backend to use (e.g. kvm, qemu, uml)
    #[clap(long, short = 'b')]
    pub(crate) fakemachine_backend: Option<String>,

    /// Memory for the fakemachine
    #[clap(long, short = 'm')]
    pub(crate) memory: Option<String>,

    /// Number of CPUs for the fakemachine
    #[clap(long, short = 'c')]
    pub(crate) cpus: Option<u32>,

    /// Size of the fakemachine scratch disk
    #[clap(long)]
    pub(crate) scratchsize: Option<String>,

    /// Environment variable for commands run by the build, as KEY:VALUE
    #[clap(long, short = 'e', value_name = "KEY:VALUE", value_parser = parse_key_value)]
    pub(crate) environ_var: Vec<(String, String)>,

    /// Host directory that actions can refer to by name, as NAME:PATH
    #[clap(long, value_name = "NAME:PATH", value_parser = parse_key_value)]
    pub(crate) origin: Vec<(String, String)>,

    /// Open a shell when the build fails
    #[clap(long)]
    pub(crate) debug_shell: bool,

    /// Shell to use for --debug-shell
    #[clap(long, short = 's', default_value = "/bin/bash")]
    pub(crate) shell: Utf8PathBuf,

    /// Print the actions of the recipe before building
    #[clap(long)]
    pub(crate) print_recipe: bool,

    /// Only parse and verify the recipe
    #[clap(long)]
    pub(crate) dry_run: bool,

    /// Verbose output
    #[clap(long, short = 'v')]
    pub(crate) verbose: bool,
}

impl BuildOpts {
    /// The command line for running this build again inside a fakemachine.
    fn guest_args(&self, recipe: &Utf8Path, artifactdir: &Utf8Path) -> Vec<String> {
        let mut args = vec!["--artifactdir".to_owned(), artifactdir.to_string()];
        for (k, v) in &self.template_var {
            args.push(format!("--template-var={k}:{v}"));
        }
        for (k, v) in &self.environ_var {
            args.push(format!("--environ-var={k}:{v}"));
        }
        for (name, path) in &self.origin {
            args.push(format!("--origin={name}:{path}"));
        }
        if self.debug_shell {
            args.push("--debug-shell".into());
            args.push(format!("--shell={}", self.shell));
        }
        if self.verbose {
            args.push("--verbose".into());
        }
        args.push(recipe.to_string());
        args
    }
}

/// Hidden commands used by osbake itself.
#[derive(Debug, Subcommand, PartialEq, Eq)]
pub(crate) enum InternalsOpts {
    /// Detach a loop device once our parent exits
    LoopbackCleanupHelper {
        /// Device path to clean up
        #[clap(long)]
        device: String,
    },
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub(crate) enum Command {
    #[clap(subcommand, hide = true)]
    Internals(InternalsOpts),
}

/// Build operating system images from YAML recipes.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "osbake", version, args_conflicts_with_subcommands = true)]
pub(crate) struct Opt {
    #[clap(subcommand)]
    pub(crate) command: Option<Command>,

    #[clap(flatten)]
    pub(crate) build: BuildOpts,
}

#[derive(Debug)]
struct ScratchDir {
    dir: tempfile::TempDir,
    path: Utf8PathBuf,
}

impl ScratchDir {
    fn new(parent: &Utf8Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(".osbake-")
            .tempdir_in(parent)
            .with_context(|| format!("Creating scratch directory in {parent}"))?;
        let path = Utf8PathBuf::try_from(dir.path().to_owned())?;
        Ok(Self { dir, path })
    }
}

fn build(mut opts: BuildOpts) -> Result<()> {
    let recipe_path = opts
        .recipe
        .as_deref()
        .ok_or_else(|| anyhow!("A recipe file is required"))?;
    let recipe_path = recipe_path
        .canonicalize_utf8()
        .with_context(|| format!("Finding recipe {recipe_path}"))?;
    let recipe_dir = recipe_path
        .parent()
        .ok_or_else(|| anyhow!("Recipe {recipe_path} has no parent directory"))?
        .to_owned();
    let vars: BTreeMap<_, _> = opts.template_var.iter().cloned().collect();
    let recipe = Recipe::load(&recipe_path, &vars)?;
    let architecture = recipe
        .architecture
        .clone()
        .unwrap_or_else(|| host_architecture().to_owned());
    let mut actions = recipe.actions;

    if opts.print_recipe {
        tracing::info!("Recipe {recipe_path} ({architecture}):");
        for a in &actions {
            tracing::info!("  - {}", crate::action::Action::describe(a));
        }
    }

    let artifactdir = match opts.artifactdir.as_deref() {
        Some(d) => d.to_owned(),
        None => Utf8PathBuf::try_from(std::env::current_dir()?)?,
    };
    std::fs::create_dir_all(&artifactdir).with_context(|| format!("Creating {artifactdir}"))?;
    let artifactdir = artifactdir.canonicalize_utf8()?;

    // The guest sees origins at the same absolute paths
    for (name, path) in opts.origin.iter_mut() {
        let resolved = Utf8Path::new(path.as_str())
            .canonicalize_utf8()
            .with_context(|| format!("Finding origin {name} at {path}"))?;
        *path = resolved.into_string();
    }

    let env = MachineEnv::detect();
    let use_machine = env.available && !opts.disable_fakemachine;
    if !env.inside && !use_machine {
        if !opts.disable_fakemachine {
            tracing::warn!("fakemachine is not available, building directly on the host");
        }
        if !rustix::process::getuid().is_root() {
            tracing::warn!("Building on the host usually needs to be done as root");
        }
    }

    let scratch_parent = if env.inside {
        Utf8Path::new("/scratch")
    } else {
        artifactdir.as_path()
    };
    let scratch = ScratchDir::new(scratch_parent)?;
    let mut ctx = Context::new(
        scratch.path.clone(),
        artifactdir.clone(),
        recipe_dir.clone(),
        architecture,
    );
    ctx.image = opts.internal_image.clone();
    ctx.environ_vars = opts.environ_var.iter().cloned().collect();
    ctx.verbose = opts.verbose;
    ctx.debug_shell = opts.debug_shell.then(|| opts.shell.clone());
    for (name, path) in &opts.origin {
        ctx.insert_origin(name, path.into())?;
    }
    std::fs::create_dir_all(&ctx.rootdir)?;

    if opts.dry_run {
        pipeline::verify(&mut ctx, &mut actions)?;
        tracing::info!("Recipe {recipe_path} is valid");
        return Ok(());
    }

    let r = if use_machine {
        let mut machine = Fakemachine::new(FakemachineOpts {
            backend: opts.fakemachine_backend.clone(),
            memory: opts.memory.clone(),
            cpus: opts.cpus,
            scratchsize: opts.scratchsize.clone(),
        });
        machine.add_volume(&artifactdir);
        machine.add_volume(&recipe_dir);
        for (_, path) in &opts.origin {
            machine.add_volume(Utf8Path::new(path));
        }
        for (k, v) in &opts.environ_var {
            machine.add_environ(k, v);
        }
        let args = opts.guest_args(&recipe_path, &artifactdir);
        let machine: &mut dyn Machine = &mut machine;
        pipeline::execute(&mut ctx, &mut actions, env, Some(machine), args)
    } else {
        pipeline::execute(&mut ctx, &mut actions, env, None, Vec::new())
    };
    // The scratch directory may hold a large root filesystem
    if let Err(e) = scratch.dir.close() {
        tracing::warn!("Removing scratch directory: {e}");
    }
    r?;
    tracing::info!("==> Recipe done");
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    let opt = Opt::parse_from(args);
    let level = if opt.build.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    osbake_utils::initialize_tracing(level);
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    match opt.command {
        Some(Command::Internals(InternalsOpts::LoopbackCleanupHelper { device })) => {
            osbake_blockdev::run_loopback_cleanup_helper(&device).await
        }
        None => build(opt.build),
    }
}
