//! Running external programs on the host or inside the target root.
//!
//! A [`Task`] is a labelled command. Its output is forwarded line by line
//! into our log, prefixed with the label, so that the output of e.g. a
//! package manager running in the target root can be told apart from ours.

use std::io::{BufRead, BufReader, Read};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use osbake_utils::{CommandRunExt, ResultExt};

use crate::context::Context;

/// Where the host keeps its static user-mode emulators.
const EMULATOR_DIR: &str = "/usr/bin";

/// How a command is confined to the target root.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum ChrootMethod {
    /// Run directly on the host.
    #[default]
    None,
    /// Plain chroot(8).
    Chroot,
    /// A systemd-nspawn container.
    Nspawn,
}

/// A command exited unsuccessfully.
#[derive(Debug, thiserror::Error)]
#[error("{label}: {program} failed: {status}")]
pub(crate) struct CommandError {
    pub(crate) label: String,
    pub(crate) program: String,
    pub(crate) status: ExitStatus,
}

#[derive(Debug)]
pub(crate) struct Task {
    label: String,
    program: String,
    args: Vec<String>,
    cwd: Option<Utf8PathBuf>,
    root: Option<Utf8PathBuf>,
    method: ChrootMethod,
    env: Vec<(String, String)>,
    binds: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    architecture: Option<String>,
    emulator_dir: Utf8PathBuf,
}

impl Task {
    pub(crate) fn new(label: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            root: None,
            method: ChrootMethod::None,
            env: Vec::new(),
            binds: Vec::new(),
            architecture: None,
            emulator_dir: EMULATOR_DIR.into(),
        }
    }

    /// A task confined to the build's current root, with access to the
    /// image and its partitions.
    pub(crate) fn for_context(
        ctx: &Context,
        label: impl Into<String>,
        program: impl Into<String>,
    ) -> Self {
        let mut task = Self::new(label, program)
            .chroot(&ctx.rootdir, ChrootMethod::Nspawn)
            .architecture(&ctx.scope.architecture);
        for (k, v) in &ctx.environ_vars {
            task = task.env(k, v);
        }
        if let Some(image) = ctx.image.as_deref() {
            task = task.bind_device(image);
            for p in ctx.image_partitions() {
                task = task.bind_device(&p.device_path);
            }
            task = task.bind_mount("/dev/disk", "/dev/disk");
        }
        task
    }

    pub(crate) fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub(crate) fn args<S: Into<String>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub(crate) fn cwd(mut self, dir: &Utf8Path) -> Self {
        self.cwd = Some(dir.to_owned());
        self
    }

    pub(crate) fn chroot(mut self, root: &Utf8Path, method: ChrootMethod) -> Self {
        self.root = (method != ChrootMethod::None).then(|| root.to_owned());
        self.method = method;
        self
    }

    pub(crate) fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Make the host path `src` visible at `dest` inside the root. Only
    /// honored by nspawn.
    pub(crate) fn bind_mount(
        mut self,
        src: impl Into<Utf8PathBuf>,
        dest: impl Into<Utf8PathBuf>,
    ) -> Self {
        self.binds.push((src.into(), dest.into()));
        self
    }

    /// Bind a device node at its canonical path.
    fn bind_device(self, dev: &Utf8Path) -> Self {
        let dev = dev.canonicalize_utf8().unwrap_or_else(|_| dev.to_owned());
        self.bind_mount(dev.clone(), dev)
    }

    /// The Debian name of the architecture the root is built for; foreign
    /// architectures get an emulator staged into the root.
    pub(crate) fn architecture(mut self, arch: &str) -> Self {
        self.architecture = Some(arch.to_owned());
        self
    }

    pub(crate) fn command(&self) -> Command {
        let mut cmd = match (self.method, self.root.as_deref()) {
            (ChrootMethod::Nspawn, Some(root)) => {
                let mut cmd = Command::new("systemd-nspawn");
                cmd.args([
                    "-q",
                    "--resolv-conf=off",
                    "--timezone=off",
                    "--register=no",
                    "--keep-unit",
                    "--console=pipe",
                ]);
                for (k, v) in &self.env {
                    cmd.arg(format!("--setenv={k}={v}"));
                }
                for (src, dest) in &self.binds {
                    cmd.arg(format!("--bind={src}:{dest}"));
                }
                cmd.arg("-D").arg(root).arg(&self.program);
                cmd
            }
            (ChrootMethod::Chroot, Some(root)) => {
                let mut cmd = Command::new("chroot");
                cmd.arg(root).arg(&self.program);
                cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
                cmd
            }
            _ => {
                let mut cmd = Command::new(&self.program);
                cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
                cmd
            }
        };
        cmd.args(&self.args);
        if let Some(cwd) = self.cwd.as_deref() {
            cmd.current_dir(cwd);
        }
        cmd
    }

    /// Run the task to completion, forwarding its output to the log.
    pub(crate) fn run(self) -> Result<()> {
        let _qemu = match (self.root.as_deref(), self.architecture.as_deref()) {
            (Some(root), Some(arch)) => QemuStaging::new(&self.emulator_dir, root, arch)?,
            _ => None,
        };
        let mut cmd = self.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.log_debug();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("{}: spawning {}", self.label, self.program))?;
        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_output(&self.label, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_output(&self.label, stderr));
        }
        let status = child.wait()?;
        for f in forwarders {
            if f.join().is_err() {
                tracing::warn!("{}: output forwarder panicked", self.label);
            }
        }
        if !status.success() {
            return Err(CommandError {
                label: self.label,
                program: self.program,
                status,
            }
            .into());
        }
        Ok(())
    }
}

/// Call `f` with each line read from `r`, without the newline. A final
/// line that isn't newline terminated is passed on too.
fn for_each_line(r: impl Read, mut f: impl FnMut(&str)) -> std::io::Result<()> {
    let mut r = BufReader::new(r);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if r.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        f(line.strip_suffix('\n').unwrap_or(&line));
    }
}

fn forward_output(label: &str, r: impl Read + Send + 'static) -> JoinHandle<()> {
    let label = label.to_owned();
    std::thread::spawn(move || {
        for_each_line(r, |line| tracing::info!("{label} | {line}"))
            .with_context(|| format!("{label}: reading output"))
            .log_err_default()
    })
}

/// The Debian name of the architecture we are running on.
pub(crate) fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "i386",
        "aarch64" => "arm64",
        "arm" => "armhf",
        "powerpc64" => "ppc64el",
        "mips64" => "mips64el",
        o => o,
    }
}

/// The user-mode emulator needed to run `arch` binaries on a `host`
/// machine, if any.
fn qemu_static_for(arch: &str, host: &str) -> Option<&'static str> {
    let (emulator, native): (_, &[&str]) = match arch {
        "amd64" => ("qemu-x86_64-static", &["amd64"]),
        "i386" => ("qemu-i386-static", &["amd64", "i386"]),
        "arm64" => ("qemu-aarch64-static", &["arm64"]),
        "armhf" | "armel" | "arm" => ("qemu-arm-static", &["arm64", "armhf", "armel", "arm"]),
        "mips64el" => ("qemu-mips64el-static", &["mips64el"]),
        "ppc64el" => ("qemu-ppc64le-static", &["ppc64el"]),
        "riscv64" => ("qemu-riscv64-static", &["riscv64"]),
        "s390x" => ("qemu-s390x-static", &["s390x"]),
        _ => return None,
    };
    (!native.contains(&host)).then_some(emulator)
}

/// An emulator copied into a root for the duration of a task.
#[derive(Debug)]
struct QemuStaging {
    dest: Utf8PathBuf,
}

impl QemuStaging {
    /// Copy the emulator for `arch` from `src_dir` into the root, unless
    /// `arch` runs natively.
    fn new(src_dir: &Utf8Path, root: &Utf8Path, arch: &str) -> Result<Option<Self>> {
        let Some(emulator) = qemu_static_for(arch, host_architecture()) else {
            return Ok(None);
        };
        let src = src_dir.join(emulator);
        let dest = root.join("usr/bin").join(emulator);
        // Left alone if the root already ships it
        if dest.exists() {
            return Ok(None);
        }
        tracing::debug!("Staging {src} into {root}");
        std::fs::create_dir_all(root.join("usr/bin"))?;
        std::fs::copy(&src, &dest).with_context(|| format!("Copying {src} to {dest}"))?;
        Ok(Some(Self { dest }))
    }
}

impl Drop for QemuStaging {
    fn drop(&mut self) {
        std::fs::remove_file(&self.dest)
            .with_context(|| format!("Removing {}", self.dest))
            .log_err_default()
    }
}
