//! Running the build inside a fakemachine virtual machine.
//!
//! The host side prepares the machine (volumes to share, disk images to
//! attach) and then re-invokes this program inside it with the original
//! command line, plus whatever the actions forwarded.

use std::process::Command;

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use osbake_utils::CommandRunExt;

/// Set by fakemachine in the environment of the guest.
const IN_MACHINE_ENV: &str = "IN_FAKE_MACHINE";
const FAKEMACHINE: &str = "fakemachine";
/// Where attached images show up inside the guest.
const GUEST_DISK_DIR: &str = "/dev/disk/by-fakemachine-label";

/// The sandbox as seen by the build engine.
pub(crate) trait Machine {
    /// Arrange for an image of `size` bytes backed by the host file `path`,
    /// returning the path under which the guest will see it.
    fn create_image(&mut self, path: &Utf8Path, size: u64) -> Result<Utf8PathBuf>;

    /// Share a host directory with the guest at the same path.
    fn add_volume(&mut self, path: &Utf8Path);

    /// Boot the machine and run ourselves with `args`, blocking until the
    /// guest exits. Returns the exit code of the guest command.
    fn run(&mut self, args: &[String]) -> Result<i32>;
}

/// Where we are running, relative to the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MachineEnv {
    /// We are the guest.
    pub(crate) inside: bool,
    /// A sandbox could be started from here.
    pub(crate) available: bool,
}

impl MachineEnv {
    pub(crate) fn detect() -> Self {
        let inside = in_machine();
        Self {
            inside,
            available: !inside && supported(),
        }
    }
}

/// Whether we are running inside a fakemachine.
pub(crate) fn in_machine() -> bool {
    std::env::var_os(IN_MACHINE_ENV).is_some()
}

/// Whether fakemachine can be used on this host.
pub(crate) fn supported() -> bool {
    let found = which::which(FAKEMACHINE)
        .map_err(|e| tracing::debug!("{FAKEMACHINE}: {e}"))
        .is_ok();
    found && Utf8Path::new("/dev/kvm").exists()
}

/// Tunables of the virtual machine, as given on the command line.
#[derive(Debug, Default, Clone)]
pub(crate) struct FakemachineOpts {
    pub(crate) backend: Option<String>,
    pub(crate) memory: Option<String>,
    pub(crate) cpus: Option<u32>,
    pub(crate) scratchsize: Option<String>,
}

#[derive(Debug)]
pub(crate) struct Fakemachine {
    opts: FakemachineOpts,
    volumes: Vec<Utf8PathBuf>,
    images: Vec<(Utf8PathBuf, u64)>,
    environ: Vec<(String, String)>,
}

impl Fakemachine {
    pub(crate) fn new(opts: FakemachineOpts) -> Self {
        Self {
            opts,
            volumes: Vec::new(),
            images: Vec::new(),
            environ: Vec::new(),
        }
    }

    /// Export an environment variable to the guest.
    pub(crate) fn add_environ(&mut self, key: &str, value: &str) {
        self.environ.push((key.to_owned(), value.to_owned()));
    }

    fn command(&self, exe: &Utf8Path, args: &[String]) -> Command {
        let mut cmd = Command::new(FAKEMACHINE);
        if let Some(backend) = self.opts.backend.as_deref() {
            cmd.args(["--backend", backend]);
        }
        if let Some(memory) = self.opts.memory.as_deref() {
            cmd.args(["--memory", memory]);
        }
        if let Some(cpus) = self.opts.cpus {
            cmd.arg("--cpus").arg(cpus.to_string());
        }
        if let Some(scratch) = self.opts.scratchsize.as_deref() {
            cmd.args(["--scratchsize", scratch]);
        }
        for v in &self.volumes {
            cmd.args(["--volume", v.as_str()]);
        }
        for (path, size) in &self.images {
            cmd.arg("--image").arg(format!("{path}:{size}"));
        }
        for (k, v) in &self.environ {
            cmd.arg("--environ-var").arg(format!("{k}:{v}"));
        }
        cmd.arg("--").arg(exe).args(args);
        cmd
    }
}

impl Machine for Fakemachine {
    fn create_image(&mut self, path: &Utf8Path, size: u64) -> Result<Utf8PathBuf> {
        if self.images.iter().any(|(p, _)| p == path) {
            anyhow::bail!("Image {path} was already added to the machine");
        }
        self.images.push((path.to_owned(), size));
        let n = self.images.len() - 1;
        Ok(Utf8PathBuf::from(format!("{GUEST_DISK_DIR}/fakedisk-{n}")))
    }

    fn add_volume(&mut self, path: &Utf8Path) {
        if !self.volumes.iter().any(|v| v == path) {
            self.volumes.push(path.to_owned());
        }
    }

    #[context("Running fakemachine")]
    fn run(&mut self, args: &[String]) -> Result<i32> {
        let exe = osbake_utils::reexec::executable_path()?;
        let exe = Utf8PathBuf::try_from(exe)?;
        // The guest only sees what we share with it
        if let Some(dir) = exe.parent() {
            self.add_volume(dir);
        }
        let mut cmd = self.command(&exe, args);
        tracing::info!("Running {} inside a fakemachine", exe);
        // The VM must not outlive us if we are killed
        let status = cmd
            .lifecycle_bind()
            .log_debug()
            .status()
            .with_context(|| format!("Spawning {FAKEMACHINE}"))?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records what the engine asks of the machine.
    #[derive(Debug, Default)]
    pub(crate) struct MockMachine {
        pub(crate) images: Vec<(Utf8PathBuf, u64)>,
        pub(crate) volumes: Vec<Utf8PathBuf>,
        pub(crate) runs: Vec<Vec<String>>,
        pub(crate) exit_code: i32,
    }

    impl Machine for MockMachine {
        fn create_image(&mut self, path: &Utf8Path, size: u64) -> Result<Utf8PathBuf> {
            self.images.push((path.to_owned(), size));
            Ok(format!("/dev/vd{}", self.images.len()).into())
        }

        fn add_volume(&mut self, path: &Utf8Path) {
            self.volumes.push(path.to_owned());
        }

        fn run(&mut self, args: &[String]) -> Result<i32> {
            self.runs.push(args.to_vec());
            Ok(self.exit_code)
        }
    }

    #[test]
    fn test_fakemachine_command() -> Result<()> {
        let mut m = Fakemachine::new(FakemachineOpts {
            backend: Some("qemu".into()),
            memory: Some("2G".into()),
            cpus: Some(4),
            scratchsize: None,
        });
        m.add_volume(Utf8Path::new("/srv/artifacts"));
        m.add_volume(Utf8Path::new("/srv/recipes"));
        m.add_volume(Utf8Path::new("/srv/artifacts"));
        let img = m.create_image(Utf8Path::new("/srv/artifacts/disk.img"), 1 << 30)?;
        assert_eq!(img, "/dev/disk/by-fakemachine-label/fakedisk-0");
        assert!(m
            .create_image(Utf8Path::new("/srv/artifacts/disk.img"), 1 << 30)
            .is_err());
        m.add_environ("http_proxy", "http://proxy:3128");
        let args = vec!["--internal-image".to_owned(), img.to_string()];
        let cmd = m.command(Utf8Path::new("/usr/bin/osbake"), &args);
        assert_eq!(cmd.get_program(), "fakemachine");
        let argv: Vec<_> = cmd.get_args().map(|a| a.to_str().unwrap()).collect();
        similar_asserts::assert_eq!(
            argv,
            [
                "--backend",
                "qemu",
                "--memory",
                "2G",
                "--cpus",
                "4",
                "--volume",
                "/srv/artifacts",
                "--volume",
                "/srv/recipes",
                "--image",
                "/srv/artifacts/disk.img:1073741824",
                "--environ-var",
                "http_proxy:http://proxy:3128",
                "--",
                "/usr/bin/osbake",
                "--internal-image",
                "/dev/disk/by-fakemachine-label/fakedisk-0",
            ]
        );
        Ok(())
    }
}
