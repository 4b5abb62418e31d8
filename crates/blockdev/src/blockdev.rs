//! Block device helpers: image files, loop devices, partition naming and
//! filesystem formatting.

use std::env;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;
use serde::Deserialize;

use osbake_utils::CommandRunExt;

/// Environment variable set on the loopback cleanup helper process.
pub const LOOPBACK_CLEANUP_HELPER_ENV: &str = "OSBAKE_LOOPBACK_CLEANUP_HELPER";

#[derive(Debug, Deserialize)]
struct SfDiskOutput {
    partitiontable: PartitionTable,
}

/// A single partition as reported by `sfdisk -J`.
#[derive(Debug, Deserialize)]
pub struct Partition {
    /// Device node, e.g. `/dev/loop0p1`
    pub node: String,
    /// Start sector
    pub start: u64,
    /// Size in sectors
    pub size: u64,
    /// Partition type GUID or MBR id
    #[serde(rename = "type")]
    pub parttype: String,
    /// GPT partition UUID
    pub uuid: Option<String>,
    /// GPT partition name
    pub name: Option<String>,
}

/// The partition table label.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    /// MBR
    Dos,
    /// GUID partition table
    Gpt,
    /// Anything else sfdisk may report
    #[serde(untagged)]
    Unknown(String),
}

/// A partition table as reported by `sfdisk -J`.
#[derive(Debug, Deserialize)]
pub struct PartitionTable {
    /// Table type
    pub label: PartitionType,
    /// Disk identifier
    pub id: String,
    /// The device holding the table
    pub device: String,
    /// Partitions in table order
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

/// List the partitions of a device.
#[context("Listing partitions of {dev}")]
pub fn partitions_of(dev: &Utf8Path) -> Result<PartitionTable> {
    let o: SfDiskOutput = Command::new("sfdisk")
        .args(["-J", dev.as_str()])
        .run_and_parse_json()?;
    Ok(o.partitiontable)
}

/// A loop device attached to an image file; detached on [`LoopbackDevice::close`]
/// or, as a best effort, on drop.
#[derive(Debug)]
pub struct LoopbackDevice {
    dev: Option<Utf8PathBuf>,
    // Handle to the cleanup helper process
    cleanup_handle: Option<LoopbackCleanupHandle>,
}

/// Handle to manage the cleanup helper process for loopback devices
#[derive(Debug)]
struct LoopbackCleanupHandle {
    /// Child process handle
    child: std::process::Child,
}

impl LoopbackDevice {
    /// Create a new loopback block device targeting the provided file path,
    /// with partition scanning enabled.
    #[context("Attaching loop device to {path}")]
    pub fn new(path: &Utf8Path) -> Result<Self> {
        let direct_io = match env::var("OSBAKE_DIRECT_IO").as_deref() {
            Ok("on") => "on",
            _ => "off",
        };

        let dev = Command::new("losetup")
            .args([
                "--show",
                format!("--direct-io={direct_io}").as_str(),
                "-P",
                "--find",
            ])
            .arg(path)
            .log_debug()
            .run_get_string()?;
        let dev = Utf8PathBuf::from(dev.trim());
        tracing::debug!("Allocated loopback {dev}");

        // Try to spawn cleanup helper, but don't fail if it doesn't work
        let cleanup_handle = match Self::spawn_cleanup_helper(dev.as_str()) {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(
                    "Failed to spawn loopback cleanup helper for {}: {}. \
                     Loopback device may not be cleaned up if process is interrupted.",
                    dev,
                    e
                );
                None
            }
        };

        Ok(Self {
            dev: Some(dev),
            cleanup_handle,
        })
    }

    /// Access the path to the loopback block device.
    pub fn path(&self) -> Option<&Utf8Path> {
        self.dev.as_deref()
    }

    /// Spawn a cleanup helper process that will clean up the loopback device
    /// if the parent process dies unexpectedly
    fn spawn_cleanup_helper(device_path: &str) -> Result<LoopbackCleanupHandle> {
        let self_path = osbake_utils::reexec::executable_path()
            .context("Failed to locate osbake binary for cleanup helper")?;

        let mut cmd = Command::new(self_path);
        cmd.args([
            "internals",
            "loopback-cleanup-helper",
            "--device",
            device_path,
        ]);
        cmd.env(LOOPBACK_CLEANUP_HELPER_ENV, "1");
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        // Don't redirect stderr so we can see error messages

        let child = cmd
            .spawn()
            .context("Failed to spawn loopback cleanup helper")?;

        Ok(LoopbackCleanupHandle { child })
    }

    // Shared backend for our `close` and `drop` implementations.
    fn impl_close(&mut self) -> Result<()> {
        let Some(dev) = self.dev.take() else {
            tracing::trace!("loopback device already deallocated");
            return Ok(());
        };

        // Kill the cleanup helper since we're cleaning up normally
        if let Some(mut cleanup_handle) = self.cleanup_handle.take() {
            let _ = cleanup_handle.child.kill();
            let _ = cleanup_handle.child.wait();
        }

        tracing::debug!("Detaching loopback {dev}");
        Command::new("losetup")
            .args(["-d", dev.as_str()])
            .run_capture_stderr()
            .with_context(|| format!("Detaching {dev}"))
    }

    /// Consume this device, detaching it.
    pub fn close(mut self) -> Result<()> {
        self.impl_close()
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        // Best effort to detach if we're dropped without invoking `close`
        if let Err(e) = self.impl_close() {
            tracing::warn!("{e:#}");
        }
    }
}

/// Main function for the loopback cleanup helper process
/// This function does not return - it either exits normally or via signal
pub async fn run_loopback_cleanup_helper(device_path: &str) -> Result<()> {
    if std::env::var(LOOPBACK_CLEANUP_HELPER_ENV).is_err() {
        anyhow::bail!("This function should only be called as a cleanup helper");
    }

    // Set up death signal notification - we want to be notified when parent dies
    rustix::process::set_parent_process_death_signal(Some(rustix::process::Signal::TERM))
        .context("Failed to set parent death signal")?;

    // Wait for SIGTERM (either from parent death or normal cleanup)
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to create signal stream")?
        .recv()
        .await;

    let output = std::process::Command::new("losetup")
        .args(["-d", device_path])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            tracing::info!("Cleaned up leaked loopback device {}", device_path);
            std::process::exit(0);
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(
                "Failed to clean up loopback device {}: {}. Stderr: {}",
                device_path,
                output.status,
                stderr.trim()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!(
                "Error executing losetup to clean up loopback device {}: {}",
                device_path,
                e
            );
            std::process::exit(1);
        }
    }
}

/// Parse a human readable size into bytes.
///
/// Plain numbers are bytes. `K`, `M`, `G`, `T`, `P` (optionally followed by `B`)
/// are decimal multiples, the `KiB`-style forms are binary multiples. Units are
/// case-insensitive. Fractional values are rejected.
pub fn parse_size(s: &str) -> Result<u64> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| Regex::new(r"^(\d+)\s*([A-Za-z]*)$").unwrap());
    let caps = regex
        .captures(s.trim())
        .ok_or_else(|| anyhow!("Invalid size: {s:?}"))?;
    let v: u64 = caps[1]
        .parse()
        .with_context(|| format!("Parsing size {s:?}"))?;
    let unit = caps[2].to_ascii_lowercase();
    let (prefix, binary) = match unit.strip_suffix("ib") {
        Some(p) => (p, true),
        None => (unit.strip_suffix('b').unwrap_or(&unit), false),
    };
    let exp = match prefix {
        "" if !binary => 0,
        "k" => 1,
        "m" => 2,
        "g" => 3,
        "t" => 4,
        "p" => 5,
        _ => anyhow::bail!("Unknown size unit in {s:?}"),
    };
    let base: u64 = if binary { 1024 } else { 1000 };
    base.checked_pow(exp)
        .and_then(|mul| v.checked_mul(mul))
        .ok_or_else(|| anyhow!("Size overflows: {s:?}"))
}

/// Create (or truncate) a sparse image file of exactly `size` bytes.
#[context("Creating image file {path}")]
pub fn create_image_file(path: &Utf8Path, size: u64) -> Result<()> {
    let f = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    f.set_len(size)?;
    tracing::debug!("Created {path} with size {size}");
    Ok(())
}

/// Derive the device node of partition `number` of `dev`.
///
/// If the device name ends in a digit (`/dev/loop0`, `/dev/nvme0n1`) the
/// partition is `<dev>p<N>`, otherwise it's `<dev><N>` (`/dev/sda1`).
/// Other naming schemes (e.g. `/dev/disk/by-id/…-part1`) are not handled.
pub fn partition_device_path(dev: &Utf8Path, number: u32) -> Utf8PathBuf {
    let s = dev.as_str();
    let ends_in_digit = s.chars().last().is_some_and(|c| c.is_ascii_digit());
    if ends_in_digit {
        format!("{s}p{number}").into()
    } else {
        format!("{s}{number}").into()
    }
}

/// Like [`partition_device_path`], but resolving symlinks (e.g. udev
/// `by-label` links) to the canonical device first.
pub fn resolve_partition_device(dev: &Utf8Path, number: u32) -> Utf8PathBuf {
    let canonical = dev.canonicalize_utf8().unwrap_or_else(|e| {
        tracing::debug!("Not canonicalizing {dev}: {e}");
        dev.to_owned()
    });
    partition_device_path(&canonical, number)
}

/// Build the mkfs invocation for a filesystem type; `None` means the
/// partition is left unformatted.
pub fn mkfs_command(fs: &str, label: &str, dev: &Utf8Path) -> Option<Command> {
    let mut cmd;
    match fs {
        "none" => return None,
        "vfat" | "fat32" | "fat16" | "fat12" => {
            let bits = fs.strip_prefix("fat").unwrap_or("32");
            cmd = Command::new("mkfs.vfat");
            cmd.args(["-F", bits, "-n", label]);
        }
        // Copy-on-write filesystems refuse to overwrite existing signatures
        "btrfs" | "xfs" => {
            cmd = Command::new(format!("mkfs.{fs}"));
            cmd.args(["-f", "-L", label]);
        }
        "f2fs" => {
            cmd = Command::new("mkfs.f2fs");
            cmd.args(["-f", "-l", label]);
        }
        "swap" | "linux-swap" => {
            cmd = Command::new("mkswap");
            cmd.args(["-L", label]);
        }
        o => {
            cmd = Command::new(format!("mkfs.{o}"));
            cmd.args(["-L", label]);
        }
    }
    cmd.arg(dev);
    Some(cmd)
}

/// Format `dev` with filesystem `fs`.
#[context("Formatting {dev} as {fs}")]
pub fn format(dev: &Utf8Path, fs: &str, label: &str) -> Result<()> {
    let Some(mut cmd) = mkfs_command(fs, label, dev) else {
        tracing::debug!("Not formatting {dev}");
        return Ok(());
    };
    cmd.log_debug().run_capture_stderr()
}

/// Query the filesystem UUID of a device, probing it directly rather than
/// trusting the blkid cache.
#[context("Querying filesystem UUID of {dev}")]
pub fn filesystem_uuid(dev: &Utf8Path) -> Result<String> {
    let uuid = Command::new("blkid")
        .args(["-o", "value", "-s", "UUID", "-p", "-c", "none"])
        .arg(dev)
        .log_debug()
        .run_get_string()?;
    let uuid = uuid.trim();
    if uuid.is_empty() {
        anyhow::bail!("No filesystem UUID found");
    }
    Ok(uuid.to_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_size() {
        let cases = [
            ("0", 0),
            ("512", 512),
            ("10B", 10),
            ("1KB", 1000),
            ("1k", 1000),
            ("1KiB", 1024),
            ("2MiB", 2 * 1024 * 1024),
            ("1GB", 1_000_000_000),
            ("1gb", 1_000_000_000),
            ("1G", 1_000_000_000),
            ("4GiB", 4 * 1024 * 1024 * 1024),
            ("3 TB", 3_000_000_000_000),
        ];
        for (s, v) in cases {
            assert_eq!(parse_size(s).unwrap(), v, "Parsing {s}");
        }
    }

    #[test]
    fn test_parse_size_invalid() {
        for s in ["", "GB", "1.5GB", "-1", "12XB", "1iB", "1GB extra"] {
            assert!(parse_size(s).is_err(), "Parsing {s}");
        }
        assert!(parse_size("99999999999PB").is_err());
    }

    #[test]
    fn test_partition_device_path() {
        let cases = [
            ("/dev/sda", 1, "/dev/sda1"),
            ("/dev/vdb", 12, "/dev/vdb12"),
            ("/dev/loop0", 1, "/dev/loop0p1"),
            ("/dev/loop12", 3, "/dev/loop12p3"),
            ("/dev/nvme0n1", 2, "/dev/nvme0n1p2"),
            ("/dev/mmcblk0", 1, "/dev/mmcblk0p1"),
        ];
        for (dev, n, expected) in cases {
            assert_eq!(
                partition_device_path(Utf8Path::new(dev), n),
                Utf8Path::new(expected)
            );
        }
    }

    #[test]
    fn test_resolve_partition_device_nonexistent() {
        // Unresolvable paths are used verbatim
        let p = resolve_partition_device(Utf8Path::new("/nonexistent/disk0"), 4);
        assert_eq!(p, "/nonexistent/disk0p4");
    }

    #[test]
    fn test_create_image_file() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = Utf8PathBuf::try_from(td.path().join("disk.img"))?;
        create_image_file(&path, 4096)?;
        assert_eq!(std::fs::metadata(&path)?.len(), 4096);
        // Truncates an existing file
        std::fs::write(&path, vec![1u8; 8192])?;
        create_image_file(&path, 1024)?;
        let content = std::fs::read(&path)?;
        assert_eq!(content, vec![0u8; 1024]);
        Ok(())
    }

    fn args_of(cmd: &Command) -> (String, Vec<String>) {
        (
            cmd.get_program().to_string_lossy().into_owned(),
            cmd.get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect(),
        )
    }

    #[test]
    fn test_mkfs_command() {
        let dev = Utf8Path::new("/dev/loop0p1");
        assert!(mkfs_command("none", "x", dev).is_none());

        let (prog, args) = args_of(&mkfs_command("fat32", "boot", dev).unwrap());
        assert_eq!(prog, "mkfs.vfat");
        assert_eq!(args, ["-F", "32", "-n", "boot", "/dev/loop0p1"]);

        let (prog, args) = args_of(&mkfs_command("vfat", "boot", dev).unwrap());
        assert_eq!(prog, "mkfs.vfat");
        assert_eq!(args, ["-F", "32", "-n", "boot", "/dev/loop0p1"]);

        let (prog, args) = args_of(&mkfs_command("fat16", "boot", dev).unwrap());
        assert_eq!(prog, "mkfs.vfat");
        assert_eq!(args[..2], ["-F", "16"]);

        let (prog, args) = args_of(&mkfs_command("btrfs", "root", dev).unwrap());
        assert_eq!(prog, "mkfs.btrfs");
        assert_eq!(args, ["-f", "-L", "root", "/dev/loop0p1"]);

        let (prog, args) = args_of(&mkfs_command("ext4", "root", dev).unwrap());
        assert_eq!(prog, "mkfs.ext4");
        assert_eq!(args, ["-L", "root", "/dev/loop0p1"]);
    }

    #[test]
    fn test_parse_sfdisk() -> Result<()> {
        let fixture = indoc::indoc! { r#"
        {
            "partitiontable": {
               "label": "gpt",
               "id": "A67AA901-2C72-4818-B098-7F1CAC127279",
               "device": "/dev/loop0",
               "unit": "sectors",
               "firstlba": 34,
               "lastlba": 20971486,
               "sectorsize": 512,
               "partitions": [
                  {
                     "node": "/dev/loop0p1",
                     "start": 2048,
                     "size": 524288,
                     "type": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B",
                     "uuid": "58A4C5F0-BD12-424C-B563-195AC65A25DD",
                     "name": "boot"
                  },{
                     "node": "/dev/loop0p2",
                     "start": 526336,
                     "size": 20445151,
                     "type": "0FC63DAF-8483-4772-8E79-3D69D8477DE4",
                     "uuid": "F51ABB0D-DA16-4A21-83CB-37F4C805AAA0",
                     "name": "root"
                  }
               ]
            }
         }
        "# };
        let table: SfDiskOutput = serde_json::from_str(fixture).unwrap();
        let table = table.partitiontable;
        assert_eq!(table.label, PartitionType::Gpt);
        assert_eq!(table.device, "/dev/loop0");
        let [boot, root] = &table.partitions[..] else {
            panic!("expected two partitions: {:?}", table.partitions);
        };
        assert_eq!(boot.node, "/dev/loop0p1");
        assert_eq!(boot.name.as_deref(), Some("boot"));
        assert_eq!(root.size, 20445151);
        Ok(())
    }

    #[test]
    fn test_parse_sfdisk_dos_empty() -> Result<()> {
        let fixture = indoc::indoc! { r#"
        {
            "partitiontable": {
               "label": "dos",
               "id": "0x7c3e2a1f",
               "device": "/dev/loop3",
               "unit": "sectors",
               "sectorsize": 512
            }
        }
        "# };
        let table: SfDiskOutput = serde_json::from_str(fixture)?;
        assert_eq!(table.partitiontable.label, PartitionType::Dos);
        assert!(table.partitiontable.partitions.is_empty());
        Ok(())
    }
}
