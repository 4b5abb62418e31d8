//! Creating a partitioned disk image.
//!
//! ```yaml
//! - action: image-partition
//!   imagename: rpi.img
//!   imagesize: 4GB
//!   partitiontype: msdos
//!   partitions:
//!     - name: firmware
//!       fs: fat32
//!       start: 0%
//!       end: 256MB
//!     - name: root
//!       fs: ext4
//!       start: 256MB
//!       end: 100%
//!       flags: [boot]
//!   mountpoints:
//!     - mountpoint: /
//!       partition: root
//!     - mountpoint: /boot/firmware
//!       partition: firmware
//! ```
//!
//! The partitions are mounted below the image mount directory in the order
//! given, and the matching fstab and kernel `root=` argument are recorded
//! for filesystem-deploy.

use std::collections::HashSet;
use std::fmt::Write as _;

use anyhow::{anyhow, Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use osbake_blockdev::LoopbackDevice;
use osbake_mount::MountSpec;
use osbake_utils::ResultExt;
use serde::Deserialize;

use crate::action::{describe_or, Action};
use crate::context::{BuildState, Context, ImagePartition, ResourceToken};
use crate::machine::Machine;
use crate::task::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PartitionTableType {
    Gpt,
    Msdos,
}

impl PartitionTableType {
    fn as_str(self) -> &'static str {
        match self {
            PartitionTableType::Gpt => "gpt",
            PartitionTableType::Msdos => "msdos",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Partition {
    name: String,
    start: String,
    end: String,
    fs: String,
    #[serde(default)]
    flags: Vec<String>,
    /// GPT partition type GUID, or an alias understood by sfdisk.
    #[serde(default)]
    parttype: Option<String>,
    #[serde(default)]
    partuuid: Option<String>,
    #[serde(default)]
    fslabel: Option<String>,
    #[serde(default)]
    fsck: bool,
    #[serde(skip)]
    number: u32,
    #[serde(skip)]
    fs_uuid: String,
}

impl Partition {
    fn label(&self) -> &str {
        self.fslabel.as_deref().unwrap_or(&self.name)
    }

    fn is_mountable(&self) -> bool {
        !matches!(self.fs.as_str(), "none" | "swap" | "linux-swap")
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Mountpoint {
    mountpoint: String,
    partition: String,
    #[serde(default)]
    options: Vec<String>,
    /// Only mounted while building; left out of the fstab.
    #[serde(default)]
    buildtime: bool,
    #[serde(skip)]
    part_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ImagePartitionAction {
    #[serde(default)]
    description: Option<String>,
    #[serde(rename = "imagename")]
    image_name: String,
    #[serde(rename = "imagesize")]
    image_size: String,
    #[serde(rename = "partitiontype")]
    partition_type: PartitionTableType,
    #[serde(rename = "diskid", default)]
    disk_id: Option<String>,
    partitions: Vec<Partition>,
    #[serde(default)]
    mountpoints: Vec<Mountpoint>,
    #[serde(skip)]
    size: u64,
}

/// The partition type hint parted wants for a filesystem, if it knows it.
fn parted_fs_type(fs: &str) -> Option<&'static str> {
    let r = match fs {
        "vfat" | "fat32" => "fat32",
        "fat16" | "fat12" => "fat16",
        "ext2" => "ext2",
        "ext3" => "ext3",
        "ext4" => "ext4",
        "btrfs" => "btrfs",
        "xfs" => "xfs",
        "swap" | "linux-swap" => "linux-swap",
        _ => return None,
    };
    Some(r)
}

fn mounted_partition<'a>(partitions: &'a [Partition], m: &Mountpoint) -> Result<&'a Partition> {
    m.part_index
        .and_then(|i| partitions.get(i))
        .ok_or_else(|| anyhow!("Mountpoint {} was not resolved", m.mountpoint))
}

/// Render `/etc/fstab` for the mountpoints, in declaration order.
fn generate_fstab(partitions: &[Partition], mountpoints: &[Mountpoint]) -> Result<String> {
    let mut fstab = String::new();
    for m in mountpoints.iter().filter(|m| !m.buildtime) {
        let p = mounted_partition(partitions, m)?;
        if p.fs_uuid.is_empty() {
            anyhow::bail!("Missing filesystem UUID for partition {}", p.name);
        }
        let mut spec = MountSpec::new_uuid_src(&p.fs_uuid, &m.mountpoint, &p.fs);
        for o in &m.options {
            spec.push_option(o);
        }
        spec.passno = match (p.fsck, m.mountpoint.as_str()) {
            (false, _) => 0,
            (true, "/") => 1,
            (true, _) => 2,
        };
        writeln!(fstab, "{}", spec.to_fstab())?;
    }
    Ok(fstab)
}

/// The kernel argument selecting the root filesystem.
fn generate_kernel_root(partitions: &[Partition], mountpoints: &[Mountpoint]) -> Result<String> {
    let m = mountpoints
        .iter()
        .find(|m| m.mountpoint == "/")
        .ok_or_else(|| anyhow!("No partition is mounted at /"))?;
    let p = mounted_partition(partitions, m)?;
    if p.fs_uuid.is_empty() {
        anyhow::bail!("Missing filesystem UUID for root partition {}", p.name);
    }
    Ok(format!("root=UUID={}", p.fs_uuid))
}

/// Unmount everything mounted so far, most recent first.
fn release_mounts(ctx: &mut Context, mut unmount: impl FnMut(&Utf8Path) -> Result<()>) {
    for token in ctx.take_resources(|t| matches!(t, ResourceToken::Mount(_))) {
        if let ResourceToken::Mount(target) = token {
            unmount(&target).log_err_default();
        }
    }
}

#[context("Creating partition {}", p.name)]
fn create_partition(image: &Utf8Path, table: PartitionTableType, p: &Partition) -> Result<()> {
    let name = match table {
        PartitionTableType::Gpt => p.name.as_str(),
        PartitionTableType::Msdos => "primary",
    };
    let mut mkpart = Task::new("parted", "parted").args([
        "-a",
        "none",
        "-s",
        "--",
        image.as_str(),
        "mkpart",
        name,
    ]);
    if let Some(fstype) = parted_fs_type(&p.fs) {
        mkpart = mkpart.arg(fstype);
    }
    mkpart.args([p.start.as_str(), p.end.as_str()]).run()?;

    let n = p.number.to_string();
    for flag in &p.flags {
        Task::new("parted", "parted")
            .args(["-s", image.as_str(), "set", n.as_str(), flag.as_str(), "on"])
            .run()?;
    }
    if let Some(parttype) = p.parttype.as_deref() {
        Task::new("sfdisk", "sfdisk")
            .args(["--part-type", image.as_str(), n.as_str(), parttype])
            .run()?;
    }
    if let Some(uuid) = p.partuuid.as_deref() {
        Task::new("sfdisk", "sfdisk")
            .args(["--part-uuid", image.as_str(), n.as_str(), uuid])
            .run()?;
    }
    Ok(())
}

impl ImagePartitionAction {
    fn image_path(&self, ctx: &Context) -> Utf8PathBuf {
        ctx.artifactdir.join(&self.image_name)
    }

    fn verify_partitions(&mut self) -> Result<()> {
        if self.partitions.is_empty() {
            anyhow::bail!("No partitions defined");
        }
        if self.partition_type == PartitionTableType::Msdos && self.partitions.len() > 4 {
            anyhow::bail!("msdos partition tables hold at most 4 primary partitions");
        }
        for (i, p) in self.partitions.iter_mut().enumerate() {
            p.number = u32::try_from(i + 1)?;
        }
        let mut names = HashSet::new();
        for p in &self.partitions {
            if p.name.is_empty() {
                anyhow::bail!("Partition {} has no name", p.number);
            }
            if !names.insert(p.name.as_str()) {
                anyhow::bail!("Duplicate partition name {}", p.name);
            }
            if p.start.is_empty() || p.end.is_empty() {
                anyhow::bail!("Partition {} needs both start and end", p.name);
            }
            if p.fs.is_empty() {
                anyhow::bail!("Partition {} has no fs; use `none` to leave it unformatted", p.name);
            }
            if self.partition_type == PartitionTableType::Msdos
                && (p.parttype.is_some() || p.partuuid.is_some())
            {
                anyhow::bail!(
                    "Partition {}: parttype and partuuid need a gpt partition table",
                    p.name
                );
            }
        }
        Ok(())
    }

    fn verify_mountpoints(&mut self) -> Result<()> {
        let mut seen = HashSet::new();
        for m in self.mountpoints.iter_mut() {
            if !m.mountpoint.starts_with('/') {
                anyhow::bail!("Mountpoint {} is not an absolute path", m.mountpoint);
            }
            if !seen.insert(m.mountpoint.clone()) {
                anyhow::bail!("Duplicate mountpoint {}", m.mountpoint);
            }
            let idx = self
                .partitions
                .iter()
                .position(|p| p.name == m.partition)
                .ok_or_else(|| {
                    anyhow!("Mountpoint {}: no partition named {}", m.mountpoint, m.partition)
                })?;
            if !self.partitions[idx].is_mountable() {
                anyhow::bail!(
                    "Mountpoint {}: partition {} has no mountable filesystem",
                    m.mountpoint,
                    m.partition
                );
            }
            m.part_index = Some(idx);
        }
        Ok(())
    }

    fn format_partitions(&mut self, image: &Utf8Path) -> Result<Vec<ImagePartition>> {
        let mut parts = Vec::with_capacity(self.partitions.len());
        for p in self.partitions.iter_mut() {
            let dev = osbake_blockdev::resolve_partition_device(image, p.number);
            tracing::info!("Formatting partition {} ({dev}) as {}", p.name, p.fs);
            osbake_blockdev::format(&dev, &p.fs, p.label())?;
            if p.fs != "none" {
                p.fs_uuid = osbake_blockdev::filesystem_uuid(&dev)?;
            }
            parts.push(ImagePartition {
                name: p.name.clone(),
                device_path: dev,
            });
        }
        Ok(parts)
    }

    fn mount_all(&self, ctx: &mut Context) -> Result<()> {
        for m in &self.mountpoints {
            let p = mounted_partition(&self.partitions, m)?;
            let dev = ctx
                .partition_device(&p.name)
                .ok_or_else(|| anyhow!("No device for partition {}", p.name))?
                .to_owned();
            let target = ctx.image_mntdir.join(m.mountpoint.trim_start_matches('/'));
            osbake_mount::mount(&dev, &target, &p.fs, &m.options)?;
            ctx.push_resource(ResourceToken::Mount(target));
        }
        Ok(())
    }
}

impl Action for ImagePartitionAction {
    fn verify(&mut self, _ctx: &mut Context) -> Result<()> {
        if self.image_name.is_empty() {
            anyhow::bail!("imagename is required");
        }
        self.size = osbake_blockdev::parse_size(&self.image_size)
            .with_context(|| format!("Parsing imagesize {}", self.image_size))?;
        if self.size == 0 {
            anyhow::bail!("imagesize must not be zero");
        }
        self.verify_partitions()?;
        self.verify_mountpoints()
    }

    fn pre_machine(
        &mut self,
        ctx: &mut Context,
        machine: &mut dyn Machine,
        args: &mut Vec<String>,
    ) -> Result<()> {
        let image = machine.create_image(&self.image_path(ctx), self.size)?;
        args.push("--internal-image".into());
        args.push(image.to_string());
        ctx.image = Some(image);
        Ok(())
    }

    fn pre_no_machine(&mut self, ctx: &mut Context) -> Result<()> {
        let path = self.image_path(ctx);
        osbake_blockdev::create_image_file(&path, self.size)?;
        let loopdev = LoopbackDevice::new(&path)?;
        let dev = loopdev
            .path()
            .ok_or_else(|| anyhow!("Loop device for {path} is already detached"))?
            .to_owned();
        ctx.push_resource(ResourceToken::Loopback(loopdev));
        ctx.image = Some(dev);
        Ok(())
    }

    fn run(&mut self, ctx: &mut Context) -> Result<()> {
        let image = ctx
            .image
            .clone()
            .ok_or_else(|| anyhow!("No image device to partition"))?;
        tracing::info!("Partitioning {image}");
        Task::new("parted", "parted")
            .args(["-s", image.as_str(), "mklabel", self.partition_type.as_str()])
            .run()?;
        if let Some(id) = self.disk_id.as_deref() {
            Task::new("sfdisk", "sfdisk")
                .args(["--disk-id", image.as_str(), id])
                .run()?;
        }
        for p in &self.partitions {
            create_partition(&image, self.partition_type, p)?;
        }
        Task::new("udevadm", "udevadm")
            .arg("settle")
            .run()
            .log_err_default();

        let parts = self.format_partitions(&image)?;
        ctx.set_image_partitions(parts)?;
        match osbake_blockdev::partitions_of(&image) {
            Ok(table) => {
                for p in &table.partitions {
                    tracing::debug!(
                        "{} start={} size={} type={}",
                        p.node,
                        p.start,
                        p.size,
                        p.parttype
                    );
                }
            }
            Err(e) => tracing::debug!("Listing partitions of {image}: {e:#}"),
        }

        self.mount_all(ctx)?;
        ctx.image_fstab = generate_fstab(&self.partitions, &self.mountpoints)?;
        ctx.image_kernel_root = generate_kernel_root(&self.partitions, &self.mountpoints)?;
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut Context) -> Result<()> {
        release_mounts(ctx, osbake_mount::unmount);
        Ok(())
    }

    fn post_machine_cleanup(&mut self, ctx: &mut Context) -> Result<()> {
        for token in ctx.take_resources(|t| matches!(t, ResourceToken::Loopback(_))) {
            if let ResourceToken::Loopback(dev) = token {
                dev.close().log_err_default();
            }
        }
        if ctx.state() == BuildState::Failed {
            let path = self.image_path(ctx);
            if path.try_exists()? {
                tracing::info!("Removing {path} of failed build");
                std::fs::remove_file(&path)
                    .with_context(|| format!("Removing {path}"))
                    .log_err_default();
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        describe_or(self.description.as_deref(), || {
            format!("Partition image {} ({})", self.image_name, self.image_size)
        })
    }
}
