//! Block device inspection and manipulation, mostly by shelling out
//! to util-linux tools and parsing their JSON output.

use std::process::Command;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Deserialize;

use winstick_utils::CommandRunExt;

/// One mebibyte in bytes.
pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

impl DevicesOutput {
    fn into_device(self, dev: &Utf8Path) -> Result<Device> {
        self.blockdevices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"))
    }
}

/// A block device as reported by `lsblk`.
#[derive(Debug, Deserialize)]
pub struct Device {
    pub name: String,
    pub path: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub size: u64,
    /// Whether the kernel flags the device as removable.
    pub rm: Option<bool>,
    pub label: Option<String>,
    pub fstype: Option<String>,
    pub mountpoint: Option<String>,
    pub mountpoints: Option<Vec<Option<String>>>,
    pub children: Option<Vec<Device>>,
}

impl Device {
    /// The device node path; older lsblk may omit PATH so fall back to the name.
    pub fn node(&self) -> String {
        self.path.clone().unwrap_or(format!("/dev/{}", &self.name))
    }

    pub fn is_removable(&self) -> bool {
        self.rm.unwrap_or(false)
    }

    pub fn has_children(&self) -> bool {
        self.children.as_ref().is_some_and(|v| !v.is_empty())
    }

    /// Every mountpoint on this device or any of its partitions.
    pub fn all_mountpoints(&self) -> Vec<String> {
        let mut r = Vec::new();
        self.collect_mountpoints(&mut r);
        r
    }

    fn collect_mountpoints(&self, out: &mut Vec<String>) {
        let own = self
            .mountpoints
            .iter()
            .flatten()
            .flatten()
            .cloned()
            .chain(self.mountpoint.clone());
        for mp in own {
            if !out.contains(&mp) {
                out.push(mp);
            }
        }
        for child in self.children.iter().flatten() {
            child.collect_mountpoints(out);
        }
    }
}

/// Query `lsblk` for a single device (and its partitions).
#[context("Listing device {dev}")]
pub fn list_dev(dev: &Utf8Path) -> Result<Device> {
    let devs: DevicesOutput = Command::new("lsblk")
        .args(["-J", "-b", "-O"])
        .arg(dev)
        .run_and_parse_json()?;
    devs.into_device(dev)
}

#[derive(Debug, Deserialize)]
struct InverseOutput {
    blockdevices: Vec<InverseDevice>,
}

#[derive(Debug, Deserialize)]
struct InverseDevice {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    children: Option<Vec<InverseDevice>>,
}

fn collect_parents(dev: &InverseDevice, is_query_root: bool, out: &mut Vec<String>) {
    if !is_query_root && matches!(dev.kind.as_str(), "disk" | "loop" | "mpath") {
        if !out.contains(&dev.name) {
            out.push(dev.name.clone());
        }
        // we don't need to know what disks back a multipath
        if dev.kind == "mpath" {
            return;
        }
    }
    for child in dev.children.iter().flatten() {
        collect_parents(child, false, out);
    }
}

/// Walk the parent hierarchy of `device` and return every ancestor
/// capable of holding a partition table (whole disks, loop devices,
/// multipath maps). The device itself is not included.
#[context("Finding parent devices of {device}")]
pub fn find_parent_devices(device: &str) -> Result<Vec<String>> {
    let o: InverseOutput = Command::new("lsblk")
        .args(["-J", "--inverse", "--paths", "-o", "NAME,TYPE"])
        .arg(device)
        .run_and_parse_json()?;
    let mut parents = Vec::new();
    for dev in &o.blockdevices {
        collect_parents(dev, true, &mut parents);
    }
    Ok(parents)
}

#[derive(Debug, Deserialize)]
struct FindmntOutput {
    filesystems: Vec<FindmntFilesystem>,
}

#[derive(Debug, Deserialize)]
struct FindmntFilesystem {
    source: String,
}

/// Resolve the physical disk(s) backing the running system's root
/// filesystem. Stacked devices (LVM, LUKS) are walked down to the disk.
#[context("Resolving the disk backing the root filesystem")]
pub fn root_backing_disks() -> Result<Vec<String>> {
    let o: FindmntOutput = Command::new("findmnt")
        .args(["-J", "-v", "-o", "SOURCE", "/"])
        .run_and_parse_json()?;
    let source = o
        .filesystems
        .first()
        .map(|f| f.source.clone())
        .ok_or_else(|| anyhow!("findmnt reported no filesystem for /"))?;
    let mut disks = find_parent_devices(&source)?;
    if disks.is_empty() {
        // the root source is itself a whole device (rare, but seen with
        // some initrd setups)
        disks.push(source);
    }
    tracing::debug!("root backing disks: {disks:?}");
    Ok(disks)
}

/// Compute the node path for partition `partno` of `disk`. Whole-disk
/// names ending in a digit (nvme0n1, mmcblk0, loop7) take a `p` infix.
pub fn partition_node(disk: &Utf8Path, partno: u32) -> Utf8PathBuf {
    let disk = disk.as_str();
    let infix = if disk.ends_with(|c: char| c.is_ascii_digit()) {
        "p"
    } else {
        ""
    };
    format!("{disk}{infix}{partno}").into()
}

/// Destroy all filesystem and partition-table signatures on the device.
#[context("Wiping signatures on {dev}")]
pub fn wipefs(dev: &Utf8Path) -> Result<()> {
    Command::new("wipefs").args(["--all", dev.as_str()]).run()
}

/// Ask the kernel to re-read the partition table, then wait for udev
/// to settle so the new partition nodes exist.
#[context("Settling partition nodes for {dev}")]
pub fn reread_and_settle(dev: &Utf8Path) -> Result<()> {
    Command::new("blockdev")
        .args(["--rereadpt", dev.as_str()])
        .run()?;
    Command::new("udevadm")
        .args(["settle", "--timeout=30"])
        .run()
}

/// Flush the device's block cache.
#[context("Flushing buffers for {dev}")]
pub fn flush_buffers(dev: &Utf8Path) -> Result<()> {
    Command::new("blockdev")
        .args(["--flushbufs", dev.as_str()])
        .run()
}

/// Parse a size string into mebibytes; a bare number is already MiB.
pub fn parse_size_mib(s: &str) -> Result<u64> {
    let s = s.trim();
    let (digits, mul) = match s.find(|c: char| !c.is_ascii_digit()) {
        None => (s, 1u64),
        Some(idx) => {
            let (digits, suffix) = s.split_at(idx);
            let mul = match suffix {
                "M" | "MiB" => 1u64,
                "G" | "GiB" => 1024,
                "T" | "TiB" => 1024 * 1024,
                other => anyhow::bail!("Unknown size suffix: {other}"),
            };
            (digits, mul)
        }
    };
    let v = digits
        .parse::<u64>()
        .with_context(|| format!("Parsing size {s}"))?;
    v.checked_mul(mul)
        .ok_or_else(|| anyhow!("Size out of range: {s}"))
}
