//! Narrow capability interfaces over the external tools the
//! provisioning state machine drives, so the sequencing logic can be
//! exercised against fakes (and a dry-run implementation) without a
//! real device.

use std::process::Command;

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

use winstick_utils::CommandRunExt;

use crate::blockdev;

/// GPT partition type for the EFI system partition.
pub const ESP_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";
/// GPT partition type for Microsoft basic data.
pub const BASIC_DATA_GUID: &str = "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7";

/// The two-partition layout written to the target device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    pub boot_part_name: String,
    pub payload_part_name: String,
    /// Boot partition spans 1MiB..boot_end_mib; payload takes the rest.
    pub boot_end_mib: u64,
}

/// Writes (and destroys) partition tables.
pub trait PartitionWriter {
    fn wipe_signatures(&self, dev: &Utf8Path) -> Result<()>;
    fn create_layout(&self, dev: &Utf8Path, layout: &DiskLayout) -> Result<()>;
    /// Re-read the table and wait for partition nodes to settle.
    fn settle(&self, dev: &Utf8Path) -> Result<()>;
}

/// Creates the two filesystems.
pub trait Formatter {
    fn format_boot(&self, node: &Utf8Path, label: &str) -> Result<()>;
    fn format_payload(&self, node: &Utf8Path, label: &str) -> Result<()>;
}

/// Mounts, unmounts and flushes filesystems.
pub trait MountManager {
    fn mount_image(&self, image: &Utf8Path, at: &Utf8Path) -> Result<()>;
    fn mount_boot(&self, node: &Utf8Path, at: &Utf8Path) -> Result<()>;
    fn mount_payload(&self, node: &Utf8Path, at: &Utf8Path) -> Result<()>;
    fn unmount(&self, at: &Utf8Path) -> Result<()>;
    fn sync_filesystem(&self, at: &Utf8Path) -> Result<()>;
    fn flush_device(&self, dev: &Utf8Path) -> Result<()>;
}

/// Mirrors directory trees (delete-stale semantics) and copies files.
pub trait MirrorCopier {
    fn mirror(&self, src: &Utf8Path, dest: &Utf8Path, exclude: &[&str]) -> Result<()>;
    fn copy_file(&self, src: &Utf8Path, dest: &Utf8Path) -> Result<()>;
}

/// The full set of capabilities a provisioning run needs.
#[derive(Clone, Copy)]
pub struct Toolbox<'a> {
    pub partitioner: &'a dyn PartitionWriter,
    pub formatter: &'a dyn Formatter,
    pub mounts: &'a dyn MountManager,
    pub copier: &'a dyn MirrorCopier,
}

impl<'a> Toolbox<'a> {
    /// A toolbox where one value implements every capability.
    pub fn uniform<T>(host: &'a T) -> Self
    where
        T: PartitionWriter + Formatter + MountManager + MirrorCopier,
    {
        Toolbox {
            partitioner: host,
            formatter: host,
            mounts: host,
            copier: host,
        }
    }
}

impl std::fmt::Debug for Toolbox<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Toolbox { .. }")
    }
}

/// The uid/gid that should own files on the mounted volumes: the user
/// behind sudo when present, otherwise the current user.
fn invoking_user_ids() -> (u32, u32) {
    fn from_env(var: &str) -> Option<u32> {
        std::env::var(var).ok()?.parse().ok()
    }
    let uid = from_env("SUDO_UID").unwrap_or_else(|| rustix::process::getuid().as_raw());
    let gid = from_env("SUDO_GID").unwrap_or_else(|| rustix::process::getgid().as_raw());
    (uid, gid)
}

/// Real implementation shelling out to the system tools.
#[derive(Debug, Default)]
pub struct Host;

impl PartitionWriter for Host {
    fn wipe_signatures(&self, dev: &Utf8Path) -> Result<()> {
        blockdev::wipefs(dev)
    }

    #[context("Partitioning {dev}")]
    fn create_layout(&self, dev: &Utf8Path, layout: &DiskLayout) -> Result<()> {
        let end = layout.boot_end_mib;
        Command::new("sgdisk")
            .arg("--zap-all")
            .arg(dev)
            .args(["-U", "R"])
            .args(["-n", &format!("1:1M:{end}M")])
            .args(["-c", &format!("1:{}", layout.boot_part_name)])
            .args(["-t", &format!("1:{ESP_GUID}")])
            .args(["-n", &format!("2:{end}M:0")])
            .args(["-c", &format!("2:{}", layout.payload_part_name)])
            .args(["-t", &format!("2:{BASIC_DATA_GUID}")])
            .run()
    }

    fn settle(&self, dev: &Utf8Path) -> Result<()> {
        blockdev::reread_and_settle(dev)
    }
}

impl Formatter for Host {
    #[context("Formatting boot volume on {node}")]
    fn format_boot(&self, node: &Utf8Path, label: &str) -> Result<()> {
        Command::new("mkfs.fat")
            .args(["-F", "32", "-n", label, node.as_str()])
            .run()
    }

    #[context("Formatting payload volume on {node}")]
    fn format_payload(&self, node: &Utf8Path, label: &str) -> Result<()> {
        // Quick format; full zeroing buys nothing on removable media.
        Command::new("mkntfs")
            .args(["--quick", "--label", label, node.as_str()])
            .run()
    }
}

impl MountManager for Host {
    #[context("Mounting image {image}")]
    fn mount_image(&self, image: &Utf8Path, at: &Utf8Path) -> Result<()> {
        Command::new("mount")
            .args(["-o", "loop,ro,noexec,nosuid,nodev"])
            .args([image.as_str(), at.as_str()])
            .run()
    }

    #[context("Mounting boot volume {node}")]
    fn mount_boot(&self, node: &Utf8Path, at: &Utf8Path) -> Result<()> {
        let (uid, gid) = invoking_user_ids();
        // `flush` keeps FAT write-back small so unplugging soon after
        // completion is safe.
        let opts = format!("uid={uid},gid={gid},noexec,nosuid,nodev,flush");
        Command::new("mount")
            .args(["-t", "vfat", "-o", &opts, node.as_str(), at.as_str()])
            .run()
    }

    #[context("Mounting payload volume {node}")]
    fn mount_payload(&self, node: &Utf8Path, at: &Utf8Path) -> Result<()> {
        let (uid, gid) = invoking_user_ids();
        let opts = format!("uid={uid},gid={gid},noexec,nosuid,nodev,big_writes");
        Command::new("mount")
            .args(["-t", "ntfs-3g", "-o", &opts, node.as_str(), at.as_str()])
            .run()
    }

    fn unmount(&self, at: &Utf8Path) -> Result<()> {
        Command::new("umount").arg(at).run()
    }

    #[context("Syncing filesystem at {at}")]
    fn sync_filesystem(&self, at: &Utf8Path) -> Result<()> {
        Command::new("sync").args(["-f", at.as_str()]).run()
    }

    fn flush_device(&self, dev: &Utf8Path) -> Result<()> {
        blockdev::flush_buffers(dev)
    }
}

impl MirrorCopier for Host {
    #[context("Mirroring {src} to {dest}")]
    fn mirror(&self, src: &Utf8Path, dest: &Utf8Path, exclude: &[&str]) -> Result<()> {
        let mut cmd = Command::new("rsync");
        // FAT and NTFS can't hold ownership or permissions; times with a
        // fuzz window keep re-runs incremental.
        cmd.args(["--recursive", "--times", "--modify-window=2", "--delete"]);
        for pattern in exclude {
            cmd.arg(format!("--exclude=/{pattern}"));
        }
        // Trailing slash: mirror the contents, not the directory itself.
        cmd.arg(format!("{src}/"));
        cmd.arg(dest.as_str());
        cmd.run()
    }

    #[context("Copying {src} to {dest}")]
    fn copy_file(&self, src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
        Command::new("rsync")
            .args(["--times", "--modify-window=2", src.as_str(), dest.as_str()])
            .run()
    }
}

/// Dry-run implementation: narrates every destructive call, executes none.
#[derive(Debug, Default)]
pub struct DryRunHost;

fn would(what: std::fmt::Arguments<'_>) -> Result<()> {
    println!("dry-run: would {what}");
    Ok(())
}

impl PartitionWriter for DryRunHost {
    fn wipe_signatures(&self, dev: &Utf8Path) -> Result<()> {
        would(format_args!("wipe signatures on {dev}"))
    }

    fn create_layout(&self, dev: &Utf8Path, layout: &DiskLayout) -> Result<()> {
        would(format_args!(
            "write GPT on {dev}: 1MiB..{}MiB ({}), {}MiB..100% ({})",
            layout.boot_end_mib, layout.boot_part_name, layout.boot_end_mib, layout.payload_part_name
        ))
    }

    fn settle(&self, dev: &Utf8Path) -> Result<()> {
        would(format_args!("re-read partition table on {dev}"))
    }
}

impl Formatter for DryRunHost {
    fn format_boot(&self, node: &Utf8Path, label: &str) -> Result<()> {
        would(format_args!("format {node} as FAT32 (label {label})"))
    }

    fn format_payload(&self, node: &Utf8Path, label: &str) -> Result<()> {
        would(format_args!("format {node} as NTFS (label {label})"))
    }
}

impl MountManager for DryRunHost {
    fn mount_image(&self, image: &Utf8Path, at: &Utf8Path) -> Result<()> {
        would(format_args!("mount {image} read-only at {at}"))
    }

    fn mount_boot(&self, node: &Utf8Path, at: &Utf8Path) -> Result<()> {
        would(format_args!("mount {node} at {at}"))
    }

    fn mount_payload(&self, node: &Utf8Path, at: &Utf8Path) -> Result<()> {
        would(format_args!("mount {node} at {at}"))
    }

    fn unmount(&self, at: &Utf8Path) -> Result<()> {
        would(format_args!("unmount {at}"))
    }

    fn sync_filesystem(&self, at: &Utf8Path) -> Result<()> {
        would(format_args!("sync filesystem at {at}"))
    }

    fn flush_device(&self, dev: &Utf8Path) -> Result<()> {
        would(format_args!("flush block cache of {dev}"))
    }
}

impl MirrorCopier for DryRunHost {
    fn mirror(&self, src: &Utf8Path, dest: &Utf8Path, exclude: &[&str]) -> Result<()> {
        would(format_args!(
            "mirror {src} to {dest} (excluding {exclude:?})"
        ))
    }

    fn copy_file(&self, src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
        would(format_args!("copy {src} to {dest}"))
    }
}
