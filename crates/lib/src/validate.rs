//! Pre-flight validation: everything that must hold before a single
//! destructive command touches the device.

use std::os::unix::fs::FileTypeExt;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::blockdev::{self, Device, MIB};
use crate::config::{ProvisionConfig, BOOT_LABEL_MAX, PAYLOAD_LABEL_MAX};

/// Fixed headroom reserved on top of the image payload, covering
/// filesystem metadata, the partition table and the descriptor.
pub const SLACK_MIB: u64 = 256;

/// Byte sizes involved in the capacity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub device_bytes: u64,
    pub image_bytes: u64,
    pub boot_end_mib: u64,
}

impl Geometry {
    /// Minimum device capacity: the boot partition, the image payload,
    /// and the fixed slack. Saturates so an absurd boot offset reads
    /// as an unsatisfiable requirement rather than overflowing.
    pub fn required_bytes(&self) -> u64 {
        self.boot_end_mib
            .saturating_mul(MIB)
            .saturating_add(self.image_bytes)
            .saturating_add(SLACK_MIB * MIB)
    }

    /// Fail with the shortfall (rounded up to whole MiB) when the
    /// device is too small.
    pub fn ensure_capacity(&self) -> Result<()> {
        let required = self.required_bytes();
        if self.device_bytes < required {
            let short_mib = (required - self.device_bytes).div_ceil(MIB);
            return Err(anyhow!(
                "Device too small: {} bytes available, {} required ({short_mib} MiB short)",
                self.device_bytes,
                required
            ));
        }
        Ok(())
    }
}

/// The target device after all safety gates have passed.
#[derive(Debug)]
pub struct ValidatedTarget {
    pub device: Device,
    pub geometry: Geometry,
    /// The canonical device node (symlinks such as /dev/disk/by-id/...
    /// resolved). All destructive steps must address this path.
    pub node: Utf8PathBuf,
}

fn ensure_label(kind: &str, label: &str, max: usize) -> Result<()> {
    if label.chars().count() > max {
        anyhow::bail!("{kind} label {label:?} exceeds {max} characters");
    }
    Ok(())
}

#[context("Checking image {image}")]
fn image_size(image: &Utf8Path) -> Result<u64> {
    let meta = std::fs::metadata(image)?;
    if !meta.is_file() {
        anyhow::bail!("Not a regular file");
    }
    // Catch permission problems now rather than at mount time.
    std::fs::File::open(image)?;
    Ok(meta.len())
}

/// True when wiping `target` would take down the running system, i.e.
/// when the target or any disk backing it also backs the root
/// filesystem. Pure so it can be tested without real devices.
pub fn overlaps_system_disks(target: &str, target_parents: &[String], root_disks: &[String]) -> bool {
    root_disks
        .iter()
        .any(|d| d == target || target_parents.contains(d))
}

/// Run every safety gate against the configuration. Destructive work
/// must not begin unless this returns a [`ValidatedTarget`].
#[context("Validating target {device}", device = cfg.device)]
pub fn validate(cfg: &ProvisionConfig) -> Result<ValidatedTarget> {
    ensure_label("Boot", &cfg.boot_label, BOOT_LABEL_MAX)?;
    ensure_label("Payload", &cfg.payload_label, PAYLOAD_LABEL_MAX)?;

    let meta = std::fs::metadata(&cfg.device)
        .with_context(|| format!("Reading {}", cfg.device))?;
    if !meta.file_type().is_block_device() {
        anyhow::bail!("{} is not a block device", cfg.device);
    }

    // Resolve symlinks (e.g. /dev/disk/by-id/...) before comparing
    // against the disks backing the root filesystem.
    let canonical = cfg
        .device
        .canonicalize_utf8()
        .with_context(|| format!("Resolving {}", cfg.device))?;
    let parents = blockdev::find_parent_devices(canonical.as_str())?;
    let root_disks = blockdev::root_backing_disks()?;
    if overlaps_system_disks(canonical.as_str(), &parents, &root_disks) {
        anyhow::bail!(
            "Refusing to provision {canonical}: it backs the running system's root filesystem"
        );
    }

    let device = blockdev::list_dev(&canonical)?;
    if !device.is_removable() {
        tracing::warn!("{canonical} does not report as removable media");
    }

    let geometry = Geometry {
        device_bytes: device.size,
        image_bytes: image_size(&cfg.image)?,
        boot_end_mib: cfg.boot_end_mib,
    };
    geometry.ensure_capacity()?;

    Ok(ValidatedTarget {
        device,
        geometry,
        node: canonical,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_boundary() {
        let mut g = Geometry {
            device_bytes: 0,
            image_bytes: 5 * 1024 * MIB,
            boot_end_mib: 1024,
        };
        g.device_bytes = g.required_bytes();
        g.ensure_capacity().unwrap();
        // One byte under the line: reported one MiB short.
        g.device_bytes -= 1;
        let msg = format!("{:#}", g.ensure_capacity().unwrap_err());
        assert!(msg.contains("1 MiB short"), "{msg}");
    }

    #[test]
    fn test_shortfall_rounds_up() {
        let mut g = Geometry {
            device_bytes: 0,
            image_bytes: 4700 * MIB,
            boot_end_mib: 1024,
        };
        g.device_bytes = g.required_bytes() - (3 * MIB + 1);
        let msg = format!("{:#}", g.ensure_capacity().unwrap_err());
        assert!(msg.contains("4 MiB short"), "{msg}");
    }

    #[test]
    fn test_absurd_boot_offset_is_an_error_not_a_panic() {
        let g = Geometry {
            device_bytes: 64 * 1024 * MIB,
            image_bytes: 5 * 1024 * MIB,
            boot_end_mib: u64::MAX,
        };
        assert!(g.ensure_capacity().is_err());
    }

    #[test]
    fn test_label_limits() {
        ensure_label("Boot", "BOOT", BOOT_LABEL_MAX).unwrap();
        ensure_label("Boot", "ABCDEFGHIJK", BOOT_LABEL_MAX).unwrap();
        assert!(ensure_label("Boot", "ABCDEFGHIJKL", BOOT_LABEL_MAX).is_err());
        ensure_label("Payload", &"x".repeat(32), PAYLOAD_LABEL_MAX).unwrap();
        assert!(ensure_label("Payload", &"x".repeat(33), PAYLOAD_LABEL_MAX).is_err());
    }

    #[test]
    fn test_system_disk_overlap() {
        let root = vec!["/dev/sda".to_string()];
        // Direct hit.
        assert!(overlaps_system_disks("/dev/sda", &[], &root));
        // Hit through a parent (target is a partition of the root disk).
        assert!(overlaps_system_disks(
            "/dev/sda3",
            &["/dev/sda".to_string()],
            &root
        ));
        // Unrelated device passes.
        assert!(!overlaps_system_disks(
            "/dev/sdb",
            &["/dev/sdb".to_string()],
            &root
        ));
        assert!(!overlaps_system_disks("/dev/sda", &[], &[]));
    }
}
