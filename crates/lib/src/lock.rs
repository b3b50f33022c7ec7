//! Per-device single-instance locking.
//!
//! Two concurrent provisioning runs against the same device would race
//! on the partition table; an advisory `flock` on a well-known path
//! serializes them. The lock file carries JSON metadata about the
//! holder so contention errors can name the other process.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use camino::Utf8Path;
use rustix::fs::{flock, FlockOperation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct LockMetadata {
    pid: u32,
    device: String,
    command: String,
    /// Seconds since the epoch when the lock was taken.
    acquired_at: u64,
}

/// Why the lock could not be acquired.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Device {device} is being provisioned by pid {pid}")]
    Contention { device: String, pid: u32 },
    #[error("Device {device} is locked by another process")]
    ContentionUnknown { device: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Held for the duration of a provisioning run; released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    // Closing the descriptor releases the flock.
    _file: File,
    path: PathBuf,
}

fn lock_filename(device: &Utf8Path) -> String {
    let base = device.file_name().unwrap_or("unknown");
    let uid = rustix::process::getuid().as_raw();
    format!("winstick-{base}-{uid}.lock")
}

impl InstanceLock {
    /// Take the per-device lock, failing immediately on contention.
    pub fn acquire(device: &Utf8Path) -> Result<Self, LockError> {
        Self::acquire_in(&std::env::temp_dir(), device)
    }

    fn acquire_in(dir: &std::path::Path, device: &Utf8Path) -> Result<Self, LockError> {
        let path = dir.join(lock_filename(device));
        let mut file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Opening lock file {}", path.display()))?;
        match flock(&file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {}
            Err(rustix::io::Errno::WOULDBLOCK) => {
                return Err(Self::contention(&file, device));
            }
            Err(e) => {
                return Err(LockError::Io(
                    anyhow::Error::new(e).context(format!("Locking {}", path.display()))
                ));
            }
        }
        // Holder metadata, best effort; contention reporting degrades
        // gracefully without it.
        let meta = LockMetadata {
            pid: std::process::id(),
            device: device.to_string(),
            command: std::env::args().collect::<Vec<_>>().join(" "),
            acquired_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };
        file.set_len(0).context("Truncating lock file")?;
        if let Ok(buf) = serde_json::to_vec(&meta) {
            let _ = file.write_all(&buf);
            let _ = file.flush();
        }
        Ok(Self { _file: file, path })
    }

    fn contention(file: &File, device: &Utf8Path) -> LockError {
        let device = device.to_string();
        match serde_json::from_reader::<_, LockMetadata>(file) {
            Ok(meta) => LockError::Contention {
                device,
                pid: meta.pid,
            },
            Err(_) => LockError::ContentionUnknown { device },
        }
    }

    /// The lock file path, mainly for diagnostics.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}
