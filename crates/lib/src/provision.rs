//! The provisioning pipeline.
//!
//! A linear sequence of steps turns a block device into bootable
//! installer media: wipe, partition, format, mount, copy, descriptor,
//! sync, unmount. Resources acquired along the way (mounts, the
//! scratch directory) are registered in a [`Teardown`] that is released
//! in reverse order on success, failure, or interruption.

use std::io::IsTerminal;
use std::io::Write as _;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::blockdev;
use crate::config::ProvisionConfig;
use crate::host::{DiskLayout, MountManager, Toolbox};
use crate::lock::InstanceLock;
use crate::render;
use crate::validate;

/// Directory inside the image that holds the large install payload.
const SOURCES_DIR: &str = "sources";
/// The one payload file the boot volume needs alongside the boot files.
const BOOT_IMAGE: &str = "sources/boot.wim";

/// Pipeline steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Init,
    Validate,
    Confirm,
    Wipe,
    Partition,
    Format,
    Mount,
    Copy,
    InstallDescriptor,
    Sync,
    Unmount,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Step::Init => "init",
            Step::Validate => "validate",
            Step::Confirm => "confirm",
            Step::Wipe => "wipe",
            Step::Partition => "partition",
            Step::Format => "format",
            Step::Mount => "mount",
            Step::Copy => "copy",
            Step::InstallDescriptor => "install-descriptor",
            Step::Sync => "sync",
            Step::Unmount => "unmount",
        };
        f.write_str(s)
    }
}

/// Resources to release when the run ends, however it ends.
#[derive(Debug, Default)]
pub struct Teardown {
    /// Mountpoints to unmount, in mount order.
    mounts: Vec<Utf8PathBuf>,
    workdir: Option<tempfile::TempDir>,
}

impl Teardown {
    pub fn register_mount(&mut self, at: &Utf8Path) {
        self.mounts.push(at.to_owned());
    }

    pub fn register_workdir(&mut self, td: tempfile::TempDir) {
        self.workdir = Some(td);
    }

    /// Unmount everything in reverse order, then drop the scratch
    /// directory. Unmount failures are logged, not propagated; a busy
    /// mount must not mask the error that got us here.
    pub fn release(&mut self, mounts: &dyn MountManager) {
        while let Some(at) = self.mounts.pop() {
            if let Err(e) = mounts.unmount(&at) {
                tracing::warn!("failed to unmount {at}: {e:#}");
            }
        }
        self.workdir = None;
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty() && self.workdir.is_none()
    }
}

/// Teardown state shared with the signal handler.
pub type SharedTeardown = Arc<Mutex<Teardown>>;

pub fn new_shared_teardown() -> SharedTeardown {
    Arc::new(Mutex::new(Teardown::default()))
}

/// Release the shared teardown; used by both the normal exit path and
/// the signal path.
pub fn release_shared(teardown: &SharedTeardown, mounts: &dyn MountManager) {
    let mut guard = teardown.lock().expect("teardown lock poisoned");
    guard.release(mounts);
}

/// The scratch mountpoints for one run.
struct Mountpoints {
    image: Utf8PathBuf,
    boot: Utf8PathBuf,
    payload: Utf8PathBuf,
}

#[context("Preparing work directory")]
fn prepare_workdir(teardown: &SharedTeardown) -> Result<Mountpoints> {
    let td = tempfile::Builder::new()
        .prefix("winstick-")
        .tempdir()
        .context("Creating temporary directory")?;
    let base = Utf8Path::from_path(td.path())
        .context("Temporary directory path is not UTF-8")?
        .to_owned();
    let points = Mountpoints {
        image: base.join("image"),
        boot: base.join("boot"),
        payload: base.join("payload"),
    };
    for p in [&points.image, &points.boot, &points.payload] {
        std::fs::create_dir(p).with_context(|| format!("Creating {p}"))?;
    }
    teardown
        .lock()
        .expect("teardown lock poisoned")
        .register_workdir(td);
    Ok(points)
}

/// Ask for explicit confirmation before wiping. Non-interactive stdin
/// or `--no-confirm` implies consent; anything but an exact `yes` on an
/// interactive terminal aborts.
fn confirm_wipe(cfg: &ProvisionConfig) -> Result<()> {
    if cfg.non_interactive || !std::io::stdin().is_terminal() {
        return Ok(());
    }
    println!(
        "About to WIPE ALL DATA on {} and write {} to it.",
        cfg.device, cfg.image
    );
    print!("Type 'yes' to continue: ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    if answer.trim() != "yes" {
        anyhow::bail!("Aborted by user");
    }
    Ok(())
}

fn step(step: Step, device: &Utf8Path) {
    tracing::info!("step {step}: {device}");
}

/// Run the full pipeline. `tools` supplies the destructive
/// capabilities; passing the dry-run implementations makes the whole
/// run inert. `teardown` is shared with the caller so an interrupt
/// handler can release it.
pub fn run(cfg: &ProvisionConfig, tools: Toolbox<'_>, teardown: &SharedTeardown) -> Result<()> {
    step(Step::Init, &cfg.device);
    let points = prepare_workdir(teardown)?;

    let result = run_steps(cfg, tools, teardown, &points);
    // Release on both paths; the normal Unmount step has already
    // drained the list on success, so this only cleans up after errors.
    release_shared(teardown, tools.mounts);
    result
}

fn run_steps(
    cfg: &ProvisionConfig,
    tools: Toolbox<'_>,
    teardown: &SharedTeardown,
    points: &Mountpoints,
) -> Result<()> {
    step(Step::Validate, &cfg.device);
    let target = validate::validate(cfg)?;

    // Keyed on the resolved node so two runs naming the same device
    // through different symlinks contend.
    let _lock = if cfg.dry_run {
        None
    } else {
        Some(InstanceLock::acquire(&target.node)?)
    };

    step(Step::Confirm, &cfg.device);
    if !cfg.dry_run {
        confirm_wipe(cfg)?;
    }

    execute(
        cfg,
        tools,
        teardown,
        points,
        &target.node,
        &target.device.all_mountpoints(),
    )
}

/// The destructive tail of the pipeline, from wipe onward. `node` is
/// the canonical device node from validation; every destructive call
/// and partition-node computation addresses it, never the user-supplied
/// path (which may be a /dev/disk/by-id symlink whose partition links
/// follow a different naming scheme).
fn execute(
    cfg: &ProvisionConfig,
    tools: Toolbox<'_>,
    teardown: &SharedTeardown,
    points: &Mountpoints,
    node: &Utf8Path,
    existing_mounts: &[String],
) -> Result<()> {
    step(Step::Wipe, node);
    // Existing filesystems on the device may be auto-mounted; unmount
    // them best-effort before destroying their superblocks.
    for mp in existing_mounts {
        if let Err(e) = tools.mounts.unmount(Utf8Path::new(mp)) {
            tracing::warn!("failed to unmount pre-existing mount {mp}: {e:#}");
        }
    }
    tools.partitioner.wipe_signatures(node)?;

    step(Step::Partition, node);
    let layout = DiskLayout {
        boot_part_name: cfg.boot_part_name.clone(),
        payload_part_name: cfg.payload_part_name.clone(),
        boot_end_mib: cfg.boot_end_mib,
    };
    tools.partitioner.create_layout(node, &layout)?;
    tools.partitioner.settle(node)?;
    let boot_node = blockdev::partition_node(node, 1);
    let payload_node = blockdev::partition_node(node, 2);

    step(Step::Format, node);
    tools.formatter.format_boot(&boot_node, &cfg.boot_label)?;
    tools
        .formatter
        .format_payload(&payload_node, &cfg.payload_label)?;

    step(Step::Mount, node);
    let register = |at: &Utf8Path| {
        teardown
            .lock()
            .expect("teardown lock poisoned")
            .register_mount(at);
    };
    tools.mounts.mount_image(&cfg.image, &points.image)?;
    register(&points.image);
    tools.mounts.mount_boot(&boot_node, &points.boot)?;
    register(&points.boot);
    tools.mounts.mount_payload(&payload_node, &points.payload)?;
    register(&points.payload);

    step(Step::Copy, node);
    // Boot volume: everything except the large payload, plus the one
    // boot image the firmware loader needs from it.
    tools
        .copier
        .mirror(&points.image, &points.boot, &[SOURCES_DIR])?;
    let boot_sources = points.boot.join(SOURCES_DIR);
    if !cfg.dry_run {
        std::fs::create_dir_all(&boot_sources)
            .with_context(|| format!("Creating {boot_sources}"))?;
    }
    tools
        .copier
        .copy_file(&points.image.join(BOOT_IMAGE), &points.boot.join(BOOT_IMAGE))?;
    // Payload volume: the complete image contents.
    tools.copier.mirror(&points.image, &points.payload, &[])?;

    step(Step::InstallDescriptor, node);
    if cfg.with_descriptor {
        let template = render::load_template(cfg.template.as_deref())?;
        let content = render::render(&template, &cfg.render);
        if cfg.dry_run {
            println!("dry-run: would install descriptor to both volume roots");
        } else {
            let boot_dest = points.boot.join(render::DESCRIPTOR_FILENAME);
            let payload_dest = points.payload.join(render::DESCRIPTOR_FILENAME);
            render::install(&content, &[boot_dest.as_path(), payload_dest.as_path()])?;
        }
    }

    step(Step::Sync, node);
    tools.mounts.sync_filesystem(&points.boot)?;
    tools.mounts.sync_filesystem(&points.payload)?;

    step(Step::Unmount, node);
    release_shared(teardown, tools.mounts);
    tools.mounts.flush_device(node)?;

    println!("{node}: provisioning complete, media is safe to remove");
    Ok(())
}
