//! Command-line entrypoint.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;

use winstick_lib::config::{BindingOpts, FeatureOpts, ProvisionOpts, RenderConfig};
use winstick_lib::host::{DryRunHost, Host, MountManager, Toolbox};
use winstick_lib::provision::{self, SharedTeardown};
use winstick_lib::{batch, render};

/// Render a descriptor to a file (or stdout) without touching a device.
#[derive(Debug, clap::Args)]
struct DescriptorOpts {
    /// Output path; `-` writes to stdout.
    #[clap(long, short, default_value = "-", env = "WINSTICK_OUTPUT")]
    output: Utf8PathBuf,

    /// Descriptor template; the built-in template is used when omitted.
    #[clap(long, env = "WINSTICK_TEMPLATE")]
    template: Option<Utf8PathBuf>,

    #[clap(flatten)]
    features: FeatureOpts,

    #[clap(flatten)]
    bindings: BindingOpts,
}

/// Render one descriptor per row of a tab-separated roster.
#[derive(Debug, clap::Args)]
struct BatchOpts {
    /// Roster file: one machine per line, tab-separated columns
    /// (account name, display name, group, password, registered owner,
    /// registered organization, language, time zone, product key).
    #[clap(env = "WINSTICK_ROSTER")]
    roster: Utf8PathBuf,

    /// Directory receiving the rendered descriptors.
    #[clap(long, short, default_value = ".", env = "WINSTICK_OUTDIR")]
    outdir: Utf8PathBuf,

    /// Descriptor template; the built-in template is used when omitted.
    #[clap(long, env = "WINSTICK_TEMPLATE")]
    template: Option<Utf8PathBuf>,

    #[clap(flatten)]
    features: FeatureOpts,

    #[clap(flatten)]
    bindings: BindingOpts,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Wipe a device and write bootable installer media onto it.
    Provision(ProvisionOpts),
    /// Render an unattended-install descriptor.
    Descriptor(DescriptorOpts),
    /// Render descriptors for a roster of machines.
    Batch(BatchOpts),
}

#[derive(Debug, Parser)]
#[clap(name = "winstick", version, about = "Bootable Windows installer media from Linux")]
struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[clap(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

async fn provision(opts: ProvisionOpts) -> Result<()> {
    let cfg = opts.into_config()?;
    let dry_run = cfg.dry_run;
    let teardown = provision::new_shared_teardown();

    tokio::spawn(interrupt_watcher(teardown.clone(), dry_run));

    tokio::task::spawn_blocking(move || {
        if dry_run {
            let host = DryRunHost;
            provision::run(&cfg, Toolbox::uniform(&host), &teardown)
        } else {
            let host = Host;
            provision::run(&cfg, Toolbox::uniform(&host), &teardown)
        }
    })
    .await
    .context("Provisioning task panicked")?
}

/// Release mounts and scratch state, then exit, when interrupted.
async fn interrupt_watcher(teardown: SharedTeardown, dry_run: bool) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("failed to install SIGTERM handler: {e}");
            return;
        }
    };
    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                tracing::warn!("failed to wait for ctrl-c: {e}");
                return;
            }
        }
        _ = term.recv() => {}
    }
    tracing::warn!("interrupted, releasing mounts");
    let mounts: &dyn MountManager = if dry_run { &DryRunHost } else { &Host };
    provision::release_shared(&teardown, mounts);
    std::process::exit(130);
}

fn descriptor(opts: DescriptorOpts) -> Result<()> {
    let template = render::load_template(opts.template.as_deref())?;
    let cfg = RenderConfig {
        features: opts.features,
        bindings: opts.bindings,
    };
    let content = render::render(&template, &cfg);
    if opts.output == "-" {
        print!("{content}");
        Ok(())
    } else {
        render::install_one(&content, &opts.output)
    }
}

fn batch(opts: BatchOpts) -> Result<()> {
    let template = render::load_template(opts.template.as_deref())?;
    let roster = std::fs::read_to_string(&opts.roster)
        .with_context(|| format!("Reading {}", opts.roster))?;
    let base = RenderConfig {
        features: opts.features,
        bindings: opts.bindings,
    };
    let entries = batch::generate(&roster, &base, &template, &opts.outdir)?;
    for e in &entries {
        println!("{}", opts.outdir.join(&e.filename));
    }
    tracing::info!("rendered {} descriptor(s)", entries.len());
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Provision(opts) => provision(opts).await,
        Command::Descriptor(opts) => descriptor(opts),
        Command::Batch(opts) => batch(opts),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    winstick_utils::initialize_tracing(cli.verbose);
    if let Err(e) = run(cli).await {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}
