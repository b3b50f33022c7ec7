//! Descriptor rendering and installation.
//!
//! Rendering composes the toggle compiler and the substitution engine;
//! installation writes the identical rendered bytes to one or more
//! destinations with atomic replace-or-fail semantics.

use std::io::Write;

use anyhow::{anyhow, Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::config::RenderConfig;
use crate::template::RenderPlan;

/// Filename convention for the descriptor at a volume root.
pub const DESCRIPTOR_FILENAME: &str = "autounattend.xml";

/// The built-in descriptor template.
pub const DEFAULT_TEMPLATE: &str = include_str!("autounattend.xml.in");

/// Load the template from `path`, or the built-in one when no path is
/// given. A missing or unreadable template is fatal to the render.
#[context("Loading descriptor template")]
pub fn load_template(path: Option<&Utf8Path>) -> Result<String> {
    match path {
        Some(p) => std::fs::read_to_string(p).with_context(|| format!("Reading {p}")),
        None => Ok(DEFAULT_TEMPLATE.to_owned()),
    }
}

/// Render one descriptor: compile the plan from the configuration and
/// apply it (region filtering, then substitution).
pub fn render(template: &str, cfg: &RenderConfig) -> String {
    RenderPlan::compile(cfg).apply(template)
}

/// Atomically place `content` at `dest`: write a temporary file in the
/// destination directory, then persist it into place. A failed write
/// never leaves a truncated descriptor behind.
#[context("Installing descriptor to {dest}")]
pub fn install_one(content: &str, dest: &Utf8Path) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| anyhow!("Destination {dest} has no parent directory"))?;
    std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(parent).with_context(|| format!("Creating temporary file in {parent}"))?;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    tmp.persist(dest)
        .with_context(|| format!("Persisting {dest}"))?;
    tracing::debug!("installed descriptor at {dest}");
    Ok(())
}

/// Write the identical rendered bytes to every destination. The
/// dual-filesystem provisioning mode relies on this to place the same
/// descriptor on both the boot and payload volumes.
pub fn install(content: &str, destinations: &[&Utf8Path]) -> Result<()> {
    for dest in destinations {
        install_one(content, dest)?;
    }
    Ok(())
}
