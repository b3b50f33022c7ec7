//! # Bootable Windows installer media provisioning
//!
//! This crate partitions and formats a removable device into the
//! two-volume boot/payload split required for large installer images,
//! mirrors the installer tree onto it, and renders an
//! unattended-install descriptor from a conditional template.

pub mod batch;
pub mod config;
pub mod host;
pub mod lock;
pub mod provision;
pub mod render;
pub mod template;
pub mod validate;

// Re-export the blockdev crate for internal use
pub(crate) use winstick_blockdev as blockdev;
