//! Typed run configuration.
//!
//! Everything here is validated once, at the process boundary; the rest
//! of the crate receives immutable values and never re-checks strings.

use std::fmt::Display;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use regex::Regex;

/// FAT32 volume labels are limited to 11 bytes.
pub const BOOT_LABEL_MAX: usize = 11;
/// NTFS volume labels are limited to 32 characters.
pub const PAYLOAD_LABEL_MAX: usize = 32;

/// An install language tag: 2-3 lowercase letters, optionally followed
/// by a capitalized 4-letter script and/or a 2-letter or 3-digit region
/// (e.g. `en-US`, `sr-Latn-RS`, `es-419`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageTag(String);

impl FromStr for LanguageTag {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^[a-z]{2,3}(-[A-Z][a-z]{3})?(-([A-Z]{2}|[0-9]{3}))?$")
                .expect("static regex")
        });
        if !pattern.is_match(s) {
            anyhow::bail!("Invalid language tag (expected e.g. en-US): {s}");
        }
        Ok(Self(s.to_owned()))
    }
}

impl Display for LanguageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl LanguageTag {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Zero-based disk index for multi-disk installer targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskIndex(u32);

impl FromStr for DiskIndex {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let v = s
            .parse::<u32>()
            .with_context(|| format!("Invalid disk index (expected a non-negative integer): {s}"))?;
        Ok(Self(v))
    }
}

impl Display for DiskIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Boolean descriptor features; each toggles one template region.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct FeatureOpts {
    /// Bypass the installer's hardware requirements checks.
    #[clap(long, env = "WINSTICK_BYPASS_REQUIREMENTS_CHECK")]
    pub bypass_requirements_check: bool,

    /// Skip the interactive first-run wizard.
    #[clap(long, env = "WINSTICK_SKIP_OOBE")]
    pub skip_oobe: bool,

    /// Sign in the local account automatically on first boot.
    #[clap(long, env = "WINSTICK_AUTO_LOGON")]
    pub auto_logon: bool,

    /// Disable telemetry and advertising features in the installed system.
    #[clap(long, env = "WINSTICK_DISABLE_TELEMETRY")]
    pub disable_telemetry: bool,
}

/// String bindings substituted into the descriptor template. A binding
/// that is absent (or empty) leaves its template region disabled.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct BindingOpts {
    /// Install language, e.g. en-US.
    #[clap(long, env = "WINSTICK_INSTALL_LANGUAGE")]
    pub install_language: Option<LanguageTag>,

    /// Disk index the installer should target on multi-disk machines.
    #[clap(long, env = "WINSTICK_TARGET_DISK")]
    pub target_disk: Option<DiskIndex>,

    /// Product key to embed.
    #[clap(long, env = "WINSTICK_PRODUCT_KEY")]
    pub product_key: Option<String>,

    /// Registered owner name.
    #[clap(long, env = "WINSTICK_REGISTERED_OWNER")]
    pub registered_owner: Option<String>,

    /// Registered organization name.
    #[clap(long, env = "WINSTICK_REGISTERED_ORGANIZATION")]
    pub registered_organization: Option<String>,

    /// Time zone identifier for the installed system.
    #[clap(long, env = "WINSTICK_TIME_ZONE")]
    pub time_zone: Option<String>,

    /// Local account name. The local-account region is only rendered when
    /// name, group, password and display name are all provided.
    #[clap(long, env = "WINSTICK_ACCOUNT_NAME")]
    pub account_name: Option<String>,

    /// Group the local account joins.
    #[clap(long, env = "WINSTICK_ACCOUNT_GROUP")]
    pub account_group: Option<String>,

    /// Local account password.
    #[clap(long, env = "WINSTICK_ACCOUNT_PASSWORD")]
    pub account_password: Option<String>,

    /// Local account display name.
    #[clap(long, env = "WINSTICK_ACCOUNT_DISPLAY_NAME")]
    pub account_display_name: Option<String>,
}

/// The four local-account bindings, present only as a complete group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAccount<'a> {
    pub name: &'a str,
    pub group: &'a str,
    pub password: &'a str,
    pub display_name: &'a str,
}

fn nonempty(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.is_empty())
}

impl BindingOpts {
    /// All four account bindings, or `None` if any is missing. Partial
    /// bindings never leak into rendered output.
    pub fn local_account(&self) -> Option<LocalAccount<'_>> {
        Some(LocalAccount {
            name: nonempty(&self.account_name)?,
            group: nonempty(&self.account_group)?,
            password: nonempty(&self.account_password)?,
            display_name: nonempty(&self.account_display_name)?,
        })
    }

    pub fn product_key(&self) -> Option<&str> {
        nonempty(&self.product_key)
    }

    pub fn registered_owner(&self) -> Option<&str> {
        nonempty(&self.registered_owner)
    }

    pub fn registered_organization(&self) -> Option<&str> {
        nonempty(&self.registered_organization)
    }

    pub fn time_zone(&self) -> Option<&str> {
        nonempty(&self.time_zone)
    }
}

/// Everything the descriptor renderer needs; a pure value.
#[derive(Debug, Clone, Default)]
pub struct RenderConfig {
    pub features: FeatureOpts,
    pub bindings: BindingOpts,
}

/// Options for provisioning a device (the destructive mode).
#[derive(Debug, Clone, clap::Args)]
pub struct ProvisionOpts {
    /// Target block device. The entire device will be wiped.
    #[clap(long, env = "WINSTICK_DEVICE")]
    pub device: Utf8PathBuf,

    /// Path to the installer ISO image.
    #[clap(long, env = "WINSTICK_IMAGE")]
    pub image: Utf8PathBuf,

    /// FAT32 label for the boot volume (at most 11 characters).
    #[clap(long, env = "WINSTICK_BOOT_LABEL", default_value = "BOOT")]
    pub boot_label: String,

    /// NTFS label for the payload volume (at most 32 characters).
    #[clap(long, env = "WINSTICK_PAYLOAD_LABEL", default_value = "Installer")]
    pub payload_label: String,

    /// GPT partition name for the boot partition.
    #[clap(long, env = "WINSTICK_BOOT_PART_NAME", default_value = "winstick-boot")]
    pub boot_part_name: String,

    /// GPT partition name for the payload partition.
    #[clap(
        long,
        env = "WINSTICK_PAYLOAD_PART_NAME",
        default_value = "winstick-payload"
    )]
    pub payload_part_name: String,

    /// End offset of the boot partition; MiB unless an M/G/T suffix is given.
    #[clap(long, env = "WINSTICK_BOOT_SIZE", default_value = "1024")]
    pub boot_size: String,

    /// Render an unattended-install descriptor onto both volumes.
    #[clap(long, env = "WINSTICK_WITH_DESCRIPTOR")]
    pub with_descriptor: bool,

    /// Descriptor template; the built-in template is used when omitted.
    #[clap(long, env = "WINSTICK_TEMPLATE")]
    pub template: Option<Utf8PathBuf>,

    /// Skip the interactive confirmation before wiping the device.
    #[clap(long, env = "WINSTICK_NO_CONFIRM")]
    pub no_confirm: bool,

    /// Report every destructive call without executing any of them.
    #[clap(long, env = "WINSTICK_DRY_RUN")]
    pub dry_run: bool,

    #[clap(flatten)]
    pub features: FeatureOpts,

    #[clap(flatten)]
    pub bindings: BindingOpts,
}

/// Validated, immutable provisioning configuration.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    pub device: Utf8PathBuf,
    pub image: Utf8PathBuf,
    pub boot_label: String,
    pub payload_label: String,
    pub boot_part_name: String,
    pub payload_part_name: String,
    pub boot_end_mib: u64,
    pub with_descriptor: bool,
    pub template: Option<Utf8PathBuf>,
    pub non_interactive: bool,
    pub dry_run: bool,
    pub render: RenderConfig,
}

impl ProvisionOpts {
    /// Resolve CLI/env options into the immutable run configuration.
    /// Only syntactic (usage) validation happens here; device-level
    /// checks live in [`crate::validate`].
    pub fn into_config(self) -> Result<ProvisionConfig> {
        let boot_end_mib = crate::blockdev::parse_size_mib(&self.boot_size)
            .context("Parsing --boot-size")?;
        if boot_end_mib == 0 {
            return Err(anyhow!("--boot-size must be greater than zero"));
        }
        Ok(ProvisionConfig {
            device: self.device,
            image: self.image,
            boot_label: self.boot_label,
            payload_label: self.payload_label,
            boot_part_name: self.boot_part_name,
            payload_part_name: self.payload_part_name,
            boot_end_mib,
            with_descriptor: self.with_descriptor,
            template: self.template,
            non_interactive: self.no_confirm,
            dry_run: self.dry_run,
            render: RenderConfig {
                features: self.features,
                bindings: self.bindings,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_tag() {
        for ok in ["en", "en-US", "pt-BR", "sr-Latn-RS", "es-419", "yue"] {
            LanguageTag::from_str(ok).unwrap();
        }
        for bad in ["", "EN-US", "en_US", "e", "en-us", "en-USA", "en-Latn-Something"] {
            assert!(LanguageTag::from_str(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_disk_index() {
        assert_eq!(DiskIndex::from_str("0").unwrap().to_string(), "0");
        assert_eq!(DiskIndex::from_str("3").unwrap().to_string(), "3");
        assert!(DiskIndex::from_str("-1").is_err());
        assert!(DiskIndex::from_str("two").is_err());
    }

    #[test]
    fn test_local_account_requires_all_four() {
        let mut b = BindingOpts {
            account_name: Some("alice".into()),
            account_group: Some("Administrators".into()),
            account_password: Some("hunter2".into()),
            account_display_name: Some("Alice".into()),
            ..Default::default()
        };
        assert!(b.local_account().is_some());
        b.account_password = Some(String::new());
        assert!(b.local_account().is_none());
        b.account_password = None;
        assert!(b.local_account().is_none());
    }

    #[test]
    fn test_boot_size_parsing() {
        let opts = ProvisionOpts {
            device: "/dev/sdz".into(),
            image: "/tmp/x.iso".into(),
            boot_label: "BOOT".into(),
            payload_label: "Installer".into(),
            boot_part_name: "b".into(),
            payload_part_name: "p".into(),
            boot_size: "2G".into(),
            with_descriptor: false,
            template: None,
            no_confirm: false,
            dry_run: true,
            features: Default::default(),
            bindings: Default::default(),
        };
        let cfg = opts.into_config().unwrap();
        assert_eq!(cfg.boot_end_mib, 2048);
    }
}
