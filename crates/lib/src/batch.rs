//! Batch descriptor generation from a tab-separated roster.
//!
//! Each roster row overlays per-machine bindings onto a base
//! configuration and renders one descriptor file into the output
//! directory, named by row number and account slug.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::config::RenderConfig;
use crate::render;

/// Fixed roster column order. Trailing columns may be omitted; empty
/// fields leave the base configuration's value in place.
const COLUMNS: [&str; 9] = [
    "account name",
    "display name",
    "group",
    "password",
    "registered owner",
    "registered organization",
    "language",
    "time zone",
    "product key",
];

/// One rendered output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    pub row: usize,
    pub filename: String,
}

/// Lowercase alphanumeric slug; every other run of characters collapses
/// to a single dash. Deterministic so re-runs produce the same names.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_dash = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if out.is_empty() {
        out.push_str("machine");
    }
    out
}

fn overlay_row(base: &RenderConfig, fields: &[&str]) -> Result<RenderConfig> {
    let mut cfg = base.clone();
    let field = |i: usize| -> Option<&str> {
        fields.get(i).map(|s| s.trim()).filter(|s| !s.is_empty())
    };
    let b = &mut cfg.bindings;
    if let Some(v) = field(0) {
        b.account_name = Some(v.to_owned());
    }
    if let Some(v) = field(1) {
        b.account_display_name = Some(v.to_owned());
    }
    if let Some(v) = field(2) {
        b.account_group = Some(v.to_owned());
    }
    if let Some(v) = field(3) {
        b.account_password = Some(v.to_owned());
    }
    if let Some(v) = field(4) {
        b.registered_owner = Some(v.to_owned());
    }
    if let Some(v) = field(5) {
        b.registered_organization = Some(v.to_owned());
    }
    if let Some(v) = field(6) {
        b.install_language = Some(v.parse().with_context(|| format!("Column {:?}", COLUMNS[6]))?);
    }
    if let Some(v) = field(7) {
        b.time_zone = Some(v.to_owned());
    }
    if let Some(v) = field(8) {
        b.product_key = Some(v.to_owned());
    }
    Ok(cfg)
}

/// Render one descriptor per roster row into `outdir`. Blank lines and
/// `#` comments are skipped; rows without a tab are reported and
/// skipped. Returns the entries written, in roster order.
#[context("Generating batch descriptors")]
pub fn generate(
    roster: &str,
    base: &RenderConfig,
    template: &str,
    outdir: &Utf8Path,
) -> Result<Vec<BatchEntry>> {
    std::fs::create_dir_all(outdir).with_context(|| format!("Creating {outdir}"))?;
    let mut entries = Vec::new();
    let mut row = 0usize;
    for (lineno, line) in roster.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        if !line.contains('\t') {
            tracing::warn!("line {}: no tab separator, skipping", lineno + 1);
            continue;
        }
        row += 1;
        let fields: Vec<&str> = line.split('\t').collect();
        let cfg = overlay_row(base, &fields).with_context(|| format!("Line {}", lineno + 1))?;
        let slug = slugify(cfg.bindings.account_name.as_deref().unwrap_or_default());
        let filename = format!("{row:03}-{slug}.xml");
        let content = render::render(template, &cfg);
        render::install_one(&content, &outdir.join(&filename))?;
        entries.push(BatchEntry { row, filename });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    fn outdir(td: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(td.path().join("out")).unwrap()
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Alice Smith"), "alice-smith");
        assert_eq!(slugify("  lab--07 "), "lab-07");
        assert_eq!(slugify("Ünïcode"), "n-code");
        assert_eq!(slugify("!!!"), "machine");
        // Deterministic.
        assert_eq!(slugify("Alice Smith"), slugify("Alice Smith"));
    }

    #[test]
    fn test_generate_skips_comments_and_blank_and_tabless() {
        let roster = "\
# header comment
alice\tAlice\tAdministrators\thunter2

this line has no tab and is skipped
bob\tBob\tUsers\ts3cret
";
        let td = tempfile::tempdir().unwrap();
        let out = outdir(&td);
        let entries = generate(roster, &RenderConfig::default(), render::DEFAULT_TEMPLATE, &out)
            .unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, ["001-alice.xml", "002-bob.xml"]);
        assert!(out.join("001-alice.xml").exists());
    }

    #[test]
    fn test_overlay_preserves_base_for_empty_fields() {
        let mut base = RenderConfig::default();
        base.bindings.time_zone = Some("UTC".into());
        base.bindings.registered_owner = Some("Lab".into());
        // Row sets a name but leaves owner and time zone columns empty.
        let fields: Vec<&str> = "carol\tCarol\tUsers\tpw\t\t\t\t\t".split('\t').collect();
        let cfg = overlay_row(&base, &fields).unwrap();
        assert_eq!(cfg.bindings.account_name.as_deref(), Some("carol"));
        assert_eq!(cfg.bindings.time_zone.as_deref(), Some("UTC"));
        assert_eq!(cfg.bindings.registered_owner.as_deref(), Some("Lab"));
    }

    #[test]
    fn test_overlay_row_overrides_language() {
        let fields: Vec<&str> = "dave\tDave\tUsers\tpw\t\t\tde-DE\tUTC\t"
            .split('\t')
            .collect();
        let cfg = overlay_row(&RenderConfig::default(), &fields).unwrap();
        assert_eq!(
            cfg.bindings.install_language.as_ref().map(|l| l.as_str()),
            Some("de-DE")
        );
        assert!(overlay_row(
            &RenderConfig::default(),
            &"x\ty\tg\tp\t\t\tNOT_A_TAG\t\t".split('\t').collect::<Vec<_>>()
        )
        .is_err());
    }

    #[test]
    fn test_rendered_rows_carry_their_account() {
        let roster = "erin\tErin\tAdministrators\tpw123\n";
        let mut base = RenderConfig::default();
        base.features.auto_logon = true;
        let td = tempfile::tempdir().unwrap();
        let out = outdir(&td);
        generate(roster, &base, render::DEFAULT_TEMPLATE, &out).unwrap();
        let content = std::fs::read_to_string(out.join("001-erin.xml")).unwrap();
        assert!(content.contains("<Name>erin</Name>"));
        assert!(content.contains("<Username>erin</Username>"));
        assert!(!content.contains("BEGIN_"));
    }
}
