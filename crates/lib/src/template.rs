//! Conditional region toggling and placeholder substitution.
//!
//! Templates carry paired `BEGIN_<NAME>`/`END_<NAME>` marker lines
//! delimiting optional regions, and `__TOKEN__` placeholders. A
//! [`RenderPlan`] is compiled from the configuration once and applied
//! as a pure text transform: region filtering first, substitution
//! second, so no replacement ever lands in deleted text.

use crate::config::RenderConfig;

/// What to do with a named region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionAction {
    /// Keep the content, remove exactly the two marker lines.
    StripMarkers,
    /// Remove the marker lines and everything between them.
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RegionRule {
    name: &'static str,
    action: RegionAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SubstRule {
    token: &'static str,
    /// Replacement in the substitution grammar (see [`escape_replacement`]).
    replacement: String,
}

/// The compiled output of the toggle compiler: a deterministic set of
/// region rules plus token substitution rules. A pure function of the
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderPlan {
    regions: Vec<RegionRule>,
    substitutions: Vec<SubstRule>,
}

/// Escape a raw binding value for the substitution grammar, where `\`
/// escapes the next character, `&` recalls the matched token and `/`
/// delimits rules. Escaped values substitute literally.
pub fn escape_replacement(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '&' | '/') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Expand an escaped replacement: `\X` yields a literal X, a bare `&`
/// yields the matched token text.
fn expand_replacement(escaped: &str, matched: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '&' => out.push_str(matched),
            other => out.push(other),
        }
    }
    out
}

/// True when `line` carries the marker `<prefix><name>` as a standalone
/// word (not as a prefix of a longer marker name).
fn line_has_marker(line: &str, prefix: &str, name: &str) -> bool {
    let mut start = 0;
    while let Some(rel) = line[start..].find(prefix) {
        let idx = start + rel;
        let rest = &line[idx + prefix.len()..];
        if rest.starts_with(name) {
            let before_ok = line[..idx]
                .chars()
                .next_back()
                .is_none_or(|c| !c.is_ascii_alphanumeric() && c != '_');
            let after_ok = rest[name.len()..]
                .chars()
                .next()
                .is_none_or(|c| !c.is_ascii_alphanumeric() && c != '_');
            if before_ok && after_ok {
                return true;
            }
        }
        start = idx + prefix.len();
    }
    false
}

impl RenderPlan {
    /// Compile region and substitution rules from the configuration.
    /// Rules are emitted name-sorted, so equal configurations always
    /// compile to identical plans.
    pub fn compile(cfg: &RenderConfig) -> RenderPlan {
        let mut plan = RenderPlan {
            regions: Vec::new(),
            substitutions: Vec::new(),
        };
        let f = &cfg.features;
        let b = &cfg.bindings;

        // Boolean features: enabled purely by their flag.
        plan.region("BYPASS_REQUIREMENTS_CHECK", f.bypass_requirements_check);
        plan.region("SKIP_OOBE", f.skip_oobe);
        plan.region("AUTO_LOGON", f.auto_logon);
        plan.region("DISABLE_TELEMETRY", f.disable_telemetry);

        // Presence regions: enabled iff the binding is a non-empty string.
        plan.presence(
            "INSTALL_LANGUAGE",
            "__INSTALL_LANGUAGE__",
            b.install_language.as_ref().map(|v| v.to_string()).as_deref(),
        );
        plan.presence(
            "TARGET_DISK",
            "__TARGET_DISK__",
            b.target_disk.map(|v| v.to_string()).as_deref(),
        );
        plan.presence("PRODUCT_KEY", "__PRODUCT_KEY__", b.product_key());
        plan.presence("REGISTERED_OWNER", "__REGISTERED_OWNER__", b.registered_owner());
        plan.presence(
            "REGISTERED_ORGANIZATION",
            "__REGISTERED_ORGANIZATION__",
            b.registered_organization(),
        );
        plan.presence("TIME_ZONE", "__TIME_ZONE__", b.time_zone());

        // The local-account region requires the whole binding group.
        match b.local_account() {
            Some(account) => {
                plan.region("LOCAL_ACCOUNT", true);
                plan.subst("__ACCOUNT_NAME__", account.name);
                plan.subst("__ACCOUNT_GROUP__", account.group);
                plan.subst("__ACCOUNT_PASSWORD__", account.password);
                plan.subst("__ACCOUNT_DISPLAY_NAME__", account.display_name);
            }
            None => plan.region("LOCAL_ACCOUNT", false),
        }

        plan.regions.sort_by_key(|r| r.name);
        plan.substitutions.sort_by_key(|s| s.token);
        plan
    }

    fn region(&mut self, name: &'static str, enabled: bool) {
        let action = if enabled {
            RegionAction::StripMarkers
        } else {
            RegionAction::Delete
        };
        self.regions.push(RegionRule { name, action });
    }

    fn presence(&mut self, name: &'static str, token: &'static str, value: Option<&str>) {
        match value.filter(|v| !v.is_empty()) {
            Some(v) => {
                self.region(name, true);
                self.subst(token, v);
            }
            None => self.region(name, false),
        }
    }

    fn subst(&mut self, token: &'static str, raw: &str) {
        self.substitutions.push(SubstRule {
            token,
            replacement: escape_replacement(raw),
        });
    }

    /// Apply the plan to template text. Region filtering runs before
    /// substitution; markers with no rule pass through untouched.
    pub fn apply(&self, template: &str) -> String {
        let filtered = self.apply_regions(template);
        self.apply_substitutions(&filtered)
    }

    fn apply_regions(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut deleting: Option<&'static str> = None;
        for line in text.split_inclusive('\n') {
            if let Some(name) = deleting {
                if line_has_marker(line, "END_", name) {
                    deleting = None;
                }
                continue;
            }
            if let Some(rule) = self
                .regions
                .iter()
                .find(|r| line_has_marker(line, "BEGIN_", r.name))
            {
                // Marker line dropped either way; Delete also swallows
                // everything up to the matching end marker.
                if rule.action == RegionAction::Delete {
                    deleting = Some(rule.name);
                }
                continue;
            }
            if self
                .regions
                .iter()
                .any(|r| line_has_marker(line, "END_", r.name))
            {
                // End marker of an enabled region.
                continue;
            }
            out.push_str(line);
        }
        out
    }

    fn apply_substitutions(&self, text: &str) -> String {
        let mut out = text.to_owned();
        for rule in &self.substitutions {
            if out.contains(rule.token) {
                let expanded = expand_replacement(&rule.replacement, rule.token);
                out = out.replace(rule.token, &expanded);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BindingOpts, FeatureOpts};
    use indoc::indoc;
    use similar_asserts::assert_eq;
    use std::str::FromStr;

    fn config_with_account() -> RenderConfig {
        RenderConfig {
            features: FeatureOpts {
                skip_oobe: true,
                ..Default::default()
            },
            bindings: BindingOpts {
                install_language: Some(crate::config::LanguageTag::from_str("en-US").unwrap()),
                account_name: Some("alice".into()),
                account_group: Some("Administrators".into()),
                account_password: Some("hunter2".into()),
                account_display_name: Some("Alice".into()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_compile_is_deterministic() {
        let cfg = config_with_account();
        assert_eq!(RenderPlan::compile(&cfg), RenderPlan::compile(&cfg));
    }

    #[test]
    fn test_disabled_region_removed_exactly() {
        let template = indoc! {"
            before
            <!-- BEGIN_PRODUCT_KEY -->
            <Key>__PRODUCT_KEY__</Key>
            <!-- END_PRODUCT_KEY -->
            after
        "};
        let plan = RenderPlan::compile(&RenderConfig::default());
        assert_eq!(plan.apply(template), "before\nafter\n");
    }

    #[test]
    fn test_enabled_region_keeps_content_strips_markers() {
        let template = indoc! {"
            <!-- BEGIN_PRODUCT_KEY -->
            <Key>__PRODUCT_KEY__</Key>
            <!-- END_PRODUCT_KEY -->
        "};
        let cfg = RenderConfig {
            bindings: BindingOpts {
                product_key: Some("ABCDE-12345".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let plan = RenderPlan::compile(&cfg);
        assert_eq!(plan.apply(template), "<Key>ABCDE-12345</Key>\n");
    }

    #[test]
    fn test_unknown_marker_passthrough() {
        let template = indoc! {"
            <!-- BEGIN_SOMETHING_ELSE -->
            kept
            <!-- END_SOMETHING_ELSE -->
        "};
        let plan = RenderPlan::compile(&RenderConfig::default());
        assert_eq!(plan.apply(template), template);
    }

    #[test]
    fn test_all_or_nothing_local_account() {
        let template = indoc! {"
            <!-- BEGIN_LOCAL_ACCOUNT -->
            <Name>__ACCOUNT_NAME__</Name>
            <Group>__ACCOUNT_GROUP__</Group>
            <Password>__ACCOUNT_PASSWORD__</Password>
            <DisplayName>__ACCOUNT_DISPLAY_NAME__</DisplayName>
            <!-- END_LOCAL_ACCOUNT -->
        "};
        // All four present: fully rendered.
        let cfg = config_with_account();
        let out = RenderPlan::compile(&cfg).apply(template);
        assert_eq!(
            out,
            indoc! {"
                <Name>alice</Name>
                <Group>Administrators</Group>
                <Password>hunter2</Password>
                <DisplayName>Alice</DisplayName>
            "}
        );
        // Any one missing: region fully absent, no token leaks.
        for strip in 0..4 {
            let mut cfg = config_with_account();
            match strip {
                0 => cfg.bindings.account_name = None,
                1 => cfg.bindings.account_group = None,
                2 => cfg.bindings.account_password = Some(String::new()),
                _ => cfg.bindings.account_display_name = None,
            }
            let out = RenderPlan::compile(&cfg).apply(template);
            assert_eq!(out, "", "partial account leaked for case {strip}");
        }
    }

    #[test]
    fn test_escaping_round_trip() {
        for value in [
            r"pa/ss&wo\rd",
            r"\\server\share",
            "a&&b",
            "tricky /&\\ mix",
        ] {
            let template = "<Password>__ACCOUNT_PASSWORD__</Password>";
            let mut cfg = config_with_account();
            cfg.bindings.account_password = Some(value.into());
            let out = RenderPlan::compile(&cfg).apply(template);
            assert_eq!(out, format!("<Password>{value}</Password>"));
        }
    }

    #[test]
    fn test_unescaped_ampersand_recalls_match() {
        let expanded = expand_replacement("x&y", "__T__");
        assert_eq!(expanded, "x__T__y");
    }

    #[test]
    fn test_no_partial_token_match() {
        let template = "__TARGET_DISK__X __TARGET_DISK __TARGET_DISK__";
        let cfg = RenderConfig {
            bindings: BindingOpts {
                target_disk: Some(crate::config::DiskIndex::from_str("1").unwrap()),
                ..Default::default()
            },
            ..Default::default()
        };
        let out = RenderPlan::compile(&cfg).apply(template);
        // Only exact `__TARGET_DISK__` occurrences are replaced.
        assert_eq!(out, "1X __TARGET_DISK 1");
    }

    #[test]
    fn test_marker_name_boundaries() {
        // TIME_ZONE must not toggle a hypothetical TIME_ZONE_EXTENDED region.
        let template = indoc! {"
            <!-- BEGIN_TIME_ZONE_EXTENDED -->
            kept
            <!-- END_TIME_ZONE_EXTENDED -->
        "};
        let cfg = RenderConfig {
            bindings: BindingOpts {
                time_zone: Some("UTC".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(RenderPlan::compile(&cfg).apply(template), template);
    }

    #[test]
    fn test_deletion_precedes_substitution() {
        // A token inside a disabled region must not be substituted, and
        // the same token outside the region must be.
        let template = indoc! {"
            <!-- BEGIN_AUTO_LOGON -->
            <User>__ACCOUNT_NAME__</User>
            <!-- END_AUTO_LOGON -->
            <Owner>__ACCOUNT_NAME__</Owner>
        "};
        let cfg = config_with_account();
        let out = RenderPlan::compile(&cfg).apply(template);
        assert_eq!(out, "<Owner>alice</Owner>\n");
    }
}
