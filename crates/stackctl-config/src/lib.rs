//! Stack-file + CLI overlay resolution for stackctl.
//!
//! Precedence is fixed (see the spec's open question on profile selection):
//! CLI overrides stack-file, stack-file overrides built-in defaults. No
//! deeper nesting is supported.
//!
//! The merge is a pure function, `resolve`, over three inputs: compiled-in
//! [`BuiltinDefaults`], the optional [`StackfileSettings`] parsed from the
//! root stack file, and [`CliOverrides`] built from command-line flags.
//! `Option` fields on [`StackfileSettings`] and [`CliOverrides`] mean "not
//! specified here" — there is no comparing-against-a-magic-default trick;
//! every layer either has an opinion (`Some`) or stays silent (`None`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackctl_types::RunOptions;

/// Compiled-in fallbacks, used when neither the stack file nor the CLI says
/// anything about a given option.
#[derive(Debug, Clone)]
pub struct BuiltinDefaults {
    pub concurrency: usize,
    pub progressive_concurrency: bool,
    pub allow_missing_deps: bool,
    pub allow_drift: bool,
    pub rerun_failed: bool,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            concurrency: 4,
            progressive_concurrency: false,
            allow_missing_deps: false,
            allow_drift: false,
            rerun_failed: false,
        }
    }
}

/// The subset of the top-level stack file this crate cares about.
///
/// Deserialized straight from the stack file's `run` table; other top-level
/// keys (clusters, default profile) are owned by `stackctl-types::universe`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackfileSettings {
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub per_cluster_concurrency: BTreeMap<String, usize>,
    #[serde(default)]
    pub progressive_concurrency: Option<bool>,
    #[serde(default)]
    pub allow_missing_deps: Option<bool>,
    #[serde(default)]
    pub allow_drift: Option<bool>,
    #[serde(default)]
    pub default_profile: Option<String>,
}

/// Flags parsed straight off the CLI.
///
/// `Option` fields mean "user did not pass this flag" when `None`. `bool`
/// fields mean "user explicitly enabled this" when `true` — there is no
/// `Option<bool>` ambiguity to resolve for flags that only ever turn a
/// behavior on (`--dry-run`, `--takeover`, ...).
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub concurrency: Option<usize>,
    pub per_cluster_concurrency: BTreeMap<String, usize>,
    pub progressive_concurrency: Option<bool>,
    pub allow_missing_deps: Option<bool>,
    pub allow_drift: Option<bool>,
    pub rerun_failed: bool,
    pub dry_run: bool,
    pub takeover: bool,
    pub profile: Option<String>,
}

/// Resolves the active profile name: CLI overrides stack-file, stack-file
/// overrides the built-in `"default"`. Deeper nesting is out of scope.
pub fn resolve_profile(stackfile: Option<&StackfileSettings>, cli: &CliOverrides) -> String {
    cli.profile
        .clone()
        .or_else(|| stackfile.and_then(|s| s.default_profile.clone()))
        .unwrap_or_else(|| "default".to_string())
}

/// Merges built-in defaults, stack-file settings, and CLI overrides into a
/// fully resolved [`RunOptions`]. Pure: same inputs always produce the same
/// output, and no input is mutated.
pub fn resolve(
    builtin: &BuiltinDefaults,
    stackfile: Option<&StackfileSettings>,
    cli: &CliOverrides,
) -> RunOptions {
    let concurrency = cli
        .concurrency
        .or_else(|| stackfile.and_then(|s| s.concurrency))
        .unwrap_or(builtin.concurrency);

    let mut per_cluster_concurrency = stackfile
        .map(|s| s.per_cluster_concurrency.clone())
        .unwrap_or_default();
    per_cluster_concurrency.extend(cli.per_cluster_concurrency.clone());

    let progressive_concurrency = cli
        .progressive_concurrency
        .or_else(|| stackfile.and_then(|s| s.progressive_concurrency))
        .unwrap_or(builtin.progressive_concurrency);

    let allow_missing_deps = cli
        .allow_missing_deps
        .or_else(|| stackfile.and_then(|s| s.allow_missing_deps))
        .unwrap_or(builtin.allow_missing_deps);

    let allow_drift = cli
        .allow_drift
        .or_else(|| stackfile.and_then(|s| s.allow_drift))
        .unwrap_or(builtin.allow_drift);

    RunOptions {
        concurrency,
        per_cluster_concurrency,
        progressive_concurrency,
        allow_missing_deps,
        dry_run: cli.dry_run,
        allow_drift,
        rerun_failed: cli.rerun_failed || builtin.rerun_failed,
        takeover: cli.takeover,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_stackfile_overrides_builtin() {
        let builtin = BuiltinDefaults::default();
        let stackfile = StackfileSettings {
            concurrency: Some(8),
            ..Default::default()
        };
        let mut cli = CliOverrides::default();

        // Neither CLI nor stack-file opinion: builtin wins.
        let resolved = resolve(&builtin, None, &cli);
        assert_eq!(resolved.concurrency, builtin.concurrency);

        // Stack-file opinion, no CLI: stack-file wins.
        let resolved = resolve(&builtin, Some(&stackfile), &cli);
        assert_eq!(resolved.concurrency, 8);

        // Both opinions: CLI wins.
        cli.concurrency = Some(16);
        let resolved = resolve(&builtin, Some(&stackfile), &cli);
        assert_eq!(resolved.concurrency, 16);
    }

    #[test]
    fn profile_precedence_matches_the_documented_rule() {
        let stackfile = StackfileSettings {
            default_profile: Some("staging".into()),
            ..Default::default()
        };
        let mut cli = CliOverrides::default();

        assert_eq!(resolve_profile(None, &cli), "default");
        assert_eq!(resolve_profile(Some(&stackfile), &cli), "staging");

        cli.profile = Some("prod".into());
        assert_eq!(resolve_profile(Some(&stackfile), &cli), "prod");
    }

    #[test]
    fn per_cluster_concurrency_merges_with_cli_taking_precedence_per_key() {
        let builtin = BuiltinDefaults::default();
        let mut stackfile = StackfileSettings::default();
        stackfile.per_cluster_concurrency.insert("c1".into(), 2);
        stackfile.per_cluster_concurrency.insert("c2".into(), 3);

        let mut cli = CliOverrides::default();
        cli.per_cluster_concurrency.insert("c1".into(), 5);

        let resolved = resolve(&builtin, Some(&stackfile), &cli);
        assert_eq!(resolved.per_cluster_concurrency.get("c1"), Some(&5));
        assert_eq!(resolved.per_cluster_concurrency.get("c2"), Some(&3));
    }

    #[test]
    fn explicit_false_from_cli_is_not_lost_to_a_stackfile_true() {
        // This is the failure mode sentinel-comparison merges fall into:
        // an explicit `false` must win over a stack-file `true`, which a
        // check like `if other != default` cannot distinguish from "unset".
        let builtin = BuiltinDefaults::default();
        let stackfile = StackfileSettings {
            allow_drift: Some(true),
            ..Default::default()
        };
        let cli = CliOverrides {
            allow_drift: Some(false),
            ..Default::default()
        };

        let resolved = resolve(&builtin, Some(&stackfile), &cli);
        assert!(!resolved.allow_drift);
    }
}
