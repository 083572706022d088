use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{SelectionReason, SetOverrides};

/// Canonical identity of a release: `cluster/namespace/name`.
///
/// Unique within a [`crate::Universe`]; used as the node key throughout the
/// plan graph, the run store, and cache lookups. Ordered lexically over the
/// triple so `BTreeMap<ReleaseId, _>` iteration is deterministic and matches
/// the `Display` form used in events and CLI output.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReleaseId {
    pub cluster: String,
    pub namespace: String,
    pub name: String,
}

impl ReleaseId {
    pub fn new(cluster: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.namespace, self.name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("release id must have the form cluster/namespace/name, got {0:?}")]
pub struct ParseReleaseIdError(String);

impl FromStr for ReleaseId {
    type Err = ParseReleaseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(cluster), Some(namespace), Some(name)) if !name.is_empty() => {
                Ok(ReleaseId::new(cluster, namespace, name))
            }
            _ => Err(ParseReleaseIdError(s.to_string())),
        }
    }
}

/// Retry policy attached to a release descriptor.
///
/// `max_attempts = 1` (the default) means no retry: one attempt, no
/// `RETRY_SCHEDULED` event on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryPolicy::default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(default = "RetryPolicy::default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl RetryPolicy {
    fn default_max_attempts() -> u32 {
        1
    }
    fn default_base_delay() -> Duration {
        Duration::from_secs(2)
    }
    fn default_max_delay() -> Duration {
        Duration::from_secs(120)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            base_delay: Self::default_base_delay(),
            max_delay: Self::default_max_delay(),
        }
    }
}

/// Apply/delete/verify knobs carried on a release descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ApplyOptions {
    #[serde(default = "ApplyOptions::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "ApplyOptions::default_true")]
    pub wait: bool,
    #[serde(default)]
    pub atomic: bool,
    #[serde(default)]
    pub create_namespace: bool,
    #[serde(default)]
    pub skip_diff: bool,
    #[serde(default = "ApplyOptions::default_true")]
    pub verify: bool,
    #[serde(default)]
    pub verify_warn_only: bool,
    #[serde(default = "ApplyOptions::default_verify_timeout", with = "humantime_serde")]
    pub verify_timeout: Duration,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl ApplyOptions {
    fn default_timeout() -> Duration {
        Duration::from_secs(300)
    }
    fn default_verify_timeout() -> Duration {
        Duration::from_secs(120)
    }
    fn default_true() -> bool {
        true
    }
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            timeout: Self::default_timeout(),
            wait: true,
            atomic: false,
            create_namespace: false,
            skip_diff: false,
            verify: true,
            verify_warn_only: false,
            verify_timeout: Self::default_verify_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Declarative input for one release, as authored on disk.
///
/// `needs` entries are raw strings at this stage: either an explicit
/// `cluster/namespace/name` ID, or a bare name resolved against releases on
/// the same cluster by the Compiler. See `stackctl-plan::compile`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ReleaseDescriptor {
    pub name: String,
    pub namespace: String,
    pub cluster: String,
    pub chart: String,
    #[serde(default)]
    pub chart_version: Option<String>,
    #[serde(default)]
    pub values: Vec<PathBuf>,
    #[serde(default)]
    pub set: SetOverrides,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub apply: ApplyOptions,
    #[serde(default)]
    pub always_selected: bool,
}

/// A release after profile overlay and `needs` resolution.
///
/// This is the node type the Planner and Scheduler operate on. Field values
/// are fully materialized: no further merging happens after this point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedRelease {
    pub id: ReleaseId,
    pub chart: String,
    pub chart_version: Option<String>,
    pub values: Vec<PathBuf>,
    pub set: SetOverrides,
    pub tags: Vec<String>,
    pub needs: Vec<ReleaseId>,
    pub apply: ApplyOptions,
    pub selected_by: Vec<SelectionReason>,
}

impl ResolvedRelease {
    pub fn matches_any_tag(&self, tags: &std::collections::BTreeSet<String>) -> bool {
        self.tags.iter().any(|t| tags.contains(t))
    }
}
