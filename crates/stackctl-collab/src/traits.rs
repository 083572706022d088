use std::collections::BTreeMap;

use anyhow::Result;
use stackctl_types::ClusterKey;

/// Rendered chart output: the manifest plus any hooks the chart declares.
#[derive(Debug, Clone)]
pub struct RenderedManifest {
    pub manifest: String,
    pub hooks: Vec<String>,
}

/// Renders a chart into a manifest. Delegated entirely to the collaborator;
/// the core never parses a chart template itself.
pub trait TemplateEngine: Send + Sync {
    fn render(
        &self,
        chart: &str,
        values: &[std::path::PathBuf],
        set: &BTreeMap<String, String>,
        release_name: &str,
        namespace: &str,
    ) -> Result<RenderedManifest>;
}

#[derive(Debug, Clone)]
pub struct InstallOrUpgradeOptions {
    pub release_name: String,
    pub namespace: String,
    pub manifest: String,
    pub atomic: bool,
    pub create_namespace: bool,
    pub wait: bool,
    pub timeout: std::time::Duration,
}

#[derive(Debug, Clone)]
pub struct InstallOrUpgradeResult {
    pub release: String,
    pub manifest: String,
}

#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub kind: String,
    pub name: String,
    pub status: String,
    pub reason: String,
    pub message: String,
}

/// Cluster API transport, authentication, and resource tracking. The core
/// talks to a cluster only through this trait; it never reaches into a
/// Kubernetes client library directly.
pub trait ClusterDriver: Send + Sync {
    fn install_or_upgrade(
        &self,
        cluster_key: &ClusterKey,
        opts: &InstallOrUpgradeOptions,
    ) -> Result<InstallOrUpgradeResult>;

    fn uninstall(&self, cluster_key: &ClusterKey, namespace: &str, release: &str) -> Result<()>;

    fn get(&self, cluster_key: &ClusterKey, namespace: &str, release: &str) -> Result<Option<String>>;

    /// Polls readiness, invoking `on_snapshot` with periodic rows until the
    /// release is ready or `timeout` elapses.
    fn track_resources(
        &self,
        cluster_key: &ClusterKey,
        manifest: &str,
        timeout: std::time::Duration,
        on_snapshot: &mut dyn FnMut(&[ResourceSnapshot]),
    ) -> Result<bool>;
}

/// Resolves a git revision range to the set of files it touched.
pub trait GitChangeSource: Send + Sync {
    fn changed_files(&self, root_dir: &std::path::Path, range: &str) -> Result<Vec<std::path::PathBuf>>;
}

/// Resolves `${secret://...}`-style references inside rendered values.
/// Out of scope to implement concretely here; the core depends only on this
/// trait.
pub trait SecretsResolver: Send + Sync {
    fn resolve_values(&self, values: &str) -> Result<String>;
    fn validate_refs(&self, values: &str) -> Result<()>;
}
