//! Default, binary-only collaborators for the `stackctl` CLI.
//!
//! `stackctl-collab` deliberately ships no `TemplateEngine`/`ClusterDriver`
//! implementation — chart rendering and cluster transport are out of scope
//! for the orchestration core. But a CLI binary still has to do *something*
//! when a user runs `stackctl apply`, so this module shells out to the real
//! `helm` and `kubectl` binaries, the same way `stackctl-collab::ShellGit`
//! shells out to `git` rather than reimplementing it. Anyone embedding the
//! core directly is free to supply a different `TemplateEngine`/
//! `ClusterDriver` instead of these.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use stackctl_collab::traits::{
    ClusterDriver, InstallOrUpgradeOptions, InstallOrUpgradeResult, RenderedManifest,
    ResourceSnapshot, TemplateEngine,
};
use stackctl_types::ClusterKey;

/// Renders a chart by shelling out to `helm template`.
#[derive(Debug, Clone, Default)]
pub struct ShellHelm;

impl TemplateEngine for ShellHelm {
    fn render(
        &self,
        chart: &str,
        values: &[PathBuf],
        set: &BTreeMap<String, String>,
        release_name: &str,
        namespace: &str,
    ) -> Result<RenderedManifest> {
        let mut cmd = Command::new("helm");
        cmd.arg("template").arg(release_name).arg(chart).arg("--namespace").arg(namespace);
        for values_file in values {
            cmd.arg("-f").arg(values_file);
        }
        for (k, v) in set {
            cmd.arg("--set").arg(format!("{k}={v}"));
        }

        let output = cmd.output()?;
        if !output.status.success() {
            bail!("helm template {release_name} failed: {}", String::from_utf8_lossy(&output.stderr));
        }

        // `helm template` interleaves hooks into the same YAML stream with no
        // separate channel to split them out of; this adapter reports none.
        Ok(RenderedManifest {
            manifest: String::from_utf8_lossy(&output.stdout).into_owned(),
            hooks: Vec::new(),
        })
    }
}

fn kubectl(cluster_key: &ClusterKey) -> Command {
    let mut cmd = Command::new("kubectl");
    cmd.arg("--kubeconfig").arg(&cluster_key.kubeconfig_path);
    if !cluster_key.kube_context.is_empty() {
        cmd.arg("--context").arg(&cluster_key.kube_context);
    }
    cmd
}

const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Applies/deletes/reads manifests and polls readiness by shelling out to
/// `kubectl`.
#[derive(Debug, Clone, Default)]
pub struct ShellKubectl;

impl ClusterDriver for ShellKubectl {
    fn install_or_upgrade(
        &self,
        cluster_key: &ClusterKey,
        opts: &InstallOrUpgradeOptions,
    ) -> Result<InstallOrUpgradeResult> {
        let manifest_file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
        std::fs::write(manifest_file.path(), &opts.manifest)?;

        let mut cmd = kubectl(cluster_key);
        cmd.arg("apply").arg("-n").arg(&opts.namespace).arg("-f").arg(manifest_file.path());
        if opts.create_namespace {
            let ns_cmd_status = kubectl(cluster_key)
                .arg("create")
                .arg("namespace")
                .arg(&opts.namespace)
                .arg("--dry-run=client")
                .arg("-o")
                .arg("yaml")
                .output()?;
            if ns_cmd_status.status.success() {
                let mut apply_ns = kubectl(cluster_key).arg("apply").arg("-f").arg("-").stdin(std::process::Stdio::piped()).spawn()?;
                use std::io::Write;
                if let Some(stdin) = apply_ns.stdin.as_mut() {
                    stdin.write_all(&ns_cmd_status.stdout)?;
                }
                apply_ns.wait()?;
            }
        }
        if opts.wait {
            cmd.arg("--wait").arg("--timeout").arg(format!("{}s", opts.timeout.as_secs().max(1)));
        }

        let output = cmd.output()?;
        if !output.status.success() {
            bail!("kubectl apply -n {} failed: {}", opts.namespace, String::from_utf8_lossy(&output.stderr));
        }

        Ok(InstallOrUpgradeResult {
            release: opts.release_name.clone(),
            manifest: opts.manifest.clone(),
        })
    }

    fn uninstall(&self, cluster_key: &ClusterKey, namespace: &str, release: &str) -> Result<()> {
        let output = kubectl(cluster_key)
            .arg("delete")
            .arg("-n")
            .arg(namespace)
            .arg("-l")
            .arg(format!("{INSTANCE_LABEL}={release}"))
            .arg("--ignore-not-found")
            .output()?;
        if !output.status.success() {
            bail!("kubectl delete -n {namespace} -l {INSTANCE_LABEL}={release} failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        Ok(())
    }

    fn get(&self, cluster_key: &ClusterKey, namespace: &str, release: &str) -> Result<Option<String>> {
        let output = kubectl(cluster_key)
            .arg("get")
            .arg("-n")
            .arg(namespace)
            .arg("-l")
            .arg(format!("{INSTANCE_LABEL}={release}"))
            .arg("-o")
            .arg("yaml")
            .output()?;
        if !output.status.success() {
            bail!("kubectl get -n {namespace} -l {INSTANCE_LABEL}={release} failed: {}", String::from_utf8_lossy(&output.stderr));
        }
        let text = String::from_utf8_lossy(&output.stdout).into_owned();
        let parsed: serde_json::Value = serde_yaml::from_str(&text).unwrap_or(serde_json::Value::Null);
        let has_items = parsed.get("items").and_then(|i| i.as_array()).map(|a| !a.is_empty()).unwrap_or(false);
        Ok(if has_items { Some(text) } else { None })
    }

    fn track_resources(
        &self,
        cluster_key: &ClusterKey,
        manifest: &str,
        timeout: Duration,
        on_snapshot: &mut dyn FnMut(&[ResourceSnapshot]),
    ) -> Result<bool> {
        let Some(namespace) = first_namespace(manifest) else {
            return Ok(true);
        };
        let Some(release) = first_instance_label(manifest) else {
            return Ok(true);
        };

        let start = Instant::now();
        loop {
            let output = kubectl(cluster_key)
                .arg("get")
                .arg("pods")
                .arg("-n")
                .arg(&namespace)
                .arg("-l")
                .arg(format!("{INSTANCE_LABEL}={release}"))
                .arg("-o")
                .arg("json")
                .output()?;
            if !output.status.success() {
                bail!("kubectl get pods -n {namespace} failed: {}", String::from_utf8_lossy(&output.stderr));
            }

            let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;
            let items = parsed.get("items").and_then(|v| v.as_array()).cloned().unwrap_or_default();
            let snapshots: Vec<ResourceSnapshot> = items.iter().map(pod_snapshot).collect();
            on_snapshot(&snapshots);

            let all_ready = !snapshots.is_empty() && snapshots.iter().all(|s| s.status == "Ready");
            if all_ready {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_secs(2));
        }
    }
}

fn pod_snapshot(item: &serde_json::Value) -> ResourceSnapshot {
    let name = item.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let phase = item.pointer("/status/phase").and_then(|v| v.as_str()).unwrap_or("Unknown");
    let ready = item
        .pointer("/status/conditions")
        .and_then(|v| v.as_array())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.get("type").and_then(|t| t.as_str()) == Some("Ready") && c.get("status").and_then(|s| s.as_str()) == Some("True"))
        })
        .unwrap_or(false);

    ResourceSnapshot {
        kind: "Pod".to_string(),
        name,
        status: if ready { "Ready".to_string() } else { phase.to_string() },
        reason: String::new(),
        message: String::new(),
    }
}

fn first_namespace(manifest: &str) -> Option<String> {
    for doc in normalize_docs(manifest) {
        if let Some(ns) = doc.pointer("/metadata/namespace").and_then(|v| v.as_str()) {
            return Some(ns.to_string());
        }
    }
    None
}

fn first_instance_label(manifest: &str) -> Option<String> {
    for doc in normalize_docs(manifest) {
        if let Some(label) = doc.pointer(&format!("/metadata/labels/{INSTANCE_LABEL}")).and_then(|v| v.as_str()) {
            return Some(label.to_string());
        }
    }
    None
}

fn normalize_docs(manifest: &str) -> Vec<serde_json::Value> {
    manifest
        .split("\n---")
        .filter(|doc| !doc.trim().is_empty())
        .filter_map(|doc| serde_yaml::from_str(doc).ok())
        .collect()
}
