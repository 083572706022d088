//! End-to-end tests driving the real `stackctl` binary against a small
//! on-disk stack, with fake `helm`/`kubectl` scripts standing in for the
//! real tools (mirroring how a teacher's own CLI tests fake out external
//! binaries on `PATH` rather than mocking within the process).

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use predicates::str::contains;

fn write(path: &Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn write_executable(path: &Path, script: &str) {
    write(path, script);
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

/// Installs fake `helm`/`kubectl` on a scratch `PATH` directory and returns
/// it. `helm template` prints a single ready Deployment manifest; `kubectl`
/// answers `apply`/`get pods`/`get -l`/`delete` well enough for one release
/// to apply cleanly.
fn fake_bin_dir() -> tempfile::TempDir {
    let bin = tempfile::tempdir().unwrap();

    write_executable(
        &bin.path().join("helm"),
        r#"#!/bin/sh
set -e
if [ "$1" = "template" ]; then
  release="$2"
  namespace=""
  prev=""
  for arg in "$@"; do
    if [ "$prev" = "--namespace" ]; then namespace="$arg"; fi
    prev="$arg"
  done
  cat <<YAML
apiVersion: apps/v1
kind: Deployment
metadata:
  name: $release
  namespace: $namespace
  labels:
    app.kubernetes.io/instance: $release
spec:
  replicas: 1
YAML
  exit 0
fi
exit 0
"#,
    );

    write_executable(
        &bin.path().join("kubectl"),
        r#"#!/bin/sh
set -e
case "$*" in
  *"get pods"*)
    cat <<JSON
{"items":[{"metadata":{"name":"pod-1"},"status":{"phase":"Running","conditions":[{"type":"Ready","status":"True"}]}}]}
JSON
    ;;
  *"create namespace"*)
    echo "apiVersion: v1"
    echo "kind: Namespace"
    ;;
  *"get -n"*"-o"*"yaml"*)
    echo "items: []"
    ;;
  *)
    exit 0
    ;;
esac
"#,
    );

    bin
}

fn write_fixture_stack(root: &Path) {
    write(
        &root.join("stack.yaml"),
        "defaultProfile: null\nclusters:\n  - name: c1\n    kubeconfigPath: /tmp/kubeconfig\n",
    );
    write(
        &root.join("checkout.release.yaml"),
        "name: checkout\nnamespace: ns\ncluster: c1\nchart: oci://charts/checkout\n",
    );
}

fn with_fake_path(cmd: &mut Command, bin_dir: &Path) {
    let path = std::env::var_os("PATH").unwrap_or_default();
    let mut paths = vec![bin_dir.to_path_buf()];
    paths.extend(std::env::split_paths(&path));
    cmd.env("PATH", std::env::join_paths(paths).unwrap());
}

#[test]
fn apply_succeeds_against_a_single_node_stack() {
    let root = tempfile::tempdir().unwrap();
    write_fixture_stack(root.path());
    let bin_dir = fake_bin_dir();
    let store = root.path().join(".stackctl/state.db");

    let mut cmd = Command::cargo_bin("stackctl").unwrap();
    with_fake_path(&mut cmd, bin_dir.path());
    cmd.arg("--root")
        .arg(root.path())
        .arg("--store")
        .arg(&store)
        .arg("apply");

    cmd.assert().success().stdout(contains("outcome: Succeeded"));
}

#[test]
fn explain_prints_the_selected_node_without_touching_helm_or_kubectl() {
    let root = tempfile::tempdir().unwrap();
    write_fixture_stack(root.path());

    let mut cmd = Command::cargo_bin("stackctl").unwrap();
    cmd.arg("--root").arg(root.path()).arg("explain");

    cmd.assert().success().stdout(contains("c1/ns/checkout"));
}

#[test]
fn graph_prints_no_edges_for_a_single_independent_node() {
    let root = tempfile::tempdir().unwrap();
    write_fixture_stack(root.path());

    let mut cmd = Command::cargo_bin("stackctl").unwrap();
    cmd.arg("--root").arg(root.path()).arg("graph");

    cmd.assert().success().stdout(contains(""));
}

#[test]
fn runs_lists_the_run_created_by_a_prior_apply() {
    let root = tempfile::tempdir().unwrap();
    write_fixture_stack(root.path());
    let bin_dir = fake_bin_dir();
    let store = root.path().join(".stackctl/state.db");

    let mut apply = Command::cargo_bin("stackctl").unwrap();
    with_fake_path(&mut apply, bin_dir.path());
    apply.arg("--root").arg(root.path()).arg("--store").arg(&store).arg("apply");
    apply.assert().success();

    let mut runs = Command::cargo_bin("stackctl").unwrap();
    runs.arg("--root").arg(root.path()).arg("--store").arg(&store).arg("runs");
    runs.assert().success().stdout(contains("apply"));
}

#[test]
fn missing_stack_file_is_refused_with_a_nonzero_exit_code() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(root.path()).unwrap();

    let mut cmd = Command::cargo_bin("stackctl").unwrap();
    cmd.arg("--root").arg(root.path()).arg("explain");

    cmd.assert().failure();
}

#[test]
fn selecting_a_tag_with_no_matching_release_selects_nothing() {
    let root = tempfile::tempdir().unwrap();
    write_fixture_stack(root.path());

    let mut cmd = Command::cargo_bin("stackctl").unwrap();
    cmd.arg("--root").arg(root.path()).arg("explain").arg("--tag").arg("nonexistent");

    cmd.assert().success().stdout(contains("checkout").not());
}
