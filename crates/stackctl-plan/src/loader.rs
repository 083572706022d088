//! Universe Loader: `discover(rootDir) -> Universe`.
//!
//! Walks a root directory breadth-first, then lexically within each
//! directory, parsing:
//! - `stack.yaml` at the root: clusters + default profile.
//! - `*.release.yaml` anywhere: a release descriptor.
//! - `_overlay.yaml` in any directory: deep-merged into every release
//!   descriptor found at or below that directory, with ties broken in
//!   favor of the later (deeper, or lexically later) definition.
//! - `profiles/<name>.yaml`: a named profile overlay.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use stackctl_types::{ClusterDescriptor, Provenance, ReleaseDescriptor, Stackfile, Universe, ValueMap};

const STACK_FILE: &str = "stack.yaml";
const RELEASE_SUFFIX: &str = ".release.yaml";
const OVERLAY_FILE: &str = "_overlay.yaml";
const PROFILES_DIR: &str = "profiles";

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("duplicate release id {id}: declared in both {first} and {second}")]
    DuplicateRelease {
        id: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("no stack file found at {0}")]
    MissingStackfile(PathBuf),
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, LoadError> {
    let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| LoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Breadth-first directory walk, lexically ordered within each level — this
/// is the fixed traversal order the spec requires for deterministic overlay
/// application.
fn walk_breadth_first(root: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let mut out = Vec::new();
    let mut queue: VecDeque<PathBuf> = VecDeque::from([root.to_path_buf()]);

    while let Some(dir) = queue.pop_front() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map_err(|source| LoadError::Io {
                path: dir.clone(),
                source,
            })?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();

        for entry in entries {
            if entry.is_dir() {
                queue.push_back(entry.clone());
                out.push(entry);
            } else {
                out.push(entry);
            }
        }
    }

    Ok(out)
}

/// Deep-merges `overlay` into `base`, later (overlay) keys winning.
fn deep_merge(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                deep_merge(base_map.entry(k.clone()).or_insert(serde_json::Value::Null), v);
            }
        }
        (slot, overlay) => {
            *slot = overlay.clone();
        }
    }
}

/// Discovers every stack/release/profile descriptor under `root_dir` and
/// assembles them into an immutable [`Universe`].
pub fn discover(root_dir: &Path) -> Result<Universe, LoadError> {
    let stack_path = root_dir.join(STACK_FILE);
    if !stack_path.exists() {
        return Err(LoadError::MissingStackfile(stack_path));
    }
    let stackfile: Stackfile = read_yaml(&stack_path)?;
    let clusters: BTreeMap<String, ClusterDescriptor> = stackfile
        .clusters
        .iter()
        .cloned()
        .map(|c| (c.name.clone(), c))
        .collect();

    let entries = walk_breadth_first(root_dir)?;

    // Directory -> accumulated overlay JSON, applied to descriptors at or
    // below it. Parent overlays are folded into child overlays as we go so
    // a release only ever merges once per ancestor directory.
    let mut dir_overlays: BTreeMap<PathBuf, serde_json::Value> = BTreeMap::new();
    dir_overlays.insert(root_dir.to_path_buf(), serde_json::Value::Object(Default::default()));

    let mut releases: BTreeMap<String, ReleaseDescriptor> = BTreeMap::new();
    let mut release_paths: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut provenance = Vec::new();
    let mut profiles: BTreeMap<String, ValueMap> = BTreeMap::new();

    for path in &entries {
        if path.is_dir() {
            let parent_overlay = path
                .parent()
                .and_then(|p| dir_overlays.get(p))
                .cloned()
                .unwrap_or(serde_json::Value::Object(Default::default()));
            let overlay_file = path.join(OVERLAY_FILE);
            let mut merged = parent_overlay;
            if overlay_file.is_file() {
                let overlay: serde_json::Value = read_yaml(&overlay_file)?;
                deep_merge(&mut merged, &overlay);
            }
            dir_overlays.insert(path.clone(), merged);
            continue;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        if path.starts_with(root_dir.join(PROFILES_DIR)) && file_name.ends_with(".yaml") {
            let name = file_name.trim_end_matches(".yaml").to_string();
            let values: ValueMap = read_yaml(path)?;
            profiles.insert(name, values);
            continue;
        }

        if file_name.ends_with(RELEASE_SUFFIX) {
            let dir = path.parent().unwrap_or(root_dir).to_path_buf();
            let overlay = dir_overlays.get(&dir).cloned().unwrap_or(serde_json::Value::Object(Default::default()));

            let raw: serde_json::Value = {
                let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_yaml::from_str(&content).map_err(|source| LoadError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            };

            let mut merged = overlay;
            deep_merge(&mut merged, &raw);

            let descriptor: ReleaseDescriptor =
                serde_json::from_value(merged).map_err(|e| LoadError::Parse {
                    path: path.to_path_buf(),
                    source: <serde_yaml::Error as serde::de::Error>::custom(e.to_string()),
                })?;

            let id = format!("{}/{}/{}", descriptor.cluster, descriptor.namespace, descriptor.name);
            if let Some(first) = release_paths.get(&id) {
                return Err(LoadError::DuplicateRelease {
                    id,
                    first: first.clone(),
                    second: path.clone(),
                });
            }
            release_paths.insert(id.clone(), path.clone());
            provenance.push(Provenance {
                path: path.clone(),
                release: format!("{}/{}/{}", descriptor.cluster, descriptor.namespace, descriptor.name)
                    .parse()
                    .expect("id built from the same three fields always parses"),
            });
            releases.insert(id, descriptor);
        }
    }

    Ok(Universe {
        root_dir: root_dir.to_path_buf(),
        stackfile,
        releases,
        clusters,
        profiles,
        provenance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn discovers_a_release_and_records_provenance() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path();
        write(
            &root.join(STACK_FILE),
            "defaultProfile: null\nclusters:\n  - name: c1\n    kubeconfigPath: /kube/c1\n",
        );
        write(
            &root.join("checkout.release.yaml"),
            "name: checkout\nnamespace: ns\ncluster: c1\nchart: oci://charts/checkout\n",
        );

        let universe = discover(root).unwrap();
        assert_eq!(universe.releases.len(), 1);
        assert!(universe.releases.contains_key("c1/ns/checkout"));
        assert_eq!(universe.provenance.len(), 1);
    }

    #[test]
    fn duplicate_release_ids_are_rejected() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path();
        write(&root.join(STACK_FILE), "clusters: []\n");
        write(
            &root.join("a/checkout.release.yaml"),
            "name: checkout\nnamespace: ns\ncluster: c1\nchart: x\n",
        );
        write(
            &root.join("b/checkout.release.yaml"),
            "name: checkout\nnamespace: ns\ncluster: c1\nchart: y\n",
        );

        let err = discover(root).unwrap_err();
        assert!(matches!(err, LoadError::DuplicateRelease { .. }));
    }

    #[test]
    fn directory_overlay_is_merged_into_descriptors_beneath_it() {
        let td = tempfile::tempdir().unwrap();
        let root = td.path();
        write(&root.join(STACK_FILE), "clusters: []\n");
        write(&root.join("team-a/_overlay.yaml"), "tags: [team-a]\n");
        write(
            &root.join("team-a/checkout.release.yaml"),
            "name: checkout\nnamespace: ns\ncluster: c1\nchart: x\n",
        );

        let universe = discover(root).unwrap();
        let release = &universe.releases["c1/ns/checkout"];
        assert_eq!(release.tags, vec!["team-a".to_string()]);
    }
}
