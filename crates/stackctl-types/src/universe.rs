use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::release::ReleaseDescriptor;
use crate::{Provenance, ValueMap};

/// Declares a cluster a release may target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ClusterDescriptor {
    pub name: String,
    pub kubeconfig_path: String,
    #[serde(default)]
    pub kube_context: String,
}

/// The single top-level stack file: default profile, CLI defaults, clusters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Stackfile {
    #[serde(default)]
    pub default_profile: Option<String>,
    #[serde(default)]
    pub clusters: Vec<ClusterDescriptor>,
}

/// Everything the Universe Loader discovered under a root directory.
///
/// Immutable once built. Identity of a release is `cluster/namespace/name`
/// (its [`crate::ReleaseId`]) and must be unique; the loader rejects
/// duplicates before this type is ever constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Universe {
    pub root_dir: PathBuf,
    pub stackfile: Stackfile,
    pub releases: BTreeMap<String, ReleaseDescriptor>,
    pub clusters: BTreeMap<String, ClusterDescriptor>,
    /// Profile name -> dotted-path overlay values.
    pub profiles: BTreeMap<String, ValueMap>,
    pub provenance: Vec<Provenance>,
}

impl Universe {
    pub fn cluster(&self, name: &str) -> Option<&ClusterDescriptor> {
        self.clusters.get(name)
    }

    pub fn provenance_for(&self, release_key: &str) -> Vec<&Provenance> {
        self.provenance
            .iter()
            .filter(|p| p.release.to_string() == release_key || p.release.name == release_key)
            .collect()
    }
}
