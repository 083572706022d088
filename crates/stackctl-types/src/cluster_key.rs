use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity for a cluster connection, used as a cache and budget key.
///
/// `(clusterName, kubeconfigPath, kubeContext)` — two descriptors that point
/// at the same cluster through different kubeconfig files are intentionally
/// treated as different cache domains, since the core has no way to know
/// they're the same cluster without asking the `ClusterDriver`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterKey {
    pub cluster_name: String,
    pub kubeconfig_path: String,
    pub kube_context: String,
}

impl ClusterKey {
    pub fn new(
        cluster_name: impl Into<String>,
        kubeconfig_path: impl Into<String>,
        kube_context: impl Into<String>,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            kubeconfig_path: kubeconfig_path.into(),
            kube_context: kube_context.into(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}#{}",
            self.cluster_name, self.kubeconfig_path, self.kube_context
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_form_is_name_at_kubeconfig_hash_context() {
        let key = ClusterKey::new("prod", "/home/u/.kube/config", "prod-ctx");
        assert_eq!(key.to_string(), "prod@/home/u/.kube/config#prod-ctx");
    }

    #[test]
    fn ordering_is_lexical_over_the_tuple() {
        let a = ClusterKey::new("a", "k", "c");
        let b = ClusterKey::new("b", "k", "c");
        assert!(a < b);
    }
}
