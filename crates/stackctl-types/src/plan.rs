use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::release::{ReleaseId, ResolvedRelease};

/// Forward and reverse adjacency over `Needs` edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanEdges {
    /// node -> the nodes it needs.
    pub forward: BTreeMap<ReleaseId, BTreeSet<ReleaseId>>,
    /// node -> the nodes that need it.
    pub reverse: BTreeMap<ReleaseId, BTreeSet<ReleaseId>>,
}

impl PlanEdges {
    pub fn insert_edge(&mut self, from: &ReleaseId, to: &ReleaseId) {
        self.forward.entry(from.clone()).or_default().insert(to.clone());
        self.reverse.entry(to.clone()).or_default().insert(from.clone());
    }

    pub fn needs(&self, id: &ReleaseId) -> BTreeSet<ReleaseId> {
        self.forward.get(id).cloned().unwrap_or_default()
    }

    pub fn needed_by(&self, id: &ReleaseId) -> BTreeSet<ReleaseId> {
        self.reverse.get(id).cloned().unwrap_or_default()
    }
}

/// The DAG of selected releases plus a deterministic ordering.
///
/// `nodes` is ordered by `(layer, -criticalPath, id)` once the Planner has
/// run; before that (straight out of the Compiler/Selector) it is ordered by
/// the Universe Loader's discovery order. Invariant: no cycles, and every
/// `Needs` target exists in `by_id` unless the selection was built with
/// `allow_missing_deps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub nodes: Vec<ResolvedRelease>,
    pub by_id: BTreeMap<ReleaseId, ResolvedRelease>,
    pub edges: PlanEdges,
    /// Populated by the Planner; `None` until `stackctl_plan::build_graph` runs.
    pub layers: Option<BTreeMap<ReleaseId, u32>>,
    pub critical_path: Option<BTreeMap<ReleaseId, u32>>,
}

impl Plan {
    pub fn from_nodes(nodes: Vec<ResolvedRelease>) -> Self {
        let mut by_id = BTreeMap::new();
        let mut edges = PlanEdges::default();
        for node in &nodes {
            for need in &node.needs {
                edges.insert_edge(&node.id, need);
            }
            by_id.insert(node.id.clone(), node.clone());
        }
        Self {
            nodes,
            by_id,
            edges,
            layers: None,
            critical_path: None,
        }
    }

    pub fn get(&self, id: &ReleaseId) -> Option<&ResolvedRelease> {
        self.by_id.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ReleaseId> {
        self.nodes.iter().map(|n| &n.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::release::ApplyOptions;

    fn node(id: &str, needs: &[&str]) -> ResolvedRelease {
        let id: ReleaseId = id.parse().unwrap();
        ResolvedRelease {
            id,
            chart: "chart".into(),
            chart_version: None,
            values: vec![],
            set: Default::default(),
            tags: vec![],
            needs: needs.iter().map(|n| n.parse().unwrap()).collect(),
            apply: ApplyOptions::default(),
            selected_by: vec![],
        }
    }

    #[test]
    fn from_nodes_builds_forward_and_reverse_edges() {
        let plan = Plan::from_nodes(vec![
            node("c1/ns/a", &[]),
            node("c1/ns/b", &["c1/ns/a"]),
        ]);
        let a: ReleaseId = "c1/ns/a".parse().unwrap();
        let b: ReleaseId = "c1/ns/b".parse().unwrap();
        assert_eq!(plan.edges.needs(&b), BTreeSet::from([a.clone()]));
        assert_eq!(plan.edges.needed_by(&a), BTreeSet::from([b]));
    }
}
