//! Planner: `build_graph(Plan) -> Plan | Error(Cycle)`.
//!
//! Detects cycles (reporting the smallest offending one), computes each
//! node's layer (longest path from a root in the `needs` DAG) and critical
//! path weight (longest remaining path to a leaf), then reorders `Plan.nodes`
//! by `(layer, -criticalPath, id)` — the fixed dispatch order the Scheduler
//! and `graph`/`explain` commands rely on.

use std::collections::{BTreeMap, HashMap, HashSet};

use stackctl_types::{Plan, ReleaseId};

#[derive(Debug, thiserror::Error)]
#[error("dependency cycle detected: {}", cycle.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" -> "))]
pub struct PlannerError {
    pub cycle: Vec<ReleaseId>,
}

/// Finds the lexicographically-smallest cycle reachable via DFS, if any.
///
/// "Smallest" here means: among all cycles discovered, the one whose sorted
/// member list compares least — this keeps the reported cycle deterministic
/// across runs regardless of `HashMap` iteration order.
fn find_cycle(plan: &Plan) -> Option<Vec<ReleaseId>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: HashMap<&ReleaseId, Mark> = HashMap::new();
    let mut found: Vec<Vec<ReleaseId>> = Vec::new();

    fn visit<'a>(
        id: &'a ReleaseId,
        plan: &'a Plan,
        marks: &mut HashMap<&'a ReleaseId, Mark>,
        stack: &mut Vec<&'a ReleaseId>,
        found: &mut Vec<Vec<ReleaseId>>,
    ) {
        if let Some(pos) = stack.iter().position(|s| *s == id) {
            found.push(stack[pos..].iter().map(|x| (*x).clone()).collect());
            return;
        }
        if marks.get(id) == Some(&Mark::Done) {
            return;
        }

        marks.insert(id, Mark::Visiting);
        stack.push(id);
        if let Some(node) = plan.get(id) {
            for need in &node.needs {
                if plan.by_id.contains_key(need) {
                    if let Some(key) = plan.by_id.keys().find(|k| *k == need) {
                        visit(key, plan, marks, stack, found);
                    }
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
    }

    let mut stack = Vec::new();
    for id in plan.by_id.keys() {
        if marks.get(id).is_none() {
            visit(id, plan, &mut marks, &mut stack, &mut found);
        }
    }

    found.into_iter().min_by_key(|c| c.clone())
}

fn compute_layers(plan: &Plan) -> BTreeMap<ReleaseId, u32> {
    let mut layers: BTreeMap<ReleaseId, u32> = BTreeMap::new();
    let mut visiting: HashSet<ReleaseId> = HashSet::new();

    fn layer_of(
        id: &ReleaseId,
        plan: &Plan,
        layers: &mut BTreeMap<ReleaseId, u32>,
        visiting: &mut HashSet<ReleaseId>,
    ) -> u32 {
        if let Some(l) = layers.get(id) {
            return *l;
        }
        visiting.insert(id.clone());
        let needs = plan.edges.needs(id);
        let layer = needs
            .iter()
            .filter(|n| plan.by_id.contains_key(*n))
            .map(|n| layer_of(n, plan, layers, visiting) + 1)
            .max()
            .unwrap_or(0);
        visiting.remove(id);
        layers.insert(id.clone(), layer);
        layer
    }

    for id in plan.by_id.keys() {
        layer_of(id, plan, &mut layers, &mut visiting);
    }
    layers
}

fn compute_critical_path(plan: &Plan) -> BTreeMap<ReleaseId, u32> {
    let mut weights: BTreeMap<ReleaseId, u32> = BTreeMap::new();

    fn weight_of(id: &ReleaseId, plan: &Plan, weights: &mut BTreeMap<ReleaseId, u32>) -> u32 {
        if let Some(w) = weights.get(id) {
            return *w;
        }
        let dependents = plan.edges.needed_by(id);
        let weight = dependents
            .iter()
            .filter(|d| plan.by_id.contains_key(*d))
            .map(|d| weight_of(d, plan, weights) + 1)
            .max()
            .unwrap_or(0);
        weights.insert(id.clone(), weight);
        weight
    }

    for id in plan.by_id.keys() {
        weight_of(id, plan, &mut weights);
    }
    weights
}

/// Validates the DAG (rejecting cycles), then computes and applies the
/// deterministic `(layer, -criticalPath, id)` node ordering.
pub fn build_graph(plan: &Plan) -> Result<Plan, PlannerError> {
    if let Some(cycle) = find_cycle(plan) {
        return Err(PlannerError { cycle });
    }

    let layers = compute_layers(plan);
    let critical_path = compute_critical_path(plan);

    let mut nodes = plan.nodes.clone();
    nodes.sort_by(|a, b| {
        let layer_a = layers.get(&a.id).copied().unwrap_or(0);
        let layer_b = layers.get(&b.id).copied().unwrap_or(0);
        let crit_a = critical_path.get(&a.id).copied().unwrap_or(0);
        let crit_b = critical_path.get(&b.id).copied().unwrap_or(0);
        layer_a
            .cmp(&layer_b)
            .then(crit_b.cmp(&crit_a))
            .then(a.id.cmp(&b.id))
    });

    let mut out = Plan::from_nodes(nodes);
    out.layers = Some(layers);
    out.critical_path = Some(critical_path);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackctl_types::{ApplyOptions, ResolvedRelease};

    fn node(id: &str, needs: &[&str]) -> ResolvedRelease {
        ResolvedRelease {
            id: id.parse().unwrap(),
            chart: "c".into(),
            chart_version: None,
            values: vec![],
            set: Default::default(),
            tags: vec![],
            needs: needs.iter().map(|s| s.parse().unwrap()).collect(),
            apply: ApplyOptions::default(),
            selected_by: vec![],
        }
    }

    #[test]
    fn linear_chain_is_ordered_by_layer() {
        let plan = Plan::from_nodes(vec![
            node("c1/ns/a", &[]),
            node("c1/ns/b", &["c1/ns/a"]),
            node("c1/ns/c", &["c1/ns/b"]),
        ]);
        let built = build_graph(&plan).unwrap();
        let ids: Vec<String> = built.nodes.iter().map(|n| n.id.to_string()).collect();
        assert_eq!(ids, vec!["c1/ns/a", "c1/ns/b", "c1/ns/c"]);
        assert_eq!(built.layers.unwrap()[&"c1/ns/c".parse().unwrap()], 2);
    }

    #[test]
    fn cycle_is_rejected_with_the_offending_path() {
        let plan = Plan::from_nodes(vec![
            node("c1/ns/a", &["c1/ns/b"]),
            node("c1/ns/b", &["c1/ns/a"]),
        ]);
        let err = build_graph(&plan).unwrap_err();
        assert_eq!(err.cycle.len(), 2);
    }

    #[test]
    fn longer_critical_path_is_ordered_before_shorter_at_same_layer() {
        // a -> b -> d (depth 2) and a -> c (depth 1); b and c share layer 1.
        let plan = Plan::from_nodes(vec![
            node("c1/ns/a", &[]),
            node("c1/ns/b", &["c1/ns/a"]),
            node("c1/ns/c", &["c1/ns/a"]),
            node("c1/ns/d", &["c1/ns/b"]),
        ]);
        let built = build_graph(&plan).unwrap();
        let b_pos = built.nodes.iter().position(|n| n.id.to_string() == "c1/ns/b").unwrap();
        let c_pos = built.nodes.iter().position(|n| n.id.to_string() == "c1/ns/c").unwrap();
        assert!(b_pos < c_pos, "b has a longer critical path than c and should sort first");
    }

    #[test]
    fn build_graph_is_idempotent_on_its_own_output() {
        let plan = Plan::from_nodes(vec![node("c1/ns/a", &[]), node("c1/ns/b", &["c1/ns/a"])]);
        let once = build_graph(&plan).unwrap();
        let twice = build_graph(&once).unwrap();
        let ids_once: Vec<_> = once.nodes.iter().map(|n| n.id.clone()).collect();
        let ids_twice: Vec<_> = twice.nodes.iter().map(|n| n.id.clone()).collect();
        assert_eq!(ids_once, ids_twice);
    }
}
