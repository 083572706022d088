//! Selector: `select(Universe, Plan, SelectorOptions) -> Plan`.

use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;

use stackctl_types::{Plan, Provenance, ReleaseId, SelectionReason, Universe};

#[derive(Debug, Clone, Default)]
pub struct SelectorOptions {
    pub clusters: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub from_paths: BTreeSet<PathBuf>,
    pub releases: BTreeSet<String>,
    pub changed_files: BTreeSet<PathBuf>,
    pub git_range: Option<String>,
    pub include_deps: bool,
    pub include_dependents: bool,
    pub git_include_deps: bool,
    pub git_include_dependents: bool,
    pub allow_missing_deps: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("missing dependencies: {0:?}")]
pub struct SelectError(pub Vec<ReleaseId>);

fn matches_from_path(id: &ReleaseId, provenance: &[Provenance], prefixes: &BTreeSet<PathBuf>) -> bool {
    prefixes.is_empty()
        || provenance
            .iter()
            .filter(|p| &p.release == id)
            .any(|p| prefixes.iter().any(|prefix| p.path.starts_with(prefix)))
}

fn matches_git_range(id: &ReleaseId, provenance: &[Provenance], changed: &BTreeSet<PathBuf>) -> bool {
    changed.is_empty()
        || provenance
            .iter()
            .filter(|p| &p.release == id)
            .any(|p| changed.contains(&p.path))
}

fn base_reasons(node_id: &ReleaseId, node_tags: &[String], universe: &Universe, opts: &SelectorOptions) -> Vec<SelectionReason> {
    let mut reasons = Vec::new();

    let no_matchers = opts.tags.is_empty()
        && opts.from_paths.is_empty()
        && opts.releases.is_empty()
        && opts.git_range.is_none();

    if no_matchers && opts.clusters.is_empty() {
        reasons.push(SelectionReason::AlwaysSelected);
        return reasons;
    }

    for tag in node_tags {
        if opts.tags.contains(tag) {
            reasons.push(SelectionReason::Tag(tag.clone()));
        }
    }
    if matches_from_path(node_id, &universe.provenance, &opts.from_paths) && !opts.from_paths.is_empty() {
        reasons.push(SelectionReason::FromPath(opts.from_paths.iter().next().unwrap().clone()));
    }
    if opts.releases.contains(&node_id.to_string()) || opts.releases.contains(&node_id.name) {
        reasons.push(SelectionReason::ReleaseName(node_id.to_string()));
    }
    if let Some(range) = &opts.git_range {
        if matches_git_range(node_id, &universe.provenance, &opts.changed_files) {
            reasons.push(SelectionReason::GitRange(range.clone()));
        }
    }

    reasons
}

/// Runs the Selector's five-step algorithm (§4.3) over `plan`.
pub fn select(universe: &Universe, plan: &Plan, opts: &SelectorOptions) -> Result<Plan, SelectError> {
    use std::collections::BTreeMap;

    let mut reasons: BTreeMap<ReleaseId, Vec<SelectionReason>> = BTreeMap::new();

    // Step 1+2: base set, filtered by clusters.
    for node in &plan.nodes {
        if !opts.clusters.is_empty() && !opts.clusters.contains(&node.id.cluster) {
            continue;
        }
        let node_reasons = base_reasons(&node.id, &node.tags, universe, opts);
        if !node_reasons.is_empty() {
            reasons.insert(node.id.clone(), node_reasons);
        }
    }

    // Step 3: transitive closure over deps/dependents.
    if opts.include_deps || opts.git_include_deps {
        let mut queue: VecDeque<ReleaseId> = reasons.keys().cloned().collect();
        while let Some(id) = queue.pop_front() {
            for dep in plan.edges.needs(&id) {
                if !reasons.contains_key(&dep) {
                    reasons.insert(dep.clone(), vec![SelectionReason::DepOf(id.clone())]);
                    queue.push_back(dep);
                }
            }
        }
    }
    if opts.include_dependents || opts.git_include_dependents {
        let mut queue: VecDeque<ReleaseId> = reasons.keys().cloned().collect();
        while let Some(id) = queue.pop_front() {
            for dependent in plan.edges.needed_by(&id) {
                if !reasons.contains_key(&dependent) {
                    reasons.insert(dependent.clone(), vec![SelectionReason::DependentOf(id.clone())]);
                    queue.push_back(dependent);
                }
            }
        }
    }

    // Step 4: validate allowMissingDeps.
    if !opts.allow_missing_deps {
        let mut missing = BTreeSet::new();
        for id in reasons.keys() {
            if let Some(node) = plan.get(id) {
                for need in &node.needs {
                    if !reasons.contains_key(need) {
                        missing.insert(need.clone());
                    }
                }
            }
        }
        if !missing.is_empty() {
            return Err(SelectError(missing.into_iter().collect()));
        }
    }

    // Step 5: new Plan preserving original deterministic order.
    let nodes: Vec<_> = plan
        .nodes
        .iter()
        .filter(|n| reasons.contains_key(&n.id))
        .cloned()
        .map(|mut n| {
            n.selected_by = reasons.remove(&n.id).unwrap_or_default();
            n
        })
        .collect();

    Ok(Plan::from_nodes(nodes))
}
