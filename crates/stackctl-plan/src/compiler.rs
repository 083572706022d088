//! Compiler: `compile(Universe, profile) -> Plan`.

use std::collections::BTreeMap;

use stackctl_types::{
    ApplyOptions, Plan, ReleaseId, ResolvedRelease, SelectionReason, SetOverrides, Universe,
    ValueMap,
};

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("set override key {0:?} is not a well-formed dotted path")]
    InvalidSetKey(String),
    #[error("release {release:?} needs {raw:?}, which does not resolve to exactly one release on cluster {cluster:?} (candidates: {candidates:?})")]
    AmbiguousOrMissingNeed {
        release: String,
        raw: String,
        cluster: String,
        candidates: Vec<String>,
    },
}

fn is_dotted_path(key: &str) -> bool {
    !key.is_empty()
        && key
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-'))
}

/// Applies a profile overlay's `set` entries on top of a release's own,
/// later (profile) keys winning, merged by sorted key for determinism.
fn overlay_set(base: &SetOverrides, profile: &ValueMap) -> SetOverrides {
    let mut merged = base.clone();
    for (k, v) in profile {
        if let Some(s) = v.as_str() {
            merged.insert(k.clone(), s.to_string());
        }
    }
    merged
}

/// Resolves one `needs` entry. A string containing `/` is an exact ID
/// reference; otherwise it's a bare name looked up among releases on the
/// same cluster, with ambiguity rejected.
fn resolve_need(
    release_key: &str,
    cluster: &str,
    raw: &str,
    universe: &Universe,
) -> Result<ReleaseId, CompileError> {
    if raw.contains('/') {
        return raw.parse().map_err(|_| CompileError::AmbiguousOrMissingNeed {
            release: release_key.to_string(),
            raw: raw.to_string(),
            cluster: cluster.to_string(),
            candidates: vec![],
        });
    }

    let candidates: Vec<&String> = universe
        .releases
        .iter()
        .filter(|(_, d)| d.cluster == cluster && d.name == raw)
        .map(|(id, _)| id)
        .collect();

    match candidates.as_slice() {
        [one] => Ok(one.parse().expect("id built from universe keys always parses")),
        other => Err(CompileError::AmbiguousOrMissingNeed {
            release: release_key.to_string(),
            raw: raw.to_string(),
            cluster: cluster.to_string(),
            candidates: other.iter().map(|s| s.to_string()).collect(),
        }),
    }
}

/// Compiles a [`Universe`] plus a chosen profile into a [`Plan`] containing
/// every release, fully materialized. Selection (§4.3) runs afterward.
pub fn compile(universe: &Universe, profile: &str) -> Result<Plan, CompileError> {
    let overlay = universe.profiles.get(profile).cloned().unwrap_or_default();

    let mut nodes = Vec::new();
    for (id_str, descriptor) in &universe.releases {
        for key in descriptor.set.keys() {
            if !is_dotted_path(key) {
                return Err(CompileError::InvalidSetKey(key.clone()));
            }
        }

        let mut needs = Vec::new();
        for raw in &descriptor.needs {
            needs.push(resolve_need(id_str, &descriptor.cluster, raw, universe)?);
        }

        let id: ReleaseId = id_str.parse().expect("id built from universe keys always parses");
        let mut selected_by = Vec::new();
        if descriptor.always_selected {
            selected_by.push(SelectionReason::AlwaysSelected);
        }

        nodes.push(ResolvedRelease {
            id,
            chart: descriptor.chart.clone(),
            chart_version: descriptor.chart_version.clone(),
            values: descriptor.values.clone(),
            set: overlay_set(&descriptor.set, &overlay),
            tags: descriptor.tags.clone(),
            needs,
            apply: descriptor.apply.clone(),
            selected_by,
        });
    }

    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(Plan::from_nodes(nodes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackctl_types::{ClusterDescriptor, ReleaseDescriptor, Stackfile};

    fn universe_with(releases: Vec<ReleaseDescriptor>) -> Universe {
        let mut map = BTreeMap::new();
        for r in releases {
            map.insert(format!("{}/{}/{}", r.cluster, r.namespace, r.name), r);
        }
        Universe {
            root_dir: "/tmp".into(),
            stackfile: Stackfile {
                default_profile: None,
                clusters: vec![ClusterDescriptor {
                    name: "c1".into(),
                    kubeconfig_path: "/kube".into(),
                    kube_context: String::new(),
                }],
            },
            releases: map,
            clusters: BTreeMap::new(),
            profiles: BTreeMap::new(),
            provenance: vec![],
        }
    }

    fn descriptor(name: &str, needs: &[&str]) -> ReleaseDescriptor {
        ReleaseDescriptor {
            name: name.to_string(),
            namespace: "ns".into(),
            cluster: "c1".into(),
            chart: "chart".into(),
            chart_version: None,
            values: vec![],
            set: Default::default(),
            tags: vec![],
            needs: needs.iter().map(|s| s.to_string()).collect(),
            apply: ApplyOptions::default(),
            always_selected: false,
        }
    }

    #[test]
    fn resolves_bare_name_needs_within_the_same_cluster() {
        let universe = universe_with(vec![descriptor("a", &[]), descriptor("b", &["a"])]);
        let plan = compile(&universe, "default").unwrap();
        let b = plan.get(&"c1/ns/b".parse().unwrap()).unwrap();
        assert_eq!(b.needs, vec!["c1/ns/a".parse().unwrap()]);
    }

    #[test]
    fn rejects_invalid_set_keys() {
        let mut d = descriptor("a", &[]);
        d.set.insert("bad key!".into(), "x".into());
        let universe = universe_with(vec![d]);
        assert!(matches!(compile(&universe, "default"), Err(CompileError::InvalidSetKey(_))));
    }

    #[test]
    fn profile_overlay_overrides_release_set_values() {
        let mut d = descriptor("a", &[]);
        d.set.insert("replicas".into(), "1".into());
        let mut universe = universe_with(vec![d]);
        universe
            .profiles
            .insert("prod".into(), ValueMap::from([("replicas".into(), "5".into())]));

        let plan = compile(&universe, "prod").unwrap();
        let a = plan.get(&"c1/ns/a".parse().unwrap()).unwrap();
        assert_eq!(a.set.get("replicas"), Some(&"5".to_string()));
    }
}
