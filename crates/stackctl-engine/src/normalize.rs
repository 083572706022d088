//! Manifest normalization: the same rendered chart, modulo the fields a
//! cluster fills in after the fact, must hash to the same digest. Drops
//! `resourceVersion`/`uid`/`generation`/`creationTimestamp`/`managedFields`/
//! `status`, plus the allocator-assigned `Service` spec fields
//! (`clusterIP(s)`, `.ports[].nodePort`), then orders documents by
//! `(kind, namespace, name)` so the digest doesn't depend on the order a
//! chart happened to emit its resources in.

use sha2::{Digest, Sha256};

fn split_documents(manifest: &str) -> impl Iterator<Item = &str> {
    manifest.split("\n---").map(str::trim)
}

fn strip_service_allocator_fields(obj: &mut serde_json::Map<String, serde_json::Value>) {
    let Some(spec) = obj.get_mut("spec").and_then(|s| s.as_object_mut()) else {
        return;
    };
    spec.remove("clusterIP");
    spec.remove("clusterIPs");
    if let Some(ports) = spec.get_mut("ports").and_then(|p| p.as_array_mut()) {
        for port in ports {
            if let Some(port_obj) = port.as_object_mut() {
                port_obj.remove("nodePort");
            }
        }
    }
}

fn strip_volatile_fields(doc: &mut serde_json::Value) {
    if let Some(obj) = doc.as_object_mut() {
        obj.remove("status");
        if let Some(metadata) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for field in ["resourceVersion", "uid", "generation", "creationTimestamp", "managedFields", "selfLink"] {
                metadata.remove(field);
            }
        }
        if obj.get("kind").and_then(|v| v.as_str()) == Some("Service") {
            strip_service_allocator_fields(obj);
        }
    }
}

fn sort_key(doc: &serde_json::Value) -> (String, String, String) {
    let kind = doc.get("kind").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let namespace = doc.pointer("/metadata/namespace").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let name = doc.pointer("/metadata/name").and_then(|v| v.as_str()).unwrap_or("").to_string();
    (kind, namespace, name)
}

/// Parses `manifest` as a stream of `---`-separated YAML documents, strips
/// volatile fields from each, and returns them sorted deterministically.
/// Documents that fail to parse as YAML (stray comments, empty sections) are
/// dropped rather than treated as an error — a chart's `---` separators are
/// not guaranteed to bound valid documents on every side.
pub fn normalize_documents(manifest: &str) -> Vec<serde_json::Value> {
    let mut docs: Vec<serde_json::Value> = split_documents(manifest)
        .filter(|d| !d.is_empty())
        .filter_map(|d| serde_yaml::from_str::<serde_yaml::Value>(d).ok())
        .filter_map(|v| serde_json::to_value(v).ok())
        .map(|mut v| {
            strip_volatile_fields(&mut v);
            v
        })
        .collect();
    docs.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    docs
}

/// Hex-encoded SHA-256 of the normalized, sorted document set.
pub fn hash_manifest(manifest: &str) -> String {
    let docs = normalize_documents(manifest);
    let canonical = serde_json::to_string(&docs).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// A unified-diff-style rendering of the change from `live` to `desired`,
/// for the `PHASE_COMPLETED` event payload and CLI display. `live` is `None`
/// when the release doesn't exist yet (a fresh install).
pub fn render_diff(live: Option<&str>, desired: &str) -> String {
    let live = live.unwrap_or("");
    similar::TextDiff::from_lines(live, desired)
        .unified_diff()
        .context_radius(3)
        .header("live", "desired")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_volatile_fields_and_status() {
        let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n  namespace: ns\n  resourceVersion: \"123\"\n  uid: abc\nstatus:\n  ready: true\n";
        let docs = normalize_documents(manifest);
        assert_eq!(docs.len(), 1);
        assert!(docs[0].get("status").is_none());
        assert!(docs[0].pointer("/metadata/resourceVersion").is_none());
        assert!(docs[0].pointer("/metadata/uid").is_none());
    }

    #[test]
    fn strips_service_allocator_assigned_fields() {
        let manifest = "kind: Service\nmetadata:\n  name: a\n  namespace: ns\nspec:\n  clusterIP: 10.0.0.5\n  clusterIPs:\n    - 10.0.0.5\n  ports:\n    - port: 80\n      nodePort: 30080\n";
        let docs = normalize_documents(manifest);
        assert!(docs[0].pointer("/spec/clusterIP").is_none());
        assert!(docs[0].pointer("/spec/clusterIPs").is_none());
        assert!(docs[0].pointer("/spec/ports/0/nodePort").is_none());
        assert_eq!(docs[0].pointer("/spec/ports/0/port"), Some(&serde_json::json!(80)));
    }

    #[test]
    fn service_digest_is_stable_across_allocator_assigned_drift() {
        let rendered = "kind: Service\nmetadata:\n  name: a\n  namespace: ns\nspec:\n  ports:\n    - port: 80\n";
        let live = "kind: Service\nmetadata:\n  name: a\n  namespace: ns\nspec:\n  clusterIP: 10.0.0.5\n  ports:\n    - port: 80\n      nodePort: 30080\n";
        assert_eq!(hash_manifest(rendered), hash_manifest(live));
    }

    #[test]
    fn documents_are_sorted_by_kind_namespace_name() {
        let manifest = "kind: Service\nmetadata:\n  name: b\n  namespace: ns\n---\nkind: ConfigMap\nmetadata:\n  name: a\n  namespace: ns\n";
        let docs = normalize_documents(manifest);
        assert_eq!(docs[0].get("kind").unwrap().as_str(), Some("ConfigMap"));
        assert_eq!(docs[1].get("kind").unwrap().as_str(), Some("Service"));
    }

    #[test]
    fn hash_is_stable_regardless_of_document_order() {
        let a = "kind: Service\nmetadata:\n  name: b\n---\nkind: ConfigMap\nmetadata:\n  name: a\n";
        let b = "kind: ConfigMap\nmetadata:\n  name: a\n---\nkind: Service\nmetadata:\n  name: b\n";
        assert_eq!(hash_manifest(a), hash_manifest(b));
    }

    #[test]
    fn hash_changes_when_a_field_other_than_status_changes() {
        let a = "kind: ConfigMap\nmetadata:\n  name: a\ndata:\n  k: v1\n";
        let b = "kind: ConfigMap\nmetadata:\n  name: a\ndata:\n  k: v2\n";
        assert_ne!(hash_manifest(a), hash_manifest(b));
    }

    proptest::proptest! {
        /// Shuffling a fixed set of distinctly-named ConfigMaps across
        /// `---` documents must never change the digest: the cache key a
        /// node's apply-cache lookup hinges on has to be order-independent
        /// no matter how many resources a chart happens to emit.
        #[test]
        fn hash_manifest_is_independent_of_document_order(shuffle_keys in proptest::collection::vec(0u8..255, 5)) {
            let doc_for = |i: usize| format!("kind: ConfigMap\nmetadata:\n  name: cm-{i}\n  namespace: ns\n");
            let forward = (0..5).map(doc_for).collect::<Vec<_>>().join("\n---\n");

            let mut shuffled: Vec<(u8, usize)> = shuffle_keys.into_iter().zip(0..5).collect();
            shuffled.sort_by_key(|&(key, _)| key);
            let reordered = shuffled.into_iter().map(|(_, i)| doc_for(i)).collect::<Vec<_>>().join("\n---\n");

            prop_assert_eq!(hash_manifest(&forward), hash_manifest(&reordered));
        }
    }
}
