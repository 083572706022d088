//! Node Executor: drives one release through render -> diff -> apply ->
//! wait -> verify (or, for a delete, destroy -> wait-for-removal), emitting
//! a `PHASE_STARTED`/`PHASE_COMPLETED` pair for every transition.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use stackctl_collab::traits::{ClusterDriver, InstallOrUpgradeOptions, ResourceSnapshot, SecretsResolver, TemplateEngine};
use stackctl_retry::ErrorClass;
use stackctl_store::{RunStore, StoreError};
use stackctl_types::{ApplyCacheEntry, ApplyCacheKey, ClusterKey, Command, ResolvedRelease, TsNanos, ValueMap};

use crate::normalize;
use crate::recorder::EventRecorder;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("render failed: {0}")]
    RenderError(String),
    #[error("cluster error: {0}")]
    ClusterTransient(String),
    #[error("cluster error (terminal): {0}")]
    ClusterTerminal(String),
    #[error("timed out waiting for readiness")]
    WaitTimeout { blockers: Vec<ResourceSnapshot> },
    #[error("verify failed: {0}")]
    VerifyFailed(String),
    #[error("run store error: {0}")]
    StoreCorrupt(#[from] StoreError),
}

impl ExecError {
    /// Maps to `stackctl_retry`'s error classification, so the Scheduler can
    /// decide whether an attempt is worth retrying without re-deriving this
    /// switch itself.
    pub fn error_class(&self) -> ErrorClass {
        match self {
            ExecError::RenderError(_) => ErrorClass::Permanent,
            ExecError::ClusterTransient(_) => ErrorClass::Retryable,
            ExecError::ClusterTerminal(_) => ErrorClass::Permanent,
            ExecError::WaitTimeout { .. } => ErrorClass::Ambiguous,
            ExecError::VerifyFailed(_) => ErrorClass::Ambiguous,
            ExecError::StoreCorrupt(_) => ErrorClass::Permanent,
        }
    }
}

/// An apply-cache write a completed node still owes the store. Carried on
/// [`NodeOutcome::Succeeded`] rather than written inside [`NodeExecutor::apply`]
/// itself, so the caller can upsert it in the same transaction as the
/// `NodeCompleted` event it's about to append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCacheUpsert {
    pub key: ApplyCacheKey,
    pub entry: ApplyCacheEntry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    /// `Some` when a fresh install/upgrade wrote a new apply-cache entry that
    /// still needs committing; `None` for a dry run or a delete, neither of
    /// which touch the cache.
    Succeeded(Option<PendingCacheUpsert>),
    /// The apply cache reported a hit; nothing was sent to the cluster.
    Skipped(String),
    /// Refused without `--allow-drift`; not an error, just not done.
    Blocked(String),
    Canceled,
}

fn now_ns() -> TsNanos {
    stackctl_types::ts_nanos(chrono::Utc::now())
}

fn blockers_payload(blockers: &[ResourceSnapshot]) -> ValueMap {
    let arr: Vec<serde_json::Value> = blockers
        .iter()
        .map(|b| serde_json::json!({"kind": b.kind, "name": b.name, "status": b.status, "reason": b.reason, "message": b.message}))
        .collect();
    let mut m = ValueMap::new();
    m.insert("blockers".to_string(), serde_json::Value::Array(arr));
    m
}

pub struct NodeExecutor {
    template_engine: Arc<dyn TemplateEngine>,
    cluster_driver: Arc<dyn ClusterDriver>,
    secrets: Option<Arc<dyn SecretsResolver>>,
}

impl NodeExecutor {
    pub fn new(
        template_engine: Arc<dyn TemplateEngine>,
        cluster_driver: Arc<dyn ClusterDriver>,
        secrets: Option<Arc<dyn SecretsResolver>>,
    ) -> Self {
        Self {
            template_engine,
            cluster_driver,
            secrets,
        }
    }

    /// Runs one apply attempt for `node`. `dry_run` stops short of mutating
    /// the cluster once the diff is known; `allow_drift` permits overwriting
    /// a release whose live state no longer matches the last recorded apply.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &self,
        node: &ResolvedRelease,
        cluster_key: &ClusterKey,
        run_id: &str,
        attempt: u32,
        dry_run: bool,
        allow_drift: bool,
        recorder: &EventRecorder,
        store: &dyn RunStore,
        cancel: &AtomicBool,
    ) -> Result<NodeOutcome, ExecError> {
        if cancel.load(Ordering::Relaxed) {
            return Ok(NodeOutcome::Canceled);
        }

        recorder.phase_started(&node.id, attempt, "render", now_ns())?;
        let rendered = match self
            .template_engine
            .render(&node.chart, &node.values, &node.set, &node.id.name, &node.id.namespace)
        {
            Ok(r) => r,
            Err(e) => {
                recorder.phase_completed(&node.id, attempt, "render", "failed", &e.to_string(), now_ns(), ValueMap::new())?;
                return Err(ExecError::RenderError(e.to_string()));
            }
        };
        if let Some(secrets) = &self.secrets {
            if let Err(e) = secrets.validate_refs(&rendered.manifest) {
                recorder.phase_completed(&node.id, attempt, "render", "failed", &e.to_string(), now_ns(), ValueMap::new())?;
                return Err(ExecError::RenderError(e.to_string()));
            }
        }
        let inputs_digest = normalize::hash_manifest(&rendered.manifest);
        recorder.phase_completed(&node.id, attempt, "render", "succeeded", "", now_ns(), ValueMap::new())?;

        if cancel.load(Ordering::Relaxed) {
            return Ok(NodeOutcome::Canceled);
        }

        recorder.phase_started(&node.id, attempt, "diff", now_ns())?;
        let live_manifest = self
            .cluster_driver
            .get(cluster_key, &node.id.namespace, &node.id.name)
            .map_err(|e| ExecError::ClusterTransient(e.to_string()))?;
        let diff_text = normalize::render_diff(live_manifest.as_deref(), &rendered.manifest);
        recorder.diff(&node.id, attempt, &diff_text, now_ns())?;
        recorder.phase_completed(&node.id, attempt, "diff", "succeeded", "", now_ns(), ValueMap::new())?;

        let has_hooks = !rendered.hooks.is_empty();
        let cache_key = ApplyCacheKey {
            cluster_key: cluster_key.clone(),
            namespace: node.id.namespace.clone(),
            release: node.id.name.clone(),
            command: Command::Apply,
        };
        let inputs_digest_for_cache = inputs_digest.clone();
        let live_manifest_for_cache = live_manifest.clone();
        let decision = store.check_apply_cache(
            &cache_key,
            Box::new(move || inputs_digest_for_cache),
            Box::new(move || live_manifest_for_cache.as_deref().map(normalize::hash_manifest)),
        )?;

        let cache_hit = decision.skip;
        if cache_hit {
            recorder.phase_completed(&node.id, attempt, "cache", "skipped", &decision.reason, now_ns(), ValueMap::new())?;
        }

        if decision.reason == "live-drifted" && !allow_drift {
            return Ok(NodeOutcome::Blocked(
                "live state has drifted from the last recorded apply; rerun with --allow-drift".to_string(),
            ));
        }

        if !cache_hit && dry_run {
            return Ok(NodeOutcome::Succeeded(None));
        }

        if cancel.load(Ordering::Relaxed) {
            return Ok(NodeOutcome::Canceled);
        }

        // On a cache hit nothing is installed; `wait`/`verify` below track
        // the already-rendered manifest instead of an `install_or_upgrade`
        // result, matching spec.md §8 scenario 4 ("wait runs if Wait=true").
        let tracked_manifest = if cache_hit {
            rendered.manifest.clone()
        } else {
            let verb = if live_manifest.is_some() { "upgrade" } else { "install" };
            recorder.phase_started(&node.id, attempt, verb, now_ns())?;
            let install_result = match self.cluster_driver.install_or_upgrade(
                cluster_key,
                &InstallOrUpgradeOptions {
                    release_name: node.id.name.clone(),
                    namespace: node.id.namespace.clone(),
                    manifest: rendered.manifest.clone(),
                    atomic: node.apply.atomic,
                    create_namespace: node.apply.create_namespace,
                    wait: node.apply.wait,
                    timeout: node.apply.timeout,
                },
            ) {
                Ok(r) => r,
                Err(e) => {
                    recorder.phase_completed(&node.id, attempt, verb, "failed", &e.to_string(), now_ns(), ValueMap::new())?;
                    return Err(ExecError::ClusterTransient(e.to_string()));
                }
            };
            recorder.phase_completed(&node.id, attempt, verb, "succeeded", "", now_ns(), ValueMap::new())?;
            install_result.manifest
        };

        if node.apply.wait {
            if cancel.load(Ordering::Relaxed) {
                return Ok(NodeOutcome::Canceled);
            }
            recorder.phase_started(&node.id, attempt, "wait", now_ns())?;
            let blockers = self.track_until_ready(cluster_key, &tracked_manifest, node.apply.timeout)?;
            if let Some(blockers) = blockers {
                recorder.phase_completed(&node.id, attempt, "wait", "failed", "timed out waiting for readiness", now_ns(), blockers_payload(&blockers))?;
                return Err(ExecError::WaitTimeout { blockers });
            }
            recorder.phase_completed(&node.id, attempt, "wait", "succeeded", "", now_ns(), ValueMap::new())?;
        }

        if node.apply.verify {
            if cancel.load(Ordering::Relaxed) {
                return Ok(NodeOutcome::Canceled);
            }
            recorder.phase_started(&node.id, attempt, "verify", now_ns())?;
            let blockers = self.track_until_ready(cluster_key, &tracked_manifest, node.apply.verify_timeout)?;
            if let Some(blockers) = blockers {
                let message = blockers
                    .first()
                    .map(|b| b.message.clone())
                    .unwrap_or_else(|| "verification failed".to_string());
                let status = if node.apply.verify_warn_only { "blocked" } else { "failed" };
                recorder.phase_completed(&node.id, attempt, "verify", status, &message, now_ns(), blockers_payload(&blockers))?;
                if !node.apply.verify_warn_only {
                    return Err(ExecError::VerifyFailed(message));
                }
            } else {
                recorder.phase_completed(&node.id, attempt, "verify", "succeeded", "", now_ns(), ValueMap::new())?;
            }
        }

        if cache_hit {
            return Ok(NodeOutcome::Skipped(decision.reason));
        }

        Ok(NodeOutcome::Succeeded(Some(PendingCacheUpsert {
            key: cache_key,
            entry: ApplyCacheEntry {
                inputs_digest,
                live_digest: Some(normalize::hash_manifest(&tracked_manifest)),
                has_hooks,
                last_ok_run_id: run_id.to_string(),
                last_ok_at_ns: now_ns(),
            },
        })))
    }

    pub fn delete(
        &self,
        node: &ResolvedRelease,
        cluster_key: &ClusterKey,
        attempt: u32,
        recorder: &EventRecorder,
        cancel: &AtomicBool,
    ) -> Result<NodeOutcome, ExecError> {
        if cancel.load(Ordering::Relaxed) {
            return Ok(NodeOutcome::Canceled);
        }

        recorder.phase_started(&node.id, attempt, "destroy", now_ns())?;
        if let Err(e) = self.cluster_driver.uninstall(cluster_key, &node.id.namespace, &node.id.name) {
            recorder.phase_completed(&node.id, attempt, "destroy", "failed", &e.to_string(), now_ns(), ValueMap::new())?;
            return Err(ExecError::ClusterTransient(e.to_string()));
        }
        recorder.phase_completed(&node.id, attempt, "destroy", "succeeded", "", now_ns(), ValueMap::new())?;

        if cancel.load(Ordering::Relaxed) {
            return Ok(NodeOutcome::Canceled);
        }

        recorder.phase_started(&node.id, attempt, "wait-for-removal", now_ns())?;
        let deadline = Instant::now() + node.apply.timeout;
        loop {
            match self.cluster_driver.get(cluster_key, &node.id.namespace, &node.id.name) {
                Ok(None) => break,
                Ok(Some(_)) if Instant::now() >= deadline => {
                    recorder.phase_completed(&node.id, attempt, "wait-for-removal", "failed", "resource still present after timeout", now_ns(), ValueMap::new())?;
                    return Err(ExecError::WaitTimeout { blockers: Vec::new() });
                }
                Ok(Some(_)) => {
                    thread::sleep(Duration::from_millis(500));
                }
                Err(e) => return Err(ExecError::ClusterTransient(e.to_string())),
            }
        }
        recorder.phase_completed(&node.id, attempt, "wait-for-removal", "succeeded", "", now_ns(), ValueMap::new())?;

        Ok(NodeOutcome::Succeeded(None))
    }

    /// Returns `None` once the driver reports readiness, or `Some(blockers)`
    /// (up to 6, per `spec.md`'s top-blockers table) if `timeout` elapses
    /// first.
    fn track_until_ready(
        &self,
        cluster_key: &ClusterKey,
        manifest: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<ResourceSnapshot>>, ExecError> {
        let mut last_blockers = Vec::new();
        let ready = self
            .cluster_driver
            .track_resources(cluster_key, manifest, timeout, &mut |snapshots| {
                last_blockers = snapshots.iter().filter(|s| s.status != "Ready").take(6).cloned().collect();
            })
            .map_err(|e| ExecError::ClusterTransient(e.to_string()))?;
        Ok(if ready { None } else { Some(last_blockers) })
    }
}
