//! Continuous ready-set dispatch over a [`Plan`]'s DAG.
//!
//! Unlike a wave-based scheduler that waits for an entire layer to finish
//! before starting the next, nodes here become eligible the instant their
//! own dependencies land — two nodes at the same layer can start seconds
//! apart if one depends on a slow upstream release and the other doesn't.
//! `std::thread::scope` spawns one thread per in-flight node and an `mpsc`
//! channel reports completions back to a single control loop, which is the
//! only place concurrency budgets and the completed/blocked sets are
//! mutated — no locking is needed for scheduling state itself.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use stackctl_store::RunStore;
use stackctl_types::{ClusterKey, NodeStatus, Plan, ReleaseId, RunOptions, TsNanos};

use crate::executor::{ExecError, NodeExecutor, NodeOutcome};
use crate::recorder::EventRecorder;

fn now_ns() -> TsNanos {
    stackctl_types::ts_nanos(chrono::Utc::now())
}

#[derive(Debug, Clone)]
pub enum TerminalStatus {
    Succeeded,
    Skipped(String),
    Blocked(String),
    Failed(String),
}

impl TerminalStatus {
    fn counts_as_reachable(&self) -> bool {
        matches!(self, TerminalStatus::Succeeded | TerminalStatus::Skipped(_))
    }

    fn completion_message(&self) -> &'static str {
        match self {
            TerminalStatus::Succeeded => "succeeded",
            TerminalStatus::Skipped(_) => "skipped",
            TerminalStatus::Blocked(_) => "blocked",
            TerminalStatus::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub nodes: BTreeMap<ReleaseId, TerminalStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Apply,
    Delete,
}

/// How a node already recorded in a prior run should be treated on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumeClass {
    /// Already done; don't touch it.
    Completed,
    /// Needs an attempt this run.
    NeedsRun,
    /// Left failed/orphaned and `--rerun-failed` wasn't given.
    PermanentlyBlocked,
}

fn classify_resume(prior_status: NodeStatus, rerun_failed: bool) -> ResumeClass {
    match prior_status {
        NodeStatus::Succeeded | NodeStatus::Skipped => ResumeClass::Completed,
        NodeStatus::Planned => ResumeClass::NeedsRun,
        // Failed/Blocked outright, or left Queued/Running/Retrying because the
        // previous process crashed mid-flight (an orphaned attempt) - both
        // need `--rerun-failed` before being touched again.
        NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Queued | NodeStatus::Running | NodeStatus::Retrying => {
            if rerun_failed {
                ResumeClass::NeedsRun
            } else {
                ResumeClass::PermanentlyBlocked
            }
        }
    }
}

struct WorkerMessage {
    node_id: ReleaseId,
    cluster_name: String,
    status: TerminalStatus,
}

pub struct Scheduler {
    executor: Arc<NodeExecutor>,
}

impl Scheduler {
    pub fn new(executor: Arc<NodeExecutor>) -> Self {
        Self { executor }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn run_apply(
        &self,
        plan: &Plan,
        clusters: &BTreeMap<String, ClusterKey>,
        run_options: &RunOptions,
        run_id: &str,
        recorder: &EventRecorder,
        store: &dyn RunStore,
        cancel: &Arc<AtomicBool>,
    ) -> RunSummary {
        self.dispatch(plan, clusters, Direction::Apply, run_options, run_id, recorder, store, cancel, BTreeSet::new(), BTreeMap::new())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn run_delete(
        &self,
        plan: &Plan,
        clusters: &BTreeMap<String, ClusterKey>,
        run_options: &RunOptions,
        run_id: &str,
        recorder: &EventRecorder,
        store: &dyn RunStore,
        cancel: &Arc<AtomicBool>,
    ) -> RunSummary {
        self.dispatch(plan, clusters, Direction::Delete, run_options, run_id, recorder, store, cancel, BTreeSet::new(), BTreeMap::new())
    }

    /// Resumes `prior_run_id`: reads its last recorded status for every node,
    /// classifies each per [`classify_resume`], then runs the dispatch loop
    /// over only what's left. `original_command` decides whether the DAG is
    /// walked forward (apply) or in reverse (delete).
    #[allow(clippy::too_many_arguments)]
    pub fn resume(
        &self,
        plan: &Plan,
        clusters: &BTreeMap<String, ClusterKey>,
        original_command: stackctl_types::Command,
        prior_run_id: &str,
        run_options: &RunOptions,
        run_id: &str,
        recorder: &EventRecorder,
        store: &dyn RunStore,
        cancel: &Arc<AtomicBool>,
    ) -> RunSummary {
        let direction = match original_command {
            stackctl_types::Command::Delete => Direction::Delete,
            _ => Direction::Apply,
        };

        let mut pre_completed = BTreeSet::new();
        let mut pre_blocked = BTreeMap::new();
        for id in plan.ids() {
            let prior = store
                .latest_node_state(prior_run_id, id)
                .map(|s| s.status)
                .unwrap_or(NodeStatus::Planned);
            match classify_resume(prior, run_options.rerun_failed) {
                ResumeClass::Completed => {
                    pre_completed.insert(id.clone());
                }
                ResumeClass::NeedsRun => {}
                ResumeClass::PermanentlyBlocked => {
                    pre_blocked.insert(id.clone(), "left unresolved by a prior run; rerun with --rerun-failed".to_string());
                }
            }
        }

        self.dispatch(plan, clusters, direction, run_options, run_id, recorder, store, cancel, pre_completed, pre_blocked)
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        plan: &Plan,
        clusters: &BTreeMap<String, ClusterKey>,
        direction: Direction,
        run_options: &RunOptions,
        run_id: &str,
        recorder: &EventRecorder,
        store: &dyn RunStore,
        cancel: &Arc<AtomicBool>,
        pre_completed: BTreeSet<ReleaseId>,
        pre_blocked: BTreeMap<ReleaseId, String>,
    ) -> RunSummary {
        let mut nodes: BTreeMap<ReleaseId, TerminalStatus> = BTreeMap::new();
        let mut completed: BTreeSet<ReleaseId> = BTreeSet::new();
        let mut blocked: BTreeMap<ReleaseId, String> = BTreeMap::new();

        for id in &pre_completed {
            nodes.insert(id.clone(), TerminalStatus::Succeeded);
            completed.insert(id.clone());
        }
        for (id, reason) in &pre_blocked {
            nodes.insert(id.clone(), TerminalStatus::Blocked(reason.clone()));
            blocked.insert(id.clone(), reason.clone());
        }

        let mut remaining: BTreeSet<ReleaseId> =
            plan.ids().cloned().filter(|id| !completed.contains(id) && !blocked.contains_key(id)).collect();

        let mut cluster_limit: BTreeMap<String, usize> = BTreeMap::new();
        let mut cluster_in_flight: BTreeMap<String, usize> = BTreeMap::new();
        let mut in_flight: BTreeSet<ReleaseId> = BTreeSet::new();

        let (tx, rx) = mpsc::channel::<WorkerMessage>();

        std::thread::scope(|scope| {
            loop {
                if remaining.is_empty() && in_flight.is_empty() {
                    break;
                }

                let canceling = cancel.load(Ordering::Relaxed);
                let mut dispatched_any = false;

                // Only nodes whose dependencies have already landed are
                // actionable; anything still waiting on an in-flight node
                // stays in `remaining` until that node's completion message
                // arrives, canceling or not.
                let ready: Vec<ReleaseId> = remaining
                    .iter()
                    .filter(|id| !in_flight.contains(*id))
                    .filter(|id| self.dependency_ids(plan, direction, id).iter().all(|d| completed.contains(d) || blocked.contains_key(d)))
                    .cloned()
                    .collect();

                for id in ready {
                    let deps = self.dependency_ids(plan, direction, &id);
                    if let Some(bad_dep) = deps.iter().find(|d| blocked.contains_key(*d)) {
                        let reason = format!("dep-failed:{bad_dep}");
                        remaining.remove(&id);
                        let _ = recorder.node_queued(&id, now_ns());
                        let _ = recorder.node_completed(&id, 0, &reason, now_ns());
                        if canceling {
                            nodes.insert(id, TerminalStatus::Skipped(reason));
                        } else {
                            blocked.insert(id.clone(), reason.clone());
                            nodes.insert(id, TerminalStatus::Blocked(reason));
                        }
                        dispatched_any = true;
                        continue;
                    }

                    if canceling {
                        // Ready to run but the run is aborting: it never gets
                        // a worker thread, same as the node that was actually
                        // mid-flight when cancellation was observed.
                        remaining.remove(&id);
                        let _ = recorder.node_queued(&id, now_ns());
                        let _ = recorder.node_completed(&id, 0, "canceled", now_ns());
                        nodes.insert(id, TerminalStatus::Failed("canceled".to_string()));
                        dispatched_any = true;
                        continue;
                    }

                    let node = match plan.get(&id) {
                        Some(n) => n,
                        None => continue,
                    };
                    let cluster_name = node.id.cluster.clone();

                    let Some(cluster_key) = clusters.get(&cluster_name) else {
                        let reason = format!("no cluster descriptor for {cluster_name}");
                        remaining.remove(&id);
                        let _ = recorder.node_queued(&id, now_ns());
                        let _ = recorder.node_completed(&id, 0, "failed", now_ns());
                        blocked.insert(id.clone(), reason.clone());
                        nodes.insert(id, TerminalStatus::Blocked(reason));
                        dispatched_any = true;
                        continue;
                    };

                    let limit = *cluster_limit.entry(cluster_name.clone()).or_insert_with(|| {
                        if run_options.progressive_concurrency {
                            1
                        } else {
                            run_options.per_cluster_concurrency.get(&cluster_name).copied().unwrap_or(run_options.concurrency)
                        }
                    });
                    let cluster_busy = *cluster_in_flight.get(&cluster_name).unwrap_or(&0);
                    if cluster_busy >= limit || in_flight.len() >= run_options.concurrency {
                        continue;
                    }

                    in_flight.insert(id.clone());
                    *cluster_in_flight.entry(cluster_name.clone()).or_insert(0) += 1;
                    remaining.remove(&id);
                    dispatched_any = true;

                    let _ = recorder.node_queued(&id, now_ns());

                    let executor = Arc::clone(&self.executor);
                    let cluster_key = cluster_key.clone();
                    let tx = tx.clone();
                    let cancel = Arc::clone(cancel);
                    let dry_run = run_options.dry_run;
                    let allow_drift = run_options.allow_drift;
                    let node_id = id.clone();
                    let cluster_name_for_msg = cluster_name.clone();

                    scope.spawn(move || {
                        let status = run_with_retries(&executor, plan, &node_id, &cluster_key, direction, run_id, dry_run, allow_drift, recorder, store, &cancel);
                        let _ = tx.send(WorkerMessage {
                            node_id,
                            cluster_name: cluster_name_for_msg,
                            status,
                        });
                    });
                }

                if !dispatched_any {
                    if in_flight.is_empty() {
                        continue;
                    }
                    match rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(msg) => self.absorb(msg, &mut in_flight, &mut cluster_in_flight, &mut cluster_limit, &mut completed, &mut blocked, &mut nodes, run_options),
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                } else {
                    while let Ok(msg) = rx.try_recv() {
                        self.absorb(msg, &mut in_flight, &mut cluster_in_flight, &mut cluster_limit, &mut completed, &mut blocked, &mut nodes, run_options);
                    }
                }
            }
        });

        let any_failed = nodes.values().any(|s| matches!(s, TerminalStatus::Failed(_)));
        let outcome = if any_failed || !blocked.is_empty() {
            RunOutcome::Failed
        } else {
            RunOutcome::Succeeded
        };

        RunSummary { outcome, nodes }
    }

    fn dependency_ids(&self, plan: &Plan, direction: Direction, id: &ReleaseId) -> BTreeSet<ReleaseId> {
        match direction {
            Direction::Apply => plan.edges.needs(id),
            Direction::Delete => plan.edges.needed_by(id),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn absorb(
        &self,
        msg: WorkerMessage,
        in_flight: &mut BTreeSet<ReleaseId>,
        cluster_in_flight: &mut BTreeMap<String, usize>,
        cluster_limit: &mut BTreeMap<String, usize>,
        completed: &mut BTreeSet<ReleaseId>,
        blocked: &mut BTreeMap<ReleaseId, String>,
        nodes: &mut BTreeMap<ReleaseId, TerminalStatus>,
        run_options: &RunOptions,
    ) {
        in_flight.remove(&msg.node_id);
        if let Some(busy) = cluster_in_flight.get_mut(&msg.cluster_name) {
            *busy = busy.saturating_sub(1);
        }

        if run_options.progressive_concurrency {
            let entry = cluster_limit.entry(msg.cluster_name.clone()).or_insert(1);
            if msg.status.counts_as_reachable() {
                *entry = (*entry * 2).min(run_options.per_cluster_concurrency.get(&msg.cluster_name).copied().unwrap_or(run_options.concurrency));
            } else if matches!(msg.status, TerminalStatus::Failed(_)) {
                *entry = 1;
            }
        }

        if msg.status.counts_as_reachable() {
            completed.insert(msg.node_id.clone());
        } else if let TerminalStatus::Blocked(reason) | TerminalStatus::Failed(reason) = &msg.status {
            blocked.insert(msg.node_id.clone(), reason.clone());
        }

        nodes.insert(msg.node_id, msg.status);
    }
}

/// Runs one node to a terminal outcome, retrying per its `ApplyOptions.retry`
/// policy on retryable/ambiguous errors. Permanent errors and exhausted
/// attempts both end the loop immediately.
#[allow(clippy::too_many_arguments)]
fn run_with_retries(
    executor: &NodeExecutor,
    plan: &Plan,
    node_id: &ReleaseId,
    cluster_key: &ClusterKey,
    direction: Direction,
    run_id: &str,
    dry_run: bool,
    allow_drift: bool,
    recorder: &EventRecorder,
    store: &dyn RunStore,
    cancel: &AtomicBool,
) -> TerminalStatus {
    let node = match plan.get(node_id) {
        Some(n) => n,
        None => return TerminalStatus::Failed("node missing from plan".to_string()),
    };
    let retry = &node.apply.retry;
    let max_attempts = retry.max_attempts.max(1);

    let mut attempt = 1u32;
    loop {
        let _ = recorder.node_started(node_id, attempt, now_ns());

        let result = match direction {
            Direction::Apply => executor.apply(node, cluster_key, run_id, attempt, dry_run, allow_drift, recorder, store, cancel),
            Direction::Delete => executor.delete(node, cluster_key, attempt, recorder, cancel),
        };

        let (terminal, pending_cache) = match result {
            Ok(NodeOutcome::Succeeded(pending)) => (Some(TerminalStatus::Succeeded), pending),
            Ok(NodeOutcome::Skipped(reason)) => (Some(TerminalStatus::Skipped(reason)), None),
            Ok(NodeOutcome::Blocked(reason)) => (Some(TerminalStatus::Blocked(reason)), None),
            // The executor observed `cancel` mid-phase: this node surfaces as
            // failed with the reason "canceled", same as a node that never
            // got to run because the whole dispatch loop was canceling.
            Ok(NodeOutcome::Canceled) => (Some(TerminalStatus::Failed("canceled".to_string())), None),
            Err(ref e) => {
                let class = e.error_class();
                let exhausted = attempt >= max_attempts;
                let permanent = class == stackctl_retry::ErrorClass::Permanent;
                if exhausted || permanent {
                    (Some(TerminalStatus::Failed(e.to_string())), None)
                } else {
                    (None, None)
                }
            }
        };

        if let Some(terminal) = terminal {
            let message = match &terminal {
                TerminalStatus::Failed(reason) if reason == "canceled" => reason.as_str(),
                _ => terminal.completion_message(),
            };
            match pending_cache {
                Some(p) => {
                    let _ = recorder.node_completed_with_cache_upsert(node_id, attempt, message, &p.key, &p.entry, now_ns());
                }
                None => {
                    let _ = recorder.node_completed(node_id, attempt, message, now_ns());
                }
            }
            return terminal;
        }

        let err = result.err().expect("retry path only reached on Err");
        let delay_config = stackctl_retry::RetryStrategyConfig {
            strategy: stackctl_retry::RetryStrategyType::Exponential,
            max_attempts,
            base_delay: retry.base_delay,
            max_delay: retry.max_delay,
            jitter: 0.5,
        };
        let delay = stackctl_retry::calculate_delay(&delay_config, attempt);
        let _ = recorder.retry_scheduled(node_id, attempt, delay.as_millis() as u64, &err.to_string(), now_ns());
        std::thread::sleep(delay);
        attempt += 1;
    }
}
