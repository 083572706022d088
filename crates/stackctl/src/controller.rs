//! Run Controller: the thin facade gluing the pipeline stages together.
//!
//! `discover -> compile -> select -> build_graph` produces a [`Plan`];
//! [`Controller::apply`]/[`delete`](Controller::delete) open a run row,
//! acquire the process lock, hand the plan to a
//! [`stackctl_engine::Scheduler`], and close the run out. Nothing here talks
//! to a cluster or a chart renderer directly — those go through the
//! `stackctl-collab` traits passed in at construction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use stackctl_collab::observer::{EventObserver, Reporter, ReporterObserver};
use stackctl_collab::traits::{ClusterDriver, SecretsResolver, TemplateEngine};
use stackctl_engine::{EventRecorder, NodeExecutor, RunOutcome, RunSummary, Scheduler};
use stackctl_plan::{build_graph, compile, discover, select, SelectorOptions};
use stackctl_store::{AcquireOutcome, RunStore, SqliteRunStore};
use stackctl_types::{ClusterKey, Command, Plan, Run, RunOptions, RunStatus};

use crate::error::StackError;

/// Lock is considered stale past this age absent `--takeover`.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(15 * 60);

fn now_ns() -> i64 {
    stackctl_types::ts_nanos(chrono::Utc::now())
}

fn lock_holder_name() -> String {
    format!("{}@{}", std::process::id(), gethostname::gethostname().to_string_lossy())
}

fn cluster_keys(universe: &stackctl_types::Universe) -> BTreeMap<String, ClusterKey> {
    universe
        .clusters
        .iter()
        .map(|(name, c)| (name.clone(), ClusterKey::new(c.name.clone(), c.kubeconfig_path.clone(), c.kube_context.clone())))
        .collect()
}

/// Ties one universe root directory to its collaborators and run store.
pub struct Controller {
    root_dir: PathBuf,
    store: SqliteRunStore,
    executor: Arc<NodeExecutor>,
}

impl Controller {
    pub fn new(
        root_dir: impl Into<PathBuf>,
        store_path: impl AsRef<Path>,
        template_engine: Arc<dyn TemplateEngine>,
        cluster_driver: Arc<dyn ClusterDriver>,
        secrets: Option<Arc<dyn SecretsResolver>>,
    ) -> Result<Self, StackError> {
        let store = SqliteRunStore::open(store_path)?;
        let executor = Arc::new(NodeExecutor::new(template_engine, cluster_driver, secrets));
        Ok(Self {
            root_dir: root_dir.into(),
            store,
            executor,
        })
    }

    fn build_plan(&self, profile: &str, selector: &SelectorOptions) -> Result<(stackctl_types::Universe, Plan), StackError> {
        let universe = discover(&self.root_dir)?;
        let compiled = compile(&universe, profile)?;
        let selected = select(&universe, &compiled, selector)?;
        let planned = build_graph(&selected)?;
        Ok((universe, planned))
    }

    fn acquire_lock(&self, run_id: &str, run_options: &RunOptions) -> Result<(), StackError> {
        let holder = lock_holder_name();
        match self.store.acquire_lock(&holder, now_ns(), LOCK_STALE_AFTER, Some(run_id), run_options.takeover)? {
            AcquireOutcome::Acquired => Ok(()),
            AcquireOutcome::HeldByOther(existing) => Err(StackError::LockHeld {
                holder: existing.holder,
                acquired_at_ns: existing.acquired_at_ns,
            }),
        }
    }

    fn release_lock(&self) {
        let holder = lock_holder_name();
        let _ = self.store.release_lock(&holder);
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        &self,
        command: Command,
        plan: &Plan,
        clusters: &BTreeMap<String, ClusterKey>,
        run_options: &RunOptions,
        reporter: &mut dyn Reporter,
        cancel: &Arc<AtomicBool>,
        dispatch: impl FnOnce(&Scheduler, &Plan, &BTreeMap<String, ClusterKey>, &RunOptions, &str, &EventRecorder, &dyn RunStore, &Arc<AtomicBool>) -> RunSummary,
    ) -> Result<RunSummary, StackError> {
        let run_id = self.store.create_run(command, now_ns())?;
        self.acquire_lock(&run_id, run_options)?;

        let mut observer = ReporterObserver::new(reporter);
        let dyn_observer: &mut dyn EventObserver = &mut observer;
        let recorder = EventRecorder::new(&self.store, run_id.clone(), dyn_observer);
        recorder.run_started(now_ns())?;

        let scheduler = Scheduler::new(Arc::clone(&self.executor));
        let summary = dispatch(&scheduler, plan, clusters, run_options, &run_id, &recorder, &self.store, cancel);

        let run_status = match summary.outcome {
            RunOutcome::Succeeded => RunStatus::Succeeded,
            RunOutcome::Failed => RunStatus::Failed,
        };
        recorder.run_completed(now_ns(), format!("{run_status:?}"))?;
        self.store.end_run(&run_id, run_status, now_ns())?;
        self.release_lock();

        Ok(summary)
    }

    pub fn apply(
        &self,
        profile: &str,
        selector: SelectorOptions,
        run_options: RunOptions,
        reporter: &mut dyn Reporter,
        cancel: &Arc<AtomicBool>,
    ) -> Result<RunSummary, StackError> {
        let (universe, plan) = self.build_plan(profile, &selector)?;
        let clusters = cluster_keys(&universe);
        self.run(Command::Apply, &plan, &clusters, &run_options, reporter, cancel, |s, p, c, o, run_id, r, st, cancel| {
            s.run_apply(p, c, o, run_id, r, st, cancel)
        })
    }

    pub fn delete(
        &self,
        profile: &str,
        selector: SelectorOptions,
        run_options: RunOptions,
        reporter: &mut dyn Reporter,
        cancel: &Arc<AtomicBool>,
    ) -> Result<RunSummary, StackError> {
        let (universe, plan) = self.build_plan(profile, &selector)?;
        let clusters = cluster_keys(&universe);
        self.run(Command::Delete, &plan, &clusters, &run_options, reporter, cancel, |s, p, c, o, run_id, r, st, cancel| {
            s.run_delete(p, c, o, run_id, r, st, cancel)
        })
    }

    pub fn resume(
        &self,
        prior_run_id: &str,
        profile: &str,
        selector: SelectorOptions,
        run_options: RunOptions,
        reporter: &mut dyn Reporter,
        cancel: &Arc<AtomicBool>,
    ) -> Result<RunSummary, StackError> {
        let prior = self
            .list_runs(usize::MAX)?
            .into_iter()
            .find(|r| r.run_id == prior_run_id)
            .ok_or_else(|| StackError::RunNotFound(prior_run_id.to_string()))?;

        let (universe, plan) = self.build_plan(profile, &selector)?;
        let clusters = cluster_keys(&universe);
        let prior_run_id = prior_run_id.to_string();
        self.run(Command::Resume, &plan, &clusters, &run_options, reporter, cancel, move |s, p, c, o, run_id, r, st, cancel| {
            s.resume(p, c, prior.command, &prior_run_id, o, run_id, r, st, cancel)
        })
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<Run>, StackError> {
        Ok(self.store.list_runs(limit)?)
    }

    pub fn status(&self, run_id: &str, plan: &Plan) -> Result<BTreeMap<String, stackctl_types::NodeState>, StackError> {
        let mut out = BTreeMap::new();
        for id in plan.ids() {
            let state = self.store.latest_node_state(run_id, id)?;
            out.insert(id.to_string(), state);
        }
        Ok(out)
    }

    /// Streams events for `run_id` from `from_seq` onward, calling `on_event`
    /// for each batch until the run reaches a terminal status or `cancel` is
    /// set.
    pub fn follow(
        &self,
        run_id: &str,
        from_seq: u64,
        cancel: &AtomicBool,
        mut on_event: impl FnMut(&stackctl_types::Event),
    ) -> Result<(), StackError> {
        let mut follower = stackctl_store::EventFollower::new(&self.store, run_id, from_seq);
        loop {
            let batch = follower.next_batch(cancel)?;
            if batch.is_empty() {
                return Ok(());
            }
            for event in &batch {
                on_event(event);
            }
        }
    }
}
