//! Errors the Run Controller can refuse a run over, before or outside of
//! the per-node failures the Scheduler already reports inside a
//! [`stackctl_engine::RunSummary`].
//!
//! Node-level failure kinds (`RenderError`, `ClusterTransient`,
//! `ClusterTerminal`, `WaitTimeout`, `VerifyFailed`, `Canceled`) never reach
//! here — those are recorded as events and folded into the run's terminal
//! status by the Scheduler itself. This enum covers the preconditions that
//! stop a run before it can even start, or the store failing underneath it.

use stackctl_types::ReleaseId;

#[derive(Debug, thiserror::Error)]
pub enum StackError {
    #[error("{0}")]
    ConfigInvalid(String),
    #[error("dependency cycle detected: {0:?}")]
    CycleDetected(Vec<ReleaseId>),
    #[error("missing dependencies: {0:?}")]
    MissingDependency(Vec<ReleaseId>),
    #[error("run store corrupt or unreachable: {0}")]
    StoreCorrupt(String),
    #[error("process lock held by {holder} since {acquired_at_ns}ns; rerun with --takeover")]
    LockHeld { holder: String, acquired_at_ns: i64 },
    #[error("no such run: {0:?}")]
    RunNotFound(String),
    #[error("no cluster {0:?} declared in the stack file")]
    UnknownCluster(String),
}

impl StackError {
    /// Exit code per `spec.md` §6: `2` for "refused due to precondition"
    /// (cycle, missing dep, drift, a held lock), nonzero otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            StackError::CycleDetected(_)
            | StackError::MissingDependency(_)
            | StackError::StoreCorrupt(_)
            | StackError::LockHeld { .. } => 2,
            StackError::ConfigInvalid(_) | StackError::RunNotFound(_) | StackError::UnknownCluster(_) => 1,
        }
    }
}

impl From<stackctl_plan::LoadError> for StackError {
    fn from(e: stackctl_plan::LoadError) -> Self {
        StackError::ConfigInvalid(e.to_string())
    }
}

impl From<stackctl_plan::CompileError> for StackError {
    fn from(e: stackctl_plan::CompileError) -> Self {
        StackError::ConfigInvalid(e.to_string())
    }
}

impl From<stackctl_plan::SelectError> for StackError {
    fn from(e: stackctl_plan::SelectError) -> Self {
        StackError::MissingDependency(e.0)
    }
}

impl From<stackctl_plan::PlannerError> for StackError {
    fn from(e: stackctl_plan::PlannerError) -> Self {
        StackError::CycleDetected(e.cycle)
    }
}

impl From<stackctl_store::StoreError> for StackError {
    fn from(e: stackctl_store::StoreError) -> Self {
        StackError::StoreCorrupt(e.to_string())
    }
}
