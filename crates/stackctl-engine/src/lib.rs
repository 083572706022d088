//! Scheduler and Node Executor.
//!
//! Everything here operates on a [`stackctl_types::Plan`] that has already
//! been through the Planner (`stackctl-plan::build_graph`) and against a
//! [`stackctl_store::RunStore`] that already has a run row open. Cluster and
//! chart access go through `stackctl-collab`'s traits exclusively.

pub mod executor;
pub mod normalize;
pub mod recorder;
pub mod scheduler;

pub use executor::{ExecError, NodeExecutor, NodeOutcome};
pub use recorder::EventRecorder;
pub use scheduler::{RunOutcome, RunSummary, Scheduler};
