use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster_key::ClusterKey;
use crate::release::ReleaseId;
use crate::TsNanos;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Apply,
    Delete,
    Resume,
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Command::Apply => "apply",
            Command::Delete => "delete",
            Command::Resume => "resume",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// One invocation of `apply`/`delete`/`resume`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub command: Command,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
}

/// Per-node status, derived by folding a run's events.
///
/// Never constructed by hand outside `stackctl-store`'s projection function;
/// see `stackctl_store::project::node_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Planned,
    Queued,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Blocked,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Blocked | NodeStatus::Skipped
        )
    }

    pub fn counts_as_success(&self) -> bool {
        matches!(self, NodeStatus::Succeeded | NodeStatus::Skipped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: ReleaseId,
    pub status: NodeStatus,
    pub attempt: u32,
    pub current_phase: Option<String>,
    pub last_error: Option<String>,
    pub started_at: Option<TsNanos>,
    pub ended_at: Option<TsNanos>,
}

impl NodeState {
    pub fn planned(node_id: ReleaseId) -> Self {
        Self {
            node_id,
            status: NodeStatus::Planned,
            attempt: 0,
            current_phase: None,
            last_error: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Key for the apply cache: `(clusterKey, namespace, release, command)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApplyCacheKey {
    pub cluster_key: ClusterKey,
    pub namespace: String,
    pub release: String,
    pub command: Command,
}

/// Value half of the apply cache: what was last applied and whether it
/// still matches live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyCacheEntry {
    pub inputs_digest: String,
    pub live_digest: Option<String>,
    pub has_hooks: bool,
    pub last_ok_run_id: String,
    pub last_ok_at_ns: TsNanos,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VerifyCacheKey {
    pub cluster_key: ClusterKey,
    pub namespace: String,
    pub release: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyCacheEntry {
    pub last_ok_at_ns: TsNanos,
    pub last_event_resource_version: Option<String>,
    pub last_status: String,
    pub last_message: String,
    pub last_evidence: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_status_terminal_classification() {
        assert!(NodeStatus::Succeeded.is_terminal());
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(!NodeStatus::Planned.is_terminal());
    }

    #[test]
    fn run_status_running_is_the_only_non_terminal_state() {
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }
}
