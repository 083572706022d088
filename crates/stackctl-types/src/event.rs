use serde::{Deserialize, Serialize};

use crate::release::ReleaseId;
use crate::{TsNanos, ValueMap};

/// The fixed vocabulary of event kinds a run ever emits.
///
/// `Display`/`FromStr` round-trip through the upper-snake-case form used in
/// the `events.kind` store column and in CLI output, matching the names
/// fixed by the append-only log's wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    RunStarted,
    RunCompleted,
    NodeQueued,
    NodeStarted,
    PhaseStarted,
    PhaseCompleted,
    NodeLog,
    HelmLog,
    NodeCompleted,
    RetryScheduled,
    CancelRequested,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RunStarted => "RUN_STARTED",
            EventKind::RunCompleted => "RUN_COMPLETED",
            EventKind::NodeQueued => "NODE_QUEUED",
            EventKind::NodeStarted => "NODE_STARTED",
            EventKind::PhaseStarted => "PHASE_STARTED",
            EventKind::PhaseCompleted => "PHASE_COMPLETED",
            EventKind::NodeLog => "NODE_LOG",
            EventKind::HelmLog => "HELM_LOG",
            EventKind::NodeCompleted => "NODE_COMPLETED",
            EventKind::RetryScheduled => "RETRY_SCHEDULED",
            EventKind::CancelRequested => "CANCEL_REQUESTED",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown event kind {0:?}")]
pub struct ParseEventKindError(String);

impl std::str::FromStr for EventKind {
    type Err = ParseEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "RUN_STARTED" => EventKind::RunStarted,
            "RUN_COMPLETED" => EventKind::RunCompleted,
            "NODE_QUEUED" => EventKind::NodeQueued,
            "NODE_STARTED" => EventKind::NodeStarted,
            "PHASE_STARTED" => EventKind::PhaseStarted,
            "PHASE_COMPLETED" => EventKind::PhaseCompleted,
            "NODE_LOG" => EventKind::NodeLog,
            "HELM_LOG" => EventKind::HelmLog,
            "NODE_COMPLETED" => EventKind::NodeCompleted,
            "RETRY_SCHEDULED" => EventKind::RetryScheduled,
            "CANCEL_REQUESTED" => EventKind::CancelRequested,
            other => return Err(ParseEventKindError(other.to_string())),
        })
    }
}

/// One row of a run's append-only log.
///
/// `seq` is assigned by the store, strictly increasing per run — nothing
/// upstream of the store ever sets it, which is what makes the monotonic
/// sequence invariant enforceable in one place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    /// Empty for run-level events (`RUN_STARTED`, `RUN_COMPLETED`).
    pub node_id: Option<ReleaseId>,
    pub kind: EventKind,
    pub attempt: u32,
    pub message: String,
    pub payload: ValueMap,
    pub ts_ns: TsNanos,
}

impl Event {
    /// Builds an event with `seq` left at 0; the store overwrites it on
    /// append. Never construct an `Event` with a meaningful `seq` outside
    /// the store.
    pub fn new(node_id: Option<ReleaseId>, kind: EventKind, attempt: u32, message: impl Into<String>, ts_ns: TsNanos) -> Self {
        Self {
            seq: 0,
            node_id,
            kind,
            attempt,
            message: message.into(),
            payload: Default::default(),
            ts_ns,
        }
    }

    pub fn with_payload(mut self, payload: ValueMap) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_roundtrips_through_display_and_fromstr() {
        for kind in [
            EventKind::RunStarted,
            EventKind::RunCompleted,
            EventKind::NodeQueued,
            EventKind::NodeStarted,
            EventKind::PhaseStarted,
            EventKind::PhaseCompleted,
            EventKind::NodeLog,
            EventKind::HelmLog,
            EventKind::NodeCompleted,
            EventKind::RetryScheduled,
            EventKind::CancelRequested,
        ] {
            let rendered = kind.to_string();
            let parsed: EventKind = rendered.parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
