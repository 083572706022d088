//! Pure projection from an event stream to the latest [`NodeState`].

use stackctl_types::{Event, EventKind, NodeState, NodeStatus, ReleaseId};

/// Folds `events` (assumed already filtered to one `node_id` and sorted by
/// `seq`) into the node's current derived state.
pub fn node_state(node_id: &ReleaseId, events: &[Event]) -> NodeState {
    let mut state = NodeState::planned(node_id.clone());

    for event in events {
        state.attempt = event.attempt;
        match event.kind {
            EventKind::NodeQueued => {
                state.status = NodeStatus::Queued;
            }
            EventKind::NodeStarted => {
                state.status = NodeStatus::Running;
                if state.started_at.is_none() {
                    state.started_at = Some(event.ts_ns);
                }
            }
            EventKind::PhaseStarted | EventKind::PhaseCompleted => {
                state.current_phase = Some(event.message.clone());
            }
            EventKind::RetryScheduled => {
                state.status = NodeStatus::Retrying;
            }
            EventKind::NodeCompleted => {
                state.ended_at = Some(event.ts_ns);
                state.status = classify_completion(&event.message);
                if state.status == NodeStatus::Failed {
                    state.last_error = Some(event.message.clone());
                }
            }
            EventKind::CancelRequested => {
                state.last_error = Some("canceled".to_string());
            }
            _ => {}
        }
    }

    state
}

/// `NODE_COMPLETED` carries its outcome in `message` — one of `succeeded`,
/// `failed`, `blocked`, `skipped`, `canceled` (the last folds to `Failed`,
/// matching `spec.md`'s "canceled executors surface as a terminal failed").
fn classify_completion(message: &str) -> NodeStatus {
    match message {
        "succeeded" => NodeStatus::Succeeded,
        "blocked" => NodeStatus::Blocked,
        "skipped" => NodeStatus::Skipped,
        _ => NodeStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evt(kind: EventKind, attempt: u32, message: &str, seq: u64) -> Event {
        Event {
            seq,
            node_id: Some("c1/ns/a".parse().unwrap()),
            kind,
            attempt,
            message: message.to_string(),
            payload: Default::default(),
            ts_ns: seq as i64,
        }
    }

    #[test]
    fn folds_queued_started_completed_into_succeeded() {
        let id: ReleaseId = "c1/ns/a".parse().unwrap();
        let events = vec![
            evt(EventKind::NodeQueued, 1, "", 1),
            evt(EventKind::NodeStarted, 1, "", 2),
            evt(EventKind::NodeCompleted, 1, "succeeded", 3),
        ];
        let state = node_state(&id, &events);
        assert_eq!(state.status, NodeStatus::Succeeded);
        assert_eq!(state.started_at, Some(2));
        assert_eq!(state.ended_at, Some(3));
    }

    #[test]
    fn failed_completion_records_last_error() {
        let id: ReleaseId = "c1/ns/a".parse().unwrap();
        let events = vec![
            evt(EventKind::NodeStarted, 1, "", 1),
            evt(EventKind::NodeCompleted, 1, "wait-timeout", 2),
        ];
        let state = node_state(&id, &events);
        assert_eq!(state.status, NodeStatus::Failed);
        assert_eq!(state.last_error.as_deref(), Some("wait-timeout"));
    }

    #[test]
    fn no_events_yields_planned() {
        let id: ReleaseId = "c1/ns/a".parse().unwrap();
        let state = node_state(&id, &[]);
        assert_eq!(state.status, NodeStatus::Planned);
    }
}
