//! Funnels every event the Scheduler and Node Executor produce through one
//! place: each call both appends to the [`RunStore`] (the durable record)
//! and forwards a human-readable line to an [`EventObserver`] (the CLI's
//! live view). Nothing in this crate calls `RunStore::append_event`
//! directly outside this module, which is what keeps the two views from
//! drifting apart.

use std::sync::Mutex;

use stackctl_collab::observer::EventObserver;
use stackctl_store::{RunStore, StoreError};
use stackctl_types::{ApplyCacheEntry, ApplyCacheKey, Event, EventKind, ReleaseId, TsNanos, ValueMap};

pub struct EventRecorder<'a> {
    store: &'a dyn RunStore,
    run_id: String,
    observer: Mutex<&'a mut dyn EventObserver>,
}

impl<'a> EventRecorder<'a> {
    pub fn new(store: &'a dyn RunStore, run_id: impl Into<String>, observer: &'a mut dyn EventObserver) -> Self {
        Self {
            store,
            run_id: run_id.into(),
            observer: Mutex::new(observer),
        }
    }

    fn append(&self, event: Event) -> Result<u64, StoreError> {
        self.store.append_event(&self.run_id, event)
    }

    pub fn run_started(&self, ts_ns: TsNanos) -> Result<u64, StoreError> {
        self.append(Event::new(None, EventKind::RunStarted, 0, "", ts_ns))
    }

    pub fn run_completed(&self, ts_ns: TsNanos, message: impl Into<String>) -> Result<u64, StoreError> {
        let message = message.into();
        self.observer.lock().unwrap().emit_event("info", &format!("run completed: {message}"));
        self.append(Event::new(None, EventKind::RunCompleted, 0, message, ts_ns))
    }

    pub fn node_queued(&self, node: &ReleaseId, ts_ns: TsNanos) -> Result<u64, StoreError> {
        self.append(Event::new(Some(node.clone()), EventKind::NodeQueued, 0, "", ts_ns))
    }

    pub fn node_started(&self, node: &ReleaseId, attempt: u32, ts_ns: TsNanos) -> Result<u64, StoreError> {
        self.append(Event::new(Some(node.clone()), EventKind::NodeStarted, attempt, "", ts_ns))
    }

    pub fn phase_started(&self, node: &ReleaseId, attempt: u32, phase: &str, ts_ns: TsNanos) -> Result<u64, StoreError> {
        self.observer.lock().unwrap().phase_started(node, phase);
        self.append(Event::new(Some(node.clone()), EventKind::PhaseStarted, attempt, phase, ts_ns))
    }

    pub fn phase_completed(
        &self,
        node: &ReleaseId,
        attempt: u32,
        phase: &str,
        status: &str,
        message: &str,
        ts_ns: TsNanos,
        payload: ValueMap,
    ) -> Result<u64, StoreError> {
        self.observer.lock().unwrap().phase_completed(node, phase, status, message);
        self.append(
            Event::new(Some(node.clone()), EventKind::PhaseCompleted, attempt, format!("{phase}:{status}:{message}"), ts_ns)
                .with_payload(payload),
        )
    }

    pub fn diff(&self, node: &ReleaseId, attempt: u32, text: &str, ts_ns: TsNanos) -> Result<u64, StoreError> {
        self.observer.lock().unwrap().set_diff(node, text);
        self.append(Event::new(Some(node.clone()), EventKind::NodeLog, attempt, text, ts_ns))
    }

    pub fn retry_scheduled(&self, node: &ReleaseId, attempt: u32, delay_ms: u64, reason: &str, ts_ns: TsNanos) -> Result<u64, StoreError> {
        self.observer
            .lock()
            .unwrap()
            .emit_event("warn", &format!("{node}: retrying (attempt {attempt}) in {delay_ms}ms: {reason}"));
        let mut payload = ValueMap::new();
        payload.insert("delay_ms".to_string(), serde_json::Value::from(delay_ms));
        self.append(Event::new(Some(node.clone()), EventKind::RetryScheduled, attempt, reason, ts_ns).with_payload(payload))
    }

    pub fn node_completed(&self, node: &ReleaseId, attempt: u32, outcome: &str, ts_ns: TsNanos) -> Result<u64, StoreError> {
        self.append(Event::new(Some(node.clone()), EventKind::NodeCompleted, attempt, outcome, ts_ns))
    }

    /// Same as [`Self::node_completed`], but upserts `cache_entry` under
    /// `cache_key` in the same store transaction as the `NodeCompleted`
    /// event append, so a crash between the two can never leave a cache
    /// entry for a node whose completion was never recorded (or vice versa).
    pub fn node_completed_with_cache_upsert(
        &self,
        node: &ReleaseId,
        attempt: u32,
        outcome: &str,
        cache_key: &ApplyCacheKey,
        cache_entry: &ApplyCacheEntry,
        ts_ns: TsNanos,
    ) -> Result<u64, StoreError> {
        let event = Event::new(Some(node.clone()), EventKind::NodeCompleted, attempt, outcome, ts_ns);
        self.store.complete_node_with_cache_upsert(&self.run_id, event, cache_key, cache_entry)
    }

    pub fn cancel_requested(&self, ts_ns: TsNanos) -> Result<u64, StoreError> {
        self.observer.lock().unwrap().emit_event("warn", "cancellation requested");
        self.append(Event::new(None, EventKind::CancelRequested, 0, "", ts_ns))
    }
}
