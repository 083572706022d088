//! Embedded run store for stackctl.
//!
//! The teacher's `shipper-store` pairs a `StateStore` trait with a
//! filesystem-backed `FileStore`, atomic via write-to-temp-then-rename. That
//! shape survives here as the `RunStore` trait over `SqliteRunStore`, but the
//! backend is `rusqlite` in WAL mode: a run's events must be durable and
//! followable by a second process while the first is still appending, which
//! a bare JSONL file cannot do without either polling-with-seek games or a
//! real write-ahead log.
//!
//! One writer connection is held behind a `Mutex`; reader connections
//! (`list_events`, `follow_events`, `list_runs`, cache reads) are opened
//! fresh per call, which WAL mode makes safe against the live writer.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};

use stackctl_types::{
    ApplyCacheEntry, ApplyCacheKey, Command, Event, EventKind, NodeState, Run, RunStatus,
    ValueMap, VerifyCacheEntry, VerifyCacheKey,
};

pub mod lock;
pub mod project;
pub mod schema;

pub use lock::{AcquireOutcome, LockHolder};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("schema version {0} is newer than this binary supports")]
    UnsupportedSchemaVersion(i64),
    #[error("run {0:?} not found")]
    RunNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Next,
    Prev,
}

/// Outcome of [`RunStore::check_apply_cache`]: whether the node's apply can
/// be skipped, and why (for the `PHASE_COMPLETED` event payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDecision {
    pub skip: bool,
    pub reason: String,
}

/// Contract from `spec.md` §4.5, implemented here by [`SqliteRunStore`].
///
/// `Send + Sync` because the Scheduler shares one store behind a single
/// reference across every worker thread it spawns.
pub trait RunStore: Send + Sync {
    fn create_run(&self, command: Command, started_at_ns: i64) -> Result<String, StoreError>;
    fn end_run(&self, run_id: &str, status: RunStatus, ended_at_ns: i64) -> Result<(), StoreError>;
    fn append_event(&self, run_id: &str, event: Event) -> Result<u64, StoreError>;
    fn list_events(&self, run_id: &str, since_seq: u64, limit: usize, direction: Direction) -> Result<Vec<Event>, StoreError>;
    fn latest_node_state(&self, run_id: &str, node_id: &stackctl_types::ReleaseId) -> Result<NodeState, StoreError>;
    fn check_apply_cache(
        &self,
        key: &ApplyCacheKey,
        compute_inputs_digest: Box<dyn FnOnce() -> String + '_>,
        compute_live_digest: Box<dyn FnOnce() -> Option<String> + '_>,
    ) -> Result<CacheDecision, StoreError>;
    fn upsert_apply_cache(&self, key: &ApplyCacheKey, entry: &ApplyCacheEntry) -> Result<(), StoreError>;
    /// Upserts `entry` under `key` and appends `event` in one transaction, so
    /// a completed node's apply-cache row and its `NodeCompleted` event can
    /// never be observed separately (spec.md: the two are upserted only
    /// together).
    fn complete_node_with_cache_upsert(
        &self,
        run_id: &str,
        event: Event,
        key: &ApplyCacheKey,
        entry: &ApplyCacheEntry,
    ) -> Result<u64, StoreError>;
    fn get_verify_cache(&self, key: &VerifyCacheKey) -> Result<Option<VerifyCacheEntry>, StoreError>;
    fn upsert_verify_cache(&self, key: &VerifyCacheKey, entry: &VerifyCacheEntry) -> Result<(), StoreError>;
    fn list_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError>;
}

pub struct SqliteRunStore {
    path: std::path::PathBuf,
    writer: Mutex<Connection>,
}

impl SqliteRunStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        schema::open_and_migrate(&conn)?;
        Ok(Self {
            path,
            writer: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::open_and_migrate(&conn)?;
        Ok(Self {
            path: std::path::PathBuf::new(),
            writer: Mutex::new(conn),
        })
    }

    fn reader(&self) -> Result<Connection, StoreError> {
        if self.path.as_os_str().is_empty() {
            // In-memory stores have no file to reopen; reuse the writer
            // connection's lock for reads too (tests only).
            return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
        }
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(conn)
    }

    pub fn acquire_lock(&self, holder: &str, now_ns: i64, stale_after: Duration, run_id: Option<&str>, takeover: bool) -> Result<AcquireOutcome, StoreError> {
        let conn = self.writer.lock().expect("writer mutex poisoned");
        lock::acquire(&conn, holder, now_ns, stale_after, run_id, takeover)
    }

    pub fn release_lock(&self, holder: &str) -> Result<(), StoreError> {
        let conn = self.writer.lock().expect("writer mutex poisoned");
        lock::release(&conn, holder)
    }

    pub fn current_lock_holder(&self) -> Result<Option<LockHolder>, StoreError> {
        let conn = self.writer.lock().expect("writer mutex poisoned");
        lock::current(&conn)
    }

    fn events_for_node(&self, conn: &Connection, run_id: &str, node_id: &stackctl_types::ReleaseId) -> Result<Vec<Event>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT seq, node_id, kind, attempt, message, payload, ts_ns
             FROM events WHERE run_id = ?1 AND node_id = ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params![run_id, node_id.to_string()], row_to_event)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }
}

fn append_event_sql(conn: &Connection, run_id: &str, event: &Event) -> Result<u64, StoreError> {
    let next_seq: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE run_id = ?1",
        [run_id],
        |row| row.get(0),
    )?;
    let payload_json = serde_json::to_string(&event.payload)?;
    let node_id_str = event.node_id.as_ref().map(|n| n.to_string()).unwrap_or_default();
    conn.execute(
        "INSERT INTO events (run_id, seq, node_id, kind, attempt, message, payload, ts_ns)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            run_id,
            next_seq,
            node_id_str,
            event.kind.as_str(),
            event.attempt,
            event.message,
            payload_json,
            event.ts_ns,
        ],
    )?;
    Ok(next_seq as u64)
}

fn upsert_apply_cache_sql(conn: &Connection, key: &ApplyCacheKey, entry: &ApplyCacheEntry) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO apply_cache (cluster_key, namespace, release, command, inputs_digest, live_digest, has_hooks, last_ok_run_id, last_ok_at_ns)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT (cluster_key, namespace, release, command) DO UPDATE SET
           inputs_digest = excluded.inputs_digest,
           live_digest = excluded.live_digest,
           has_hooks = excluded.has_hooks,
           last_ok_run_id = excluded.last_ok_run_id,
           last_ok_at_ns = excluded.last_ok_at_ns",
        rusqlite::params![
            key.cluster_key.to_string(),
            key.namespace,
            key.release,
            key.command.to_string(),
            entry.inputs_digest,
            entry.live_digest,
            entry.has_hooks as i64,
            entry.last_ok_run_id,
            entry.last_ok_at_ns,
        ],
    )?;
    Ok(())
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let node_id_str: String = row.get(1)?;
    let kind_str: String = row.get(2)?;
    let payload_str: String = row.get(5)?;

    Ok(Event {
        seq: row.get::<_, i64>(0)? as u64,
        node_id: if node_id_str.is_empty() { None } else { node_id_str.parse().ok() },
        kind: kind_str.parse().unwrap_or(EventKind::NodeLog),
        attempt: row.get::<_, i64>(3)? as u32,
        message: row.get(4)?,
        payload: serde_json::from_str::<ValueMap>(&payload_str).unwrap_or_default(),
        ts_ns: row.get(6)?,
    })
}

impl RunStore for SqliteRunStore {
    fn create_run(&self, command: Command, started_at_ns: i64) -> Result<String, StoreError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let conn = self.writer.lock().expect("writer mutex poisoned");
        conn.execute(
            "INSERT INTO runs (run_id, command, started_at_ns, ended_at_ns, status) VALUES (?1, ?2, ?3, NULL, ?4)",
            rusqlite::params![run_id, command.to_string(), started_at_ns, "running"],
        )?;
        Ok(run_id)
    }

    fn end_run(&self, run_id: &str, status: RunStatus, ended_at_ns: i64) -> Result<(), StoreError> {
        let conn = self.writer.lock().expect("writer mutex poisoned");
        let status_str = match status {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        };
        conn.execute(
            "UPDATE runs SET status = ?1, ended_at_ns = ?2 WHERE run_id = ?3",
            rusqlite::params![status_str, ended_at_ns, run_id],
        )?;
        Ok(())
    }

    fn append_event(&self, run_id: &str, event: Event) -> Result<u64, StoreError> {
        let conn = self.writer.lock().expect("writer mutex poisoned");
        append_event_sql(&conn, run_id, &event)
    }

    fn list_events(&self, run_id: &str, since_seq: u64, limit: usize, direction: Direction) -> Result<Vec<Event>, StoreError> {
        let conn = self.reader()?;
        let order = match direction {
            Direction::Next => "ASC",
            Direction::Prev => "DESC",
        };
        let cmp = match direction {
            Direction::Next => ">",
            Direction::Prev => "<",
        };
        let sql = format!(
            "SELECT seq, node_id, kind, attempt, message, payload, ts_ns
             FROM events WHERE run_id = ?1 AND seq {cmp} ?2 ORDER BY seq {order} LIMIT ?3"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params![run_id, since_seq as i64, limit as i64], row_to_event)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    fn latest_node_state(&self, run_id: &str, node_id: &stackctl_types::ReleaseId) -> Result<NodeState, StoreError> {
        let conn = self.reader()?;
        let events = self.events_for_node(&conn, run_id, node_id)?;
        Ok(project::node_state(node_id, &events))
    }

    fn check_apply_cache(
        &self,
        key: &ApplyCacheKey,
        compute_inputs_digest: Box<dyn FnOnce() -> String + '_>,
        compute_live_digest: Box<dyn FnOnce() -> Option<String> + '_>,
    ) -> Result<CacheDecision, StoreError> {
        let conn = self.writer.lock().expect("writer mutex poisoned");
        let cached: Option<(String, Option<String>, bool)> = conn
            .query_row(
                "SELECT inputs_digest, live_digest, has_hooks FROM apply_cache
                 WHERE cluster_key = ?1 AND namespace = ?2 AND release = ?3 AND command = ?4",
                rusqlite::params![key.cluster_key.to_string(), key.namespace, key.release, key.command.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? != 0)),
            )
            .optional()?;

        let Some((cached_inputs, cached_live, has_hooks)) = cached else {
            return Ok(CacheDecision { skip: false, reason: "no-cache-entry".into() });
        };

        let current_inputs = compute_inputs_digest();
        if current_inputs != cached_inputs {
            return Ok(CacheDecision { skip: false, reason: "inputs-changed".into() });
        }

        let current_live = compute_live_digest();
        if current_live != cached_live {
            return Ok(CacheDecision { skip: false, reason: "live-drifted".into() });
        }

        if has_hooks {
            return Ok(CacheDecision { skip: false, reason: "has-hooks".into() });
        }

        Ok(CacheDecision { skip: true, reason: "cache-hit".into() })
    }

    fn upsert_apply_cache(&self, key: &ApplyCacheKey, entry: &ApplyCacheEntry) -> Result<(), StoreError> {
        let conn = self.writer.lock().expect("writer mutex poisoned");
        upsert_apply_cache_sql(&conn, key, entry)
    }

    fn complete_node_with_cache_upsert(
        &self,
        run_id: &str,
        event: Event,
        key: &ApplyCacheKey,
        entry: &ApplyCacheEntry,
    ) -> Result<u64, StoreError> {
        let mut conn = self.writer.lock().expect("writer mutex poisoned");
        let tx = conn.transaction()?;
        upsert_apply_cache_sql(&tx, key, entry)?;
        let seq = append_event_sql(&tx, run_id, &event)?;
        tx.commit()?;
        Ok(seq)
    }

    fn get_verify_cache(&self, key: &VerifyCacheKey) -> Result<Option<VerifyCacheEntry>, StoreError> {
        let conn = self.writer.lock().expect("writer mutex poisoned");
        let entry = conn
            .query_row(
                "SELECT last_ok_at_ns, last_event_resource_version, last_status, last_message, last_evidence
                 FROM verify_cache WHERE cluster_key = ?1 AND namespace = ?2 AND release = ?3",
                rusqlite::params![key.cluster_key.to_string(), key.namespace, key.release],
                |row| {
                    let evidence_str: String = row.get(4)?;
                    Ok(VerifyCacheEntry {
                        last_ok_at_ns: row.get(0)?,
                        last_event_resource_version: row.get(1)?,
                        last_status: row.get(2)?,
                        last_message: row.get(3)?,
                        last_evidence: serde_json::from_str(&evidence_str).unwrap_or(serde_json::Value::Null),
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    fn upsert_verify_cache(&self, key: &VerifyCacheKey, entry: &VerifyCacheEntry) -> Result<(), StoreError> {
        let conn = self.writer.lock().expect("writer mutex poisoned");
        let evidence_json = serde_json::to_string(&entry.last_evidence)?;
        conn.execute(
            "INSERT INTO verify_cache (cluster_key, namespace, release, last_ok_at_ns, last_event_resource_version, last_status, last_message, last_evidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (cluster_key, namespace, release) DO UPDATE SET
               last_ok_at_ns = excluded.last_ok_at_ns,
               last_event_resource_version = excluded.last_event_resource_version,
               last_status = excluded.last_status,
               last_message = excluded.last_message,
               last_evidence = excluded.last_evidence",
            rusqlite::params![
                key.cluster_key.to_string(),
                key.namespace,
                key.release,
                entry.last_ok_at_ns,
                entry.last_event_resource_version,
                entry.last_status,
                entry.last_message,
                evidence_json,
            ],
        )?;
        Ok(())
    }

    fn list_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        let conn = self.writer.lock().expect("writer mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT run_id, command, started_at_ns, ended_at_ns, status FROM runs ORDER BY started_at_ns DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            let command_str: String = row.get(1)?;
            let status_str: String = row.get(4)?;
            let started_ns: i64 = row.get(2)?;
            let ended_ns: Option<i64> = row.get(3)?;
            Ok(Run {
                run_id: row.get(0)?,
                command: match command_str.as_str() {
                    "apply" => Command::Apply,
                    "delete" => Command::Delete,
                    _ => Command::Resume,
                },
                started_at: stackctl_types::from_ts_nanos(started_ns),
                ended_at: ended_ns.map(stackctl_types::from_ts_nanos),
                status: match status_str.as_str() {
                    "succeeded" => RunStatus::Succeeded,
                    "failed" => RunStatus::Failed,
                    _ => RunStatus::Running,
                },
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }
}

/// Blocks until events with `seq > from_seq` appear or the run reaches a
/// terminal status, polling on an interval — WAL mode is what makes this
/// safe to run from a process other than the writer.
pub struct EventFollower<'a> {
    store: &'a SqliteRunStore,
    run_id: String,
    next_seq: u64,
    poll_interval: Duration,
}

impl<'a> EventFollower<'a> {
    pub fn new(store: &'a SqliteRunStore, run_id: impl Into<String>, from_seq: u64) -> Self {
        Self {
            store,
            run_id: run_id.into(),
            next_seq: from_seq,
            poll_interval: Duration::from_millis(200),
        }
    }

    /// Returns the next batch of events, blocking until at least one exists
    /// or the run has ended with nothing left to deliver (in which case an
    /// empty vec is returned, signaling end-of-stream).
    pub fn next_batch(&mut self, cancel: &std::sync::atomic::AtomicBool) -> Result<Vec<Event>, StoreError> {
        loop {
            let batch = self.store.list_events(&self.run_id, self.next_seq, 256, Direction::Next)?;
            if !batch.is_empty() {
                self.next_seq = batch.last().unwrap().seq;
                return Ok(batch);
            }

            if cancel.load(std::sync::atomic::Ordering::Relaxed) {
                return Ok(Vec::new());
            }

            let runs = self.store.list_runs(usize::MAX)?;
            let run = runs.iter().find(|r| r.run_id == self.run_id);
            if run.map(|r| r.status.is_terminal()).unwrap_or(true) {
                return Ok(Vec::new());
            }

            std::thread::sleep(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackctl_types::ReleaseId;

    fn open() -> SqliteRunStore {
        let td = tempfile::tempdir().unwrap();
        SqliteRunStore::open(td.path().join("runs.sqlite3")).unwrap()
    }

    #[test]
    fn append_event_assigns_monotonic_seq_per_run() {
        let store = open();
        let run_id = store.create_run(Command::Apply, 0).unwrap();
        let id: ReleaseId = "c1/ns/a".parse().unwrap();

        let seq1 = store.append_event(&run_id, Event::new(Some(id.clone()), EventKind::NodeQueued, 1, "", 1)).unwrap();
        let seq2 = store.append_event(&run_id, Event::new(Some(id.clone()), EventKind::NodeStarted, 1, "", 2)).unwrap();
        assert_eq!(seq1, 1);
        assert_eq!(seq2, 2);
    }

    #[test]
    fn latest_node_state_folds_events_for_that_node_only() {
        let store = open();
        let run_id = store.create_run(Command::Apply, 0).unwrap();
        let a: ReleaseId = "c1/ns/a".parse().unwrap();
        let b: ReleaseId = "c1/ns/b".parse().unwrap();

        store.append_event(&run_id, Event::new(Some(a.clone()), EventKind::NodeStarted, 1, "", 1)).unwrap();
        store.append_event(&run_id, Event::new(Some(b.clone()), EventKind::NodeStarted, 1, "", 2)).unwrap();
        store.append_event(&run_id, Event::new(Some(a.clone()), EventKind::NodeCompleted, 1, "succeeded", 3)).unwrap();

        let state_a = store.latest_node_state(&run_id, &a).unwrap();
        let state_b = store.latest_node_state(&run_id, &b).unwrap();
        assert_eq!(state_a.status, stackctl_types::NodeStatus::Succeeded);
        assert_eq!(state_b.status, stackctl_types::NodeStatus::Running);
    }

    #[test]
    fn apply_cache_skips_only_when_both_digests_match_and_no_hooks() {
        let store = open();
        let key = ApplyCacheKey {
            cluster_key: stackctl_types::ClusterKey::new("c1", "/kube", "ctx"),
            namespace: "ns".into(),
            release: "a".into(),
            command: Command::Apply,
        };
        let miss = store.check_apply_cache(&key, Box::new(|| "digest-1".to_string()), Box::new(|| Some("live-1".to_string()))).unwrap();
        assert!(!miss.skip);
        assert_eq!(miss.reason, "no-cache-entry");

        store.upsert_apply_cache(&key, &ApplyCacheEntry {
            inputs_digest: "digest-1".into(),
            live_digest: Some("live-1".into()),
            has_hooks: false,
            last_ok_run_id: "run-1".into(),
            last_ok_at_ns: 0,
        }).unwrap();

        let hit = store.check_apply_cache(&key, Box::new(|| "digest-1".to_string()), Box::new(|| Some("live-1".to_string()))).unwrap();
        assert!(hit.skip);

        let drifted = store.check_apply_cache(&key, Box::new(|| "digest-1".to_string()), Box::new(|| Some("live-2".to_string()))).unwrap();
        assert!(!drifted.skip);
        assert_eq!(drifted.reason, "live-drifted");

        let changed = store.check_apply_cache(&key, Box::new(|| "digest-2".to_string()), Box::new(|| Some("live-1".to_string()))).unwrap();
        assert!(!changed.skip);
        assert_eq!(changed.reason, "inputs-changed");
    }

    #[test]
    fn list_events_paginates_with_direction() {
        let store = open();
        let run_id = store.create_run(Command::Apply, 0).unwrap();
        let id: ReleaseId = "c1/ns/a".parse().unwrap();
        for i in 1..=5u32 {
            store.append_event(&run_id, Event::new(Some(id.clone()), EventKind::NodeLog, 1, format!("line-{i}"), i as i64)).unwrap();
        }

        let forward = store.list_events(&run_id, 0, 2, Direction::Next).unwrap();
        assert_eq!(forward.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);

        let backward = store.list_events(&run_id, 6, 2, Direction::Prev).unwrap();
        assert_eq!(backward.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![5, 4]);
    }
}
