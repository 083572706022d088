//! Core data model for stackctl.
//!
//! This crate defines the entities the rest of the workspace operates on:
//! the declarative input (`Universe`, `ReleaseDescriptor`), the compiled and
//! selected form (`ResolvedRelease`, `Plan`), and the durable run record
//! (`Run`, `Event`, `NodeState`, the apply/verify caches). None of these
//! types know how to load, schedule, or execute anything; see
//! `stackctl-plan`, `stackctl-store`, and `stackctl-engine`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod cluster_key;
pub mod event;
pub mod options;
pub mod plan;
pub mod release;
pub mod run;
pub mod universe;

pub use cluster_key::ClusterKey;
pub use event::{Event, EventKind};
pub use options::{ResumeOptions, RunOptions};
pub use plan::{Plan, PlanEdges};
pub use release::{ApplyOptions, ReleaseDescriptor, ReleaseId, ResolvedRelease, RetryPolicy};
pub use run::{
    ApplyCacheEntry, ApplyCacheKey, Command, NodeState, NodeStatus, Run, RunStatus,
    VerifyCacheEntry, VerifyCacheKey,
};
pub use universe::{ClusterDescriptor, Stackfile, Universe};

/// A value-table of arbitrary scalars, keyed and ordered deterministically.
///
/// Used for `set` overrides and for the `Payload` carried by an [`Event`].
/// `BTreeMap` is used everywhere ordering feeds a hash or an ordering
/// guarantee — iteration order must be reproducible byte-for-byte.
pub type ValueMap = BTreeMap<String, serde_json::Value>;

/// A plain string→string override table, e.g. `--set key=value`.
pub type SetOverrides = BTreeMap<String, String>;

/// Wraps a path together with the release IDs it contributed fields to.
///
/// Produced by the Universe Loader; consumed by the Selector's `fromPaths`
/// matcher and by git-range selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provenance {
    pub path: PathBuf,
    pub release: ReleaseId,
}

/// A human-readable reason a node ended up selected.
///
/// Stamped in the order the reason was discovered; `Display` renders the
/// same short form used in event payloads (`tag:team-a`, `dep-of:checkout`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SelectionReason {
    Tag(String),
    FromPath(PathBuf),
    ReleaseName(String),
    GitRange(String),
    DepOf(ReleaseId),
    DependentOf(ReleaseId),
    AlwaysSelected,
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionReason::Tag(t) => write!(f, "tag:{t}"),
            SelectionReason::FromPath(p) => write!(f, "from-path:{}", p.display()),
            SelectionReason::ReleaseName(n) => write!(f, "release:{n}"),
            SelectionReason::GitRange(r) => write!(f, "git-range:{r}"),
            SelectionReason::DepOf(id) => write!(f, "dep-of:{id}"),
            SelectionReason::DependentOf(id) => write!(f, "dependent-of:{id}"),
            SelectionReason::AlwaysSelected => write!(f, "always-selected"),
        }
    }
}

/// Wall-clock timestamp expressed as nanoseconds since the Unix epoch.
///
/// Events are timestamped with this rather than `DateTime<Utc>` directly so
/// ordering comparisons and storage are plain integer operations; conversion
/// helpers are provided for display.
pub type TsNanos = i64;

/// Converts a [`DateTime<Utc>`] to nanoseconds-since-epoch, saturating on
/// out-of-range values rather than panicking.
pub fn ts_nanos(at: DateTime<Utc>) -> TsNanos {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Converts nanoseconds-since-epoch back to a [`DateTime<Utc>`].
pub fn from_ts_nanos(ns: TsNanos) -> DateTime<Utc> {
    DateTime::from_timestamp(ns / 1_000_000_000, (ns % 1_000_000_000) as u32)
        .unwrap_or_else(Utc::now)
}
