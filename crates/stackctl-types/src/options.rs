use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Fully resolved options for one `Apply`/`Delete` invocation.
///
/// This is the output of a stack-file/CLI merge (see `stackctl-config`);
/// nothing downstream of the Run Controller looks at a stack file or a CLI
/// flag directly, only at a `RunOptions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    pub concurrency: usize,
    pub per_cluster_concurrency: BTreeMap<String, usize>,
    pub progressive_concurrency: bool,
    pub allow_missing_deps: bool,
    pub dry_run: bool,
    pub allow_drift: bool,
    pub rerun_failed: bool,
    pub takeover: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            per_cluster_concurrency: BTreeMap::new(),
            progressive_concurrency: false,
            allow_missing_deps: false,
            dry_run: false,
            allow_drift: false,
            rerun_failed: false,
            takeover: false,
        }
    }
}

/// Options specific to `Resume`, layered on top of a [`RunOptions`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeOptions {
    pub run: RunOptions,
    pub run_id: String,
}
