use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::benchmarks::logparse::FlushEvent;
use crate::build::Compiler;

/// One observation while a node syncs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeightSample {
    /// Seconds since the node first reported the start height
    pub elapsed_secs: f64,
    pub cpu_percent: f32,
    pub rss_kib: u64,
    pub num_fds: u64,
}

/// Why a benchmark run was marked failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureKind {
    #[error("node exited unexpectedly ({status})")]
    ProcessDied { code: Option<i32>, status: String },
    #[error("control channel stopped answering")]
    ControlUnresponsive,
    #[error("node reported low disk space")]
    DiskSpaceLow,
    #[error("finished in {secs}s, faster than the plausible minimum of {min_secs}s")]
    ImplausiblyFast { secs: u64, min_secs: u64 },
    #[error("could not attribute resource usage: {detail}")]
    UnexpectedProcessTree { detail: String },
}

/// Lifecycle of a benchmark run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Starting,
    Running,
    Completed,
    Failed(FailureKind),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed(_))
    }
}

/// Data specific to a sync-style benchmark
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub start_height: u64,
    pub end_height: Option<u64>,
    pub dbcache: Option<u64>,
    pub height_to_data: BTreeMap<u64, HeightSample>,
    pub flush_events: Vec<FlushEvent>,
}

/// Per-kind part of a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultPayload {
    Ibd(SyncPayload),
    Reindex(SyncPayload),
    Build { jobs: usize, compiler: Compiler },
    Command,
    Microbench { results: Vec<MicrobenchRow> },
}

/// One row of microbenchmark output, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicrobenchRow {
    pub name: String,
    pub evals: u64,
    pub iterations: u64,
    pub total: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
}

/// Finalized record of a single benchmark run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub title: String,
    pub command: String,
    /// Display name of the revision benchmarked
    pub target: String,
    pub sha: String,
    pub state: RunState,
    pub total_secs: f64,
    pub peak_rss_kib: Option<u64>,
    pub kernel_secs: Option<f64>,
    pub user_secs: Option<f64>,
    pub payload: ResultPayload,
}

impl BenchmarkResult {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn sync_payload(&self) -> Option<&SyncPayload> {
        match &self.payload {
            ResultPayload::Ibd(p) | ResultPayload::Reindex(p) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_serializes_with_tags() {
        let result = BenchmarkResult {
            title: "ibd.local".into(),
            command: "bitcoind -datadir=/x".into(),
            target: "master".into(),
            sha: "abc".into(),
            state: RunState::Failed(FailureKind::DiskSpaceLow),
            total_secs: 1.0,
            peak_rss_kib: None,
            kernel_secs: None,
            user_secs: None,
            payload: ResultPayload::Ibd(SyncPayload::default()),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["state"]["state"], "failed");
        assert_eq!(json["state"]["reason"], "disk_space_low");
        assert_eq!(json["payload"]["kind"], "ibd");
        assert!(!result.succeeded());
        assert!(result.sync_payload().is_some());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Completed.is_terminal());
        assert!(RunState::Failed(FailureKind::ControlUnresponsive).is_terminal());
    }
}
