use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sysinfo::System;

use crate::benchmarks::ibd::{FailureHeuristics, IbdKind, PollingSettings, ServerNodeSettings};
use crate::build::{BuildSettings, Compiler};
use crate::config::traits::{Configuration, PathConfiguration};
use crate::config::{expand_opt, read_yaml};
use crate::git::RevisionSpec;
use crate::path_utils;

const LARGE_HOST_BYTES: u64 = 3 * 1024 * 1024 * 1024;

/// dbcache used when a bench does not set one: 2048 on hosts with more than
/// 3 GiB of memory, 512 otherwise
pub fn default_dbcache() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    if system.total_memory() > LARGE_HOST_BYTES {
        2048
    } else {
        512
    }
}

fn default_runs() -> usize {
    1
}

fn default_compilers() -> Vec<Compiler> {
    vec![Compiler::Gcc]
}

/// Kinds of benchmark that can be configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum BenchType {
    IbdLocal,
    IbdRemote,
    IbdReal,
    IbdRange,
    Reindex,
    MakeCheck,
    FunctionalTests,
    Microbench,
}

impl BenchType {
    pub fn is_sync(&self) -> bool {
        matches!(
            self,
            BenchType::IbdLocal
                | BenchType::IbdRemote
                | BenchType::IbdReal
                | BenchType::IbdRange
                | BenchType::Reindex
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BenchType::IbdLocal => "ibd_local",
            BenchType::IbdRemote => "ibd_remote",
            BenchType::IbdReal => "ibd_real",
            BenchType::IbdRange => "ibd_range",
            BenchType::Reindex => "reindex",
            BenchType::MakeCheck => "make_check",
            BenchType::FunctionalTests => "functional_tests",
            BenchType::Microbench => "microbench",
        }
    }
}

/// One entry of the `benches` list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchEntry {
    #[serde(rename = "type")]
    pub kind: BenchType,
    /// Times to repeat the bench per target
    #[serde(default = "default_runs")]
    pub runs: usize,

    #[serde(default)]
    pub start_height: u64,
    pub end_height: Option<u64>,
    #[serde(default)]
    pub checkpoints: Vec<u64>,
    pub dbcache: Option<u64>,
    pub assumevalid: Option<String>,
    /// `-debug` categories for the measured node
    #[serde(default)]
    pub debug: Vec<String>,
    #[serde(default)]
    pub bitcoind_extra_args: Vec<String>,

    /// Synced node for `ibd_local` and `ibd_range`
    pub server: Option<ServerNodeSettings>,
    /// Peer for `ibd_remote`
    pub peer_address: Option<String>,
    /// Pre-synced datadir for `ibd_range` and `reindex`
    pub copy_from_datadir: Option<PathBuf>,
    /// Keep the measured node's datadir by moving it below this directory
    pub stash_datadir: Option<PathBuf>,

    /// Attempts for command benches
    pub tries: Option<u32>,
    /// Parallelism for `make_check`; build jobs minus one when unset
    pub jobs: Option<usize>,
}

impl BenchEntry {
    pub fn new(kind: BenchType) -> Self {
        Self {
            kind,
            runs: default_runs(),
            start_height: 0,
            end_height: None,
            checkpoints: Vec::new(),
            dbcache: None,
            assumevalid: None,
            debug: Vec::new(),
            bitcoind_extra_args: Vec::new(),
            server: None,
            peer_address: None,
            copy_from_datadir: None,
            stash_datadir: None,
            tries: None,
            jobs: None,
        }
    }

    /// Strategy of a sync bench; `None` for command benches
    pub fn ibd_kind(&self) -> Result<Option<IbdKind>> {
        let name = self.kind.as_str();
        let server = || {
            self.server
                .clone()
                .ok_or_else(|| anyhow::anyhow!("{name} bench needs a server"))
        };
        let copy_from = || {
            self.copy_from_datadir
                .clone()
                .ok_or_else(|| anyhow::anyhow!("{name} bench needs copy_from_datadir"))
        };
        let kind = match self.kind {
            BenchType::IbdLocal => IbdKind::Local { server: server()? },
            BenchType::IbdRemote => IbdKind::Remote {
                peer_address: self
                    .peer_address
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("{name} bench needs peer_address"))?,
            },
            BenchType::IbdReal => IbdKind::Real,
            BenchType::IbdRange => IbdKind::Range {
                copy_from_datadir: copy_from()?,
                server: server()?,
            },
            BenchType::Reindex => IbdKind::Reindex {
                copy_from_datadir: copy_from()?,
            },
            BenchType::MakeCheck | BenchType::FunctionalTests | BenchType::Microbench => {
                return Ok(None)
            }
        };
        Ok(Some(kind))
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.kind.as_str();
        if self.runs == 0 {
            anyhow::bail!("{name}: runs must be at least 1");
        }
        if let Some(end) = self.end_height {
            if end < self.start_height {
                anyhow::bail!(
                    "{name}: end_height {end} is below start_height {}",
                    self.start_height
                );
            }
        }
        if self.tries == Some(0) {
            anyhow::bail!("{name}: tries must be at least 1");
        }
        if self.kind == BenchType::IbdRange && self.end_height.is_none() {
            anyhow::bail!("{name}: a range needs an end_height");
        }
        self.ibd_kind()?;
        Ok(())
    }
}

/// Configuration for a benchmark session loaded from benchmark.yml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    /// Revisions to benchmark
    pub targets: Vec<RevisionSpec>,
    #[serde(default = "default_compilers")]
    pub compilers: Vec<Compiler>,
    #[serde(default)]
    pub build: BuildSettings,
    #[serde(default)]
    pub polling: PollingSettings,
    #[serde(default)]
    pub heuristics: FailureHeuristics,
    pub benches: Vec<BenchEntry>,
    /// Path to the config file (set during loading)
    #[serde(skip)]
    pub path: PathBuf,
}

impl Configuration for BenchmarkConfig {
    fn config_path(&self) -> &PathBuf {
        &self.path
    }

    fn config_type(&self) -> &str {
        "benchmark"
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.targets.is_empty() {
            anyhow::bail!("No targets configured");
        }
        if self.compilers.is_empty() {
            anyhow::bail!("No compilers configured");
        }
        if self.benches.is_empty() {
            anyhow::bail!("No benchmarks configured");
        }
        let progress = self.polling.completion_progress;
        if !(progress > 0.0 && progress <= 1.0) {
            anyhow::bail!("polling.completion_progress must be in (0, 1], got {progress}");
        }
        if self.polling.init_attempts == 0 {
            anyhow::bail!("polling.init_attempts must be at least 1");
        }
        if self.build.jobs == 0 {
            anyhow::bail!("build.jobs must be at least 1");
        }
        for bench in &self.benches {
            bench.validate()?;
        }
        Ok(())
    }
}

impl PathConfiguration for BenchmarkConfig {
    fn with_expanded_paths(&self, config_dir: &Path) -> anyhow::Result<Self> {
        let mut config = self.clone();
        for bench in &mut config.benches {
            expand_opt(&mut bench.copy_from_datadir, config_dir)?;
            expand_opt(&mut bench.stash_datadir, config_dir)?;
            if let Some(server) = bench.server.as_mut() {
                server.bitcoind = path_utils::resolve_path(&server.bitcoind, config_dir, false)?;
                server.datadir = path_utils::resolve_path(&server.datadir, config_dir, false)?;
            }
        }
        Ok(config)
    }
}

/// Load benchmark configuration from a YAML file
pub fn load_bench_config(bench_config_path: &Path) -> Result<BenchmarkConfig> {
    let (mut config, config_dir): (BenchmarkConfig, _) = read_yaml(bench_config_path, "Benchmark")?;

    config.path = bench_config_path.to_path_buf();
    let config = config.with_expanded_paths(&config_dir)?;
    config.validate()?;

    debug!("Using {} configuration\n{:?}", config.config_type(), config);
    Ok(config)
}
