//! Long-running sync benchmarks: initial block download and reindex.
//!
//! A run optionally starts a synced "server" node, then a "client" node that
//! syncs from it (or from the network, or from its own block files). The
//! client is polled until it reaches the end height or the chain tip, and a
//! measurement is emitted for every configured checkpoint height.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::benchmarks::logparse::{self, DISK_SPACE_LOW_MARKER};
use crate::benchmarks::names;
use crate::benchmarks::results::{
    BenchmarkResult, FailureKind, HeightSample, ResultPayload, RunState, SyncPayload,
};
use crate::benchmarks::sink::{save_timing, Measurement, ResultSink, Units};
use crate::git::ResolvedCheckout;
use crate::node::{
    ControlledNode, NodeConfig, NodeError, NodeRegistry, NodeTiming, StartOption, StartOptions,
};
use crate::path_utils;
use crate::process::usage::{ResourceUsage, UsageError};

/// How often and how patiently nodes are polled
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    pub interval_ms: u64,
    /// Verification progress above which the node counts as synced
    pub completion_progress: f64,
    pub init_attempts: u32,
    pub init_backoff_ms: u64,
    pub control_retries: u32,
    pub control_retry_ms: u64,
    pub client_stop_timeout_secs: u64,
    pub server_stop_timeout_secs: u64,
    pub kill_grace_secs: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            completion_progress: 0.9999,
            init_attempts: 100,
            init_backoff_ms: 2000,
            control_retries: 20,
            control_retry_ms: 1000,
            client_stop_timeout_secs: 30 * 60,
            server_stop_timeout_secs: 120,
            kill_grace_secs: 10,
        }
    }
}

impl PollingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn client_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.client_stop_timeout_secs)
    }

    pub fn server_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.server_stop_timeout_secs)
    }

    pub fn node_timing(&self) -> NodeTiming {
        NodeTiming {
            init_attempts: self.init_attempts,
            init_backoff: Duration::from_millis(self.init_backoff_ms),
            control_retries: self.control_retries,
            control_retry_sleep: Duration::from_millis(self.control_retry_ms),
            stop_timeout: self.server_stop_timeout(),
            kill_grace: Duration::from_secs(self.kill_grace_secs),
        }
    }
}

/// Checks that turn an apparently finished run into a failed one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureHeuristics {
    pub disk_low_marker: String,
    /// How much of the debug log to scan for the marker
    pub log_tail_lines: usize,
    /// Scan the log every this many polls while the node runs; 0 disables
    pub disk_check_every: u32,
    /// Runs completing faster than this are treated as failed
    pub min_plausible_secs: Option<u64>,
}

impl Default for FailureHeuristics {
    fn default() -> Self {
        Self {
            disk_low_marker: DISK_SPACE_LOW_MARKER.to_string(),
            log_tail_lines: 10_000,
            disk_check_every: 30,
            min_plausible_secs: None,
        }
    }
}

/// Parameters of one sync benchmark run
#[derive(Debug, Clone)]
pub struct IbdConfig {
    pub title: String,
    pub start_height: u64,
    pub end_height: Option<u64>,
    pub checkpoints: Vec<u64>,
    pub dbcache: u64,
    pub assumevalid: Option<String>,
    pub debug: Vec<String>,
    pub client_extra_args: Vec<String>,
    pub polling: PollingSettings,
    pub heuristics: FailureHeuristics,
    /// Copy the client's debug log here on teardown
    pub stash_dir: Option<PathBuf>,
    /// Move the client datadir below this directory on teardown
    pub stash_datadir: Option<PathBuf>,
    /// Leave the client datadir in place after the run
    pub keep_datadir: bool,
    pub show_progress: bool,
}

impl IbdConfig {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            start_height: 0,
            end_height: None,
            checkpoints: Vec::new(),
            dbcache: 450,
            assumevalid: None,
            debug: Vec::new(),
            client_extra_args: Vec::new(),
            polling: PollingSettings::default(),
            heuristics: FailureHeuristics::default(),
            stash_dir: None,
            stash_datadir: None,
            keep_datadir: false,
            show_progress: false,
        }
    }

    /// Checkpoints reported while syncing: sorted, deduplicated, within
    /// `[start_height, end_height)`. The end height itself is reported once
    /// the run has passed its failure checks.
    pub fn checkpoint_heights(&self) -> VecDeque<u64> {
        let mut heights: Vec<u64> = self
            .checkpoints
            .iter()
            .copied()
            .filter(|h| *h >= self.start_height && self.end_height.is_none_or(|end| *h < end))
            .collect();
        heights.sort_unstable();
        heights.dedup();
        heights.into()
    }

    fn is_pruned(&self) -> bool {
        self.client_extra_args.iter().any(|a| a.starts_with("-prune"))
    }
}

/// Where and how nodes for a run are created
#[derive(Debug, Clone)]
pub struct NodeContext {
    /// Daemon under test
    pub bitcoind: PathBuf,
    /// Scratch space; node datadirs live below it
    pub workdir: PathBuf,
    pub registry: NodeRegistry,
    pub time_binary: Option<PathBuf>,
    pub timing: NodeTiming,
}

impl NodeContext {
    pub fn node_config(&self, name: &str, bitcoind: &Path, datadir: &Path) -> NodeConfig {
        NodeConfig {
            time_binary: self.time_binary.clone(),
            timing: self.timing.clone(),
            ..NodeConfig::new(name, bitcoind, datadir)
        }
    }
}

/// A node together with how it should be started
#[derive(Debug)]
pub struct PlannedNode {
    pub node: ControlledNode,
    pub options: StartOptions,
}

/// What differs between sync benchmark kinds
pub trait NodeStrategy {
    /// The synced peer to sync from, if this kind runs one
    fn make_server_node(&self, ctx: &NodeContext, cfg: &IbdConfig) -> Result<Option<PlannedNode>>;

    /// The node being measured
    fn make_client_node(
        &self,
        ctx: &NodeContext,
        cfg: &IbdConfig,
        server: Option<&ControlledNode>,
    ) -> Result<PlannedNode>;

    /// Metric name for a height (or the tip label)
    fn metric_name(&self, cfg: &IbdConfig, height_label: &str, dbcache: u64) -> String;

    fn is_reindex(&self) -> bool {
        false
    }
}

/// Synced node serving blocks to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNodeSettings {
    pub bitcoind: PathBuf,
    pub datadir: PathBuf,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Built-in sync benchmark kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IbdKind {
    /// Sync from a local synced node started for the run
    Local { server: ServerNodeSettings },
    /// Sync from an already running peer
    Remote { peer_address: String },
    /// Sync from the public network
    Real,
    /// Sync a height range: the client starts from a copied datadir
    Range {
        copy_from_datadir: PathBuf,
        server: ServerNodeSettings,
    },
    /// Rebuild indexes from copied block files
    Reindex { copy_from_datadir: PathBuf },
}

fn base_client_options(cfg: &IbdConfig) -> StartOptions {
    let mut options = StartOptions::new()
        .with(StartOption::DbCache(cfg.dbcache))
        .with(StartOption::TxIndex(!cfg.is_pruned()))
        .with(StartOption::Listen(false));
    if let Some(hash) = &cfg.assumevalid {
        options = options.with(StartOption::AssumeValid(hash.clone()));
    }
    if let Some(end) = cfg.end_height {
        options = options.with(StartOption::StopAtHeight(end));
    }
    if !cfg.debug.is_empty() {
        options = options.with(StartOption::Debug(cfg.debug.clone()));
    }
    options.with_extra(cfg.client_extra_args.iter().cloned())
}

fn make_server(
    ctx: &NodeContext,
    cfg: &IbdConfig,
    settings: &ServerNodeSettings,
) -> Result<PlannedNode> {
    let config = NodeConfig {
        clean_datadir: false,
        ..ctx.node_config("server", &settings.bitcoind, &settings.datadir)
    };
    debug!("[{}] server uses synced datadir {:?}", cfg.title, settings.datadir);
    Ok(PlannedNode {
        node: ControlledNode::new(config, ctx.registry.clone())?,
        options: StartOptions::new()
            .with(StartOption::Listen(true))
            .with(StartOption::Connect(false))
            .with_extra(settings.extra_args.iter().cloned()),
    })
}

fn client_datadir(ctx: &NodeContext, cfg: &IbdConfig) -> PathBuf {
    ctx.workdir
        .join(format!("{}-client", path_utils::sanitize_component(&cfg.title)))
}

impl NodeStrategy for IbdKind {
    fn make_server_node(&self, ctx: &NodeContext, cfg: &IbdConfig) -> Result<Option<PlannedNode>> {
        match self {
            IbdKind::Local { server } | IbdKind::Range { server, .. } => {
                make_server(ctx, cfg, server).map(Some)
            }
            IbdKind::Remote { .. } | IbdKind::Real | IbdKind::Reindex { .. } => Ok(None),
        }
    }

    fn make_client_node(
        &self,
        ctx: &NodeContext,
        cfg: &IbdConfig,
        server: Option<&ControlledNode>,
    ) -> Result<PlannedNode> {
        let mut config = ctx.node_config("client", &ctx.bitcoind, &client_datadir(ctx, cfg));
        let mut options = base_client_options(cfg);

        match self {
            IbdKind::Local { .. } | IbdKind::Range { .. } => {
                let server = server.context("local sync needs a running server node")?;
                options = options
                    .with(StartOption::Connect(false))
                    .with(StartOption::AddNode(server.p2p_address()));
            }
            IbdKind::Remote { peer_address } => {
                options = options
                    .with(StartOption::Connect(false))
                    .with(StartOption::AddNode(peer_address.clone()));
            }
            IbdKind::Real => {}
            IbdKind::Reindex { .. } => {
                options = options
                    .with(StartOption::Connect(false))
                    .with(StartOption::Reindex);
            }
        }
        if let IbdKind::Range {
            copy_from_datadir, ..
        }
        | IbdKind::Reindex { copy_from_datadir } = self
        {
            config.copy_from_datadir = Some(copy_from_datadir.clone());
        }

        Ok(PlannedNode {
            node: ControlledNode::new(config, ctx.registry.clone())?,
            options,
        })
    }

    fn metric_name(&self, cfg: &IbdConfig, height_label: &str, dbcache: u64) -> String {
        match self {
            IbdKind::Local { .. } | IbdKind::Remote { .. } => {
                names::ibd_local(height_label, dbcache)
            }
            IbdKind::Real => names::ibd_real(height_label, dbcache),
            IbdKind::Range { .. } => {
                names::ibd_local_range(cfg.start_height, height_label, dbcache)
            }
            IbdKind::Reindex { .. } => names::reindex(height_label, dbcache),
        }
    }

    fn is_reindex(&self) -> bool {
        matches!(self, IbdKind::Reindex { .. })
    }
}

/// Bookkeeping of the polling loop
struct Tracker {
    started: Option<Instant>,
    pending: VecDeque<u64>,
    samples: BTreeMap<u64, HeightSample>,
    peak_rss_kib: u64,
    last_height: Option<u64>,
    /// Elapsed time at the poll that saw the sync complete
    completed_secs: Option<f64>,
    finished_secs: f64,
}

impl Tracker {
    fn elapsed(&self) -> f64 {
        self.started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or_default()
    }
}

/// Drives one sync benchmark run through its states
pub struct IbdRunner<'a, S: NodeStrategy> {
    strategy: S,
    ctx: NodeContext,
    cfg: IbdConfig,
    checkout: &'a ResolvedCheckout,
    sink: &'a dyn ResultSink,
    state: RunState,
}

impl<'a, S: NodeStrategy> IbdRunner<'a, S> {
    pub fn new(
        strategy: S,
        ctx: NodeContext,
        cfg: IbdConfig,
        checkout: &'a ResolvedCheckout,
        sink: &'a dyn ResultSink,
    ) -> Self {
        Self {
            strategy,
            ctx,
            cfg,
            checkout,
            sink,
            state: RunState::NotStarted,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    fn fail(&mut self, kind: FailureKind) {
        error!("[{}] failed: {kind}", self.cfg.title);
        self.state = RunState::Failed(kind);
    }

    /// Run the benchmark to a terminal state.
    ///
    /// Setup problems (server below the end height, a node that never comes
    /// up) are errors; failures once the client runs are reported through
    /// the returned result's state. Nodes are stopped and datadirs cleaned up
    /// on every path.
    pub fn run(&mut self) -> Result<BenchmarkResult> {
        info!("[{}] starting on {}", self.cfg.title, self.checkout.name);
        self.state = RunState::NotStarted;

        let mut server = self.strategy.make_server_node(&self.ctx, &self.cfg)?;
        if let Some(planned) = server.as_mut() {
            let started = planned
                .node
                .start(&planned.options)
                .and_then(|_| planned.node.wait_for_init(self.cfg.end_height));
            if let Err(e) = started {
                self.teardown_server(&mut planned.node);
                return Err(e.context(format!("[{}] server node unusable", self.cfg.title)));
            }
        }

        let client = self.strategy.make_client_node(
            &self.ctx,
            &self.cfg,
            server.as_ref().map(|p| &p.node),
        );
        let mut client = match client {
            Ok(client) => client,
            Err(e) => {
                if let Some(planned) = server.as_mut() {
                    self.teardown_server(&mut planned.node);
                }
                return Err(e);
            }
        };

        self.state = RunState::Starting;
        let outcome = self.drive(&mut client);
        let result = outcome.and_then(|tracker| self.finalize(&mut client.node, tracker));

        let teardown = self.teardown(&mut client.node, server.as_mut().map(|p| &mut p.node));
        if let Err(e) = &result {
            if !self.state.is_terminal() {
                self.state = RunState::Failed(failure_of_error(e));
            }
        }
        let result = result?;
        teardown?;
        info!("[{}] done: {:?}", self.cfg.title, self.state);
        Ok(result)
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.cfg.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(self.cfg.end_height.unwrap_or(0));
        let style = ProgressStyle::with_template(
            "{spinner} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(self.cfg.title.clone());
        bar
    }

    fn emit(
        &self,
        node: &ControlledNode,
        label: &str,
        height: Option<u64>,
        secs: f64,
        rss_kib: u64,
    ) -> Result<()> {
        let dbcache = node.dbcache().unwrap_or(self.cfg.dbcache);
        let name = self.strategy.metric_name(&self.cfg, label, dbcache);
        let mut measurement = Measurement::new(self.checkout, name, secs, Units::Secs, "bitcoind")
            .with_extra("start_height", self.cfg.start_height)
            .with_extra("dbcache", dbcache)
            .with_extra("txindex", !self.cfg.is_pruned());
        if let Some(height) = height {
            measurement = measurement.with_extra("height", height);
        }
        save_timing(self.sink, measurement, Some(rss_kib).filter(|k| *k > 0))
    }

    fn check_disk(&self, node: &ControlledNode) -> bool {
        let h = &self.cfg.heuristics;
        match node.disk_space_low(&h.disk_low_marker, h.log_tail_lines) {
            Ok(low) => low,
            Err(e) => {
                warn!("[{}] could not read debug log: {e:#}", self.cfg.title);
                false
            }
        }
    }

    /// Start the client and poll it until it finishes or fails
    fn drive(&mut self, client: &mut PlannedNode) -> Result<Tracker> {
        let node = &mut client.node;
        node.start(&client.options)?;
        node.wait_for_init(None)?;
        self.state = RunState::Running;

        let mut tracker = Tracker {
            started: None,
            pending: self.cfg.checkpoint_heights(),
            samples: BTreeMap::new(),
            peak_rss_kib: 0,
            last_height: None,
            completed_secs: None,
            finished_secs: 0.0,
        };
        let bar = self.progress_bar();
        let interval = self.cfg.polling.interval();
        let mut polls: u64 = 0;

        loop {
            if let Some(status) = node.has_exited()? {
                if !status.success() {
                    self.fail(FailureKind::ProcessDied {
                        code: status.code(),
                        status: status.to_string(),
                    });
                } else if self.check_disk(node) {
                    self.fail(FailureKind::DiskSpaceLow);
                } else {
                    info!("[{}] client exited on its own", self.cfg.title);
                }
                break;
            }

            polls += 1;
            let every = u64::from(self.cfg.heuristics.disk_check_every);
            if every > 0 && polls % every == 0 && self.check_disk(node) {
                self.fail(FailureKind::DiskSpaceLow);
                break;
            }

            let Some((height, progress)) = node.poll_height_and_progress() else {
                if node.has_exited()?.is_some() {
                    continue;
                }
                self.fail(FailureKind::ControlUnresponsive);
                break;
            };

            if height < self.cfg.start_height {
                debug!("[{}] at {height}, waiting for start height", self.cfg.title);
                thread::sleep(interval);
                continue;
            }
            let started = *tracker.started.get_or_insert_with(|| {
                info!("[{}] reached start height {height}", self.cfg.title);
                Instant::now()
            });
            let elapsed = started.elapsed().as_secs_f64();

            tracker.last_height = Some(height);
            let usage = usage_sample(&self.cfg.title, node.resource_usage())?;
            let rss_kib = usage.map(|u| u.rss_kib).unwrap_or_default();
            if let Some(usage) = usage {
                tracker.peak_rss_kib = tracker.peak_rss_kib.max(usage.rss_kib);
                tracker.samples.insert(
                    height,
                    HeightSample {
                        elapsed_secs: elapsed,
                        cpu_percent: usage.cpu_percent,
                        rss_kib: usage.rss_kib,
                        num_fds: usage.num_fds,
                    },
                );
            }

            while tracker.pending.front().is_some_and(|h| *h <= height) {
                if let Some(checkpoint) = tracker.pending.pop_front() {
                    info!("[{}] reached {checkpoint} after {elapsed:.1}s", self.cfg.title);
                    let label = checkpoint.to_string();
                    self.emit(node, &label, Some(checkpoint), elapsed, rss_kib)?;
                }
            }
            bar.set_position(height);

            let reached_end = self.cfg.end_height.is_some_and(|end| height >= end);
            if reached_end || progress > self.cfg.polling.completion_progress {
                info!(
                    "[{}] synced to {height} (progress {progress:.4})",
                    self.cfg.title
                );
                tracker.completed_secs = Some(elapsed);
                break;
            }
            thread::sleep(interval);
        }
        bar.finish_and_clear();
        tracker.finished_secs = tracker.completed_secs.unwrap_or_else(|| tracker.elapsed());

        let status = node.stop_via_control(self.cfg.polling.client_stop_timeout())?;
        if !self.state.is_terminal() {
            if let Some(status) = status.filter(|s| !s.success()) {
                self.fail(FailureKind::ProcessDied {
                    code: status.code(),
                    status: status.to_string(),
                });
            } else if self.check_disk(node) {
                self.fail(FailureKind::DiskSpaceLow);
            } else if let Some(min) = self.cfg.heuristics.min_plausible_secs {
                if tracker.finished_secs < min as f64 {
                    self.fail(FailureKind::ImplausiblyFast {
                        secs: tracker.finished_secs as u64,
                        min_secs: min,
                    });
                }
            }
        }
        if !self.state.is_terminal() {
            self.state = RunState::Completed;
        }
        Ok(tracker)
    }

    /// Emit the remaining measurements of a successful run and build the result.
    ///
    /// A node started with `-stopatheight` usually exits between two polls,
    /// so checkpoints not yet seen are drained with the final time.
    fn finalize(
        &mut self,
        node: &mut ControlledNode,
        mut tracker: Tracker,
    ) -> Result<BenchmarkResult> {
        let rusage = node.process().and_then(|p| p.rusage());
        let peak_rss = rusage
            .map(|r| r.peak_rss_kib)
            .unwrap_or(tracker.peak_rss_kib);
        let secs = tracker.finished_secs;

        let mut flush_events = Vec::new();
        if self.state == RunState::Completed {
            while let Some(checkpoint) = tracker.pending.pop_front() {
                debug!("[{}] {checkpoint} passed after the last poll", self.cfg.title);
                self.emit(node, &checkpoint.to_string(), Some(checkpoint), secs, peak_rss)?;
            }
            match self.cfg.end_height {
                Some(end) => self.emit(node, &end.to_string(), Some(end), secs, peak_rss)?,
                None => {
                    let reached = tracker.last_height.unwrap_or(self.cfg.start_height);
                    self.emit(node, names::TIP_LABEL, Some(reached), secs, peak_rss)?
                }
            }
            let log = node.debug_log_path();
            if log.exists() {
                flush_events = logparse::flush_events(&log).unwrap_or_else(|e| {
                    warn!("[{}] could not parse flush events: {e:#}", self.cfg.title);
                    Vec::new()
                });
            }
        }

        let payload = SyncPayload {
            start_height: self.cfg.start_height,
            end_height: self.cfg.end_height,
            dbcache: node.dbcache(),
            height_to_data: tracker.samples,
            flush_events,
        };
        Ok(BenchmarkResult {
            title: self.cfg.title.clone(),
            command: node.process().map(|p| p.command().to_string()).unwrap_or_default(),
            target: self.checkout.name.clone(),
            sha: self.checkout.sha.clone(),
            state: self.state.clone(),
            total_secs: tracker.finished_secs,
            peak_rss_kib: Some(peak_rss).filter(|k| *k > 0),
            kernel_secs: rusage.map(|r| r.kernel_secs),
            user_secs: rusage.map(|r| r.user_secs),
            payload: if self.strategy.is_reindex() {
                ResultPayload::Reindex(payload)
            } else {
                ResultPayload::Ibd(payload)
            },
        })
    }

    /// Per target and run directory name under a stash location
    fn stash_name(&self) -> String {
        format!(
            "{}-{}",
            path_utils::sanitize_component(&self.checkout.name),
            path_utils::sanitize_component(&self.cfg.title)
        )
    }

    fn teardown_server(&self, server: &mut ControlledNode) {
        if let Err(e) = server.stop_via_control(self.cfg.polling.server_stop_timeout()) {
            warn!("[{}] failed to stop server: {e:#}", self.cfg.title);
        }
    }

    /// Stop both nodes, keep the client's debug log, then stash or drop its
    /// datadir
    fn teardown(
        &self,
        client: &mut ControlledNode,
        server: Option<&mut ControlledNode>,
    ) -> Result<()> {
        let mut first_error = None;

        if let Err(e) = client.stop_via_control(self.cfg.polling.client_stop_timeout()) {
            warn!("[{}] failed to stop client: {e:#}", self.cfg.title);
            first_error.get_or_insert(e);
        }
        if let Some(server) = server {
            self.teardown_server(server);
        }
        if let Some(dir) = &self.cfg.stash_dir {
            if let Err(e) = client.stash_debug_log(&dir.join(self.stash_name())) {
                warn!("[{}] failed to stash debug log: {e:#}", self.cfg.title);
            }
        }
        if let Some(dir) = &self.cfg.stash_datadir {
            if let Err(e) = client.relocate_datadir(&dir.join(self.stash_name())) {
                warn!("[{}] failed to stash datadir: {e:#}", self.cfg.title);
                first_error.get_or_insert(e);
            }
        } else if !self.cfg.keep_datadir {
            if let Err(e) = client.discard_datadir() {
                warn!("[{}] failed to remove datadir: {e:#}", self.cfg.title);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A usage sample worth recording. A wrapper chain that forks is a bug in
/// how the node was launched and fails the run; other sampling problems only
/// lose the sample.
fn usage_sample(
    title: &str,
    sampled: Result<Option<ResourceUsage>>,
) -> Result<Option<ResourceUsage>> {
    match sampled {
        Ok(usage) => Ok(usage),
        Err(e) => match e.downcast_ref::<UsageError>() {
            Some(UsageError::UnexpectedProcessTree { .. }) => Err(e),
            _ => {
                warn!("[{title}] resource sampling failed: {e:#}");
                Ok(None)
            }
        },
    }
}

fn failure_of_error(error: &anyhow::Error) -> FailureKind {
    if let Some(UsageError::UnexpectedProcessTree { .. }) = error.downcast_ref::<UsageError>() {
        return FailureKind::UnexpectedProcessTree {
            detail: error.to_string(),
        };
    }
    match error.downcast_ref::<NodeError>() {
        Some(NodeError::PrematureExit { status, .. }) => FailureKind::ProcessDied {
            code: None,
            status: status.clone(),
        },
        _ => FailureKind::ControlUnresponsive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_heights_sorted_within_range() {
        let mut cfg = IbdConfig::new("t");
        cfg.checkpoints = vec![200, 100, 250, 100];
        cfg.end_height = Some(250);
        assert_eq!(cfg.checkpoint_heights(), VecDeque::from(vec![100, 200]));

        cfg.start_height = 150;
        assert_eq!(cfg.checkpoint_heights(), VecDeque::from(vec![200]));

        cfg.end_height = None;
        assert_eq!(cfg.checkpoint_heights(), VecDeque::from(vec![200, 250]));
    }

    #[test]
    fn test_client_options_for_pruned_node() {
        let mut cfg = IbdConfig::new("t");
        cfg.dbcache = 300;
        cfg.end_height = Some(1000);
        cfg.client_extra_args = vec!["-prune=550".into()];
        let args = base_client_options(&cfg).render();

        assert!(args.contains(&"-dbcache=300".to_string()));
        assert!(args.contains(&"-txindex=0".to_string()));
        assert!(args.contains(&"-stopatheight=1000".to_string()));
        assert!(args.contains(&"-prune=550".to_string()));
    }

    #[test]
    fn test_metric_names_per_kind() {
        let mut cfg = IbdConfig::new("t");
        cfg.start_height = 500_000;
        let server = ServerNodeSettings {
            bitcoind: "/b".into(),
            datadir: "/d".into(),
            extra_args: vec![],
        };
        assert_eq!(
            IbdKind::Local { server: server.clone() }.metric_name(&cfg, "500100", 2048),
            "ibd.local.500100.dbcache=2048"
        );
        assert_eq!(
            IbdKind::Range {
                copy_from_datadir: "/c".into(),
                server
            }
            .metric_name(&cfg, "500100", 2048),
            "ibd.local.500000.500100.dbcache=2048"
        );
        assert_eq!(IbdKind::Real.metric_name(&cfg, "tip", 4), "ibd.real.tip.dbcache=4");
        let reindex = IbdKind::Reindex {
            copy_from_datadir: "/c".into(),
        };
        assert!(reindex.is_reindex());
        assert_eq!(reindex.metric_name(&cfg, "10", 4), "reindex.10.dbcache=4");
    }

    #[test]
    fn test_usage_sampling_outcomes() {
        let usage = ResourceUsage {
            cpu_percent: 12.5,
            rss_kib: 2048,
            num_fds: 40,
        };
        assert_eq!(usage_sample("t", Ok(Some(usage))).unwrap(), Some(usage));
        assert_eq!(usage_sample("t", Ok(None)).unwrap(), None);

        let missing = UsageError::DaemonNotFound {
            root: 1,
            name: "bitcoind".into(),
            depth: 3,
        };
        assert_eq!(usage_sample("t", Err(missing.into())).unwrap(), None);

        let forked = UsageError::UnexpectedProcessTree {
            pid: 10,
            children: vec![11, 12],
        };
        let err = usage_sample("t", Err(forked.into())).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UsageError>(),
            Some(UsageError::UnexpectedProcessTree { pid: 10, .. })
        ));
        assert!(matches!(
            failure_of_error(&err),
            FailureKind::UnexpectedProcessTree { .. }
        ));
    }

    #[test]
    fn test_polling_settings_yaml() {
        let polling: PollingSettings = serde_yaml::from_str("interval_ms: 10").unwrap();
        assert_eq!(polling.interval(), Duration::from_millis(10));
        assert_eq!(polling.completion_progress, 0.9999);
        assert_eq!(polling.node_timing().control_retries, 20);
    }
}
