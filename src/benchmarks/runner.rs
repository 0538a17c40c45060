use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::benchmarks::command::{
    report_process, result_from_process, run_command_benchmark, run_microbench, CommandBench,
};
use crate::benchmarks::ibd::{IbdConfig, IbdKind, IbdRunner, NodeContext};
use crate::benchmarks::names;
use crate::benchmarks::results::{BenchmarkResult, ResultPayload};
use crate::benchmarks::sink::{FanoutSink, LogSink, Measurement, MemorySink, ResultSink};
use crate::build::{BuildCache, Builder, Compiler};
use crate::config::{default_dbcache, BenchEntry, BenchType, GlobalConfig};
use crate::git::{GitRevisionResolver, Resolution, ResolvedTarget, RevisionSpec};
use crate::home::HomeConfig;
use crate::lock::HostLock;
use crate::node::NodeRegistry;
use crate::process::ProcessSpec;
use crate::system::SystemChecker;
use crate::system_info::HostInfo;

/// bench_bitcoin prints one row per benchmark; keep all of them
const MICROBENCH_OUTPUT_BYTES: usize = 1 << 20;

/// Everything a session produced, as exported to disk
#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub run_id: String,
    pub host: HostInfo,
    pub results: Vec<BenchmarkResult>,
    pub measurements: Vec<Measurement>,
    pub unresolved: Vec<RevisionSpec>,
}

/// Scratch space for the clone and node datadirs
enum Workdir {
    Temp(TempDir),
    Fixed(PathBuf),
}

impl Workdir {
    fn create(configured: Option<&Path>) -> Result<Self> {
        match configured {
            Some(dir) => {
                crate::path_utils::ensure_directory(dir)?;
                Ok(Workdir::Fixed(dir.to_path_buf()))
            }
            None => Ok(Workdir::Temp(
                tempfile::Builder::new()
                    .prefix("bitcoinperf-")
                    .tempdir()
                    .context("Failed to create workdir")?,
            )),
        }
    }

    fn path(&self) -> &Path {
        match self {
            Workdir::Temp(dir) => dir.path(),
            Workdir::Fixed(dir) => dir,
        }
    }

    /// Remove a temporary workdir unless it should be kept for inspection
    fn finish(self, keep: bool) -> Result<()> {
        match self {
            Workdir::Temp(dir) if keep => {
                let path = dir.into_path();
                info!("Leaving workdir in place at {path:?}");
            }
            Workdir::Temp(dir) => {
                debug!("Removing workdir {:?}", dir.path());
                dir.close().context("Failed to remove workdir")?;
            }
            Workdir::Fixed(dir) => debug!("Keeping configured workdir {dir:?}"),
        }
        Ok(())
    }
}

/// High-level orchestrator of a benchmark session
///
/// The MainRunner is responsible for:
/// 1. Refusing to run on an unfit or busy host
/// 2. Resolving targets and building each one, reusing the build cache
/// 3. Running every configured bench against every build
/// 4. Exporting results and tearing down scratch state
pub struct MainRunner {
    config: GlobalConfig,
    home: HomeConfig,
    only: Option<BenchType>,
}

impl MainRunner {
    pub fn new(config: GlobalConfig) -> Result<Self> {
        let home = HomeConfig::from_option(config.app.home_dir.as_deref())?;
        Ok(Self {
            config,
            home,
            only: None,
        })
    }

    /// Restrict the session to one kind of bench
    pub fn only(mut self, kind: Option<BenchType>) -> Self {
        self.only = kind;
        self
    }

    pub fn home(&self) -> &HomeConfig {
        &self.home
    }

    fn checker(&self) -> Result<SystemChecker> {
        SystemChecker::new(self.config.app.time_binary.clone(), self.config.app.no_caution)
    }

    fn resolve_in(&self, workdir: &Path) -> Result<Resolution> {
        let resolver = GitRevisionResolver::new(self.config.app.git.clone());
        let resolution = resolver.resolve(&workdir.join("bitcoin"), &self.config.bench.targets)?;
        for spec in &resolution.unresolved {
            warn!("Could not resolve {} (remote {:?}), skipping", spec.gitref, spec.remote);
        }
        Ok(resolution)
    }

    /// Resolve the configured targets without building or benchmarking
    pub fn resolve(&self) -> Result<Resolution> {
        let workdir = Workdir::create(self.config.app.workdir.as_deref())?;
        let resolution = self.resolve_in(workdir.path());
        workdir.finish(self.config.app.no_teardown)?;
        resolution
    }

    /// Run the whole session and export its results
    pub fn run(&self) -> Result<SessionReport> {
        let app = &self.config.app;
        let checker = self.checker()?;
        checker.startup_assertions()?;

        let _lock = HostLock::acquire(&app.lock_path)?;
        self.home.initialize()?;

        let host = HostInfo::gather();
        host.log();

        let registry = NodeRegistry::new();
        registry.install_interrupt_handler()?;

        let workdir = Workdir::create(app.workdir.as_deref())?;
        info!("Using workdir {:?}", workdir.path());
        let run_id = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();

        let memory = MemorySink::new();
        let sink = FanoutSink::new().with(LogSink).with(memory.clone());
        let session = self.run_session(&checker, &registry, workdir.path(), &sink);

        let finished = workdir.finish(app.no_teardown);
        let (results, unresolved) = session?;
        finished?;

        let report = SessionReport {
            run_id,
            host,
            results,
            measurements: memory.measurements(),
            unresolved,
        };
        self.export(&report)?;
        Ok(report)
    }

    fn run_session(
        &self,
        checker: &SystemChecker,
        registry: &NodeRegistry,
        workdir: &Path,
        sink: &dyn ResultSink,
    ) -> Result<(Vec<BenchmarkResult>, Vec<RevisionSpec>)> {
        let resolution = self.resolve_in(workdir)?;
        let repo = workdir.join("bitcoin");
        let cache_settings = &self.config.app.cache;
        let cache = cache_settings
            .enabled
            .then(|| BuildCache::new(&self.home.build_cache_dir, cache_settings.max_entries));

        let mut results = Vec::new();
        for target in &resolution.resolved {
            for compiler in &self.config.bench.compilers {
                let builder = Builder::new(&repo, self.config.bench.build.clone())
                    .with_cache(cache.as_ref())
                    .with_time_binary(self.config.app.time_binary.clone());

                if let Err(e) = checker.drop_caches() {
                    warn!("{e:#}");
                }
                match self.build(&builder, target, *compiler, sink) {
                    Ok((true, result)) => results.extend(result),
                    Ok((false, result)) => {
                        results.extend(result);
                        continue;
                    }
                    Err(e) => {
                        error!("[{}] build with {compiler} failed: {e:#}", target.checkout.name);
                        continue;
                    }
                }

                for entry in self.selected_benches() {
                    for run in 1..=entry.runs {
                        if let Err(e) = checker.drop_caches() {
                            warn!("{e:#}");
                        }
                        let outcome = self.run_bench(
                            entry, run, target, *compiler, &builder, registry, workdir, sink,
                        );
                        match outcome {
                            Ok(result) => results.push(result),
                            Err(e) => error!(
                                "[{}] {} aborted: {e:#}",
                                target.checkout.name,
                                entry.kind.as_str()
                            ),
                        }
                    }
                }
            }
        }
        Ok((results, resolution.unresolved))
    }

    fn selected_benches(&self) -> impl Iterator<Item = &BenchEntry> {
        let only = self.only;
        self.config
            .bench
            .benches
            .iter()
            .filter(move |b| only.is_none_or(|kind| b.kind == kind))
    }

    /// Build a target; the flag says whether benches can run on the result
    fn build(
        &self,
        builder: &Builder,
        target: &ResolvedTarget,
        compiler: Compiler,
        sink: &dyn ResultSink,
    ) -> Result<(bool, Option<BenchmarkResult>)> {
        let checkout = &target.checkout;
        let jobs = builder.settings().jobs;
        let name = names::make(jobs, compiler);

        let Some(handle) = builder.build(checkout, compiler)? else {
            info!("[{}] using cached build", checkout.name);
            return Ok((true, None));
        };
        let result = result_from_process(
            &name,
            &handle,
            checkout,
            ResultPayload::Build { jobs, compiler },
        );
        if result.succeeded() {
            report_process(sink, checkout, &name, &handle, "make")?;
        }
        Ok((result.succeeded(), Some(result)))
    }

    #[allow(clippy::too_many_arguments)]
    fn run_bench(
        &self,
        entry: &BenchEntry,
        run: usize,
        target: &ResolvedTarget,
        compiler: Compiler,
        builder: &Builder,
        registry: &NodeRegistry,
        workdir: &Path,
        sink: &dyn ResultSink,
    ) -> Result<BenchmarkResult> {
        let checkout = &target.checkout;
        let repo = workdir.join("bitcoin");
        let bench = &self.config.bench;
        let time_binary = self.config.app.time_binary.clone();

        if let Some(kind) = entry.ibd_kind()? {
            let ctx = NodeContext {
                bitcoind: builder.binary_path(),
                workdir: workdir.to_path_buf(),
                registry: registry.clone(),
                time_binary,
                timing: bench.polling.node_timing(),
            };
            let cfg = self.ibd_config(entry, run, &target.spec);
            return IbdRunner::<IbdKind>::new(kind, ctx, cfg, checkout, sink).run();
        }

        match entry.kind {
            BenchType::MakeCheck => {
                let jobs = entry
                    .jobs
                    .unwrap_or_else(|| bench.build.jobs.saturating_sub(1).max(1));
                let spec = ProcessSpec::new("make-check", "make")
                    .working_dir(&repo)
                    .timed(time_binary);
                let mut command = CommandBench::make_check(spec, compiler, jobs);
                if let Some(tries) = entry.tries {
                    command = command.tries(tries);
                }
                run_command_benchmark(&command, sink, checkout)
            }
            BenchType::FunctionalTests => {
                let test_runner = repo.join("test/functional/test_runner.py");
                let spec = ProcessSpec::new("functional-tests", test_runner)
                    .working_dir(&repo)
                    .timed(time_binary);
                let mut command = CommandBench::functional_tests(spec, compiler);
                if let Some(tries) = entry.tries {
                    command = command.tries(tries);
                }
                run_command_benchmark(&command, sink, checkout)
            }
            BenchType::Microbench => {
                let spec = ProcessSpec::new("bench_bitcoin", repo.join("src/bench/bench_bitcoin"))
                    .working_dir(&repo)
                    .tail_bytes(MICROBENCH_OUTPUT_BYTES);
                run_microbench(&spec, compiler, sink, checkout)
            }
            other => anyhow::bail!("{} is not a command bench", other.as_str()),
        }
    }

    fn ibd_config(&self, entry: &BenchEntry, run: usize, spec: &RevisionSpec) -> IbdConfig {
        let app = &self.config.app;
        let title = if entry.runs > 1 {
            format!("{}.run{run}", entry.kind.as_str())
        } else {
            entry.kind.as_str().to_string()
        };
        IbdConfig {
            start_height: entry.start_height,
            end_height: entry.end_height,
            checkpoints: entry.checkpoints.clone(),
            dbcache: entry.dbcache.unwrap_or_else(default_dbcache),
            assumevalid: entry.assumevalid.clone(),
            debug: entry.debug.clone(),
            client_extra_args: spec
                .bitcoind_extra_args
                .iter()
                .chain(&entry.bitcoind_extra_args)
                .cloned()
                .collect(),
            polling: self.config.bench.polling.clone(),
            heuristics: self.config.bench.heuristics.clone(),
            stash_dir: Some(
                app.stash_dir
                    .clone()
                    .unwrap_or_else(|| self.home.stash_dir.clone()),
            ),
            stash_datadir: entry.stash_datadir.clone(),
            keep_datadir: app.no_teardown,
            show_progress: app.show_progress,
            ..IbdConfig::new(title)
        }
    }

    /// Write the report and host snapshot under the results directory
    fn export(&self, report: &SessionReport) -> Result<()> {
        let path = self.home.results_dir.join(format!("{}.json", report.run_id));
        let file = File::create(&path).with_context(|| format!("Failed to create {path:?}"))?;
        serde_json::to_writer_pretty(file, report)
            .with_context(|| format!("Failed to write results to {path:?}"))?;
        report.host.dump(&self.home.results_dir.join("host_info.json"))?;

        let failed = report.results.iter().filter(|r| !r.succeeded()).count();
        info!(
            "Wrote {} results ({failed} failed) and {} measurements to {path:?}",
            report.results.len(),
            report.measurements.len()
        );
        Ok(())
    }
}
