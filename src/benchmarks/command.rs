//! Benchmarks that run a command to completion and time it.

use anyhow::{bail, Context, Result};
use log::{error, info, warn};

use crate::benchmarks::names;
use crate::benchmarks::results::{
    BenchmarkResult, FailureKind, MicrobenchRow, ResultPayload, RunState,
};
use crate::benchmarks::sink::{save_timing, Measurement, ResultSink, Units};
use crate::build::Compiler;
use crate::git::ResolvedCheckout;
use crate::process::{ProcessHandle, ProcessSpec};

/// A command timed as a whole
#[derive(Debug, Clone)]
pub struct CommandBench {
    /// Metric name, e.g. `makecheck.gcc.7`
    pub name: String,
    pub spec: ProcessSpec,
    /// Attempts before the benchmark counts as failed
    pub tries: u32,
    /// Label of what was measured, e.g. `make`
    pub executable: String,
}

impl CommandBench {
    pub fn new(name: impl Into<String>, spec: ProcessSpec, executable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spec,
            tries: 1,
            executable: executable.into(),
        }
    }

    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = tries.max(1);
        self
    }

    /// `make check` with `jobs` jobs
    pub fn make_check(spec: ProcessSpec, compiler: Compiler, jobs: usize) -> Self {
        let spec = spec.args([format!("-j{jobs}"), "check".to_string()]);
        Self::new(names::make_check(compiler, jobs), spec, "make").tries(3)
    }

    /// The functional test suite runner
    pub fn functional_tests(spec: ProcessSpec, compiler: Compiler) -> Self {
        Self::new(names::functional_tests(compiler), spec, "functional-test-runner").tries(3)
    }
}

/// Turn a finished process into a result record
pub fn result_from_process(
    title: &str,
    handle: &ProcessHandle,
    checkout: &ResolvedCheckout,
    payload: ResultPayload,
) -> BenchmarkResult {
    let state = match handle.exit_status() {
        Some(status) if status.success() => RunState::Completed,
        Some(status) => RunState::Failed(FailureKind::ProcessDied {
            code: status.code(),
            status: status.to_string(),
        }),
        None => RunState::Running,
    };
    let rusage = handle.rusage();
    BenchmarkResult {
        title: title.to_string(),
        command: handle.command().to_string(),
        target: checkout.name.clone(),
        sha: checkout.sha.clone(),
        state,
        total_secs: handle.total_secs(),
        peak_rss_kib: rusage.map(|r| r.peak_rss_kib),
        kernel_secs: rusage.map(|r| r.kernel_secs),
        user_secs: rusage.map(|r| r.user_secs),
        payload,
    }
}

/// Report the time and peak memory of a successful process
pub fn report_process(
    sink: &dyn ResultSink,
    checkout: &ResolvedCheckout,
    name: &str,
    handle: &ProcessHandle,
    executable: &str,
) -> Result<()> {
    let timing = Measurement::new(checkout, name, handle.total_secs(), Units::Secs, executable);
    save_timing(sink, timing, handle.memusage_kib())
}

/// Run `bench` up to its try count and report the first success.
///
/// Every attempt is returned so failed tries stay visible; the benchmark
/// succeeded if the last one did.
pub fn run_command_benchmark(
    bench: &CommandBench,
    sink: &dyn ResultSink,
    checkout: &ResolvedCheckout,
) -> Result<BenchmarkResult> {
    let mut last = None;
    for attempt in 1..=bench.tries {
        info!("[{}] starting (try {attempt}/{})", bench.name, bench.tries);
        let mut handle = ProcessHandle::spawn(&bench.spec)?;
        handle.wait()?;
        let result = result_from_process(&bench.name, &handle, checkout, ResultPayload::Command);

        if result.succeeded() {
            info!("[{}] done in {:.1}s", bench.name, handle.total_secs());
            report_process(sink, checkout, &bench.name, &handle, &bench.executable)?;
            return Ok(result);
        }
        error!("[{}] command failed\n{}", bench.name, handle.failure_report());
        last = Some(result);
    }
    last.context("benchmark was never attempted")
}

/// Parse `bench_bitcoin` output.
///
/// Rows look like `Benchmark, evals, iterations, total, min, max, median`;
/// the header and blank lines are skipped. A row whose median is not between
/// its min and max is an error.
pub fn parse_microbench(stdout: &str) -> Result<Vec<MicrobenchRow>> {
    let mut rows = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("Benchmark") {
            continue;
        }
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 7 {
            bail!("Unexpected microbench row {line:?}");
        }
        let float = |i: usize| -> Result<f64> {
            fields[i]
                .parse()
                .with_context(|| format!("Bad number {:?} in {line:?}", fields[i]))
        };
        let row = MicrobenchRow {
            name: fields[0].to_string(),
            evals: fields[1].parse().with_context(|| format!("Bad evals in {line:?}"))?,
            iterations: fields[2]
                .parse()
                .with_context(|| format!("Bad iterations in {line:?}"))?,
            total: float(3)?,
            min: float(4)?,
            max: float(5)?,
            median: float(6)?,
        };
        if !(row.max >= row.median && row.median >= row.min) {
            bail!(
                "{} has inconsistent results: max {} median {} min {}",
                row.name,
                row.max,
                row.median,
                row.min
            );
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Run the microbenchmark binary and report each row's median
pub fn run_microbench(
    spec: &ProcessSpec,
    compiler: Compiler,
    sink: &dyn ResultSink,
    checkout: &ResolvedCheckout,
) -> Result<BenchmarkResult> {
    let title = format!("microbench.{compiler}");
    info!("[{title}] starting");
    let mut handle = ProcessHandle::spawn(spec)?;
    handle.wait()?;

    let mut result = result_from_process(&title, &handle, checkout, ResultPayload::Command);
    if !result.succeeded() {
        error!("[{title}] failed\n{}", handle.failure_report());
        return Ok(result);
    }
    if handle.stdout().len() >= spec.tail_bytes {
        warn!("[{title}] output exceeded the capture limit, early rows are lost");
    }

    let rows = parse_microbench(&handle.stdout())?;
    for row in &rows {
        let measurement = Measurement::new(
            checkout,
            names::micro(compiler, &row.name),
            row.median,
            Units::Secs,
            "bench-bitcoin",
        )
        .with_extra("result_min", row.min)
        .with_extra("result_max", row.max);
        sink.save(&measurement)?;
    }
    info!("[{title}] done, {} benchmarks", rows.len());
    result.payload = ResultPayload::Microbench { results: rows };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmarks::sink::MemorySink;

    fn checkout() -> ResolvedCheckout {
        ResolvedCheckout {
            gitref: "master".into(),
            remote: "origin".into(),
            sha: "0123456789abcdef".into(),
            commit_msg: "msg".into(),
            name: "master".into(),
            pre_rebase_sha: None,
        }
    }

    #[test]
    fn test_parse_microbench() {
        let out = "# Benchmark, evals, iterations, total, min, max, median\n\
                   Base58CheckEncode, 5, 320000, 5.2, 3.2e-06, 3.3e-06, 3.25e-06\n\
                   \n\
                   DeserializeBlockTest, 5, 160, 2.1, 0.0026, 0.0027, 0.00265\n";
        let rows = parse_microbench(out).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "Base58CheckEncode");
        assert_eq!(rows[0].iterations, 320000);
        assert_eq!(rows[1].median, 0.00265);
    }

    #[test]
    fn test_parse_microbench_rejects_inconsistent_rows() {
        let out = "Weird, 5, 10, 1.0, 0.5, 0.4, 0.45\n";
        let err = parse_microbench(out).unwrap_err();
        assert!(err.to_string().contains("inconsistent"));
        assert!(parse_microbench("Short, 1, 2\n").is_err());
    }

    #[test]
    fn test_command_benchmark_reports_success() {
        let sink = MemorySink::new();
        let spec = ProcessSpec::new("true", "true");
        let result = run_command_benchmark(
            &CommandBench::new("makecheck.gcc.1", spec, "make"),
            &sink,
            &checkout(),
        )
        .unwrap();

        assert!(result.succeeded());
        assert_eq!(sink.names(), vec!["makecheck.gcc.1"]);
    }

    #[test]
    fn test_command_benchmark_exhausts_tries() {
        let sink = MemorySink::new();
        let spec = ProcessSpec::new("false", "false");
        let bench = CommandBench::new("functionaltests.gcc", spec, "x").tries(2);
        let result = run_command_benchmark(&bench, &sink, &checkout()).unwrap();

        assert!(matches!(
            result.state,
            RunState::Failed(FailureKind::ProcessDied { code: Some(1), .. })
        ));
        assert!(sink.measurements().is_empty());
    }

    #[test]
    fn test_run_microbench_from_script() {
        let sink = MemorySink::new();
        let spec = ProcessSpec::new("bench", "sh").args([
            "-c",
            "echo '# Benchmark, evals, iterations, total, min, max, median'; \
             echo 'Foo, 5, 10, 1.0, 0.1, 0.3, 0.2'",
        ]);
        let result = run_microbench(&spec, Compiler::Clang, &sink, &checkout()).unwrap();

        assert!(result.succeeded());
        let saved = sink.measurements();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].name, "micro.clang.Foo");
        assert_eq!(saved[0].value, 0.2);
        assert_eq!(saved[0].extra["result_max"], 0.3);
    }
}
