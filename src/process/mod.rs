//! Spawned child processes with captured output, timing and resource data.

pub mod usage;

pub use usage::{ResourceUsage, UsageSampler};

use anyhow::{Context, Result};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::command::CommandExecutor;

/// Default amount of stdout/stderr retained per stream
pub const DEFAULT_TAIL_BYTES: usize = 10_000;

/// Prefix of the line the timing wrapper appends to stderr
pub const RUSAGE_MARKER: &str = "bitcoinperf-rusage";

const REAP_POLL: Duration = Duration::from_millis(20);
const READER_JOIN_GRACE: Duration = Duration::from_secs(2);

/// Keeps the last `limit` bytes written to a stream
#[derive(Debug, Clone)]
pub struct OutputTail {
    text: String,
    limit: usize,
    truncated: bool,
}

impl OutputTail {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        self.text.push_str(line);
        self.text.push('\n');
        if self.text.len() > self.limit {
            let mut cut = self.text.len() - self.limit;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
            self.truncated = true;
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// Peak memory and CPU time reported by the timing wrapper
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rusage {
    pub peak_rss_kib: u64,
    pub kernel_secs: f64,
    pub user_secs: f64,
}

/// Parse the wrapper's marker line out of captured stderr
pub fn parse_rusage(stderr: &str) -> Option<Rusage> {
    let line = stderr
        .lines()
        .rev()
        .find(|l| l.trim_start().starts_with(RUSAGE_MARKER))?;
    let mut fields = line.split_whitespace().skip(1);
    Some(Rusage {
        peak_rss_kib: fields.next()?.parse().ok()?,
        kernel_secs: fields.next()?.parse().ok()?,
        user_secs: fields.next()?.parse().ok()?,
    })
}

/// What to launch
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// GNU `time` binary to wrap the program with, if any
    pub time_binary: Option<PathBuf>,
    pub tail_bytes: usize,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            time_binary: None,
            tail_bytes: DEFAULT_TAIL_BYTES,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timed(mut self, time_binary: Option<PathBuf>) -> Self {
        self.time_binary = time_binary;
        self
    }

    /// Bytes of each output stream to keep
    pub fn tail_bytes(mut self, bytes: usize) -> Self {
        self.tail_bytes = bytes;
        self
    }

    /// Human readable command line of the program itself
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// A running (or finished) child process.
///
/// Output is drained continuously by reader threads into bounded tails, so a
/// chatty child never blocks on a full pipe.
pub struct ProcessHandle {
    name: String,
    command: String,
    child: Child,
    pid: u32,
    started_at: Instant,
    ended_at: Option<Instant>,
    status: Option<ExitStatus>,
    stdout: Arc<Mutex<OutputTail>>,
    stderr: Arc<Mutex<OutputTail>>,
    readers: Vec<thread::JoinHandle<()>>,
    sampler: Option<UsageSampler>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .field("status", &self.status)
            .finish()
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: R,
    tail: Arc<Mutex<OutputTail>>,
    label: String,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    trace!("{label}: {line}");
                    tail.lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_line(&line);
                }
                Err(e) => {
                    debug!("{label}: stopped reading: {e}");
                    break;
                }
            }
        }
    })
}

impl ProcessHandle {
    /// Launch the process in its own process group
    pub fn spawn(spec: &ProcessSpec) -> Result<Self> {
        let command = spec.command_line();
        let program = spec.program.to_string_lossy().into_owned();

        let (cmd, args): (String, Vec<String>) = match &spec.time_binary {
            Some(time) => {
                let mut args = vec![
                    "-f".to_string(),
                    format!("{RUSAGE_MARKER} %M %S %U"),
                    program,
                ];
                args.extend(spec.args.iter().cloned());
                (time.to_string_lossy().into_owned(), args)
            }
            None => (program, spec.args.clone()),
        };
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

        let executor = CommandExecutor::builder()
            .name(format!("[{}] {}", spec.name, command))
            .capture_output(true)
            .process_group(true)
            .working_dir(spec.working_dir.as_ref())
            .env_vars(spec.env.clone())
            .build()?;
        let mut child = executor
            .launch_command(&cmd, &arg_refs)
            .with_context(|| format!("Failed to start {}", spec.name))?;
        let pid = child.id();
        debug!("[{}] started pid {pid}: {command}", spec.name);

        let stdout = Arc::new(Mutex::new(OutputTail::new(spec.tail_bytes)));
        let stderr = Arc::new(Mutex::new(OutputTail::new(spec.tail_bytes)));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(
                out,
                Arc::clone(&stdout),
                format!("{}:stdout", spec.name),
            ));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(
                err,
                Arc::clone(&stderr),
                format!("{}:stderr", spec.name),
            ));
        }

        Ok(Self {
            name: spec.name.clone(),
            command,
            child,
            pid,
            started_at: Instant::now(),
            ended_at: None,
            status: None,
            stdout,
            stderr,
            readers,
            sampler: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Process group id; equal to the pid since children lead their own group
    pub fn pgid(&self) -> u32 {
        self.pid
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.status
    }

    fn finish(&mut self, status: ExitStatus) {
        if self.status.is_some() {
            return;
        }
        self.ended_at = Some(Instant::now());
        self.status = Some(status);
        debug!("[{}] exited with {status}", self.name);

        let deadline = Instant::now() + READER_JOIN_GRACE;
        while self.readers.iter().any(|r| !r.is_finished()) && Instant::now() < deadline {
            thread::sleep(REAP_POLL);
        }
        for reader in std::mem::take(&mut self.readers) {
            if reader.is_finished() {
                let _ = reader.join();
            }
        }
    }

    /// Non-blocking exit check
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        match self
            .child
            .try_wait()
            .with_context(|| format!("Failed to poll {}", self.name))?
        {
            Some(status) => {
                self.finish(status);
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    pub fn is_running(&mut self) -> Result<bool> {
        Ok(self.try_wait()?.is_none())
    }

    /// Block until the process exits
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let status = self
            .child
            .wait()
            .with_context(|| format!("Failed to wait for {}", self.name))?;
        self.finish(status);
        Ok(status)
    }

    /// Wait up to `timeout`; `None` if still running afterwards
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(REAP_POLL);
        }
    }

    fn signal_group(&self, signal: libc::c_int) {
        // SAFETY: kill(2) with a negative pid addresses the process group we created.
        let rc = unsafe { libc::kill(-(self.pgid() as libc::pid_t), signal) };
        if rc != 0 {
            debug!(
                "[{}] signal {signal} to group {} failed: {}",
                self.name,
                self.pgid(),
                std::io::Error::last_os_error()
            );
        }
    }

    /// Ask the whole process group to exit
    pub fn terminate(&mut self) -> Result<()> {
        if self.try_wait()?.is_none() {
            self.signal_group(libc::SIGTERM);
        }
        Ok(())
    }

    /// SIGTERM, then SIGKILL after `grace`, then reap
    pub fn kill(&mut self, grace: Duration) -> Result<ExitStatus> {
        self.terminate()?;
        if let Some(status) = self.wait_timeout(grace)? {
            return Ok(status);
        }
        warn!("[{}] did not exit after SIGTERM, killing", self.name);
        self.signal_group(libc::SIGKILL);
        if let Err(e) = self.child.kill() {
            debug!("[{}] kill: {e}", self.name);
        }
        self.wait()
    }

    /// Wall-clock time since spawn, frozen at exit
    pub fn elapsed(&self) -> Duration {
        self.ended_at.unwrap_or_else(Instant::now) - self.started_at
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn total_secs(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }

    pub fn stdout(&self) -> String {
        self.stdout
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_str()
            .to_string()
    }

    pub fn stderr(&self) -> String {
        self.stderr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_str()
            .to_string()
    }

    /// Timing wrapper data, available once the process has exited
    pub fn rusage(&self) -> Option<Rusage> {
        self.status?;
        parse_rusage(&self.stderr())
    }

    pub fn memusage_kib(&self) -> Option<u64> {
        self.rusage().map(|r| r.peak_rss_kib)
    }

    /// Current usage of the process named `daemon` at or below this pid
    pub fn sample_usage(&mut self, daemon: &str) -> Result<Option<ResourceUsage>> {
        if self.status.is_some() {
            return Ok(None);
        }
        let pid = self.pid;
        self.sampler
            .get_or_insert_with(UsageSampler::new)
            .sample(pid, daemon)
    }

    /// Multi-line description of a failed run including captured output
    pub fn failure_report(&self) -> String {
        let status = self
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "still running".to_string());
        format!(
            "[{}] command failed ({status}): {}\n--- stdout (tail) ---\n{}\n--- stderr (tail) ---\n{}",
            self.name,
            self.command,
            self.stdout(),
            self.stderr()
        )
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            warn!("[{}] dropped while running, killing pid {}", self.name, self.pid);
            self.signal_group(libc::SIGKILL);
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_tail_keeps_last_bytes() {
        let mut tail = OutputTail::new(10);
        tail.push_line("12345");
        assert!(!tail.is_truncated());
        tail.push_line("abcdef");
        assert!(tail.is_truncated());
        assert!(tail.as_str().len() <= 10);
        assert!(tail.as_str().ends_with("abcdef\n"));
    }

    #[test]
    fn test_output_tail_multibyte_boundary() {
        let mut tail = OutputTail::new(5);
        tail.push_line("ééé");
        assert!(tail.as_str().len() <= 7);
        assert!(tail.as_str().ends_with('\n'));
    }

    #[test]
    fn test_parse_rusage() {
        let stderr = "some noise\nCommand exited with non-zero status 1\nbitcoinperf-rusage 204800 1.50 12.25\n";
        let rusage = parse_rusage(stderr).unwrap();
        assert_eq!(rusage.peak_rss_kib, 204800);
        assert_eq!(rusage.kernel_secs, 1.5);
        assert_eq!(rusage.user_secs, 12.25);

        assert!(parse_rusage("no marker here").is_none());
        assert!(parse_rusage("bitcoinperf-rusage garbage").is_none());
    }

    #[test]
    fn test_spawn_captures_output_and_status() {
        let spec = ProcessSpec::new("echo", "sh").args(["-c", "echo out; echo err >&2; exit 3"]);
        let mut handle = ProcessHandle::spawn(&spec).unwrap();
        let status = handle.wait().unwrap();

        assert_eq!(status.code(), Some(3));
        assert_eq!(handle.exit_status(), Some(status));
        assert!(handle.stdout().contains("out"));
        assert!(handle.stderr().contains("err"));
        assert!(handle.rusage().is_none());
        assert!(handle.failure_report().contains("exit status: 3"));
    }

    #[test]
    fn test_elapsed_is_frozen_after_exit() {
        let spec = ProcessSpec::new("true", "true");
        let mut handle = ProcessHandle::spawn(&spec).unwrap();
        handle.wait().unwrap();
        let first = handle.elapsed();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(handle.elapsed(), first);
    }

    #[test]
    fn test_wait_timeout_and_kill() {
        let spec = ProcessSpec::new("sleeper", "sleep").args(["30"]);
        let mut handle = ProcessHandle::spawn(&spec).unwrap();
        assert!(handle.wait_timeout(Duration::from_millis(50)).unwrap().is_none());
        assert!(handle.is_running().unwrap());

        let status = handle.kill(Duration::from_secs(5)).unwrap();
        assert!(!status.success());
        assert!(!handle.is_running().unwrap());
    }

    #[test]
    fn test_timed_wrapper_reports_rusage() {
        let time = Path::new("/usr/bin/time");
        if !time.exists() {
            return;
        }
        let spec = ProcessSpec::new("timed", "true").timed(Some(time.to_path_buf()));
        let mut handle = ProcessHandle::spawn(&spec).unwrap();
        assert!(handle.wait().unwrap().success());
        let rusage = handle.rusage().unwrap();
        assert!(rusage.peak_rss_kib > 0);
    }
}
