//! A bitcoind instance under benchmark control.

pub mod control;
pub mod options;
pub mod registry;

pub use control::{CliControl, ControlChannel, ControlError};
pub use options::{StartOption, StartOptions, BENCH_SAFETY_FLAGS};
pub use registry::{NodeId, NodeRegistry};

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde_json::Value;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::thread;
use std::time::Duration;

use crate::benchmarks::logparse;
use crate::path_utils;
use crate::process::{ProcessHandle, ProcessSpec, ResourceUsage};

/// Control-channel errors expected while a node is still warming up
const TRANSIENT_CONTROL_MESSAGES: &[&str] = &[
    "Could not connect to the server",
    "Loading block index",
    "Loading banlist",
    "Loading P2P addresses",
    "Loading wallet",
    "Loading txindex",
    "Verifying blocks",
    "Verifying wallet",
    "Rewinding blocks",
    "Replaying blocks",
    "Pruning blockstore",
    "Starting network threads",
    "Done loading",
    "Rescanning",
    "error code: -28",
];

pub fn is_transient_control_error(message: &str) -> bool {
    TRANSIENT_CONTROL_MESSAGES.iter().any(|m| message.contains(m))
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("{name} did not answer its control channel after {attempts} attempts\n{output}")]
    StartupTimeout {
        name: String,
        attempts: u32,
        output: String,
    },
    #[error("{name} exited during startup ({status})\n{output}")]
    PrematureExit {
        name: String,
        status: String,
        output: String,
    },
    #[error("{name} is at height {actual}, below the required {required}")]
    InsufficientHeight {
        name: String,
        required: u64,
        actual: u64,
    },
}

/// Retry and timing knobs for talking to a node
#[derive(Debug, Clone)]
pub struct NodeTiming {
    pub init_attempts: u32,
    pub init_backoff: Duration,
    pub control_retries: u32,
    pub control_retry_sleep: Duration,
    /// Used when the node has to be stopped outside the benchmark teardown
    pub stop_timeout: Duration,
    /// Wait between SIGTERM and SIGKILL when a stop times out
    pub kill_grace: Duration,
}

impl Default for NodeTiming {
    fn default() -> Self {
        Self {
            init_attempts: 100,
            init_backoff: Duration::from_secs(2),
            control_retries: 20,
            control_retry_sleep: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(120),
            kill_grace: Duration::from_secs(10),
        }
    }
}

/// Static description of a node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Label used in logs, e.g. `client` or `server`
    pub name: String,
    pub bitcoind: PathBuf,
    pub datadir: PathBuf,
    /// Fill an emptied datadir from this read-only source before starting
    pub copy_from_datadir: Option<PathBuf>,
    /// Empty the datadir before starting
    pub clean_datadir: bool,
    pub port: Option<u16>,
    pub rpc_port: Option<u16>,
    /// Path of the debug log relative to the datadir
    pub debug_log: PathBuf,
    pub time_binary: Option<PathBuf>,
    pub timing: NodeTiming,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, bitcoind: &Path, datadir: &Path) -> Self {
        Self {
            name: name.into(),
            bitcoind: bitcoind.to_path_buf(),
            datadir: datadir.to_path_buf(),
            copy_from_datadir: None,
            clean_datadir: true,
            port: None,
            rpc_port: None,
            debug_log: PathBuf::from("debug.log"),
            time_binary: None,
            timing: NodeTiming::default(),
        }
    }

    /// Name the daemon process will have in the process table
    pub fn daemon_name(&self) -> String {
        self.bitcoind
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "bitcoind".to_string())
    }

    /// `bitcoin-cli` next to the daemon binary
    pub fn cli_path(&self) -> PathBuf {
        self.bitcoind.with_file_name("bitcoin-cli")
    }
}

/// Ask the OS for a currently unused local TCP port
pub fn select_free_port() -> Result<u16> {
    let listener =
        TcpListener::bind(("127.0.0.1", 0)).context("Failed to bind an ephemeral port")?;
    Ok(listener.local_addr()?.port())
}

/// One managed bitcoind instance
pub struct ControlledNode {
    config: NodeConfig,
    port: u16,
    rpc_port: u16,
    control: Box<dyn ControlChannel>,
    registry: NodeRegistry,
    registration: Option<NodeId>,
    process: Option<ProcessHandle>,
    started_args: Vec<String>,
}

impl std::fmt::Debug for ControlledNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlledNode")
            .field("name", &self.config.name)
            .field("port", &self.port)
            .field("rpc_port", &self.rpc_port)
            .field("process", &self.process)
            .finish()
    }
}

impl ControlledNode {
    /// Node controlled through `bitcoin-cli`
    pub fn new(config: NodeConfig, registry: NodeRegistry) -> Result<Self> {
        let rpc_port = match config.rpc_port {
            Some(p) => p,
            None => select_free_port()?,
        };
        let control = CliControl::new(&config.cli_path(), &config.datadir, rpc_port);
        let config = NodeConfig {
            rpc_port: Some(rpc_port),
            ..config
        };
        Self::with_control(config, registry, Box::new(control))
    }

    /// Node with a caller supplied control channel
    pub fn with_control(
        config: NodeConfig,
        registry: NodeRegistry,
        control: Box<dyn ControlChannel>,
    ) -> Result<Self> {
        let port = match config.port {
            Some(p) => p,
            None => select_free_port()?,
        };
        let rpc_port = match config.rpc_port {
            Some(p) => p,
            None => select_free_port()?,
        };
        Ok(Self {
            config,
            port,
            rpc_port,
            control,
            registry,
            registration: None,
            process: None,
            started_args: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn rpc_port(&self) -> u16 {
        self.rpc_port
    }

    /// `host:port` other nodes can `-addnode` to
    pub fn p2p_address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn datadir(&self) -> &Path {
        &self.config.datadir
    }

    pub fn debug_log_path(&self) -> PathBuf {
        self.config.datadir.join(&self.config.debug_log)
    }

    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    /// Arguments of the most recent start, as passed to the daemon
    pub fn started_args(&self) -> &[String] {
        &self.started_args
    }

    /// dbcache the node was started with
    pub fn dbcache(&self) -> Option<u64> {
        options::arg_value(&self.started_args, "dbcache").and_then(|v| v.parse().ok())
    }

    pub fn is_started(&self) -> bool {
        self.process.is_some()
    }

    /// Empty the datadir and, if configured, seed it from the read-only source
    pub fn prepare_datadir(&self) -> Result<()> {
        if self.config.clean_datadir || self.config.copy_from_datadir.is_some() {
            path_utils::recreate_directory(&self.config.datadir)?;
        } else {
            path_utils::ensure_directory(&self.config.datadir)?;
        }
        if let Some(source) = &self.config.copy_from_datadir {
            info!(
                "[{}] seeding datadir {:?} from {:?}",
                self.name(),
                self.config.datadir,
                source
            );
            path_utils::copy_dir_recursive(source, &self.config.datadir, &[])
                .with_context(|| format!("Failed to copy datadir from {source:?}"))?;
        }
        Ok(())
    }

    /// Launch the daemon
    pub fn start(&mut self, options: &StartOptions) -> Result<()> {
        if self.process.is_some() {
            anyhow::bail!("{} is already started", self.name());
        }
        self.prepare_datadir()?;

        let mut args = vec![
            format!("-datadir={}", self.config.datadir.display()),
            format!("-port={}", self.port),
            format!("-rpcport={}", self.rpc_port),
        ];
        args.extend(options.render());

        let spec = ProcessSpec::new(self.name(), &self.config.bitcoind)
            .args(args.iter().cloned())
            .timed(self.config.time_binary.clone());
        let handle = ProcessHandle::spawn(&spec)
            .with_context(|| format!("Failed to start {}", self.name()))?;
        info!("[{}] started: {}", self.name(), handle.command());

        self.registration = Some(self.registry.register(self.name(), handle.pgid()));
        self.started_args = args;
        self.process = Some(handle);
        Ok(())
    }

    /// One control call; failures are logged and reported as `None`
    pub fn call_control(&self, command: &str) -> Option<Value> {
        match self.control.call(command) {
            Ok(value) => Some(value),
            Err(e) if is_transient_control_error(&e.message) => {
                debug!("[{}] {command}: {}", self.name(), e.message);
                None
            }
            Err(e) => {
                warn!("[{}] {command} failed: {}", self.name(), e.message);
                None
            }
        }
    }

    /// Exit status if the daemon has exited
    pub fn has_exited(&mut self) -> Result<Option<ExitStatus>> {
        match self.process.as_mut() {
            Some(p) => p.try_wait(),
            None => Ok(None),
        }
    }

    fn captured_output(&self) -> String {
        self.process
            .as_ref()
            .map(|p| format!("stdout:\n{}\nstderr:\n{}", p.stdout(), p.stderr()))
            .unwrap_or_default()
    }

    /// Block until the node answers `getblockchaininfo`, returning its height.
    ///
    /// With `require_height`, a node below that height is stopped and an
    /// [`NodeError::InsufficientHeight`] returned.
    pub fn wait_for_init(&mut self, require_height: Option<u64>) -> Result<u64> {
        if self.process.is_none() {
            anyhow::bail!("{} has not been started", self.name());
        }
        let attempts = self.config.timing.init_attempts;
        for attempt in 1..=attempts {
            if let Some(status) = self.has_exited()? {
                return Err(NodeError::PrematureExit {
                    name: self.name().to_string(),
                    status: status.to_string(),
                    output: self.captured_output(),
                }
                .into());
            }

            if let Some(info) = self.call_control("getblockchaininfo") {
                let height = info.get("blocks").and_then(Value::as_u64).unwrap_or(0);
                info!("[{}] ready at height {height}", self.name());
                if let Some(required) = require_height {
                    if height < required {
                        self.stop_via_control(self.config.timing.stop_timeout)?;
                        return Err(NodeError::InsufficientHeight {
                            name: self.name().to_string(),
                            required,
                            actual: height,
                        }
                        .into());
                    }
                }
                return Ok(height);
            }

            debug!("[{}] waiting for init ({attempt}/{attempts})", self.name());
            thread::sleep(self.config.timing.init_backoff);
        }

        Err(NodeError::StartupTimeout {
            name: self.name().to_string(),
            attempts,
            output: self.captured_output(),
        }
        .into())
    }

    /// Current `(height, verification progress)`, retried a bounded number of
    /// times. `None` means the control channel is unresponsive.
    pub fn poll_height_and_progress(&mut self) -> Option<(u64, f64)> {
        let retries = self.config.timing.control_retries.max(1);
        for attempt in 1..=retries {
            if let Some(info) = self.call_control("getblockchaininfo") {
                let height = info.get("blocks").and_then(Value::as_u64);
                let progress = info.get("verificationprogress").and_then(Value::as_f64);
                if let (Some(height), Some(progress)) = (height, progress) {
                    return Some((height, progress));
                }
                warn!("[{}] malformed getblockchaininfo: {info}", self.name());
            }
            if matches!(self.has_exited(), Ok(Some(_))) {
                return None;
            }
            if attempt < retries {
                thread::sleep(self.config.timing.control_retry_sleep);
            }
        }
        None
    }

    /// Ask the node to stop and wait up to `timeout`, force-terminating after.
    ///
    /// Safe to call on a node that never started or already exited.
    pub fn stop_via_control(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let name = self.name().to_string();
        let grace = self.config.timing.kill_grace;
        if self.has_exited()?.is_none() && self.process.is_some() {
            info!("[{name}] stopping");
            self.call_control("stop");
        }
        let status = match self.process.as_mut() {
            None => None,
            Some(process) => match process.wait_timeout(timeout)? {
                Some(status) => Some(status),
                None => {
                    warn!("[{name}] did not stop within {timeout:?}, terminating");
                    Some(process.kill(grace)?)
                }
            },
        };
        if let Some(id) = self.registration.take() {
            self.registry.unregister(id);
        }
        Ok(status)
    }

    /// Latest usage sample of the daemon; `None` if it is not running
    pub fn resource_usage(&mut self) -> Result<Option<ResourceUsage>> {
        let daemon = self.config.daemon_name();
        match self.process.as_mut() {
            Some(process) => process.sample_usage(&daemon),
            None => Ok(None),
        }
    }

    /// Whether the debug log reports low disk space in its tail
    pub fn disk_space_low(&self, marker: &str, tail_lines: usize) -> Result<bool> {
        let path = self.debug_log_path();
        if !path.exists() {
            return Ok(false);
        }
        logparse::tail_contains(&path, marker, tail_lines)
    }

    /// Copy the debug log into `dir` as `<name>-debug.log`
    pub fn stash_debug_log(&self, dir: &Path) -> Result<Option<PathBuf>> {
        let source = self.debug_log_path();
        if !source.exists() {
            return Ok(None);
        }
        path_utils::ensure_directory(dir)?;
        let dest = dir.join(format!("{}-debug.log", self.name()));
        path_utils::copy_file(&source, &dest)?;
        info!("[{}] stashed debug log at {dest:?}", self.name());
        Ok(Some(dest))
    }

    /// Move the datadir to `dest`, replacing anything already there
    pub fn relocate_datadir(&self, dest: &Path) -> Result<()> {
        if !self.config.datadir.exists() {
            return Ok(());
        }
        path_utils::move_dir(&self.config.datadir, dest)?;
        info!("[{}] moved datadir to {dest:?}", self.name());
        Ok(())
    }

    /// Delete the datadir
    pub fn discard_datadir(&self) -> Result<()> {
        if self.config.copy_from_datadir.is_none() && !self.config.clean_datadir {
            debug!(
                "[{}] keeping externally owned datadir {:?}",
                self.name(),
                self.config.datadir
            );
            return Ok(());
        }
        path_utils::remove_dir_if_exists(&self.config.datadir)
    }
}

impl Drop for ControlledNode {
    fn drop(&mut self) {
        if let Some(id) = self.registration.take() {
            self.registry.unregister(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_messages() {
        assert!(is_transient_control_error(
            "error code: -28\nerror message:\nLoading block index..."
        ));
        assert!(is_transient_control_error(
            "error: Could not connect to the server 127.0.0.1:8332"
        ));
        assert!(!is_transient_control_error("Method not found"));
    }

    #[test]
    fn test_config_derived_paths() {
        let config = NodeConfig::new("client", Path::new("/src/bitcoind"), Path::new("/data"));
        assert_eq!(config.daemon_name(), "bitcoind");
        assert_eq!(config.cli_path(), PathBuf::from("/src/bitcoin-cli"));
    }

    #[test]
    fn test_select_free_port() {
        let port = select_free_port().unwrap();
        assert!(port > 0);
    }
}
