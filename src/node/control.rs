use anyhow::Result;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::command::CommandExecutor;

/// A failed control-channel call, carrying the daemon's (or client's) message
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ControlError {
    pub message: String,
}

impl ControlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Request/response channel to a running node
pub trait ControlChannel: Send {
    /// Issue `command` (space separated command and arguments)
    fn call(&self, command: &str) -> Result<Value, ControlError>;
}

/// Talks to bitcoind through the `bitcoin-cli` binary
#[derive(Debug, Clone)]
pub struct CliControl {
    cli: PathBuf,
    datadir: PathBuf,
    rpc_port: u16,
}

impl CliControl {
    pub fn new(cli: &Path, datadir: &Path, rpc_port: u16) -> Self {
        Self {
            cli: cli.to_path_buf(),
            datadir: datadir.to_path_buf(),
            rpc_port,
        }
    }

    fn args(&self, command: &str) -> Vec<String> {
        let mut args = vec![
            format!("-datadir={}", self.datadir.display()),
            format!("-rpcport={}", self.rpc_port),
        ];
        args.extend(command.split_whitespace().map(str::to_string));
        args
    }
}

/// Interpret bitcoin-cli stdout: JSON when it parses, a bare string otherwise
pub fn parse_response(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

impl ControlChannel for CliControl {
    fn call(&self, command: &str) -> Result<Value, ControlError> {
        let args = self.args(command);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let executor = CommandExecutor::builder()
            .capture_output(true)
            .allow_failure(true)
            .build()
            .map_err(|e| ControlError::new(e.to_string()))?;
        let output = executor
            .execute_command_with_args(&self.cli.to_string_lossy(), &arg_refs)
            .map_err(|e| ControlError::new(format!("{e:#}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ControlError::new(stderr.trim()));
        }
        Ok(parse_response(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn fake_cli(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("bitcoin-cli");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_parse_response() {
        assert_eq!(parse_response("{\"blocks\": 5}\n")["blocks"], 5);
        assert_eq!(parse_response("42"), Value::from(42));
        assert_eq!(
            parse_response("Bitcoin server stopping\n"),
            Value::String("Bitcoin server stopping".into())
        );
    }

    #[test]
    fn test_cli_passes_datadir_port_and_command() {
        let dir = tempdir().unwrap();
        let cli = fake_cli(dir.path(), "echo \"[\\\"$1\\\", \\\"$2\\\", \\\"$3\\\", \\\"$4\\\"]\"");
        let control = CliControl::new(&cli, Path::new("/data"), 18443);

        let value = control.call("getblockhash 7").unwrap();
        assert_eq!(value[0], "-datadir=/data");
        assert_eq!(value[1], "-rpcport=18443");
        assert_eq!(value[2], "getblockhash");
        assert_eq!(value[3], "7");
    }

    #[test]
    fn test_cli_failure_carries_stderr() {
        let dir = tempdir().unwrap();
        let cli = fake_cli(
            dir.path(),
            "echo 'error code: -28\nerror message:\nLoading block index...' >&2; exit 28",
        );
        let control = CliControl::new(&cli, dir.path(), 1);

        let err = control.call("getblockchaininfo").unwrap_err();
        assert!(err.message.contains("Loading block index"));
    }
}
