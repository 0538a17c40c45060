use anyhow::{Context, Result};
use log::debug;
use std::collections::HashMap;
use std::fmt::Debug;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};

/// Command execution context
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    /// Name of the command for logging
    pub command_name: Option<String>,
    /// Current working directory
    pub working_dir: Option<String>,
    /// Environment variables to set
    pub env_vars: HashMap<String, String>,
    /// Whether to create a process group
    pub process_group: bool,
    /// Capture output
    pub capture_output: bool,
    /// Allow command to fail without returning an error
    pub allow_failure: bool,
}

/// Builder for CommandExecutor
pub struct CommandExecutorBuilder {
    context: CommandContext,
}

impl Default for CommandExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutorBuilder {
    /// Create a new CommandExecutorBuilder with default settings
    pub fn new() -> Self {
        Self {
            context: CommandContext::default(),
        }
    }

    /// Set whether to capture command output
    pub fn capture_output(mut self, capture: bool) -> Self {
        self.context.capture_output = capture;
        self
    }

    /// Set the working directory
    pub fn working_dir<P: AsRef<Path>>(mut self, dir: Option<P>) -> Self {
        self.context.working_dir = dir.map(|d| d.as_ref().to_string_lossy().to_string());
        self
    }

    /// Put the spawned command in its own process group (pgid == pid)
    pub fn process_group(mut self, create_group: bool) -> Self {
        self.context.process_group = create_group;
        self
    }

    /// Add environment variables
    pub fn env_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.context.env_vars.extend(vars);
        self
    }

    /// Add a single environment variable
    pub fn env_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.env_vars.insert(key.into(), value.into());
        self
    }

    /// Set whether to allow command failures without returning an error
    pub fn allow_failure(mut self, allow: bool) -> Self {
        self.context.allow_failure = allow;
        self
    }

    /// Set a name for the command for logging purposes
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.context.command_name = Some(name.into());
        self
    }

    /// Build the CommandExecutor
    pub fn build(self) -> Result<CommandExecutor> {
        if let Some(dir) = &self.context.working_dir {
            if !Path::new(dir).is_dir() {
                anyhow::bail!("Working directory does not exist: {dir}");
            }
        }

        Ok(CommandExecutor {
            context: self.context,
        })
    }
}

/// A unified interface for executing external commands (git, make, bitcoin-cli, ...)
pub struct CommandExecutor {
    context: CommandContext,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor {
    /// Create a new CommandExecutor capturing output
    pub fn new() -> Self {
        Self {
            context: CommandContext {
                capture_output: true,
                ..CommandContext::default()
            },
        }
    }

    /// Create a builder for CommandExecutor with fluent configuration
    pub fn builder() -> CommandExecutorBuilder {
        CommandExecutorBuilder::new()
    }

    /// Create a CommandExecutor with a specific context
    pub fn with_context(context: CommandContext) -> Self {
        Self { context }
    }

    /// Execute a shell command line and wait for it to complete, returning the output
    pub fn execute_shell(&self, cmd_line: &str) -> Result<Output> {
        self.execute_command_with_args("sh", &["-c", cmd_line])
    }

    /// Execute a command with arguments and wait for it to complete, returning the output
    pub fn execute_command_with_args(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        let child = self.launch_command(cmd, args)?;

        let output = child.wait_with_output().with_context(|| {
            format!(
                "Failed to wait for command completion: {}",
                self.format_command(cmd, args)
            )
        })?;

        if !output.status.success() && !self.context.allow_failure {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!(
                "Command failed with status {}: {}\nStderr: {}",
                output.status.code().unwrap_or(-1),
                self.format_command(cmd, args),
                stderr
            ));
        }

        Ok(output)
    }

    /// Execute a command and return its trimmed stdout
    pub fn stdout_of(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let output = self.execute_command_with_args(cmd, args)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Execute a command and launch it, returning the child process handle
    pub fn launch_command(&self, cmd: &str, args: &[&str]) -> Result<Child> {
        let command_str = self.format_command(cmd, args);
        debug!("Launching command: {}", command_str);

        let mut command = Command::new(cmd);
        command.args(args);

        if let Some(dir) = &self.context.working_dir {
            command.current_dir(dir);
        }

        for (key, value) in &self.context.env_vars {
            command.env(key, value);
        }

        command.stdin(Stdio::null());
        if self.context.capture_output {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        if self.context.process_group {
            command.process_group(0);
        }

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn command: {}", command_str))?;

        Ok(child)
    }

    /// Format command and arguments for logging
    fn format_command(&self, cmd: &str, args: &[&str]) -> String {
        if let Some(name) = &self.context.command_name {
            return name.clone();
        }

        format!("{} {}", cmd, args.join(" "))
    }
}

/// Shorthand for running `git` inside a repository checkout
pub fn git(repo: &Path, args: &[&str]) -> Result<String> {
    CommandExecutor::builder()
        .capture_output(true)
        .working_dir(Some(repo))
        .build()?
        .stdout_of("git", args)
}

/// Like [`git`] but reports failure as `Ok(None)` instead of an error
pub fn git_opt(repo: &Path, args: &[&str]) -> Result<Option<String>> {
    let output = CommandExecutor::builder()
        .capture_output(true)
        .working_dir(Some(repo))
        .allow_failure(true)
        .build()?
        .execute_command_with_args("git", args)?;
    if output.status.success() {
        Ok(Some(String::from_utf8_lossy(&output.stdout).trim().to_string()))
    } else {
        debug!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let executor = CommandExecutor::builder()
            .name("test command")
            .working_dir(Some("/tmp"))
            .capture_output(true)
            .process_group(true)
            .env_var("TEST_VAR", "test_value")
            .allow_failure(true)
            .build()
            .unwrap();

        assert_eq!(
            executor.context.command_name,
            Some("test command".to_string())
        );
        assert_eq!(executor.context.working_dir, Some("/tmp".to_string()));
        assert!(executor.context.capture_output);
        assert!(executor.context.process_group);
        assert_eq!(
            executor.context.env_vars.get("TEST_VAR"),
            Some(&"test_value".to_string())
        );
        assert!(executor.context.allow_failure);
    }

    #[test]
    fn test_builder_rejects_missing_working_dir() {
        let result = CommandExecutor::builder()
            .working_dir(Some("/definitely/not/a/dir"))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_execute_shell_success() {
        let output = CommandExecutor::new()
            .execute_shell("echo 'hello world'")
            .unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello world"));
    }

    #[test]
    fn test_stdout_of_trims() {
        let out = CommandExecutor::new()
            .stdout_of("echo", &["  spaced  "])
            .unwrap();
        assert_eq!(out, "spaced");
    }

    #[test]
    fn test_execute_with_env_vars() {
        let executor = CommandExecutor::builder()
            .capture_output(true)
            .env_var("TEST_ENV_VAR", "test_value")
            .build()
            .unwrap();

        let output = executor.execute_shell("echo $TEST_ENV_VAR").unwrap();
        assert!(String::from_utf8_lossy(&output.stdout).contains("test_value"));
    }

    #[test]
    fn test_command_failure_handling() {
        let strict = CommandExecutor::builder()
            .capture_output(true)
            .build()
            .unwrap();
        assert!(strict.execute_shell("false").is_err());

        let lenient = CommandExecutor::builder()
            .capture_output(true)
            .allow_failure(true)
            .build()
            .unwrap();
        let result = lenient.execute_shell("false");
        assert!(result.is_ok());
        assert!(!result.unwrap().status.success());
    }

    #[test]
    fn test_format_command() {
        let named = CommandExecutor::builder().name("test command").build().unwrap();
        assert_eq!(named.format_command("echo", &["hello", "world"]), "test command");

        let unnamed = CommandExecutor::builder().build().unwrap();
        assert_eq!(
            unnamed.format_command("echo", &["hello", "world"]),
            "echo hello world"
        );
    }
}
