//! Compiling a resolved checkout, with a cache of previously built trees.

pub mod cache;

pub use cache::{BuildCache, CacheError};

use anyhow::{Context, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::command::{git, CommandExecutor};
use crate::git::ResolvedCheckout;
use crate::process::{ProcessHandle, ProcessSpec};

/// Lines of `config.log` included in a configure failure
const CONFIG_LOG_TAIL_LINES: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Compiler {
    Gcc,
    Clang,
}

impl Compiler {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compiler::Gcc => "gcc",
            Compiler::Clang => "clang",
        }
    }

    pub fn cc(&self) -> &'static str {
        self.as_str()
    }

    pub fn cxx(&self) -> &'static str {
        match self {
            Compiler::Gcc => "g++",
            Compiler::Clang => "clang++",
        }
    }
}

impl std::fmt::Display for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("configure failed; tail of config.log:\n{log_tail}")]
    ConfigureFailed { log_tail: String },
    #[error("{binary} reports version {found:?}, expected commit {expected}")]
    VersionMismatch {
        binary: String,
        expected: String,
        found: String,
    },
    #[error("checkout of {sha} has commit message {found:?}, expected {expected:?}")]
    CheckoutMismatch {
        sha: String,
        expected: String,
        found: String,
    },
}

/// How to build a source tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    pub jobs: usize,
    pub configure_flags: String,
    /// Shell command run before autogen, e.g. to build bdb
    pub install_deps: Option<String>,
    pub autogen: String,
    /// Daemon binary relative to the source root; `bitcoin-cli` is expected next to it
    pub binary: PathBuf,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            jobs: 1,
            configure_flags: "--without-gui --disable-ccache".to_string(),
            install_deps: None,
            autogen: "./autogen.sh".to_string(),
            binary: PathBuf::from("src/bitcoind"),
        }
    }
}

/// Whether `version_output` identifies `checkout`.
///
/// Development builds embed an abbreviated commit id (optionally `g`
/// prefixed by git-describe); tagged releases only carry the tag.
pub fn version_matches(version_output: &str, checkout: &ResolvedCheckout) -> bool {
    let sha = checkout.sha.to_ascii_lowercase();
    let embeds_sha = version_output
        .split(|c: char| !c.is_ascii_alphanumeric())
        .map(|token| {
            token
                .strip_prefix('g')
                .filter(|rest| rest.len() >= 7)
                .unwrap_or(token)
        })
        .any(|token| {
            token.len() >= 7
                && token.chars().all(|c| c.is_ascii_hexdigit())
                && sha.starts_with(&token.to_ascii_lowercase())
        });
    if embeds_sha {
        return true;
    }

    let tag = checkout.gitref.trim_start_matches('v');
    tag.starts_with(|c: char| c.is_ascii_digit()) && version_output.contains(tag)
}

/// Run `binary -version` and check it was built from `checkout`
pub fn verify_version(binary: &Path, checkout: &ResolvedCheckout) -> Result<String> {
    let output = CommandExecutor::new()
        .stdout_of(&binary.to_string_lossy(), &["-version"])
        .with_context(|| format!("Failed to query version of {binary:?}"))?;
    let first_line = output.lines().next().unwrap_or_default().to_string();
    if !version_matches(&output, checkout) {
        return Err(BuildError::VersionMismatch {
            binary: binary.display().to_string(),
            expected: checkout.sha.clone(),
            found: first_line,
        }
        .into());
    }
    Ok(first_line)
}

/// Builds checkouts in a single source repository
pub struct Builder<'a> {
    repo: PathBuf,
    settings: BuildSettings,
    cache: Option<&'a BuildCache>,
    time_binary: Option<PathBuf>,
}

impl<'a> Builder<'a> {
    pub fn new(repo: &Path, settings: BuildSettings) -> Self {
        Self {
            repo: repo.to_path_buf(),
            settings,
            cache: None,
            time_binary: None,
        }
    }

    pub fn with_cache(mut self, cache: Option<&'a BuildCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_time_binary(mut self, time_binary: Option<PathBuf>) -> Self {
        self.time_binary = time_binary;
        self
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    pub fn binary_path(&self) -> PathBuf {
        self.repo.join(&self.settings.binary)
    }

    /// Build `checkout` with `compiler`.
    ///
    /// Returns `None` when a cached build was restored, otherwise the finished
    /// compile process for the caller to inspect and report.
    pub fn build(
        &self,
        checkout: &ResolvedCheckout,
        compiler: Compiler,
    ) -> Result<Option<ProcessHandle>> {
        self.checkout(checkout)?;

        if let Some(cache) = self.cache {
            match cache.restore(
                &self.repo,
                checkout,
                compiler,
                &self.settings.configure_flags,
                &self.settings.binary,
            ) {
                Ok(true) => return Ok(None),
                Ok(false) => {}
                Err(e) => {
                    warn!("Cache restore failed, doing a full build: {e:#}");
                    self.checkout(checkout)?;
                }
            }
        }

        info!("[{}] building with {compiler}", checkout.name);
        self.prepare(compiler)?;

        let jobs = self.settings.jobs.max(1);
        let spec = ProcessSpec::new(format!("make-{}", checkout.name), "make")
            .args([format!("-j{jobs}")])
            .working_dir(&self.repo)
            .env("CC", compiler.cc())
            .env("CXX", compiler.cxx())
            .timed(self.time_binary.clone());
        let mut handle = ProcessHandle::spawn(&spec)?;
        let status = handle.wait()?;

        if !status.success() {
            error!("{}", handle.failure_report());
            return Ok(Some(handle));
        }
        info!(
            "[{}] compiled in {:.1}s",
            checkout.name,
            handle.total_secs()
        );

        let version = verify_version(&self.binary_path(), checkout)?;
        info!("[{}] built {version}", checkout.name);

        if let Some(cache) = self.cache {
            let flags = &self.settings.configure_flags;
            if let Err(e) = cache.save(&self.repo, checkout, compiler, flags) {
                warn!("Failed to cache build: {e:#}");
            } else if let Err(e) = cache.evict() {
                warn!("Failed to evict old cache entries: {e:#}");
            }
        }
        Ok(Some(handle))
    }

    /// Force the working tree to `checkout.sha` and check we got what was resolved
    fn checkout(&self, checkout: &ResolvedCheckout) -> Result<()> {
        git(&self.repo, &["checkout", "--force", "--detach", &checkout.sha])
            .with_context(|| format!("Failed to check out {}", checkout.sha))?;
        git(&self.repo, &["clean", "-fdxq"])?;

        let found = git(&self.repo, &["log", "-1", "--pretty=%B"])?;
        if found.trim() != checkout.commit_msg.trim() {
            return Err(BuildError::CheckoutMismatch {
                sha: checkout.sha.clone(),
                expected: checkout.commit_msg.clone(),
                found,
            }
            .into());
        }
        Ok(())
    }

    fn shell(&self, compiler: Compiler) -> Result<CommandExecutor> {
        CommandExecutor::builder()
            .capture_output(true)
            .working_dir(Some(&self.repo))
            .env_var("CC", compiler.cc())
            .env_var("CXX", compiler.cxx())
            .build()
    }

    /// Dependencies, autogen and configure
    fn prepare(&self, compiler: Compiler) -> Result<()> {
        if let Some(install) = &self.settings.install_deps {
            self.shell(compiler)?
                .execute_shell(install)
                .context("Dependency installation failed")?;
        }
        self.shell(compiler)?
            .execute_shell(&self.settings.autogen)
            .context("autogen failed")?;

        let configure = format!("./configure {}", self.settings.configure_flags);
        let output = CommandExecutor::builder()
            .capture_output(true)
            .allow_failure(true)
            .working_dir(Some(&self.repo))
            .env_var("CC", compiler.cc())
            .env_var("CXX", compiler.cxx())
            .build()?
            .execute_shell(&configure)?;
        if !output.status.success() {
            let log = std::fs::read_to_string(self.repo.join("config.log")).unwrap_or_default();
            let lines: Vec<&str> = log.lines().collect();
            let start = lines.len().saturating_sub(CONFIG_LOG_TAIL_LINES);
            return Err(BuildError::ConfigureFailed {
                log_tail: lines[start..].join("\n"),
            }
            .into());
        }
        Ok(())
    }
}
