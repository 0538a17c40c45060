//! Turning user supplied refs into exact commits in a local clone.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use url::Url;

use crate::command::{git, git_opt};

/// Config spelling of the merge-base marker
pub const MERGE_BASE_MARKER: &str = "$mergebase";

/// Identity used for commits created while rebasing
const REBASE_USER_NAME: &str = "Bitcoinperf";
const REBASE_USER_EMAIL: &str = "bench@bitcoinperf.com";

/// A ref as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RefSpec {
    /// Branch, tag, sha or `pr/<number>`
    Named(String),
    /// Merge base of mainline and the one other target
    MergeBase,
}

impl From<String> for RefSpec {
    fn from(raw: String) -> Self {
        if raw == MERGE_BASE_MARKER {
            RefSpec::MergeBase
        } else {
            RefSpec::Named(raw)
        }
    }
}

impl From<RefSpec> for String {
    fn from(spec: RefSpec) -> Self {
        match spec {
            RefSpec::Named(name) => name,
            RefSpec::MergeBase => MERGE_BASE_MARKER.to_string(),
        }
    }
}

impl std::fmt::Display for RefSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefSpec::Named(name) => f.write_str(name),
            RefSpec::MergeBase => f.write_str(MERGE_BASE_MARKER),
        }
    }
}

/// What the user asked to benchmark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionSpec {
    pub gitref: RefSpec,
    /// Remote name or URL; mainline when absent
    #[serde(default)]
    pub remote: Option<String>,
    /// Extra daemon flags used whenever this revision is benchmarked
    #[serde(default)]
    pub bitcoind_extra_args: Vec<String>,
    /// Rebase onto mainline tip before building
    #[serde(default)]
    pub rebase: bool,
}

impl RevisionSpec {
    pub fn named(gitref: impl Into<String>) -> Self {
        Self {
            gitref: RefSpec::Named(gitref.into()),
            remote: None,
            bitcoind_extra_args: Vec::new(),
            rebase: false,
        }
    }

    pub fn merge_base() -> Self {
        Self {
            gitref: RefSpec::MergeBase,
            ..Self::named("")
        }
    }

    pub fn remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    pub fn rebased(mut self) -> Self {
        self.rebase = true;
        self
    }
}

/// A revision pinned to an exact commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCheckout {
    pub gitref: String,
    pub remote: String,
    pub sha: String,
    pub commit_msg: String,
    /// Display name used in logs and results
    pub name: String,
    /// Commit before rebasing, when a rebase happened
    pub pre_rebase_sha: Option<String>,
}

impl ResolvedCheckout {
    pub fn short_sha(&self) -> &str {
        &self.sha[..self.sha.len().min(12)]
    }
}

/// A spec and the checkout it resolved to
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub spec: RevisionSpec,
    pub checkout: ResolvedCheckout,
}

/// Outcome of [`GitRevisionResolver::resolve`]
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub resolved: Vec<ResolvedTarget>,
    pub unresolved: Vec<RevisionSpec>,
}

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("rebase of {gitref} onto {onto} hit conflicts")]
    RebaseConflict { gitref: String, onto: String },
    #[error("merge-base needs exactly one other target, got {0}")]
    MergeBaseArity(usize),
}

/// Where the mainline repository and forks live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GitSettings {
    pub upstream_url: String,
    /// `{}` is replaced by the remote name
    pub remote_url_template: String,
    pub mainline_remote: String,
    pub mainline_branch: String,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            upstream_url: "https://github.com/bitcoin/bitcoin.git".to_string(),
            remote_url_template: "https://github.com/{}/bitcoin.git".to_string(),
            mainline_remote: "origin".to_string(),
            mainline_branch: "master".to_string(),
        }
    }
}

fn is_url(remote: &str) -> bool {
    if let Ok(url) = Url::parse(remote) {
        if matches!(url.scheme(), "http" | "https" | "git" | "ssh" | "file") {
            return true;
        }
    }
    remote.starts_with("git@") && remote.contains(':')
}

fn looks_like_sha(gitref: &str) -> bool {
    (7..=40).contains(&gitref.len()) && gitref.chars().all(|c| c.is_ascii_hexdigit())
}

fn pr_number(gitref: &str) -> Option<&str> {
    gitref
        .strip_prefix("pr/")
        .filter(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
}

/// Resolves [`RevisionSpec`]s against a local clone of mainline
pub struct GitRevisionResolver {
    settings: GitSettings,
}

impl GitRevisionResolver {
    pub fn new(settings: GitSettings) -> Self {
        Self { settings }
    }

    /// Local name of a spec's remote
    pub fn remote_name(&self, spec: &RevisionSpec) -> String {
        match spec.remote.as_deref() {
            None => self.settings.mainline_remote.clone(),
            Some(remote) if is_url(remote) => {
                let last = remote
                    .trim_end_matches('/')
                    .rsplit(['/', ':'])
                    .next()
                    .unwrap_or(remote);
                crate::path_utils::sanitize_component(last.trim_end_matches(".git"))
            }
            Some(remote) => remote.to_string(),
        }
    }

    /// Fetch URL of a spec's remote
    pub fn remote_url(&self, spec: &RevisionSpec) -> String {
        match spec.remote.as_deref() {
            None => self.settings.upstream_url.clone(),
            Some(remote) if is_url(remote) => remote.to_string(),
            Some(remote) => self.settings.remote_url_template.replace("{}", remote),
        }
    }

    fn mainline_tip(&self) -> String {
        format!(
            "{}/{}",
            self.settings.mainline_remote, self.settings.mainline_branch
        )
    }

    /// Resolve every spec to an exact commit.
    ///
    /// Refs that cannot be found or fetched are returned in `unresolved`; everything
    /// else that goes wrong (git failures, rebase conflicts, a misused
    /// merge-base marker) is an error.
    pub fn resolve(&self, repo: &Path, specs: &[RevisionSpec]) -> Result<Resolution> {
        let merge_base_count = specs
            .iter()
            .filter(|s| s.gitref == RefSpec::MergeBase)
            .count();
        if merge_base_count > 1 || (merge_base_count == 1 && specs.len() != 2) {
            return Err(GitError::MergeBaseArity(specs.len() - merge_base_count).into());
        }

        let unfetched = self.prepare_repository(repo, specs)?;

        let mut resolution = Resolution::default();
        let mut slots: Vec<Option<ResolvedTarget>> = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let RefSpec::Named(gitref) = &spec.gitref else {
                slots.push(None);
                continue;
            };
            let found = if unfetched.contains(&index) {
                None
            } else {
                self.resolve_named(repo, spec, gitref)?
            };
            match found {
                Some(checkout) => slots.push(Some(ResolvedTarget {
                    spec: spec.clone(),
                    checkout,
                })),
                None => {
                    warn!("Could not resolve {gitref} (remote {})", self.remote_name(spec));
                    resolution.unresolved.push(spec.clone());
                    slots.push(None);
                }
            }
        }

        if merge_base_count == 1 {
            let other = slots.iter().flatten().next().map(|t| t.checkout.clone());
            let index = specs
                .iter()
                .position(|s| s.gitref == RefSpec::MergeBase)
                .context("merge-base spec vanished")?;
            match other {
                Some(other) => {
                    let checkout = self.resolve_merge_base(repo, &other)?;
                    slots[index] = Some(ResolvedTarget {
                        spec: specs[index].clone(),
                        checkout,
                    });
                }
                None => resolution.unresolved.push(specs[index].clone()),
            }
        }

        resolution.resolved = slots.into_iter().flatten().collect();
        for target in &resolution.resolved {
            info!(
                "Resolved {} to {} ({})",
                target.checkout.name,
                target.checkout.short_sha(),
                target.checkout.commit_msg.lines().next().unwrap_or_default()
            );
        }
        Ok(resolution)
    }

    /// Clone if needed, add and fetch remotes, reset to mainline tip.
    ///
    /// Returns the indices of `pr/<n>` specs whose pull request could not be
    /// fetched.
    fn prepare_repository(
        &self,
        repo: &Path,
        specs: &[RevisionSpec],
    ) -> Result<BTreeSet<usize>> {
        if !repo.join(".git").exists() {
            info!("Cloning {} into {}", self.settings.upstream_url, repo.display());
            if let Some(parent) = repo.parent() {
                crate::path_utils::ensure_directory(parent)?;
            }
            let parent = repo.parent().unwrap_or(Path::new("."));
            git(
                parent,
                &[
                    "clone",
                    "--origin",
                    &self.settings.mainline_remote,
                    &self.settings.upstream_url,
                    &repo.to_string_lossy(),
                ],
            )
            .with_context(|| format!("Failed to clone {}", self.settings.upstream_url))?;
        }

        let mut fetched = BTreeSet::new();
        for spec in specs.iter().filter(|s| s.remote.is_some()) {
            let name = self.remote_name(spec);
            if name == self.settings.mainline_remote || !fetched.insert(name.clone()) {
                continue;
            }
            let url = self.remote_url(spec);
            if git_opt(repo, &["remote", "get-url", &name])?.is_none() {
                debug!("Adding remote {name} -> {url}");
                git(repo, &["remote", "add", &name, &url])?;
            }
            git(repo, &["fetch", "--tags", &name])
                .with_context(|| format!("Failed to fetch remote {name}"))?;
        }

        // Leftovers from an interrupted run
        git_opt(repo, &["rebase", "--abort"])?;

        git(repo, &["fetch", "--tags", &self.settings.mainline_remote])
            .context("Failed to fetch mainline")?;
        let tip = self.mainline_tip();
        git(repo, &["checkout", "--force", "--detach", &tip])?;
        git(repo, &["reset", "--hard", &tip])?;

        let mut unfetched = BTreeSet::new();
        for (index, spec) in specs.iter().enumerate() {
            let RefSpec::Named(gitref) = &spec.gitref else {
                continue;
            };
            if let Some(number) = pr_number(gitref) {
                let remote = self.remote_name(spec);
                let refspec = format!("pull/{number}/head:refs/remotes/{remote}/pr/{number}");
                if git_opt(repo, &["fetch", "--force", &remote, &refspec])?.is_none() {
                    warn!("Failed to fetch {gitref} from {remote}");
                    unfetched.insert(index);
                }
            }
        }
        Ok(unfetched)
    }

    fn rev_parse_commit(repo: &Path, rev: &str) -> Result<Option<String>> {
        git_opt(repo, &["rev-parse", "--verify", "--quiet", &format!("{rev}^{{commit}}")])
    }

    fn resolve_named(
        &self,
        repo: &Path,
        spec: &RevisionSpec,
        gitref: &str,
    ) -> Result<Option<ResolvedCheckout>> {
        let remote = self.remote_name(spec);

        let mut sha = None;
        if looks_like_sha(gitref) {
            if let Some(kind) = git_opt(repo, &["cat-file", "-t", gitref])? {
                if kind == "commit" {
                    sha = Self::rev_parse_commit(repo, gitref)?;
                }
            }
        }
        if sha.is_none() {
            sha = match Self::rev_parse_commit(repo, &format!("{remote}/{gitref}"))? {
                Some(sha) => Some(sha),
                None => Self::rev_parse_commit(repo, gitref)?,
            };
        }
        let Some(sha) = sha else {
            return Ok(None);
        };

        let name = if remote == self.settings.mainline_remote {
            gitref.to_string()
        } else {
            format!("{remote}/{gitref}")
        };

        let (sha, pre_rebase_sha) = if spec.rebase {
            (self.rebase_onto_mainline(repo, &sha, gitref)?, Some(sha))
        } else {
            (sha, None)
        };

        Ok(Some(ResolvedCheckout {
            gitref: gitref.to_string(),
            remote,
            commit_msg: commit_message(repo, &sha)?,
            sha,
            name,
            pre_rebase_sha,
        }))
    }

    /// Replay `sha` onto mainline tip; deterministic for unchanged inputs
    fn rebase_onto_mainline(&self, repo: &Path, sha: &str, gitref: &str) -> Result<String> {
        let tip = self.mainline_tip();
        git(repo, &["config", "user.name", REBASE_USER_NAME])?;
        git(repo, &["config", "user.email", REBASE_USER_EMAIL])?;
        git(repo, &["checkout", "--force", "--detach", sha])?;

        // Pin committer dates so resolving twice yields the same commits
        let tip_date = git(repo, &["log", "-1", "--format=%cI", &tip])?;
        let output = crate::command::CommandExecutor::builder()
            .capture_output(true)
            .allow_failure(true)
            .working_dir(Some(repo))
            .env_var("GIT_COMMITTER_DATE", tip_date)
            .env_var("GIT_COMMITTER_NAME", REBASE_USER_NAME)
            .env_var("GIT_COMMITTER_EMAIL", REBASE_USER_EMAIL)
            .build()?
            .execute_command_with_args("git", &["rebase", &tip])?;

        if !output.status.success() {
            debug!("rebase output: {}", String::from_utf8_lossy(&output.stdout));
            git_opt(repo, &["rebase", "--abort"])?;
            return Err(GitError::RebaseConflict {
                gitref: gitref.to_string(),
                onto: tip,
            }
            .into());
        }
        let rebased = git(repo, &["rev-parse", "HEAD"])?;
        info!("Rebased {gitref} onto {tip}: {sha} -> {rebased}");
        Ok(rebased)
    }

    fn resolve_merge_base(
        &self,
        repo: &Path,
        other: &ResolvedCheckout,
    ) -> Result<ResolvedCheckout> {
        let against = other.pre_rebase_sha.as_deref().unwrap_or(&other.sha);
        let tip = self.mainline_tip();
        let sha = git(repo, &["merge-base", &tip, against])
            .with_context(|| format!("No merge base between {tip} and {against}"))?;
        Ok(ResolvedCheckout {
            gitref: self.settings.mainline_branch.clone(),
            remote: self.settings.mainline_remote.clone(),
            commit_msg: commit_message(repo, &sha)?,
            sha,
            name: format!("{} (merge-base)", self.settings.mainline_branch),
            pre_rebase_sha: None,
        })
    }
}

fn commit_message(repo: &Path, sha: &str) -> Result<String> {
    git(repo, &["log", "-1", "--pretty=%B", sha])
}
