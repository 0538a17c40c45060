use bitcoinperf::git::{GitError, GitRevisionResolver, GitSettings, RevisionSpec};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::{tempdir, TempDir};

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Test", "-c", "user.email=test@example.com"])
        .args(["-c", "commit.gpgsign=false"])
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_DATE", "2020-01-01T00:00:00Z")
        .env("GIT_COMMITTER_DATE", "2020-01-01T00:00:00Z")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

fn commit(dir: &Path, file: &str, contents: &str, msg: &str) -> String {
    fs::write(dir.join(file), contents).unwrap();
    git(dir, &["add", file]);
    git(dir, &["commit", "-m", msg]);
    git(dir, &["rev-parse", "HEAD"])
}

/// Upstream with two mainline commits and a fork holding two branches:
/// `feature` applies cleanly on mainline, `clash` conflicts with it
struct Fixture {
    dir: TempDir,
    base: String,
    tip: String,
    feature: String,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let upstream = dir.path().join("upstream");
        fs::create_dir_all(&upstream).unwrap();
        git(&upstream, &["init", "-q", "-b", "master"]);
        let base = commit(&upstream, "a.txt", "base\n", "Initial");

        let fork = dir.path().join("fork");
        git(
            dir.path(),
            &["clone", "-q", &upstream.to_string_lossy(), &fork.to_string_lossy()],
        );
        git(&fork, &["checkout", "-q", "-b", "feature"]);
        let feature = commit(&fork, "b.txt", "feature\n", "Add feature");
        git(&fork, &["checkout", "-q", "-b", "clash", &base]);
        commit(&fork, "a.txt", "fork\n", "Change a on fork");

        commit(&upstream, "c.txt", "more\n", "Mainline work");
        let tip = commit(&upstream, "a.txt", "main\n", "Change a on mainline");

        Self {
            dir,
            base,
            tip,
            feature,
        }
    }

    fn resolver(&self) -> GitRevisionResolver {
        GitRevisionResolver::new(GitSettings {
            upstream_url: self.dir.path().join("upstream").to_string_lossy().into_owned(),
            ..GitSettings::default()
        })
    }

    fn repo(&self) -> PathBuf {
        self.dir.path().join("work/bitcoin")
    }

    fn fork_url(&self) -> String {
        format!("file://{}", self.dir.path().join("fork").display())
    }
}

#[test]
fn test_resolves_branches_and_shas() {
    let fx = Fixture::new();
    let specs = vec![
        RevisionSpec::named("master"),
        RevisionSpec::named(&fx.base[..10]),
        RevisionSpec::named("no-such-branch"),
    ];
    let resolution = fx.resolver().resolve(&fx.repo(), &specs).unwrap();

    assert_eq!(resolution.resolved.len(), 2);
    let master = &resolution.resolved[0].checkout;
    assert_eq!(master.sha, fx.tip);
    assert_eq!(master.name, "master");
    assert_eq!(master.remote, "origin");
    assert_eq!(master.commit_msg, "Change a on mainline");
    assert_eq!(resolution.resolved[1].checkout.sha, fx.base);

    assert_eq!(resolution.unresolved, vec![RevisionSpec::named("no-such-branch")]);
}

#[test]
fn test_missing_pull_request_is_unresolved() {
    let fx = Fixture::new();
    let specs = vec![RevisionSpec::named("master"), RevisionSpec::named("pr/424242")];
    let resolution = fx.resolver().resolve(&fx.repo(), &specs).unwrap();

    assert_eq!(resolution.resolved.len(), 1);
    assert_eq!(resolution.resolved[0].checkout.sha, fx.tip);
    assert_eq!(resolution.unresolved, vec![RevisionSpec::named("pr/424242")]);
}

#[test]
fn test_fork_branch_and_merge_base() {
    let fx = Fixture::new();
    let specs = vec![
        RevisionSpec::merge_base(),
        RevisionSpec::named("feature").remote(fx.fork_url()),
    ];
    let resolution = fx.resolver().resolve(&fx.repo(), &specs).unwrap();

    assert!(resolution.unresolved.is_empty());
    let merge_base = &resolution.resolved[0].checkout;
    assert_eq!(merge_base.sha, fx.base);
    assert_eq!(merge_base.name, "master (merge-base)");

    let feature = &resolution.resolved[1].checkout;
    assert_eq!(feature.sha, fx.feature);
    assert_eq!(feature.remote, "fork");
    assert_eq!(feature.name, "fork/feature");
}

#[test]
fn test_rebase_is_deterministic() {
    let fx = Fixture::new();
    let resolver = fx.resolver();
    let specs = vec![RevisionSpec::named("feature").remote(fx.fork_url()).rebased()];

    let first = resolver.resolve(&fx.repo(), &specs).unwrap();
    let second = resolver.resolve(&fx.repo(), &specs).unwrap();

    let rebased = &first.resolved[0].checkout;
    assert_eq!(rebased.pre_rebase_sha.as_deref(), Some(fx.feature.as_str()));
    assert_ne!(rebased.sha, fx.feature);
    assert_eq!(git(&fx.repo(), &["rev-parse", &format!("{}^", rebased.sha)]), fx.tip);
    assert_eq!(second.resolved[0].checkout.sha, rebased.sha);
}

#[test]
fn test_merge_base_uses_pre_rebase_commit() {
    let fx = Fixture::new();
    let specs = vec![
        RevisionSpec::named("feature").remote(fx.fork_url()).rebased(),
        RevisionSpec::merge_base(),
    ];
    let resolution = fx.resolver().resolve(&fx.repo(), &specs).unwrap();

    assert_eq!(resolution.resolved[1].checkout.sha, fx.base);
}

#[test]
fn test_rebase_conflict_is_an_error() {
    let fx = Fixture::new();
    let specs = vec![RevisionSpec::named("clash").remote(fx.fork_url()).rebased()];
    let err = fx.resolver().resolve(&fx.repo(), &specs).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<GitError>(),
        Some(GitError::RebaseConflict { gitref, .. }) if gitref == "clash"
    ));
    // Clone is left usable for the next resolution
    let resolution = fx
        .resolver()
        .resolve(&fx.repo(), &[RevisionSpec::named("master")])
        .unwrap();
    assert_eq!(resolution.resolved[0].checkout.sha, fx.tip);
}
