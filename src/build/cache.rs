use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{verify_version, Compiler};
use crate::git::ResolvedCheckout;
use crate::path_utils;

/// Metadata file written at the root of every cache entry
pub const STAMP_FILE: &str = ".bitcoinperf-cache.json";

/// Length of the hash part of a key, in hex characters
const KEY_HASH_LEN: usize = 16;
const KEY_REF_LEN: usize = 40;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache entry {key} failed verification and was deleted: {reason}")]
    IntegrityMismatch { key: String, reason: String },
}

/// Contents of [`STAMP_FILE`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub sha: String,
    pub gitref: String,
    pub compiler: Compiler,
    pub configure_flags: String,
    pub saved_at: String,
}

/// On-disk cache of built source trees.
///
/// Entries are keyed by (commit, compiler, configure flags). Writers copy
/// into a private temporary directory and rename it into place, so a reader
/// never sees a half written entry.
#[derive(Debug, Clone)]
pub struct BuildCache {
    root: PathBuf,
    max_entries: usize,
}

impl BuildCache {
    pub fn new(root: &Path, max_entries: usize) -> Self {
        Self {
            root: root.to_path_buf(),
            max_entries,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key(checkout: &ResolvedCheckout, compiler: Compiler, configure_flags: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(checkout.sha.as_bytes());
        hasher.update([0]);
        hasher.update(compiler.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(configure_flags.as_bytes());
        let digest: String = hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();

        let mut fragment = path_utils::sanitize_component(&checkout.gitref);
        fragment.truncate(KEY_REF_LEN);
        if fragment.is_empty() {
            fragment.push_str("ref");
        }
        format!("{fragment}-{}", &digest[..KEY_HASH_LEN])
    }

    pub fn entry_path(
        &self,
        checkout: &ResolvedCheckout,
        compiler: Compiler,
        configure_flags: &str,
    ) -> PathBuf {
        self.root.join(Self::key(checkout, compiler, configure_flags))
    }

    pub fn contains(&self, checkout: &ResolvedCheckout, compiler: Compiler, flags: &str) -> bool {
        self.entry_path(checkout, compiler, flags)
            .join(STAMP_FILE)
            .is_file()
    }

    fn write_stamp(dir: &Path, meta: &CacheEntryMeta) -> Result<()> {
        let json = serde_json::to_string_pretty(meta)?;
        fs::write(dir.join(STAMP_FILE), json)
            .with_context(|| format!("Failed to write cache stamp in {dir:?}"))
    }

    /// Copy the built tree at `source` into the cache; last writer wins
    pub fn save(
        &self,
        source: &Path,
        checkout: &ResolvedCheckout,
        compiler: Compiler,
        configure_flags: &str,
    ) -> Result<PathBuf> {
        path_utils::ensure_directory(&self.root)?;
        let key = Self::key(checkout, compiler, configure_flags);
        let entry = self.root.join(&key);
        let staging = self
            .root
            .join(format!(".tmp-{key}-{}", std::process::id()));
        path_utils::remove_dir_if_exists(&staging)?;

        let copied = path_utils::copy_dir_recursive(source, &staging, &[".git", STAMP_FILE])
            .and_then(|n| {
                Self::write_stamp(
                    &staging,
                    &CacheEntryMeta {
                        sha: checkout.sha.clone(),
                        gitref: checkout.gitref.clone(),
                        compiler,
                        configure_flags: configure_flags.to_string(),
                        saved_at: chrono::Utc::now().to_rfc3339(),
                    },
                )?;
                Ok(n)
            });
        let copied = match copied {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(e.context(format!("Failed to save cache entry {key}")));
            }
        };

        path_utils::remove_dir_if_exists(&entry)?;
        fs::rename(&staging, &entry)
            .with_context(|| format!("Failed to move {staging:?} into place"))?;
        info!("Cached build {key} ({copied} files)");
        Ok(entry)
    }

    /// Copy a cached tree into `dest` and verify the binary it contains.
    ///
    /// `Ok(false)` when there is no entry. A binary whose version does not
    /// match the checkout gets the entry deleted and a
    /// [`CacheError::IntegrityMismatch`].
    pub fn restore(
        &self,
        dest: &Path,
        checkout: &ResolvedCheckout,
        compiler: Compiler,
        configure_flags: &str,
        binary: &Path,
    ) -> Result<bool> {
        let key = Self::key(checkout, compiler, configure_flags);
        let entry = self.root.join(&key);
        if !entry.join(STAMP_FILE).is_file() {
            debug!("No cache entry {key}");
            return Ok(false);
        }

        path_utils::copy_dir_recursive(&entry, dest, &[STAMP_FILE])
            .with_context(|| format!("Failed to restore cache entry {key}"))?;

        if let Err(e) = verify_version(&dest.join(binary), checkout) {
            warn!("Deleting cache entry {key}: {e:#}");
            path_utils::remove_dir_if_exists(&entry)?;
            return Err(CacheError::IntegrityMismatch {
                key,
                reason: format!("{e:#}"),
            }
            .into());
        }

        // Mark as recently used
        let stamp = entry.join(STAMP_FILE);
        if let Ok(file) = fs::File::options().write(true).open(&stamp) {
            let _ = file.set_modified(SystemTime::now());
        }
        info!("Restored build {key} from cache");
        Ok(true)
    }

    /// Entries with their last-used time, most recent first
    pub fn entries(&self) -> Result<Vec<(PathBuf, SystemTime)>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dirent in fs::read_dir(&self.root)? {
            let dirent = dirent?;
            let path = dirent.path();
            if dirent.file_name().to_string_lossy().starts_with('.') || !path.is_dir() {
                continue;
            }
            let stamp = path.join(STAMP_FILE);
            let used = fs::metadata(&stamp)
                .or_else(|_| fs::metadata(&path))
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((path, used));
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(entries)
    }

    /// Remove all but the `max_entries` most recently used entries
    pub fn evict(&self) -> Result<Vec<PathBuf>> {
        self.evict_to(self.max_entries)
    }

    pub fn evict_to(&self, keep: usize) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for (path, _) in self.entries()?.into_iter().skip(keep) {
            info!("Evicting cached build {path:?}");
            path_utils::remove_dir_if_exists(&path)?;
            removed.push(path);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::tempdir;

    fn checkout(sha: &str, gitref: &str) -> ResolvedCheckout {
        ResolvedCheckout {
            gitref: gitref.to_string(),
            remote: "origin".to_string(),
            sha: sha.to_string(),
            commit_msg: "msg".to_string(),
            name: gitref.to_string(),
            pre_rebase_sha: None,
        }
    }

    /// A "built" tree whose daemon prints a version containing `version_sha`
    fn built_tree(dir: &Path, version_sha: &str) {
        fs::create_dir_all(dir.join("src")).unwrap();
        fs::create_dir_all(dir.join(".git")).unwrap();
        fs::write(dir.join(".git/HEAD"), "ref").unwrap();
        let bin = dir.join("src/bitcoind");
        fs::write(
            &bin,
            format!(
                "#!/bin/sh\necho \"Bitcoin Core version v0.19.99.0-{}\"\n",
                &version_sha[..12]
            ),
        )
        .unwrap();
        fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
    }

    const SHA_A: &str = "e59c59c7bd0a1b2c3d4e5f60718293a4b5c6d7e8";
    const SHA_B: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_key_depends_on_all_inputs() {
        let a = checkout(SHA_A, "master");
        let k = BuildCache::key(&a, Compiler::Gcc, "--without-gui");
        assert!(k.starts_with("master-"));
        assert_ne!(k, BuildCache::key(&a, Compiler::Clang, "--without-gui"));
        assert_ne!(k, BuildCache::key(&a, Compiler::Gcc, ""));
        assert_ne!(
            k,
            BuildCache::key(&checkout(SHA_B, "master"), Compiler::Gcc, "--without-gui")
        );
        assert!(BuildCache::key(&checkout(SHA_A, "pr/123"), Compiler::Gcc, "").starts_with("pr_123-"));
    }

    #[test]
    fn test_save_then_restore() {
        let tmp = tempdir().unwrap();
        let cache = BuildCache::new(&tmp.path().join("cache"), 5);
        let src = tmp.path().join("src-tree");
        built_tree(&src, SHA_A);
        let co = checkout(SHA_A, "master");

        assert!(!cache.contains(&co, Compiler::Gcc, ""));
        let entry = cache.save(&src, &co, Compiler::Gcc, "").unwrap();
        assert!(cache.contains(&co, Compiler::Gcc, ""));
        assert!(!entry.join(".git").exists());

        let dest = tmp.path().join("dest");
        let restored = cache
            .restore(&dest, &co, Compiler::Gcc, "", Path::new("src/bitcoind"))
            .unwrap();
        assert!(restored);
        assert!(dest.join("src/bitcoind").is_file());
        assert!(!dest.join(STAMP_FILE).exists());
    }

    #[test]
    fn test_restore_missing_entry() {
        let tmp = tempdir().unwrap();
        let cache = BuildCache::new(tmp.path(), 5);
        let restored = cache
            .restore(
                &tmp.path().join("dest"),
                &checkout(SHA_A, "master"),
                Compiler::Clang,
                "",
                Path::new("src/bitcoind"),
            )
            .unwrap();
        assert!(!restored);
    }

    #[test]
    fn test_restore_with_wrong_version_deletes_entry() {
        let tmp = tempdir().unwrap();
        let cache = BuildCache::new(&tmp.path().join("cache"), 5);
        let src = tmp.path().join("src-tree");
        // Binary reports a different commit than the key claims
        built_tree(&src, SHA_B);
        let co = checkout(SHA_A, "master");
        cache.save(&src, &co, Compiler::Gcc, "").unwrap();

        let err = cache
            .restore(
                &tmp.path().join("dest"),
                &co,
                Compiler::Gcc,
                "",
                Path::new("src/bitcoind"),
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::IntegrityMismatch { .. })
        ));
        assert!(!cache.contains(&co, Compiler::Gcc, ""));
    }

    #[test]
    fn test_evict_keeps_most_recent() {
        let tmp = tempdir().unwrap();
        let cache = BuildCache::new(&tmp.path().join("cache"), 2);
        let src = tmp.path().join("src-tree");
        built_tree(&src, SHA_A);

        let now = SystemTime::now();
        let mut entries = Vec::new();
        for (i, gitref) in ["one", "two", "three"].iter().enumerate() {
            let entry = cache
                .save(&src, &checkout(SHA_A, gitref), Compiler::Gcc, "")
                .unwrap();
            let stamp = fs::File::options()
                .write(true)
                .open(entry.join(STAMP_FILE))
                .unwrap();
            stamp
                .set_modified(now - Duration::from_secs(100 * (3 - i as u64)))
                .unwrap();
            entries.push(entry);
        }

        let removed = cache.evict().unwrap();
        assert_eq!(removed, vec![entries[0].clone()]);
        assert!(!entries[0].exists());
        assert!(entries[1].exists() && entries[2].exists());
        assert_eq!(cache.entries().unwrap().len(), 2);
    }

    #[test]
    fn test_save_overwrites_existing_entry() {
        let tmp = tempdir().unwrap();
        let cache = BuildCache::new(&tmp.path().join("cache"), 5);
        let src = tmp.path().join("src-tree");
        built_tree(&src, SHA_A);
        let co = checkout(SHA_A, "master");

        cache.save(&src, &co, Compiler::Gcc, "").unwrap();
        fs::write(src.join("extra"), "new").unwrap();
        let entry = cache.save(&src, &co, Compiler::Gcc, "").unwrap();

        assert!(entry.join("extra").exists());
        assert_eq!(cache.entries().unwrap().len(), 1);
    }
}
