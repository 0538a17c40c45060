use anyhow::{Context, Result};
use log::debug;
use std::fs;
use std::path::{Path, PathBuf};

/// Expand environment variables and `~` in a path string
pub fn expand_path_str(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| path.into())
        .into_owned()
}

/// Expand a PathBuf with environment variables
pub fn expand_path_buf(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    PathBuf::from(expand_path_str(&path_str))
}

/// Create a directory and all parent directories if they don't exist
pub fn ensure_directory(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path).with_context(|| format!("Failed to create directory: {path:?}"))?;
        debug!("Created directory: {path:?}");
    }
    Ok(())
}

/// Expand a path and make it absolute relative to `config_dir`.
///
/// Unlike a canonicalize, the target does not need to exist unless
/// `create_dirs` asks for it to be created.
pub fn resolve_path(path: &Path, config_dir: &Path, create_dirs: bool) -> Result<PathBuf> {
    let expanded_path = expand_path_buf(path);

    let abs_path = if expanded_path.is_absolute() {
        expanded_path
    } else {
        config_dir.join(&expanded_path)
    };

    if create_dirs {
        ensure_directory(&abs_path)?;
        return abs_path
            .canonicalize()
            .with_context(|| format!("Failed to resolve path: {abs_path:?}"));
    }

    Ok(abs_path)
}

/// Remove a directory tree if it exists
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_dir_all(path).with_context(|| format!("Failed to remove {path:?}"))?;
        debug!("Removed {path:?}");
    }
    Ok(())
}

/// Remove `path` if present and recreate it empty
pub fn recreate_directory(path: &Path) -> Result<()> {
    remove_dir_if_exists(path)?;
    ensure_directory(path)
}

/// Convenience function to copy a file with better error handling
pub fn copy_file(source: &Path, dest: &Path) -> Result<()> {
    fs::copy(source, dest).with_context(|| format!("Failed to copy {source:?} to {dest:?}"))?;
    debug!("Copied {source:?} to {dest:?}");
    Ok(())
}

/// Recursively copy `source` into `dest`, preserving symlinks and permissions.
///
/// Entries whose file name is listed in `skip` are not copied (top level only).
pub fn copy_dir_recursive(source: &Path, dest: &Path, skip: &[&str]) -> Result<u64> {
    if !source.is_dir() {
        anyhow::bail!("Copy source is not a directory: {source:?}");
    }
    ensure_directory(dest)?;
    copy_tree(source, dest, skip)
}

fn copy_tree(source: &Path, dest: &Path, skip: &[&str]) -> Result<u64> {
    let mut copied = 0;
    for entry in fs::read_dir(source).with_context(|| format!("Failed to read {source:?}"))? {
        let entry = entry?;
        let name = entry.file_name();
        if skip.iter().any(|s| name.to_str() == Some(*s)) {
            continue;
        }
        let from = entry.path();
        let to = dest.join(&name);
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            let target = fs::read_link(&from)?;
            if fs::symlink_metadata(&to).is_ok() {
                fs::remove_file(&to).with_context(|| format!("Failed to replace {to:?}"))?;
            }
            std::os::unix::fs::symlink(&target, &to)
                .with_context(|| format!("Failed to recreate symlink {to:?}"))?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&to).with_context(|| format!("Failed to create {to:?}"))?;
            copied += copy_tree(&from, &to, &[])?;
        } else {
            fs::copy(&from, &to).with_context(|| format!("Failed to copy {from:?} to {to:?}"))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Move a directory tree to `dest`, replacing it if present.
///
/// Renames when possible and falls back to copy then remove across
/// filesystems.
pub fn move_dir(source: &Path, dest: &Path) -> Result<()> {
    remove_dir_if_exists(dest)?;
    if let Some(parent) = dest.parent() {
        ensure_directory(parent)?;
    }
    if let Err(e) = fs::rename(source, dest) {
        debug!("rename {source:?} -> {dest:?} failed ({e}), copying");
        copy_dir_recursive(source, dest, &[])?;
        remove_dir_if_exists(source)?;
    }
    debug!("Moved {source:?} to {dest:?}");
    Ok(())
}

/// Reduce an arbitrary string to something safe to use as a single path component
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.trim_matches('.').to_string()
}
