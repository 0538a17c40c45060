use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Layout of bitcoinperf's persistent state directory
#[derive(Debug, Clone)]
pub struct HomeConfig {
    /// Root directory for bitcoinperf data
    pub home_dir: PathBuf,
    /// Cached build trees, keyed by commit/compiler/flags
    pub build_cache_dir: PathBuf,
    /// Exported benchmark results
    pub results_dir: PathBuf,
    /// Debug logs stashed from torn-down nodes
    pub stash_dir: PathBuf,
}

impl HomeConfig {
    /// Create a new HomeConfig with the specified home directory
    pub fn new(home_dir: PathBuf) -> Self {
        Self {
            build_cache_dir: home_dir.join("build-cache"),
            results_dir: home_dir.join("results"),
            stash_dir: home_dir.join("stash"),
            home_dir,
        }
    }

    /// `$HOME/.bitcoinperf`, or `None` when HOME is unset
    pub fn default_home() -> Option<PathBuf> {
        env::var_os("HOME").map(|home| PathBuf::from(home).join(".bitcoinperf"))
    }

    /// Create the directory structure
    pub fn initialize(&self) -> Result<()> {
        for dir in [
            &self.home_dir,
            &self.build_cache_dir,
            &self.results_dir,
            &self.stash_dir,
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory at {dir:?}"))?;
        }
        Ok(())
    }

    /// Get home directory from `BITCOINPERF_HOME` or fall back to the default
    pub fn from_env() -> Result<Self> {
        if let Some(dir) = env::var_os("BITCOINPERF_HOME") {
            return Ok(Self::new(PathBuf::from(dir)));
        }
        let home = Self::default_home()
            .context("Neither BITCOINPERF_HOME nor HOME is set; configure home_dir")?;
        Ok(Self::new(home))
    }

    /// Get home directory from configuration, environment, or default
    pub fn from_option(home_dir: Option<&Path>) -> Result<Self> {
        match home_dir {
            Some(dir) => Ok(Self::new(dir.to_path_buf())),
            None => Self::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_custom_home_config() {
        let temp_dir = TempDir::new().unwrap();
        let config = HomeConfig::new(temp_dir.path().to_path_buf());

        assert_eq!(config.home_dir, temp_dir.path());
        assert_eq!(config.build_cache_dir, temp_dir.path().join("build-cache"));
        assert_eq!(config.results_dir, temp_dir.path().join("results"));
    }

    #[test]
    fn test_initialize_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let config = HomeConfig::new(temp_dir.path().join("home"));

        config.initialize().unwrap();

        assert!(config.build_cache_dir.is_dir());
        assert!(config.results_dir.is_dir());
        assert!(config.stash_dir.is_dir());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let temp_dir = TempDir::new().unwrap();
        env::set_var("BITCOINPERF_HOME", temp_dir.path());

        let config = HomeConfig::from_env().unwrap();
        assert_eq!(config.home_dir, temp_dir.path());

        env::remove_var("BITCOINPERF_HOME");
    }

    #[test]
    #[serial]
    fn test_from_option_prefers_explicit() {
        let temp_dir = TempDir::new().unwrap();
        env::set_var("BITCOINPERF_HOME", "/somewhere/else");

        let config = HomeConfig::from_option(Some(temp_dir.path())).unwrap();
        assert_eq!(config.home_dir, temp_dir.path());

        env::remove_var("BITCOINPERF_HOME");
    }
}
