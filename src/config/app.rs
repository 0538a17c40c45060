use anyhow::Result;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::traits::{Configuration, PathConfiguration};
use crate::config::{expand_opt, read_yaml};
use crate::git::GitSettings;
use crate::lock::DEFAULT_LOCK_PATH;
use crate::path_utils;

/// Build cache behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Entries kept after eviction
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 20,
        }
    }
}

/// Application configuration loaded from config.yml
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Persistent state (build cache, results); `BITCOINPERF_HOME` or ~/.bitcoinperf when unset
    pub home_dir: Option<PathBuf>,
    /// Scratch directory for the clone and datadirs; a temp dir when unset
    pub workdir: Option<PathBuf>,
    pub lock_path: PathBuf,
    /// Downgrade host checks to warnings and skip dropping caches
    pub no_caution: bool,
    /// Leave the workdir and datadirs behind
    pub no_teardown: bool,
    /// Where debug logs of finished nodes are copied
    pub stash_dir: Option<PathBuf>,
    /// GNU time used for peak memory and cpu times; `null` disables it
    pub time_binary: Option<PathBuf>,
    pub cache: CacheSettings,
    pub git: GitSettings,
    pub show_progress: bool,
    /// Path to the config file (set during loading)
    #[serde(skip)]
    pub path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            home_dir: None,
            workdir: None,
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            no_caution: false,
            no_teardown: false,
            stash_dir: None,
            time_binary: Some(PathBuf::from("/usr/bin/time")),
            cache: CacheSettings::default(),
            git: GitSettings::default(),
            show_progress: true,
            path: PathBuf::new(),
        }
    }
}

impl Configuration for AppConfig {
    fn config_path(&self) -> &PathBuf {
        &self.path
    }

    fn config_type(&self) -> &str {
        "application"
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.cache.enabled && self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be at least 1 when the cache is enabled");
        }
        if !self.git.remote_url_template.contains("{}") {
            anyhow::bail!(
                "git.remote_url_template must contain a {{}} placeholder: {}",
                self.git.remote_url_template
            );
        }
        if self.lock_path.as_os_str().is_empty() {
            anyhow::bail!("lock_path cannot be empty");
        }
        Ok(())
    }
}

impl PathConfiguration for AppConfig {
    fn with_expanded_paths(&self, config_dir: &Path) -> anyhow::Result<Self> {
        let mut config = self.clone();
        expand_opt(&mut config.home_dir, config_dir)?;
        expand_opt(&mut config.workdir, config_dir)?;
        expand_opt(&mut config.stash_dir, config_dir)?;
        expand_opt(&mut config.time_binary, config_dir)?;
        config.lock_path = path_utils::resolve_path(&config.lock_path, config_dir, false)?;
        Ok(config)
    }
}

/// Load application configuration from a YAML file
pub fn load_app_config(app_config_path: &Path) -> Result<AppConfig> {
    let (mut config, config_dir): (AppConfig, _) = read_yaml(app_config_path, "App")?;

    config.path = app_config_path.to_path_buf();
    let config = config.with_expanded_paths(&config_dir)?;
    config.validate()?;

    debug!("Using {} configuration\n{:?}", config.config_type(), config);
    Ok(config)
}
