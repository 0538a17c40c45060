/// Application configuration
pub mod app;
pub use app::{load_app_config, AppConfig, CacheSettings};

/// Benchmark configuration
pub mod benchmark;
pub use benchmark::{default_dbcache, load_bench_config, BenchEntry, BenchType, BenchmarkConfig};

/// Configuration traits
pub mod traits;
pub use traits::{Configuration, PathConfiguration};

#[cfg(test)]
mod tests;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::path_utils;

/// Global configuration containing both app and benchmark configurations
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Application configuration
    pub app: AppConfig,
    /// Benchmark configuration
    pub bench: BenchmarkConfig,
}

impl GlobalConfig {
    pub fn load(app_config_path: &Path, bench_config_path: &Path) -> Result<Self> {
        let config = Self {
            app: load_app_config(app_config_path)?,
            bench: load_bench_config(bench_config_path)?,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Configuration for GlobalConfig {
    fn config_path(&self) -> &PathBuf {
        // The GlobalConfig doesn't have its own path, so we return the benchmark config path
        self.bench.config_path()
    }

    fn config_type(&self) -> &str {
        "global"
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.app.validate()?;
        self.bench.validate()?;
        Ok(())
    }
}

/// Read and parse a YAML file, returning it with the directory it lives in
pub(crate) fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path, kind: &str) -> Result<(T, PathBuf)> {
    if !path.exists() {
        anyhow::bail!("{kind} config file not found: {path:?}");
    }
    let config_dir = path
        .parent()
        .with_context(|| format!("Failed to get {kind} config directory"))?
        .to_path_buf();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {kind} config file: {path:?}"))?;
    let config = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse YAML from file: {path:?}"))?;
    Ok((config, config_dir))
}

/// Expand an optional path in place
pub(crate) fn expand_opt(path: &mut Option<PathBuf>, config_dir: &Path) -> Result<()> {
    if let Some(p) = path.as_mut() {
        *p = path_utils::resolve_path(p, config_dir, false)?;
    }
    Ok(())
}
