use anyhow::Result;
use bitcoinperf::{
    benchmarks::MainRunner,
    build::BuildCache,
    config::{load_app_config, AppConfig, BenchType, GlobalConfig},
    home::HomeConfig,
    system::{SystemChecker, SystemCommands},
};

use clap::{Parser, Subcommand};
use env_logger::Env;
use log::info;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG: &str = "config.yml";
const DEFAULT_BENCH_CONFIG: &str = "benchmark.yml";

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = "Build bitcoin revisions and benchmark them from a YAML config"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Application config
    #[arg(short, long, default_value = DEFAULT_CONFIG, env = "BITCOINPERF_CONFIG")]
    app_config: PathBuf,

    /// Benchmark config
    #[arg(short, long, default_value = DEFAULT_BENCH_CONFIG)]
    bench_config: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build every target and run the configured benchmarks
    Run {
        /// Only run benches of this type
        #[arg(long, value_enum)]
        only: Option<BenchType>,
    },
    /// Print the commits the configured targets resolve to
    Resolve,
    /// Check or prepare the host
    System {
        #[command(subcommand)]
        command: SystemCommands,
    },
    /// Manage the build cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// Delete all but the most recently used entries
    Evict {
        /// Entries to keep; the configured cache size when unset
        #[arg(long)]
        keep: Option<usize>,
    },
}

/// App config if present; host commands work without one
fn app_config_or_default(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        load_app_config(path)
    } else {
        Ok(AppConfig::default())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::System { command } => {
            let app = app_config_or_default(&cli.app_config)?;
            let checker = SystemChecker::new(app.time_binary.clone(), app.no_caution)?;
            match command {
                SystemCommands::Check => checker.run_checks()?,
                SystemCommands::DropCaches => checker.drop_caches()?,
            }
        }
        Commands::Cache { command } => {
            let app = app_config_or_default(&cli.app_config)?;
            let home = HomeConfig::from_option(app.home_dir.as_deref())?;
            match command {
                CacheCommands::Evict { keep } => {
                    let keep = keep.unwrap_or(app.cache.max_entries);
                    let cache = BuildCache::new(&home.build_cache_dir, keep);
                    let removed = cache.evict_to(keep)?;
                    info!("Evicted {} cache entries", removed.len());
                }
            }
        }
        Commands::Resolve => {
            let config = GlobalConfig::load(&cli.app_config, &cli.bench_config)?;
            let resolution = MainRunner::new(config)?.resolve()?;
            for target in &resolution.resolved {
                let co = &target.checkout;
                println!("{:<30} {} {}", co.name, co.sha, co.commit_msg.lines().next().unwrap_or(""));
            }
            for spec in &resolution.unresolved {
                println!("{:<30} <unresolved>", spec.gitref);
            }
        }
        Commands::Run { only } => {
            let config = GlobalConfig::load(&cli.app_config, &cli.bench_config)?;
            let runner = MainRunner::new(config)?.only(*only);
            let report = runner.run()?;
            let failed = report.results.iter().filter(|r| !r.succeeded()).count();
            if failed > 0 {
                anyhow::bail!("{failed} of {} benchmarks failed", report.results.len());
            }
            info!("All benchmarks completed successfully.");
        }
    }

    Ok(())
}
