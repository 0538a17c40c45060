#[cfg(test)]
mod tests {
    use crate::build::Compiler;
    use crate::config::{
        benchmark::{BenchEntry, BenchType},
        load_app_config, load_bench_config,
        traits::Configuration,
        GlobalConfig,
    };
    use crate::benchmarks::ibd::IbdKind;
    use crate::git::RefSpec;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    const BENCH_YAML: &str = r#"
targets:
  - gitref: master
  - gitref: "$mergebase"
  - gitref: my-branch
    remote: jamesob
    rebase: true
    bitcoind_extra_args: ["-par=2"]
compilers: [gcc, clang]
build:
  jobs: 4
polling:
  interval_ms: 500
heuristics:
  min_plausible_secs: 60
benches:
  - type: ibd_local
    end_height: 200000
    checkpoints: [100000, 150000]
    dbcache: 1000
    stash_datadir: kept
    server:
      bitcoind: bin/bitcoind
      datadir: ~/synced
  - type: reindex
    runs: 3
    copy_from_datadir: datadirs/200k
  - type: make_check
"#;

    #[test]
    fn test_app_config_defaults() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "config.yml", "no_caution: true\n");
        let config = load_app_config(&path).unwrap();

        assert!(config.no_caution);
        assert!(!config.no_teardown);
        assert_eq!(config.lock_path, PathBuf::from("/tmp/bitcoin_bench.lock"));
        assert_eq!(config.time_binary, Some(PathBuf::from("/usr/bin/time")));
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_entries, 20);
        assert_eq!(config.git.mainline_branch, "master");
        assert_eq!(config.config_path(), &path);
    }

    #[test]
    fn test_app_config_paths_and_null_time_binary() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "config.yml",
            "workdir: scratch\nstash_dir: /var/stash\ntime_binary: null\n",
        );
        let config = load_app_config(&path).unwrap();

        assert_eq!(config.workdir, Some(dir.path().join("scratch")));
        assert_eq!(config.stash_dir, Some(PathBuf::from("/var/stash")));
        assert_eq!(config.time_binary, None);
    }

    #[test]
    fn test_app_config_rejects_bad_template() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "config.yml",
            "git:\n  remote_url_template: https://example.com/bitcoin.git\n",
        );
        assert!(load_app_config(&path).is_err());
    }

    #[test]
    fn test_missing_config_file() {
        let err = load_app_config(Path::new("/nonexistent/config.yml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_bench_config_parses() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "benchmark.yml", BENCH_YAML);
        let config = load_bench_config(&path).unwrap();

        assert_eq!(config.targets.len(), 3);
        assert_eq!(config.targets[1].gitref, RefSpec::MergeBase);
        assert_eq!(config.targets[2].remote.as_deref(), Some("jamesob"));
        assert!(config.targets[2].rebase);
        assert_eq!(config.compilers, vec![Compiler::Gcc, Compiler::Clang]);
        assert_eq!(config.build.jobs, 4);
        assert_eq!(config.polling.interval_ms, 500);
        assert_eq!(config.polling.control_retries, 20);
        assert_eq!(config.heuristics.min_plausible_secs, Some(60));

        let ibd = &config.benches[0];
        assert_eq!(ibd.kind, BenchType::IbdLocal);
        assert_eq!(ibd.runs, 1);
        assert_eq!(ibd.checkpoints, vec![100000, 150000]);
        assert_eq!(ibd.stash_datadir, Some(dir.path().join("kept")));
        let server = ibd.server.as_ref().unwrap();
        assert_eq!(server.bitcoind, dir.path().join("bin/bitcoind"));
        assert!(server.datadir.is_absolute());

        let reindex = &config.benches[1];
        assert_eq!(reindex.runs, 3);
        assert_eq!(
            reindex.ibd_kind().unwrap(),
            Some(IbdKind::Reindex {
                copy_from_datadir: dir.path().join("datadirs/200k")
            })
        );
        assert_eq!(config.benches[2].ibd_kind().unwrap(), None);
    }

    #[test]
    fn test_bench_entry_validation() {
        let mut entry = BenchEntry::new(BenchType::IbdLocal);
        assert!(entry.validate().is_err(), "server is required");

        entry = BenchEntry::new(BenchType::IbdRemote);
        entry.peer_address = Some("10.0.0.2:8333".into());
        assert!(entry.validate().is_ok());

        entry = BenchEntry::new(BenchType::IbdReal);
        entry.start_height = 10;
        entry.end_height = Some(5);
        assert!(entry.validate().is_err());

        entry = BenchEntry::new(BenchType::IbdRange);
        entry.copy_from_datadir = Some("/data".into());
        assert!(entry.validate().is_err());

        entry = BenchEntry::new(BenchType::MakeCheck);
        entry.runs = 0;
        assert!(entry.validate().is_err());
    }

    #[test]
    fn test_bench_config_requires_targets() {
        let dir = tempdir().unwrap();
        let path = write(dir.path(), "benchmark.yml", "targets: []\nbenches:\n  - type: microbench\n");
        let err = load_bench_config(&path).unwrap_err();
        assert!(err.to_string().contains("No targets"));
    }

    #[test]
    fn test_unknown_bench_type() {
        let dir = tempdir().unwrap();
        let path = write(
            dir.path(),
            "benchmark.yml",
            "targets:\n  - gitref: master\nbenches:\n  - type: teleport\n",
        );
        assert!(load_bench_config(&path).is_err());
    }

    #[test]
    fn test_global_config_load() {
        let dir = tempdir().unwrap();
        let app = write(dir.path(), "config.yml", "show_progress: false\n");
        let bench = write(dir.path(), "benchmark.yml", BENCH_YAML);
        let global = GlobalConfig::load(&app, &bench).unwrap();

        assert!(!global.app.show_progress);
        assert_eq!(global.config_type(), "global");
        assert_eq!(global.config_path(), &bench);
    }
}
