//! Resource sampling for processes that may sit behind wrapper processes.
//!
//! A benchmarked daemon is often launched through `time` and/or a shell, so
//! the pid we spawned is not the pid whose memory we want. The daemon is
//! found by walking a single-child chain from the spawned pid.

use anyhow::Result;
use log::trace;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Maximum number of wrapper processes between the spawned pid and the daemon
pub const MAX_WRAPPER_DEPTH: usize = 3;

/// Linux truncates `comm` to 15 bytes
const COMM_LEN: usize = 15;

/// Point-in-time resource usage of a daemon process
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub rss_kib: u64,
    pub num_fds: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UsageError {
    #[error("unexpected process tree: pid {pid} has {} children {children:?}, expected a single wrapper chain", children.len())]
    UnexpectedProcessTree { pid: u32, children: Vec<u32> },
    #[error("no process named {name:?} within {depth} levels below pid {root}")]
    DaemonNotFound { root: u32, name: String, depth: usize },
}

/// Minimal view of the host process table
pub trait ProcessTree {
    fn name_of(&self, pid: u32) -> Option<String>;
    /// Child processes of `pid`, excluding its own threads
    fn children_of(&self, pid: u32) -> Vec<u32>;
}

impl ProcessTree for System {
    fn name_of(&self, pid: u32) -> Option<String> {
        self.process(Pid::from_u32(pid))
            .map(|p| p.name().to_string_lossy().into_owned())
    }

    fn children_of(&self, pid: u32) -> Vec<u32> {
        let parent = Pid::from_u32(pid);
        let threads = self.process(parent).and_then(|p| p.tasks());
        let mut children: Vec<u32> = self
            .processes()
            .iter()
            .filter(|(child, proc_)| {
                proc_.parent() == Some(parent)
                    && **child != parent
                    && !threads.is_some_and(|t| t.contains(*child))
            })
            .map(|(child, _)| child.as_u32())
            .collect();
        children.sort_unstable();
        children
    }
}

fn name_matches(actual: &str, expected: &str) -> bool {
    actual == expected
        || (expected.len() > COMM_LEN
            && expected.as_bytes().get(..COMM_LEN) == Some(actual.as_bytes()))
}

/// Find the daemon process named `daemon` at or below `root`.
///
/// Returns `Ok(None)` when the chain ends (a process exited between sampling
/// and lookup); a node with more than one child is an error because the
/// measured process would be ambiguous.
pub fn resolve_daemon_pid(
    tree: &impl ProcessTree,
    root: u32,
    daemon: &str,
) -> Result<Option<u32>, UsageError> {
    let mut current = root;
    for _ in 0..=MAX_WRAPPER_DEPTH {
        let Some(name) = tree.name_of(current) else {
            return Ok(None);
        };
        if name_matches(&name, daemon) {
            return Ok(Some(current));
        }
        trace!("pid {current} ({name}) is a wrapper, descending");
        let children = tree.children_of(current);
        match children.as_slice() {
            [] => return Ok(None),
            [only] => current = *only,
            _ => {
                return Err(UsageError::UnexpectedProcessTree {
                    pid: current,
                    children,
                })
            }
        }
    }
    Err(UsageError::DaemonNotFound {
        root,
        name: daemon.to_string(),
        depth: MAX_WRAPPER_DEPTH,
    })
}

fn count_fds(pid: u32) -> Option<u64> {
    std::fs::read_dir(format!("/proc/{pid}/fd"))
        .ok()
        .map(|entries| entries.count() as u64)
}

/// Samples a daemon's usage; keeps a `System` so CPU usage has a baseline
pub struct UsageSampler {
    sys: System,
}

impl Default for UsageSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageSampler {
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    /// Sample the daemon under `root`. `Ok(None)` means the process is gone.
    pub fn sample(&mut self, root: u32, daemon: &str) -> Result<Option<ResourceUsage>> {
        self.sys.refresh_processes(ProcessesToUpdate::All, true);
        let Some(pid) = resolve_daemon_pid(&self.sys, root, daemon)? else {
            return Ok(None);
        };
        let Some(process) = self.sys.process(Pid::from_u32(pid)) else {
            return Ok(None);
        };
        let Some(num_fds) = count_fds(pid) else {
            return Ok(None);
        };
        Ok(Some(ResourceUsage {
            cpu_percent: process.cpu_usage(),
            rss_kib: process.memory() / 1024,
            num_fds,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeTree {
        names: HashMap<u32, String>,
        children: HashMap<u32, Vec<u32>>,
    }

    impl FakeTree {
        fn with(mut self, pid: u32, name: &str, parent: Option<u32>) -> Self {
            self.names.insert(pid, name.to_string());
            if let Some(parent) = parent {
                self.children.entry(parent).or_default().push(pid);
            }
            self
        }
    }

    impl ProcessTree for FakeTree {
        fn name_of(&self, pid: u32) -> Option<String> {
            self.names.get(&pid).cloned()
        }

        fn children_of(&self, pid: u32) -> Vec<u32> {
            self.children.get(&pid).cloned().unwrap_or_default()
        }
    }

    #[test]
    fn test_root_is_daemon() {
        let tree = FakeTree::default().with(10, "bitcoind", None);
        assert_eq!(resolve_daemon_pid(&tree, 10, "bitcoind"), Ok(Some(10)));
    }

    #[test]
    fn test_behind_one_two_and_three_wrappers() {
        let tree = FakeTree::default()
            .with(1, "time", None)
            .with(2, "bitcoind", Some(1));
        assert_eq!(resolve_daemon_pid(&tree, 1, "bitcoind"), Ok(Some(2)));

        let tree = FakeTree::default()
            .with(1, "sh", None)
            .with(2, "time", Some(1))
            .with(3, "bitcoind", Some(2));
        assert_eq!(resolve_daemon_pid(&tree, 1, "bitcoind"), Ok(Some(3)));

        let tree = FakeTree::default()
            .with(1, "sudo", None)
            .with(2, "sh", Some(1))
            .with(3, "time", Some(2))
            .with(4, "bitcoind", Some(3));
        assert_eq!(resolve_daemon_pid(&tree, 1, "bitcoind"), Ok(Some(4)));
    }

    #[test]
    fn test_too_deep_is_error() {
        let tree = FakeTree::default()
            .with(1, "a", None)
            .with(2, "b", Some(1))
            .with(3, "c", Some(2))
            .with(4, "d", Some(3))
            .with(5, "bitcoind", Some(4));
        assert!(matches!(
            resolve_daemon_pid(&tree, 1, "bitcoind"),
            Err(UsageError::DaemonNotFound { depth: 3, .. })
        ));
    }

    #[test]
    fn test_multiple_children_is_error() {
        let tree = FakeTree::default()
            .with(1, "sh", None)
            .with(2, "bitcoind", Some(1))
            .with(3, "bitcoind", Some(1));
        assert_eq!(
            resolve_daemon_pid(&tree, 1, "bitcoind"),
            Err(UsageError::UnexpectedProcessTree {
                pid: 1,
                children: vec![2, 3]
            })
        );
    }

    #[test]
    fn test_vanished_process_is_none() {
        let tree = FakeTree::default().with(1, "time", None);
        assert_eq!(resolve_daemon_pid(&tree, 1, "bitcoind"), Ok(None));
        assert_eq!(resolve_daemon_pid(&tree, 99, "bitcoind"), Ok(None));
    }

    #[test]
    fn test_truncated_comm_matches() {
        let tree = FakeTree::default().with(7, "bitcoind-patche", None);
        assert_eq!(
            resolve_daemon_pid(&tree, 7, "bitcoind-patched-build"),
            Ok(Some(7))
        );
    }

    #[test]
    fn test_truncation_inside_multibyte_char() {
        // 'é' spans bytes 14 and 15, so the kernel cuts it in half
        let expected = "bitcoind-testsé-build";
        assert!(!name_matches("bitcoind-tests\u{FFFD}", expected));
        assert!(!name_matches("bitcoind", expected));
        assert!(name_matches("bitcoind-patche", "bitcoind-patchedé"));
    }

    #[test]
    fn test_sample_own_process() {
        let mut sampler = UsageSampler::new();
        let me = std::process::id();
        let name = System::new_all().name_of(me).unwrap();
        let usage = sampler.sample(me, &name).unwrap().unwrap();
        assert!(usage.rss_kib > 0);
        assert!(usage.num_fds > 0);
    }
}
