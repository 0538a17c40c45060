use anyhow::{Context, Result};
use log::{info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Exit status used after an interrupt, as a shell would report SIGINT
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Handle returned by [`NodeRegistry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

#[derive(Debug, Clone)]
struct TrackedNode {
    name: String,
    pgid: u32,
}

/// Every node process group alive in this run.
///
/// Shared by the benchmark runners and the interrupt handler so that an
/// interrupted run never leaves a daemon behind.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<Mutex<HashMap<NodeId, TrackedNode>>>,
    next_id: Arc<AtomicU64>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, pgid: u32) -> NodeId {
        let id = NodeId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                TrackedNode {
                    name: name.to_string(),
                    pgid,
                },
            );
        id
    }

    pub fn unregister(&self, id: NodeId) {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// SIGTERM every tracked process group and forget them; returns how many
    pub fn terminate_all(&self) -> usize {
        let drained: Vec<TrackedNode> = self
            .nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, node)| node)
            .collect();

        for node in &drained {
            warn!("Terminating node {} (pgid {})", node.name, node.pgid);
            // SAFETY: plain kill(2) on a process group id we spawned.
            let rc = unsafe { libc::kill(-(node.pgid as libc::pid_t), libc::SIGTERM) };
            if rc != 0 {
                warn!(
                    "Failed to signal {}: {}",
                    node.name,
                    std::io::Error::last_os_error()
                );
            }
        }
        drained.len()
    }

    /// On SIGINT/SIGTERM, terminate every tracked node then exit the process
    pub fn install_interrupt_handler(&self) -> Result<()> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).context("Failed to register signal handlers")?;
        let registry = self.clone();
        std::thread::Builder::new()
            .name("interrupt-handler".to_string())
            .spawn(move || {
                if let Some(signal) = signals.forever().next() {
                    info!("Received signal {signal}, stopping all nodes");
                    let count = registry.terminate_all();
                    info!("Signalled {count} node(s), exiting");
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
            })
            .context("Failed to spawn interrupt handler thread")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessHandle, ProcessSpec};
    use std::time::Duration;

    #[test]
    fn test_register_unregister() {
        let registry = NodeRegistry::new();
        let a = registry.register("a", 1_000_000);
        let b = registry.register("b", 1_000_001);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        registry.unregister(a);
        assert_eq!(registry.len(), 1);
        // idempotent
        registry.unregister(a);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_terminate_all_signals_process_groups() {
        let registry = NodeRegistry::new();
        let spec = ProcessSpec::new("sleeper", "sleep").args(["30"]);
        let mut handle = ProcessHandle::spawn(&spec).unwrap();
        registry.register("sleeper", handle.pgid());

        assert_eq!(registry.terminate_all(), 1);
        assert!(registry.is_empty());

        let status = handle.wait_timeout(Duration::from_secs(5)).unwrap();
        assert!(status.is_some_and(|s| !s.success()));
    }
}
