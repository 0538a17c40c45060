use anyhow::{Context, Result};
use clap::Subcommand;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::{fs, process};
use sysinfo::{ProcessesToUpdate, System};

use crate::command::CommandExecutor;

#[derive(Subcommand, Debug)]
pub enum SystemCommands {
    /// Report whether the host is fit for benchmarking
    Check,
    /// Drop the page cache
    DropCaches,
}

/// Outcome of one host check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
    /// Whether a failure should stop a benchmark run
    pub blocking: bool,
}

/// Names of bitcoin processes other than ourselves
pub fn unrelated_bitcoin_processes<'a>(
    processes: impl IntoIterator<Item = (u32, &'a str)>,
    own_pid: u32,
) -> Vec<String> {
    processes
        .into_iter()
        .filter(|(pid, name)| {
            *pid != own_pid && name.starts_with("bitcoin") && !name.starts_with("bitcoinperf")
        })
        .map(|(pid, name)| format!("{name} ({pid})"))
        .collect()
}

/// Active swap devices listed in `/proc/swaps` content
pub fn swap_devices(proc_swaps: &str) -> Vec<String> {
    proc_swaps
        .lines()
        .filter(|l| !l.starts_with("Filename") && !l.trim().is_empty())
        .filter_map(|l| l.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

pub struct SystemChecker {
    cpus: Vec<usize>,
    time_binary: Option<PathBuf>,
    no_caution: bool,
}

impl SystemChecker {
    pub fn new(time_binary: Option<PathBuf>, no_caution: bool) -> Result<Self> {
        let mut cpus: Vec<usize> = fs::read_dir("/sys/devices/system/cpu")
            .map(|entries| {
                entries
                    .filter_map(|entry| {
                        let name = entry.ok()?.file_name().into_string().ok()?;
                        name.strip_prefix("cpu")?.parse::<usize>().ok()
                    })
                    .collect()
            })
            .unwrap_or_default();
        cpus.sort_unstable();

        Ok(Self {
            cpus,
            time_binary,
            no_caution,
        })
    }

    fn check_bitcoin_processes(&self) -> Finding {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let names: Vec<(u32, String)> = sys
            .processes()
            .iter()
            .filter(|(_, p)| p.thread_kind().is_none())
            .map(|(pid, p)| (pid.as_u32(), p.name().to_string_lossy().into_owned()))
            .collect();
        let others =
            unrelated_bitcoin_processes(names.iter().map(|(p, n)| (*p, n.as_str())), process::id());
        Finding {
            name: "bitcoin processes",
            ok: others.is_empty(),
            detail: if others.is_empty() {
                "none running".to_string()
            } else {
                others.join(", ")
            },
            blocking: true,
        }
    }

    fn check_swap(&self) -> Finding {
        let devices = fs::read_to_string("/proc/swaps")
            .map(|s| swap_devices(&s))
            .unwrap_or_default();
        Finding {
            name: "swap",
            ok: devices.is_empty(),
            detail: if devices.is_empty() {
                "disabled".to_string()
            } else {
                format!("enabled on {}", devices.join(", "))
            },
            blocking: true,
        }
    }

    fn check_time_binary(&self) -> Option<Finding> {
        let binary = self.time_binary.as_ref()?;
        let ok = is_executable(binary);
        Some(Finding {
            name: "time binary",
            ok,
            detail: format!("{binary:?} {}", if ok { "present" } else { "missing" }),
            blocking: true,
        })
    }

    fn get_scaling_governor(&self, cpu: usize) -> Option<String> {
        let path = format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq/scaling_governor");
        fs::read_to_string(path).ok().map(|g| g.trim().to_string())
    }

    fn check_governors(&self) -> Option<Finding> {
        let slow: Vec<String> = self
            .cpus
            .iter()
            .filter_map(|cpu| {
                let governor = self.get_scaling_governor(*cpu)?;
                (governor != "performance").then(|| format!("cpu{cpu}={governor}"))
            })
            .collect();
        if self.cpus.iter().all(|c| self.get_scaling_governor(*c).is_none()) {
            return None;
        }
        Some(Finding {
            name: "cpu governor",
            ok: slow.is_empty(),
            detail: if slow.is_empty() {
                "performance".to_string()
            } else {
                slow.join(" ")
            },
            blocking: false,
        })
    }

    pub fn findings(&self) -> Vec<Finding> {
        let mut findings = vec![self.check_bitcoin_processes(), self.check_swap()];
        findings.extend(self.check_time_binary());
        findings.extend(self.check_governors());
        findings
    }

    pub fn run_checks(&self) -> Result<()> {
        println!("System Benchmark Checks:");
        for finding in self.findings() {
            println!(
                "{} {}: {}",
                if finding.ok { "✓" } else { "✗" },
                finding.name,
                finding.detail
            );
        }
        Ok(())
    }

    /// Refuse to benchmark on an unfit host; with `no_caution` only warn
    pub fn startup_assertions(&self) -> Result<()> {
        let failed: Vec<Finding> = self
            .findings()
            .into_iter()
            .filter(|f| !f.ok)
            .collect();
        for finding in &failed {
            warn!("Host check failed: {}: {}", finding.name, finding.detail);
        }
        let blocking: Vec<String> = failed
            .iter()
            .filter(|f| f.blocking)
            .map(|f| format!("{}: {}", f.name, f.detail))
            .collect();
        if blocking.is_empty() || self.no_caution {
            return Ok(());
        }
        anyhow::bail!(
            "Host is not fit for benchmarking (use no_caution to override): {}",
            blocking.join("; ")
        )
    }

    /// Flush the page cache so every bench starts cold. Skipped with `no_caution`.
    pub fn drop_caches(&self) -> Result<()> {
        if self.no_caution {
            return Ok(());
        }
        info!("Dropping caches");
        CommandExecutor::new()
            .execute_command_with_args("sudo", &["/sbin/sysctl", "vm.drop_caches=3"])
            .context("Failed to drop caches")?;
        Ok(())
    }
}

/// Whether `path` looks like an executable file
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
