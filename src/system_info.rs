use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

use sysinfo::System;

const UNKNOWN: &str = "<unknown>";

/// Snapshot of the machine results were produced on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub kernel: String,
    pub cpu_arch: String,
    pub cpu_brand: String,
    pub cpu_count: usize,
    pub cpu_mhz: u64,
    pub total_memory_bytes: u64,
    pub total_swap_bytes: u64,
    pub uptime_secs: u64,
}

impl HostInfo {
    pub fn gather() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu_all();
        let cpus = sys.cpus();

        Self {
            hostname: System::host_name().unwrap_or_else(|| UNKNOWN.to_owned()),
            os: System::long_os_version().unwrap_or_else(|| UNKNOWN.to_owned()),
            kernel: System::kernel_version().unwrap_or_else(|| UNKNOWN.to_owned()),
            cpu_arch: System::cpu_arch(),
            cpu_brand: cpus
                .first()
                .map(|c| c.brand().to_string())
                .unwrap_or_else(|| UNKNOWN.to_owned()),
            cpu_count: cpus.len(),
            cpu_mhz: cpus.first().map(|c| c.frequency()).unwrap_or_default(),
            total_memory_bytes: sys.total_memory(),
            total_swap_bytes: sys.total_swap(),
            uptime_secs: System::uptime(),
        }
    }

    #[rustfmt::skip]
    pub fn log(&self) {
        info!("{:<25}{}", "Host:", self.hostname);
        info!("{:<25}{} (kernel {})", "OS:", self.os, self.kernel);
        info!("{:<25}{} x{} @ {:.2} GHz ({})", "CPU:", self.cpu_brand, self.cpu_count, self.cpu_mhz as f64 / 1000.0, self.cpu_arch);
        info!("{:<25}{} bytes", "Total memory:", self.total_memory_bytes);
        info!("{:<25}{} bytes", "Total swap:", self.total_swap_bytes);
    }

    /// Write the snapshot as pretty JSON
    pub fn dump(&self, file: &Path) -> Result<()> {
        info!("Writing system info to {file:?}");
        let out = File::create(file).with_context(|| format!("Failed to create {file:?}"))?;
        serde_json::to_writer_pretty(out, self)?;
        Ok(())
    }
}
