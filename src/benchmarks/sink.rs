use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::benchmarks::names;
use crate::git::ResolvedCheckout;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    Secs,
    Kib,
}

/// A single named number reported for a revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub name: String,
    pub value: f64,
    pub units: Units,
    pub target: String,
    pub sha: String,
    pub executable: String,
    /// Free-form annotations such as `height` or `dbcache`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Measurement {
    pub fn new(
        checkout: &ResolvedCheckout,
        name: impl Into<String>,
        value: f64,
        units: Units,
        executable: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            units,
            target: checkout.name.clone(),
            sha: checkout.sha.clone(),
            executable: executable.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Receives measurements as soon as they are known
pub trait ResultSink: Send + Sync {
    fn save(&self, measurement: &Measurement) -> Result<()>;
}

/// Emit a timing and, when known, its peak memory companion
pub fn save_timing(
    sink: &dyn ResultSink,
    timing: Measurement,
    peak_rss_kib: Option<u64>,
) -> Result<()> {
    sink.save(&timing)?;
    if let Some(kib) = peak_rss_kib {
        let mem = Measurement {
            name: names::mem_usage(&timing.name),
            value: kib as f64,
            units: Units::Kib,
            ..timing
        };
        sink.save(&mem)?;
    }
    Ok(())
}

/// Logs every measurement
#[derive(Debug, Default)]
pub struct LogSink;

impl ResultSink for LogSink {
    fn save(&self, m: &Measurement) -> Result<()> {
        let units = match m.units {
            Units::Secs => "s",
            Units::Kib => "KiB",
        };
        info!(
            "result [{}] {} = {:.3}{units} ({})",
            m.target, m.name, m.value, m.executable
        );
        Ok(())
    }
}

/// Keeps measurements in memory; clones share storage
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    measurements: Arc<Mutex<Vec<Measurement>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn measurements(&self) -> Vec<Measurement> {
        self.measurements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.measurements().into_iter().map(|m| m.name).collect()
    }
}

impl ResultSink for MemorySink {
    fn save(&self, measurement: &Measurement) -> Result<()> {
        self.measurements
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(measurement.clone());
        Ok(())
    }
}

/// Forwards to several sinks in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl ResultSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl ResultSink for FanoutSink {
    fn save(&self, measurement: &Measurement) -> Result<()> {
        for sink in &self.sinks {
            sink.save(measurement)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkout() -> ResolvedCheckout {
        ResolvedCheckout {
            gitref: "master".into(),
            remote: "origin".into(),
            sha: "abc123".into(),
            commit_msg: "msg".into(),
            name: "master".into(),
            pre_rebase_sha: None,
        }
    }

    #[test]
    fn test_save_timing_pairs_memory() {
        let sink = MemorySink::new();
        let timing = Measurement::new(&checkout(), "build.make.1.gcc", 12.5, Units::Secs, "make")
            .with_extra("jobs", 1);

        save_timing(&sink, timing.clone(), Some(2048)).unwrap();
        save_timing(&sink, timing, None).unwrap();

        let saved = sink.measurements();
        assert_eq!(saved.len(), 3);
        assert_eq!(saved[1].name, "build.make.1.gcc.mem-usage");
        assert_eq!(saved[1].units, Units::Kib);
        assert_eq!(saved[1].value, 2048.0);
        assert_eq!(saved[1].extra["jobs"], 1);
        assert_eq!(saved[0].sha, "abc123");
    }

    #[test]
    fn test_fanout_shares_with_clones() {
        let memory = MemorySink::new();
        let fanout = FanoutSink::new().with(LogSink).with(memory.clone());
        fanout
            .save(&Measurement::new(&checkout(), "x", 1.0, Units::Secs, "bitcoind"))
            .unwrap();
        assert_eq!(memory.names(), vec!["x"]);
    }
}
