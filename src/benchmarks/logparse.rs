//! Reading facts out of a node's debug log.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Default marker the node logs when it refuses to continue for lack of space
pub const DISK_SPACE_LOW_MARKER: &str = "Disk space is low!";

const TAIL_CHUNK: u64 = 64 * 1024;

/// A UTXO cache flush reported by the node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlushEvent {
    /// Seconds since the first timestamped log line
    pub relative_secs: f64,
    pub duration_secs: f64,
    pub flushed_count: u64,
    pub flushed_kb: u64,
}

const FLUSH_PATTERN: &str = r"write coins cache to disk \((?P<count>\d+) coins, (?P<kb>\d+)kB\) completed \((?P<secs>\d+\.\d+)s\)";

/// Last `lines` lines of a file, read backwards so large logs stay cheap
pub fn read_tail_lines(path: &Path, lines: usize) -> Result<Vec<String>> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {path:?}"))?;
    let len = file.metadata()?.len();

    let mut start = len;
    let mut buf: Vec<u8> = Vec::new();
    while start > 0 {
        let step = TAIL_CHUNK.min(start);
        start -= step;
        file.seek(SeekFrom::Start(start))?;
        let mut chunk = vec![0; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
        if buf.iter().filter(|b| **b == b'\n').count() > lines {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let all: Vec<&str> = text.lines().collect();
    let skip = all.len().saturating_sub(lines);
    Ok(all[skip..].iter().map(|l| l.to_string()).collect())
}

/// Whether `marker` appears in the last `tail_lines` lines of the log
pub fn tail_contains(path: &Path, marker: &str, tail_lines: usize) -> Result<bool> {
    Ok(read_tail_lines(path, tail_lines)?
        .iter()
        .any(|line| line.contains(marker)))
}

fn line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let stamp = line.split_whitespace().next()?;
    DateTime::parse_from_rfc3339(stamp)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Parse every coins-cache flush out of a debug log
pub fn flush_events(path: &Path) -> Result<Vec<FlushEvent>> {
    let re = Regex::new(FLUSH_PATTERN).context("Failed to compile flush pattern")?;
    let file = File::open(path).with_context(|| format!("Failed to open {path:?}"))?;
    let mut reader = BufReader::new(file);
    let mut first: Option<DateTime<Utc>> = None;
    let mut events = Vec::new();

    let mut raw = Vec::new();
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&raw);
        let Some(stamp) = line_timestamp(&line) else {
            continue;
        };
        let origin = *first.get_or_insert(stamp);
        let Some(caps) = re.captures(&line) else {
            continue;
        };
        let relative = stamp - origin;
        events.push(FlushEvent {
            relative_secs: relative.num_milliseconds() as f64 / 1000.0,
            duration_secs: caps["secs"].parse()?,
            flushed_count: caps["count"].parse()?,
            flushed_kb: caps["kb"].parse()?,
        });
    }
    Ok(events)
}
