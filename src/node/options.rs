use serde::{Deserialize, Serialize};

/// Flags every benchmarked node runs with.
///
/// A node that believes its tip is stale or its chain has too little work
/// behaves differently from one doing a normal IBD, and console output would
/// only fill our pipes.
pub const BENCH_SAFETY_FLAGS: &[&str] = &[
    "-printtoconsole=0",
    "-minimumchainwork=0x00",
    "-maxtipage=9223372036854775807",
];

/// Node start parameters we know how to render
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOption {
    /// UTXO cache size in MiB
    DbCache(u64),
    AssumeValid(String),
    StopAtHeight(u64),
    Debug(Vec<String>),
    Listen(bool),
    Connect(bool),
    AddNode(String),
    TxIndex(bool),
    Reindex,
}

fn flag(b: bool) -> u8 {
    u8::from(b)
}

impl StartOption {
    pub fn render(&self) -> Vec<String> {
        match self {
            StartOption::DbCache(mib) => vec![format!("-dbcache={mib}")],
            StartOption::AssumeValid(hash) => vec![format!("-assumevalid={hash}")],
            StartOption::StopAtHeight(h) => vec![format!("-stopatheight={h}")],
            StartOption::Debug(categories) => categories
                .iter()
                .map(|c| format!("-debug={c}"))
                .collect(),
            StartOption::Listen(on) => vec![format!("-listen={}", flag(*on))],
            StartOption::Connect(on) => vec![format!("-connect={}", flag(*on))],
            StartOption::AddNode(addr) => vec![format!("-addnode={addr}")],
            StartOption::TxIndex(on) => vec![format!("-txindex={}", flag(*on))],
            StartOption::Reindex => vec!["-reindex=1".to_string()],
        }
    }
}

/// A complete set of start parameters: known options plus raw passthrough flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub options: Vec<StartOption>,
    /// Passed to the daemon verbatim, after the known options
    pub extra_flags: Vec<String>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, option: StartOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn with_extra<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_flags.extend(flags.into_iter().map(Into::into));
        self
    }

    /// Known options, then passthrough flags, then the safety flags
    pub fn render(&self) -> Vec<String> {
        let mut args: Vec<String> = self.options.iter().flat_map(StartOption::render).collect();
        args.extend(self.extra_flags.iter().cloned());
        args.extend(BENCH_SAFETY_FLAGS.iter().map(|s| s.to_string()));
        args
    }
}

/// Value of the last `-name=value` occurrence in a rendered argument list
pub fn arg_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    let prefix = format!("-{name}=");
    args.iter()
        .rev()
        .find_map(|a| a.strip_prefix(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_order_and_safety_flags() {
        let opts = StartOptions::new()
            .with(StartOption::DbCache(2048))
            .with(StartOption::Listen(false))
            .with(StartOption::Debug(vec!["net".into(), "bench".into()]))
            .with_extra(["-prune=550"]);
        let args = opts.render();

        assert_eq!(
            &args[..5],
            &[
                "-dbcache=2048",
                "-listen=0",
                "-debug=net",
                "-debug=bench",
                "-prune=550"
            ]
        );
        for flag in BENCH_SAFETY_FLAGS {
            assert!(args.iter().any(|a| a == flag));
        }
    }

    #[test]
    fn test_safety_flags_present_without_options() {
        let args = StartOptions::new().render();
        assert_eq!(args.len(), BENCH_SAFETY_FLAGS.len());
    }

    #[test]
    fn test_arg_value_takes_last() {
        let args = vec![
            "-dbcache=100".to_string(),
            "-txindex=1".to_string(),
            "-dbcache=300".to_string(),
        ];
        assert_eq!(arg_value(&args, "dbcache"), Some("300"));
        assert_eq!(arg_value(&args, "prune"), None);
    }
}
