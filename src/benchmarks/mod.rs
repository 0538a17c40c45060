pub mod command;
pub mod ibd;
pub mod logparse;
pub mod names;
pub mod results;
mod runner;
pub mod sink;

pub use command::{run_command_benchmark, run_microbench, CommandBench};
pub use ibd::{
    FailureHeuristics, IbdConfig, IbdKind, IbdRunner, NodeContext, NodeStrategy, PlannedNode,
    PollingSettings, ServerNodeSettings,
};
pub use results::{
    BenchmarkResult, FailureKind, HeightSample, MicrobenchRow, ResultPayload, RunState,
    SyncPayload,
};
pub use runner::{MainRunner, SessionReport};
pub use sink::{FanoutSink, LogSink, Measurement, MemorySink, ResultSink, Units};
