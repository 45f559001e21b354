use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

const DEFAULT_LATENCY_MS: u64 = 20;

/// Command-line arguments for the optimist binary.
#[derive(Debug, Parser)]
#[command(
    name = "optimist",
    version,
    about = "Optimistic-mutation cache coordinator demo"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "OPTIMIST_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Replay the like, comment, and profile scenarios against an in-memory forum.
    Simulate(SimulateArgs),
    /// Print the effective invalidation graph.
    Graph(GraphArgs),
}

#[derive(Debug, Args, Clone, Default)]
pub struct GraphArgs {
    /// Print the graph as a JSON object of category to key templates.
    #[arg(long = "json", action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    /// Make the first like toggle fail on the server.
    #[arg(long = "fail-like", action = clap::ArgAction::SetTrue)]
    pub fail_like: bool,

    /// Make the first comment post fail on the server.
    #[arg(long = "fail-comment", action = clap::ArgAction::SetTrue)]
    pub fail_comment: bool,

    /// Simulated server latency per call.
    #[arg(long = "latency-ms", default_value_t = DEFAULT_LATENCY_MS, value_name = "MS")]
    pub latency_ms: u64,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            fail_like: false,
            fail_comment: false,
            latency_ms: DEFAULT_LATENCY_MS,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the cache capacity (0 disables eviction).
    #[arg(long = "cache-max-entries", value_name = "COUNT", global = true)]
    pub cache_max_entries: Option<usize>,

    /// Override the age after which cached values count as stale (0 disables).
    #[arg(long = "cache-stale-after-ms", value_name = "MS", global = true)]
    pub cache_stale_after_ms: Option<u64>,
}
