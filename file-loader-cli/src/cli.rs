use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser)]
#[command(
    version,
    about = "Caching file downloader",
    long_about = "Fetches files into a local cache and serves them from disk until they go stale.\n\
                  Concurrent requests for the same URL share one download, and the number of\n\
                  simultaneous transfers is bounded."
)]
pub struct CliArgs {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, help = "Path to a TOML configuration file")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true, help = "Append logs to this file in addition to stderr")]
    pub log_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: ConfigOverrides,

    #[command(subcommand)]
    pub command: Command,
}

/// Command-line overrides applied on top of the loaded configuration
#[derive(Args, Debug, Default)]
pub struct ConfigOverrides {
    #[arg(long, global = true, help = "Directory holding the cache and its metadata")]
    pub cache_root: Option<PathBuf>,

    #[arg(long, global = true, help = "Time in milliseconds before an unused file goes stale")]
    pub ttl_ms: Option<u64>,

    #[arg(long, global = true, help = "Maximum number of simultaneous downloads")]
    pub max_concurrent: Option<usize>,

    #[arg(long, global = true, help = "Per-request timeout in milliseconds")]
    pub timeout_ms: Option<u64>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Resolve URLs through the cache, downloading when needed
    Get {
        #[arg(required = true, help = "URL(s) to fetch")]
        urls: Vec<String>,

        #[arg(short, long, help = "Download even if a fresh copy is cached")]
        force: bool,

        #[arg(
            long,
            help = "Treat the network as unavailable: serve fresh cached files, fail the rest"
        )]
        offline: bool,

        #[arg(
            short = 'H',
            long = "header",
            help = "Add a request header in 'Name: Value' form (repeatable)"
        )]
        headers: Vec<String>,
    },

    /// Remove stale entries from the cache
    Gc {
        #[arg(short, long, help = "Remove every entry, not only stale ones")]
        force: bool,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the default configuration file location
    Path,
}
