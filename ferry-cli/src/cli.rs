use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use ferry_engine::{ProxyType, QuotaDecision};

/// Define CLI arguments
#[derive(Parser)]
#[command(
    version,
    about = "Resumable artifact downloader",
    long_about = "Downloads large artifacts with HTTP range requests, keeping partial\n\
                  progress in a chunk store so interrupted downloads resume where they\n\
                  stopped. Finished artifacts are assembled into a response cache."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub storage: StorageArgs,

    #[command(flatten)]
    pub http: HttpArgs,

    /// Enable verbose logging
    #[arg(short, long, global = true, help = "Enable detailed debug logging")]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Download artifacts into the cache, resuming partial downloads
    Ensure {
        #[arg(required = true)]
        urls: Vec<String>,

        /// Maximum number of downloads running at once
        #[arg(short, long, default_value = "2")]
        jobs: usize,

        /// What to do when the chunk store runs out of space
        #[arg(long, value_enum, value_name = "DECISION")]
        on_quota: Option<QuotaDecision>,

        /// Hide progress bars
        #[arg(long)]
        no_progress: bool,
    },

    /// Check that cached artifacts are present and complete
    Verify {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Remove artifacts from the cache and drop any partial download state
    Evict {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Download again any artifact whose cached copy is missing or damaged
    Repair {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// List partially downloaded artifacts held in the chunk store
    Status,

    /// Delete every partial download from the chunk store
    Clear,
}

#[derive(Args)]
pub struct StorageArgs {
    /// Directory of the persistent chunk store
    #[arg(long, global = true, default_value = ".ferry/store")]
    pub store_dir: PathBuf,

    /// Directory of the response cache
    #[arg(long, global = true, default_value = ".ferry/cache")]
    pub cache_dir: PathBuf,

    /// Chunk size with optional unit (B, KB, MB, GB)
    #[arg(long, global = true, default_value = "4MB")]
    pub chunk_size: String,

    /// Bytes buffered per download before writing chunks, with optional unit
    #[arg(long, global = true, default_value = "16MB")]
    pub flush_threshold: String,

    /// Maximum size of the chunk store with optional unit. Unlimited when unset.
    #[arg(long, global = true)]
    pub quota: Option<String>,
}

#[derive(Args)]
pub struct HttpArgs {
    /// Overall request timeout in seconds, 0 for none
    #[arg(long, global = true, default_value = "0")]
    pub timeout: u64,

    /// Connection timeout in seconds
    #[arg(long, global = true, default_value = "10")]
    pub connect_timeout: u64,

    /// Read timeout in seconds (maximum time between receiving data chunks)
    #[arg(long, global = true, default_value = "30")]
    pub read_timeout: u64,

    /// Custom HTTP headers for download requests
    #[arg(
        long = "header",
        short = 'H',
        global = true,
        help = "Add custom HTTP header to requests (can be used multiple times). Format: 'Name: Value'",
        value_name = "HEADER"
    )]
    pub headers: Vec<String>,

    /// Proxy URL (e.g., "http://proxy.example.com:8080")
    #[arg(long, global = true)]
    pub proxy: Option<String>,

    #[arg(long, global = true, value_enum, default_value = "http")]
    pub proxy_type: ProxyType,

    /// Proxy username
    #[arg(long, global = true, requires = "proxy_pass")]
    pub proxy_user: Option<String>,

    /// Proxy password
    #[arg(long, global = true, requires = "proxy_user")]
    pub proxy_pass: Option<String>,

    /// Disable all proxy settings, including the system proxy
    #[arg(long, global = true, conflicts_with = "proxy")]
    pub no_proxy: bool,
}
