use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

use crate::precache::StoreKind;

/// Command-line arguments for the precache binary.
#[derive(Debug, Parser)]
#[command(
    name = "precache",
    version,
    about = "Speculative pre-cache proxy with priority-scheduled priming"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PRECACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the proxy.
    Serve(Box<ServeArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the largest request body accepted, in bytes.
    #[arg(long = "server-max-body-bytes", value_name = "BYTES")]
    pub server_max_body_bytes: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the upstream base URL requests are forwarded to.
    #[arg(long = "upstream-base-url", value_name = "URL")]
    pub upstream_base_url: Option<String>,

    /// Override the upstream request timeout.
    #[arg(long = "upstream-timeout-seconds", value_name = "SECONDS")]
    pub upstream_timeout_seconds: Option<u64>,

    /// Override how many priming jobs may run at once.
    #[arg(long = "queue-concurrency", value_name = "COUNT")]
    pub queue_concurrency: Option<u64>,

    /// Enable or disable the pre-cache layer.
    #[arg(
        long = "precache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub precache_enabled: Option<bool>,

    /// Override where primed responses are kept.
    #[arg(long = "precache-store", value_name = "KIND")]
    pub precache_store: Option<StoreKind>,

    /// Override the disk store directory.
    #[arg(long = "precache-directory", value_name = "PATH")]
    pub precache_directory: Option<PathBuf>,

    /// Override the memory store capacity.
    #[arg(long = "precache-max-entries", value_name = "COUNT")]
    pub precache_max_entries: Option<u64>,

    /// Replace the registered cancellation token names. Repeatable.
    #[arg(long = "cancel-token", value_name = "NAME")]
    pub cancel_tokens: Vec<String>,
}
