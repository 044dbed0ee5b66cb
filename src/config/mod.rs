//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    net::SocketAddr,
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cancel::CANCEL_ON_INTERVAL_CLOSE;
use crate::precache::StoreKind;

pub use cli::{CliArgs, Command, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "precache";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8787;
const DEFAULT_MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 180;
const DEFAULT_QUEUE_CONCURRENCY: u64 = 8;
const DEFAULT_PRECACHE_DIRECTORY: &str = "precache-store";
const DEFAULT_PRECACHE_MAX_ENTRIES: u64 = 1024;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub upstream: UpstreamSettings,
    pub queue: QueueSettings,
    pub precache: PreCacheSettings,
    pub cancellation: CancellationSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub max_body_bytes: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub base_url: Url,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub concurrency: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct PreCacheSettings {
    pub enabled: bool,
    pub store: StoreKind,
    pub directory: PathBuf,
    pub max_entries: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct CancellationSettings {
    pub tokens: Vec<String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("PRECACHE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    upstream: RawUpstreamSettings,
    queue: RawQueueSettings,
    precache: RawPreCacheSettings,
    cancellation: RawCancellationSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(bytes) = overrides.server_max_body_bytes {
            self.server.max_body_bytes = Some(bytes);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.upstream_base_url.as_ref() {
            self.upstream.base_url = Some(url.clone());
        }
        if let Some(seconds) = overrides.upstream_timeout_seconds {
            self.upstream.timeout_seconds = Some(seconds);
        }
        if let Some(concurrency) = overrides.queue_concurrency {
            self.queue.concurrency = Some(concurrency);
        }
        if let Some(enabled) = overrides.precache_enabled {
            self.precache.enabled = Some(enabled);
        }
        if let Some(store) = overrides.precache_store {
            self.precache.store = Some(store.as_str().to_string());
        }
        if let Some(directory) = overrides.precache_directory.as_ref() {
            self.precache.directory = Some(directory.clone());
        }
        if let Some(max) = overrides.precache_max_entries {
            self.precache.max_entries = Some(max);
        }
        if !overrides.cancel_tokens.is_empty() {
            self.cancellation.tokens = Some(overrides.cancel_tokens.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            upstream,
            queue,
            precache,
            cancellation,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let upstream = build_upstream_settings(upstream)?;
        let queue = build_queue_settings(queue)?;
        let precache = build_precache_settings(precache)?;
        let cancellation = build_cancellation_settings(cancellation)?;

        Ok(Self {
            server,
            logging,
            upstream,
            queue,
            precache,
            cancellation,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let max_body_bytes = non_zero_usize(
        server.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES),
        "server.max_body_bytes",
    )?;

    Ok(ServerSettings {
        addr,
        max_body_bytes,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let raw_url = upstream
        .base_url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LoadError::invalid("upstream.base_url", "an upstream URL is required"))?;

    let base_url = Url::parse(&raw_url)
        .map_err(|err| LoadError::invalid("upstream.base_url", format!("invalid URL: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(
            "upstream.base_url",
            format!("unsupported scheme `{}`", base_url.scheme()),
        ));
    }

    let timeout_seconds = non_zero_u64(
        upstream
            .timeout_seconds
            .unwrap_or(DEFAULT_UPSTREAM_TIMEOUT_SECS),
        "upstream.timeout_seconds",
    )?;

    Ok(UpstreamSettings {
        base_url,
        timeout: Duration::from_secs(timeout_seconds.get()),
    })
}

fn build_queue_settings(queue: RawQueueSettings) -> Result<QueueSettings, LoadError> {
    let concurrency = non_zero_usize(
        queue.concurrency.unwrap_or(DEFAULT_QUEUE_CONCURRENCY),
        "queue.concurrency",
    )?;
    Ok(QueueSettings { concurrency })
}

fn build_precache_settings(precache: RawPreCacheSettings) -> Result<PreCacheSettings, LoadError> {
    let store = match precache.store {
        Some(value) => StoreKind::from_str(&value)
            .map_err(|reason| LoadError::invalid("precache.store", reason))?,
        None => StoreKind::default(),
    };

    let directory = precache
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PRECACHE_DIRECTORY));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "precache.directory",
            "directory must not be empty",
        ));
    }

    let max_entries = non_zero_usize(
        precache
            .max_entries
            .unwrap_or(DEFAULT_PRECACHE_MAX_ENTRIES),
        "precache.max_entries",
    )?;

    Ok(PreCacheSettings {
        enabled: precache.enabled.unwrap_or(true),
        store,
        directory,
        max_entries,
    })
}

fn build_cancellation_settings(
    cancellation: RawCancellationSettings,
) -> Result<CancellationSettings, LoadError> {
    let tokens = cancellation
        .tokens
        .unwrap_or_else(|| vec![CANCEL_ON_INTERVAL_CLOSE.to_string()]);

    let mut names = Vec::with_capacity(tokens.len());
    for token in tokens {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            return Err(LoadError::invalid(
                "cancellation.tokens",
                "token names must not be empty",
            ));
        }
        if !names.iter().any(|name| name == trimmed) {
            names.push(trimmed.to_string());
        }
    }

    Ok(CancellationSettings { tokens: names })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    max_body_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    base_url: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQueueSettings {
    concurrency: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPreCacheSettings {
    enabled: Option<bool>,
    store: Option<String>,
    directory: Option<PathBuf>,
    max_entries: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCancellationSettings {
    tokens: Option<Vec<String>>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value = non_zero_u64(value, key)?;
    let value: usize = value
        .get()
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for usize"))?;
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
