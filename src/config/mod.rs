//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::query::Namespace;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "paddock";
const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:54321/";
const DEFAULT_STORAGE_BUCKET: &str = "post-images";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

const DEFAULT_CACHE_CAPACITY: usize = 512;
const DEFAULT_SEARCH_TTL_SECS: u64 = 5 * 60;
const DEFAULT_LIST_TTL_SECS: u64 = 10 * 60;
const DEFAULT_SCOPED_LIST_TTL_SECS: u64 = 20 * 60;
const DEFAULT_DETAIL_TTL_SECS: u64 = 60 * 60;
const DEFAULT_REFERENCE_TTL_SECS: u64 = 60 * 60;
const DEFAULT_STALE_RETENTION_SECS: u64 = 24 * 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

const DEFAULT_DURABLE_DIR: &str = ".paddock/cache";
const DEFAULT_DURABLE_TTL_SECS: u64 = 10 * 60;
const DEFAULT_DURABLE_CATEGORIES_TTL_SECS: u64 = 4 * 60 * 60;

const DEFAULT_PRIMARY_TIMEOUT_SECS: u64 = 8;
const DEFAULT_DETAIL_TIMEOUT_SECS: u64 = 15;
const DEFAULT_ASSET_GRACE_SECS: u64 = 30;
const DEFAULT_IMAGE_WIDTH: u32 = 1200;
const DEFAULT_IMAGE_QUALITY: u8 = 75;

const DEFAULT_QUERY_STALE_SECS: u64 = 5 * 60;
const DEFAULT_QUERY_GC_SECS: u64 = 30 * 60;
const DEFAULT_QUERY_GC_INTERVAL_SECS: u64 = 60;
const DEFAULT_QUERY_RETRIES: u32 = 2;
const DEFAULT_QUERY_RETRY_BASE_MS: u64 = 1_000;
const DEFAULT_QUERY_RETRY_CAP_MS: u64 = 4_000;
const DEFAULT_PERSIST_MAX_AGE_SECS: u64 = 24 * 60 * 60;
const DEFAULT_PERSIST_THROTTLE_MS: u64 = 1_000;

const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_BACKOFF_MIN_MS: u64 = 1_000;
const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
const DEFAULT_TABLES: [&str; 2] = ["posts", "categories"];

/// Command-line arguments for the Paddock binary.
#[derive(Debug, Parser)]
#[command(name = "paddock", version, about = "Paddock content cache operator")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PADDOCK_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Drop every cache tier and re-prime the landing resources.
    Refresh,
    /// Clear the durable store and the persisted query snapshot.
    Clear,
    /// Read one resource through the cache tiers and print it as JSON.
    Show(ShowArgs),
    /// Follow the change feed and keep the caches in step until interrupted.
    Watch(WatchArgs),
}

#[derive(Debug, Args, Clone)]
pub struct ShowArgs {
    #[command(subcommand)]
    pub resource: ShowResource,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
pub enum ShowResource {
    Featured,
    Items,
    Category { id: String },
    Item { id: i64 },
    Categories,
    Hierarchy,
    Search { query: String },
}

#[derive(Debug, Args, Default, Clone)]
pub struct WatchArgs {
    /// Tables to follow; defaults to the configured list.
    #[arg(long = "table", value_name = "TABLE")]
    pub tables: Vec<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the backend base URL.
    #[arg(long = "backend-url", global = true, value_name = "URL")]
    pub backend_url: Option<String>,

    /// Override the durable store directory.
    #[arg(long = "durable-dir", global = true, value_name = "PATH")]
    pub durable_dir: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        global = true,
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub backend: BackendSettings,
    pub gateway: GatewaySettings,
    pub durable: DurableSettings,
    pub orchestrator: OrchestratorSettings,
    pub query: QuerySettings,
    pub realtime: RealtimeSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub url: Url,
    pub anon_key: String,
    /// Bearer token for writes; reads stay anonymous.
    pub service_token: Option<String>,
    pub storage_bucket: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub cache_enabled: bool,
    pub cache_capacity: NonZeroUsize,
    pub search_ttl: Duration,
    pub list_ttl: Duration,
    pub scoped_list_ttl: Duration,
    pub detail_ttl: Duration,
    pub reference_ttl: Duration,
    pub stale_retention: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct DurableSettings {
    pub directory: PathBuf,
    pub ttl: Duration,
    pub categories_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub primary_timeout: Duration,
    pub detail_timeout: Duration,
    pub asset_grace: Duration,
    pub image_width: u32,
    pub image_quality: u8,
}

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub stale_time: Duration,
    pub gc_time: Duration,
    pub gc_interval: Duration,
    pub retries: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub persist_max_age: Duration,
    pub persist_throttle: Duration,
    pub persisted_namespaces: Vec<Namespace>,
}

#[derive(Debug, Clone)]
pub struct RealtimeSettings {
    /// Websocket endpoint; derived from the backend URL when unset.
    pub endpoint: Option<Url>,
    pub heartbeat: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub tables: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
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

    builder = builder.add_source(
        Environment::with_prefix("PADDOCK")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("realtime.tables")
            .with_list_parse_key("query.persisted_namespaces")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);
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
    backend: RawBackendSettings,
    gateway: RawGatewaySettings,
    durable: RawDurableSettings,
    orchestrator: RawOrchestratorSettings,
    query: RawQuerySettings,
    realtime: RawRealtimeSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(url) = overrides.backend_url.as_ref() {
            self.backend.url = Some(url.clone());
        }
        if let Some(directory) = overrides.durable_dir.as_ref() {
            self.durable.directory = Some(directory.clone());
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            backend,
            gateway,
            durable,
            orchestrator,
            query,
            realtime,
            logging,
        } = raw;

        Ok(Self {
            backend: build_backend_settings(backend)?,
            gateway: build_gateway_settings(gateway)?,
            durable: build_durable_settings(durable)?,
            orchestrator: build_orchestrator_settings(orchestrator)?,
            query: build_query_settings(query)?,
            realtime: build_realtime_settings(realtime)?,
            logging: build_logging_settings(logging)?,
        })
    }
}

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    let raw_url = backend
        .url
        .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
    let url = parse_http_url(&raw_url, "backend.url")?;

    let service_token = non_blank(backend.service_token);
    let storage_bucket = non_blank(backend.storage_bucket)
        .unwrap_or_else(|| DEFAULT_STORAGE_BUCKET.to_string());

    Ok(BackendSettings {
        url,
        anon_key: backend.anon_key.unwrap_or_default().trim().to_string(),
        service_token,
        storage_bucket,
        request_timeout: seconds(
            backend.request_timeout_seconds,
            DEFAULT_REQUEST_TIMEOUT_SECS,
            "backend.request_timeout_seconds",
        )?,
    })
}

fn build_gateway_settings(gateway: RawGatewaySettings) -> Result<GatewaySettings, LoadError> {
    let capacity = gateway.cache_capacity.unwrap_or(DEFAULT_CACHE_CAPACITY);
    let cache_capacity = NonZeroUsize::new(capacity)
        .ok_or_else(|| LoadError::invalid("gateway.cache_capacity", "must be greater than zero"))?;

    Ok(GatewaySettings {
        cache_enabled: gateway.cache_enabled.unwrap_or(true),
        cache_capacity,
        search_ttl: seconds(
            gateway.search_ttl_seconds,
            DEFAULT_SEARCH_TTL_SECS,
            "gateway.search_ttl_seconds",
        )?,
        list_ttl: seconds(
            gateway.list_ttl_seconds,
            DEFAULT_LIST_TTL_SECS,
            "gateway.list_ttl_seconds",
        )?,
        scoped_list_ttl: seconds(
            gateway.scoped_list_ttl_seconds,
            DEFAULT_SCOPED_LIST_TTL_SECS,
            "gateway.scoped_list_ttl_seconds",
        )?,
        detail_ttl: seconds(
            gateway.detail_ttl_seconds,
            DEFAULT_DETAIL_TTL_SECS,
            "gateway.detail_ttl_seconds",
        )?,
        reference_ttl: seconds(
            gateway.reference_ttl_seconds,
            DEFAULT_REFERENCE_TTL_SECS,
            "gateway.reference_ttl_seconds",
        )?,
        stale_retention: Duration::from_secs(
            gateway
                .stale_retention_seconds
                .unwrap_or(DEFAULT_STALE_RETENTION_SECS),
        ),
        sweep_interval: seconds(
            gateway.sweep_interval_seconds,
            DEFAULT_SWEEP_INTERVAL_SECS,
            "gateway.sweep_interval_seconds",
        )?,
    })
}

fn build_durable_settings(durable: RawDurableSettings) -> Result<DurableSettings, LoadError> {
    let directory = durable
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DURABLE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "durable.directory",
            "path must not be empty",
        ));
    }

    Ok(DurableSettings {
        directory,
        ttl: seconds(
            durable.ttl_seconds,
            DEFAULT_DURABLE_TTL_SECS,
            "durable.ttl_seconds",
        )?,
        categories_ttl: seconds(
            durable.categories_ttl_seconds,
            DEFAULT_DURABLE_CATEGORIES_TTL_SECS,
            "durable.categories_ttl_seconds",
        )?,
    })
}

fn build_orchestrator_settings(
    orchestrator: RawOrchestratorSettings,
) -> Result<OrchestratorSettings, LoadError> {
    let image_width = orchestrator.image_width.unwrap_or(DEFAULT_IMAGE_WIDTH);
    if image_width == 0 {
        return Err(LoadError::invalid(
            "orchestrator.image_width",
            "must be greater than zero",
        ));
    }
    let image_quality = orchestrator.image_quality.unwrap_or(DEFAULT_IMAGE_QUALITY);
    if !(1..=100).contains(&image_quality) {
        return Err(LoadError::invalid(
            "orchestrator.image_quality",
            "must be between 1 and 100",
        ));
    }

    Ok(OrchestratorSettings {
        primary_timeout: seconds(
            orchestrator.primary_timeout_seconds,
            DEFAULT_PRIMARY_TIMEOUT_SECS,
            "orchestrator.primary_timeout_seconds",
        )?,
        detail_timeout: seconds(
            orchestrator.detail_timeout_seconds,
            DEFAULT_DETAIL_TIMEOUT_SECS,
            "orchestrator.detail_timeout_seconds",
        )?,
        asset_grace: Duration::from_secs(
            orchestrator
                .asset_grace_seconds
                .unwrap_or(DEFAULT_ASSET_GRACE_SECS),
        ),
        image_width,
        image_quality,
    })
}

fn build_query_settings(query: RawQuerySettings) -> Result<QuerySettings, LoadError> {
    let retry_base = millis(
        query.retry_base_ms,
        DEFAULT_QUERY_RETRY_BASE_MS,
        "query.retry_base_ms",
    )?;
    let retry_cap = millis(
        query.retry_cap_ms,
        DEFAULT_QUERY_RETRY_CAP_MS,
        "query.retry_cap_ms",
    )?;
    if retry_cap < retry_base {
        return Err(LoadError::invalid(
            "query.retry_cap_ms",
            "must not be smaller than query.retry_base_ms",
        ));
    }

    let persisted_namespaces = match query.persisted_namespaces {
        Some(values) => values
            .iter()
            .map(|value| {
                Namespace::from_str(value.trim()).map_err(|_| {
                    LoadError::invalid(
                        "query.persisted_namespaces",
                        format!("unknown namespace `{value}`"),
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        None => vec![Namespace::Public],
    };

    Ok(QuerySettings {
        stale_time: Duration::from_secs(
            query.stale_time_seconds.unwrap_or(DEFAULT_QUERY_STALE_SECS),
        ),
        gc_time: seconds(
            query.gc_time_seconds,
            DEFAULT_QUERY_GC_SECS,
            "query.gc_time_seconds",
        )?,
        gc_interval: seconds(
            query.gc_interval_seconds,
            DEFAULT_QUERY_GC_INTERVAL_SECS,
            "query.gc_interval_seconds",
        )?,
        retries: query.retries.unwrap_or(DEFAULT_QUERY_RETRIES),
        retry_base,
        retry_cap,
        persist_max_age: seconds(
            query.persist_max_age_seconds,
            DEFAULT_PERSIST_MAX_AGE_SECS,
            "query.persist_max_age_seconds",
        )?,
        persist_throttle: Duration::from_millis(
            query
                .persist_throttle_ms
                .unwrap_or(DEFAULT_PERSIST_THROTTLE_MS),
        ),
        persisted_namespaces,
    })
}

fn build_realtime_settings(realtime: RawRealtimeSettings) -> Result<RealtimeSettings, LoadError> {
    let endpoint = match non_blank(realtime.endpoint) {
        Some(raw) => {
            let url = Url::parse(&raw).map_err(|err| {
                LoadError::invalid("realtime.endpoint", format!("invalid url `{raw}`: {err}"))
            })?;
            if !matches!(url.scheme(), "ws" | "wss") {
                return Err(LoadError::invalid(
                    "realtime.endpoint",
                    "scheme must be ws or wss",
                ));
            }
            Some(url)
        }
        None => None,
    };

    let backoff_min = millis(
        realtime.backoff_min_ms,
        DEFAULT_BACKOFF_MIN_MS,
        "realtime.backoff_min_ms",
    )?;
    let backoff_max = millis(
        realtime.backoff_max_ms,
        DEFAULT_BACKOFF_MAX_MS,
        "realtime.backoff_max_ms",
    )?;
    if backoff_max < backoff_min {
        return Err(LoadError::invalid(
            "realtime.backoff_max_ms",
            "must not be smaller than realtime.backoff_min_ms",
        ));
    }

    let tables = match realtime.tables {
        Some(tables) => tables
            .into_iter()
            .map(|table| table.trim().to_string())
            .collect::<Vec<_>>(),
        None => DEFAULT_TABLES.iter().map(|table| table.to_string()).collect(),
    };
    if tables.is_empty() || tables.iter().any(String::is_empty) {
        return Err(LoadError::invalid(
            "realtime.tables",
            "table names must not be empty",
        ));
    }

    Ok(RealtimeSettings {
        endpoint,
        heartbeat: seconds(
            realtime.heartbeat_seconds,
            DEFAULT_HEARTBEAT_SECS,
            "realtime.heartbeat_seconds",
        )?,
        backoff_min,
        backoff_max,
        tables,
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

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    url: Option<String>,
    anon_key: Option<String>,
    service_token: Option<String>,
    storage_bucket: Option<String>,
    request_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGatewaySettings {
    cache_enabled: Option<bool>,
    cache_capacity: Option<usize>,
    search_ttl_seconds: Option<u64>,
    list_ttl_seconds: Option<u64>,
    scoped_list_ttl_seconds: Option<u64>,
    detail_ttl_seconds: Option<u64>,
    reference_ttl_seconds: Option<u64>,
    stale_retention_seconds: Option<u64>,
    sweep_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDurableSettings {
    directory: Option<PathBuf>,
    ttl_seconds: Option<u64>,
    categories_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOrchestratorSettings {
    primary_timeout_seconds: Option<u64>,
    detail_timeout_seconds: Option<u64>,
    asset_grace_seconds: Option<u64>,
    image_width: Option<u32>,
    image_quality: Option<u8>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawQuerySettings {
    stale_time_seconds: Option<u64>,
    gc_time_seconds: Option<u64>,
    gc_interval_seconds: Option<u64>,
    retries: Option<u32>,
    retry_base_ms: Option<u64>,
    retry_cap_ms: Option<u64>,
    persist_max_age_seconds: Option<u64>,
    persist_throttle_ms: Option<u64>,
    persisted_namespaces: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRealtimeSettings {
    endpoint: Option<String>,
    heartbeat_seconds: Option<u64>,
    backoff_min_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    tables: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

fn parse_http_url(raw: &str, key: &'static str) -> Result<Url, LoadError> {
    let trimmed = raw.trim();
    // `Url::join` treats the last segment as a file unless it ends in a slash.
    let normalized = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    let url = Url::parse(&normalized)
        .map_err(|err| LoadError::invalid(key, format!("invalid url `{trimmed}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LoadError::invalid(key, "scheme must be http or https"));
    }
    Ok(url)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn seconds(value: Option<u64>, default: u64, key: &'static str) -> Result<Duration, LoadError> {
    let value = value.unwrap_or(default);
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn millis(value: Option<u64>, default: u64, key: &'static str) -> Result<Duration, LoadError> {
    let value = value.unwrap_or(default);
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}
