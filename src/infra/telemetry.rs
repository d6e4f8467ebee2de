use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    // Logs go to stderr so `paddock show` output stays pipeable.
    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InfraError::Telemetry(format!("tracing subscriber: {err}")))
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "paddock_gateway_cache_hit_total",
            Unit::Count,
            "Total number of gateway memory-cache hits."
        );
        describe_counter!(
            "paddock_gateway_cache_miss_total",
            Unit::Count,
            "Total number of gateway memory-cache misses."
        );
        describe_counter!(
            "paddock_gateway_cache_evict_total",
            Unit::Count,
            "Total number of gateway memory-cache evictions due to capacity."
        );
        describe_counter!(
            "paddock_gateway_stale_served_total",
            Unit::Count,
            "Total number of expired entries served because the backend failed."
        );
        describe_histogram!(
            "paddock_gateway_fetch_ms",
            Unit::Milliseconds,
            "Backend fetch latency in milliseconds."
        );
        describe_counter!(
            "paddock_durable_hit_total",
            Unit::Count,
            "Total number of durable fallback store hits."
        );
        describe_counter!(
            "paddock_durable_miss_total",
            Unit::Count,
            "Total number of durable fallback store misses."
        );
        describe_counter!(
            "paddock_read_fallback_total",
            Unit::Count,
            "Total number of reads answered below the gateway tier."
        );
        describe_counter!(
            "paddock_query_fetch_total",
            Unit::Count,
            "Total number of query-cache fetches issued."
        );
        describe_counter!(
            "paddock_query_hit_total",
            Unit::Count,
            "Total number of query-cache reads answered from memory."
        );
        describe_counter!(
            "paddock_change_events_total",
            Unit::Count,
            "Total number of change-feed events applied to the query cache."
        );
    });
}
