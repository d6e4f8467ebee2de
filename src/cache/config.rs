//! Cache configuration.
//!
//! Controls the gateway's memory cache and the durable fallback store via
//! `paddock.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

const DEFAULT_CAPACITY: usize = 512;
const DEFAULT_SEARCH_TTL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_LIST_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_SCOPED_LIST_TTL: Duration = Duration::from_secs(20 * 60);
const DEFAULT_DETAIL_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_REFERENCE_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_STALE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const DEFAULT_DURABLE_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_DURABLE_CATEGORIES_TTL: Duration = Duration::from_secs(4 * 60 * 60);
pub const DEFAULT_DURABLE_NAMESPACE: &str = "paddock:";

/// Gateway memory-cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Serve reads from memory at all.
    pub enabled: bool,
    /// Maximum number of resource entries kept in memory.
    pub capacity: usize,
    pub search_ttl: Duration,
    /// Featured and all-items lists.
    pub list_ttl: Duration,
    /// Category-scoped lists.
    pub scoped_list_ttl: Duration,
    /// Single-item reads.
    pub detail_ttl: Duration,
    /// Categories.
    pub reference_ttl: Duration,
    /// How long an expired entry is kept around as a stale fallback.
    pub stale_retention: Duration,
    /// Cadence of the background sweep that evicts fully expired entries.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_CAPACITY,
            search_ttl: DEFAULT_SEARCH_TTL,
            list_ttl: DEFAULT_LIST_TTL,
            scoped_list_ttl: DEFAULT_SCOPED_LIST_TTL,
            detail_ttl: DEFAULT_DETAIL_TTL,
            reference_ttl: DEFAULT_REFERENCE_TTL,
            stale_retention: DEFAULT_STALE_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl From<&crate::config::GatewaySettings> for CacheConfig {
    fn from(settings: &crate::config::GatewaySettings) -> Self {
        Self {
            enabled: settings.cache_enabled,
            capacity: settings.cache_capacity.get(),
            search_ttl: settings.search_ttl,
            list_ttl: settings.list_ttl,
            scoped_list_ttl: settings.scoped_list_ttl,
            detail_ttl: settings.detail_ttl,
            reference_ttl: settings.reference_ttl,
            stale_retention: settings.stale_retention,
            sweep_interval: settings.sweep_interval,
        }
    }
}

impl CacheConfig {
    /// Returns the capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }
}

/// Durable fallback store configuration.
#[derive(Debug, Clone)]
pub struct DurableConfig {
    /// Prefix applied to every key this store writes.
    pub namespace: String,
    /// Freshness window for content entries.
    pub ttl: Duration,
    /// Freshness window for the categories backup.
    pub categories_ttl: Duration,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_DURABLE_NAMESPACE.to_string(),
            ttl: DEFAULT_DURABLE_TTL,
            categories_ttl: DEFAULT_DURABLE_CATEGORIES_TTL,
        }
    }
}

impl From<&crate::config::DurableSettings> for DurableConfig {
    fn from(settings: &crate::config::DurableSettings) -> Self {
        Self {
            namespace: DEFAULT_DURABLE_NAMESPACE.to_string(),
            ttl: settings.ttl,
            categories_ttl: settings.categories_ttl,
        }
    }
}
