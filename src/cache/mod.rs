//! Paddock cache primitives
//!
//! Two of the read tiers live here:
//!
//! - **Memory (L0)**: a TTL store keyed by [`ResourceKey`], owned by the REST
//!   gateway, with stale retention for the stale-over-empty policy.
//! - **Durable**: a failure-swallowing key/value store that survives restarts
//!   and backs the orchestrator's fallback chain.
//!
//! The query cache one level up lives in [`crate::query`].
//!
//! ## Configuration
//!
//! ```toml
//! [gateway]
//! cache_capacity = 512
//! search_ttl_seconds = 300
//!
//! [durable]
//! directory = ".paddock/cache"
//! ttl_seconds = 600
//! ```

mod config;
pub mod durable;
mod keys;
pub(crate) mod lock;
mod store;

pub use config::{CacheConfig, DEFAULT_DURABLE_NAMESPACE, DurableConfig};
pub use durable::{BackendError, DurableStore, FileBackend, KeyValueBackend, MemoryBackend};
pub use keys::{ResourceClass, ResourceKey, ResourcePrefix, UnknownResourceKey, normalize_query};
pub use store::{Entry, Freshness, TtlStore};
