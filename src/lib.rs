//! Paddock: the multi-tier read cache and realtime sync core of a motorsport
//! news site.
//!
//! Reads flow from the query cache ([`query`]) through the content service
//! ([`application::content`]) to the REST gateway and its memory cache
//! ([`infra::gateway`]), falling back to the durable store ([`cache`]) and a
//! built-in taxonomy when the backend is unreachable. The change feed
//! ([`realtime`]) keeps every tier in step with committed row changes.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod query;
pub mod realtime;
