//! Cache key definitions.
//!
//! `ResourceKey` names one logical backend read (resource + filters + order +
//! limit). It is the key of the gateway's memory cache and, rendered as a
//! string, of the durable fallback store. `ResourcePrefix` selects a family of
//! keys for invalidation.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::config::CacheConfig;

/// A logical backend read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKey {
    /// Published, trending items.
    Featured,
    /// Every published item, newest first.
    Items,
    /// Published items of one category.
    ItemsByCategory(String),
    /// A single published item.
    ItemById(i64),
    /// Active categories.
    Categories,
    /// Free-text search over published items (normalised query).
    Search(String),
}

/// TTL class of a resource; drives both the memory TTL and the HTTP
/// `Cache-Control` hint sent to intermediaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Search,
    List,
    ScopedList,
    Detail,
    Reference,
}

/// A family of resource keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourcePrefix {
    /// Every cached resource.
    All,
    /// Every post-derived resource (lists, details, searches).
    Posts,
    /// Featured, all-items, every category-scoped list and every search.
    Lists,
    Featured,
    Items,
    /// The list of one category.
    Category(String),
    /// Every category-scoped list.
    AnyCategory,
    Item(i64),
    Categories,
    Search,
}

impl ResourceKey {
    /// Build a search key; queries are trimmed and lower-cased so equivalent
    /// searches share one entry.
    pub fn search(query: &str) -> Self {
        Self::Search(normalize_query(query))
    }

    pub fn class(&self) -> ResourceClass {
        match self {
            ResourceKey::Search(_) => ResourceClass::Search,
            ResourceKey::Featured | ResourceKey::Items => ResourceClass::List,
            ResourceKey::ItemsByCategory(_) => ResourceClass::ScopedList,
            ResourceKey::ItemById(_) => ResourceClass::Detail,
            ResourceKey::Categories => ResourceClass::Reference,
        }
    }

    pub fn matches(&self, prefix: &ResourcePrefix) -> bool {
        match prefix {
            ResourcePrefix::All => true,
            ResourcePrefix::Posts => !matches!(self, ResourceKey::Categories),
            ResourcePrefix::Lists => matches!(
                self,
                ResourceKey::Featured
                    | ResourceKey::Items
                    | ResourceKey::ItemsByCategory(_)
                    | ResourceKey::Search(_)
            ),
            ResourcePrefix::Featured => matches!(self, ResourceKey::Featured),
            ResourcePrefix::Items => matches!(self, ResourceKey::Items),
            ResourcePrefix::Category(id) => {
                matches!(self, ResourceKey::ItemsByCategory(own) if own == id)
            }
            ResourcePrefix::AnyCategory => matches!(self, ResourceKey::ItemsByCategory(_)),
            ResourcePrefix::Item(id) => matches!(self, ResourceKey::ItemById(own) if own == id),
            ResourcePrefix::Categories => matches!(self, ResourceKey::Categories),
            ResourcePrefix::Search => matches!(self, ResourceKey::Search(_)),
        }
    }

    /// Backend table this resource is read from.
    pub fn table(&self) -> &'static str {
        match self {
            ResourceKey::Categories => "categories",
            _ => "posts",
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Featured => f.write_str("posts:featured"),
            ResourceKey::Items => f.write_str("posts:all"),
            ResourceKey::ItemsByCategory(id) => write!(f, "posts:category:{id}"),
            ResourceKey::ItemById(id) => write!(f, "posts:item:{id}"),
            ResourceKey::Categories => f.write_str("categories:all"),
            ResourceKey::Search(query) => write!(f, "posts:search:{query}"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unrecognised resource key `{0}`")]
pub struct UnknownResourceKey(pub String);

impl FromStr for ResourceKey {
    type Err = UnknownResourceKey;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let unknown = || UnknownResourceKey(value.to_string());
        match value {
            "posts:featured" => return Ok(ResourceKey::Featured),
            "posts:all" => return Ok(ResourceKey::Items),
            "categories:all" => return Ok(ResourceKey::Categories),
            _ => {}
        }
        if let Some(id) = value.strip_prefix("posts:category:") {
            return Ok(ResourceKey::ItemsByCategory(id.to_string()));
        }
        if let Some(id) = value.strip_prefix("posts:item:") {
            return id.parse().map(ResourceKey::ItemById).map_err(|_| unknown());
        }
        if let Some(query) = value.strip_prefix("posts:search:") {
            return Ok(ResourceKey::Search(query.to_string()));
        }
        Err(unknown())
    }
}

impl ResourceClass {
    pub fn ttl(self, config: &CacheConfig) -> Duration {
        match self {
            ResourceClass::Search => config.search_ttl,
            ResourceClass::List => config.list_ttl,
            ResourceClass::ScopedList => config.scoped_list_ttl,
            ResourceClass::Detail => config.detail_ttl,
            ResourceClass::Reference => config.reference_ttl,
        }
    }

    /// `Cache-Control` request header value for intermediaries.
    pub fn cache_control(self, config: &CacheConfig) -> String {
        let max_age = self.ttl(config).as_secs();
        format!("public, max-age={max_age}, stale-while-revalidate={max_age}")
    }
}

pub fn normalize_query(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}
