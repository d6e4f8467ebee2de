//! REST gateway: the single point of HTTP access to the backend.
//!
//! Reads go through a memory cache keyed by [`ResourceKey`]; a miss issues a
//! PostgREST query carrying a class-appropriate `Cache-Control` hint so CDNs
//! can answer too. Transient failures fall back to the last retained entry
//! (stale-over-empty) and only propagate when nothing was ever cached.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, histogram};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::application::repos::{
    ContentReader, ContentWriter, Fetched, Payload, Principal, RepoError,
};
use crate::cache::lock::mutex_lock;
use crate::cache::{CacheConfig, Freshness, ResourceKey, ResourcePrefix, TtlStore};
use crate::domain::categories::retain_displayable;
use crate::domain::entities::{Category, CategoryInput, ContentItem, ItemChanges, ItemInput};

use super::error::InfraError;

const SOURCE: &str = "infra::gateway";
const METRIC_FETCH_MS: &str = "paddock_gateway_fetch_ms";
const METRIC_STALE: &str = "paddock_gateway_stale_served_total";
const BUST_TIMEOUT: Duration = Duration::from_secs(3);

/// Row limits applied to list reads.
#[derive(Debug, Clone, Copy)]
pub struct ListLimits {
    pub featured: u32,
    pub items: u32,
    pub category: u32,
    pub search: u32,
}

impl Default for ListLimits {
    fn default() -> Self {
        Self {
            featured: 6,
            items: 100,
            category: 50,
            search: 20,
        }
    }
}

/// Everything the gateway needs to reach the backend.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Project URL, e.g. `https://xyz.supabase.co`.
    pub base_url: Url,
    /// Public (anonymous) API key.
    pub anon_key: String,
    /// Hard upper bound for any single HTTP exchange.
    pub request_timeout: Duration,
    pub limits: ListLimits,
    pub cache: CacheConfig,
}

/// PostgREST error body.
#[derive(Debug, Default, Deserialize)]
struct BackendErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Option<String>,
}

pub struct RestGateway {
    client: Client,
    rest_base: Url,
    anon_key: String,
    limits: ListLimits,
    request_timeout: Duration,
    config: CacheConfig,
    cache: TtlStore<ResourceKey, Payload>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RestGateway {
    pub fn new(options: GatewayOptions) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(concat!("paddock/", env!("CARGO_PKG_VERSION")))
            .timeout(options.request_timeout)
            .build()
            .map_err(InfraError::HttpClient)?;
        let rest_base = options
            .base_url
            .join("rest/v1/")
            .map_err(|err| InfraError::endpoint("rest", err.to_string()))?;

        Ok(Self {
            client,
            rest_base,
            anon_key: options.anon_key,
            limits: options.limits,
            request_timeout: options.request_timeout,
            cache: TtlStore::new(&options.cache),
            config: options.cache,
            sweeper: Mutex::new(None),
        })
    }

    /// Start the background sweep that evicts entries past their stale
    /// retention window.
    pub fn init(self: &Arc<Self>) {
        let mut sweeper = mutex_lock(&self.sweeper, SOURCE, "init");
        if sweeper.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let every = self.config.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(gateway) = weak.upgrade() else {
                    break;
                };
                let evicted = gateway.cache.purge_expired(gateway.config.stale_retention);
                if evicted > 0 {
                    debug!(evicted, "Swept expired gateway entries");
                }
            }
        }));
    }

    /// Stop the sweeper. Cached entries stay until the gateway is dropped.
    pub fn dispose(&self) {
        if let Some(handle) = mutex_lock(&self.sweeper, SOURCE, "dispose").take() {
            handle.abort();
        }
    }

    /// Number of entries currently held in memory (valid or stale).
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    fn send_error(&self, err: reqwest::Error) -> RepoError {
        if err.is_timeout() {
            RepoError::Timeout(self.request_timeout)
        } else {
            RepoError::transport(err)
        }
    }

    fn table_url(&self, table: &str) -> Result<Url, RepoError> {
        self.rest_base.join(table).map_err(RepoError::transport)
    }

    fn request(&self, method: Method, url: Url, bearer: Option<&str>) -> RequestBuilder {
        let token = bearer.unwrap_or(self.anon_key.as_str());
        self.client
            .request(method, url)
            .header("apikey", self.anon_key.as_str())
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .header(header::ACCEPT, "application/json")
    }

    fn read_query(&self, key: &ResourceKey) -> Vec<(&'static str, String)> {
        let mut query = vec![("select", "*".to_string())];
        match key {
            ResourceKey::Featured => {
                query.push(("published", "eq.true".into()));
                query.push(("trending", "eq.true".into()));
                query.push(("order", "created_at.desc".into()));
                query.push(("limit", self.limits.featured.to_string()));
            }
            ResourceKey::Items => {
                query.push(("published", "eq.true".into()));
                query.push(("order", "created_at.desc".into()));
                query.push(("limit", self.limits.items.to_string()));
            }
            ResourceKey::ItemsByCategory(category) => {
                query.push(("published", "eq.true".into()));
                query.push(("category", format!("eq.{category}")));
                query.push(("order", "created_at.desc".into()));
                query.push(("limit", self.limits.category.to_string()));
            }
            ResourceKey::ItemById(id) => {
                query.push(("id", format!("eq.{id}")));
                query.push(("published", "eq.true".into()));
                query.push(("limit", "1".into()));
            }
            ResourceKey::Categories => {
                query.push(("is_active", "eq.true".into()));
                query.push(("order", "level.asc,name.asc".into()));
            }
            ResourceKey::Search(text) => {
                let pattern = search_pattern(text);
                query.push(("published", "eq.true".into()));
                query.push((
                    "or",
                    format!(
                        "(title.ilike.{pattern},excerpt.ilike.{pattern},content.ilike.{pattern})"
                    ),
                ));
                query.push(("order", "created_at.desc".into()));
                query.push(("limit", self.limits.search.to_string()));
            }
        }
        query
    }

    async fn load(&self, key: &ResourceKey) -> Result<Payload, RepoError> {
        let url = self.table_url(key.table())?;
        let mut request = self
            .request(Method::GET, url, None)
            .query(&self.read_query(key))
            .header(header::CACHE_CONTROL, key.class().cache_control(&self.config));
        if matches!(key, ResourceKey::Categories) {
            request = request.header("Prefer", "count=exact");
        }

        let response = request.send().await.map_err(|err| self.send_error(err))?;
        let response = ensure_success(response).await?;

        match key {
            ResourceKey::Categories => {
                let expected = content_range_total(response.headers());
                let rows: Vec<Category> = decode(response).await?;
                let received = rows.len();
                let (categories, dropped) = retain_displayable(rows);
                if dropped > 0 {
                    warn!(dropped, "Discarded categories missing id or name");
                }
                if let Some(expected) = expected
                    && expected != received
                {
                    warn!(expected, received, "Category count mismatch");
                }
                Ok(Payload::Categories(Arc::new(categories)))
            }
            ResourceKey::ItemById(_) => {
                let mut rows: Vec<ContentItem> = decode(response).await?;
                match rows.pop() {
                    Some(item) => Ok(Payload::Item(Arc::new(item))),
                    None => Err(RepoError::NotFound),
                }
            }
            _ => {
                let rows: Vec<ContentItem> = decode(response).await?;
                Ok(Payload::Items(Arc::new(rows)))
            }
        }
    }

    /// Ask intermediaries to drop what they hold for `table`.
    async fn bust_http_cache(&self, table: &str) {
        let Ok(mut url) = self.table_url(table) else {
            return;
        };
        url.query_pairs_mut()
            .append_pair("select", "id")
            .append_pair("limit", "1")
            .append_pair("_cb", &crate::cache::durable::now_millis().to_string());
        let request = self
            .request(Method::HEAD, url, None)
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::PRAGMA, "no-cache")
            .timeout(BUST_TIMEOUT);
        match request.send().await {
            Ok(response) => debug!(table, status = %response.status(), "Cache-busting preflight sent"),
            Err(err) => debug!(table, error = %err, "Cache-busting preflight failed"),
        }
    }

    async fn write<T: DeserializeOwned>(
        &self,
        method: Method,
        table: &str,
        filter: Option<(&'static str, String)>,
        actor: &Principal,
        body: Option<serde_json::Value>,
    ) -> Result<Vec<T>, RepoError> {
        let url = self.table_url(table)?;
        let mut request = self
            .request(method, url, actor.access_token.as_deref())
            .header("Prefer", "return=representation");
        if let Some(filter) = filter {
            request = request.query(&[filter]);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(|err| self.send_error(err))?;
        let response = ensure_success(response).await?;
        decode(response).await
    }
}

#[async_trait]
impl ContentReader for RestGateway {
    #[instrument(skip(self), fields(resource = %key))]
    async fn fetch(&self, key: &ResourceKey) -> Result<Fetched, RepoError> {
        if self.config.enabled
            && let Some(payload) = self.cache.get(key)
        {
            return Ok(Fetched {
                payload,
                freshness: Freshness::Cached,
            });
        }

        let started = Instant::now();
        let result = self.load(key).await;
        histogram!(METRIC_FETCH_MS).record(started.elapsed().as_secs_f64() * 1000.0);

        match result {
            Ok(payload) => {
                if self.config.enabled {
                    self.cache
                        .insert(key.clone(), payload.clone(), key.class().ttl(&self.config));
                }
                Ok(Fetched {
                    payload,
                    freshness: Freshness::Fetched,
                })
            }
            Err(RepoError::NotFound) => {
                self.cache.invalidate_where(|cached| cached == key);
                Err(RepoError::NotFound)
            }
            Err(err) if err.is_transient() => match self.cache.get_stale(key) {
                Some((payload, age)) => {
                    warn!(
                        error = %err,
                        age_secs = age.as_secs(),
                        result = "stale_fallback",
                        "Backend read failed; serving retained entry"
                    );
                    counter!(METRIC_STALE).increment(1);
                    Ok(Fetched {
                        payload,
                        freshness: Freshness::Stale,
                    })
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    async fn invalidate(&self, prefixes: &[ResourcePrefix]) -> usize {
        if prefixes.is_empty() {
            return 0;
        }
        let dropped = self
            .cache
            .invalidate_where(|key| prefixes.iter().any(|prefix| key.matches(prefix)));
        info!(prefixes = ?prefixes, dropped, "Gateway cache invalidated");

        let posts = prefixes
            .iter()
            .any(|prefix| !matches!(prefix, ResourcePrefix::Categories));
        let categories = prefixes
            .iter()
            .any(|prefix| matches!(prefix, ResourcePrefix::All | ResourcePrefix::Categories));
        if posts {
            self.bust_http_cache("posts").await;
        }
        if categories {
            self.bust_http_cache("categories").await;
        }
        dropped
    }
}

#[async_trait]
impl ContentWriter for RestGateway {
    async fn load_item(
        &self,
        actor: &Principal,
        id: i64,
    ) -> Result<Option<ContentItem>, RepoError> {
        let url = self.table_url("posts")?;
        let response = self
            .request(Method::GET, url, actor.access_token.as_deref())
            .query(&[("select", "*".to_string()), ("id", format!("eq.{id}"))])
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|err| self.send_error(err))?;
        let response = ensure_success(response).await?;
        let mut rows: Vec<ContentItem> = decode(response).await?;
        Ok(rows.pop())
    }

    async fn list_items(&self, actor: &Principal) -> Result<Vec<ContentItem>, RepoError> {
        let url = self.table_url("posts")?;
        let response = self
            .request(Method::GET, url, actor.access_token.as_deref())
            .query(&[("select", "*"), ("order", "created_at.desc")])
            .header(header::CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|err| self.send_error(err))?;
        let response = ensure_success(response).await?;
        decode(response).await
    }

    async fn insert_item(
        &self,
        actor: &Principal,
        input: &ItemInput,
    ) -> Result<ContentItem, RepoError> {
        let body = serde_json::to_value(input).map_err(RepoError::decode)?;
        let rows = self
            .write(Method::POST, "posts", None, actor, Some(body))
            .await?;
        single(rows)
    }

    async fn update_item(
        &self,
        actor: &Principal,
        id: i64,
        changes: &ItemChanges,
    ) -> Result<ContentItem, RepoError> {
        let body = serde_json::to_value(changes).map_err(RepoError::decode)?;
        let rows = self
            .write(
                Method::PATCH,
                "posts",
                Some(("id", format!("eq.{id}"))),
                actor,
                Some(body),
            )
            .await?;
        single(rows)
    }

    async fn delete_item(&self, actor: &Principal, id: i64) -> Result<ContentItem, RepoError> {
        let rows = self
            .write(
                Method::DELETE,
                "posts",
                Some(("id", format!("eq.{id}"))),
                actor,
                None,
            )
            .await?;
        single(rows)
    }

    async fn insert_category(
        &self,
        actor: &Principal,
        input: &CategoryInput,
    ) -> Result<Category, RepoError> {
        let body = serde_json::to_value(input).map_err(RepoError::decode)?;
        let rows = self
            .write(Method::POST, "categories", None, actor, Some(body))
            .await?;
        single(rows)
    }

    async fn update_category(
        &self,
        actor: &Principal,
        id: &str,
        input: &CategoryInput,
    ) -> Result<Category, RepoError> {
        let body = serde_json::to_value(input).map_err(RepoError::decode)?;
        let rows = self
            .write(
                Method::PATCH,
                "categories",
                Some(("id", format!("eq.{id}"))),
                actor,
                Some(body),
            )
            .await?;
        single(rows)
    }

    async fn delete_category(&self, actor: &Principal, id: &str) -> Result<Category, RepoError> {
        let rows = self
            .write(
                Method::DELETE,
                "categories",
                Some(("id", format!("eq.{id}"))),
                actor,
                None,
            )
            .await?;
        single(rows)
    }
}

impl Drop for RestGateway {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn single<T>(mut rows: Vec<T>) -> Result<T, RepoError> {
    rows.pop().ok_or(RepoError::NotFound)
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, RepoError> {
    let bytes = response.bytes().await.map_err(RepoError::transport)?;
    serde_json::from_slice(&bytes).map_err(RepoError::decode)
}

async fn ensure_success(response: Response) -> Result<Response, RepoError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    let parsed: BackendErrorBody = serde_json::from_slice(&body).unwrap_or_default();
    Err(classify_failure(status, parsed))
}

fn classify_failure(status: StatusCode, body: BackendErrorBody) -> RepoError {
    let message = body
        .message
        .clone()
        .or(body.details.clone())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
    match (status, body.code.as_deref()) {
        (_, Some("23505")) | (StatusCode::CONFLICT, _) => RepoError::Duplicate {
            constraint: body.details.unwrap_or(message),
        },
        (_, Some("23503")) => RepoError::Integrity { message },
        (_, Some("42501")) | (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => {
            RepoError::Forbidden { message }
        }
        (_, Some("PGRST116")) | (StatusCode::NOT_FOUND, _) => RepoError::NotFound,
        _ => RepoError::Status {
            status: status.as_u16(),
            code: body.code,
            message,
        },
    }
}

/// Total row count from a PostgREST `Content-Range` header (`0-7/8`, `*/0`).
fn content_range_total(headers: &HeaderMap<HeaderValue>) -> Option<usize> {
    headers
        .get(header::CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()?
        .parse()
        .ok()
}

/// `ilike` pattern for a search term; characters that carry meaning in the
/// PostgREST `or=(...)` grammar are dropped.
fn search_pattern(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|ch| !matches!(ch, ',' | '(' | ')' | '*' | '"' | '\\'))
        .collect();
    format!("*{}*", cleaned.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("0-7/8"));
        assert_eq!(content_range_total(&headers), Some(8));
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("*/0"));
        assert_eq!(content_range_total(&headers), Some(0));
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("0-7/*"));
        assert_eq!(content_range_total(&headers), None);
    }

    #[test]
    fn search_pattern_strips_grammar_characters() {
        assert_eq!(search_pattern("spa, (rain)*"), "*spa rain*");
    }

    #[test]
    fn backend_codes_map_to_repo_errors() {
        let duplicate = classify_failure(
            StatusCode::CONFLICT,
            BackendErrorBody {
                code: Some("23505".into()),
                message: Some("duplicate key".into()),
                details: Some("Key (slug)=(x) already exists.".into()),
            },
        );
        assert!(matches!(duplicate, RepoError::Duplicate { .. }));

        let reference = classify_failure(
            StatusCode::BAD_REQUEST,
            BackendErrorBody {
                code: Some("23503".into()),
                ..Default::default()
            },
        );
        assert!(matches!(reference, RepoError::Integrity { .. }));

        let forbidden = classify_failure(StatusCode::FORBIDDEN, BackendErrorBody::default());
        assert!(matches!(forbidden, RepoError::Forbidden { .. }));

        let unavailable =
            classify_failure(StatusCode::SERVICE_UNAVAILABLE, BackendErrorBody::default());
        assert!(unavailable.is_transient());
    }
}
