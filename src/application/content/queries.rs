//! Read side: gateway → durable store → static fallback.
//!
//! List reads never fail. A primary read that misses its deadline keeps
//! running in a tracked task so its result still lands in the gateway and
//! durable caches; the caller moves on to the fallback tiers immediately.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::application::error::ContentError;
use crate::application::repos::{Payload, RepoError};
use crate::cache::{DurableStore, Freshness, ResourceKey, normalize_query};
use crate::domain::categories::build_hierarchy;
use crate::domain::entities::{Category, CategoryNode, ContentItem};

use super::service::ContentService;

const METRIC_FALLBACK: &str = "paddock_read_fallback_total";

impl ContentService {
    pub async fn featured_items(&self) -> Arc<Vec<ContentItem>> {
        self.read_items(ResourceKey::Featured).await
    }

    pub async fn all_items(&self) -> Arc<Vec<ContentItem>> {
        self.read_items(ResourceKey::Items).await
    }

    pub async fn items_by_category(&self, category_id: &str) -> Arc<Vec<ContentItem>> {
        self.read_items(ResourceKey::ItemsByCategory(category_id.to_string()))
            .await
    }

    /// Free-text search. A blank query matches nothing and costs no I/O.
    pub async fn search(&self, query: &str) -> Arc<Vec<ContentItem>> {
        if normalize_query(query).is_empty() {
            return Arc::new(Vec::new());
        }
        self.read_items(ResourceKey::search(query)).await
    }

    pub async fn categories(&self) -> Arc<Vec<Category>> {
        let key = ResourceKey::Categories;
        match self.read_primary(&key, self.config.primary_timeout).await {
            Ok(Payload::Categories(categories)) => return categories,
            Ok(other) => warn!(resource = %key, payload = ?other, "Unexpected payload kind"),
            Err(err) => warn!(resource = %key, error = %err, "Primary read failed; trying durable store"),
        }
        if let Some(categories) = self.durable_fallback::<Vec<Category>>(&key).await {
            return Arc::new(categories);
        }
        counter!(METRIC_FALLBACK, "tier" => "static").increment(1);
        Arc::new(self.fallback.categories.clone())
    }

    pub async fn category_hierarchy(&self) -> Vec<CategoryNode> {
        build_hierarchy(&self.categories().await)
    }

    /// A single published item. A missing id is reported as `NotFound` and
    /// never papered over with fallback data.
    pub async fn item_by_id(&self, id: i64) -> Result<Arc<ContentItem>, ContentError> {
        let key = ResourceKey::ItemById(id);
        match self.read_primary(&key, self.config.detail_timeout).await {
            Ok(Payload::Item(item)) => return Ok(self.optimize_item(item)),
            Ok(other) => warn!(resource = %key, payload = ?other, "Unexpected payload kind"),
            Err(RepoError::NotFound) => return Err(ContentError::not_found("item")),
            Err(err) => warn!(resource = %key, error = %err, "Primary read failed; trying durable store"),
        }

        if let Some(item) = self.durable_fallback::<ContentItem>(&key).await {
            return Ok(self.optimize_item(Arc::new(item)));
        }
        let from_list = self
            .durable
            .get::<Vec<ContentItem>>(&ResourceKey::Items)
            .await
            .and_then(|items| items.into_iter().find(|item| item.id == id && item.is_public()));
        if let Some(item) = from_list {
            counter!(METRIC_FALLBACK, "tier" => "durable").increment(1);
            return Ok(self.optimize_item(Arc::new(item)));
        }
        if let Some(item) = self.fallback.items_for(&key).into_iter().next() {
            counter!(METRIC_FALLBACK, "tier" => "static").increment(1);
            return Ok(self.optimize_item(Arc::new(item)));
        }
        Err(ContentError::Transient(format!("item {id} is unavailable")))
    }

    async fn read_items(&self, key: ResourceKey) -> Arc<Vec<ContentItem>> {
        let items = match self.read_primary(&key, self.config.primary_timeout).await {
            Ok(Payload::Items(items)) => Some(items),
            Ok(other) => {
                warn!(resource = %key, payload = ?other, "Unexpected payload kind");
                None
            }
            Err(err) => {
                warn!(resource = %key, error = %err, "Primary read failed; trying durable store");
                None
            }
        };

        let items = match items {
            Some(items) => items,
            None => match self.durable_fallback::<Vec<ContentItem>>(&key).await {
                Some(items) => Arc::new(items),
                None => {
                    counter!(METRIC_FALLBACK, "tier" => "static").increment(1);
                    debug!(resource = %key, "Serving built-in fallback");
                    Arc::new(self.fallback.items_for(&key))
                }
            },
        };
        self.optimize_items(items)
    }

    async fn durable_fallback<T: DeserializeOwned>(&self, key: &ResourceKey) -> Option<T> {
        let value = self.durable.get::<T>(key).await?;
        counter!(METRIC_FALLBACK, "tier" => "durable").increment(1);
        Some(value)
    }

    /// Run the gateway read under `timeout`. On expiry the read is left
    /// running and tracked, and the caller gets a timeout error.
    pub(crate) async fn read_primary(
        &self,
        key: &ResourceKey,
        timeout: Duration,
    ) -> Result<Payload, RepoError> {
        let reader = Arc::clone(&self.reader);
        let durable = self.durable.clone();
        let owned = key.clone();
        let mut primary = tokio::spawn(async move {
            let fetched = reader.fetch(&owned).await?;
            if fetched.freshness == Freshness::Fetched {
                write_through(&durable, &owned, &fetched.payload).await;
            }
            Ok::<_, RepoError>(fetched.payload)
        });

        match tokio::time::timeout(timeout, &mut primary).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(RepoError::transport(join_error)),
            Err(_) => {
                warn!(
                    resource = %key,
                    timeout_ms = timeout.as_millis() as u64,
                    "Primary read timed out; continuing in background"
                );
                self.track(&self.background, primary.abort_handle());
                Err(RepoError::Timeout(timeout))
            }
        }
    }

    /// Point stored images at the resizing endpoint. Lists without stored
    /// images are returned as the same allocation.
    pub(crate) fn optimize_items(&self, items: Arc<Vec<ContentItem>>) -> Arc<Vec<ContentItem>> {
        if !items.iter().any(|item| stored_image(item).is_some()) {
            return items;
        }
        Arc::new(
            items
                .iter()
                .map(|item| self.optimize_owned(item.clone()))
                .collect(),
        )
    }

    pub(crate) fn optimize_item(&self, item: Arc<ContentItem>) -> Arc<ContentItem> {
        if stored_image(&item).is_none() {
            return item;
        }
        Arc::new(self.optimize_owned(item.as_ref().clone()))
    }

    pub(crate) fn optimize_owned(&self, mut item: ContentItem) -> ContentItem {
        let rendered = stored_image(&item)
            .map(|path| self.storage.public_url(path, &self.config.image_transform));
        if rendered.is_some() {
            item.image_url = rendered;
        }
        item
    }
}

fn stored_image(item: &ContentItem) -> Option<&str> {
    item.image_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
}

async fn write_through(durable: &DurableStore, key: &ResourceKey, payload: &Payload) {
    match payload {
        Payload::Items(items) => durable.set(key, items.as_ref()).await,
        Payload::Item(item) => durable.set(key, item.as_ref()).await,
        Payload::Categories(categories) => durable.set(key, categories.as_ref()).await,
    }
}
