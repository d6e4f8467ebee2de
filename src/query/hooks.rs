//! UI-facing read surface: each read goes through the query cache and comes
//! back as the [`QueryState`] an observer of the key would see.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::application::content::{ClearReport, ContentService, RefreshReport};
use crate::application::error::ContentError;
use crate::cache::normalize_query;
use crate::domain::entities::{Category, CategoryInput, ContentItem, ItemChanges, ItemInput};

use super::client::{QueryClient, QueryObserver};
use super::key::{Namespace, QueryKey, QueryPrefix};
use super::record::{QueryData, QueryState};

#[derive(Clone)]
pub struct ContentQueries {
    client: QueryClient,
    content: Arc<ContentService>,
}

impl ContentQueries {
    pub fn new(client: QueryClient, content: Arc<ContentService>) -> Self {
        Self { client, content }
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    pub fn content(&self) -> &Arc<ContentService> {
        &self.content
    }

    pub fn observe(&self, key: QueryKey) -> QueryObserver {
        self.client.observe(key)
    }

    pub async fn featured_items(&self) -> QueryState {
        self.read(QueryKey::featured(), |content| async move {
            Ok(QueryData::Items(content.featured_items().await))
        })
        .await
    }

    pub async fn all_items(&self) -> QueryState {
        self.read(QueryKey::items(), |content| async move {
            Ok(QueryData::Items(content.all_items().await))
        })
        .await
    }

    pub async fn items_by_category(&self, category_id: &str) -> QueryState {
        let id = category_id.to_string();
        self.read(QueryKey::category(category_id), move |content| {
            let id = id.clone();
            async move { Ok(QueryData::Items(content.items_by_category(&id).await)) }
        })
        .await
    }

    pub async fn item(&self, id: i64) -> QueryState {
        self.read(QueryKey::item(id), move |content| async move {
            content.item_by_id(id).await.map(QueryData::Item)
        })
        .await
    }

    /// The editor's item list, drafts included.
    pub async fn editor_items(&self) -> QueryState {
        self.read(QueryKey::editor_items(), |content| async move {
            content.editor_items().await.map(|items| QueryData::Items(Arc::new(items)))
        })
        .await
    }

    pub async fn categories(&self) -> QueryState {
        self.read(QueryKey::categories(), |content| async move {
            Ok(QueryData::Categories(content.categories().await))
        })
        .await
    }

    pub async fn category_hierarchy(&self) -> QueryState {
        self.read(QueryKey::hierarchy(), |content| async move {
            Ok(QueryData::Hierarchy(Arc::new(
                content.category_hierarchy().await,
            )))
        })
        .await
    }

    /// A blank query resolves to an empty list without touching the cache.
    pub async fn search(&self, query: &str) -> QueryState {
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return QueryState {
                data: Some(QueryData::Items(Arc::new(Vec::new()))),
                ..QueryState::default()
            };
        }
        self.read(QueryKey::search(&normalized), move |content| {
            let query = normalized.clone();
            async move { Ok(QueryData::Items(content.search(&query).await)) }
        })
        .await
    }

    pub async fn create_item(&self, input: ItemInput) -> Result<ContentItem, ContentError> {
        let created = self.content.create_item(input).await?;
        self.after_item_write(created.id);
        Ok(created)
    }

    pub async fn update_item(
        &self,
        id: i64,
        changes: ItemChanges,
    ) -> Result<ContentItem, ContentError> {
        let updated = self.content.update_item(id, changes).await?;
        self.after_item_write(id);
        Ok(updated)
    }

    pub async fn delete_item(&self, id: i64) -> Result<ContentItem, ContentError> {
        let deleted = self.content.delete_item(id).await?;
        self.client.remove(&QueryKey::item(id));
        self.after_item_write(id);
        Ok(deleted)
    }

    pub async fn create_category(&self, input: CategoryInput) -> Result<Category, ContentError> {
        let created = self.content.create_category(input).await?;
        self.after_category_write();
        Ok(created)
    }

    pub async fn update_category(
        &self,
        id: &str,
        input: CategoryInput,
    ) -> Result<Category, ContentError> {
        let updated = self.content.update_category(id, input).await?;
        self.after_category_write();
        Ok(updated)
    }

    pub async fn delete_category(&self, id: &str) -> Result<Category, ContentError> {
        let deleted = self.content.delete_category(id).await?;
        self.after_category_write();
        Ok(deleted)
    }

    /// Drop every tier and re-prime the landing resources. Query records are
    /// invalidated rather than dropped so observers keep their last data.
    pub async fn force_refresh(&self) -> RefreshReport {
        let report = self.content.force_refresh().await;
        let invalidated = self.client.invalidate(&QueryPrefix::all());
        debug!(invalidated, "Query cache invalidated by forced refresh");
        report
    }

    pub async fn clear_all_caches(&self) -> ClearReport {
        let report = self.content.clear_all_caches().await;
        self.client.clear().await;
        report
    }

    fn after_item_write(&self, id: i64) {
        let mut invalidated = 0;
        for namespace in [Namespace::Public, Namespace::Admin] {
            invalidated += self.client.invalidate(&QueryPrefix::posts(namespace));
            // Post counts live on the categories.
            invalidated += self.client.invalidate(&QueryPrefix::categories(namespace));
        }
        debug!(item_id = id, invalidated, "Queries invalidated after item write");
    }

    fn after_category_write(&self) {
        let mut invalidated = 0;
        for namespace in [Namespace::Public, Namespace::Admin] {
            invalidated += self.client.invalidate(&QueryPrefix::categories(namespace));
            invalidated += self
                .client
                .invalidate(&QueryPrefix::category_lists(namespace));
        }
        debug!(invalidated, "Queries invalidated after category write");
    }

    async fn read<F, Fut>(&self, key: QueryKey, fetch: F) -> QueryState
    where
        F: Fn(Arc<ContentService>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<QueryData, ContentError>> + Send + 'static,
    {
        let content = Arc::clone(&self.content);
        let result = self
            .client
            .fetch(key.clone(), move || fetch(Arc::clone(&content)))
            .await;

        let mut state = self.client.state(&key);
        match result {
            Ok(data) => {
                state.data = Some(data);
                state.error = None;
            }
            Err(err) => state.error = Some(err),
        }
        state
    }
}
