//! Write side. Every mutation runs validation, then the authorization check,
//! then the backend call, then invalidation of every tier that could hold the
//! previous state.

use std::sync::Arc;

use tracing::{info, warn};

use crate::application::error::ContentError;
use crate::application::repos::Principal;
use crate::cache::{ResourceKey, ResourcePrefix};
use crate::domain::categories::validate_placement;
use crate::domain::entities::{Category, CategoryInput, ContentItem, ItemChanges, ItemInput};
use crate::domain::slug::{derive_slug, ensure_canonical};

use super::service::ContentService;
use super::types::{ensure_non_empty, validate_item_changes, validate_item_input};

impl ContentService {
    pub async fn create_item(&self, mut input: ItemInput) -> Result<ContentItem, ContentError> {
        validate_item_input(&input)?;
        let slug = match input.slug.as_deref().map(str::trim) {
            Some(slug) if !slug.is_empty() => {
                ensure_canonical(slug)
                    .map_err(|err| ContentError::validation("slug", err.to_string()))?;
                slug.to_string()
            }
            _ => derive_slug(&input.title)
                .map_err(|err| ContentError::validation("title", err.to_string()))?,
        };
        input.slug = Some(slug);

        let actor = self.authorize().await?;
        let created = self.writer.insert_item(&actor, &input).await?;
        info!(item_id = created.id, category = %created.category, actor = %actor.user_id, "Item created");

        self.invalidate_after_item_write(None, Some(&created)).await;
        Ok(self.optimize_owned(created))
    }

    pub async fn update_item(
        &self,
        id: i64,
        changes: ItemChanges,
    ) -> Result<ContentItem, ContentError> {
        validate_item_changes(&changes)?;
        if let Some(slug) = changes.slug.as_deref() {
            ensure_canonical(slug).map_err(|err| ContentError::validation("slug", err.to_string()))?;
        }

        let actor = self.authorize().await?;
        let previous = self
            .writer
            .load_item(&actor, id)
            .await?
            .ok_or_else(|| ContentError::not_found("item"))?;
        let updated = self.writer.update_item(&actor, id, &changes).await?;
        info!(
            item_id = id,
            from_category = %previous.category,
            to_category = %updated.category,
            actor = %actor.user_id,
            "Item updated"
        );

        self.invalidate_after_item_write(Some(&previous), Some(&updated))
            .await;
        if let Some(old_path) = previous.image_path.as_deref()
            && updated.image_path.as_deref() != Some(old_path)
        {
            self.schedule_asset_removal(old_path);
        }
        Ok(self.optimize_owned(updated))
    }

    /// Every item including drafts, for the editor's dashboard. Never cached
    /// below the query layer.
    pub async fn editor_items(&self) -> Result<Vec<ContentItem>, ContentError> {
        let actor = self.authorize().await?;
        let items = self.writer.list_items(&actor).await?;
        Ok(items
            .into_iter()
            .map(|item| self.optimize_owned(item))
            .collect())
    }

    pub async fn delete_item(&self, id: i64) -> Result<ContentItem, ContentError> {
        let actor = self.authorize().await?;
        let deleted = self.writer.delete_item(&actor, id).await?;
        info!(item_id = id, category = %deleted.category, actor = %actor.user_id, "Item deleted");

        self.invalidate_after_item_write(Some(&deleted), None).await;
        self.durable.remove(&ResourceKey::ItemById(id)).await;
        if let Some(path) = deleted.image_path.as_deref() {
            self.schedule_asset_removal(path);
        }
        Ok(deleted)
    }

    pub async fn create_category(&self, input: CategoryInput) -> Result<Category, ContentError> {
        ensure_non_empty(&input.id, "id")?;
        ensure_non_empty(&input.name, "name")?;
        let actor = self.authorize().await?;
        let existing = self.categories().await;
        validate_placement(&input, &existing)?;

        let created = self.writer.insert_category(&actor, &input).await?;
        info!(category = %created.id, level = created.level, "Category created");
        self.invalidate_after_category_write().await;
        Ok(created)
    }

    pub async fn update_category(
        &self,
        id: &str,
        input: CategoryInput,
    ) -> Result<Category, ContentError> {
        ensure_non_empty(&input.name, "name")?;
        if input.id != id {
            return Err(ContentError::validation("id", "category ids cannot be changed"));
        }
        let actor = self.authorize().await?;
        let existing = self.categories().await;
        let siblings: Vec<Category> = existing
            .iter()
            .filter(|category| category.id != id)
            .cloned()
            .collect();
        validate_placement(&input, &siblings)?;

        let updated = self.writer.update_category(&actor, id, &input).await?;
        info!(category = %updated.id, "Category updated");
        self.invalidate_after_category_write().await;
        Ok(updated)
    }

    pub async fn delete_category(&self, id: &str) -> Result<Category, ContentError> {
        ensure_non_empty(id, "id")?;
        let actor = self.authorize().await?;
        let deleted = self.writer.delete_category(&actor, id).await?;
        info!(category = %deleted.id, "Category deleted");
        self.invalidate_after_category_write().await;
        Ok(deleted)
    }

    async fn authorize(&self) -> Result<Principal, ContentError> {
        let principal = self
            .auth
            .current_principal()
            .await
            .ok_or_else(|| ContentError::authorization("sign in to edit content"))?;
        if !principal.is_privileged() {
            return Err(ContentError::authorization(format!(
                "user `{}` may not edit content",
                principal.user_id
            )));
        }
        Ok(principal)
    }

    async fn invalidate_after_item_write(
        &self,
        before: Option<&ContentItem>,
        after: Option<&ContentItem>,
    ) {
        let mut prefixes = vec![
            ResourcePrefix::Items,
            ResourcePrefix::Featured,
            ResourcePrefix::Search,
        ];
        for item in before.into_iter().chain(after) {
            for prefix in [
                ResourcePrefix::Category(item.category.clone()),
                ResourcePrefix::Item(item.id),
            ] {
                if !prefixes.contains(&prefix) {
                    prefixes.push(prefix);
                }
            }
        }
        let counts_changed = match (before, after) {
            (Some(before), Some(after)) => {
                before.category != after.category || before.published != after.published
            }
            _ => true,
        };
        if counts_changed {
            prefixes.push(ResourcePrefix::Categories);
        }

        let dropped = self.reader.invalidate(&prefixes).await;
        let cleared = self.durable.clear(&ResourcePrefix::All).await;
        info!(dropped, cleared, "Caches invalidated after item write");
    }

    async fn invalidate_after_category_write(&self) {
        let dropped = self
            .reader
            .invalidate(&[ResourcePrefix::Categories, ResourcePrefix::Lists])
            .await;
        let cleared = self.durable.clear(&ResourcePrefix::All).await;
        info!(dropped, cleared, "Caches invalidated after category write");
    }

    /// Remove a replaced or deleted image once in-flight readers are done
    /// with it.
    fn schedule_asset_removal(&self, path: &str) {
        let storage = Arc::clone(&self.storage);
        let grace = self.config.asset_grace;
        let path = path.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match storage.remove(&path).await {
                Ok(()) => info!(path = %path, "Orphaned asset removed"),
                Err(err) => warn!(path = %path, error = %err, "Orphaned asset could not be removed"),
            }
        });
        self.track(&self.asset_removals, handle.abort_handle());
    }
}
