use std::time::Duration;

use crate::application::error::ContentError;
use crate::application::repos::ImageTransform;
use crate::cache::ResourceKey;
use crate::domain::categories::fallback_taxonomy;
use crate::domain::entities::{Category, ContentItem, ItemChanges, ItemInput};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound for a list or reference read before falling back.
    pub primary_timeout: Duration,
    /// Upper bound for a single-item read before falling back.
    pub detail_timeout: Duration,
    /// Delay before a replaced or deleted image is removed from storage.
    pub asset_grace: Duration,
    pub image_transform: ImageTransform,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            primary_timeout: Duration::from_secs(8),
            detail_timeout: Duration::from_secs(15),
            asset_grace: Duration::from_secs(30),
            image_transform: ImageTransform::default(),
        }
    }
}

impl From<&crate::config::OrchestratorSettings> for OrchestratorConfig {
    fn from(settings: &crate::config::OrchestratorSettings) -> Self {
        Self {
            primary_timeout: settings.primary_timeout,
            detail_timeout: settings.detail_timeout,
            asset_grace: settings.asset_grace,
            image_transform: ImageTransform {
                width: settings.image_width,
                quality: settings.image_quality,
            },
        }
    }
}

/// Last tier of the read chain.
#[derive(Debug, Clone)]
pub struct StaticFallback {
    pub items: Vec<ContentItem>,
    pub categories: Vec<Category>,
}

impl Default for StaticFallback {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            categories: fallback_taxonomy(),
        }
    }
}

impl StaticFallback {
    /// The subset of the built-in items a resource would have returned.
    pub fn items_for(&self, key: &ResourceKey) -> Vec<ContentItem> {
        let visible = self.items.iter().filter(|item| item.is_public());
        match key {
            ResourceKey::Featured => visible.filter(|item| item.trending).cloned().collect(),
            ResourceKey::ItemsByCategory(category) => visible
                .filter(|item| &item.category == category)
                .cloned()
                .collect(),
            ResourceKey::Search(query) => visible
                .filter(|item| item.title.to_lowercase().contains(query.as_str()))
                .cloned()
                .collect(),
            ResourceKey::ItemById(id) => visible.filter(|item| item.id == *id).cloned().collect(),
            ResourceKey::Items => visible.cloned().collect(),
            ResourceKey::Categories => Vec::new(),
        }
    }
}

/// Number of records re-primed by a forced refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub featured: usize,
    pub items: usize,
    pub categories: usize,
}

/// Entries dropped from each tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub memory: usize,
    pub durable: usize,
}

pub fn ensure_non_empty(value: &str, field: &'static str) -> Result<(), ContentError> {
    if value.trim().is_empty() {
        return Err(ContentError::validation(field, "must not be empty"));
    }
    Ok(())
}

fn has_image(url: Option<&str>, path: Option<&str>) -> bool {
    [url, path]
        .into_iter()
        .flatten()
        .any(|value| !value.trim().is_empty())
}

pub(crate) fn validate_item_input(input: &ItemInput) -> Result<(), ContentError> {
    ensure_non_empty(&input.title, "title")?;
    ensure_non_empty(&input.category, "category")?;
    ensure_non_empty(&input.content, "content")?;
    if !has_image(input.image_url.as_deref(), input.image_path.as_deref()) {
        return Err(ContentError::validation("image", "an image is required"));
    }
    Ok(())
}

/// Fields that are present in an update must still satisfy the create rules.
pub(crate) fn validate_item_changes(changes: &ItemChanges) -> Result<(), ContentError> {
    if let Some(title) = &changes.title {
        ensure_non_empty(title, "title")?;
    }
    if let Some(category) = &changes.category {
        ensure_non_empty(category, "category")?;
    }
    if let Some(content) = &changes.content {
        ensure_non_empty(content, "content")?;
    }
    if let Some(slug) = &changes.slug {
        ensure_non_empty(slug, "slug")?;
    }
    let clears_image = changes
        .image_url
        .as_deref()
        .is_some_and(|url| url.trim().is_empty())
        && changes
            .image_path
            .as_deref()
            .is_none_or(|path| path.trim().is_empty());
    if clears_image {
        return Err(ContentError::validation("image", "an image is required"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> ItemInput {
        ItemInput {
            title: "Verstappen takes pole".into(),
            category: "f1".into(),
            content: "Body".into(),
            image_url: Some("https://cdn.example/pole.jpg".into()),
            ..Default::default()
        }
    }

    #[test]
    fn complete_input_passes() {
        assert!(validate_item_input(&input()).is_ok());
    }

    #[test]
    fn each_required_field_is_reported() {
        let mut missing_title = input();
        missing_title.title = "  ".into();
        assert!(matches!(
            validate_item_input(&missing_title),
            Err(ContentError::Validation { field: "title", .. })
        ));

        let mut missing_image = input();
        missing_image.image_url = None;
        assert!(matches!(
            validate_item_input(&missing_image),
            Err(ContentError::Validation { field: "image", .. })
        ));
    }

    #[test]
    fn updates_cannot_blank_required_fields() {
        let changes = ItemChanges {
            category: Some(String::new()),
            ..Default::default()
        };
        assert!(validate_item_changes(&changes).is_err());
        assert!(validate_item_changes(&ItemChanges::default()).is_ok());
        let clear_image = ItemChanges {
            image_url: Some(String::new()),
            ..Default::default()
        };
        assert!(validate_item_changes(&clear_image).is_err());
    }
}
