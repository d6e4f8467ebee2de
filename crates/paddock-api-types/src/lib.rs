//! Row and payload types exchanged between the Paddock cache layer, the hosted
//! backend and the UI.
//!
//! Rows mirror the backend's `posts` and `categories` tables as they are
//! returned by its REST interface and by the realtime change feed. Every
//! non-key column is defaulted so partial rows (for example the `old` image of a
//! change event, which only carries the primary key unless the table uses full
//! replica identity) still decode.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A published or draft news article.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: i64,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub excerpt: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub author: String,
    /// Estimated reading time in minutes.
    #[serde(default)]
    pub read_time: Option<u32>,
    #[serde(default)]
    pub image_url: Option<String>,
    /// Object path inside the storage bucket, used to clean up replaced images.
    #[serde(default)]
    pub image_path: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub published: bool,
    #[serde(default)]
    pub trending: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl ContentItem {
    /// Whether anonymous readers may see this item.
    pub fn is_public(&self) -> bool {
        self.published
    }
}

/// A node of the category forest (championship → series → class).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_level")]
    pub level: u8,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub post_count: i64,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_level() -> u8 {
    1
}

fn default_active() -> bool {
    true
}

/// Fields an editor submits when creating an item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInput {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    pub category: String,
    #[serde(default)]
    pub excerpt: String,
    pub content: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub published: bool,
    #[serde(default)]
    pub trending: bool,
}

/// Partial update of an item; absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trending: Option<bool>,
}

impl ItemChanges {
    /// Apply the changes on top of an existing row, producing the row the
    /// backend is expected to hold after the update.
    pub fn apply_to(&self, item: &ContentItem) -> ContentItem {
        let mut next = item.clone();
        if let Some(title) = &self.title {
            next.title = title.clone();
        }
        if let Some(slug) = &self.slug {
            next.slug = slug.clone();
        }
        if let Some(category) = &self.category {
            next.category = category.clone();
        }
        if let Some(excerpt) = &self.excerpt {
            next.excerpt = excerpt.clone();
        }
        if let Some(content) = &self.content {
            next.content = content.clone();
        }
        if let Some(author) = &self.author {
            next.author = author.clone();
        }
        if let Some(read_time) = self.read_time {
            next.read_time = Some(read_time);
        }
        if let Some(image_url) = &self.image_url {
            next.image_url = Some(image_url.clone());
        }
        if let Some(image_path) = &self.image_path {
            next.image_path = Some(image_path.clone());
        }
        if let Some(tags) = &self.tags {
            next.tags = tags.clone();
        }
        if let Some(published) = self.published {
            next.published = published;
        }
        if let Some(trending) = self.trending {
            next.trending = trending;
        }
        next
    }
}

/// Fields an editor submits when creating or replacing a category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryInput {
    pub id: String,
    pub name: String,
    pub level: u8,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_rows_decode_with_defaults() {
        let item: ContentItem =
            serde_json::from_str(r#"{"id":1,"trending":true,"published":true}"#)
                .expect("partial row");
        assert_eq!(item.id, 1);
        assert!(item.trending);
        assert!(item.tags.is_empty());
        assert!(item.created_at.is_none());
    }

    #[test]
    fn timestamps_accept_backend_offsets() {
        let item: ContentItem = serde_json::from_str(
            r#"{"id":7,"created_at":"2024-03-02T14:05:00.123456+00:00"}"#,
        )
        .expect("row with timestamp");
        assert_eq!(item.created_at.map(|ts| ts.year()), Some(2024));
    }

    #[test]
    fn category_defaults_to_active_root() {
        let category: Category =
            serde_json::from_str(r#"{"id":"f1","name":"Formula 1"}"#).expect("category");
        assert_eq!(category.level, 1);
        assert!(category.is_active);
        assert!(category.parent_id.is_none());
    }

    #[test]
    fn changes_only_touch_present_fields() {
        let item = ContentItem {
            id: 3,
            title: "Old".into(),
            category: "f1".into(),
            published: true,
            ..Default::default()
        };
        let changes = ItemChanges {
            category: Some("motogp".into()),
            ..Default::default()
        };
        let next = changes.apply_to(&item);
        assert_eq!(next.title, "Old");
        assert_eq!(next.category, "motogp");
        assert!(next.published);
    }

    #[test]
    fn changes_skip_absent_fields_when_serialized() {
        let changes = ItemChanges {
            trending: Some(false),
            ..Default::default()
        };
        let json = serde_json::to_value(&changes).expect("serialize");
        assert_eq!(json, serde_json::json!({"trending": false}));
    }
}
