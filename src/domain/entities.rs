//! Domain entities mirrored from the backend's tables.

use serde::{Deserialize, Serialize};

pub use paddock_api_types::{Category, CategoryInput, ContentItem, ItemChanges, ItemInput};

/// A category together with its descendants, ordered by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryNode {
    pub category: Category,
    pub children: Vec<CategoryNode>,
}

impl CategoryNode {
    pub fn leaf(category: Category) -> Self {
        Self {
            category,
            children: Vec::new(),
        }
    }

    /// Number of nodes in this subtree, including the root.
    pub fn node_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(CategoryNode::node_count)
            .sum::<usize>()
    }
}
