//! Category forest rules and the built-in taxonomy served when every other
//! source is unavailable.

use std::collections::{BTreeMap, HashMap};

use super::entities::{Category, CategoryInput, CategoryNode};
use super::error::DomainError;

pub const MAX_LEVEL: u8 = 3;

/// Check a single category against the forest it is about to join.
///
/// Level 1 nodes are roots and must not name a parent; deeper nodes must name
/// an existing parent exactly one level above them.
pub fn validate_placement(
    input: &CategoryInput,
    existing: &[Category],
) -> Result<(), DomainError> {
    if input.id.trim().is_empty() {
        return Err(DomainError::validation("id", "must not be empty"));
    }
    if input.name.trim().is_empty() {
        return Err(DomainError::validation("name", "must not be empty"));
    }
    if input.level == 0 || input.level > MAX_LEVEL {
        return Err(DomainError::validation(
            "level",
            format!("must be between 1 and {MAX_LEVEL}, got {}", input.level),
        ));
    }

    match (input.level, input.parent_id.as_deref()) {
        (1, None) => Ok(()),
        (1, Some(_)) => Err(DomainError::validation(
            "parent_id",
            "top-level categories cannot have a parent",
        )),
        (_, None) => Err(DomainError::validation(
            "parent_id",
            format!("level {} categories need a parent", input.level),
        )),
        (level, Some(parent_id)) => {
            if parent_id == input.id {
                return Err(DomainError::validation(
                    "parent_id",
                    "a category cannot be its own parent",
                ));
            }
            let parent = existing
                .iter()
                .find(|candidate| candidate.id == parent_id)
                .ok_or_else(|| DomainError::UnknownParent {
                    id: parent_id.to_string(),
                })?;
            if parent.level + 1 != level {
                return Err(DomainError::validation(
                    "level",
                    format!(
                        "parent `{}` is level {}, child must be level {}",
                        parent.id,
                        parent.level,
                        parent.level + 1
                    ),
                ));
            }
            Ok(())
        }
    }
}

/// Drop records that cannot be displayed (missing id or name).
///
/// Returns the retained categories and the number of records discarded.
pub fn retain_displayable(categories: Vec<Category>) -> (Vec<Category>, usize) {
    let before = categories.len();
    let kept: Vec<Category> = categories
        .into_iter()
        .filter(|category| !category.id.trim().is_empty() && !category.name.trim().is_empty())
        .collect();
    let dropped = before - kept.len();
    (kept, dropped)
}

/// Assemble the category forest.
///
/// Nodes whose parent is missing, or whose level does not follow their
/// parent's, are promoted to roots rather than dropped so nothing disappears
/// from navigation because of one inconsistent row.
pub fn build_hierarchy(categories: &[Category]) -> Vec<CategoryNode> {
    let by_id: HashMap<&str, &Category> = categories
        .iter()
        .map(|category| (category.id.as_str(), category))
        .collect();

    let mut children: BTreeMap<&str, Vec<&Category>> = BTreeMap::new();
    let mut roots: Vec<&Category> = Vec::new();

    for category in categories {
        let parent = category
            .parent_id
            .as_deref()
            .and_then(|parent_id| by_id.get(parent_id))
            .filter(|parent| parent.level + 1 == category.level && parent.id != category.id);
        match parent {
            Some(parent) => children.entry(parent.id.as_str()).or_default().push(category),
            None => roots.push(category),
        }
    }

    let mut forest: Vec<CategoryNode> = roots
        .into_iter()
        .map(|root| attach(root, &children))
        .collect();
    forest.sort_by(|a, b| a.category.name.cmp(&b.category.name));
    forest
}

fn attach(category: &Category, children: &BTreeMap<&str, Vec<&Category>>) -> CategoryNode {
    let mut node = CategoryNode::leaf(category.clone());
    if let Some(kids) = children.get(category.id.as_str()) {
        node.children = kids.iter().map(|kid| attach(kid, children)).collect();
        node.children
            .sort_by(|a, b| a.category.name.cmp(&b.category.name));
    }
    node
}

/// Minimal taxonomy used when neither the backend nor any cache can answer.
pub fn fallback_taxonomy() -> Vec<Category> {
    fn entry(id: &str, name: &str, level: u8, parent: Option<&str>, color: &str) -> Category {
        Category {
            id: id.to_string(),
            name: name.to_string(),
            level,
            parent_id: parent.map(str::to_string),
            color: Some(color.to_string()),
            icon: None,
            post_count: 0,
            is_active: true,
        }
    }

    vec![
        entry("f1", "Formula 1", 1, None, "#e10600"),
        entry("motogp", "MotoGP", 1, None, "#000000"),
        entry("endurance", "Endurance", 1, None, "#0067ad"),
        entry("wec", "World Endurance Championship", 2, Some("endurance"), "#0067ad"),
        entry("hypercar", "Hypercar", 3, Some("wec"), "#0067ad"),
        entry("rally", "Rally", 1, None, "#ffb800"),
        entry("wrc", "World Rally Championship", 2, Some("rally"), "#ffb800"),
        entry("indycar", "IndyCar", 1, None, "#1b3e8f"),
    ]
}
