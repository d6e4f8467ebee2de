//! Hierarchical query keys.
//!
//! A key renders as slash-separated segments, namespace first:
//! `public/posts/category/f1`. Prefixes select every key whose segments start
//! with the prefix's segments.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::cache::normalize_query;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    /// Anonymous reads shared by every visitor.
    Public,
    /// Editor views that include drafts.
    Admin,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Public => "public",
            Namespace::Admin => "admin",
        }
    }
}

impl FromStr for Namespace {
    type Err = InvalidQueryKey;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "public" => Ok(Namespace::Public),
            "admin" => Ok(Namespace::Admin),
            other => Err(InvalidQueryKey(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryResource {
    Featured,
    Items,
    Category(String),
    Item(i64),
    Categories,
    Hierarchy,
    Search(String),
}

impl QueryResource {
    /// Keys holding a list of items.
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            QueryResource::Featured
                | QueryResource::Items
                | QueryResource::Category(_)
                | QueryResource::Search(_)
        )
    }

    pub fn is_search(&self) -> bool {
        matches!(self, QueryResource::Search(_))
    }

    fn segments(&self) -> Vec<String> {
        let fixed = |parts: &[&str]| -> Vec<String> {
            parts.iter().map(|part| part.to_string()).collect()
        };
        match self {
            QueryResource::Featured => fixed(&["posts", "featured"]),
            QueryResource::Items => fixed(&["posts", "all"]),
            QueryResource::Category(id) => {
                vec!["posts".into(), "category".into(), id.clone()]
            }
            QueryResource::Item(id) => vec!["posts".into(), "item".into(), id.to_string()],
            QueryResource::Categories => fixed(&["categories", "all"]),
            QueryResource::Hierarchy => fixed(&["categories", "hierarchy"]),
            QueryResource::Search(query) => {
                vec!["posts".into(), "search".into(), query.clone()]
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey {
    pub namespace: Namespace,
    pub resource: QueryResource,
}

impl QueryKey {
    pub fn new(namespace: Namespace, resource: QueryResource) -> Self {
        Self {
            namespace,
            resource,
        }
    }

    pub fn public(resource: QueryResource) -> Self {
        Self::new(Namespace::Public, resource)
    }

    pub fn featured() -> Self {
        Self::public(QueryResource::Featured)
    }

    pub fn items() -> Self {
        Self::public(QueryResource::Items)
    }

    pub fn category(id: impl Into<String>) -> Self {
        Self::public(QueryResource::Category(id.into()))
    }

    pub fn item(id: i64) -> Self {
        Self::public(QueryResource::Item(id))
    }

    pub fn categories() -> Self {
        Self::public(QueryResource::Categories)
    }

    pub fn hierarchy() -> Self {
        Self::public(QueryResource::Hierarchy)
    }

    pub fn search(query: &str) -> Self {
        Self::public(QueryResource::Search(normalize_query(query)))
    }

    /// The editor's item list, drafts included.
    pub fn editor_items() -> Self {
        Self::new(Namespace::Admin, QueryResource::Items)
    }

    pub fn segments(&self) -> Vec<String> {
        let mut segments = vec![self.namespace.as_str().to_string()];
        segments.extend(self.resource.segments());
        segments
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments().join("/"))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid query key `{0}`")]
pub struct InvalidQueryKey(pub String);

impl FromStr for QueryKey {
    type Err = InvalidQueryKey;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidQueryKey(value.to_string());
        let mut parts = value.splitn(4, '/');
        let namespace: Namespace = parts.next().ok_or_else(invalid)?.parse()?;
        let group = parts.next().ok_or_else(invalid)?;
        let kind = parts.next().ok_or_else(invalid)?;
        let param = parts.next();

        let resource = match (group, kind, param) {
            ("posts", "featured", None) => QueryResource::Featured,
            ("posts", "all", None) => QueryResource::Items,
            ("posts", "category", Some(id)) => QueryResource::Category(id.to_string()),
            ("posts", "item", Some(id)) => {
                QueryResource::Item(id.parse().map_err(|_| invalid())?)
            }
            ("posts", "search", Some(query)) => QueryResource::Search(query.to_string()),
            ("categories", "all", None) => QueryResource::Categories,
            ("categories", "hierarchy", None) => QueryResource::Hierarchy,
            _ => return Err(invalid()),
        };
        Ok(QueryKey::new(namespace, resource))
    }
}

/// Leading segments shared by a family of keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryPrefix(Vec<String>);

impl QueryPrefix {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Matches every key.
    pub fn all() -> Self {
        Self(Vec::new())
    }

    pub fn namespace(namespace: Namespace) -> Self {
        Self::new([namespace.as_str()])
    }

    /// Every post-derived key of a namespace, lists and details alike.
    pub fn posts(namespace: Namespace) -> Self {
        Self::new([namespace.as_str(), "posts"])
    }

    pub fn category_lists(namespace: Namespace) -> Self {
        Self::new([namespace.as_str(), "posts", "category"])
    }

    pub fn searches(namespace: Namespace) -> Self {
        Self::new([namespace.as_str(), "posts", "search"])
    }

    pub fn categories(namespace: Namespace) -> Self {
        Self::new([namespace.as_str(), "categories"])
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        let segments = key.segments();
        segments.len() >= self.0.len() && segments.iter().zip(&self.0).all(|(a, b)| a == b)
    }
}

impl From<&QueryKey> for QueryPrefix {
    fn from(key: &QueryKey) -> Self {
        Self(key.segments())
    }
}
