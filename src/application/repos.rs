//! Repository traits describing the backend collaborators.
//!
//! The orchestrator only talks to these seams: a cached reader, an
//! authenticated writer, blob storage and the auth session. `infra` provides
//! the REST implementations; tests provide in-memory ones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cache::{Freshness, ResourceKey, ResourcePrefix};
use crate::domain::entities::{Category, CategoryInput, ContentItem, ItemChanges, ItemInput};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("backend unreachable: {0}")]
    Transport(String),
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("backend returned status {status}: {message}")]
    Status {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("could not decode backend response: {0}")]
    Decode(String),
    #[error("resource not found")]
    NotFound,
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("not permitted: {message}")]
    Forbidden { message: String },
}

impl RepoError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        Self::Decode(err.to_string())
    }

    /// Failures worth retrying or covering with cached data.
    pub fn is_transient(&self) -> bool {
        match self {
            RepoError::Transport(_) | RepoError::Timeout(_) | RepoError::Decode(_) => true,
            RepoError::Status { status, .. } => *status >= 500 || *status == 429,
            RepoError::NotFound
            | RepoError::Duplicate { .. }
            | RepoError::Integrity { .. }
            | RepoError::Forbidden { .. } => false,
        }
    }
}

/// Body of a cached backend read.
///
/// Payloads are shared: every tier hands out the same `Arc` until the entry
/// is replaced, so repeated reads within a TTL return the identical list.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Items(Arc<Vec<ContentItem>>),
    Item(Arc<ContentItem>),
    Categories(Arc<Vec<Category>>),
}

impl Payload {
    pub fn into_items(self) -> Result<Arc<Vec<ContentItem>>, RepoError> {
        match self {
            Payload::Items(items) => Ok(items),
            other => Err(RepoError::decode(format!("expected items, got {}", other.kind()))),
        }
    }

    pub fn into_item(self) -> Result<Arc<ContentItem>, RepoError> {
        match self {
            Payload::Item(item) => Ok(item),
            other => Err(RepoError::decode(format!("expected item, got {}", other.kind()))),
        }
    }

    pub fn into_categories(self) -> Result<Arc<Vec<Category>>, RepoError> {
        match self {
            Payload::Categories(categories) => Ok(categories),
            other => Err(RepoError::decode(format!(
                "expected categories, got {}",
                other.kind()
            ))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Payload::Items(_) => "items",
            Payload::Item(_) => "item",
            Payload::Categories(_) => "categories",
        }
    }
}

/// A read result together with the tier it came from.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub payload: Payload,
    pub freshness: Freshness,
}

/// Who is acting on the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
    /// Session token forwarded to the backend for row-level security.
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Editor,
    Reader,
}

impl Principal {
    pub fn is_privileged(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Editor)
    }
}

/// Read side of the backend, fronted by the gateway's memory cache.
#[async_trait]
pub trait ContentReader: Send + Sync {
    async fn fetch(&self, key: &ResourceKey) -> Result<Fetched, RepoError>;

    /// Drop cached entries matching any of `prefixes` and bust intermediary
    /// caches. Returns the number of dropped entries.
    async fn invalidate(&self, prefixes: &[ResourcePrefix]) -> usize;
}

/// Write side of the backend. Authorization is enforced server-side; the
/// principal's token is forwarded.
#[async_trait]
pub trait ContentWriter: Send + Sync {
    /// Uncached read of an item regardless of its publication state.
    async fn load_item(&self, actor: &Principal, id: i64)
    -> Result<Option<ContentItem>, RepoError>;

    /// Uncached listing of every item, drafts included, newest first.
    async fn list_items(&self, actor: &Principal) -> Result<Vec<ContentItem>, RepoError>;

    async fn insert_item(&self, actor: &Principal, input: &ItemInput)
    -> Result<ContentItem, RepoError>;

    async fn update_item(
        &self,
        actor: &Principal,
        id: i64,
        changes: &ItemChanges,
    ) -> Result<ContentItem, RepoError>;

    async fn delete_item(&self, actor: &Principal, id: i64) -> Result<ContentItem, RepoError>;

    async fn insert_category(
        &self,
        actor: &Principal,
        input: &CategoryInput,
    ) -> Result<Category, RepoError>;

    async fn update_category(
        &self,
        actor: &Principal,
        id: &str,
        input: &CategoryInput,
    ) -> Result<Category, RepoError>;

    async fn delete_category(&self, actor: &Principal, id: &str) -> Result<Category, RepoError>;
}

/// Resize/quality options for rendered image URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransform {
    pub width: u32,
    pub quality: u8,
}

impl Default for ImageTransform {
    fn default() -> Self {
        Self {
            width: 1200,
            quality: 75,
        }
    }
}

/// Blob storage holding article images.
#[async_trait]
pub trait AssetStorage: Send + Sync {
    async fn remove(&self, path: &str) -> Result<(), RepoError>;

    fn public_url(&self, path: &str, transform: &ImageTransform) -> String;
}

/// The current auth session.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_principal(&self) -> Option<Principal>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RepoError::Timeout(Duration::from_secs(8)).is_transient());
        assert!(
            RepoError::Status {
                status: 503,
                code: None,
                message: "unavailable".into()
            }
            .is_transient()
        );
        assert!(
            !RepoError::Status {
                status: 400,
                code: None,
                message: "bad".into()
            }
            .is_transient()
        );
        assert!(!RepoError::NotFound.is_transient());
    }

    #[test]
    fn payload_kind_mismatch_is_a_decode_error() {
        let payload = Payload::Categories(Arc::new(Vec::new()));
        assert!(matches!(payload.into_items(), Err(RepoError::Decode(_))));
    }

    #[test]
    fn only_editors_and_admins_are_privileged() {
        let mut principal = Principal {
            user_id: "u1".into(),
            role: Role::Reader,
            access_token: None,
        };
        assert!(!principal.is_privileged());
        principal.role = Role::Editor;
        assert!(principal.is_privileged());
    }
}
