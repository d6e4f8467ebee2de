//! Query cache persistence.
//!
//! The whole cache is mirrored as one versioned snapshot under its own key, so
//! a shape change can be detected and discarded on startup instead of
//! crashing it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::KeyValueBackend;
use crate::cache::durable::BackendError;

use super::key::{Namespace, QueryKey};
use super::record::{QueryData, QueryStatus};

/// Bump whenever [`PersistedSnapshot`] or [`QueryData`] changes shape.
pub const SNAPSHOT_VERSION: u32 = 1;
pub const SNAPSHOT_KEY: &str = "paddock-query:snapshot";

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("snapshot storage failed: {0}")]
    Backend(#[from] BackendError),
    #[error("snapshot is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub key: String,
    pub data: QueryData,
    /// Unix time of the last successful fetch, in milliseconds.
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    pub version: u32,
    /// Unix time the snapshot was taken, in milliseconds.
    pub timestamp: i64,
    pub records: Vec<PersistedRecord>,
}

/// Where snapshots go.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn persist(&self, snapshot: &PersistedSnapshot) -> Result<(), PersistError>;
    async fn restore(&self) -> Result<Option<PersistedSnapshot>, PersistError>;
    async fn remove(&self) -> Result<(), PersistError>;
}

/// Stores the snapshot in a [`KeyValueBackend`], alongside the durable store
/// but under a separate namespace.
#[derive(Clone)]
pub struct DurablePersister {
    backend: Arc<dyn KeyValueBackend>,
    key: String,
}

impl DurablePersister {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self {
            backend,
            key: SNAPSHOT_KEY.to_string(),
        }
    }
}

#[async_trait]
impl Persister for DurablePersister {
    async fn persist(&self, snapshot: &PersistedSnapshot) -> Result<(), PersistError> {
        let raw = serde_json::to_string(snapshot)?;
        self.backend.write(&self.key, &raw).await?;
        Ok(())
    }

    async fn restore(&self) -> Result<Option<PersistedSnapshot>, PersistError> {
        match self.backend.read(&self.key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self) -> Result<(), PersistError> {
        self.backend.remove(&self.key).await?;
        Ok(())
    }
}

/// Decides which records survive a restart.
#[derive(Debug, Clone)]
pub struct DehydrateFilter {
    pub namespaces: Vec<Namespace>,
    pub include_search: bool,
}

impl Default for DehydrateFilter {
    fn default() -> Self {
        Self {
            namespaces: vec![Namespace::Public],
            include_search: false,
        }
    }
}

impl DehydrateFilter {
    pub fn allows_key(&self, key: &QueryKey) -> bool {
        self.namespaces.contains(&key.namespace)
            && (self.include_search || !key.resource.is_search())
    }

    pub fn should_dehydrate(&self, key: &QueryKey, status: QueryStatus) -> bool {
        status == QueryStatus::Success && self.allows_key(key)
    }
}
