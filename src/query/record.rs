use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::application::error::ContentError;
use crate::domain::entities::{Category, CategoryNode, ContentItem};

/// Cached result of a query. Cloning shares the underlying allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum QueryData {
    Items(Arc<Vec<ContentItem>>),
    Item(Arc<ContentItem>),
    Categories(Arc<Vec<Category>>),
    Hierarchy(Arc<Vec<CategoryNode>>),
}

impl QueryData {
    pub fn items(&self) -> Option<&Arc<Vec<ContentItem>>> {
        match self {
            QueryData::Items(items) => Some(items),
            _ => None,
        }
    }

    pub fn item(&self) -> Option<&Arc<ContentItem>> {
        match self {
            QueryData::Item(item) => Some(item),
            _ => None,
        }
    }

    pub fn categories(&self) -> Option<&Arc<Vec<Category>>> {
        match self {
            QueryData::Categories(categories) => Some(categories),
            _ => None,
        }
    }

    pub fn hierarchy(&self) -> Option<&Arc<Vec<CategoryNode>>> {
        match self {
            QueryData::Hierarchy(nodes) => Some(nodes),
            _ => None,
        }
    }

    /// Whether two values share one allocation.
    pub fn same_allocation(&self, other: &QueryData) -> bool {
        match (self, other) {
            (QueryData::Items(a), QueryData::Items(b)) => Arc::ptr_eq(a, b),
            (QueryData::Item(a), QueryData::Item(b)) => Arc::ptr_eq(a, b),
            (QueryData::Categories(a), QueryData::Categories(b)) => Arc::ptr_eq(a, b),
            (QueryData::Hierarchy(a), QueryData::Hierarchy(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Failure of a query fetch, shared by every waiter of that fetch.
#[derive(Debug, Clone)]
pub struct QueryError(Arc<ContentError>);

impl QueryError {
    pub fn inner(&self) -> &ContentError {
        &self.0
    }

    /// Terminal conditions are never retried.
    pub fn should_retry(&self) -> bool {
        !matches!(
            *self.0,
            ContentError::NotFound { .. }
                | ContentError::Authorization(_)
                | ContentError::Validation { .. }
                | ContentError::Conflict(_)
                | ContentError::Reference(_)
        )
    }
}

impl From<ContentError> for QueryError {
    fn from(error: ContentError) -> Self {
        Self(Arc::new(error))
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Pending,
    Success,
    Error,
}

/// What an observer of a key sees.
#[derive(Debug, Clone, Default)]
pub struct QueryState {
    pub data: Option<QueryData>,
    pub is_loading: bool,
    pub error: Option<QueryError>,
}

pub(crate) type InFlight = Shared<BoxFuture<'static, Result<QueryData, QueryError>>>;

pub(crate) struct QueryRecord {
    pub data: Option<QueryData>,
    pub status: QueryStatus,
    pub error: Option<QueryError>,
    pub updated_at: Option<Instant>,
    pub invalidated: bool,
    /// Bumped by every invalidation; a fetch started under an older epoch
    /// leaves the record invalidated when it lands.
    pub epoch: u64,
    /// Identifies the fetch currently held in `in_flight`.
    pub fetch_id: u64,
    /// Epoch the in-flight fetch started under. A fetch from an older epoch
    /// is not joined by later readers.
    pub fetch_epoch: u64,
    pub observers: usize,
    pub unobserved_since: Option<Instant>,
    pub in_flight: Option<InFlight>,
    pub state: watch::Sender<QueryState>,
}

impl QueryRecord {
    pub fn new(now: Instant) -> Self {
        let (state, _) = watch::channel(QueryState::default());
        Self {
            data: None,
            status: QueryStatus::Pending,
            error: None,
            updated_at: None,
            invalidated: false,
            epoch: 0,
            fetch_id: 0,
            fetch_epoch: 0,
            observers: 0,
            unobserved_since: Some(now),
            in_flight: None,
            state,
        }
    }

    pub fn is_fresh(&self, now: Instant, stale_time: std::time::Duration) -> bool {
        self.status == QueryStatus::Success
            && !self.invalidated
            && self
                .updated_at
                .is_some_and(|at| now.saturating_duration_since(at) < stale_time)
    }

    pub fn publish(&self) {
        self.state.send_replace(QueryState {
            data: self.data.clone(),
            is_loading: self.in_flight.is_some(),
            error: self.error.clone(),
        });
    }
}
