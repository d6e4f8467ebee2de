use std::error::Error as StdError;

use thiserror::Error;

use crate::application::repos::RepoError;
use crate::config::LoadError;
use crate::domain::error::DomainError;
use crate::infra::error::InfraError;
use crate::query::QueryError;
use crate::realtime::FeedError;

/// Error surfaced to callers of the content service.
///
/// Reads only ever surface `NotFound` (single-item lookups) or, when no tier
/// could answer a detail read, `Transient`. Writes surface every kind.
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("`{field}` is invalid: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("conflicts with an existing record: {0}")]
    Conflict(String),
    #[error("invalid reference: {0}")]
    Reference(String),
    #[error("{entity} not found")]
    NotFound { entity: &'static str },
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("backend temporarily unavailable: {0}")]
    Transient(String),
}

impl ContentError {
    pub fn authorization(message: impl Into<String>) -> Self {
        Self::Authorization(message.into())
    }

    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity }
    }

    /// Only unexpected backend failures are worth offering a retry for.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ContentError::Storage(_) | ContentError::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ContentError::NotFound { .. })
    }
}

impl From<DomainError> for ContentError {
    fn from(error: DomainError) -> Self {
        match error {
            DomainError::Validation { field, message } => {
                ContentError::Validation { field, message }
            }
            err @ DomainError::UnknownParent { .. } => ContentError::Reference(err.to_string()),
        }
    }
}

impl From<RepoError> for ContentError {
    fn from(error: RepoError) -> Self {
        match error {
            RepoError::NotFound => ContentError::not_found("record"),
            RepoError::Duplicate { constraint } => ContentError::Conflict(constraint),
            RepoError::Integrity { message } => ContentError::Reference(message),
            RepoError::Forbidden { message } => ContentError::Authorization(message),
            err @ (RepoError::Transport(_) | RepoError::Timeout(_)) => {
                ContentError::Transient(err.to_string())
            }
            err @ RepoError::Status { .. } if err.is_transient() => {
                ContentError::Transient(err.to_string())
            }
            err @ (RepoError::Status { .. } | RepoError::Decode(_)) => {
                ContentError::Storage(err.to_string())
            }
        }
    }
}

/// Top-level error of the operator binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

/// Message chain of an error, outermost first.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { source, messages }
    }
}
