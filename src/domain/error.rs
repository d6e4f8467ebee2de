use thiserror::Error;

/// Rule violations detected before anything reaches the backend.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("`{field}` is invalid: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },
    #[error("parent category `{id}` does not exist")]
    UnknownParent { id: String },
}

impl DomainError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }
}
