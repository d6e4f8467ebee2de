use thiserror::Error;

/// Failures while wiring up adapters to the hosted backend.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("http client could not be built: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("{service} endpoint is unusable: {message}")]
    Endpoint {
        service: &'static str,
        message: String,
    },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl InfraError {
    pub fn endpoint(service: &'static str, message: impl Into<String>) -> Self {
        Self::Endpoint {
            service,
            message: message.into(),
        }
    }
}
