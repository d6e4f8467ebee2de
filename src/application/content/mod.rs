mod commands;
mod queries;
mod service;
pub mod types;

pub use service::ContentService;
pub use types::{
    ClearReport, OrchestratorConfig, RefreshReport, StaticFallback, ensure_non_empty,
};
