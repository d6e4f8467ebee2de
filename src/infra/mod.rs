//! Infrastructure adapters and runtime bootstrap.

pub mod auth;
pub mod error;
pub mod gateway;
pub mod realtime;
pub mod storage;
pub mod telemetry;
