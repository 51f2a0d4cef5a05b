//! Common types for stride: errors, versions, configuration and async utilities

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod poll;
pub mod retry;
pub mod telemetry;
pub mod version;

pub use error::Error;
pub use version::CodeVersion;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Source identifier attached to every health report raised by the orchestrator
pub const HEALTH_SOURCE_ID: &str = "System.UpgradeOrchestrationService";
