//! Infrastructure - configuration, metrics, persistence and errors
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults)
//! - `metrics` - Lock-free metrics collection
//! - `store` - SQLite persistence (rusqlite)
//! - `error` - Error taxonomy shared by services and IO

pub mod config;
pub mod error;
pub mod metrics;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use error::{NotifierError, NotifierResult};
pub use metrics::Metrics;
pub use store::{NewSample, Store, TransitionStats};
