//! Services - business logic
//!
//! This module contains the notification pipeline:
//! - `detector` - Arrival/departure detection from consecutive samples
//! - `cooldown` - Durable per-transition-type cooldown gate
//! - `dispatcher` - Per-recipient delivery and confirmations
//! - `pipeline` - Shared path used by every trigger
//! - `poller` - Periodic background scan

pub mod cooldown;
pub mod detector;
pub mod dispatcher;
pub mod pipeline;
pub mod poller;

// Re-export commonly used types
pub use cooldown::CooldownGate;
pub use dispatcher::{Dispatcher, MessageSender, SendError};
pub use pipeline::{EvaluationOutcome, Pipeline};
pub use poller::Poller;
