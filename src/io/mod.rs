//! IO modules - external system interfaces
//!
//! - `http` - HTTP API (location ingest, queries, manual trigger, /metrics, /health)
//! - `ingest` - Location payload parsing (plain and OwnTracks bodies)
//! - `telegram` - Telegram Bot API client implementing `MessageSender`
//! - `prometheus` - Prometheus text exposition of notifier metrics

pub mod http;
pub mod ingest;
pub mod prometheus;
pub mod telegram;

pub use http::{start_http_server, HttpState};
pub use ingest::{parse_payload, IngestPayload, LocationReport, PayloadError, ReportFormat};
pub use telegram::TelegramClient;
