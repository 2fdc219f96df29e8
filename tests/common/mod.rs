//! Shared fixtures for integration tests
#![allow(dead_code)]

use arrival_notifier::domain::types::{ChatId, Contact, Role, SubjectId};
use arrival_notifier::infra::{Config, Metrics, Store};
use arrival_notifier::services::{Dispatcher, MessageSender, Pipeline, SendError};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const SUBJECT: SubjectId = SubjectId(1);
pub const CENTER: (f64, f64) = (55.676803, 37.523510);
pub const AWAY: (f64, f64) = (55.6800, 37.5300);

/// Fixed clock: `secs` after a base instant
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Records every send. Chats can be set to fail or to answer slowly.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(ChatId, String)>>,
    failing: Vec<ChatId>,
    slow: Vec<(ChatId, Duration)>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, chat: ChatId) -> Self {
        self.failing.push(chat);
        self
    }

    pub fn slow(mut self, chat: ChatId, delay: Duration) -> Self {
        self.slow.push((chat, delay));
        self
    }

    pub fn sent_to(&self, chat: ChatId) -> usize {
        self.sent.lock().iter().filter(|(c, _)| *c == chat).count()
    }

    pub fn total(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, chat: ChatId, text: &str) -> Result<(), SendError> {
        if let Some((_, delay)) = self.slow.iter().find(|(c, _)| *c == chat) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(&chat) {
            return Err(SendError::Rejected {
                code: 403,
                description: "Forbidden: bot was blocked by the user".to_string(),
            });
        }
        self.sent.lock().push((chat, text.to_string()));
        Ok(())
    }
}

pub fn contact(chat: i64, role: Role, subject: Option<SubjectId>) -> Contact {
    Contact { chat_id: ChatId(chat), display_name: format!("contact-{chat}"), role, subject }
}

pub struct Harness {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<Store>,
    pub sender: Arc<RecordingSender>,
    pub metrics: Arc<Metrics>,
}

/// Wire a pipeline over `store`. Tracking is switched on for `SUBJECT`.
pub fn harness(config: &Config, store: Store, sender: RecordingSender) -> Harness {
    let store = Arc::new(store);
    let sender = Arc::new(sender);
    let metrics = Arc::new(Metrics::new());
    let dispatcher = Dispatcher::new(store.clone(), sender.clone(), metrics.clone(), config);
    let pipeline = Arc::new(Pipeline::new(store.clone(), dispatcher, metrics.clone(), config));
    store.set_tracking(SUBJECT, true, at(0)).unwrap();
    Harness { pipeline, store, sender, metrics }
}

pub fn in_memory(config: &Config, sender: RecordingSender) -> Harness {
    harness(config, Store::open_in_memory().unwrap(), sender)
}

/// Config without confirmations, so only recipient sends are recorded
pub fn quiet_config() -> Config {
    Config::default().with_confirmations(false)
}

/// Rename a table through a second connection, making the store fail on it
pub fn rename_table(path: &Path, from: &str, to: &str) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(&format!("ALTER TABLE {from} RENAME TO {to}")).unwrap();
}
