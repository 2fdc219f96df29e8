//! Notification dispatch with per-recipient isolation
//!
//! One event is created per gated transition. Each recipient is sent to in
//! its own task, bounded by a semaphore and a per-send timeout. Outcomes
//! are written back as they complete. Delivery is at-most-once: failed
//! sends are recorded and never retried.

use crate::domain::message::MessageTemplates;
use crate::domain::types::{
    ChatId, Contact, DeliveryStatus, NotificationEvent, RecipientOutcome, Role, SubjectId,
    TransitionType, Trigger,
};
use crate::infra::config::Config;
use crate::infra::error::{NotifierError, NotifierResult};
use crate::infra::metrics::Metrics;
use crate::infra::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Why a single send failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SendError {
    #[error("transport error: {0}")]
    Transport(String),
    /// API-level rejection, e.g. blocked bot or unknown chat
    #[error("rejected ({code}): {description}")]
    Rejected { code: i64, description: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// The external send capability
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, chat: ChatId, text: &str) -> Result<(), SendError>;
}

pub struct Dispatcher {
    store: Arc<Store>,
    sender: Arc<dyn MessageSender>,
    metrics: Arc<Metrics>,
    templates: MessageTemplates,
    send_timeout: Duration,
    permits: Arc<Semaphore>,
    confirmations: bool,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        sender: Arc<dyn MessageSender>,
        metrics: Arc<Metrics>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            sender,
            metrics,
            templates: MessageTemplates::new(
                config.arrival_phrase(),
                config.departure_phrase(),
                config.utc_offset_minutes(),
            ),
            send_timeout: config.send_timeout(),
            permits: Arc::new(Semaphore::new(config.max_parallel_sends())),
            confirmations: config.confirmations(),
        }
    }

    /// Capability check for hand-fired notifications.
    ///
    /// Admins may fire for any subject, drivers only for their own.
    pub fn authorize_manual(&self, actor: ChatId, subject: SubjectId) -> NotifierResult<Contact> {
        let contact = self.store.contact(actor)?.ok_or(NotifierError::UnknownContact(actor))?;
        let allowed = contact.role.is_privileged()
            && (contact.role == Role::Admin || contact.subject == Some(subject));
        if !allowed {
            return Err(NotifierError::Forbidden { actor, subject });
        }
        Ok(contact)
    }

    /// Compose, record and send one notification.
    ///
    /// Fails only if the event cannot be created. Later persistence errors
    /// are logged and the in-memory event is still returned.
    pub async fn dispatch_at(
        &self,
        subject: SubjectId,
        kind: TransitionType,
        trigger: Trigger,
        recipients: Vec<Contact>,
        now: DateTime<Utc>,
    ) -> NotifierResult<NotificationEvent> {
        let mut seen = FxHashSet::default();
        let recipients: Vec<Contact> =
            recipients.into_iter().filter(|c| seen.insert(c.chat_id)).collect();

        let mut event = NotificationEvent {
            id: uuid::Uuid::now_v7().to_string(),
            transition: kind,
            trigger,
            subject,
            message_text: self.templates.compose(kind, now),
            created_at: now,
            completed_at: None,
            recipients: recipients.iter().map(RecipientOutcome::pending).collect(),
            sent_count: 0,
            failed_count: 0,
            confirmation_sent: false,
        };

        self.store.create_event(&event)?;
        self.metrics.record_dispatch(trigger == Trigger::Manual);

        if recipients.is_empty() {
            info!(subject = %subject, transition = %kind, trigger = %trigger, "no_eligible_recipients");
        } else {
            self.deliver(&mut event).await;
        }

        event.tally();
        let completed_at = Utc::now().max(now);
        event.completed_at = Some(completed_at);
        if let Err(e) =
            self.store.complete_event(&event.id, event.sent_count, event.failed_count, completed_at)
        {
            self.metrics.record_persistence_failure();
            error!(event_id = %event.id, error = %e, "notification_event_complete_failed");
        }

        info!(
            event_id = %event.id,
            subject = %subject,
            transition = %kind,
            trigger = %trigger,
            sent = %event.sent_count,
            failed = %event.failed_count,
            "notification_dispatched"
        );

        if self.confirmations && event.sent_count > 0 {
            self.send_confirmations(&mut event).await;
        }

        Ok(event)
    }

    async fn deliver(&self, event: &mut NotificationEvent) {
        let text: Arc<str> = Arc::from(event.message_text.as_str());
        let mut tasks = JoinSet::new();

        for (idx, outcome) in event.recipients.iter().enumerate() {
            let sender = Arc::clone(&self.sender);
            let permits = Arc::clone(&self.permits);
            let text = Arc::clone(&text);
            let chat = outcome.recipient;
            let timeout = self.send_timeout;

            tasks.spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(_permit) => {
                        let start = Instant::now();
                        let result = match tokio::time::timeout(timeout, sender.send(chat, &text)).await
                        {
                            Ok(result) => result,
                            Err(_) => Err(SendError::Timeout(timeout)),
                        };
                        (result, start.elapsed())
                    }
                    Err(_) => (Err(SendError::Transport("send pool closed".to_string())), Duration::ZERO),
                };
                (idx, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (idx, (result, elapsed)) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(event_id = %event.id, error = %e, "send_task_failed");
                    continue;
                }
            };
            let Some(outcome) = event.recipients.get_mut(idx) else {
                continue;
            };
            self.metrics.record_delivery(result.is_ok(), elapsed.as_millis() as u64);
            if let Err(ref e) = result {
                warn!(
                    event_id = %event.id,
                    recipient = %outcome.recipient,
                    name = %outcome.display_name,
                    error = %e,
                    "notification_delivery_failed"
                );
            }
            outcome.resolve(result.map_err(|e| e.to_string()));
            self.persist_outcome(&event.id, outcome);
        }

        // A panicked task leaves its recipient pending
        for outcome in event.recipients.iter_mut().filter(|o| o.status == DeliveryStatus::Pending) {
            outcome.resolve(Err("send task aborted".to_string()));
            self.metrics.record_delivery(false, 0);
            self.persist_outcome(&event.id, outcome);
        }
    }

    fn persist_outcome(&self, event_id: &str, outcome: &RecipientOutcome) {
        if let Err(e) = self.store.record_outcome(event_id, outcome) {
            self.metrics.record_persistence_failure();
            error!(
                event_id = %event_id,
                recipient = %outcome.recipient,
                error = %e,
                "recipient_outcome_write_failed"
            );
        }
    }

    /// Best effort. Failures are logged and never fail the dispatch.
    async fn send_confirmations(&self, event: &mut NotificationEvent) {
        let targets = match self.store.confirmation_targets(event.subject) {
            Ok(targets) => targets,
            Err(e) => {
                self.metrics.record_persistence_failure();
                error!(event_id = %event.id, error = %e, "confirmation_targets_failed");
                return;
            }
        };

        let now = Utc::now();
        let mut delivered = 0usize;
        for target in &targets {
            let text = match target.role {
                Role::Admin => self.templates.admin_confirmation(event, now),
                _ => self.templates.driver_confirmation(event, now),
            };
            let result = match tokio::time::timeout(
                self.send_timeout,
                self.sender.send(target.chat_id, &text),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SendError::Timeout(self.send_timeout)),
            };
            match result {
                Ok(()) => {
                    delivered += 1;
                    self.metrics.record_confirmation();
                }
                Err(e) => warn!(
                    event_id = %event.id,
                    recipient = %target.chat_id,
                    role = %target.role.as_str(),
                    error = %e,
                    "confirmation_delivery_failed"
                ),
            }
        }

        if delivered > 0 {
            event.confirmation_sent = true;
            if let Err(e) = self.store.mark_confirmation_sent(&event.id) {
                self.metrics.record_persistence_failure();
                error!(event_id = %event.id, error = %e, "confirmation_mark_failed");
            }
        }
    }
}
