//! Durable per-subject, per-transition-type cooldown
//!
//! The check and the write happen in one conditional upsert in the store,
//! so concurrent evaluators cannot both pass the gate.

use crate::domain::types::{SubjectId, TransitionType};
use crate::infra::config::Config;
use crate::infra::error::NotifierResult;
use crate::infra::store::Store;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

pub struct CooldownGate {
    store: Arc<Store>,
    arrival: Duration,
    departure: Duration,
}

/// `now - last >= cooldown`. A missing last firing always passes.
pub fn elapsed_enough(last: Option<DateTime<Utc>>, now: DateTime<Utc>, cooldown: Duration) -> bool {
    match last {
        None => true,
        Some(last) => match (now - last).to_std() {
            Ok(elapsed) => elapsed >= cooldown,
            // last firing is in the future relative to now
            Err(_) => false,
        },
    }
}

impl CooldownGate {
    pub fn new(store: Arc<Store>, config: &Config) -> Self {
        Self {
            store,
            arrival: config.cooldown(TransitionType::Arrival),
            departure: config.cooldown(TransitionType::Departure),
        }
    }

    pub fn cooldown(&self, kind: TransitionType) -> Duration {
        match kind {
            TransitionType::Arrival => self.arrival,
            TransitionType::Departure => self.departure,
        }
    }

    /// Read-only check. Use `try_acquire` to actually take the slot.
    pub fn may_fire(
        &self,
        subject: SubjectId,
        kind: TransitionType,
        now: DateTime<Utc>,
    ) -> NotifierResult<bool> {
        let last = self.store.last_fired(subject, kind)?;
        Ok(elapsed_enough(last, now, self.cooldown(kind)))
    }

    /// Check and record in one step. True means the caller may dispatch.
    pub fn try_acquire(
        &self,
        subject: SubjectId,
        kind: TransitionType,
        now: DateTime<Utc>,
    ) -> NotifierResult<bool> {
        self.store.try_acquire_cooldown(subject, kind, now, self.cooldown(kind))
    }

    pub fn record_fired(
        &self,
        subject: SubjectId,
        kind: TransitionType,
        at: DateTime<Utc>,
    ) -> NotifierResult<()> {
        self.store.record_fired(subject, kind, at)
    }

    /// Undo a `try_acquire` at `fired_at` whose dispatch never happened
    pub fn release(
        &self,
        subject: SubjectId,
        kind: TransitionType,
        fired_at: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> NotifierResult<bool> {
        self.store.release_cooldown(subject, kind, fired_at, previous)
    }

    /// Time left before `kind` may fire again, zero if it may fire now
    pub fn remaining(
        &self,
        subject: SubjectId,
        kind: TransitionType,
        now: DateTime<Utc>,
    ) -> NotifierResult<Duration> {
        let Some(last) = self.store.last_fired(subject, kind)? else {
            return Ok(Duration::ZERO);
        };
        let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
        Ok(self.cooldown(kind).saturating_sub(elapsed))
    }
}
