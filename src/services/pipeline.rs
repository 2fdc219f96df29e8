//! Shared detect → claim → gate → dispatch path
//!
//! The inline ingest path, the background poller and the manual trigger are
//! all thin callers of `Pipeline`. Double firing is prevented twice over:
//! the evaluation mark hands each new sample pair to exactly one evaluator,
//! and the cooldown upsert lets only one dispatch through per window.

use crate::domain::geo::validate_coordinate;
use crate::domain::types::{
    ChatId, LocationSample, NotificationEvent, SampleId, SubjectId, TransitionType, Trigger,
    WorkZone,
};
use crate::infra::config::Config;
use crate::infra::error::NotifierResult;
use crate::infra::metrics::Metrics;
use crate::infra::store::{NewSample, Store};
use crate::services::cooldown::CooldownGate;
use crate::services::detector::detect_all;
use crate::services::dispatcher::Dispatcher;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Most samples looked at in one evaluation.
///
/// Every pair in the window is classified, but only the newest transition is
/// dispatched. Older ones in the same window are logged as superseded.
pub const MAX_EVALUATION_WINDOW: usize = 100;

/// Result of one evaluation. None of these are errors.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationOutcome {
    /// Fewer than two samples stored for the subject
    InsufficientHistory,
    /// No sample newer than the last evaluated one, or another evaluator won the claim
    AlreadyEvaluated,
    NoChange,
    /// Transition seen while automatic tracking is off
    TrackingDisabled(TransitionType),
    /// Transition seen but suppressed by the cooldown
    CooldownActive { kind: TransitionType, remaining: Duration },
    /// Dispatched with nobody to send to
    NoEligibleRecipients(NotificationEvent),
    Dispatched(NotificationEvent),
}

impl EvaluationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationOutcome::InsufficientHistory => "insufficient_history",
            EvaluationOutcome::AlreadyEvaluated => "already_evaluated",
            EvaluationOutcome::NoChange => "no_change",
            EvaluationOutcome::TrackingDisabled(_) => "tracking_disabled",
            EvaluationOutcome::CooldownActive { .. } => "cooldown_active",
            EvaluationOutcome::NoEligibleRecipients(_) => "no_eligible_recipients",
            EvaluationOutcome::Dispatched(_) => "dispatched",
        }
    }

    pub fn event(&self) -> Option<&NotificationEvent> {
        match self {
            EvaluationOutcome::NoEligibleRecipients(event) | EvaluationOutcome::Dispatched(event) => {
                Some(event)
            }
            _ => None,
        }
    }
}

pub struct Pipeline {
    store: Arc<Store>,
    gate: CooldownGate,
    dispatcher: Dispatcher,
    metrics: Arc<Metrics>,
    default_zone: WorkZone,
    stale_after: chrono::Duration,
}

impl Pipeline {
    pub fn new(
        store: Arc<Store>,
        dispatcher: Dispatcher,
        metrics: Arc<Metrics>,
        config: &Config,
    ) -> Self {
        Self {
            gate: CooldownGate::new(Arc::clone(&store), config),
            store,
            dispatcher,
            metrics,
            default_zone: config.default_zone(),
            stale_after: chrono::Duration::from_std(config.stale_after())
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn gate(&self) -> &CooldownGate {
        &self.gate
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Subject override, else the global default
    pub fn zone_for(&self, subject: SubjectId) -> NotifierResult<WorkZone> {
        Ok(self.store.zone_for(subject)?.unwrap_or(self.default_zone))
    }

    pub fn is_stale(&self, sample: &LocationSample, now: DateTime<Utc>) -> bool {
        sample.is_stale(now, self.stale_after)
    }

    /// Same threshold applied to a device-reported timestamp
    pub fn is_stale_time(&self, reported_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - reported_at > self.stale_after
    }

    /// Validate, tag with distance and membership, and persist a sample
    pub fn append(&self, subject: SubjectId, lat: f64, lon: f64) -> NotifierResult<LocationSample> {
        self.append_at(subject, lat, lon, Utc::now())
    }

    pub fn append_at(
        &self,
        subject: SubjectId,
        lat: f64,
        lon: f64,
        at: DateTime<Utc>,
    ) -> NotifierResult<LocationSample> {
        if let Err(e) = validate_coordinate(lat, lon) {
            self.metrics.record_invalid_sample();
            debug!(subject = %subject, error = %e, "sample_rejected");
            return Err(e.into());
        }

        let zone = self.zone_for(subject).inspect_err(|e| self.persistence_failed(subject, e))?;
        let distance_m = zone.distance_to(lat, lon);
        let sample = NewSample {
            subject,
            latitude: lat,
            longitude: lon,
            distance_m,
            in_zone: distance_m <= zone.radius_m,
            created_at: at,
        };
        let stored =
            self.store.insert_sample(&sample).inspect_err(|e| self.persistence_failed(subject, e))?;
        self.metrics.record_sample();

        debug!(
            subject = %subject,
            sample_id = %stored.id,
            distance_m = format!("{:.1}", stored.distance_m),
            in_zone = %stored.in_zone,
            "sample_stored"
        );
        Ok(stored)
    }

    pub async fn evaluate(
        &self,
        subject: SubjectId,
        trigger: Trigger,
    ) -> NotifierResult<EvaluationOutcome> {
        self.evaluate_at(subject, trigger, Utc::now()).await
    }

    /// Evaluate every sample pair newer than the subject's evaluation mark
    pub async fn evaluate_at(
        &self,
        subject: SubjectId,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> NotifierResult<EvaluationOutcome> {
        let result = self.run_evaluation(subject, trigger, now).await;
        if let Err(ref e) = result {
            if e.is_persistence() {
                self.persistence_failed(subject, e);
            }
        }
        result
    }

    async fn run_evaluation(
        &self,
        subject: SubjectId,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> NotifierResult<EvaluationOutcome> {
        let mark = self.store.last_evaluated(subject)?;
        let window = match mark {
            None => self.store.last_two(subject)?,
            Some(mark) => self.store.samples_since(subject, mark, MAX_EVALUATION_WINDOW)?,
        };

        let (Some(first), Some(current)) = (window.first(), window.last()) else {
            return Ok(EvaluationOutcome::InsufficientHistory);
        };
        if mark == Some(current.id) {
            return Ok(EvaluationOutcome::AlreadyEvaluated);
        }
        if window.len() < 2 {
            return Ok(EvaluationOutcome::InsufficientHistory);
        }
        if let Some(mark) = mark {
            if first.id != mark {
                warn!(subject = %subject, mark = %mark, oldest = %first.id, "evaluation_window_truncated");
            }
        }

        if !self.store.claim_evaluation(subject, mark, current.id)? {
            debug!(
                subject = %subject,
                sample_id = %current.id,
                trigger = %trigger,
                "evaluation_claimed_elsewhere"
            );
            return Ok(EvaluationOutcome::AlreadyEvaluated);
        }

        let result = self.evaluate_claimed(subject, trigger, &window, now).await;
        if result.is_err() {
            self.release_claim(subject, current.id, mark);
        }
        result
    }

    /// Detect, gate and dispatch over a window this caller has claimed.
    ///
    /// Only the newest transition is dispatched; it is where the subject is now.
    async fn evaluate_claimed(
        &self,
        subject: SubjectId,
        trigger: Trigger,
        window: &[LocationSample],
        now: DateTime<Utc>,
    ) -> NotifierResult<EvaluationOutcome> {
        if let Some(current) = window.last() {
            if self.is_stale(current, now) {
                self.metrics.record_stale_sample();
                info!(
                    subject = %subject,
                    sample_id = %current.id,
                    age_secs = %(now - current.created_at).num_seconds(),
                    "stale_sample"
                );
            }
        }

        let transitions = detect_all(window);
        for _ in &transitions {
            self.metrics.record_transition();
        }
        let Some((latest, superseded)) = transitions.split_last() else {
            return Ok(EvaluationOutcome::NoChange);
        };
        for old in superseded {
            info!(subject = %subject, transition = %old.kind, to = %old.to, "transition_superseded");
        }

        info!(
            subject = %subject,
            transition = %latest.kind,
            from = %latest.from,
            to = %latest.to,
            trigger = %trigger,
            "transition_detected"
        );

        if !self.store.tracking_enabled(subject)? {
            info!(subject = %subject, transition = %latest.kind, "tracking_disabled");
            return Ok(EvaluationOutcome::TrackingDisabled(latest.kind));
        }

        self.gate_and_dispatch(subject, latest.kind, trigger, now).await
    }

    /// Hand the claimed pairs back so the next evaluation retries them
    fn release_claim(&self, subject: SubjectId, claimed: SampleId, previous: Option<SampleId>) {
        match self.store.release_evaluation(subject, claimed, previous) {
            Ok(true) => warn!(subject = %subject, sample_id = %claimed, "evaluation_released"),
            Ok(false) => {}
            Err(e) => {
                self.metrics.record_persistence_failure();
                error!(subject = %subject, sample_id = %claimed, error = %e, "evaluation_release_failed");
            }
        }
    }

    /// Hand-fired arrival notification by a driver or admin.
    ///
    /// Subject to the same arrival cooldown as detected arrivals.
    pub async fn notify_manual(
        &self,
        subject: SubjectId,
        actor: ChatId,
    ) -> NotifierResult<EvaluationOutcome> {
        self.notify_manual_at(subject, actor, Utc::now()).await
    }

    pub async fn notify_manual_at(
        &self,
        subject: SubjectId,
        actor: ChatId,
        now: DateTime<Utc>,
    ) -> NotifierResult<EvaluationOutcome> {
        let contact = self.dispatcher.authorize_manual(actor, subject)?;
        info!(subject = %subject, actor = %actor, role = %contact.role.as_str(), "manual_trigger");

        let result = self.gate_and_dispatch(subject, TransitionType::Arrival, Trigger::Manual, now).await;
        if let Err(ref e) = result {
            if e.is_persistence() {
                self.persistence_failed(subject, e);
            }
        }
        result
    }

    async fn gate_and_dispatch(
        &self,
        subject: SubjectId,
        kind: TransitionType,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> NotifierResult<EvaluationOutcome> {
        let previous = self.store.last_fired(subject, kind)?;
        if !self.gate.try_acquire(subject, kind, now)? {
            let remaining = self.gate.remaining(subject, kind, now)?;
            self.metrics.record_cooldown_suppressed();
            info!(
                subject = %subject,
                transition = %kind,
                trigger = %trigger,
                remaining_secs = %remaining.as_secs(),
                "cooldown_active"
            );
            return Ok(EvaluationOutcome::CooldownActive { kind, remaining });
        }

        let event = match self.send_gated(subject, kind, trigger, now).await {
            Ok(event) => event,
            Err(e) => {
                // nothing was sent, so the slot goes back
                if let Err(release) = self.gate.release(subject, kind, now, previous) {
                    self.metrics.record_persistence_failure();
                    error!(subject = %subject, transition = %kind, error = %release, "cooldown_release_failed");
                }
                return Err(e);
            }
        };

        if event.recipients.is_empty() {
            Ok(EvaluationOutcome::NoEligibleRecipients(event))
        } else {
            Ok(EvaluationOutcome::Dispatched(event))
        }
    }

    async fn send_gated(
        &self,
        subject: SubjectId,
        kind: TransitionType,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> NotifierResult<NotificationEvent> {
        let recipients = self.store.recipients_for(subject)?;
        self.dispatcher.dispatch_at(subject, kind, trigger, recipients, now).await
    }

    fn persistence_failed(&self, subject: SubjectId, e: &crate::infra::error::NotifierError) {
        self.metrics.record_persistence_failure();
        error!(subject = %subject, error = %e, "persistence_failure");
    }
}
