//! Background re-scan of the location log
//!
//! Every tick evaluates each tracked subject through the shared pipeline,
//! catching transitions the inline path missed. A persistence failure ends
//! the tick early and the next one is delayed by a doubling backoff.

use crate::domain::types::Trigger;
use crate::infra::config::Config;
use crate::infra::error::NotifierResult;
use crate::services::pipeline::{EvaluationOutcome, Pipeline};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Counts from one scan
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub subjects: usize,
    pub dispatched: usize,
    pub suppressed: usize,
}

pub struct Poller {
    pipeline: Arc<Pipeline>,
    interval: Duration,
    backoff_max: Duration,
    shutdown: watch::Receiver<bool>,
}

/// Next delay after a failure: double, capped at `max`
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

impl Poller {
    pub fn new(pipeline: Arc<Pipeline>, config: &Config, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            pipeline,
            interval: config.poll_interval(),
            backoff_max: config.backoff_max(),
            shutdown,
        }
    }

    /// Evaluate every tracked subject once
    pub async fn scan_once(&self) -> NotifierResult<ScanSummary> {
        let subjects = self.pipeline.store().tracked_subjects()?;
        let mut summary = ScanSummary { subjects: subjects.len(), ..Default::default() };

        for subject in subjects {
            match self.pipeline.evaluate(subject, Trigger::Background).await? {
                EvaluationOutcome::Dispatched(_) | EvaluationOutcome::NoEligibleRecipients(_) => {
                    summary.dispatched += 1;
                }
                EvaluationOutcome::CooldownActive { .. } => summary.suppressed += 1,
                other => debug!(subject = %subject, outcome = %other.as_str(), "poller_evaluated"),
            }
        }
        Ok(summary)
    }

    /// Run until the shutdown flag flips. A scan in progress is finished first.
    pub async fn run(mut self) {
        info!(
            interval_secs = %self.interval.as_secs(),
            backoff_max_secs = %self.backoff_max.as_secs(),
            "poller_started"
        );

        let mut delay = self.interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            self.pipeline.metrics().record_poller_tick();
            match self.scan_once().await {
                Ok(summary) => {
                    if summary.dispatched > 0 || summary.suppressed > 0 {
                        info!(
                            subjects = %summary.subjects,
                            dispatched = %summary.dispatched,
                            suppressed = %summary.suppressed,
                            "poller_scan"
                        );
                    }
                    delay = self.interval;
                }
                Err(e) if e.is_persistence() => {
                    delay = next_backoff(delay.max(self.interval), self.backoff_max);
                    error!(error = %e, retry_in_secs = %delay.as_secs(), "poller_scan_failed");
                }
                Err(e) => {
                    warn!(error = %e, "poller_scan_error");
                    delay = self.interval;
                }
            }
        }

        info!("poller_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let max = Duration::from_secs(300);
        let mut delay = Duration::from_secs(30);
        delay = next_backoff(delay, max);
        assert_eq!(delay, Duration::from_secs(60));
        delay = next_backoff(delay, max);
        delay = next_backoff(delay, max);
        assert_eq!(delay, Duration::from_secs(240));
        assert_eq!(next_backoff(delay, max), max);
        assert_eq!(next_backoff(max, max), max);
    }
}
