//! Error taxonomy for the notifier
//!
//! Only boundary problems (bad input, forbidden caller) and persistence
//! failures are errors. Insufficient history, cooldown suppression and
//! empty recipient lists are reported as `EvaluationOutcome` values instead.

use crate::domain::geo::InvalidCoordinate;
use crate::domain::types::{ChatId, SubjectId};
use thiserror::Error;

pub type NotifierResult<T> = Result<T, NotifierError>;

#[derive(Debug, Error)]
pub enum NotifierError {
    /// Malformed or out-of-range coordinate, rejected at ingest
    #[error("invalid coordinate: {0}")]
    InvalidCoordinate(#[from] InvalidCoordinate),

    /// Store unavailable or query failed
    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// Caller lacks the role needed for the operation
    #[error("contact {actor} may not trigger notifications for subject {subject}")]
    Forbidden { actor: ChatId, subject: SubjectId },

    /// Actor is not a known contact
    #[error("unknown contact {0}")]
    UnknownContact(ChatId),
}

impl NotifierError {
    /// True for failures the background loop should back off from
    pub fn is_persistence(&self) -> bool {
        matches!(self, NotifierError::Persistence(_))
    }
}
