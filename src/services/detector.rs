//! Transition detection between consecutive location samples
//!
//! Stateless: the OUTSIDE/INSIDE state is recomputed from stored samples on
//! every call, so a restart loses nothing. Callers own the "last evaluated
//! sample" bookkeeping that keeps a pair from firing twice.

use crate::domain::types::{LocationSample, Transition, TransitionType};

/// Classify the change between `prev` and `curr`.
///
/// Pairs that belong to different subjects or are not in strict id order
/// (duplicates, out-of-order records) yield nothing.
pub fn detect(prev: &LocationSample, curr: &LocationSample) -> Option<Transition> {
    if prev.subject != curr.subject || prev.id >= curr.id {
        return None;
    }

    let kind = match (prev.in_zone, curr.in_zone) {
        (false, true) => TransitionType::Arrival,
        (true, false) => TransitionType::Departure,
        _ => return None,
    };

    Some(Transition { kind, subject: curr.subject, from: prev.id, to: curr.id, at: curr.created_at })
}

/// Transitions across every adjacent pair of an id-ordered window
pub fn detect_all(samples: &[LocationSample]) -> Vec<Transition> {
    samples.windows(2).filter_map(|pair| detect(&pair[0], &pair[1])).collect()
}
