//! Domain models - core types, geofence math and message texts
//!
//! This module contains the canonical data types used throughout the system:
//! - `LocationSample` - one stored GPS report for a subject
//! - `WorkZone` - circular geofence with inclusive boundary
//! - `Transition` - arrival/departure between two consecutive samples
//! - `NotificationEvent` / `RecipientOutcome` - dispatch record and per-recipient result
//! - `Contact` / `Role` - who can receive notifications and confirmations

pub mod geo;
pub mod message;
pub mod types;

// Re-export commonly used types at module level
pub use geo::{distance_m, validate_coordinate, InvalidCoordinate};
pub use message::MessageTemplates;
pub use types::{
    ChatId, Contact, DeliveryStatus, LocationSample, NotificationEvent, RecipientOutcome, Role,
    SampleId, SubjectId, Transition, TransitionType, Trigger, WorkZone,
};
