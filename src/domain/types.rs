//! Shared types for the arrival notifier

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Newtype wrapper for tracked subject IDs (the driver's chat id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SubjectId(pub i64);

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for location sample IDs (monotonic, assigned by the store)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SampleId(pub i64);

impl std::fmt::Display for SampleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for Telegram chat IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ChatId(pub i64);

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Zone membership change between two consecutive samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionType {
    Arrival,
    Departure,
}

impl TransitionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionType::Arrival => "arrival",
            TransitionType::Departure => "departure",
        }
    }
}

impl std::fmt::Display for TransitionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransitionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "arrival" => Ok(TransitionType::Arrival),
            "departure" => Ok(TransitionType::Departure),
            other => Err(format!("unknown transition type: {other}")),
        }
    }
}

/// Which entry point produced a dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Evaluation run right after a sample was ingested
    Inline,
    /// Periodic re-scan of the location log
    Background,
    /// Fired by a driver or admin by hand
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Inline => "inline",
            Trigger::Background => "background",
            Trigger::Manual => "manual",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(Trigger::Inline),
            "background" => Ok(Trigger::Background),
            "manual" => Ok(Trigger::Manual),
            other => Err(format!("unknown trigger: {other}")),
        }
    }
}

/// Circular geofence defining "at work"
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkZone {
    pub center_lat: f64,
    pub center_lon: f64,
    pub radius_m: f64,
}

/// One stored GPS report for a subject. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationSample {
    pub id: SampleId,
    pub subject: SubjectId,
    pub latitude: f64,
    pub longitude: f64,
    pub distance_m: f64,
    pub in_zone: bool,
    pub created_at: DateTime<Utc>,
}

impl LocationSample {
    /// True if the sample is older than `threshold` at `now`
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.created_at > threshold
    }
}

/// A detected change in zone membership
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub kind: TransitionType,
    pub subject: SubjectId,
    pub from: SampleId,
    pub to: SampleId,
    /// Timestamp of the sample that completed the transition
    pub at: DateTime<Utc>,
}

/// Delivery state of one recipient within a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipientOutcome {
    pub recipient: ChatId,
    pub display_name: String,
    pub status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecipientOutcome {
    pub fn pending(contact: &Contact) -> Self {
        Self {
            recipient: contact.chat_id,
            display_name: contact.display_name.clone(),
            status: DeliveryStatus::Pending,
            error: None,
        }
    }

    /// Resolve a pending outcome. Outcomes that already left `Pending` are left untouched.
    pub fn resolve(&mut self, result: Result<(), String>) {
        if self.status != DeliveryStatus::Pending {
            return;
        }
        match result {
            Ok(()) => self.status = DeliveryStatus::Sent,
            Err(e) => {
                self.status = DeliveryStatus::Failed;
                self.error = Some(e);
            }
        }
    }
}

/// Record of one gated dispatch and its per-recipient outcomes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationEvent {
    pub id: String,
    pub transition: TransitionType,
    pub trigger: Trigger,
    pub subject: SubjectId,
    pub message_text: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub recipients: Vec<RecipientOutcome>,
    pub sent_count: u32,
    pub failed_count: u32,
    pub confirmation_sent: bool,
}

impl NotificationEvent {
    /// A dispatch succeeds if at least one recipient got the message,
    /// or if there was nobody to send to.
    pub fn success(&self) -> bool {
        self.sent_count > 0 || self.recipients.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Recount sent/failed from the outcome list
    pub fn tally(&mut self) {
        self.sent_count =
            self.recipients.iter().filter(|r| r.status == DeliveryStatus::Sent).count() as u32;
        self.failed_count =
            self.recipients.iter().filter(|r| r.status == DeliveryStatus::Failed).count() as u32;
    }
}

/// Contact role. Drivers and admins are privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Recipient,
    Driver,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Recipient => "recipient",
            Role::Driver => "driver",
            Role::Admin => "admin",
        }
    }

    /// Privileged roles may fire notifications by hand and receive confirmations
    pub fn is_privileged(&self) -> bool {
        matches!(self, Role::Driver | Role::Admin)
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recipient" => Ok(Role::Recipient),
            "driver" => Ok(Role::Driver),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Someone reachable through the send capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub chat_id: ChatId,
    pub display_name: String,
    pub role: Role,
    /// Subject this contact follows (drivers: the subject they drive as)
    #[serde(default)]
    pub subject: Option<SubjectId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(id: i64) -> Contact {
        Contact {
            chat_id: ChatId(id),
            display_name: format!("User {id}"),
            role: Role::Recipient,
            subject: Some(SubjectId(1)),
        }
    }

    #[test]
    fn test_transition_type_from_str() {
        assert_eq!("arrival".parse::<TransitionType>().unwrap(), TransitionType::Arrival);
        assert_eq!("departure".parse::<TransitionType>().unwrap(), TransitionType::Departure);
        assert!("manual".parse::<TransitionType>().is_err());
    }

    #[test]
    fn test_outcome_resolves_once() {
        let mut outcome = RecipientOutcome::pending(&contact(7));
        outcome.resolve(Err("chat not found".to_string()));
        outcome.resolve(Ok(()));

        assert_eq!(outcome.status, DeliveryStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("chat not found"));
    }

    #[test]
    fn test_tally_and_success() {
        let mut event = NotificationEvent {
            id: "e1".to_string(),
            transition: TransitionType::Arrival,
            trigger: Trigger::Inline,
            subject: SubjectId(1),
            message_text: "hi".to_string(),
            created_at: Utc::now(),
            completed_at: None,
            recipients: vec![
                RecipientOutcome::pending(&contact(1)),
                RecipientOutcome::pending(&contact(2)),
            ],
            sent_count: 0,
            failed_count: 0,
            confirmation_sent: false,
        };
        event.recipients[0].resolve(Ok(()));
        event.recipients[1].resolve(Err("blocked".to_string()));
        event.tally();

        assert_eq!(event.sent_count, 1);
        assert_eq!(event.failed_count, 1);
        assert!(event.success());

        event.recipients.clear();
        event.tally();
        assert!(event.success());
    }

    #[test]
    fn test_stale_sample() {
        let now = Utc::now();
        let sample = LocationSample {
            id: SampleId(1),
            subject: SubjectId(1),
            latitude: 0.0,
            longitude: 0.0,
            distance_m: 0.0,
            in_zone: true,
            created_at: now - Duration::minutes(11),
        };
        assert!(sample.is_stale(now, Duration::minutes(10)));
        assert!(!sample.is_stale(now, Duration::minutes(15)));
    }

    #[test]
    fn test_role_privilege() {
        assert!(Role::Admin.is_privileged());
        assert!(Role::Driver.is_privileged());
        assert!(!Role::Recipient.is_privileged());
    }
}
