//! Notification text composition

use crate::domain::types::{DeliveryStatus, NotificationEvent, TransitionType};
use chrono::{DateTime, FixedOffset, Offset, Timelike, Utc};
use std::fmt::Write;

pub const DEFAULT_ARRIVAL_PHRASE: &str = "У подъезда, ожидаю";
pub const DEFAULT_DEPARTURE_PHRASE: &str = "Выехал";

/// Time-of-day greeting for a local hour (0-23)
pub fn greeting(hour: u32) -> &'static str {
    match hour {
        5..=11 => "Доброе утро",
        12..=16 => "Добрый день",
        17..=22 => "Добрый вечер",
        _ => "Доброй ночи",
    }
}

/// Message templates plus the local offset used for greetings and timestamps
#[derive(Debug, Clone)]
pub struct MessageTemplates {
    arrival_phrase: String,
    departure_phrase: String,
    offset: FixedOffset,
}

impl Default for MessageTemplates {
    fn default() -> Self {
        Self::new(DEFAULT_ARRIVAL_PHRASE, DEFAULT_DEPARTURE_PHRASE, 180)
    }
}

impl MessageTemplates {
    /// Offsets outside +/-24h fall back to UTC
    pub fn new(arrival_phrase: &str, departure_phrase: &str, utc_offset_minutes: i32) -> Self {
        let offset =
            FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60)).unwrap_or_else(|| Utc.fix());
        Self {
            arrival_phrase: arrival_phrase.to_string(),
            departure_phrase: departure_phrase.to_string(),
            offset,
        }
    }

    pub fn phrase(&self, kind: TransitionType) -> &str {
        match kind {
            TransitionType::Arrival => &self.arrival_phrase,
            TransitionType::Departure => &self.departure_phrase,
        }
    }

    fn local(&self, at: DateTime<Utc>) -> DateTime<FixedOffset> {
        at.with_timezone(&self.offset)
    }

    /// "<greeting>! <phrase>"
    pub fn compose(&self, kind: TransitionType, at: DateTime<Utc>) -> String {
        let hour = self.local(at).hour();
        format!("{}! {}", greeting(hour), self.phrase(kind))
    }

    /// Summary for the subject's drivers: who got the message and who did not
    pub fn driver_confirmation(&self, event: &NotificationEvent, at: DateTime<Utc>) -> String {
        let mut text = String::with_capacity(256);
        let _ = writeln!(text, "✅ Уведомления отправлены {} получателям:", event.sent_count);
        let _ = writeln!(text, "📅 Время: {}", self.local(at).format("%H:%M:%S"));
        let _ = writeln!(text, "📢 Текст: '{}'", event.message_text);
        let _ = write!(text, "\n🎯 Успешно отправлено:");
        write_outcomes(&mut text, event);
        text
    }

    /// Summary for admins, including the notification type and subject
    pub fn admin_confirmation(&self, event: &NotificationEvent, at: DateTime<Utc>) -> String {
        let mut text = String::with_capacity(256);
        let _ = writeln!(text, "🔔 УВЕДОМЛЕНИЯ ОТПРАВЛЕНЫ");
        let _ = writeln!(text, "📅 Время: {}", self.local(at).format("%H:%M:%S"));
        let _ = writeln!(text, "👤 Водитель: {}", event.subject);
        let _ = writeln!(text, "📝 Тип: {} ({})", event.transition, event.trigger);
        let _ = writeln!(text, "📢 Текст: '{}'", event.message_text);
        let _ = write!(text, "\n🎯 Получатели ({}):", event.sent_count);
        write_outcomes(&mut text, event);
        text
    }
}

fn write_outcomes(text: &mut String, event: &NotificationEvent) {
    for outcome in event.recipients.iter().filter(|r| r.status == DeliveryStatus::Sent) {
        let _ = write!(text, "\n• {}", outcome.display_name);
    }

    if event.failed_count > 0 {
        let _ = write!(text, "\n\n❌ Ошибки отправки ({}):", event.failed_count);
        for outcome in event.recipients.iter().filter(|r| r.status == DeliveryStatus::Failed) {
            let error = outcome.error.as_deref().unwrap_or("unknown");
            let _ = write!(text, "\n• {} (ошибка: {})", outcome.display_name, error);
        }
    }
}
