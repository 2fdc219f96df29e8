//! SQLite persistence for samples, zones, cooldowns and the delivery log
//!
//! One connection behind a mutex. Every operation that touches more than one
//! row runs in a transaction. Timestamps are stored as epoch milliseconds.

use crate::domain::types::{
    ChatId, Contact, DeliveryStatus, LocationSample, NotificationEvent, RecipientOutcome, Role,
    SampleId, SubjectId, TransitionType, Trigger, WorkZone,
};
use crate::infra::error::NotifierResult;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS location_samples (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    subject_id  INTEGER NOT NULL,
    latitude    REAL NOT NULL,
    longitude   REAL NOT NULL,
    distance_m  REAL NOT NULL,
    in_zone     INTEGER NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_location_samples_subject
    ON location_samples(subject_id, id);

CREATE TABLE IF NOT EXISTS subject_zones (
    subject_id  INTEGER PRIMARY KEY,
    latitude    REAL NOT NULL,
    longitude   REAL NOT NULL,
    radius_m    REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS tracking (
    subject_id  INTEGER PRIMARY KEY,
    enabled     INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cooldowns (
    subject_id     INTEGER NOT NULL,
    transition     TEXT NOT NULL,
    last_fired_at  INTEGER NOT NULL,
    PRIMARY KEY (subject_id, transition)
);

CREATE TABLE IF NOT EXISTS evaluation_marks (
    subject_id      INTEGER PRIMARY KEY,
    last_sample_id  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS contacts (
    chat_id       INTEGER PRIMARY KEY,
    display_name  TEXT NOT NULL,
    role          TEXT NOT NULL,
    subject_id    INTEGER
);

CREATE TABLE IF NOT EXISTS notification_events (
    id                 TEXT PRIMARY KEY,
    subject_id         INTEGER NOT NULL,
    transition         TEXT NOT NULL,
    trigger_kind       TEXT NOT NULL,
    message_text       TEXT NOT NULL,
    created_at         INTEGER NOT NULL,
    completed_at       INTEGER,
    sent_count         INTEGER NOT NULL DEFAULT 0,
    failed_count       INTEGER NOT NULL DEFAULT 0,
    confirmation_sent  INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_notification_events_subject
    ON notification_events(subject_id, created_at);

CREATE TABLE IF NOT EXISTS notification_recipients (
    event_id      TEXT NOT NULL REFERENCES notification_events(id),
    chat_id       INTEGER NOT NULL,
    display_name  TEXT NOT NULL,
    status        TEXT NOT NULL,
    error         TEXT,
    PRIMARY KEY (event_id, chat_id)
);
";

const SAMPLE_SELECT_SQL: &str = "SELECT
    id,
    subject_id,
    latitude,
    longitude,
    distance_m,
    in_zone,
    created_at
FROM location_samples";

const EVENT_SELECT_SQL: &str = "SELECT
    id,
    subject_id,
    transition,
    trigger_kind,
    message_text,
    created_at,
    completed_at,
    sent_count,
    failed_count,
    confirmation_sent
FROM notification_events";

/// Sample as computed at ingest, before the store assigns an id
#[derive(Debug, Clone, PartialEq)]
pub struct NewSample {
    pub subject: SubjectId,
    pub latitude: f64,
    pub longitude: f64,
    pub distance_m: f64,
    pub in_zone: bool,
    pub created_at: DateTime<Utc>,
}

/// Aggregated delivery numbers for one transition type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionStats {
    pub transition: TransitionType,
    pub events: u64,
    pub sent: u64,
    pub failed: u64,
}

pub struct Store {
    conn: Mutex<Connection>,
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn parsed<T: FromStr<Err = String>>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<LocationSample> {
    Ok(LocationSample {
        id: SampleId(row.get(0)?),
        subject: SubjectId(row.get(1)?),
        latitude: row.get(2)?,
        longitude: row.get(3)?,
        distance_m: row.get(4)?,
        in_zone: row.get(5)?,
        created_at: timestamp(row, 6)?,
    })
}

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        chat_id: ChatId(row.get(0)?),
        display_name: row.get(1)?,
        role: parsed::<Role>(row, 2)?,
        subject: row.get::<_, Option<i64>>(3)?.map(SubjectId),
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<NotificationEvent> {
    let completed_at = match row.get::<_, Option<i64>>(6)? {
        Some(_) => Some(timestamp(row, 6)?),
        None => None,
    };
    Ok(NotificationEvent {
        id: row.get(0)?,
        subject: SubjectId(row.get(1)?),
        transition: parsed::<TransitionType>(row, 2)?,
        trigger: parsed::<Trigger>(row, 3)?,
        message_text: row.get(4)?,
        created_at: timestamp(row, 5)?,
        completed_at,
        recipients: Vec::new(),
        sent_count: row.get(7)?,
        failed_count: row.get(8)?,
        confirmation_sent: row.get(9)?,
    })
}

fn load_recipients(conn: &Connection, event_id: &str) -> rusqlite::Result<Vec<RecipientOutcome>> {
    let mut stmt = conn.prepare_cached(
        "SELECT chat_id, display_name, status, error
         FROM notification_recipients
         WHERE event_id = ?1
         ORDER BY rowid",
    )?;
    let rows = stmt.query_map(params![event_id], |row| {
        Ok(RecipientOutcome {
            recipient: ChatId(row.get(0)?),
            display_name: row.get(1)?,
            status: parsed::<DeliveryStatus>(row, 2)?,
            error: row.get(3)?,
        })
    })?;
    rows.collect()
}

fn load_event(conn: &Connection, id: &str) -> rusqlite::Result<Option<NotificationEvent>> {
    let event = conn
        .query_row(&format!("{EVENT_SELECT_SQL} WHERE id = ?1"), params![id], event_from_row)
        .optional()?;
    match event {
        Some(mut event) => {
            event.recipients = load_recipients(conn, &event.id)?;
            Ok(Some(event))
        }
        None => Ok(None),
    }
}

impl Store {
    /// Open (or create) the database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> NotifierResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        let store = Self::bootstrap(conn)?;
        info!(path = %path.display(), journal_mode = %mode, "store_opened");
        Ok(store)
    }

    pub fn open_in_memory() -> NotifierResult<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> NotifierResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // ----- zones & tracking -------------------------------------------------

    pub fn set_zone(&self, subject: SubjectId, zone: &WorkZone) -> NotifierResult<()> {
        self.conn.lock().execute(
            "INSERT INTO subject_zones (subject_id, latitude, longitude, radius_m)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(subject_id) DO UPDATE SET
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                radius_m = excluded.radius_m",
            params![subject.0, zone.center_lat, zone.center_lon, zone.radius_m],
        )?;
        Ok(())
    }

    /// Per-subject zone override, if one is configured
    pub fn zone_for(&self, subject: SubjectId) -> NotifierResult<Option<WorkZone>> {
        let zone = self
            .conn
            .lock()
            .query_row(
                "SELECT latitude, longitude, radius_m FROM subject_zones WHERE subject_id = ?1",
                params![subject.0],
                |row| Ok(WorkZone::new(row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        Ok(zone)
    }

    pub fn set_tracking(
        &self,
        subject: SubjectId,
        enabled: bool,
        at: DateTime<Utc>,
    ) -> NotifierResult<()> {
        self.conn.lock().execute(
            "INSERT INTO tracking (subject_id, enabled, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(subject_id) DO UPDATE SET
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
            params![subject.0, enabled, at.timestamp_millis()],
        )?;
        Ok(())
    }

    /// Subjects without a tracking row are not tracked
    pub fn tracking_enabled(&self, subject: SubjectId) -> NotifierResult<bool> {
        let enabled = self
            .conn
            .lock()
            .query_row(
                "SELECT enabled FROM tracking WHERE subject_id = ?1",
                params![subject.0],
                |row| row.get::<_, bool>(0),
            )
            .optional()?;
        Ok(enabled.unwrap_or(false))
    }

    pub fn tracked_subjects(&self) -> NotifierResult<Vec<SubjectId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT subject_id FROM tracking WHERE enabled = 1 ORDER BY subject_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0).map(SubjectId))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ----- location log -----------------------------------------------------

    /// Append a sample. Ids are assigned monotonically by the store.
    pub fn insert_sample(&self, sample: &NewSample) -> NotifierResult<LocationSample> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO location_samples
                (subject_id, latitude, longitude, distance_m, in_zone, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                sample.subject.0,
                sample.latitude,
                sample.longitude,
                sample.distance_m,
                sample.in_zone,
                sample.created_at.timestamp_millis(),
            ],
        )?;
        Ok(LocationSample {
            id: SampleId(conn.last_insert_rowid()),
            subject: sample.subject,
            latitude: sample.latitude,
            longitude: sample.longitude,
            distance_m: sample.distance_m,
            in_zone: sample.in_zone,
            created_at: sample.created_at,
        })
    }

    pub fn latest_sample(&self, subject: SubjectId) -> NotifierResult<Option<LocationSample>> {
        let sample = self
            .conn
            .lock()
            .query_row(
                &format!("{SAMPLE_SELECT_SQL} WHERE subject_id = ?1 ORDER BY id DESC LIMIT 1"),
                params![subject.0],
                sample_from_row,
            )
            .optional()?;
        Ok(sample)
    }

    /// Latest `limit` samples with `id >= from`, oldest first
    pub fn samples_since(
        &self,
        subject: SubjectId,
        from: SampleId,
        limit: usize,
    ) -> NotifierResult<Vec<LocationSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{SAMPLE_SELECT_SQL} WHERE subject_id = ?1 AND id >= ?2 ORDER BY id DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![subject.0, from.0, limit as i64], sample_from_row)?;
        let mut samples = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        samples.reverse();
        Ok(samples)
    }

    /// The two most recent samples, oldest first. Fewer than two means
    /// there is not enough history to detect anything.
    pub fn last_two(&self, subject: SubjectId) -> NotifierResult<Vec<LocationSample>> {
        self.samples_since(subject, SampleId(i64::MIN), 2)
    }

    // ----- evaluation marks -------------------------------------------------

    pub fn last_evaluated(&self, subject: SubjectId) -> NotifierResult<Option<SampleId>> {
        let mark = self
            .conn
            .lock()
            .query_row(
                "SELECT last_sample_id FROM evaluation_marks WHERE subject_id = ?1",
                params![subject.0],
                |row| row.get::<_, i64>(0).map(SampleId),
            )
            .optional()?;
        Ok(mark)
    }

    /// Compare-and-set the evaluation mark from `expected` to `upto`.
    ///
    /// Returns true if this caller moved the mark and therefore owns the
    /// evaluation of every sample pair up to `upto`. The mark never moves
    /// backwards.
    pub fn claim_evaluation(
        &self,
        subject: SubjectId,
        expected: Option<SampleId>,
        upto: SampleId,
    ) -> NotifierResult<bool> {
        let conn = self.conn.lock();
        let changed = match expected {
            None => conn.execute(
                "INSERT INTO evaluation_marks (subject_id, last_sample_id)
                 VALUES (?1, ?2)
                 ON CONFLICT(subject_id) DO NOTHING",
                params![subject.0, upto.0],
            )?,
            Some(expected) => conn.execute(
                "UPDATE evaluation_marks
                 SET last_sample_id = ?3
                 WHERE subject_id = ?1 AND last_sample_id = ?2 AND last_sample_id < ?3",
                params![subject.0, expected.0, upto.0],
            )?,
        };
        Ok(changed == 1)
    }

    /// Undo a claim whose evaluation failed, so the same pairs are evaluated again.
    ///
    /// Only moves the mark back if it still points at `claimed`.
    pub fn release_evaluation(
        &self,
        subject: SubjectId,
        claimed: SampleId,
        previous: Option<SampleId>,
    ) -> NotifierResult<bool> {
        let conn = self.conn.lock();
        let changed = match previous {
            None => conn.execute(
                "DELETE FROM evaluation_marks WHERE subject_id = ?1 AND last_sample_id = ?2",
                params![subject.0, claimed.0],
            )?,
            Some(previous) => conn.execute(
                "UPDATE evaluation_marks SET last_sample_id = ?3
                 WHERE subject_id = ?1 AND last_sample_id = ?2",
                params![subject.0, claimed.0, previous.0],
            )?,
        };
        Ok(changed == 1)
    }

    // ----- cooldowns --------------------------------------------------------

    /// Atomically check the cooldown and record `now` as the firing time.
    ///
    /// Returns true only for the caller that won the slot. Firing exactly
    /// `cooldown` after the previous one is allowed.
    pub fn try_acquire_cooldown(
        &self,
        subject: SubjectId,
        kind: TransitionType,
        now: DateTime<Utc>,
        cooldown: Duration,
    ) -> NotifierResult<bool> {
        let cooldown_ms = i64::try_from(cooldown.as_millis()).unwrap_or(i64::MAX);
        let changed = self.conn.lock().execute(
            "INSERT INTO cooldowns (subject_id, transition, last_fired_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(subject_id, transition) DO UPDATE SET
                last_fired_at = excluded.last_fired_at
             WHERE excluded.last_fired_at - cooldowns.last_fired_at >= ?4",
            params![subject.0, kind.as_str(), now.timestamp_millis(), cooldown_ms],
        )?;
        Ok(changed == 1)
    }

    /// Give back a cooldown slot taken at `fired_at` by a dispatch that never happened.
    ///
    /// Restores `previous` only if nobody fired since.
    pub fn release_cooldown(
        &self,
        subject: SubjectId,
        kind: TransitionType,
        fired_at: DateTime<Utc>,
        previous: Option<DateTime<Utc>>,
    ) -> NotifierResult<bool> {
        let conn = self.conn.lock();
        let changed = match previous {
            None => conn.execute(
                "DELETE FROM cooldowns
                 WHERE subject_id = ?1 AND transition = ?2 AND last_fired_at = ?3",
                params![subject.0, kind.as_str(), fired_at.timestamp_millis()],
            )?,
            Some(previous) => conn.execute(
                "UPDATE cooldowns SET last_fired_at = ?4
                 WHERE subject_id = ?1 AND transition = ?2 AND last_fired_at = ?3",
                params![
                    subject.0,
                    kind.as_str(),
                    fired_at.timestamp_millis(),
                    previous.timestamp_millis()
                ],
            )?,
        };
        Ok(changed == 1)
    }

    /// Unconditionally record a firing time
    pub fn record_fired(
        &self,
        subject: SubjectId,
        kind: TransitionType,
        at: DateTime<Utc>,
    ) -> NotifierResult<()> {
        self.conn.lock().execute(
            "INSERT INTO cooldowns (subject_id, transition, last_fired_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(subject_id, transition) DO UPDATE SET
                last_fired_at = excluded.last_fired_at",
            params![subject.0, kind.as_str(), at.timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn last_fired(
        &self,
        subject: SubjectId,
        kind: TransitionType,
    ) -> NotifierResult<Option<DateTime<Utc>>> {
        let at = self
            .conn
            .lock()
            .query_row(
                "SELECT last_fired_at FROM cooldowns WHERE subject_id = ?1 AND transition = ?2",
                params![subject.0, kind.as_str()],
                |row| timestamp(row, 0),
            )
            .optional()?;
        Ok(at)
    }

    // ----- contacts ---------------------------------------------------------

    pub fn upsert_contact(&self, contact: &Contact) -> NotifierResult<()> {
        self.conn.lock().execute(
            "INSERT INTO contacts (chat_id, display_name, role, subject_id)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(chat_id) DO UPDATE SET
                display_name = excluded.display_name,
                role = excluded.role,
                subject_id = excluded.subject_id",
            params![
                contact.chat_id.0,
                contact.display_name,
                contact.role.as_str(),
                contact.subject.map(|s| s.0),
            ],
        )?;
        Ok(())
    }

    pub fn contact(&self, chat_id: ChatId) -> NotifierResult<Option<Contact>> {
        let contact = self
            .conn
            .lock()
            .query_row(
                "SELECT chat_id, display_name, role, subject_id FROM contacts WHERE chat_id = ?1",
                params![chat_id.0],
                contact_from_row,
            )
            .optional()?;
        Ok(contact)
    }

    /// Recipient contacts following `subject`
    pub fn recipients_for(&self, subject: SubjectId) -> NotifierResult<Vec<Contact>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT chat_id, display_name, role, subject_id FROM contacts
             WHERE role = 'recipient' AND subject_id = ?1
             ORDER BY chat_id",
        )?;
        let rows = stmt.query_map(params![subject.0], contact_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Drivers of `subject` plus every admin
    pub fn confirmation_targets(&self, subject: SubjectId) -> NotifierResult<Vec<Contact>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT chat_id, display_name, role, subject_id FROM contacts
             WHERE (role = 'driver' AND subject_id = ?1) OR role = 'admin'
             ORDER BY role DESC, chat_id",
        )?;
        let rows = stmt.query_map(params![subject.0], contact_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ----- delivery log -----------------------------------------------------

    /// Insert the event with its pending outcomes in one transaction
    pub fn create_event(&self, event: &NotificationEvent) -> NotifierResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO notification_events
                (id, subject_id, transition, trigger_kind, message_text, created_at,
                 completed_at, sent_count, failed_count, confirmation_sent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.id,
                event.subject.0,
                event.transition.as_str(),
                event.trigger.as_str(),
                event.message_text,
                event.created_at.timestamp_millis(),
                event.completed_at.map(|at| at.timestamp_millis()),
                event.sent_count,
                event.failed_count,
                event.confirmation_sent,
            ],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO notification_recipients
                    (event_id, chat_id, display_name, status, error)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for outcome in &event.recipients {
                stmt.execute(params![
                    event.id,
                    outcome.recipient.0,
                    outcome.display_name,
                    outcome.status.as_str(),
                    outcome.error,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Resolve one pending outcome. A second write for the same recipient is ignored.
    pub fn record_outcome(&self, event_id: &str, outcome: &RecipientOutcome) -> NotifierResult<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE notification_recipients
             SET status = ?3, error = ?4
             WHERE event_id = ?1 AND chat_id = ?2 AND status = 'pending'",
            params![event_id, outcome.recipient.0, outcome.status.as_str(), outcome.error],
        )?;
        Ok(changed == 1)
    }

    pub fn complete_event(
        &self,
        event_id: &str,
        sent_count: u32,
        failed_count: u32,
        completed_at: DateTime<Utc>,
    ) -> NotifierResult<()> {
        self.conn.lock().execute(
            "UPDATE notification_events
             SET sent_count = ?2, failed_count = ?3, completed_at = ?4
             WHERE id = ?1",
            params![event_id, sent_count, failed_count, completed_at.timestamp_millis()],
        )?;
        Ok(())
    }

    pub fn mark_confirmation_sent(&self, event_id: &str) -> NotifierResult<()> {
        self.conn.lock().execute(
            "UPDATE notification_events SET confirmation_sent = 1 WHERE id = ?1",
            params![event_id],
        )?;
        Ok(())
    }

    pub fn event(&self, id: &str) -> NotifierResult<Option<NotificationEvent>> {
        Ok(load_event(&self.conn.lock(), id)?)
    }

    /// Latest `limit` events for a subject, newest first
    pub fn history(&self, subject: SubjectId, limit: usize) -> NotifierResult<Vec<NotificationEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "{EVENT_SELECT_SQL} WHERE subject_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
        ))?;
        let mut events = stmt
            .query_map(params![subject.0, limit as i64], event_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for event in &mut events {
            event.recipients = load_recipients(&conn, &event.id)?;
        }
        Ok(events)
    }

    /// Events, sent and failed totals per transition type since `since`
    pub fn statistics(
        &self,
        subject: SubjectId,
        since: DateTime<Utc>,
    ) -> NotifierResult<Vec<TransitionStats>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT transition, COUNT(*), COALESCE(SUM(sent_count), 0), COALESCE(SUM(failed_count), 0)
             FROM notification_events
             WHERE subject_id = ?1 AND created_at >= ?2
             GROUP BY transition
             ORDER BY transition",
        )?;
        let rows = stmt.query_map(params![subject.0, since.timestamp_millis()], |row| {
            Ok(TransitionStats {
                transition: parsed::<TransitionType>(row, 0)?,
                events: row.get::<_, i64>(1)? as u64,
                sent: row.get::<_, i64>(2)? as u64,
                failed: row.get::<_, i64>(3)? as u64,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
