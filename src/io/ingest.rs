//! Location payload parsing for the ingest endpoint
//!
//! Two body shapes are accepted:
//! - plain: `{"latitude": .., "longitude": .., "timestamp"?: epoch_secs}`
//! - OwnTracks: `{"_type": "location", "lat": .., "lon": .., "tst"?: epoch_secs}`
//!
//! Coordinates may be JSON numbers or numeric strings. OwnTracks messages of
//! any other `_type` carry no position and are acknowledged without storing.

use crate::domain::geo::InvalidCoordinate;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    Plain,
    OwnTracks,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationReport {
    pub format: ReportFormat,
    pub latitude: f64,
    pub longitude: f64,
    /// Device timestamp in epoch seconds, if it sent one
    pub reported_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestPayload {
    Location(LocationReport),
    /// OwnTracks message without a position (status, transition, ...)
    Ignored { kind: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PayloadError {
    #[error("body is not a JSON object")]
    NotAnObject,
    #[error("body is not valid JSON: {0}")]
    Json(String),
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error(transparent)]
    Coordinate(#[from] InvalidCoordinate),
}

fn coordinate(obj: &Map<String, Value>, names: &[&'static str]) -> Result<f64, PayloadError> {
    let Some((name, value)) = names.iter().find_map(|n| obj.get(*n).map(|v| (*n, v))) else {
        return Err(PayloadError::Missing(names[0]));
    };
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(InvalidCoordinate::NotANumber(format!("{name}={value}")).into()),
    }
}

fn timestamp(obj: &Map<String, Value>, name: &str) -> Option<i64> {
    match obj.get(name)? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a request body into a location report
pub fn parse_payload(body: &[u8]) -> Result<IngestPayload, PayloadError> {
    let value: Value = serde_json::from_slice(body).map_err(|e| PayloadError::Json(e.to_string()))?;
    let Value::Object(obj) = value else {
        return Err(PayloadError::NotAnObject);
    };

    if let Some(kind) = obj.get("_type") {
        let kind = kind.as_str().unwrap_or_default();
        if kind != "location" {
            return Ok(IngestPayload::Ignored { kind: kind.to_string() });
        }
        return Ok(IngestPayload::Location(LocationReport {
            format: ReportFormat::OwnTracks,
            latitude: coordinate(&obj, &["lat"])?,
            longitude: coordinate(&obj, &["lon"])?,
            reported_at: timestamp(&obj, "tst"),
        }));
    }

    Ok(IngestPayload::Location(LocationReport {
        format: ReportFormat::Plain,
        latitude: coordinate(&obj, &["latitude", "lat"])?,
        longitude: coordinate(&obj, &["longitude", "lon"])?,
        reported_at: timestamp(&obj, "timestamp"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(body: &str) -> LocationReport {
        match parse_payload(body.as_bytes()).unwrap() {
            IngestPayload::Location(report) => report,
            other => panic!("expected location, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_numbers() {
        let report = location(r#"{"latitude": 55.6768, "longitude": 37.5235}"#);
        assert_eq!(report.format, ReportFormat::Plain);
        assert_eq!(report.latitude, 55.6768);
        assert_eq!(report.longitude, 37.5235);
        assert_eq!(report.reported_at, None);
    }

    #[test]
    fn test_plain_numeric_strings() {
        let report = location(r#"{"latitude": " 55.5 ", "longitude": "37.25", "timestamp": 1700000000}"#);
        assert_eq!(report.latitude, 55.5);
        assert_eq!(report.longitude, 37.25);
        assert_eq!(report.reported_at, Some(1_700_000_000));
    }

    #[test]
    fn test_owntracks_location() {
        let report = location(r#"{"_type":"location","lat":55.1,"lon":37.2,"tst":1700000123,"acc":12}"#);
        assert_eq!(report.format, ReportFormat::OwnTracks);
        assert_eq!(report.reported_at, Some(1_700_000_123));
    }

    #[test]
    fn test_owntracks_non_location_ignored() {
        assert_eq!(
            parse_payload(br#"{"_type":"status","battery":80}"#).unwrap(),
            IngestPayload::Ignored { kind: "status".to_string() }
        );
    }

    #[test]
    fn test_malformed_bodies() {
        assert!(matches!(parse_payload(b"not json"), Err(PayloadError::Json(_))));
        assert_eq!(parse_payload(b"[1,2]"), Err(PayloadError::NotAnObject));
        assert_eq!(parse_payload(br#"{"longitude": 1}"#), Err(PayloadError::Missing("latitude")));
        assert!(matches!(
            parse_payload(br#"{"latitude": "north", "longitude": 1}"#),
            Err(PayloadError::Coordinate(InvalidCoordinate::NotANumber(_)))
        ));
        assert!(matches!(
            parse_payload(br#"{"latitude": null, "longitude": 1}"#),
            Err(PayloadError::Coordinate(_))
        ));
    }
}
