//! HTTP API: location ingest, queries, manual trigger, health and metrics
//!
//! Routes:
//! - POST /api/location                          ingest (plain or OwnTracks body)
//! - GET  /api/subjects/{id}/location            latest sample
//! - GET  /api/subjects/{id}/notifications       delivery history (?limit=)
//! - GET  /api/subjects/{id}/statistics          per-type totals (?hours=)
//! - POST /api/subjects/{id}/notify              manual arrival notification
//! - GET|PUT /api/subjects/{id}/tracking         tracking flag
//! - GET  /metrics                               Prometheus text
//! - GET  /health
//!
//! Ingest answers as soon as the sample is stored. The inline evaluation
//! runs in its own task so a slow send never holds up the device.

use crate::domain::types::{
    ChatId, LocationSample, NotificationEvent, SubjectId, Trigger, WorkZone,
};
use crate::infra::config::Config;
use crate::infra::error::NotifierError;
use crate::infra::store::TransitionStats;
use crate::io::ingest::{parse_payload, IngestPayload, ReportFormat};
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::pipeline::{EvaluationOutcome, Pipeline};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

const MAX_BODY_BYTES: usize = 64 * 1024;
const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 100;
const DEFAULT_STATS_HOURS: i64 = 24;
const MAX_STATS_HOURS: i64 = 24 * 365;

pub struct HttpState {
    pipeline: Arc<Pipeline>,
    site_id: String,
    default_subject: Option<SubjectId>,
    /// Evaluations spawned by location reports, drained on shutdown
    inline: parking_lot::Mutex<JoinSet<()>>,
}

impl HttpState {
    pub fn new(pipeline: Arc<Pipeline>, config: &Config) -> Self {
        Self {
            pipeline,
            site_id: config.site_id().to_string(),
            default_subject: config.default_subject(),
            inline: parking_lot::Mutex::new(JoinSet::new()),
        }
    }

    fn spawn_inline(&self, subject: SubjectId) {
        let pipeline = Arc::clone(&self.pipeline);
        let mut inline = self.inline.lock();
        while inline.try_join_next().is_some() {}
        inline.spawn(async move {
            match pipeline.evaluate(subject, Trigger::Inline).await {
                Ok(outcome) => debug!(subject = %subject, outcome = %outcome.as_str(), "inline_evaluation"),
                Err(e) => warn!(subject = %subject, error = %e, "inline_evaluation_failed"),
            }
        });
    }

    /// Wait up to `timeout` for in-flight inline evaluations.
    ///
    /// Returns how many were still running and got aborted.
    pub async fn drain_inline(&self, timeout: Duration) -> usize {
        let mut pending = std::mem::take(&mut *self.inline.lock());
        if pending.is_empty() {
            return 0;
        }
        info!(pending = %pending.len(), "inline_evaluations_draining");

        let drained = tokio::time::timeout(timeout, async {
            while pending.join_next().await.is_some() {}
        })
        .await;
        if drained.is_ok() {
            return 0;
        }

        let abandoned = pending.len();
        warn!(abandoned = %abandoned, timeout_ms = %timeout.as_millis(), "inline_evaluations_abandoned");
        pending.shutdown().await;
        abandoned
    }
}

#[derive(Serialize)]
struct IngestResponse {
    success: bool,
    in_zone: bool,
    distance: f64,
    latitude: f64,
    longitude: f64,
    sample_id: i64,
    stale: bool,
}

#[derive(Serialize)]
struct OwnTracksEcho {
    #[serde(rename = "_type")]
    kind: &'static str,
    lat: f64,
    lon: f64,
    tst: i64,
}

#[derive(Serialize)]
struct LocationResponse {
    sample: LocationSample,
    stale: bool,
    zone: WorkZone,
}

#[derive(Serialize)]
struct StatisticsResponse {
    subject: SubjectId,
    hours: i64,
    by_type: Vec<TransitionStats>,
    total_events: u64,
    total_sent: u64,
    total_failed: u64,
}

#[derive(Deserialize)]
struct NotifyRequest {
    actor: i64,
}

#[derive(Serialize)]
struct NotifyResponse {
    success: bool,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<NotificationEvent>,
}

#[derive(Serialize, Deserialize)]
struct TrackingBody {
    enabled: bool,
}

#[derive(Serialize)]
struct TrackingResponse {
    subject: SubjectId,
    enabled: bool,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    success: bool,
    error: &'a str,
}

fn text_response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => text_response(status, "application/json", Bytes::from(body)),
        Err(e) => {
            error!(error = %e, "response_serialize_failed");
            text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain; charset=utf-8",
                Bytes::from_static(b"internal error"),
            )
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &ErrorBody { success: false, error: message })
}

fn not_found() -> Response<Full<Bytes>> {
    error_response(StatusCode::NOT_FOUND, "not found")
}

fn error_status(e: &NotifierError) -> StatusCode {
    match e {
        NotifierError::InvalidCoordinate(_) => StatusCode::BAD_REQUEST,
        NotifierError::Forbidden { .. } | NotifierError::UnknownContact(_) => StatusCode::FORBIDDEN,
        NotifierError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(e: &NotifierError) -> Response<Full<Bytes>> {
    error_response(error_status(e), &e.to_string())
}

/// Value of `name` in a raw query string
pub fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (key == name).then_some(value)
    })
}

/// Subject from `?subject=`, then the `X-Subject-Id` header, then the default
pub fn resolve_subject(
    query: Option<&str>,
    headers: &HeaderMap,
    default: Option<SubjectId>,
) -> Option<SubjectId> {
    query_param(query, "subject")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .or_else(|| {
            headers
                .get("x-subject-id")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<i64>().ok())
        })
        .map(SubjectId)
        .or(default)
}

/// Dispatch one request. Split from the hyper plumbing so it can be driven directly.
pub async fn route(
    state: &HttpState,
    method: &Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        (&Method::GET, ["health"]) => {
            text_response(StatusCode::OK, "text/plain; charset=utf-8", Bytes::from_static(b"ok"))
        }
        (&Method::GET, ["metrics"]) => {
            let tracked = state.pipeline.store().tracked_subjects().map(|s| s.len()).unwrap_or(0);
            let body = format_prometheus_metrics(state.pipeline.metrics(), tracked, &state.site_id);
            text_response(StatusCode::OK, "text/plain; version=0.0.4; charset=utf-8", Bytes::from(body))
        }
        (&Method::POST, ["api", "location"]) => handle_location(state, query, headers, &body),
        (_, ["api", "subjects", id, action]) => {
            let Ok(subject) = id.parse::<i64>().map(SubjectId) else {
                return error_response(StatusCode::BAD_REQUEST, "invalid subject id");
            };
            match (method, *action) {
                (&Method::GET, "location") => handle_latest(state, subject),
                (&Method::GET, "notifications") => handle_history(state, subject, query),
                (&Method::GET, "statistics") => handle_statistics(state, subject, query),
                (&Method::POST, "notify") => handle_notify(state, subject, &body).await,
                (&Method::GET, "tracking") => handle_tracking_get(state, subject),
                (&Method::PUT, "tracking") => handle_tracking_put(state, subject, &body),
                _ => not_found(),
            }
        }
        _ => not_found(),
    }
}

fn handle_location(
    state: &HttpState,
    query: Option<&str>,
    headers: &HeaderMap,
    body: &[u8],
) -> Response<Full<Bytes>> {
    let Some(subject) = resolve_subject(query, headers, state.default_subject) else {
        return error_response(StatusCode::BAD_REQUEST, "subject is required");
    };

    let report = match parse_payload(body) {
        Ok(IngestPayload::Location(report)) => report,
        Ok(IngestPayload::Ignored { kind }) => {
            debug!(subject = %subject, kind = %kind, "owntracks_message_ignored");
            return json_response(StatusCode::OK, &serde_json::json!({ "_type": "status" }));
        }
        Err(e) => {
            state.pipeline.metrics().record_invalid_sample();
            debug!(subject = %subject, error = %e, "payload_rejected");
            return error_response(StatusCode::BAD_REQUEST, &e.to_string());
        }
    };

    let sample = match state.pipeline.append(subject, report.latitude, report.longitude) {
        Ok(sample) => sample,
        Err(e) => return failure(&e),
    };

    state.spawn_inline(subject);

    let reported_at = report.reported_at.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));
    match report.format {
        ReportFormat::OwnTracks => json_response(
            StatusCode::OK,
            &OwnTracksEcho {
                kind: "location",
                lat: sample.latitude,
                lon: sample.longitude,
                tst: reported_at.unwrap_or(sample.created_at).timestamp(),
            },
        ),
        ReportFormat::Plain => json_response(
            StatusCode::OK,
            &IngestResponse {
                success: true,
                in_zone: sample.in_zone,
                distance: (sample.distance_m * 100.0).round() / 100.0,
                latitude: sample.latitude,
                longitude: sample.longitude,
                sample_id: sample.id.0,
                stale: reported_at
                    .map(|at| state.pipeline.is_stale_time(at, sample.created_at))
                    .unwrap_or(false),
            },
        ),
    }
}

fn handle_latest(state: &HttpState, subject: SubjectId) -> Response<Full<Bytes>> {
    let sample = match state.pipeline.store().latest_sample(subject) {
        Ok(Some(sample)) => sample,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "no location for subject"),
        Err(e) => return failure(&e),
    };
    let zone = match state.pipeline.zone_for(subject) {
        Ok(zone) => zone,
        Err(e) => return failure(&e),
    };
    let stale = state.pipeline.is_stale(&sample, Utc::now());
    json_response(StatusCode::OK, &LocationResponse { sample, stale, zone })
}

fn handle_history(state: &HttpState, subject: SubjectId, query: Option<&str>) -> Response<Full<Bytes>> {
    let limit = query_param(query, "limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    match state.pipeline.store().history(subject, limit) {
        Ok(events) => json_response(StatusCode::OK, &events),
        Err(e) => failure(&e),
    }
}

fn handle_statistics(
    state: &HttpState,
    subject: SubjectId,
    query: Option<&str>,
) -> Response<Full<Bytes>> {
    let hours = query_param(query, "hours")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(DEFAULT_STATS_HOURS)
        .clamp(1, MAX_STATS_HOURS);
    let since = Utc::now() - chrono::Duration::hours(hours);

    match state.pipeline.store().statistics(subject, since) {
        Ok(by_type) => json_response(
            StatusCode::OK,
            &StatisticsResponse {
                subject,
                hours,
                total_events: by_type.iter().map(|s| s.events).sum(),
                total_sent: by_type.iter().map(|s| s.sent).sum(),
                total_failed: by_type.iter().map(|s| s.failed).sum(),
                by_type,
            },
        ),
        Err(e) => failure(&e),
    }
}

async fn handle_notify(state: &HttpState, subject: SubjectId, body: &[u8]) -> Response<Full<Bytes>> {
    let request: NotifyRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    match state.pipeline.notify_manual(subject, ChatId(request.actor)).await {
        Ok(outcome) => {
            let remaining_secs = match &outcome {
                EvaluationOutcome::CooldownActive { remaining, .. } => Some(remaining.as_secs()),
                _ => None,
            };
            let event = outcome.event().cloned();
            json_response(
                StatusCode::OK,
                &NotifyResponse {
                    success: event.as_ref().is_some_and(|e| e.success()),
                    outcome: outcome.as_str(),
                    remaining_secs,
                    event,
                },
            )
        }
        Err(e) => {
            warn!(subject = %subject, actor = %request.actor, error = %e, "manual_trigger_rejected");
            failure(&e)
        }
    }
}

fn handle_tracking_get(state: &HttpState, subject: SubjectId) -> Response<Full<Bytes>> {
    match state.pipeline.store().tracking_enabled(subject) {
        Ok(enabled) => json_response(StatusCode::OK, &TrackingResponse { subject, enabled }),
        Err(e) => failure(&e),
    }
}

fn handle_tracking_put(state: &HttpState, subject: SubjectId, body: &[u8]) -> Response<Full<Bytes>> {
    let TrackingBody { enabled } = match serde_json::from_slice::<TrackingBody>(body) {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    match state.pipeline.store().set_tracking(subject, enabled, Utc::now()) {
        Ok(()) => {
            info!(subject = %subject, enabled = %enabled, "tracking_updated");
            json_response(StatusCode::OK, &TrackingResponse { subject, enabled })
        }
        Err(e) => failure(&e),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<HttpState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            return Ok(error_response(StatusCode::PAYLOAD_TOO_LARGE, "body too large"));
        }
        Err(e) => return Ok(error_response(StatusCode::BAD_REQUEST, &e.to_string())),
    };

    Ok(route(&state, &parts.method, parts.uri.path(), parts.uri.query(), &parts.headers, body).await)
}

/// Serve the API until the shutdown flag flips
pub async fn start_http_server(
    addr: SocketAddr,
    state: Arc<HttpState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;

    info!(addr = %addr, site = %state.site_id, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, state.clone()));

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
