//! Arrival notifier - driver arrival/departure alerts over Telegram
//!
//! Ingests GPS samples over HTTP, detects work-zone transitions and notifies
//! the subject's recipients, with a durable per-type cooldown.
//!
//! Module structure:
//! - `domain/` - Core types, geofence math, message texts
//! - `io/` - External interfaces (HTTP API, Telegram, Prometheus)
//! - `services/` - Detection, cooldown, dispatch, pipeline, poller
//! - `infra/` - Infrastructure (Config, Metrics, Store, errors)

use anyhow::Context;
use arrival_notifier::domain::{SubjectId, TransitionType, WorkZone};
use arrival_notifier::infra::{Config, Metrics, Store};
use arrival_notifier::io::{start_http_server, HttpState, TelegramClient};
use arrival_notifier::services::{Dispatcher, Pipeline, Poller};
use chrono::Utc;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Driver arrival notifier
#[derive(Parser, Debug)]
#[command(name = "arrival-notifier", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,
}

/// Write configured zones, tracking flags and contacts into the store
fn seed_store(store: &Store, config: &Config) -> anyhow::Result<()> {
    let now = Utc::now();
    for zone in config.subject_zones() {
        let subject = SubjectId(zone.subject);
        store.set_zone(subject, &WorkZone::new(zone.latitude, zone.longitude, zone.radius_m))?;
        if zone.tracking {
            store.set_tracking(subject, true, now)?;
        }
    }
    let contacts = config.contacts();
    for contact in &contacts {
        store.upsert_contact(contact)?;
    }
    info!(zones = %config.subject_zones().len(), contacts = %contacts.len(), "store_seeded");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default INFO level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = %env!("CARGO_PKG_VERSION"), git_hash = %env!("GIT_HASH"), "arrival-notifier starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    let zone = config.default_zone();
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        zone_lat = %zone.center_lat,
        zone_lon = %zone.center_lon,
        zone_radius_m = %zone.radius_m,
        arrival_cooldown_secs = %config.cooldown(TransitionType::Arrival).as_secs(),
        departure_cooldown_secs = %config.cooldown(TransitionType::Departure).as_secs(),
        poll_interval_secs = %config.poll_interval().as_secs(),
        storage = %config.storage_path(),
        http_port = %config.http_port(),
        "config_loaded"
    );

    let store = Arc::new(
        Store::open(config.storage_path())
            .with_context(|| format!("failed to open store at {}", config.storage_path()))?,
    );
    seed_store(&store, &config)?;

    let metrics = Arc::new(Metrics::new());
    let sender = Arc::new(TelegramClient::new(&config)?);
    let dispatcher = Dispatcher::new(store.clone(), sender, metrics.clone(), &config);
    let pipeline = Arc::new(Pipeline::new(store.clone(), dispatcher, metrics.clone(), &config));

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start HTTP API
    let addr: SocketAddr = format!("{}:{}", config.http_bind_address(), config.http_port())
        .parse()
        .with_context(|| format!("invalid bind address {}", config.http_bind_address()))?;
    let http_state = Arc::new(HttpState::new(pipeline.clone(), &config));
    let http_shutdown = shutdown_rx.clone();
    let server_state = http_state.clone();
    let http_handle = tokio::spawn(async move {
        if let Err(e) = start_http_server(addr, server_state, http_shutdown).await {
            tracing::error!(error = %e, "http_server_error");
        }
    });

    // Start metrics reporter
    let report_metrics = metrics.clone();
    let report_store = store.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    let mut report_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let tracked = match report_store.tracked_subjects() {
                        Ok(subjects) => subjects.len(),
                        Err(e) => {
                            warn!(error = %e, "tracked_subjects_unavailable");
                            0
                        }
                    };
                    report_metrics.report(tracked).log();
                }
                changed = report_shutdown.changed() => {
                    if changed.is_err() || *report_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Run poller until shutdown
    Poller::new(pipeline, &config, shutdown_rx).run().await;
    let _ = http_handle.await;

    // Let evaluations started by late location reports finish their sends
    http_state.drain_inline(config.send_timeout() * 2).await;

    info!("arrival-notifier shutdown complete");
    Ok(())
}
