//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::message::{DEFAULT_ARRIVAL_PHRASE, DEFAULT_DEPARTURE_PHRASE};
use crate::domain::types::{ChatId, Contact, Role, SubjectId, TransitionType, WorkZone};
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    /// Label attached to exported metrics
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "driver".to_string()
}

/// Per-subject zone override, seeded into the store at startup
#[derive(Debug, Clone, Deserialize)]
pub struct SubjectZoneConfig {
    pub subject: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
    /// Enable automatic tracking for this subject on startup
    #[serde(default)]
    pub tracking: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneConfig {
    #[serde(default = "default_zone_latitude")]
    pub latitude: f64,
    #[serde(default = "default_zone_longitude")]
    pub longitude: f64,
    #[serde(default = "default_zone_radius")]
    pub radius_m: f64,
    #[serde(default)]
    pub subjects: Vec<SubjectZoneConfig>,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            latitude: default_zone_latitude(),
            longitude: default_zone_longitude(),
            radius_m: default_zone_radius(),
            subjects: Vec::new(),
        }
    }
}

fn default_zone_latitude() -> f64 {
    55.676803
}

fn default_zone_longitude() -> f64 {
    37.523510
}

fn default_zone_radius() -> f64 {
    100.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct CooldownConfig {
    #[serde(default = "default_cooldown_secs")]
    pub arrival_secs: u64,
    #[serde(default = "default_cooldown_secs")]
    pub departure_secs: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self { arrival_secs: default_cooldown_secs(), departure_secs: default_cooldown_secs() }
    }
}

fn default_cooldown_secs() -> u64 {
    600
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    /// Samples older than this are flagged stale
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    /// Upper bound for the backoff after a persistence failure
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            stale_after_secs: default_stale_after(),
            backoff_max_secs: default_backoff_max(),
        }
    }
}

fn default_poll_interval() -> u64 {
    30
}

fn default_stale_after() -> u64 {
    600
}

fn default_backoff_max() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Bot token; TELEGRAM_BOT_TOKEN env var wins when set
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_send_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_parallel_sends")]
    pub max_parallel_sends: usize,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            token: String::new(),
            timeout_ms: default_send_timeout_ms(),
            max_parallel_sends: default_max_parallel_sends(),
        }
    }
}

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_max_parallel_sends() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagesConfig {
    /// Offset used for greetings and confirmation timestamps (Moscow by default)
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_arrival_phrase")]
    pub arrival_phrase: String,
    #[serde(default = "default_departure_phrase")]
    pub departure_phrase: String,
    /// Send delivery summaries to drivers and admins
    #[serde(default = "default_confirmations")]
    pub confirmations: bool,
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: default_utc_offset_minutes(),
            arrival_phrase: default_arrival_phrase(),
            departure_phrase: default_departure_phrase(),
            confirmations: default_confirmations(),
        }
    }
}

fn default_utc_offset_minutes() -> i32 {
    180
}

fn default_arrival_phrase() -> String {
    DEFAULT_ARRIVAL_PHRASE.to_string()
}

fn default_departure_phrase() -> String {
    DEFAULT_DEPARTURE_PHRASE.to_string()
}

fn default_confirmations() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { path: default_storage_path() }
    }
}

fn default_storage_path() -> String {
    "driver.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Subject used for ingest requests that name none
    #[serde(default)]
    pub default_subject: Option<i64>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), port: default_http_port(), default_subject: None }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

/// Contact seeded into the store at startup
#[derive(Debug, Clone, Deserialize)]
pub struct ContactConfig {
    pub chat_id: i64,
    pub name: String,
    pub role: Role,
    #[serde(default)]
    pub subject: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub zone: ZoneConfig,
    #[serde(default)]
    pub cooldown: CooldownConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub contacts: Vec<ContactConfig>,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    default_zone: WorkZone,
    subject_zones: Vec<SubjectZoneConfig>,
    arrival_cooldown_secs: u64,
    departure_cooldown_secs: u64,
    poll_interval_secs: u64,
    stale_after_secs: u64,
    backoff_max_secs: u64,
    telegram_api_base: String,
    telegram_token: String,
    send_timeout_ms: u64,
    max_parallel_sends: usize,
    utc_offset_minutes: i32,
    arrival_phrase: String,
    departure_phrase: String,
    confirmations: bool,
    storage_path: String,
    http_bind_address: String,
    http_port: u16,
    default_subject: Option<i64>,
    metrics_interval_secs: u64,
    contacts: Vec<ContactConfig>,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        let TomlConfig {
            site, zone, cooldown, poller, telegram, messages, storage, http, metrics, contacts,
        } = toml_config;

        Self {
            site_id: site.id,
            default_zone: WorkZone::new(zone.latitude, zone.longitude, zone.radius_m),
            subject_zones: zone.subjects,
            arrival_cooldown_secs: cooldown.arrival_secs,
            departure_cooldown_secs: cooldown.departure_secs,
            poll_interval_secs: poller.interval_secs,
            stale_after_secs: poller.stale_after_secs,
            backoff_max_secs: poller.backoff_max_secs,
            telegram_api_base: telegram.api_base,
            telegram_token: telegram.token,
            send_timeout_ms: telegram.timeout_ms,
            max_parallel_sends: telegram.max_parallel_sends.max(1),
            utc_offset_minutes: messages.utc_offset_minutes,
            arrival_phrase: messages.arrival_phrase,
            departure_phrase: messages.departure_phrase,
            confirmations: messages.confirmations,
            storage_path: storage.path,
            http_bind_address: http.bind_address,
            http_port: http.port,
            default_subject: http.default_subject,
            metrics_interval_secs: metrics.interval_secs,
            contacts,
            config_file,
        }
    }

    /// Load configuration from an explicit path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    config_file = %path,
                    error = %format!("{e:#}"),
                    "config_load_failed_using_defaults"
                );
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn default_zone(&self) -> WorkZone {
        self.default_zone
    }

    pub fn subject_zones(&self) -> &[SubjectZoneConfig] {
        &self.subject_zones
    }

    /// Cooldown for one transition type, applied by every trigger path
    pub fn cooldown(&self, kind: TransitionType) -> Duration {
        match kind {
            TransitionType::Arrival => Duration::from_secs(self.arrival_cooldown_secs),
            TransitionType::Departure => Duration::from_secs(self.departure_cooldown_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs.max(1))
    }

    pub fn telegram_api_base(&self) -> &str {
        &self.telegram_api_base
    }

    /// Bot token from TELEGRAM_BOT_TOKEN, else from the config file
    pub fn telegram_token(&self) -> String {
        env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| self.telegram_token.clone())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn max_parallel_sends(&self) -> usize {
        self.max_parallel_sends
    }

    pub fn utc_offset_minutes(&self) -> i32 {
        self.utc_offset_minutes
    }

    pub fn arrival_phrase(&self) -> &str {
        &self.arrival_phrase
    }

    pub fn departure_phrase(&self) -> &str {
        &self.departure_phrase
    }

    pub fn confirmations(&self) -> bool {
        self.confirmations
    }

    pub fn storage_path(&self) -> &str {
        &self.storage_path
    }

    pub fn http_bind_address(&self) -> &str {
        &self.http_bind_address
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn default_subject(&self) -> Option<SubjectId> {
        self.default_subject.map(SubjectId)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Contacts from the config file as domain values
    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts
            .iter()
            .map(|c| Contact {
                chat_id: ChatId(c.chat_id),
                display_name: c.name.clone(),
                role: c.role,
                subject: c.subject.map(SubjectId),
            })
            .collect()
    }

    /// Builder method for tests to set both cooldowns
    pub fn with_cooldown_secs(mut self, arrival: u64, departure: u64) -> Self {
        self.arrival_cooldown_secs = arrival;
        self.departure_cooldown_secs = departure;
        self
    }

    /// Builder method for tests to set the send timeout
    pub fn with_send_timeout_ms(mut self, ms: u64) -> Self {
        self.send_timeout_ms = ms;
        self
    }

    /// Builder method for tests to toggle confirmations
    pub fn with_confirmations(mut self, enabled: bool) -> Self {
        self.confirmations = enabled;
        self
    }
}
