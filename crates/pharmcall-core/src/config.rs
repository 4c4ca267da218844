use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{PharmcallError, Result};

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TIMEZONE: &str = "America/New_York";
pub const DEFAULT_OPEN_HOUR: u32 = 9;
pub const DEFAULT_CLOSE_HOUR: u32 = 19; // exclusive
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAYS_SECS: [u64; 3] = [300, 1800, 7200];
pub const DEFAULT_RATE_LIMIT_SECS: u64 = 3600;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_MAX_POLLS: u32 = 60; // 60 x 5s = 5 minutes
pub const PROCESSING_MARGIN_SECS: u64 = 300;
pub const DEFAULT_QSTASH_URL: &str = "https://qstash.upstash.io";
pub const DEFAULT_VAPI_URL: &str = "https://api.vapi.ai";

/// Top-level config (pharmcall.toml + PHARMCALL_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PharmcallConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub calling: CallingConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token guarding `/admin/*`. When unset the admin routes answer 403.
    pub admin_token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Whether calls are placed through the voice provider or simulated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    Real,
    #[default]
    Simulated,
}

impl std::fmt::Display for CallMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallMode::Real => write!(f, "real"),
            CallMode::Simulated => write!(f, "simulated"),
        }
    }
}

/// Calling window, retry ladder and rate-limit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallingConfig {
    #[serde(default)]
    pub mode: CallMode,
    /// IANA time zone the calling window is evaluated in.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_open_hour")]
    pub open_hour: u32,
    #[serde(default = "default_close_hour")]
    pub close_hour: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff ladder indexed by attempt number (1-based); the last entry repeats.
    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,
    #[serde(default = "default_rate_limit_secs")]
    pub rate_limit_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

impl Default for CallingConfig {
    fn default() -> Self {
        Self {
            mode: CallMode::default(),
            timezone: default_timezone(),
            open_hour: DEFAULT_OPEN_HOUR,
            close_hour: DEFAULT_CLOSE_HOUR,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delays_secs: default_retry_delays(),
            rate_limit_secs: DEFAULT_RATE_LIMIT_SECS,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_polls: DEFAULT_MAX_POLLS,
        }
    }
}

impl CallingConfig {
    /// How long a job may sit in `processing` before a redelivery may take it
    /// over: the longest real call we would wait for, plus a margin.
    pub fn processing_timeout_secs(&self) -> u64 {
        self.poll_interval_secs
            .saturating_mul(u64::from(self.max_polls))
            .saturating_add(PROCESSING_MARGIN_SECS)
    }
}

/// Which delayed-task dispatcher backs the scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DispatchKind {
    /// In-process tokio timers; delayed tasks do not survive a restart.
    #[default]
    Local,
    /// Upstash QStash publish-with-delay.
    Qstash,
}

impl std::fmt::Display for DispatchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchKind::Local => write!(f, "local"),
            DispatchKind::Qstash => write!(f, "qstash"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub kind: DispatchKind,
    #[serde(default = "default_qstash_url")]
    pub base_url: String,
    pub token: Option<String>,
    /// Public URL of this gateway's `POST /jobs/process` endpoint.
    pub callback_url: Option<String>,
    /// When set, `/jobs/process` requires an HMAC-SHA256 signature over the body.
    pub signing_secret: Option<String>,
    /// Bearer token QStash forwards to `/jobs/process`. Falls back to
    /// `gateway.admin_token`.
    pub callback_token: Option<String>,
}

impl DispatchConfig {
    /// The bearer token `/jobs/process` accepts and the dispatcher forwards.
    pub fn callback_bearer<'a>(&'a self, gateway: &'a GatewayConfig) -> Option<&'a str> {
        self.callback_token
            .as_deref()
            .or(gateway.admin_token.as_deref())
            .filter(|t| !t.trim().is_empty())
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            kind: DispatchKind::default(),
            base_url: default_qstash_url(),
            token: None,
            callback_url: None,
            signing_secret: None,
            callback_token: None,
        }
    }
}

/// Voice-AI provider (Vapi) credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default = "default_vapi_url")]
    pub base_url: String,
    pub api_key: Option<String>,
    pub assistant_id: Option<String>,
    pub phone_number_id: Option<String>,
    /// Shared secret expected in the `x-vapi-secret` header of provider webhooks.
    pub webhook_secret: Option<String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_vapi_url(),
            api_key: None,
            assistant_id: None,
            phone_number_id: None,
            webhook_secret: None,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_open_hour() -> u32 {
    DEFAULT_OPEN_HOUR
}
fn default_close_hour() -> u32 {
    DEFAULT_CLOSE_HOUR
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}
fn default_retry_delays() -> Vec<u64> {
    DEFAULT_RETRY_DELAYS_SECS.to_vec()
}
fn default_rate_limit_secs() -> u64 {
    DEFAULT_RATE_LIMIT_SECS
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_max_polls() -> u32 {
    DEFAULT_MAX_POLLS
}
fn default_qstash_url() -> String {
    DEFAULT_QSTASH_URL.to_string()
}
fn default_vapi_url() -> String {
    DEFAULT_VAPI_URL.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.pharmcall/pharmcall.db", home)
}

impl PharmcallConfig {
    /// Load config from a TOML file with PHARMCALL_* env var overrides.
    ///
    /// Nested keys use a double underscore: `PHARMCALL_DISPATCH__TOKEN`.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: PharmcallConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("PHARMCALL_").split("__"))
            .extract()
            .map_err(|e| PharmcallError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Fail fast on settings that would only surface once a call is attempted.
    pub fn validate(&self) -> Result<()> {
        self.calling
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| PharmcallError::InvalidTimezone(self.calling.timezone.clone()))?;

        if self.calling.open_hour >= self.calling.close_hour || self.calling.close_hour > 24 {
            return Err(PharmcallError::Config(format!(
                "calling window {}..{} is empty or out of range",
                self.calling.open_hour, self.calling.close_hour
            )));
        }
        if self.calling.max_attempts == 0 {
            return Err(PharmcallError::Config(
                "calling.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.calling.retry_delays_secs.is_empty() {
            return Err(PharmcallError::Config(
                "calling.retry_delays_secs must not be empty".to_string(),
            ));
        }

        if self.calling.mode == CallMode::Real {
            require(&self.voice.api_key, "voice.api_key")?;
            require(&self.voice.assistant_id, "voice.assistant_id")?;
            require(&self.voice.phone_number_id, "voice.phone_number_id")?;
        }

        if self.dispatch.kind == DispatchKind::Qstash {
            require(&self.dispatch.token, "dispatch.token")?;
            require(&self.dispatch.callback_url, "dispatch.callback_url")?;
            // QStash cannot sign with our HMAC secret; it can only forward a bearer
            if self.dispatch.callback_bearer(&self.gateway).is_none() {
                return Err(PharmcallError::Config(
                    "dispatch.callback_token (or gateway.admin_token) is required for qstash"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn require(value: &Option<String>, key: &str) -> Result<()> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(()),
        _ => Err(PharmcallError::Config(format!("{key} is required"))),
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.pharmcall/pharmcall.toml", home)
}
