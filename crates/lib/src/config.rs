//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.parley/config.json`) and environment.
//! Every field has a default so an empty `{}` file is a valid (if inert) configuration.
//! Secrets can be supplied through the environment instead of the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// SQLite store location.
    #[serde(default)]
    pub store: StoreConfig,

    /// Channel settings (WhatsApp Cloud API).
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Remote assistant service and run polling.
    #[serde(default)]
    pub assistant: AssistantConfig,

    /// Queue consumers and retry policy.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Idle conversation reaper.
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Transcript report delivery.
    #[serde(default)]
    pub report: ReportConfig,

    /// Tenants served from the config file. When empty, tenants are read from the store.
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 8080).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    8080
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

/// SQLite database holding tenants, conversations, messages and the dispatch queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Database file. Relative paths are resolved against the config file's parent. Default `parley.db`.
    pub path: Option<PathBuf>,
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub whatsapp: WhatsAppChannelConfig,
}

/// WhatsApp Cloud API config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppChannelConfig {
    /// Graph API access token. Overridden by WHATSAPP_ACCESS_TOKEN env when set.
    pub access_token: Option<String>,
    /// App secret used to verify X-Hub-Signature-256. Overridden by WHATSAPP_APP_SECRET env.
    pub app_secret: Option<String>,
    /// Token echoed by Meta during the GET verification handshake. Overridden by WHATSAPP_VERIFY_TOKEN env.
    pub verify_token: Option<String>,
    /// Graph API base URL (default https://graph.facebook.com/v19.0).
    #[serde(default = "default_whatsapp_api_base")]
    pub api_base: String,
    /// Longest reply body the channel accepts; longer replies are truncated.
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    /// Reject POSTs that carry no signature header. Default false (unsigned payloads are accepted).
    #[serde(default)]
    pub require_signature: bool,
}

fn default_whatsapp_api_base() -> String {
    "https://graph.facebook.com/v19.0".to_string()
}

fn default_max_message_chars() -> usize {
    4096
}

impl Default for WhatsAppChannelConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            app_secret: None,
            verify_token: None,
            api_base: default_whatsapp_api_base(),
            max_message_chars: default_max_message_chars(),
            require_signature: false,
        }
    }
}

/// Remote assistant (OpenAI Assistants API) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantConfig {
    /// API key. Overridden by OPENAI_API_KEY env.
    pub api_key: Option<String>,
    /// API base URL (default https://api.openai.com/v1).
    #[serde(default = "default_assistant_api_base")]
    pub api_base: String,
    /// Assistant used when no tenant matches the sender. Overridden by OPENAI_ASSISTANT_ID env.
    pub default_agent_id: Option<String>,
    /// Interval between run status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Give up on a run that has not finished after this many seconds.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    /// Sent once to the end-user when a job is abandoned because of an assistant failure.
    #[serde(default = "default_apology_text")]
    pub apology_text: String,
}

fn default_assistant_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_poll_timeout_secs() -> u64 {
    60
}

fn default_apology_text() -> String {
    "Sorry, we could not process your message right now. Please try again in a few minutes."
        .to_string()
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: default_assistant_api_base(),
            default_agent_id: None,
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_secs: default_poll_timeout_secs(),
            apology_text: default_apology_text(),
        }
    }
}

impl AssistantConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }
}

/// Queue consumer settings and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Number of concurrent worker tasks.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Retries after the first attempt before a job is abandoned.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First retry delay; doubled for every further attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound for a single retry delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// A claimed job that is not acknowledged within this window is delivered again.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    /// How often an idle worker re-checks the queue without a wake-up.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
    /// Hard wall-clock limit for one job attempt.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    5_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_lease_secs() -> u64 {
    300
}

fn default_idle_poll_ms() -> u64 {
    1_000
}

fn default_job_timeout_secs() -> u64 {
    120
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            lease_secs: default_lease_secs(),
            idle_poll_ms: default_idle_poll_ms(),
            job_timeout_secs: default_job_timeout_secs(),
        }
    }
}

/// Idle conversation reaper schedule and threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaperConfig {
    /// Run the periodic reaper inside the gateway process. Default true.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between scans.
    #[serde(default = "default_reaper_interval_secs")]
    pub interval_secs: u64,
    /// A conversation with no delivered reply for this many seconds is closed.
    #[serde(default = "default_inactivity_secs")]
    pub inactivity_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_reaper_interval_secs() -> u64 {
    60
}

fn default_inactivity_secs() -> u64 {
    600
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reaper_interval_secs(),
            inactivity_secs: default_inactivity_secs(),
        }
    }
}

/// Transactional email (Resend) settings for transcript reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportConfig {
    /// API key. Overridden by RESEND_API_KEY env. When absent, reports are not sent.
    pub api_key: Option<String>,
    /// API base URL (default https://api.resend.com).
    #[serde(default = "default_report_api_base")]
    pub api_base: String,
    /// Sender address, e.g. "Parley <reports@example.com>".
    #[serde(default = "default_report_from")]
    pub from: String,
}

fn default_report_api_base() -> String {
    "https://api.resend.com".to_string()
}

fn default_report_from() -> String {
    "Parley Reports <reports@localhost>".to_string()
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: default_report_api_base(),
            from: default_report_from(),
        }
    }
}

/// A tenant declared in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    /// Channel sender identifier (WhatsApp phone_number_id).
    pub sender_id: String,
    #[serde(default)]
    pub name: String,
    /// Remote assistant id answering for this tenant.
    pub agent_id: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub welcome_text: Option<String>,
    #[serde(default)]
    pub report_email: Option<String>,
}

/// Read an env var, trimmed; empty counts as unset.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Env var first, then the trimmed config value.
fn env_or(name: &str, value: Option<&String>) -> Option<String> {
    env_value(name).or_else(|| {
        value
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the WhatsApp access token: env WHATSAPP_ACCESS_TOKEN overrides config.
pub fn resolve_whatsapp_token(config: &Config) -> Option<String> {
    env_or(
        "WHATSAPP_ACCESS_TOKEN",
        config.channels.whatsapp.access_token.as_ref(),
    )
}

/// Resolve the webhook signing secret: env WHATSAPP_APP_SECRET overrides config.
pub fn resolve_app_secret(config: &Config) -> Option<String> {
    env_or("WHATSAPP_APP_SECRET", config.channels.whatsapp.app_secret.as_ref())
}

/// Resolve the webhook verify token: env WHATSAPP_VERIFY_TOKEN overrides config.
pub fn resolve_verify_token(config: &Config) -> Option<String> {
    env_or(
        "WHATSAPP_VERIFY_TOKEN",
        config.channels.whatsapp.verify_token.as_ref(),
    )
}

/// Resolve the assistant API key: env OPENAI_API_KEY overrides config.
pub fn resolve_assistant_key(config: &Config) -> Option<String> {
    env_or("OPENAI_API_KEY", config.assistant.api_key.as_ref())
}

/// Resolve the fallback assistant id: env OPENAI_ASSISTANT_ID overrides config.
pub fn resolve_default_agent(config: &Config) -> Option<String> {
    env_or(
        "OPENAI_ASSISTANT_ID",
        config.assistant.default_agent_id.as_ref(),
    )
}

/// Resolve the report mail API key: env RESEND_API_KEY overrides config.
pub fn resolve_report_key(config: &Config) -> Option<String> {
    env_or("RESEND_API_KEY", config.report.api_key.as_ref())
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("PARLEY_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".parley").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Resolve the database path: `store.path` if set (relative paths resolved against the config file's parent), otherwise `parley.db` next to the config file.
pub fn resolve_store_path(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.store.path {
        Some(p) if !p.as_os_str().is_empty() => {
            if p.is_absolute() {
                p.clone()
            } else {
                config_parent.join(p)
            }
        }
        _ => config_parent.join("parley.db"),
    }
}

/// Load config from the default path (or PARLEY_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
