use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::compliance::BusinessHoursWindow;

/// Root configuration for campaignd
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server (webhooks, health, admin)
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Dispatch scheduling
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Opt-out, business hours and frequency rules
    #[serde(default)]
    pub compliance: ComplianceConfig,

    /// Inbound webhook verification
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Outbound send gateway
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Logging and tracing
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Graceful shutdown
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_server_address")]
    pub address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
        }
    }
}

fn default_server_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Volatile, for development and tests
    #[default]
    Memory,
    /// fjall LSM-tree on local disk
    Fjall,
}

/// Storage configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Data directory for the fjall backend (defaults to the platform data dir)
    pub path: Option<PathBuf>,
}

/// Dispatch scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Time between scheduling passes
    #[serde(default = "default_dispatch_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Maximum memberships claimed per campaign per pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent send units per pass
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Bound on a single gateway call
    #[serde(default = "default_send_timeout", with = "humantime_serde")]
    pub send_timeout: Duration,

    /// Retry policy for retryable gateway errors
    #[serde(default)]
    pub retry: RetryConfig,

    /// Claims older than this are recovered at the start of each pass
    #[serde(default = "default_stale_claim_age", with = "humantime_serde")]
    pub stale_claim_age: Duration,

    /// Default sender number
    #[serde(default)]
    pub source_number: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            interval: default_dispatch_interval(),
            batch_size: default_batch_size(),
            concurrency: default_concurrency(),
            send_timeout: default_send_timeout(),
            retry: RetryConfig::default(),
            stale_claim_age: default_stale_claim_age(),
            source_number: String::new(),
        }
    }
}

fn default_dispatch_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_batch_size() -> usize {
    100
}

fn default_concurrency() -> usize {
    8
}

fn default_send_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_stale_claim_age() -> Duration {
    Duration::from_secs(15 * 60)
}

/// Retry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Backoff cap
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

/// Compliance configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ComplianceConfig {
    /// Sending window used by campaigns without their own
    #[serde(default)]
    pub business_hours: BusinessHoursWindow,

    /// Contacts messaged within this window are left out of new lists
    #[serde(default = "default_frequency_cap", with = "humantime_serde")]
    pub frequency_cap: Duration,

    /// How far back a reply may be attributed to a send
    #[serde(default = "default_lookback", with = "humantime_serde")]
    pub lookback: Duration,

    /// Words that opt a contact out when found in a reply
    #[serde(default = "default_opt_out_keywords")]
    pub opt_out_keywords: Vec<String>,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            business_hours: BusinessHoursWindow::default(),
            frequency_cap: default_frequency_cap(),
            lookback: default_lookback(),
            opt_out_keywords: default_opt_out_keywords(),
        }
    }
}

fn default_frequency_cap() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_lookback() -> Duration {
    Duration::from_secs(48 * 3600)
}

pub fn default_opt_out_keywords() -> Vec<String> {
    [
        "stop",
        "stopall",
        "unsubscribe",
        "cancel",
        "end",
        "quit",
        "remove",
        "opt out",
        "optout",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// Webhook verification configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Shared HMAC secret
    #[serde(default)]
    pub secret: String,

    /// Header carrying the hex signature
    #[serde(default = "default_signature_header")]
    pub signature_header: String,

    /// How long a status for an unknown message ID is refused for
    /// redelivery before it is recorded as orphaned
    #[serde(default = "default_unmatched_grace", with = "humantime_serde")]
    pub unmatched_grace: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            signature_header: default_signature_header(),
            unmatched_grace: default_unmatched_grace(),
        }
    }
}

fn default_signature_header() -> String {
    "x-signature".to_string()
}

fn default_unmatched_grace() -> Duration {
    Duration::from_secs(15 * 60)
}

/// Send gateway mode
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayMode {
    /// Scripted in-process gateway
    #[default]
    Mock,
    /// JSON over HTTP provider API
    Http,
}

/// Send gateway configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub mode: GatewayMode,

    /// Provider endpoint (http mode)
    pub endpoint: Option<String>,

    /// Bearer token (http mode)
    pub api_key: Option<String>,

    /// Mock behaviour (mock mode)
    #[serde(default)]
    pub mock: MockConfig,
}

/// Mock response configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MockConfig {
    /// Response type
    #[serde(default)]
    pub response: MockResponse,

    /// Simulated latency
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
}

/// Mock response type
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MockResponse {
    #[default]
    Success,
    Error { message: String },
    Random { error_rate: f32 },
}

/// Logging and tracing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Enable structured JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OTLP endpoint for distributed tracing
    pub otlp_endpoint: Option<String>,

    /// Trace sample rate (0.0 - 1.0)
    #[serde(default = "default_sample_rate")]
    pub trace_sample_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            log_level: default_log_level(),
            otlp_endpoint: None,
            trace_sample_rate: default_sample_rate(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

/// Shutdown configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long in-flight passes and requests get to finish
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout: default_drain_timeout(),
        }
    }
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Humantime serde support module
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
