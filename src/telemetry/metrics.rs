use anyhow::Result;
use opentelemetry::metrics::MeterProvider;
use opentelemetry_prometheus::exporter;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Dependency status for readiness checks
#[derive(Debug, Clone, Serialize)]
pub struct DependencyStatus {
    pub name: String,
    pub healthy: bool,
    pub message: Option<String>,
}

/// Admin state for health/stats endpoints
#[derive(Debug)]
pub struct AdminState {
    start_time: Instant,
    healthy: AtomicBool,
    ready: AtomicBool,
    storage_healthy: AtomicBool,
    messages_sent: AtomicU64,
    messages_delivered: AtomicU64,
    messages_failed: AtomicU64,
    webhooks_accepted: AtomicU64,
    webhooks_duplicate: AtomicU64,
    webhooks_rejected: AtomicU64,
}

impl AdminState {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            healthy: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            storage_healthy: AtomicBool::new(true),
            messages_sent: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            webhooks_accepted: AtomicU64::new(0),
            webhooks_duplicate: AtomicU64::new(0),
            webhooks_rejected: AtomicU64::new(0),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Ready once started and the store answers.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed) && self.storage_healthy.load(Ordering::Relaxed)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Record the outcome of the last storage interaction.
    pub fn set_storage_health(&self, healthy: bool) {
        self.storage_healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn inc_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_webhook_accepted(&self) {
        self.webhooks_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_webhook_duplicate(&self) {
        self.webhooks_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_webhook_rejected(&self) {
        self.webhooks_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Get dependency status for readiness response
    pub fn get_dependency_status(&self) -> Vec<DependencyStatus> {
        let healthy = self.storage_healthy.load(Ordering::Relaxed);
        vec![DependencyStatus {
            name: "storage".to_string(),
            healthy,
            message: if healthy {
                None
            } else {
                Some("storage unavailable".to_string())
            },
        }]
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> AdminSnapshot {
        AdminSnapshot {
            uptime_seconds: self.uptime_secs(),
            messages: MessageStats {
                sent: self.messages_sent.load(Ordering::Relaxed),
                delivered: self.messages_delivered.load(Ordering::Relaxed),
                failed: self.messages_failed.load(Ordering::Relaxed),
            },
            webhooks: WebhookStats {
                accepted: self.webhooks_accepted.load(Ordering::Relaxed),
                duplicate: self.webhooks_duplicate.load(Ordering::Relaxed),
                rejected: self.webhooks_rejected.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for AdminState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminSnapshot {
    pub uptime_seconds: u64,
    pub messages: MessageStats,
    pub webhooks: WebhookStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageStats {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookStats {
    pub accepted: u64,
    pub duplicate: u64,
    pub rejected: u64,
}

/// OTEL Metrics with Prometheus exporter
pub struct Metrics {
    registry: Registry,
    meter_provider: SdkMeterProvider,
    admin_state: Arc<AdminState>,
}

impl Metrics {
    /// Create metrics with OTEL → Prometheus pipeline and register the
    /// campaign counters.
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let exporter = exporter()
            .with_registry(registry.clone())
            .build()?;

        let meter_provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        opentelemetry::global::set_meter_provider(meter_provider.clone());
        counters::init(&meter_provider.meter("campaignd"));

        info!("OTEL metrics configured with Prometheus exporter");

        Ok(Arc::new(Self {
            registry,
            meter_provider,
            admin_state: Arc::new(AdminState::new()),
        }))
    }

    /// Get admin state for updating metrics from other components
    pub fn admin_state(&self) -> Arc<AdminState> {
        self.admin_state.clone()
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!(error = %e, "failed to encode metrics");
        }

        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Drop for Metrics {
    fn drop(&mut self) {
        if let Err(e) = self.meter_provider.shutdown() {
            tracing::warn!(error = %e, "failed to shutdown meter provider");
        }
    }
}

/// Campaign engine metrics with campaign_*, gateway_* and webhook_* prefixes.
///
/// Recording functions are no-ops until [`init`](counters::init) runs, so
/// library code and tests can call them unconditionally.
pub mod counters {
    use opentelemetry::metrics::{Counter, Histogram};
    use opentelemetry::KeyValue;
    use std::sync::OnceLock;

    // ============================================================================
    // DISPATCH METRICS
    // ============================================================================

    static CLAIMS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static SENDS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static DEFERRED_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static PASS_ERRORS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static GATEWAY_SEND_DURATION: OnceLock<Histogram<f64>> = OnceLock::new();

    // ============================================================================
    // RESPONSE METRICS
    // ============================================================================

    static OPT_OUTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static RESPONSES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    // ============================================================================
    // WEBHOOK METRICS
    // ============================================================================

    static WEBHOOK_EVENTS_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();
    static WEBHOOK_SIGNATURE_FAILURES_TOTAL: OnceLock<Counter<u64>> = OnceLock::new();

    /// Initialize all metrics
    pub fn init(meter: &opentelemetry::metrics::Meter) {
        let _ = CLAIMS_TOTAL.set(
            meter.u64_counter("campaign_claims_total")
                .with_description("Memberships claimed for sending")
                .build(),
        );
        let _ = SENDS_TOTAL.set(
            meter.u64_counter("campaign_sends_total")
                .with_description("Send attempts by final result")
                .build(),
        );
        let _ = DEFERRED_TOTAL.set(
            meter.u64_counter("campaign_deferred_total")
                .with_description("Claims deferred to the next business-hours window")
                .build(),
        );
        let _ = PASS_ERRORS_TOTAL.set(
            meter.u64_counter("dispatch_pass_errors_total")
                .with_description("Dispatch passes aborted by systemic errors")
                .build(),
        );
        let _ = GATEWAY_SEND_DURATION.set(
            meter.f64_histogram("gateway_send_duration_seconds")
                .with_description("Send gateway call latency")
                .build(),
        );
        let _ = OPT_OUTS_TOTAL.set(
            meter.u64_counter("campaign_opt_outs_total")
                .with_description("Opt-outs by where they were observed")
                .build(),
        );
        let _ = RESPONSES_TOTAL.set(
            meter.u64_counter("campaign_responses_total")
                .with_description("Replies attributed to a send, by sentiment")
                .build(),
        );
        let _ = WEBHOOK_EVENTS_TOTAL.set(
            meter.u64_counter("webhook_events_total")
                .with_description("Webhook events by type and result")
                .build(),
        );
        let _ = WEBHOOK_SIGNATURE_FAILURES_TOTAL.set(
            meter.u64_counter("webhook_signature_failures_total")
                .with_description("Webhook requests rejected for a bad signature")
                .build(),
        );
    }

    // ============================================================================
    // Dispatch
    // ============================================================================

    pub fn claimed(count: u64) {
        if let Some(c) = CLAIMS_TOTAL.get() {
            c.add(count, &[]);
        }
    }

    pub fn send_succeeded() {
        if let Some(c) = SENDS_TOTAL.get() {
            c.add(1, &[kv("result", "sent")]);
        }
    }

    /// Record a send that ended in `failed`
    pub fn send_failed(reason: &str) {
        if let Some(c) = SENDS_TOTAL.get() {
            c.add(1, &[kv("result", "failed"), kv("reason", reason)]);
        }
    }

    pub fn deferred(count: u64) {
        if let Some(c) = DEFERRED_TOTAL.get() {
            c.add(count, &[]);
        }
    }

    pub fn pass_error() {
        if let Some(c) = PASS_ERRORS_TOTAL.get() {
            c.add(1, &[]);
        }
    }

    pub fn gateway_latency(seconds: f64) {
        if let Some(h) = GATEWAY_SEND_DURATION.get() {
            h.record(seconds, &[]);
        }
    }

    // ============================================================================
    // Responses
    // ============================================================================

    /// Record an opt-out; `source` is "reply" or "send_check"
    pub fn opt_out(source: &str) {
        if let Some(c) = OPT_OUTS_TOTAL.get() {
            c.add(1, &[kv("source", source)]);
        }
    }

    pub fn response(sentiment: &str) {
        if let Some(c) = RESPONSES_TOTAL.get() {
            c.add(1, &[kv("sentiment", sentiment)]);
        }
    }

    // ============================================================================
    // Webhooks
    // ============================================================================

    pub fn webhook_event(event_type: &str, result: &str) {
        if let Some(c) = WEBHOOK_EVENTS_TOTAL.get() {
            c.add(1, &[kv("type", event_type), kv("result", result)]);
        }
    }

    pub fn webhook_signature_failure() {
        if let Some(c) = WEBHOOK_SIGNATURE_FAILURES_TOTAL.get() {
            c.add(1, &[]);
        }
    }

    // Helper function to create KeyValue
    #[inline]
    fn kv(key: &'static str, value: &str) -> KeyValue {
        KeyValue::new(key, value.to_string())
    }
}
