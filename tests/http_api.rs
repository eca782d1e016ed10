//! HTTP API integration tests
//!
//! Tests for /webhooks/sms, /healthz, /readyz, /livez, /stats, /metrics and
//! the campaign operation endpoints.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{TimeZone, Utc};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower::ServiceExt;

use campaignd::api::{router, ApiServer, ApiState};
use campaignd::bootstrap::{AppState, Shutdown};
use campaignd::clock::ManualClock;
use campaignd::config::Config;
use campaignd::directory::{Contact, MemoryDirectory};
use campaignd::dispatch::MockGateway;
use campaignd::store::{Campaign, CampaignStatus, MemoryStorage, Membership, MembershipStatus, Storage, Variant};
use campaignd::telemetry::{AdminState, Metrics};
use campaignd::webhook::SignatureVerifier;

const SECRET: &str = "api-secret";

/// Health response
#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Readiness response
#[derive(Debug, Deserialize)]
struct ReadinessResponse {
    ready: bool,
    dependencies: Vec<DependencyStatus>,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct DependencyStatus {
    name: String,
    healthy: bool,
    message: Option<String>,
}

/// Stats response
#[derive(Debug, Deserialize)]
struct StatsResponse {
    uptime_seconds: u64,
    messages: MessageStats,
    webhooks: WebhookStats,
    store: StoreStats,
}

#[derive(Debug, Deserialize)]
struct MessageStats {
    delivered: u64,
}

#[derive(Debug, Deserialize)]
struct WebhookStats {
    accepted: u64,
    duplicate: u64,
    rejected: u64,
}

#[derive(Debug, Deserialize)]
struct StoreStats {
    campaigns: u64,
    events_processed: u64,
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    status: String,
}

struct Fixture {
    state: Arc<ApiState>,
    app: AppState,
    storage: Arc<MemoryStorage>,
    admin: Arc<AdminState>,
    verifier: SignatureVerifier,
}

fn fixture() -> Fixture {
    let config = Config::from_yaml(&format!("webhook:\n  secret: {SECRET}\n  signature_header: x-provider-signature\n")).unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let directory = Arc::new(MemoryDirectory::with_contacts([Contact::new(1, "+15550000001")]));
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()));
    let metrics = Metrics::new().unwrap();
    let admin = metrics.admin_state();

    let app = AppState::with_parts(
        Arc::new(config),
        storage.clone(),
        directory,
        Arc::new(MockGateway::success()),
        clock,
        metrics,
        Shutdown::new(std::time::Duration::from_secs(1)),
    )
    .unwrap();

    Fixture {
        state: app.api_state().unwrap(),
        app,
        storage,
        admin,
        verifier: SignatureVerifier::new(SECRET).unwrap(),
    }
}

impl Fixture {
    async fn call(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = router(self.state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn get(&self, path: &str) -> (StatusCode, Vec<u8>) {
        self.call(Request::get(path).body(Body::empty()).unwrap()).await
    }

    async fn post(&self, path: &str) -> (StatusCode, Vec<u8>) {
        self.call(Request::post(path).body(Body::empty()).unwrap()).await
    }

    async fn webhook(&self, body: &str, signature: Option<String>) -> (StatusCode, Vec<u8>) {
        let mut request = Request::post("/webhooks/sms").header("content-type", "application/json");
        if let Some(sig) = signature {
            request = request.header("x-provider-signature", sig);
        }
        self.call(request.body(Body::from(body.to_string())).unwrap()).await
    }

    fn signed(&self, body: &str) -> Option<String> {
        Some(format!("sha256={}", self.verifier.sign(body.as_bytes())))
    }
}

fn status_event(id: &str, message_id: &str) -> String {
    format!(r#"{{"id":"{id}","type":"message.status","data":{{"message_id":"{message_id}","status":"delivered"}}}}"#)
}

#[tokio::test]
async fn test_healthz_returns_healthy() {
    let f = fixture();
    let (status, body) = f.get("/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let body: HealthResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(body.status, "healthy");
    assert!(!body.version.is_empty());
}

#[tokio::test]
async fn test_livez_returns_ok() {
    let f = fixture();
    assert_eq!(f.get("/livez").await.0, StatusCode::OK);
}

#[tokio::test]
async fn test_readyz_follows_ready_flag_and_storage_health() {
    let f = fixture();
    assert_eq!(f.get("/readyz").await.0, StatusCode::SERVICE_UNAVAILABLE);

    f.admin.set_ready(true);
    let (status, body) = f.get("/readyz").await;
    assert_eq!(status, StatusCode::OK);
    let body: ReadinessResponse = serde_json::from_slice(&body).unwrap();
    assert!(body.ready);
    assert_eq!(body.dependencies[0].name, "storage");

    f.admin.set_storage_health(false);
    let (status, body) = f.get("/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let body: ReadinessResponse = serde_json::from_slice(&body).unwrap();
    assert!(!body.dependencies[0].healthy);
}

#[tokio::test]
async fn test_webhook_accepts_then_reports_duplicate() {
    let f = fixture();
    let body = r#"{"id":"evt_100","type":"number.ported","data":{}}"#.to_string();

    let (status, resp) = f.webhook(&body, f.signed(&body)).await;
    assert_eq!(status, StatusCode::OK);
    let resp: WebhookResponse = serde_json::from_slice(&resp).unwrap();
    assert_eq!(resp.status, "accepted");

    let (status, resp) = f.webhook(&body, f.signed(&body)).await;
    assert_eq!(status, StatusCode::OK);
    let resp: WebhookResponse = serde_json::from_slice(&resp).unwrap();
    assert_eq!(resp.status, "duplicate");
}

#[tokio::test]
async fn test_webhook_rejects_bad_signature() {
    let f = fixture();
    let body = status_event("evt_101", "SM1");

    assert_eq!(f.webhook(&body, None).await.0, StatusCode::UNAUTHORIZED);

    let forged = SignatureVerifier::new("wrong").unwrap().sign(body.as_bytes());
    assert_eq!(f.webhook(&body, Some(forged)).await.0, StatusCode::UNAUTHORIZED);

    assert!(f.storage.get_event("evt_101").unwrap().is_none());
}

#[tokio::test]
async fn test_webhook_rejects_malformed_envelope() {
    let f = fixture();
    let body = r#"{"type":"message.status","data":{}}"#;
    assert_eq!(f.webhook(body, f.signed(body)).await.0, StatusCode::BAD_REQUEST);

    let body = "not json";
    assert_eq!(f.webhook(body, f.signed(body)).await.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_in_progress_asks_for_redelivery() {
    let f = fixture();
    let body = status_event("evt_102", "SM1");
    f.storage
        .record_event(campaignd::store::WebhookEvent::new("evt_102", "message.status", body.clone(), Utc::now()))
        .unwrap();
    assert!(f.storage.begin_event("evt_102").unwrap());

    assert_eq!(f.webhook(&body, f.signed(&body)).await.0, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_webhook_status_for_unrecorded_send_asks_for_redelivery() {
    let f = fixture();
    let body = status_event("evt_103", "SM-not-yet");
    assert_eq!(f.webhook(&body, f.signed(&body)).await.0, StatusCode::SERVICE_UNAVAILABLE);

    let event = f.storage.get_event("evt_103").unwrap().unwrap();
    assert!(!event.is_processed());
}

#[tokio::test]
async fn test_stats_reflect_webhook_traffic() {
    let f = fixture();
    let at = Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap();
    let campaign = f.app.campaigns.create(Campaign::new("c", "hi", 10)).unwrap();
    let mut m = Membership::new(campaign, campaignd::store::ContactId::from_u64(1), Variant::A, "+15550000001", "hi", at);
    m.mark_claimed(at);
    m.mark_sent("SM-7", at);
    f.storage.insert_memberships(vec![m]).unwrap();

    let body = status_event("evt_200", "SM-7");
    f.webhook(&body, f.signed(&body)).await;
    f.webhook(&body, f.signed(&body)).await;
    f.webhook(&body, None).await;

    let (status, body) = f.get("/stats").await;
    assert_eq!(status, StatusCode::OK);
    let stats: StatsResponse = serde_json::from_slice(&body).unwrap();
    assert!(stats.uptime_seconds < 60);
    assert_eq!(stats.messages.delivered, 1);
    assert_eq!(stats.webhooks.accepted, 1);
    assert_eq!(stats.webhooks.duplicate, 1);
    assert_eq!(stats.webhooks.rejected, 1);
    assert_eq!(stats.store.campaigns, 1);
    assert_eq!(stats.store.events_processed, 1);
}

#[tokio::test]
async fn test_metrics_returns_prometheus_format() {
    let f = fixture();
    let (status, body) = f.get("/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let body = String::from_utf8(body).unwrap();
    assert!(body.is_empty() || body.contains("# HELP") || body.contains("# TYPE"));
}

#[tokio::test]
async fn test_campaign_pause_resume_and_requeue() {
    let f = fixture();
    let id = f
        .app
        .campaigns
        .create(Campaign::new("ops", "hello", 10).with_status(CampaignStatus::Active))
        .unwrap();

    let (status, body) = f.get(&format!("/campaigns/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    let view: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(view["status"], "active");
    assert_eq!(view["memberships"]["total"], 0);

    assert_eq!(f.post(&format!("/campaigns/{id}/pause")).await.0, StatusCode::OK);
    assert_eq!(f.storage.get_campaign(id).unwrap().unwrap().status, CampaignStatus::Paused);

    // Paused → paused is not a transition.
    assert_eq!(f.post(&format!("/campaigns/{id}/pause")).await.0, StatusCode::CONFLICT);

    assert_eq!(f.post(&format!("/campaigns/{}/resume", id.as_u64())).await.0, StatusCode::OK);

    let at = Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap();
    let mut m = Membership::new(id, campaignd::store::ContactId::from_u64(1), Variant::A, "+15550000001", "hello", at);
    m.mark_failed("gateway timeout", at);
    f.storage.insert_memberships(vec![m]).unwrap();

    let (status, body) = f.post(&format!("/campaigns/{id}/requeue")).await;
    assert_eq!(status, StatusCode::OK);
    let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["requeued"], 1);
    assert_eq!(
        f.storage.campaign_memberships(id, Some(MembershipStatus::Pending)).unwrap().len(),
        1
    );
}

#[tokio::test]
async fn test_campaign_lookup_errors() {
    let f = fixture();
    assert_eq!(f.get("/campaigns/cmp_999999").await.0, StatusCode::NOT_FOUND);
    assert_eq!(f.get("/campaigns/not-an-id").await.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_server_stops_on_drain() {
    let f = fixture();
    let shutdown = Shutdown::new(std::time::Duration::from_secs(1));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = ApiServer::new(addr, f.state.clone(), shutdown.clone());
    let handle = tokio::spawn(server.serve(listener));

    let resp = reqwest::get(format!("http://{addr}/livez")).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    shutdown.start_drain();
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
    assert!(result.is_ok(), "server did not stop after drain");
}
