//! API handlers.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::campaign::CampaignError;
use crate::store::{Campaign, CampaignId, MembershipStats, StoreError, StoreStats};
use crate::telemetry::{AdminSnapshot, DependencyStatus};
use crate::webhook::IngestError;

use super::ApiState;

/// Error body for every non-2xx JSON response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Handler errors mapped onto HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid campaign id: {0}")]
    InvalidId(String),

    #[error(transparent)]
    Campaign(#[from] CampaignError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidId(_) => StatusCode::BAD_REQUEST,
            Self::Campaign(e) => match e {
                CampaignError::Validation(_) => StatusCode::BAD_REQUEST,
                CampaignError::InvalidTransition { .. } => StatusCode::CONFLICT,
                CampaignError::NotFound(_) => StatusCode::NOT_FOUND,
                CampaignError::Store(_) | CampaignError::Directory(_) => StatusCode::SERVICE_UNAVAILABLE,
                CampaignError::Compliance(_) => StatusCode::UNPROCESSABLE_ENTITY,
                CampaignError::Template(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Ingest(e) => match e {
                IngestError::Signature(_) => StatusCode::UNAUTHORIZED,
                IngestError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
                IngestError::InProgress(_)
                | IngestError::UnmatchedStatus(_)
                | IngestError::Store(_)
                | IngestError::Correlate(_) => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

fn parse_id(raw: &str) -> Result<CampaignId, ApiError> {
    raw.parse().map_err(|_| ApiError::InvalidId(raw.to_string()))
}

/// Webhook acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: String,
}

/// Provider webhook handler.
///
/// POST /webhooks/sms - 200 once the event is durably handled, 401 on a bad
/// signature, 400 on a malformed envelope, 503 when the provider should retry.
pub async fn webhook_handler(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let signature = headers
        .get(&state.signature_header)
        .and_then(|v| v.to_str().ok());

    let outcome = state.ingestor.ingest(&body, signature).await?;
    Ok(Json(WebhookResponse {
        status: outcome.name().to_string(),
    }))
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check handler.
pub async fn health_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let healthy = state.admin().is_healthy();
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    if healthy {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Readiness response.
#[derive(Debug, Clone, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub dependencies: Vec<DependencyStatus>,
}

/// Ready handler (for Kubernetes).
pub async fn ready_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let admin = state.admin();
    let response = ReadyResponse {
        ready: admin.is_ready(),
        dependencies: admin.get_dependency_status(),
    };
    let status = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

/// Live handler (for Kubernetes).
pub async fn live_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Metrics handler (Prometheus format).
pub async fn metrics_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

/// Stats response.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub runtime: AdminSnapshot,
    pub store: StoreStats,
}

/// Stats handler.
pub async fn stats_handler(State(state): State<Arc<ApiState>>) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(StatsResponse {
        runtime: state.admin().snapshot(),
        store: state.storage.stats()?,
    }))
}

/// Campaign with its membership tally.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignView {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub memberships: MembershipStats,
}

/// GET /campaigns/:id
pub async fn campaign_handler(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<CampaignView>, ApiError> {
    let id = parse_id(&id)?;
    let campaign = state.campaigns.get(id)?;
    let memberships = state.storage.membership_stats(id)?;
    Ok(Json(CampaignView { campaign, memberships }))
}

/// POST /campaigns/:id/pause
pub async fn pause_handler(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Campaign>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.campaigns.pause(id)?))
}

/// POST /campaigns/:id/resume
pub async fn resume_handler(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<Campaign>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.campaigns.resume(id)?))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequeueResponse {
    pub requeued: usize,
}

/// POST /campaigns/:id/requeue - failed memberships back to pending
pub async fn requeue_handler(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Result<Json<RequeueResponse>, ApiError> {
    let id = parse_id(&id)?;
    let requeued = state.campaigns.requeue_failed(id)?;
    Ok(Json(RequeueResponse { requeued }))
}
