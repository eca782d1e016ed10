//! HTTP API using Axum.
//!
//! Provides endpoints for:
//! - Provider webhooks (/webhooks/sms)
//! - Health checks (/healthz, /livez, /readyz)
//! - Metrics (/metrics)
//! - Runtime stats (/stats)
//! - Campaign operations (/campaigns/:id, pause, resume, requeue)

mod handlers;
mod server;

pub use handlers::{
    ApiError, CampaignView, ErrorResponse, HealthResponse, ReadyResponse, RequeueResponse,
    StatsResponse, WebhookResponse,
};
pub use server::{router, ApiServer, ApiState};
