//! HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::HeaderName,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tracing::info;

use crate::bootstrap::{Shutdown, ShutdownState};
use crate::campaign::CampaignService;
use crate::store::SharedStorage;
use crate::telemetry::{AdminState, Metrics};
use crate::webhook::WebhookIngestor;

use super::handlers::{
    campaign_handler, health_handler, live_handler, metrics_handler, pause_handler,
    ready_handler, requeue_handler, resume_handler, stats_handler, webhook_handler,
};

/// Shared handler state.
pub struct ApiState {
    pub campaigns: Arc<CampaignService>,
    pub ingestor: Arc<WebhookIngestor>,
    pub storage: SharedStorage,
    pub metrics: Arc<Metrics>,
    /// Header carrying the webhook signature
    pub signature_header: HeaderName,
}

impl ApiState {
    pub fn admin(&self) -> Arc<AdminState> {
        self.metrics.admin_state()
    }
}

/// Build the router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        // Provider callbacks
        .route("/webhooks/sms", post(webhook_handler))
        // Kubernetes-style health endpoints
        .route("/healthz", get(health_handler))
        .route("/livez", get(live_handler))
        .route("/readyz", get(ready_handler))
        // Metrics and stats
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        // Campaign operations
        .route("/campaigns/:id", get(campaign_handler))
        .route("/campaigns/:id/pause", post(pause_handler))
        .route("/campaigns/:id/resume", post(resume_handler))
        .route("/campaigns/:id/requeue", post(requeue_handler))
        .with_state(state)
}

/// HTTP server for webhooks, health and campaign operations.
pub struct ApiServer {
    address: SocketAddr,
    state: Arc<ApiState>,
    shutdown: Arc<Shutdown>,
}

impl ApiServer {
    pub fn new(address: SocketAddr, state: Arc<ApiState>, shutdown: Arc<Shutdown>) -> Self {
        Self {
            address,
            state,
            shutdown,
        }
    }

    /// Serve until shutdown leaves the running state.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.address).await?;
        info!(address = %self.address, "starting http server");
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let router = router(self.state);
        let mut shutdown_rx = self.shutdown.subscribe();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while *shutdown_rx.borrow_and_update() == ShutdownState::Running {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("http server shutting down");
            })
            .await
    }
}
