//! Shared application state.
//!
//! Contains the core components shared across the process:
//! - Storage (campaigns, memberships, webhook ledger)
//! - Campaign service (lifecycle and enrollment)
//! - Dispatch scheduler (claim and send)
//! - Webhook ingestor (delivery status and replies)
//! - Metrics (Prometheus registry and admin counters)

use std::sync::Arc;

use anyhow::Context;
use axum::http::HeaderName;

use crate::api::ApiState;
use crate::campaign::CampaignService;
use crate::clock::{SharedClock, SystemClock};
use crate::compliance::ComplianceGuard;
use crate::config::Config;
use crate::correlate::{KeywordClassifier, LogInbox, ResponseCorrelator};
use crate::directory::{MemoryDirectory, SharedDirectory};
use crate::dispatch::{create_gateway, AlertSink, DispatchRunner, DispatchScheduler, SharedGateway};
use crate::store::{create_storage, SharedStorage};
use crate::telemetry::Metrics;
use crate::webhook::{SignatureVerifier, WebhookIngestor};

use super::Shutdown;

/// Wired application components.
///
/// All fields are thread-safe and can be cloned cheaply.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: SharedClock,
    pub storage: SharedStorage,
    pub directory: SharedDirectory,
    pub campaigns: Arc<CampaignService>,
    pub scheduler: Arc<DispatchScheduler>,
    pub ingestor: Arc<WebhookIngestor>,
    pub metrics: Arc<Metrics>,
    pub shutdown: Arc<Shutdown>,
}

impl AppState {
    /// Build every component from configuration.
    pub async fn new(config: Arc<Config>, shutdown: Arc<Shutdown>) -> anyhow::Result<Self> {
        let storage = create_storage(&config.store).await?;
        let gateway = create_gateway(&config.gateway)?;
        let directory: SharedDirectory = Arc::new(MemoryDirectory::new());
        let metrics = Metrics::new()?;

        Self::with_parts(config, storage, directory, gateway, Arc::new(SystemClock), metrics, shutdown)
    }

    /// Build from explicit collaborators.
    pub fn with_parts(
        config: Arc<Config>,
        storage: SharedStorage,
        directory: SharedDirectory,
        gateway: SharedGateway,
        clock: SharedClock,
        metrics: Arc<Metrics>,
        shutdown: Arc<Shutdown>,
    ) -> anyhow::Result<Self> {
        let guard = ComplianceGuard::new(&config.compliance).context("compliance rules")?;

        let campaigns = Arc::new(CampaignService::new(
            storage.clone(),
            directory.clone(),
            guard.clone(),
            clock.clone(),
        )?);

        let scheduler = Arc::new(DispatchScheduler::new(
            storage.clone(),
            directory.clone(),
            gateway,
            guard.clone(),
            clock.clone(),
            config.dispatch.clone(),
        ));

        let correlator = Arc::new(ResponseCorrelator::new(
            storage.clone(),
            directory.clone(),
            guard,
            Arc::new(KeywordClassifier::with_defaults().context("sentiment keywords")?),
            Arc::new(LogInbox),
        ));

        let verifier = SignatureVerifier::new(&config.webhook.secret).context("webhook secret")?;
        let ingestor = Arc::new(WebhookIngestor::new(
            storage.clone(),
            correlator,
            verifier,
            clock.clone(),
            metrics.admin_state(),
        )
        .with_unmatched_grace(config.webhook.unmatched_grace));

        Ok(Self {
            config,
            clock,
            storage,
            directory,
            campaigns,
            scheduler,
            ingestor,
            metrics,
            shutdown,
        })
    }

    /// Handler state for the HTTP router.
    pub fn api_state(&self) -> anyhow::Result<Arc<ApiState>> {
        let signature_header = HeaderName::try_from(self.config.webhook.signature_header.as_str())
            .context("webhook signature header")?;

        Ok(Arc::new(ApiState {
            campaigns: self.campaigns.clone(),
            ingestor: self.ingestor.clone(),
            storage: self.storage.clone(),
            metrics: self.metrics.clone(),
            signature_header,
        }))
    }

    /// Interval runner for lifecycle ticks and dispatch passes.
    pub fn runner(&self, alerts: Arc<dyn AlertSink>) -> DispatchRunner {
        DispatchRunner::new(
            self.scheduler.clone(),
            self.campaigns.clone(),
            self.shutdown.clone(),
            alerts,
            self.metrics.admin_state(),
            self.clock.clone(),
            self.config.dispatch.interval,
        )
    }
}
