use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, span, warn, Level};

use crate::api::ApiServer;
use crate::config::Config;
use crate::dispatch::LogAlertSink;

use super::shutdown::{wait_for_signal, Shutdown};
use super::state::AppState;

/// Main campaignd server
///
/// Components:
/// - Dispatch runner: lifecycle ticks and dispatch passes on an interval
/// - HTTP server: webhooks, health, metrics and campaign operations
/// - Shutdown: graceful drain with configurable timeout
pub struct Server {
    config: Arc<Config>,
    shutdown: Arc<Shutdown>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let shutdown = Shutdown::new(config.shutdown.drain_timeout);

        Self {
            config: Arc::new(config),
            shutdown,
        }
    }

    /// Run the server until shutdown
    pub async fn run(self) -> Result<()> {
        let span = span!(Level::INFO, "campaignd", version = env!("CARGO_PKG_VERSION"));
        let _enter = span.enter();

        let state = AppState::new(self.config.clone(), self.shutdown.clone()).await?;

        let released = state.storage.release_interrupted_events()?;
        if released > 0 {
            warn!(events = released, "released webhook events interrupted by a previous run");
        }

        let api = ApiServer::new(self.config.server.address, state.api_state()?, self.shutdown.clone());
        let mut http_handle = tokio::spawn(async move {
            if let Err(e) = api.run().await {
                error!(error = %e, "http server failed");
            }
        });

        let runner = state.runner(Arc::new(LogAlertSink));
        let mut runner_handle = tokio::spawn(runner.run());

        let admin = state.metrics.admin_state();
        admin.set_ready(true);

        info!(
            address = %self.config.server.address,
            store = ?self.config.store.backend,
            gateway = ?self.config.gateway.mode,
            interval_secs = self.config.dispatch.interval.as_secs(),
            concurrency = self.config.dispatch.concurrency,
            drain_timeout_secs = self.config.shutdown.drain_timeout.as_secs(),
            "campaignd server started"
        );

        wait_for_signal().await;

        info!("shutdown signal received, starting graceful shutdown");
        admin.set_ready(false);
        self.shutdown.start_drain();
        self.shutdown.wait_drained().await;

        let drain_timeout = self.config.shutdown.drain_timeout;
        let joined = tokio::time::timeout(drain_timeout, async {
            let _ = (&mut runner_handle).await;
            let _ = (&mut http_handle).await;
        })
        .await;

        if joined.is_err() {
            warn!(
                in_flight = self.shutdown.in_flight(),
                "drain timeout reached, forcing shutdown"
            );
            runner_handle.abort();
            http_handle.abort();
        }

        self.shutdown.terminate();

        if let Err(e) = state.storage.flush() {
            error!(error = %e, "failed to flush storage");
        }

        crate::telemetry::shutdown_tracing();

        info!("campaignd server stopped");

        Ok(())
    }

    /// Get shutdown handle
    pub fn shutdown(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }
}
