//! Periodic dispatch loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::bootstrap::{Shutdown, ShutdownState};
use crate::campaign::CampaignService;
use crate::clock::SharedClock;
use crate::telemetry::{counters, AdminState};

use super::{DispatchScheduler, PassReport};

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Operational alert raised on systemic failures.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    /// Component that raised the alert
    pub source: &'static str,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Receives operational alerts.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

/// Writes alerts to the log.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise(&self, alert: Alert) {
        error!(
            severity = ?alert.severity,
            source = alert.source,
            at = %alert.at,
            "{}",
            alert.message
        );
    }
}

/// Keeps alerts in memory.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap().clone()
    }
}

impl AlertSink for MemoryAlertSink {
    fn raise(&self, alert: Alert) {
        self.alerts.lock().unwrap().push(alert);
    }
}

/// Drives lifecycle ticks and dispatch passes on an interval.
pub struct DispatchRunner {
    scheduler: Arc<DispatchScheduler>,
    campaigns: Arc<CampaignService>,
    shutdown: Arc<Shutdown>,
    alerts: Arc<dyn AlertSink>,
    admin: Arc<AdminState>,
    clock: SharedClock,
    interval: Duration,
}

impl DispatchRunner {
    pub fn new(
        scheduler: Arc<DispatchScheduler>,
        campaigns: Arc<CampaignService>,
        shutdown: Arc<Shutdown>,
        alerts: Arc<dyn AlertSink>,
        admin: Arc<AdminState>,
        clock: SharedClock,
        interval: Duration,
    ) -> Self {
        Self {
            scheduler,
            campaigns,
            shutdown,
            alerts,
            admin,
            clock,
            interval,
        }
    }

    /// Run until shutdown.
    pub async fn run(self) {
        info!(interval_secs = self.interval.as_secs(), "dispatch runner started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow_and_update() != ShutdownState::Running {
                        info!("dispatch runner shutting down");
                        break;
                    }
                }

                _ = interval.tick() => {
                    if !self.shutdown.work_started() {
                        break;
                    }
                    self.run_once().await;
                    self.shutdown.work_finished();
                }
            }
        }
    }

    /// One lifecycle tick followed by one dispatch pass.
    ///
    /// Errors are reported through the alert sink and never escape, so the
    /// next interval retries from persisted state.
    pub async fn run_once(&self) -> Option<PassReport> {
        if let Err(e) = self.campaigns.tick().await {
            self.systemic_failure("campaign lifecycle", e.to_string());
            return None;
        }

        match self.scheduler.run_pass().await {
            Ok(report) => {
                self.admin.set_storage_health(true);
                for _ in 0..report.sent {
                    self.admin.inc_sent();
                }
                for _ in 0..report.failed {
                    self.admin.inc_failed();
                }
                Some(report)
            }
            Err(e) => {
                counters::pass_error();
                self.systemic_failure("dispatch", e.to_string());
                None
            }
        }
    }

    fn systemic_failure(&self, source: &'static str, message: String) {
        self.admin.set_storage_health(false);
        error!(source, error = %message, "dispatch pass aborted");
        self.alerts.raise(Alert {
            severity: AlertSeverity::Critical,
            source,
            message,
            at: self.clock.now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::compliance::ComplianceGuard;
    use crate::config::{ComplianceConfig, DispatchConfig};
    use crate::directory::MemoryDirectory;
    use crate::dispatch::MockGateway;
    use crate::store::{
        Campaign, CampaignId, CampaignStatus, CampaignUpdate, Cas, ContactId, Membership,
        MembershipId, MembershipStatus, MembershipUpdate, StoreError, StoreResult, StoreStats,
        Storage, WebhookEvent,
    };
    use chrono::TimeZone;

    /// Store whose every call fails.
    struct DownStorage;

    fn down<T>() -> StoreResult<T> {
        Err(StoreError::Unavailable("disk gone".into()))
    }

    impl Storage for DownStorage {
        fn create_campaign(&self, _: Campaign) -> StoreResult<CampaignId> { down() }
        fn get_campaign(&self, _: CampaignId) -> StoreResult<Option<Campaign>> { down() }
        fn update_campaign(&self, _: CampaignId, _: CampaignUpdate) -> StoreResult<Cas<Campaign>> { down() }
        fn list_campaigns(&self, _: Option<CampaignStatus>) -> StoreResult<Vec<Campaign>> { down() }
        fn insert_memberships(&self, _: Vec<Membership>) -> StoreResult<usize> { down() }
        fn get_membership(&self, _: MembershipId) -> StoreResult<Option<Membership>> { down() }
        fn campaign_memberships(&self, _: CampaignId, _: Option<MembershipStatus>) -> StoreResult<Vec<Membership>> { down() }
        fn contact_memberships(&self, _: ContactId) -> StoreResult<Vec<Membership>> { down() }
        fn memberships_with_status(&self, _: MembershipStatus) -> StoreResult<Vec<Membership>> { down() }
        fn find_by_provider_id(&self, _: &str) -> StoreResult<Option<Membership>> { down() }
        fn claim_pending(&self, _: CampaignId, _: DateTime<Utc>, _: DateTime<Utc>, _: u32, _: usize) -> StoreResult<Vec<Membership>> { down() }
        fn transition_membership(&self, _: MembershipId, _: &[MembershipStatus], _: MembershipUpdate) -> StoreResult<Cas<Membership>> { down() }
        fn record_event(&self, _: WebhookEvent) -> StoreResult<WebhookEvent> { down() }
        fn get_event(&self, _: &str) -> StoreResult<Option<WebhookEvent>> { down() }
        fn begin_event(&self, _: &str) -> StoreResult<bool> { down() }
        fn finish_event(&self, _: &str, _: DateTime<Utc>) -> StoreResult<()> { down() }
        fn release_event(&self, _: &str) -> StoreResult<()> { down() }
        fn release_interrupted_events(&self) -> StoreResult<usize> { down() }
        fn stats(&self) -> StoreResult<StoreStats> { down() }
    }

    #[tokio::test]
    async fn test_storage_failure_raises_alert() {
        let storage = Arc::new(DownStorage);
        let directory = Arc::new(MemoryDirectory::new());
        let clock: SharedClock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
        ));
        let guard = ComplianceGuard::new(&ComplianceConfig::default()).unwrap();

        let scheduler = Arc::new(DispatchScheduler::new(
            storage.clone(),
            directory.clone(),
            Arc::new(MockGateway::success()),
            guard.clone(),
            clock.clone(),
            DispatchConfig::default(),
        ));
        let campaigns = Arc::new(
            CampaignService::new(storage, directory, guard, clock.clone()).unwrap(),
        );
        let alerts = Arc::new(MemoryAlertSink::new());
        let admin = Arc::new(AdminState::new());
        admin.set_ready(true);

        let runner = DispatchRunner::new(
            scheduler,
            campaigns,
            Shutdown::new(Duration::from_secs(1)),
            alerts.clone(),
            admin.clone(),
            clock,
            Duration::from_secs(30),
        );

        assert!(runner.run_once().await.is_none());
        let raised = alerts.alerts();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].severity, AlertSeverity::Critical);
        assert!(raised[0].message.contains("disk gone"));
        assert!(!admin.is_ready());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let storage = Arc::new(crate::store::MemoryStorage::new());
        let directory = Arc::new(MemoryDirectory::new());
        let clock: SharedClock = Arc::new(crate::clock::SystemClock);
        let guard = ComplianceGuard::new(&ComplianceConfig::default()).unwrap();
        let scheduler = Arc::new(DispatchScheduler::new(
            storage.clone(),
            directory.clone(),
            Arc::new(MockGateway::success()),
            guard.clone(),
            clock.clone(),
            DispatchConfig::default(),
        ));
        let campaigns = Arc::new(CampaignService::new(storage, directory, guard, clock.clone()).unwrap());
        let shutdown = Shutdown::new(Duration::from_secs(1));

        let runner = DispatchRunner::new(
            scheduler,
            campaigns,
            shutdown.clone(),
            Arc::new(LogAlertSink),
            Arc::new(AdminState::new()),
            clock,
            Duration::from_millis(10),
        );
        let handle = tokio::spawn(runner.run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.start_drain();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("runner did not stop")
            .unwrap();
    }
}
