//! Claim-and-send passes over active campaigns.

use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::clock::SharedClock;
use crate::compliance::{BusinessHours, ComplianceGuard, SendCheck};
use crate::config::DispatchConfig;
use crate::directory::SharedDirectory;
use crate::store::{Campaign, CampaignStatus, Membership, MembershipStatus, SharedStorage};
use crate::telemetry::counters;

use super::{DispatchError, GatewayError, RetryPolicy, SendRequest, SharedGateway};

const CLAIMED: &[MembershipStatus] = &[MembershipStatus::Claimed];

/// Tallies for one scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub campaigns: usize,
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    /// Returned to the queue until the next business-hours window
    pub deferred: usize,
    pub opted_out: usize,
    /// Returned to the queue because the campaign stopped being active
    pub released: usize,
    /// Claims dropped because the contact vanished or the record moved on
    pub skipped: usize,
    /// Stale claims recovered at the start of the pass
    pub recovered: usize,
}

impl PassReport {
    fn record(&mut self, outcome: UnitOutcome) {
        match outcome {
            UnitOutcome::Sent => self.sent += 1,
            UnitOutcome::Failed => self.failed += 1,
            UnitOutcome::Deferred => self.deferred += 1,
            UnitOutcome::OptedOut => self.opted_out += 1,
            UnitOutcome::Released => self.released += 1,
            UnitOutcome::Skipped => self.skipped += 1,
        }
    }

    fn merge(&mut self, other: PassReport) {
        self.campaigns += other.campaigns;
        self.claimed += other.claimed;
        self.sent += other.sent;
        self.failed += other.failed;
        self.deferred += other.deferred;
        self.opted_out += other.opted_out;
        self.released += other.released;
        self.skipped += other.skipped;
        self.recovered += other.recovered;
    }

    pub fn is_idle(&self) -> bool {
        self.claimed == 0 && self.recovered == 0
    }
}

/// Result of stale-claim recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Never attempted; back to pending
    pub requeued: usize,
    /// Attempt in flight when abandoned; failed for manual requeue
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitOutcome {
    Sent,
    Failed,
    Deferred,
    OptedOut,
    Released,
    Skipped,
}

/// Claims pending memberships and hands them to the send gateway.
///
/// Every membership moves through conditional transitions only, so several
/// schedulers may share one store.
pub struct DispatchScheduler {
    storage: SharedStorage,
    directory: SharedDirectory,
    gateway: SharedGateway,
    guard: ComplianceGuard,
    clock: SharedClock,
    retry: RetryPolicy,
    config: DispatchConfig,
}

impl DispatchScheduler {
    pub fn new(
        storage: SharedStorage,
        directory: SharedDirectory,
        gateway: SharedGateway,
        guard: ComplianceGuard,
        clock: SharedClock,
        config: DispatchConfig,
    ) -> Self {
        Self {
            retry: RetryPolicy::from(&config.retry),
            storage,
            directory,
            gateway,
            guard,
            clock,
            config,
        }
    }

    /// Recover stale claims, then dispatch every active campaign.
    ///
    /// A systemic error aborts the pass. Units already finished keep their
    /// state; unfinished claims are picked up by stale-claim recovery.
    pub async fn run_pass(&self) -> Result<PassReport, DispatchError> {
        let mut report = PassReport::default();

        let stale_age = crate::compliance::chrono_duration(self.config.stale_claim_age);
        let recovery = self.recover_stale_claims(self.clock.now() - stale_age)?;
        report.recovered = recovery.requeued + recovery.failed;

        for campaign in self.storage.list_campaigns(Some(CampaignStatus::Active))? {
            let campaign_report = self.dispatch_campaign(&campaign).await?;
            report.merge(campaign_report);
        }

        if !report.is_idle() {
            info!(
                campaigns = report.campaigns,
                claimed = report.claimed,
                sent = report.sent,
                failed = report.failed,
                deferred = report.deferred,
                opted_out = report.opted_out,
                released = report.released,
                skipped = report.skipped,
                recovered = report.recovered,
                "dispatch pass complete"
            );
        }
        Ok(report)
    }

    /// Claim and process one batch for a single campaign.
    #[instrument(skip_all, fields(campaign_id = %campaign.id))]
    pub async fn dispatch_campaign(&self, campaign: &Campaign) -> Result<PassReport, DispatchError> {
        let mut report = PassReport {
            campaigns: 1,
            ..Default::default()
        };

        let hours = self.guard.business_hours(campaign)?;
        let now = self.clock.now();
        let day_start = start_of_day(hours.timezone(), now);

        let claims = self.storage.claim_pending(
            campaign.id,
            day_start,
            now,
            campaign.daily_limit,
            self.config.batch_size,
        )?;
        if claims.is_empty() {
            return Ok(report);
        }

        report.claimed = claims.len();
        counters::claimed(claims.len() as u64);
        debug!(claimed = claims.len(), "memberships claimed");

        let mut units = stream::iter(claims)
            .map(|m| self.process_unit(campaign, &hours, m))
            .buffer_unordered(self.config.concurrency.max(1));

        while let Some(outcome) = units.next().await {
            report.record(outcome?);
        }

        if report.deferred > 0 {
            counters::deferred(report.deferred as u64);
        }
        Ok(report)
    }

    /// Release claims older than `older_than`.
    ///
    /// A claim with no attempt recorded never reached the gateway and goes
    /// back to pending. One with an attempt may have been accepted by the
    /// provider, so it is failed rather than risk a duplicate send.
    pub fn recover_stale_claims(&self, older_than: DateTime<Utc>) -> Result<RecoveryReport, DispatchError> {
        let mut report = RecoveryReport::default();
        let now = self.clock.now();

        for m in self.storage.memberships_with_status(MembershipStatus::Claimed)? {
            if m.claimed_at.map_or(true, |t| t >= older_than) {
                continue;
            }

            let attempted = m.attempts > 0;
            let result = self.storage.transition_membership(
                m.id,
                CLAIMED,
                Box::new(move |m| {
                    if m.attempts > 0 {
                        m.mark_failed("claim abandoned during send", now);
                    } else {
                        m.requeue();
                    }
                }),
            )?;

            if result.is_applied() {
                if attempted {
                    report.failed += 1;
                    warn!(membership_id = %m.id, campaign_id = %m.campaign_id, "stale claim failed");
                } else {
                    report.requeued += 1;
                    debug!(membership_id = %m.id, campaign_id = %m.campaign_id, "stale claim requeued");
                }
            }
        }

        if report.requeued + report.failed > 0 {
            info!(requeued = report.requeued, failed = report.failed, "stale claims recovered");
        }
        Ok(report)
    }

    /// Re-check compliance for one claim and send it.
    async fn process_unit(
        &self,
        campaign: &Campaign,
        hours: &BusinessHours,
        membership: Membership,
    ) -> Result<UnitOutcome, DispatchError> {
        let id = membership.id;

        let Some(contact) = self.directory.get(membership.contact_id).await? else {
            let now = self.clock.now();
            self.storage.transition_membership(
                id,
                CLAIMED,
                Box::new(move |m| m.mark_failed("contact not found", now)),
            )?;
            warn!(membership_id = %id, contact_id = %membership.contact_id, "contact missing at send time");
            return Ok(UnitOutcome::Skipped);
        };

        let now = self.clock.now();
        match self.guard.check_send(contact.opted_out, hours, now) {
            SendCheck::OptedOut => {
                self.storage
                    .transition_membership(id, CLAIMED, Box::new(|m| m.mark_opted_out()))?;
                counters::opt_out("send_check");
                debug!(membership_id = %id, "contact opted out before send");
                Ok(UnitOutcome::OptedOut)
            }
            SendCheck::OutsideHours { resume_at } => {
                self.storage
                    .transition_membership(id, CLAIMED, Box::new(move |m| m.defer(resume_at)))?;
                debug!(membership_id = %id, resume_at = %resume_at, "outside business hours, deferred");
                Ok(UnitOutcome::Deferred)
            }
            SendCheck::Allowed => {
                if !self.still_active(campaign)? {
                    self.storage
                        .transition_membership(id, CLAIMED, Box::new(|m| m.unclaim()))?;
                    debug!(membership_id = %id, "campaign no longer active, claim released");
                    return Ok(UnitOutcome::Released);
                }
                self.send(campaign, membership).await
            }
        }
    }

    /// Re-read the campaign; a pause or cancel can land mid-pass.
    fn still_active(&self, campaign: &Campaign) -> Result<bool, DispatchError> {
        Ok(self
            .storage
            .get_campaign(campaign.id)?
            .is_some_and(|c| c.status == CampaignStatus::Active))
    }

    /// Send with retries, persisting state after every attempt.
    async fn send(&self, campaign: &Campaign, membership: Membership) -> Result<UnitOutcome, DispatchError> {
        let id = membership.id;
        let request = SendRequest {
            destination: membership.destination.clone(),
            body: membership.personalized_message.clone(),
            source: campaign
                .source_number
                .clone()
                .unwrap_or_else(|| self.config.source_number.clone()),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let recorded = self.storage.transition_membership(
                id,
                CLAIMED,
                Box::new(move |m| m.attempts = attempt),
            )?;
            if !recorded.is_applied() {
                debug!(membership_id = %id, "claim no longer held, skipping");
                return Ok(UnitOutcome::Skipped);
            }

            let started = Instant::now();
            let result = match tokio::time::timeout(self.config.send_timeout, self.gateway.send(&request)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::Timeout),
            };
            counters::gateway_latency(started.elapsed().as_secs_f64());

            let now = self.clock.now();
            match result {
                Ok(provider_id) => {
                    let pid = provider_id.clone();
                    self.storage
                        .transition_membership(id, CLAIMED, Box::new(move |m| m.mark_sent(pid, now)))?;
                    self.storage.update_campaign(
                        campaign.id,
                        Box::new(move |c| {
                            c.counters.sent += 1;
                            c.updated_at = now;
                            true
                        }),
                    )?;
                    counters::send_succeeded();
                    debug!(membership_id = %id, provider_id = %provider_id, attempt, "sent");
                    return Ok(UnitOutcome::Sent);
                }
                Err(e) if self.retry.should_retry(attempt, &e) => {
                    let message = e.to_string();
                    self.storage.transition_membership(
                        id,
                        CLAIMED,
                        Box::new(move |m| m.last_error = Some(message)),
                    )?;
                    let delay = self.retry.backoff(attempt);
                    debug!(membership_id = %id, attempt, error = %e, delay_ms = delay.as_millis() as u64, "send failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let message = e.to_string();
                    self.storage
                        .transition_membership(id, CLAIMED, Box::new(move |m| m.mark_failed(message, now)))?;
                    self.storage.update_campaign(
                        campaign.id,
                        Box::new(move |c| {
                            c.counters.failed += 1;
                            c.updated_at = now;
                            true
                        }),
                    )?;
                    counters::send_failed(e.kind());
                    warn!(membership_id = %id, attempt, error = %e, "send failed");
                    return Ok(UnitOutcome::Failed);
                }
            }
        }
    }
}

/// Local midnight of `now` in `tz`, as UTC.
fn start_of_day(tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let date = now.with_timezone(&tz).date_naive();
    date.and_hms_opt(0, 0, 0)
        .and_then(|midnight| tz.from_local_datetime(&midnight).earliest())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|| {
            // Midnight skipped by a DST change; the first valid hour opens the day.
            date.and_hms_opt(1, 0, 0)
                .and_then(|t| tz.from_local_datetime(&t).earliest())
                .map_or(now, |t| t.with_timezone(&Utc))
        })
}
