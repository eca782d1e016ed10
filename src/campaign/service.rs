//! Campaign lifecycle and enrollment.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::compliance::ComplianceGuard;
use crate::directory::SharedDirectory;
use crate::store::{
    Campaign, CampaignId, CampaignKind, CampaignStatus, Cas, Membership, MembershipStatus,
    SharedStorage, Variant,
};

use super::{validate, CampaignError, ListBuilder, Personalizer, VariantAssigner};

/// Outcome of one enrollment run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrollReport {
    pub campaign_id: Option<CampaignId>,
    /// Contacts that passed every list rule
    pub eligible: usize,
    /// Eligible contacts that were already members
    pub already_members: usize,
    pub inserted: usize,
    pub variant_a: usize,
    pub variant_b: usize,
    /// Messages cut to the segment limit
    pub truncated: usize,
    pub excluded_opted_out: usize,
    pub excluded_frequency: usize,
    pub excluded_tagged: usize,
}

/// Lifecycle changes applied by one [`CampaignService::tick`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct LifecycleReport {
    pub activated: Vec<CampaignId>,
    pub reenrolled: Vec<CampaignId>,
    pub completed: Vec<CampaignId>,
}

/// Creates campaigns, moves them through their lifecycle and enrolls
/// recipients.
pub struct CampaignService {
    storage: SharedStorage,
    clock: SharedClock,
    lists: ListBuilder,
    personalizer: Personalizer,
    rng: Mutex<StdRng>,
}

impl CampaignService {
    pub fn new(
        storage: SharedStorage,
        directory: SharedDirectory,
        guard: ComplianceGuard,
        clock: SharedClock,
    ) -> Result<Self, CampaignError> {
        Ok(Self {
            lists: ListBuilder::new(directory, storage.clone(), guard),
            storage,
            clock,
            personalizer: Personalizer::new()?,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Use a fixed seed for variant draws.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock().unwrap() = StdRng::seed_from_u64(seed);
        self
    }

    /// Validate and store a new campaign.
    pub fn create(&self, campaign: Campaign) -> Result<CampaignId, CampaignError> {
        validate(&campaign)?;
        let id = self.storage.create_campaign(campaign)?;
        info!(campaign_id = %id, "campaign created");
        Ok(id)
    }

    pub fn get(&self, id: CampaignId) -> Result<Campaign, CampaignError> {
        self.storage
            .get_campaign(id)?
            .ok_or(CampaignError::NotFound(id))
    }

    /// Move a campaign to a new status.
    pub fn transition(&self, id: CampaignId, to: CampaignStatus) -> Result<Campaign, CampaignError> {
        let now = self.clock.now();
        let result = self.storage.update_campaign(
            id,
            Box::new(move |c| {
                if !c.status.can_transition_to(to) {
                    return false;
                }
                c.status = to;
                c.updated_at = now;
                true
            }),
        )?;

        match result {
            Cas::Applied(c) => {
                info!(campaign_id = %id, status = to.name(), "campaign status changed");
                Ok(c)
            }
            Cas::Rejected(c) => Err(CampaignError::InvalidTransition { from: c.status, to }),
            Cas::Missing => Err(CampaignError::NotFound(id)),
        }
    }

    /// Activate a draft or scheduled campaign and enroll its list.
    pub async fn launch(&self, id: CampaignId) -> Result<EnrollReport, CampaignError> {
        let campaign = self.transition(id, CampaignStatus::Active)?;
        let report = self.enroll(id).await?;
        if campaign.kind == CampaignKind::Recurring {
            self.schedule_next_run(&campaign, self.clock.now())?;
        }
        Ok(report)
    }

    /// Stop new claims. Sends already handed to the gateway are unaffected.
    pub fn pause(&self, id: CampaignId) -> Result<Campaign, CampaignError> {
        self.transition(id, CampaignStatus::Paused)
    }

    pub fn resume(&self, id: CampaignId) -> Result<Campaign, CampaignError> {
        self.transition(id, CampaignStatus::Active)
    }

    /// Enroll eligible contacts that are not yet members.
    ///
    /// Existing memberships are never touched, so their variants stay as
    /// assigned. The variant-B floor only applies while nothing has been sent.
    pub async fn enroll(&self, id: CampaignId) -> Result<EnrollReport, CampaignError> {
        let campaign = self.get(id)?;
        if campaign.status == CampaignStatus::Completed {
            return Err(CampaignError::InvalidTransition {
                from: CampaignStatus::Completed,
                to: CampaignStatus::Active,
            });
        }

        let now = self.clock.now();
        let built = self.lists.build(&campaign.list, now).await?;

        let existing = self.storage.campaign_memberships(id, None)?;
        let members: HashSet<_> = existing.iter().map(|m| m.contact_id).collect();
        let any_sent = existing.iter().any(|m| {
            m.sent_at.is_some()
                || matches!(
                    m.status,
                    MembershipStatus::Claimed | MembershipStatus::Sent | MembershipStatus::Failed
                )
        }) || campaign.counters.sent > 0;

        let mut report = EnrollReport {
            campaign_id: Some(id),
            eligible: built.contacts.len(),
            excluded_opted_out: built.excluded_opted_out,
            excluded_frequency: built.excluded_frequency,
            excluded_tagged: built.excluded_tagged,
            ..Default::default()
        };

        let fresh: Vec<_> = built
            .contacts
            .into_iter()
            .filter(|c| !members.contains(&c.id))
            .collect();
        report.already_members = report.eligible - fresh.len();

        let has_b = campaign.kind == CampaignKind::AbTest && campaign.template_b.is_some();
        let mut assigner = VariantAssigner::new(campaign.ab_split_percent, has_b);
        if any_sent {
            assigner = assigner.without_floor();
        }

        let ids: Vec<_> = fresh.iter().map(|c| c.id).collect();
        let variants = {
            let mut rng = self.rng.lock().unwrap();
            assigner.assign(&ids, &mut *rng)
        };

        let mut memberships = Vec::with_capacity(fresh.len());
        for (contact, (_, variant)) in fresh.iter().zip(variants) {
            let rendered = self
                .personalizer
                .render(campaign.template_for(variant), contact);
            if rendered.truncated {
                report.truncated += 1;
            }
            match variant {
                Variant::A => report.variant_a += 1,
                Variant::B => report.variant_b += 1,
            }
            memberships.push(Membership::new(
                id,
                contact.id,
                variant,
                contact.phone.clone(),
                rendered.text,
                now,
            ));
        }

        report.inserted = self.storage.insert_memberships(memberships)?;

        info!(
            campaign_id = %id,
            eligible = report.eligible,
            inserted = report.inserted,
            variant_a = report.variant_a,
            variant_b = report.variant_b,
            "campaign enrolled"
        );
        Ok(report)
    }

    /// Put failed memberships back in the queue. Returns how many moved.
    pub fn requeue_failed(&self, id: CampaignId) -> Result<usize, CampaignError> {
        self.get(id)?;
        let mut requeued = 0;
        for m in self.storage.campaign_memberships(id, Some(MembershipStatus::Failed))? {
            let result = self.storage.transition_membership(
                m.id,
                &[MembershipStatus::Failed],
                Box::new(|m| m.requeue()),
            )?;
            if result.is_applied() {
                requeued += 1;
            }
        }
        info!(campaign_id = %id, requeued, "failed memberships requeued");
        Ok(requeued)
    }

    /// Apply time-driven lifecycle changes.
    ///
    /// Scheduled campaigns whose start time has passed are launched, recurring
    /// campaigns whose next run has passed are re-enrolled, and active one-shot
    /// campaigns with nothing left to send are completed.
    pub async fn tick(&self) -> Result<LifecycleReport, CampaignError> {
        let now = self.clock.now();
        let mut report = LifecycleReport::default();

        for c in self.storage.list_campaigns(Some(CampaignStatus::Scheduled))? {
            if c.scheduled_at.is_some_and(|t| t <= now) {
                match self.launch(c.id).await {
                    Ok(_) => report.activated.push(c.id),
                    Err(CampaignError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        for c in self.storage.list_campaigns(Some(CampaignStatus::Active))? {
            match c.kind {
                CampaignKind::Recurring => {
                    if c.next_run_at.is_some_and(|t| t <= now) {
                        self.enroll(c.id).await?;
                        self.schedule_next_run(&c, now)?;
                        report.reenrolled.push(c.id);
                    } else if c.next_run_at.is_none() && self.is_drained(c.id)? {
                        self.complete(c.id, &mut report)?;
                    }
                }
                CampaignKind::Blast | CampaignKind::AbTest => {
                    if self.is_drained(c.id)? {
                        self.complete(c.id, &mut report)?;
                    }
                }
            }
        }

        if !report.activated.is_empty() || !report.completed.is_empty() {
            debug!(
                activated = report.activated.len(),
                reenrolled = report.reenrolled.len(),
                completed = report.completed.len(),
                "lifecycle tick"
            );
        }
        Ok(report)
    }

    /// Enrolled, with nothing pending or claimed.
    fn is_drained(&self, id: CampaignId) -> Result<bool, CampaignError> {
        let stats = self.storage.membership_stats(id)?;
        Ok(stats.total > 0 && stats.outstanding() == 0)
    }

    fn complete(&self, id: CampaignId, report: &mut LifecycleReport) -> Result<(), CampaignError> {
        match self.transition(id, CampaignStatus::Completed) {
            Ok(_) => {
                report.completed.push(id);
                Ok(())
            }
            Err(CampaignError::InvalidTransition { from, .. }) => {
                warn!(campaign_id = %id, status = from.name(), "campaign changed before completion");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn schedule_next_run(&self, campaign: &Campaign, from: DateTime<Utc>) -> Result<(), CampaignError> {
        let next = campaign
            .recurrence
            .as_ref()
            .and_then(|rule| rule.next_from(from));
        self.storage.update_campaign(
            campaign.id,
            Box::new(move |c| {
                c.next_run_at = next;
                true
            }),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{CampaignList, Predicate, RecurrenceRule};
    use crate::clock::{Clock, ManualClock};
    use crate::config::ComplianceConfig;
    use crate::directory::{Contact, MemoryDirectory};
    use crate::store::{MemoryStorage, Storage};
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    struct Fixture {
        service: CampaignService,
        storage: Arc<MemoryStorage>,
        directory: Arc<MemoryDirectory>,
        clock: Arc<ManualClock>,
    }

    fn fixture(contacts: usize) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let directory = Arc::new(MemoryDirectory::with_contacts((1..=contacts as u64).map(|i| {
            Contact::new(i, format!("+1555{i:07}")).with_first_name("Sam")
        })));
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap(),
        ));
        let guard = ComplianceGuard::new(&ComplianceConfig::default()).unwrap();
        let service = CampaignService::new(storage.clone(), directory.clone(), guard, clock.clone())
            .unwrap()
            .with_seed(42);
        Fixture {
            service,
            storage,
            directory,
            clock,
        }
    }

    fn everyone() -> CampaignList {
        CampaignList::filtered(Predicate::All(vec![]))
    }

    #[tokio::test]
    async fn test_launch_enrolls_all_a_without_template_b() {
        let f = fixture(40);
        let id = f
            .service
            .create(Campaign::new("blast", "Hi {first_name}", 100).with_list(everyone()))
            .unwrap();

        let report = f.service.launch(id).await.unwrap();
        assert_eq!(report.inserted, 40);
        assert_eq!(report.variant_b, 0);

        let members = f.storage.campaign_memberships(id, None).unwrap();
        assert!(members.iter().all(|m| m.variant == Variant::A));
        assert!(members.iter().all(|m| m.status == MembershipStatus::Pending));
        assert!(members[0].personalized_message.starts_with("Hi Sam"));
    }

    #[tokio::test]
    async fn test_enroll_is_idempotent() {
        let f = fixture(150);
        let id = f
            .service
            .create(Campaign::new("ab", "A", 200).with_ab_test("B", 20).with_list(everyone()))
            .unwrap();
        f.service.launch(id).await.unwrap();
        let before: Vec<_> = f
            .storage
            .campaign_memberships(id, None)
            .unwrap()
            .into_iter()
            .map(|m| (m.contact_id, m.variant))
            .collect();

        let again = f.service.enroll(id).await.unwrap();
        assert_eq!(again.inserted, 0);
        assert_eq!(again.already_members, 150);

        let after: Vec<_> = f
            .storage
            .campaign_memberships(id, None)
            .unwrap()
            .into_iter()
            .map(|m| (m.contact_id, m.variant))
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_floor_applies_before_sends_only() {
        let f = fixture(120);
        let id = f
            .service
            .create(Campaign::new("ab", "A", 500).with_ab_test("B", 5).with_list(everyone()))
            .unwrap();
        let report = f.service.launch(id).await.unwrap();
        assert_eq!(report.variant_b, 50);

        // Simulate a send, then add contacts: no floor for the new batch.
        let first = f.storage.campaign_memberships(id, None).unwrap()[0].id;
        let now = f.clock.now();
        f.storage
            .transition_membership(first, &[MembershipStatus::Pending], Box::new(move |m| {
                m.mark_claimed(now);
                m.mark_sent("p1", now);
            }))
            .unwrap();
        for i in 200..320u64 {
            f.directory.upsert(Contact::new(i, format!("+1666{i:07}")));
        }
        let report = f.service.enroll(id).await.unwrap();
        assert_eq!(report.inserted, 120);
        assert!(report.variant_b < 50);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let f = fixture(1);
        let id = f.service.create(Campaign::new("c", "A", 10)).unwrap();
        let err = f.service.pause(id).unwrap_err();
        assert!(matches!(
            err,
            CampaignError::InvalidTransition {
                from: CampaignStatus::Draft,
                to: CampaignStatus::Paused
            }
        ));
        assert!(matches!(
            f.service.pause(CampaignId::from_u64(u64::MAX)),
            Err(CampaignError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid() {
        let f = fixture(1);
        let mut c = Campaign::new("ab", "A", 10);
        c.kind = CampaignKind::AbTest;
        assert!(matches!(f.service.create(c), Err(CampaignError::Validation(_))));
    }

    #[tokio::test]
    async fn test_requeue_failed() {
        let f = fixture(3);
        let id = f
            .service
            .create(Campaign::new("c", "A", 10).with_list(everyone()))
            .unwrap();
        f.service.launch(id).await.unwrap();
        let now = f.clock.now();
        for m in f.storage.campaign_memberships(id, None).unwrap().into_iter().take(2) {
            f.storage
                .transition_membership(m.id, &[MembershipStatus::Pending], Box::new(move |m| {
                    m.mark_claimed(now);
                    m.mark_failed("timeout", now);
                }))
                .unwrap();
        }

        assert_eq!(f.service.requeue_failed(id).unwrap(), 2);
        let stats = f.storage.membership_stats(id).unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_tick_activates_scheduled_and_completes_drained() {
        let f = fixture(2);
        let start = f.clock.now() + Duration::hours(1);
        let id = f
            .service
            .create(
                Campaign::new("c", "A", 10)
                    .with_list(everyone())
                    .with_status(CampaignStatus::Scheduled)
                    .scheduled_for(start),
            )
            .unwrap();

        assert!(f.service.tick().await.unwrap().activated.is_empty());
        f.clock.advance(Duration::hours(2));
        let report = f.service.tick().await.unwrap();
        assert_eq!(report.activated, vec![id]);

        let now = f.clock.now();
        for m in f.storage.campaign_memberships(id, None).unwrap() {
            f.storage
                .transition_membership(m.id, &[MembershipStatus::Pending], Box::new(move |m| {
                    m.mark_claimed(now);
                    m.mark_sent("p", now);
                }))
                .unwrap();
        }
        let report = f.service.tick().await.unwrap();
        assert_eq!(report.completed, vec![id]);
        assert_eq!(f.service.get(id).unwrap().status, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn test_recurring_reenrolls_new_contacts() {
        let f = fixture(2);
        let id = f
            .service
            .create(
                Campaign::new("r", "A", 10)
                    .with_recurrence(RecurrenceRule::daily(1))
                    .with_list(everyone()),
            )
            .unwrap();
        f.service.launch(id).await.unwrap();
        assert!(f.service.get(id).unwrap().next_run_at.is_some());

        f.directory.upsert(Contact::new(99, "+15559999999"));
        f.clock.advance(Duration::days(1));
        let report = f.service.tick().await.unwrap();
        assert_eq!(report.reenrolled, vec![id]);
        assert_eq!(f.storage.campaign_memberships(id, None).unwrap().len(), 3);
    }
}
