//! Storage for campaign state.
//!
//! All persistent state is managed through the [`Storage`] trait:
//! - **Campaigns**: definitions, lifecycle status and counters
//! - **Memberships**: one record per (campaign, contact) send lifecycle
//! - **Webhook events**: the idempotency ledger for provider callbacks
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────┐
//! │                     Storage                        │
//! │  ┌───────────┐  ┌─────────────┐  ┌──────────────┐ │
//! │  │ Campaigns │  │ Memberships │  │ WebhookEvents│ │
//! │  └───────────┘  └─────────────┘  └──────────────┘ │
//! └───────────────────────────────────────────────────┘
//!                         │
//!               ┌─────────┴─────────┐
//!               ▼                   ▼
//!         ┌──────────┐        ┌──────────┐
//!         │  Memory  │        │  Fjall   │
//!         │  (dev)   │        │  (prod)  │
//!         └──────────┘        └──────────┘
//! ```
//!
//! Coordination between workers happens only through conditional updates:
//! [`Storage::claim_pending`] counts and claims in one critical section, and
//! [`Storage::transition_membership`] applies a mutation only while the
//! record is still in one of the expected states.

mod factory;
mod memory;
mod persistent;
pub mod types;

pub use factory::create_storage;
pub use memory::MemoryStorage;
pub use persistent::PersistentStorage;
pub use types::*;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<fjall::Error> for StoreError {
    fn from(e: fjall::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Mutation applied to a membership inside a conditional update.
pub type MembershipUpdate = Box<dyn FnOnce(&mut Membership) + Send>;

/// Mutation applied to a campaign; returning `false` discards the change.
pub type CampaignUpdate = Box<dyn FnOnce(&mut Campaign) -> bool + Send>;

// =============================================================================
// Storage Trait
// =============================================================================

/// Storage trait for campaigns, memberships and webhook events.
///
/// All implementations must be thread-safe (Send + Sync).
pub trait Storage: Send + Sync {
    // -------------------------------------------------------------------------
    // Campaign Operations
    // -------------------------------------------------------------------------

    /// Store a new campaign.
    fn create_campaign(&self, campaign: Campaign) -> StoreResult<CampaignId>;

    /// Get a campaign by ID.
    fn get_campaign(&self, id: CampaignId) -> StoreResult<Option<Campaign>>;

    /// Conditionally update a campaign. The closure decides whether to commit.
    fn update_campaign(&self, id: CampaignId, f: CampaignUpdate) -> StoreResult<Cas<Campaign>>;

    /// List campaigns, optionally filtered by status.
    fn list_campaigns(&self, status: Option<CampaignStatus>) -> StoreResult<Vec<Campaign>>;

    // -------------------------------------------------------------------------
    // Membership Operations
    // -------------------------------------------------------------------------

    /// Insert memberships, skipping any (campaign, contact) pair that already
    /// exists. Returns the number inserted.
    fn insert_memberships(&self, memberships: Vec<Membership>) -> StoreResult<usize>;

    /// Get a membership by ID.
    fn get_membership(&self, id: MembershipId) -> StoreResult<Option<Membership>>;

    /// All memberships of a campaign, optionally filtered by status.
    fn campaign_memberships(
        &self,
        campaign: CampaignId,
        status: Option<MembershipStatus>,
    ) -> StoreResult<Vec<Membership>>;

    /// All memberships of a contact across campaigns.
    fn contact_memberships(&self, contact: ContactId) -> StoreResult<Vec<Membership>>;

    /// All memberships in a given status across campaigns.
    fn memberships_with_status(&self, status: MembershipStatus) -> StoreResult<Vec<Membership>>;

    /// Find the membership a provider message ID was issued for.
    fn find_by_provider_id(&self, provider_message_id: &str) -> StoreResult<Option<Membership>>;

    /// Atomically claim claimable pending memberships of a campaign.
    ///
    /// The allowance is `daily_limit` minus claims logged at or after
    /// `day_start` (see `Membership::claims_since`); at most `min(allowance, max)` are
    /// claimed, oldest first. Counting and claiming happen in one step so
    /// concurrent callers can never jointly exceed the limit.
    fn claim_pending(
        &self,
        campaign: CampaignId,
        day_start: DateTime<Utc>,
        now: DateTime<Utc>,
        daily_limit: u32,
        max: usize,
    ) -> StoreResult<Vec<Membership>>;

    /// Apply `f` only if the membership is currently in one of `expected`.
    fn transition_membership(
        &self,
        id: MembershipId,
        expected: &[MembershipStatus],
        f: MembershipUpdate,
    ) -> StoreResult<Cas<Membership>>;

    /// Claims of a campaign counted against the limit since `since`.
    fn claimed_since(&self, campaign: CampaignId, since: DateTime<Utc>) -> StoreResult<u64> {
        Ok(self
            .campaign_memberships(campaign, None)?
            .iter()
            .map(|m| m.claims_since(since))
            .sum::<usize>() as u64)
    }

    /// Membership counts by status for one campaign.
    fn membership_stats(&self, campaign: CampaignId) -> StoreResult<MembershipStats> {
        let mut stats = MembershipStats::default();
        for m in self.campaign_memberships(campaign, None)? {
            stats.add(m.status);
        }
        Ok(stats)
    }

    /// Most recent send to a contact across all campaigns.
    fn last_sent_at(&self, contact: ContactId) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .contact_memberships(contact)?
            .iter()
            .filter_map(|m| m.sent_at)
            .max())
    }

    // -------------------------------------------------------------------------
    // Webhook Event Operations
    // -------------------------------------------------------------------------

    /// Persist an event if its external ID is new.
    ///
    /// Returns the stored event. For a known ID the delivery count is bumped
    /// and the existing record is returned with its current status.
    fn record_event(&self, event: WebhookEvent) -> StoreResult<WebhookEvent>;

    /// Get an event by external ID.
    fn get_event(&self, external_id: &str) -> StoreResult<Option<WebhookEvent>>;

    /// Move an event from `Received` to `Processing`. Returns false if another
    /// worker holds it or it is already processed.
    fn begin_event(&self, external_id: &str) -> StoreResult<bool>;

    /// Mark an event processed. Processed events are immutable.
    fn finish_event(&self, external_id: &str, at: DateTime<Utc>) -> StoreResult<()>;

    /// Return a `Processing` event to `Received` after a failed attempt.
    fn release_event(&self, external_id: &str) -> StoreResult<()>;

    /// Return every `Processing` event to `Received`. Run at startup, before
    /// any worker can hold an event, to recover work interrupted by a crash.
    fn release_interrupted_events(&self) -> StoreResult<usize>;

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Store-wide statistics.
    fn stats(&self) -> StoreResult<StoreStats>;

    /// Flush pending writes to disk (no-op for in-memory).
    fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Shared storage handle.
pub type SharedStorage = Arc<dyn Storage>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_status_terminal() {
        assert!(!MembershipStatus::Pending.is_terminal());
        assert!(!MembershipStatus::Claimed.is_terminal());
        assert!(!MembershipStatus::Sent.is_terminal());
        assert!(MembershipStatus::Delivered.is_terminal());
        assert!(MembershipStatus::Failed.is_terminal());
        assert!(MembershipStatus::OptedOut.is_terminal());
    }

    #[test]
    fn test_membership_status_name() {
        assert_eq!(MembershipStatus::Pending.name(), "pending");
        assert_eq!(MembershipStatus::Claimed.name(), "claimed");
        assert_eq!(MembershipStatus::OptedOut.name(), "opted_out");
    }

    #[test]
    fn test_campaign_transitions() {
        use CampaignStatus::*;
        assert!(Draft.can_transition_to(Active));
        assert!(Draft.can_transition_to(Scheduled));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Draft.can_transition_to(Completed));
        assert!(!Active.can_transition_to(Draft));
    }

    #[test]
    fn test_template_for_variant() {
        let c = Campaign::new("c", "A text", 10);
        assert_eq!(c.template_for(Variant::B), "A text");

        let c = c.with_ab_test("B text", 50);
        assert_eq!(c.template_for(Variant::A), "A text");
        assert_eq!(c.template_for(Variant::B), "B text");
    }

    #[test]
    fn test_membership_defer_releases_claim() {
        let now = Utc::now();
        let mut m = Membership::new(
            CampaignId::new(),
            ContactId::from_u64(1),
            Variant::A,
            "+15550001",
            "hi",
            now,
        );
        m.mark_claimed(now);
        assert_eq!(m.status, MembershipStatus::Claimed);

        let later = now + chrono::Duration::hours(11);
        m.defer(later);
        assert_eq!(m.status, MembershipStatus::Pending);
        assert!(m.claimed_at.is_none());
        assert!(!m.is_claimable(now));
        assert!(m.is_claimable(later));
    }

    #[test]
    fn test_claim_log_survives_requeue_of_attempted_send() {
        let now = Utc::now();
        let mut m = Membership::new(CampaignId::new(), ContactId::from_u64(1), Variant::A, "+15550001", "hi", now);

        m.mark_claimed(now);
        m.attempts = 1;
        m.mark_failed("gateway timeout", now);
        m.requeue();
        assert_eq!(m.status, MembershipStatus::Pending);
        assert_eq!(m.claims_since(now), 1);

        // An opt-out after requeue releases nothing; the earlier hand-off stands.
        let mut opted = m.clone();
        opted.mark_opted_out();
        assert_eq!(opted.claims_since(now), 1);

        // A second claim the same day counts again.
        m.mark_claimed(now);
        assert_eq!(m.claims_since(now), 2);

        // Never attempted: recovery gives the slot back.
        m.requeue();
        assert_eq!(m.claims_since(now), 1);
    }

    #[test]
    fn test_claim_log_drops_entries_older_than_two_days() {
        let start = Utc::now();
        let mut m = Membership::new(CampaignId::new(), ContactId::from_u64(1), Variant::A, "+15550001", "hi", start);
        m.mark_claimed(start);
        m.attempts = 1;
        m.mark_failed("rejected", start);
        m.requeue();

        m.mark_claimed(start + chrono::Duration::days(3));
        assert_eq!(m.claim_log.len(), 1);
    }

    #[test]
    fn test_membership_stats_outstanding() {
        let mut stats = MembershipStats::default();
        stats.add(MembershipStatus::Pending);
        stats.add(MembershipStatus::Claimed);
        stats.add(MembershipStatus::Sent);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.outstanding(), 2);
    }
}
