//! Types for the campaign store.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::campaign::{CampaignList, RecurrenceRule};
use crate::compliance::BusinessHoursWindow;

/// Global campaign ID counter (for recovery).
pub static CAMPAIGN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Global membership ID counter (for recovery).
pub static MEMBERSHIP_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique campaign identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignId(u64);

impl CampaignId {
    /// Allocate a new campaign ID.
    pub fn new() -> Self {
        Self(CAMPAIGN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Create from a raw value (for recovery and lookups).
    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for CampaignId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CampaignId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmp_{}", self.0)
    }
}

/// Accepts both `cmp_42` and `42`.
impl std::str::FromStr for CampaignId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix("cmp_").unwrap_or(s).parse().map(Self)
    }
}

/// Contact identifier, owned by the contact directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(u64);

impl ContactId {
    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ct_{}", self.0)
    }
}

/// Unique membership identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MembershipId(u64);

impl MembershipId {
    /// Allocate a new membership ID.
    pub fn new() -> Self {
        Self(MEMBERSHIP_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for MembershipId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MembershipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem_{}", self.0)
    }
}

// =============================================================================
// Campaign
// =============================================================================

/// Campaign kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignKind {
    /// One message to every eligible contact
    Blast,
    /// Two templates split between contacts
    AbTest,
    /// Re-enrolls newly eligible contacts on a recurrence rule
    Recurring,
}

/// Campaign status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Active,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    /// Check whether a status change is allowed.
    pub fn can_transition_to(&self, next: CampaignStatus) -> bool {
        use CampaignStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Draft, Active)
                | (Scheduled, Active)
                | (Scheduled, Paused)
                | (Active, Paused)
                | (Active, Completed)
                | (Paused, Active)
                | (Paused, Completed)
        )
    }
}

/// Aggregate campaign counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub responses: u64,
    pub opt_outs: u64,
}

/// A campaign definition and its running counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    /// Unique campaign ID
    pub id: CampaignId,
    /// Operator-facing name
    pub name: String,
    /// Campaign kind
    pub kind: CampaignKind,
    /// Primary template
    pub template_a: String,
    /// Alternate template (A/B tests only)
    pub template_b: Option<String>,
    /// Share of contacts that should receive template B (0-100)
    pub ab_split_percent: u8,
    /// Lifecycle status
    pub status: CampaignStatus,
    /// Maximum sends per calendar day
    pub daily_limit: u32,
    /// Sending window; falls back to the configured default when absent
    pub business_hours: Option<BusinessHoursWindow>,
    /// Sender number override
    pub source_number: Option<String>,
    /// Recipient selection
    pub list: CampaignList,
    /// Recurrence (recurring campaigns only)
    pub recurrence: Option<RecurrenceRule>,
    /// Activation time for scheduled campaigns
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Next re-enrollment time for recurring campaigns
    pub next_run_at: Option<DateTime<Utc>>,
    /// Running counters
    pub counters: CampaignCounters,
    /// Contacts whose opt-out is charged to this campaign
    #[serde(default)]
    pub opted_out_contacts: BTreeSet<ContactId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Create a draft blast campaign.
    pub fn new(name: impl Into<String>, template_a: impl Into<String>, daily_limit: u32) -> Self {
        let now = Utc::now();
        Self {
            id: CampaignId::new(),
            name: name.into(),
            kind: CampaignKind::Blast,
            template_a: template_a.into(),
            template_b: None,
            ab_split_percent: 0,
            status: CampaignStatus::Draft,
            daily_limit,
            business_hours: None,
            source_number: None,
            list: CampaignList::default(),
            recurrence: None,
            scheduled_at: None,
            next_run_at: None,
            counters: CampaignCounters::default(),
            opted_out_contacts: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Turn into an A/B test.
    pub fn with_ab_test(mut self, template_b: impl Into<String>, split_percent: u8) -> Self {
        self.kind = CampaignKind::AbTest;
        self.template_b = Some(template_b.into());
        self.ab_split_percent = split_percent;
        self
    }

    /// Set the split without a B template (for validation tests and imports).
    pub fn with_split(mut self, split_percent: u8) -> Self {
        self.ab_split_percent = split_percent;
        self
    }

    /// Turn into a recurring campaign.
    pub fn with_recurrence(mut self, rule: RecurrenceRule) -> Self {
        self.kind = CampaignKind::Recurring;
        self.recurrence = Some(rule);
        self
    }

    pub fn with_list(mut self, list: CampaignList) -> Self {
        self.list = list;
        self
    }

    pub fn with_business_hours(mut self, window: BusinessHoursWindow) -> Self {
        self.business_hours = Some(window);
        self
    }

    pub fn with_source_number(mut self, number: impl Into<String>) -> Self {
        self.source_number = Some(number.into());
        self
    }

    pub fn with_status(mut self, status: CampaignStatus) -> Self {
        self.status = status;
        self
    }

    pub fn scheduled_for(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Charge a contact's opt-out to this campaign. False if already charged.
    pub fn record_opt_out(&mut self, contact: ContactId) -> bool {
        if !self.opted_out_contacts.insert(contact) {
            return false;
        }
        self.counters.opt_outs += 1;
        true
    }

    /// Template for a variant. Variant B without a B template resolves to A.
    pub fn template_for(&self, variant: Variant) -> &str {
        match (variant, self.template_b.as_deref()) {
            (Variant::B, Some(b)) => b,
            _ => &self.template_a,
        }
    }
}

// =============================================================================
// Membership
// =============================================================================

/// A/B message variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    A,
    B,
}

/// Membership send lifecycle.
///
/// `pending → claimed → sent → {delivered | failed}`, with `opted_out`
/// reachable from any state before `sent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by a dispatch pass, not yet confirmed by the gateway
    Claimed,
    /// Accepted by the gateway
    Sent,
    /// Provider confirmed delivery
    Delivered,
    /// Gateway or provider failure
    Failed,
    /// Contact opted out before the send
    OptedOut,
}

impl MembershipStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::OptedOut)
    }

    /// States in which an opt-out can still prevent the send.
    pub fn is_pre_send(&self) -> bool {
        matches!(self, Self::Pending | Self::Claimed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::OptedOut => "opted_out",
        }
    }
}

/// Reply sentiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }
}

/// One contact's lifecycle within one campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub id: MembershipId,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    /// Assigned once, never changed
    pub variant: Variant,
    pub status: MembershipStatus,
    /// Destination number captured at enrollment
    pub destination: String,
    /// Rendered message body
    pub personalized_message: String,
    pub created_at: DateTime<Utc>,
    /// When the current claim was taken
    pub claimed_at: Option<DateTime<Utc>>,
    /// Claims that count against the daily limit. Requeue keeps them; a
    /// claim released before reaching the gateway is removed.
    #[serde(default)]
    pub claim_log: Vec<DateTime<Utc>>,
    /// Earliest time the membership may be claimed again (business-hours deferral)
    pub not_before: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Provider message ID returned by the gateway
    pub provider_message_id: Option<String>,
    /// Gateway attempts for the current claim
    pub attempts: u32,
    pub last_error: Option<String>,
    pub response_received: bool,
    pub response_at: Option<DateTime<Utc>>,
    pub response_sentiment: Option<Sentiment>,
}

impl Membership {
    /// Create a new pending membership.
    pub fn new(
        campaign_id: CampaignId,
        contact_id: ContactId,
        variant: Variant,
        destination: impl Into<String>,
        personalized_message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MembershipId::new(),
            campaign_id,
            contact_id,
            variant,
            status: MembershipStatus::Pending,
            destination: destination.into(),
            personalized_message: personalized_message.into(),
            created_at,
            claimed_at: None,
            claim_log: Vec::new(),
            not_before: None,
            sent_at: None,
            delivered_at: None,
            failed_at: None,
            provider_message_id: None,
            attempts: 0,
            last_error: None,
            response_received: false,
            response_at: None,
            response_sentiment: None,
        }
    }

    /// Check if the membership can be claimed at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == MembershipStatus::Pending && self.not_before.map_or(true, |t| t <= now)
    }

    /// Mark as claimed.
    pub fn mark_claimed(&mut self, at: DateTime<Utc>) {
        // No calendar day spans more than 25 hours.
        self.claim_log.retain(|t| at - *t < chrono::Duration::hours(48));
        self.claim_log.push(at);
        self.status = MembershipStatus::Claimed;
        self.claimed_at = Some(at);
        self.attempts = 0;
    }

    /// Claims taken at or after `since` that count against the daily limit.
    pub fn claims_since(&self, since: DateTime<Utc>) -> usize {
        self.claim_log.iter().filter(|t| **t >= since).count()
    }

    /// Drop the current claim from the daily count.
    fn release_claim(&mut self) {
        if let Some(at) = self.claimed_at.take() {
            if let Some(pos) = self.claim_log.iter().rposition(|t| *t == at) {
                self.claim_log.remove(pos);
            }
        }
    }

    /// Return a claim that never reached the gateway to the queue.
    pub fn unclaim(&mut self) {
        self.release_claim();
        self.status = MembershipStatus::Pending;
        self.attempts = 0;
    }

    /// Return a claim to the queue until `until`.
    pub fn defer(&mut self, until: DateTime<Utc>) {
        self.unclaim();
        self.not_before = Some(until);
    }

    /// Mark as accepted by the gateway.
    pub fn mark_sent(&mut self, provider_message_id: impl Into<String>, at: DateTime<Utc>) {
        self.status = MembershipStatus::Sent;
        self.provider_message_id = Some(provider_message_id.into());
        self.sent_at = Some(at);
        self.last_error = None;
    }

    /// Mark as delivered.
    pub fn mark_delivered(&mut self, at: DateTime<Utc>) {
        self.status = MembershipStatus::Delivered;
        self.delivered_at = Some(at);
    }

    /// Mark as failed.
    pub fn mark_failed(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = MembershipStatus::Failed;
        self.failed_at = Some(at);
        self.last_error = Some(error.into());
    }

    /// Mark as opted out. Releases the daily allowance held by a claim.
    pub fn mark_opted_out(&mut self) {
        if self.status.is_pre_send() {
            self.release_claim();
        }
        self.status = MembershipStatus::OptedOut;
    }

    /// Put a membership back in the queue. A failed send keeps its place in
    /// the daily count; an unattempted claim gives it back.
    pub fn requeue(&mut self) {
        if self.status == MembershipStatus::Claimed && self.attempts == 0 {
            self.release_claim();
        }
        self.status = MembershipStatus::Pending;
        self.claimed_at = None;
        self.not_before = None;
        self.failed_at = None;
        self.attempts = 0;
    }

    /// Record a reply.
    pub fn record_response(&mut self, at: DateTime<Utc>, sentiment: Sentiment) {
        self.response_received = true;
        self.response_at = Some(at);
        self.response_sentiment = Some(sentiment);
    }
}

/// Membership counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipStats {
    pub total: u64,
    pub pending: u64,
    pub claimed: u64,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub opted_out: u64,
}

impl MembershipStats {
    /// Tally one membership.
    pub fn add(&mut self, status: MembershipStatus) {
        self.total += 1;
        match status {
            MembershipStatus::Pending => self.pending += 1,
            MembershipStatus::Claimed => self.claimed += 1,
            MembershipStatus::Sent => self.sent += 1,
            MembershipStatus::Delivered => self.delivered += 1,
            MembershipStatus::Failed => self.failed += 1,
            MembershipStatus::OptedOut => self.opted_out += 1,
        }
    }

    /// Memberships still waiting on dispatch.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.claimed
    }
}

// =============================================================================
// Webhook events
// =============================================================================

/// Processing state of a webhook event in the idempotency ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Persisted, effects not applied
    Received,
    /// A worker is applying effects
    Processing,
    /// Effects applied; immutable from here on
    Processed,
}

/// A provider event, persisted before any business logic runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Provider-assigned event ID (ledger key)
    pub external_id: String,
    /// Provider event type
    pub event_type: String,
    /// Raw request body
    pub payload: String,
    pub status: EventStatus,
    /// Number of times the provider delivered this event
    pub deliveries: u32,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    pub fn new(
        external_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            event_type: event_type.into(),
            payload: payload.into(),
            status: EventStatus::Received,
            deliveries: 1,
            received_at,
            processed_at: None,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.status == EventStatus::Processed
    }
}

/// Result of a conditional update.
#[derive(Debug, Clone)]
pub enum Cas<T> {
    /// Precondition held; the new value was stored
    Applied(T),
    /// Precondition failed; the current value is returned unchanged
    Rejected(T),
    /// No record with that key
    Missing,
}

impl<T> Cas<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }

    /// The stored value after the update, if applied.
    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(v) => Some(v),
            _ => None,
        }
    }
}

/// Store-wide statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub campaigns: u64,
    pub memberships: MembershipStats,
    pub events_total: u64,
    pub events_processed: u64,
}
