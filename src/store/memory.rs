//! In-memory storage implementation.
//!
//! Volatile storage for development and testing. All data is lost on restart.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::types::*;
use super::{CampaignUpdate, MembershipUpdate, Storage, StoreResult};

// =============================================================================
// MemoryStorage
// =============================================================================

/// In-memory storage implementation.
///
/// Thread-safe using RwLock. Every conditional update holds the write lock of
/// the table it touches for its whole read-check-write sequence.
pub struct MemoryStorage {
    campaigns: RwLock<HashMap<CampaignId, Campaign>>,
    memberships: RwLock<MembershipTable>,
    events: RwLock<HashMap<String, WebhookEvent>>,
}

/// Membership records plus their secondary indexes.
#[derive(Default)]
struct MembershipTable {
    by_id: HashMap<MembershipId, Membership>,
    by_pair: HashMap<(CampaignId, ContactId), MembershipId>,
    by_provider_id: HashMap<String, MembershipId>,
}

impl MembershipTable {
    fn select<'a>(
        &'a self,
        pred: impl Fn(&Membership) -> bool + 'a,
    ) -> impl Iterator<Item = &'a Membership> + 'a {
        self.by_id.values().filter(move |m| pred(m))
    }

    fn reindex(&mut self, m: &Membership) {
        if let Some(pid) = &m.provider_message_id {
            self.by_provider_id.insert(pid.clone(), m.id);
        }
    }
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        debug!("creating in-memory storage");
        Self {
            campaigns: RwLock::new(HashMap::new()),
            memberships: RwLock::new(MembershipTable::default()),
            events: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort oldest first, ties broken by ID.
fn oldest_first(list: &mut [Membership]) {
    list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

impl Storage for MemoryStorage {
    // -------------------------------------------------------------------------
    // Campaign Operations
    // -------------------------------------------------------------------------

    fn create_campaign(&self, campaign: Campaign) -> StoreResult<CampaignId> {
        let id = campaign.id;
        self.campaigns.write().unwrap().insert(id, campaign);
        Ok(id)
    }

    fn get_campaign(&self, id: CampaignId) -> StoreResult<Option<Campaign>> {
        Ok(self.campaigns.read().unwrap().get(&id).cloned())
    }

    fn update_campaign(&self, id: CampaignId, f: CampaignUpdate) -> StoreResult<Cas<Campaign>> {
        let mut campaigns = self.campaigns.write().unwrap();
        let Some(current) = campaigns.get_mut(&id) else {
            return Ok(Cas::Missing);
        };

        let mut next = current.clone();
        if f(&mut next) {
            *current = next.clone();
            Ok(Cas::Applied(next))
        } else {
            Ok(Cas::Rejected(current.clone()))
        }
    }

    fn list_campaigns(&self, status: Option<CampaignStatus>) -> StoreResult<Vec<Campaign>> {
        let campaigns = self.campaigns.read().unwrap();
        let mut list: Vec<_> = campaigns
            .values()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        list.sort_by_key(|c| c.id);
        Ok(list)
    }

    // -------------------------------------------------------------------------
    // Membership Operations
    // -------------------------------------------------------------------------

    fn insert_memberships(&self, memberships: Vec<Membership>) -> StoreResult<usize> {
        let mut table = self.memberships.write().unwrap();
        let mut inserted = 0;

        for m in memberships {
            let pair = (m.campaign_id, m.contact_id);
            if table.by_pair.contains_key(&pair) {
                continue;
            }
            table.by_pair.insert(pair, m.id);
            table.reindex(&m);
            table.by_id.insert(m.id, m);
            inserted += 1;
        }

        Ok(inserted)
    }

    fn get_membership(&self, id: MembershipId) -> StoreResult<Option<Membership>> {
        Ok(self.memberships.read().unwrap().by_id.get(&id).cloned())
    }

    fn campaign_memberships(
        &self,
        campaign: CampaignId,
        status: Option<MembershipStatus>,
    ) -> StoreResult<Vec<Membership>> {
        let table = self.memberships.read().unwrap();
        let mut list: Vec<_> = table
            .select(|m| m.campaign_id == campaign && status.map_or(true, |s| m.status == s))
            .cloned()
            .collect();
        oldest_first(&mut list);
        Ok(list)
    }

    fn contact_memberships(&self, contact: ContactId) -> StoreResult<Vec<Membership>> {
        let table = self.memberships.read().unwrap();
        let mut list: Vec<_> = table.select(|m| m.contact_id == contact).cloned().collect();
        oldest_first(&mut list);
        Ok(list)
    }

    fn memberships_with_status(&self, status: MembershipStatus) -> StoreResult<Vec<Membership>> {
        let table = self.memberships.read().unwrap();
        let mut list: Vec<_> = table.select(|m| m.status == status).cloned().collect();
        oldest_first(&mut list);
        Ok(list)
    }

    fn find_by_provider_id(&self, provider_message_id: &str) -> StoreResult<Option<Membership>> {
        let table = self.memberships.read().unwrap();
        Ok(table
            .by_provider_id
            .get(provider_message_id)
            .and_then(|id| table.by_id.get(id))
            .cloned())
    }

    fn claim_pending(
        &self,
        campaign: CampaignId,
        day_start: DateTime<Utc>,
        now: DateTime<Utc>,
        daily_limit: u32,
        max: usize,
    ) -> StoreResult<Vec<Membership>> {
        let mut table = self.memberships.write().unwrap();

        let used: usize = table
            .select(|m| m.campaign_id == campaign)
            .map(|m| m.claims_since(day_start))
            .sum();
        let allowance = (daily_limit as usize).saturating_sub(used).min(max);
        if allowance == 0 {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<_> = table
            .select(|m| m.campaign_id == campaign && m.is_claimable(now))
            .map(|m| (m.created_at, m.id))
            .collect();
        candidates.sort();

        let mut claimed = Vec::with_capacity(allowance.min(candidates.len()));
        for (_, id) in candidates.into_iter().take(allowance) {
            if let Some(m) = table.by_id.get_mut(&id) {
                m.mark_claimed(now);
                claimed.push(m.clone());
            }
        }

        debug!(
            campaign_id = %campaign,
            used,
            claimed = claimed.len(),
            "claimed pending memberships"
        );
        Ok(claimed)
    }

    fn transition_membership(
        &self,
        id: MembershipId,
        expected: &[MembershipStatus],
        f: MembershipUpdate,
    ) -> StoreResult<Cas<Membership>> {
        let mut table = self.memberships.write().unwrap();
        let Some(m) = table.by_id.get_mut(&id) else {
            return Ok(Cas::Missing);
        };

        if !expected.contains(&m.status) {
            return Ok(Cas::Rejected(m.clone()));
        }

        f(m);
        let updated = m.clone();
        table.reindex(&updated);
        Ok(Cas::Applied(updated))
    }

    // -------------------------------------------------------------------------
    // Webhook Event Operations
    // -------------------------------------------------------------------------

    fn record_event(&self, event: WebhookEvent) -> StoreResult<WebhookEvent> {
        let mut events = self.events.write().unwrap();
        let stored = events
            .entry(event.external_id.clone())
            .and_modify(|e| e.deliveries += 1)
            .or_insert(event);
        Ok(stored.clone())
    }

    fn get_event(&self, external_id: &str) -> StoreResult<Option<WebhookEvent>> {
        Ok(self.events.read().unwrap().get(external_id).cloned())
    }

    fn begin_event(&self, external_id: &str) -> StoreResult<bool> {
        let mut events = self.events.write().unwrap();
        match events.get_mut(external_id) {
            Some(e) if e.status == EventStatus::Received => {
                e.status = EventStatus::Processing;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn finish_event(&self, external_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut events = self.events.write().unwrap();
        if let Some(e) = events.get_mut(external_id) {
            if e.status != EventStatus::Processed {
                e.status = EventStatus::Processed;
                e.processed_at = Some(at);
            }
        }
        Ok(())
    }

    fn release_event(&self, external_id: &str) -> StoreResult<()> {
        let mut events = self.events.write().unwrap();
        if let Some(e) = events.get_mut(external_id) {
            if e.status == EventStatus::Processing {
                e.status = EventStatus::Received;
            }
        }
        Ok(())
    }

    fn release_interrupted_events(&self) -> StoreResult<usize> {
        let mut events = self.events.write().unwrap();
        let mut released = 0;
        for e in events.values_mut().filter(|e| e.status == EventStatus::Processing) {
            e.status = EventStatus::Received;
            released += 1;
        }
        Ok(released)
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    fn stats(&self) -> StoreResult<StoreStats> {
        let mut stats = StoreStats {
            campaigns: self.campaigns.read().unwrap().len() as u64,
            ..Default::default()
        };

        for m in self.memberships.read().unwrap().by_id.values() {
            stats.memberships.add(m.status);
        }

        let events = self.events.read().unwrap();
        stats.events_total = events.len() as u64;
        stats.events_processed = events.values().filter(|e| e.is_processed()).count() as u64;

        Ok(stats)
    }
}
