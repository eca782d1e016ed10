//! Persistent storage using fjall (pure Rust LSM-tree).
//!
//! Durable storage for production use. All data survives restarts.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::types::*;
use super::{CampaignUpdate, MembershipUpdate, Storage, StoreError, StoreResult};

// =============================================================================
// PersistentStorage
// =============================================================================

/// Persistent storage using fjall LSM-tree.
///
/// Values are JSON. Reads go straight to the partitions; every
/// read-check-write sequence runs under `write_lock` so conditional updates
/// stay atomic within the process.
pub struct PersistentStorage {
    keyspace: Keyspace,
    campaigns: PartitionHandle,
    memberships: PartitionHandle,
    /// `{campaign}:{contact}` → membership ID
    member_pairs: PartitionHandle,
    /// `{campaign}:{membership}` → membership ID
    campaign_members: PartitionHandle,
    /// `{contact}:{membership}` → membership ID
    contact_members: PartitionHandle,
    /// provider message ID → membership ID
    provider_ids: PartitionHandle,
    events: PartitionHandle,
    write_lock: Mutex<()>,
}

fn unavailable(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn campaign_key(id: CampaignId) -> String {
    format!("cmp_{:020}", id.as_u64())
}

fn membership_key(id: MembershipId) -> String {
    format!("mem_{:020}", id.as_u64())
}

fn pair_key(campaign: CampaignId, contact: ContactId) -> String {
    format!("{:020}:{:020}", campaign.as_u64(), contact.as_u64())
}

fn scoped_key(scope: u64, id: MembershipId) -> String {
    format!("{:020}:{:020}", scope, id.as_u64())
}

fn scope_prefix(scope: u64) -> String {
    format!("{:020}:", scope)
}

fn id_bytes(id: MembershipId) -> [u8; 8] {
    id.as_u64().to_be_bytes()
}

fn id_from_bytes(value: &[u8]) -> Option<MembershipId> {
    let bytes: [u8; 8] = value.get(..8)?.try_into().ok()?;
    Some(MembershipId::from_u64(u64::from_be_bytes(bytes)))
}

impl PersistentStorage {
    /// Open or create persistent storage at the given path.
    pub async fn open(path: &Path) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(path)?;

        let keyspace = Config::new(path).open()?;
        let open = |name: &str| keyspace.open_partition(name, PartitionCreateOptions::default());

        let campaigns = open("campaigns")?;
        let memberships = open("memberships")?;
        let member_pairs = open("member_pairs")?;
        let campaign_members = open("campaign_members")?;
        let contact_members = open("contact_members")?;
        let provider_ids = open("provider_ids")?;
        let events = open("webhook_events")?;

        let store = Arc::new(Self {
            keyspace,
            campaigns,
            memberships,
            member_pairs,
            campaign_members,
            contact_members,
            provider_ids,
            events,
            write_lock: Mutex::new(()),
        });

        store.recover_counters()?;

        tracing::info!(
            path = %path.display(),
            campaigns = store.campaigns.len().unwrap_or(0),
            memberships = store.memberships.len().unwrap_or(0),
            "persistent storage opened"
        );

        Ok(store)
    }

    fn recover_counters(&self) -> StoreResult<()> {
        let max_key_id = |partition: &PartitionHandle, prefix: &str| -> StoreResult<u64> {
            let mut max = 0u64;
            for item in partition.iter() {
                let (key, _) = item.map_err(unavailable)?;
                if let Some(id) = std::str::from_utf8(&key)
                    .ok()
                    .and_then(|k| k.strip_prefix(prefix))
                    .and_then(|s| s.parse::<u64>().ok())
                {
                    max = max.max(id);
                }
            }
            Ok(max)
        };

        let max_campaign = max_key_id(&self.campaigns, "cmp_")?;
        let max_membership = max_key_id(&self.memberships, "mem_")?;

        CAMPAIGN_COUNTER.fetch_max(max_campaign + 1, Ordering::SeqCst);
        MEMBERSHIP_COUNTER.fetch_max(max_membership + 1, Ordering::SeqCst);

        tracing::debug!(max_campaign, max_membership, "recovered ID counters");
        Ok(())
    }

    fn put<T: Serialize>(partition: &PartitionHandle, key: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        partition.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    fn load<T: DeserializeOwned>(partition: &PartitionHandle, key: &str) -> StoreResult<Option<T>> {
        match partition.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(partition: &PartitionHandle) -> StoreResult<Vec<T>> {
        let mut out = Vec::new();
        for item in partition.iter() {
            let (_, value) = item.map_err(unavailable)?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    fn load_membership(&self, id: MembershipId) -> StoreResult<Option<Membership>> {
        Self::load(&self.memberships, &membership_key(id))
    }

    /// Load memberships referenced by an index prefix.
    fn load_scoped(&self, index: &PartitionHandle, scope: u64) -> StoreResult<Vec<Membership>> {
        let mut out = Vec::new();
        for item in index.prefix(scope_prefix(scope).as_bytes()) {
            let (_, value) = item.map_err(unavailable)?;
            if let Some(id) = id_from_bytes(&value) {
                if let Some(m) = self.load_membership(id)? {
                    out.push(m);
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    fn save_membership(&self, m: &Membership) -> StoreResult<()> {
        Self::put(&self.memberships, &membership_key(m.id), m)?;
        if let Some(pid) = &m.provider_message_id {
            self.provider_ids.insert(pid.as_bytes(), id_bytes(m.id))?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap()
    }
}

impl Storage for PersistentStorage {
    // -------------------------------------------------------------------------
    // Campaign Operations
    // -------------------------------------------------------------------------

    fn create_campaign(&self, campaign: Campaign) -> StoreResult<CampaignId> {
        let _guard = self.lock();
        Self::put(&self.campaigns, &campaign_key(campaign.id), &campaign)?;
        Ok(campaign.id)
    }

    fn get_campaign(&self, id: CampaignId) -> StoreResult<Option<Campaign>> {
        Self::load(&self.campaigns, &campaign_key(id))
    }

    fn update_campaign(&self, id: CampaignId, f: CampaignUpdate) -> StoreResult<Cas<Campaign>> {
        let _guard = self.lock();
        let key = campaign_key(id);
        let Some(current) = Self::load::<Campaign>(&self.campaigns, &key)? else {
            return Ok(Cas::Missing);
        };

        let mut next = current.clone();
        if !f(&mut next) {
            return Ok(Cas::Rejected(current));
        }
        Self::put(&self.campaigns, &key, &next)?;
        Ok(Cas::Applied(next))
    }

    fn list_campaigns(&self, status: Option<CampaignStatus>) -> StoreResult<Vec<Campaign>> {
        let all: Vec<Campaign> = Self::scan(&self.campaigns)?;
        Ok(all
            .into_iter()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .collect())
    }

    // -------------------------------------------------------------------------
    // Membership Operations
    // -------------------------------------------------------------------------

    fn insert_memberships(&self, memberships: Vec<Membership>) -> StoreResult<usize> {
        let _guard = self.lock();
        let mut inserted = 0;

        for m in memberships {
            let pair = pair_key(m.campaign_id, m.contact_id);
            if self.member_pairs.get(pair.as_bytes())?.is_some() {
                continue;
            }
            self.save_membership(&m)?;
            self.member_pairs.insert(pair.as_bytes(), id_bytes(m.id))?;
            self.campaign_members.insert(
                scoped_key(m.campaign_id.as_u64(), m.id).as_bytes(),
                id_bytes(m.id),
            )?;
            self.contact_members.insert(
                scoped_key(m.contact_id.as_u64(), m.id).as_bytes(),
                id_bytes(m.id),
            )?;
            inserted += 1;
        }

        Ok(inserted)
    }

    fn get_membership(&self, id: MembershipId) -> StoreResult<Option<Membership>> {
        self.load_membership(id)
    }

    fn campaign_memberships(
        &self,
        campaign: CampaignId,
        status: Option<MembershipStatus>,
    ) -> StoreResult<Vec<Membership>> {
        let mut list = self.load_scoped(&self.campaign_members, campaign.as_u64())?;
        if let Some(s) = status {
            list.retain(|m| m.status == s);
        }
        Ok(list)
    }

    fn contact_memberships(&self, contact: ContactId) -> StoreResult<Vec<Membership>> {
        self.load_scoped(&self.contact_members, contact.as_u64())
    }

    fn memberships_with_status(&self, status: MembershipStatus) -> StoreResult<Vec<Membership>> {
        let mut list: Vec<Membership> = Self::scan(&self.memberships)?;
        list.retain(|m| m.status == status);
        Ok(list)
    }

    fn find_by_provider_id(&self, provider_message_id: &str) -> StoreResult<Option<Membership>> {
        match self.provider_ids.get(provider_message_id.as_bytes())? {
            Some(value) => match id_from_bytes(&value) {
                Some(id) => self.load_membership(id),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    fn claim_pending(
        &self,
        campaign: CampaignId,
        day_start: DateTime<Utc>,
        now: DateTime<Utc>,
        daily_limit: u32,
        max: usize,
    ) -> StoreResult<Vec<Membership>> {
        let _guard = self.lock();
        let members = self.load_scoped(&self.campaign_members, campaign.as_u64())?;

        let used: usize = members.iter().map(|m| m.claims_since(day_start)).sum();
        let allowance = (daily_limit as usize).saturating_sub(used).min(max);

        let mut claimed = Vec::new();
        for mut m in members.into_iter().filter(|m| m.is_claimable(now)) {
            if claimed.len() >= allowance {
                break;
            }
            m.mark_claimed(now);
            self.save_membership(&m)?;
            claimed.push(m);
        }

        tracing::debug!(
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
        let _guard = self.lock();
        let Some(mut m) = self.load_membership(id)? else {
            return Ok(Cas::Missing);
        };
        if !expected.contains(&m.status) {
            return Ok(Cas::Rejected(m));
        }

        f(&mut m);
        self.save_membership(&m)?;
        Ok(Cas::Applied(m))
    }

    // -------------------------------------------------------------------------
    // Webhook Event Operations
    // -------------------------------------------------------------------------

    fn record_event(&self, event: WebhookEvent) -> StoreResult<WebhookEvent> {
        let _guard = self.lock();
        let stored = match Self::load::<WebhookEvent>(&self.events, &event.external_id)? {
            Some(mut existing) => {
                existing.deliveries += 1;
                existing
            }
            None => event,
        };
        Self::put(&self.events, &stored.external_id, &stored)?;
        Ok(stored)
    }

    fn get_event(&self, external_id: &str) -> StoreResult<Option<WebhookEvent>> {
        Self::load(&self.events, external_id)
    }

    fn begin_event(&self, external_id: &str) -> StoreResult<bool> {
        let _guard = self.lock();
        match Self::load::<WebhookEvent>(&self.events, external_id)? {
            Some(mut e) if e.status == EventStatus::Received => {
                e.status = EventStatus::Processing;
                Self::put(&self.events, external_id, &e)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn finish_event(&self, external_id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let _guard = self.lock();
        if let Some(mut e) = Self::load::<WebhookEvent>(&self.events, external_id)? {
            if e.status != EventStatus::Processed {
                e.status = EventStatus::Processed;
                e.processed_at = Some(at);
                Self::put(&self.events, external_id, &e)?;
            }
        }
        Ok(())
    }

    fn release_event(&self, external_id: &str) -> StoreResult<()> {
        let _guard = self.lock();
        if let Some(mut e) = Self::load::<WebhookEvent>(&self.events, external_id)? {
            if e.status == EventStatus::Processing {
                e.status = EventStatus::Received;
                Self::put(&self.events, external_id, &e)?;
            }
        }
        Ok(())
    }

    fn release_interrupted_events(&self) -> StoreResult<usize> {
        let _guard = self.lock();
        let mut released = 0;
        for mut e in Self::scan::<WebhookEvent>(&self.events)? {
            if e.status == EventStatus::Processing {
                e.status = EventStatus::Received;
                Self::put(&self.events, &e.external_id, &e)?;
                released += 1;
            }
        }
        Ok(released)
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    fn stats(&self) -> StoreResult<StoreStats> {
        let mut stats = StoreStats {
            campaigns: self.campaigns.len().map_err(unavailable)? as u64,
            ..Default::default()
        };

        for m in Self::scan::<Membership>(&self.memberships)? {
            stats.memberships.add(m.status);
        }
        for e in Self::scan::<WebhookEvent>(&self.events)? {
            stats.events_total += 1;
            if e.is_processed() {
                stats.events_processed += 1;
            }
        }
        Ok(stats)
    }

    fn flush(&self) -> StoreResult<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}
