//! Recipient list building.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::compliance::ComplianceGuard;
use crate::directory::{Contact, SharedDirectory};
use crate::store::{ContactId, SharedStorage};

use super::{CampaignError, CampaignList};

/// Eligible contacts plus exclusion tallies.
#[derive(Debug, Default)]
pub struct BuiltList {
    /// Eligible contacts, ordered by ID
    pub contacts: Vec<Contact>,
    /// Contacts matched by the filter or the static set
    pub matched: usize,
    pub excluded_opted_out: usize,
    pub excluded_frequency: usize,
    pub excluded_tagged: usize,
}

/// Computes eligible recipients for a campaign list.
pub struct ListBuilder {
    directory: SharedDirectory,
    storage: SharedStorage,
    guard: ComplianceGuard,
}

impl ListBuilder {
    pub fn new(directory: SharedDirectory, storage: SharedStorage, guard: ComplianceGuard) -> Self {
        Self {
            directory,
            storage,
            guard,
        }
    }

    /// Build the eligible set.
    ///
    /// Steps, in order: dynamic filter, static-set union, opted-out
    /// exclusion, frequency-cap exclusion, tag exclusion. An empty result is
    /// not an error.
    pub async fn build(&self, list: &CampaignList, now: DateTime<Utc>) -> Result<BuiltList, CampaignError> {
        let mut selected: BTreeMap<ContactId, Contact> = BTreeMap::new();

        if let Some(filter) = &list.filter {
            for contact in self.directory.contacts().await? {
                if filter.matches(&contact) {
                    selected.insert(contact.id, contact);
                }
            }
        }

        for id in &list.static_contacts {
            if selected.contains_key(id) {
                continue;
            }
            if let Some(contact) = self.directory.get(*id).await? {
                selected.insert(contact.id, contact);
            }
        }

        let mut built = BuiltList {
            matched: selected.len(),
            ..Default::default()
        };

        for (_, contact) in selected {
            if contact.opted_out {
                built.excluded_opted_out += 1;
                continue;
            }
            let last_sent = self.storage.last_sent_at(contact.id)?;
            if self.guard.is_frequency_capped(last_sent, now) {
                built.excluded_frequency += 1;
                continue;
            }
            if contact.tags.iter().any(|t| list.excluded_tags.contains(t)) {
                built.excluded_tagged += 1;
                continue;
            }
            built.contacts.push(contact);
        }

        debug!(
            matched = built.matched,
            eligible = built.contacts.len(),
            opted_out = built.excluded_opted_out,
            frequency = built.excluded_frequency,
            tagged = built.excluded_tagged,
            "list built"
        );

        Ok(built)
    }
}
