//! Reply attribution and opt-out handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::compliance::ComplianceGuard;
use crate::directory::{Contact, SharedDirectory};
use crate::store::{
    CampaignId, ContactId, Membership, MembershipId, MembershipStatus, Sentiment, SharedStorage,
};
use crate::telemetry::counters;

use super::{CorrelateError, InboundMessage, Inbox, InboxEntry, SentimentClassifier};

const ANSWERABLE: &[MembershipStatus] = &[MembershipStatus::Sent, MembershipStatus::Delivered];

/// What one inbound message changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Correlation {
    pub contact_id: Option<ContactId>,
    /// Send the reply was attributed to
    pub membership_id: Option<MembershipId>,
    pub campaign_id: Option<CampaignId>,
    pub sentiment: Option<Sentiment>,
    /// True when this message opted the contact out
    pub opted_out: bool,
    /// Handed to the inbox as an unattributed message
    pub unattributed: bool,
}

/// Matches inbound replies to the most recent send within the lookback
/// window, classifies them and applies opt-outs.
pub struct ResponseCorrelator {
    storage: SharedStorage,
    directory: SharedDirectory,
    guard: ComplianceGuard,
    classifier: Arc<dyn SentimentClassifier>,
    inbox: Arc<dyn Inbox>,
}

impl ResponseCorrelator {
    pub fn new(
        storage: SharedStorage,
        directory: SharedDirectory,
        guard: ComplianceGuard,
        classifier: Arc<dyn SentimentClassifier>,
        inbox: Arc<dyn Inbox>,
    ) -> Self {
        Self {
            storage,
            directory,
            guard,
            classifier,
            inbox,
        }
    }

    /// Process one inbound message.
    ///
    /// Opt-out is applied whether or not a send matches, and charged to the
    /// owning campaign at most once per contact.
    pub async fn correlate(&self, message: &InboundMessage) -> Result<Correlation, CorrelateError> {
        let mut result = Correlation::default();

        let Some(contact) = self.directory.find_by_phone(&message.from).await? else {
            if self.guard.is_opt_out(&message.body) {
                warn!(from = %message.from, "opt-out from unknown number");
            }
            self.to_inbox(message, None, &mut result).await?;
            return Ok(result);
        };
        result.contact_id = Some(contact.id);

        let memberships = self.storage.contact_memberships(contact.id)?;
        let matched = self.most_recent_send(&memberships, message);

        if let Some(m) = matched {
            let sentiment = self.classifier.classify(&message.body);
            let received_at = message.received_at;
            let first = Arc::new(AtomicBool::new(false));
            let first_flag = first.clone();
            let applied = self.storage.transition_membership(
                m.id,
                ANSWERABLE,
                Box::new(move |m| {
                    first_flag.store(!m.response_received, Ordering::Relaxed);
                    m.record_response(received_at, sentiment);
                }),
            )?;

            if applied.is_applied() {
                result.membership_id = Some(m.id);
                result.campaign_id = Some(m.campaign_id);
                result.sentiment = Some(sentiment);
                counters::response(sentiment.name());

                if first.load(Ordering::Relaxed) {
                    self.storage.update_campaign(
                        m.campaign_id,
                        Box::new(|c| {
                            c.counters.responses += 1;
                            true
                        }),
                    )?;
                }
                debug!(
                    membership_id = %m.id,
                    campaign_id = %m.campaign_id,
                    sentiment = sentiment.name(),
                    "reply attributed"
                );
            }
        }

        if self.guard.is_opt_out(&message.body) {
            result.opted_out = self.apply_opt_out(&contact, &memberships, matched).await?;
        }

        if result.membership_id.is_none() {
            self.to_inbox(message, Some(contact.id), &mut result).await?;
        }

        Ok(result)
    }

    /// Most recent sent or delivered membership whose send falls inside the
    /// lookback window ending at the reply.
    fn most_recent_send<'a>(&self, memberships: &'a [Membership], message: &InboundMessage) -> Option<&'a Membership> {
        let earliest = message.received_at - self.guard.lookback();
        memberships
            .iter()
            .filter(|m| ANSWERABLE.contains(&m.status))
            .filter(|m| {
                m.sent_at
                    .is_some_and(|t| t >= earliest && t <= message.received_at)
            })
            .max_by_key(|m| (m.sent_at, m.id))
    }

    /// Flip the contact's flag and charge the owning campaign once.
    ///
    /// Every step is idempotent, so a redelivery after a partial failure
    /// finishes the work without charging twice.
    async fn apply_opt_out(
        &self,
        contact: &Contact,
        memberships: &[Membership],
        matched: Option<&Membership>,
    ) -> Result<bool, CorrelateError> {
        let changed = self.directory.set_opted_out(contact.id).await?;

        // Queued sends for this contact can no longer go out.
        for m in memberships.iter().filter(|m| m.status == MembershipStatus::Pending) {
            self.storage.transition_membership(
                m.id,
                &[MembershipStatus::Pending],
                Box::new(|m| m.mark_opted_out()),
            )?;
        }

        // The attributed send, else the contact's latest send of any age.
        let owner = matched
            .or_else(|| {
                memberships
                    .iter()
                    .filter(|m| m.sent_at.is_some())
                    .max_by_key(|m| (m.sent_at, m.id))
            })
            .map(|m| m.campaign_id);

        let charged = match owner {
            Some(campaign_id) => {
                let contact_id = contact.id;
                self.storage
                    .update_campaign(campaign_id, Box::new(move |c| c.record_opt_out(contact_id)))?
                    .is_applied()
            }
            None => false,
        };

        if !changed && !charged {
            debug!(contact_id = %contact.id, "contact already opted out");
            return Ok(false);
        }

        counters::opt_out("reply");
        info!(contact_id = %contact.id, campaign_id = ?owner, "contact opted out");
        Ok(true)
    }

    async fn to_inbox(
        &self,
        message: &InboundMessage,
        contact_id: Option<ContactId>,
        result: &mut Correlation,
    ) -> Result<(), CorrelateError> {
        self.inbox
            .deliver(InboxEntry {
                message: message.clone(),
                contact_id,
            })
            .await
            .map_err(|e| CorrelateError::Inbox(e.to_string()))?;
        result.unattributed = true;
        Ok(())
    }
}
