//! Verified, idempotent event ingestion.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::clock::SharedClock;
use crate::correlate::{Correlation, InboundMessage, ResponseCorrelator};
use crate::store::{MembershipId, MembershipStatus, SharedStorage, WebhookEvent};
use crate::telemetry::{counters, AdminState};

use super::envelope::{DeliveryState, Envelope, ProviderEvent, StatusUpdate};
use super::{IngestError, SignatureVerifier};

const SENT: &[MembershipStatus] = &[MembershipStatus::Sent];

/// Result of an accepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestOutcome {
    /// Effects applied by this request
    Accepted,
    /// Event already processed; nothing applied
    Duplicate,
}

impl IngestOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Duplicate => "duplicate",
        }
    }
}

/// What applying an event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventEffect {
    Delivered(MembershipId),
    Failed(MembershipId),
    /// Status that needs no state change, or one that arrived late
    StatusIgnored,
    /// Status for a message ID no send carried within the grace period
    Orphaned,
    Reply(Correlation),
    /// Payload could not be read; kept in the ledger only
    Unreadable,
    /// Type this service does not handle
    Ignored,
}

/// Verifies, records and applies provider webhook events.
///
/// The raw event is written to the ledger before any effect runs. The
/// ledger then moves Received → Processing → Processed; a failed attempt
/// moves back to Received so the provider's retry applies it.
pub struct WebhookIngestor {
    storage: SharedStorage,
    correlator: Arc<ResponseCorrelator>,
    verifier: SignatureVerifier,
    clock: SharedClock,
    admin: Arc<AdminState>,
    unmatched_grace: Duration,
}

impl WebhookIngestor {
    pub fn new(
        storage: SharedStorage,
        correlator: Arc<ResponseCorrelator>,
        verifier: SignatureVerifier,
        clock: SharedClock,
        admin: Arc<AdminState>,
    ) -> Self {
        Self {
            storage,
            correlator,
            verifier,
            clock,
            admin,
            unmatched_grace: Duration::minutes(15),
        }
    }

    /// How long a status for an unknown message ID is sent back for
    /// redelivery. The send that carries the ID may not be recorded yet.
    pub fn with_unmatched_grace(mut self, grace: std::time::Duration) -> Self {
        self.unmatched_grace = crate::compliance::chrono_duration(grace);
        self
    }

    /// Ingest one raw request body with its signature header.
    #[instrument(skip_all)]
    pub async fn ingest(&self, body: &[u8], signature: Option<&str>) -> Result<IngestOutcome, IngestError> {
        if let Err(e) = self.verifier.verify(body, signature) {
            counters::webhook_signature_failure();
            self.admin.inc_webhook_rejected();
            warn!(error = %e, bytes = body.len(), "webhook signature rejected");
            return Err(IngestError::Signature(e));
        }

        let envelope = Envelope::parse(body).map_err(|e| {
            self.admin.inc_webhook_rejected();
            warn!(error = %e, "malformed webhook envelope");
            IngestError::MalformedPayload(e.to_string())
        })?;
        let event_id = envelope.id.clone();
        let event_type = envelope.event_type.clone();

        let stored = self.storage.record_event(WebhookEvent::new(
            &event_id,
            &event_type,
            String::from_utf8_lossy(body),
            self.clock.now(),
        ))?;

        if stored.is_processed() {
            counters::webhook_event(&event_type, "duplicate");
            self.admin.inc_webhook_duplicate();
            debug!(event_id = %event_id, deliveries = stored.deliveries, "duplicate webhook event");
            return Ok(IngestOutcome::Duplicate);
        }

        if !self.storage.begin_event(&event_id)? {
            // Re-read: it may have finished between record and begin.
            let processed = self
                .storage
                .get_event(&event_id)?
                .is_some_and(|e| e.is_processed());
            if processed {
                counters::webhook_event(&event_type, "duplicate");
                self.admin.inc_webhook_duplicate();
                return Ok(IngestOutcome::Duplicate);
            }
            debug!(event_id = %event_id, "webhook event held by another worker");
            return Err(IngestError::InProgress(event_id));
        }

        match self.apply(&envelope, stored.received_at).await {
            Ok(effect) => {
                self.storage.finish_event(&event_id, self.clock.now())?;
                counters::webhook_event(&event_type, "accepted");
                self.admin.inc_webhook_accepted();
                debug!(event_id = %event_id, event_type = %event_type, effect = ?effect, "webhook event processed");
                Ok(IngestOutcome::Accepted)
            }
            Err(e) => {
                if let Err(release) = self.storage.release_event(&event_id) {
                    warn!(event_id = %event_id, error = %release, "failed to release webhook event");
                }
                counters::webhook_event(&event_type, "error");
                warn!(event_id = %event_id, error = %e, "webhook event failed, left for redelivery");
                Err(e)
            }
        }
    }

    /// Apply an event's effects. `first_seen` is when the ledger first
    /// recorded the event.
    pub async fn apply(&self, envelope: &Envelope, first_seen: DateTime<Utc>) -> Result<EventEffect, IngestError> {
        let event = match envelope.event() {
            Ok(event) => event,
            Err(e) => {
                warn!(event_id = %envelope.id, event_type = %envelope.event_type, error = %e, "unreadable event payload");
                return Ok(EventEffect::Unreadable);
            }
        };

        match event {
            ProviderEvent::Status(update) => self.apply_status(&update, first_seen),
            ProviderEvent::Received(reply) => {
                let message = InboundMessage {
                    from: reply.from,
                    to: reply.to,
                    body: reply.body,
                    received_at: reply.received_at.unwrap_or_else(|| self.clock.now()),
                };
                let correlation = self.correlator.correlate(&message).await?;
                Ok(EventEffect::Reply(correlation))
            }
            ProviderEvent::Unknown => {
                debug!(event_type = %envelope.event_type, "ignoring unhandled event type");
                Ok(EventEffect::Ignored)
            }
        }
    }

    fn apply_status(&self, update: &StatusUpdate, first_seen: DateTime<Utc>) -> Result<EventEffect, IngestError> {
        let state = DeliveryState::from_provider(&update.status);
        if state == DeliveryState::Interim {
            return Ok(EventEffect::StatusIgnored);
        }

        let now = self.clock.now();
        let Some(membership) = self.storage.find_by_provider_id(&update.message_id)? else {
            if now - first_seen < self.unmatched_grace {
                debug!(provider_id = %update.message_id, "status for unrecorded send, asking for redelivery");
                return Err(IngestError::UnmatchedStatus(update.message_id.clone()));
            }
            info!(provider_id = %update.message_id, status = %update.status, "orphaned delivery update");
            return Ok(EventEffect::Orphaned);
        };

        let id = membership.id;
        let campaign_id = membership.campaign_id;

        let effect = match state {
            DeliveryState::Delivered => {
                let applied = self
                    .storage
                    .transition_membership(id, SENT, Box::new(move |m| m.mark_delivered(now)))?;
                if !applied.is_applied() {
                    return Ok(EventEffect::StatusIgnored);
                }
                self.storage.update_campaign(
                    campaign_id,
                    Box::new(move |c| {
                        c.counters.delivered += 1;
                        c.updated_at = now;
                        true
                    }),
                )?;
                self.admin.inc_delivered();
                EventEffect::Delivered(id)
            }
            DeliveryState::Failed => {
                let reason = match &update.error_code {
                    Some(code) => format!("provider status {} ({})", update.status, code),
                    None => format!("provider status {}", update.status),
                };
                let applied = self
                    .storage
                    .transition_membership(id, SENT, Box::new(move |m| m.mark_failed(reason, now)))?;
                if !applied.is_applied() {
                    return Ok(EventEffect::StatusIgnored);
                }
                self.storage.update_campaign(
                    campaign_id,
                    Box::new(move |c| {
                        c.counters.failed += 1;
                        c.updated_at = now;
                        true
                    }),
                )?;
                self.admin.inc_failed();
                EventEffect::Failed(id)
            }
            DeliveryState::Interim => EventEffect::StatusIgnored,
        };

        debug!(membership_id = %id, campaign_id = %campaign_id, status = %update.status, "delivery status applied");
        Ok(effect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::compliance::ComplianceGuard;
    use crate::config::ComplianceConfig;
    use crate::correlate::{KeywordClassifier, MemoryInbox};
    use crate::directory::{Contact, MemoryDirectory};
    use crate::store::{Campaign, CampaignId, ContactId, EventStatus, MemoryStorage, Membership, Storage, Variant};
    use chrono::{TimeZone, Utc};

    struct Fixture {
        ingestor: WebhookIngestor,
        storage: Arc<MemoryStorage>,
        verifier: SignatureVerifier,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let directory = Arc::new(MemoryDirectory::with_contacts([Contact::new(1, "+15550000001")]));
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()));
        let guard = ComplianceGuard::new(&ComplianceConfig::default()).unwrap();
        let correlator = Arc::new(ResponseCorrelator::new(
            storage.clone(),
            directory,
            guard,
            Arc::new(KeywordClassifier::with_defaults().unwrap()),
            Arc::new(MemoryInbox::new()),
        ));
        let verifier = SignatureVerifier::new("secret").unwrap();
        let ingestor = WebhookIngestor::new(
            storage.clone(),
            correlator,
            verifier.clone(),
            clock.clone(),
            Arc::new(AdminState::new()),
        )
        .with_unmatched_grace(std::time::Duration::from_secs(600));
        Fixture {
            ingestor,
            storage,
            verifier,
            clock,
        }
    }

    fn sent_membership(f: &Fixture, provider_id: &str) -> (CampaignId, MembershipId) {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap();
        let campaign = f.storage.create_campaign(Campaign::new("c", "hi", 10)).unwrap();
        let mut m = Membership::new(campaign, ContactId::from_u64(1), Variant::A, "+15550000001", "hi", at);
        m.mark_claimed(at);
        m.mark_sent(provider_id, at);
        let id = m.id;
        f.storage.insert_memberships(vec![m]).unwrap();
        (campaign, id)
    }

    fn status_body(event_id: &str, message_id: &str, status: &str) -> Vec<u8> {
        format!(
            r#"{{"id":"{event_id}","type":"message.status","data":{{"message_id":"{message_id}","status":"{status}"}}}}"#
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn test_bad_signature_rejected_before_persisting() {
        let f = fixture();
        let body = status_body("evt_1", "SM1", "delivered");
        let err = f.ingestor.ingest(&body, Some("deadbeef")).await.unwrap_err();
        assert!(matches!(err, IngestError::Signature(_)));
        assert!(f.storage.get_event("evt_1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_event_applies_once() {
        let f = fixture();
        let (campaign, id) = sent_membership(&f, "SM1");
        let body = status_body("evt_1", "SM1", "delivered");
        let sig = f.verifier.sign(&body);

        assert_eq!(f.ingestor.ingest(&body, Some(&sig)).await.unwrap(), IngestOutcome::Accepted);
        assert_eq!(f.ingestor.ingest(&body, Some(&sig)).await.unwrap(), IngestOutcome::Duplicate);

        let m = f.storage.get_membership(id).unwrap().unwrap();
        assert_eq!(m.status, MembershipStatus::Delivered);
        assert_eq!(f.storage.get_campaign(campaign).unwrap().unwrap().counters.delivered, 1);

        let event = f.storage.get_event("evt_1").unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Processed);
        assert_eq!(event.deliveries, 2);
    }

    #[tokio::test]
    async fn test_failed_status_marks_membership() {
        let f = fixture();
        let (_, id) = sent_membership(&f, "SM2");
        let body = status_body("evt_2", "SM2", "undelivered");
        let sig = f.verifier.sign(&body);
        f.ingestor.ingest(&body, Some(&sig)).await.unwrap();

        let m = f.storage.get_membership(id).unwrap().unwrap();
        assert_eq!(m.status, MembershipStatus::Failed);
        assert!(m.last_error.unwrap().contains("undelivered"));
    }

    #[tokio::test]
    async fn test_late_failure_after_delivery_ignored() {
        let f = fixture();
        let (_, id) = sent_membership(&f, "SM3");
        for (event, status) in [("evt_a", "delivered"), ("evt_b", "failed")] {
            let body = status_body(event, "SM3", status);
            let sig = f.verifier.sign(&body);
            f.ingestor.ingest(&body, Some(&sig)).await.unwrap();
        }
        let m = f.storage.get_membership(id).unwrap().unwrap();
        assert_eq!(m.status, MembershipStatus::Delivered);
    }

    #[tokio::test]
    async fn test_status_before_send_recorded_applies_on_redelivery() {
        let f = fixture();
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 11, 59, 0).unwrap();
        let campaign = f.storage.create_campaign(Campaign::new("c", "hi", 10)).unwrap();
        let mut m = Membership::new(campaign, ContactId::from_u64(1), Variant::A, "+15550000001", "hi", at);
        m.mark_claimed(at);
        let id = m.id;
        f.storage.insert_memberships(vec![m]).unwrap();

        // Status lands while the send call is still in flight.
        let body = status_body("evt_early", "SMX", "delivered");
        let sig = f.verifier.sign(&body);
        let err = f.ingestor.ingest(&body, Some(&sig)).await.unwrap_err();
        assert!(matches!(err, IngestError::UnmatchedStatus(_)));
        assert!(err.is_retryable());
        let event = f.storage.get_event("evt_early").unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Received);

        let now = f.clock.now();
        f.storage
            .transition_membership(
                id,
                &[MembershipStatus::Claimed],
                Box::new(move |m| m.mark_sent("SMX", now)),
            )
            .unwrap();

        f.clock.advance(chrono::Duration::seconds(30));
        assert_eq!(f.ingestor.ingest(&body, Some(&sig)).await.unwrap(), IngestOutcome::Accepted);
        assert_eq!(f.storage.get_membership(id).unwrap().unwrap().status, MembershipStatus::Delivered);
        assert_eq!(f.storage.get_campaign(campaign).unwrap().unwrap().counters.delivered, 1);
    }

    #[tokio::test]
    async fn test_orphaned_and_unknown_events_are_processed() {
        let f = fixture();
        let orphan = status_body("evt_o", "SM-unknown", "delivered");
        let sig = f.verifier.sign(&orphan);
        assert!(f.ingestor.ingest(&orphan, Some(&sig)).await.is_err());

        // Still unmatched once the grace period has passed since first delivery.
        f.clock.advance(chrono::Duration::minutes(11));
        assert_eq!(f.ingestor.ingest(&orphan, Some(&sig)).await.unwrap(), IngestOutcome::Accepted);
        assert!(f.storage.get_event("evt_o").unwrap().unwrap().is_processed());

        let unknown = br#"{"id":"evt_u","type":"number.ported","data":{}}"#;
        let sig = f.verifier.sign(unknown);
        assert_eq!(f.ingestor.ingest(unknown, Some(&sig)).await.unwrap(), IngestOutcome::Accepted);
        assert!(f.storage.get_event("evt_u").unwrap().unwrap().is_processed());
    }

    #[tokio::test]
    async fn test_malformed_envelope() {
        let f = fixture();
        let body = b"{\"type\":\"message.status\"}";
        let sig = f.verifier.sign(body);
        let err = f.ingestor.ingest(body, Some(&sig)).await.unwrap_err();
        assert!(matches!(err, IngestError::MalformedPayload(_)));
    }

    #[tokio::test]
    async fn test_event_in_progress_elsewhere() {
        let f = fixture();
        let body = status_body("evt_p", "SM9", "delivered");
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        f.storage
            .record_event(WebhookEvent::new("evt_p", "message.status", "{}", at))
            .unwrap();
        assert!(f.storage.begin_event("evt_p").unwrap());

        let sig = f.verifier.sign(&body);
        let err = f.ingestor.ingest(&body, Some(&sig)).await.unwrap_err();
        assert!(matches!(err, IngestError::InProgress(_)));
    }

    #[tokio::test]
    async fn test_inbound_reply_routed_to_correlator() {
        let f = fixture();
        let (campaign, id) = sent_membership(&f, "SM4");
        let body = br#"{"id":"evt_r","type":"message.received","data":{"from":"+15550000001","body":"STOP","received_at":"2026-03-02T12:00:00Z"}}"#;
        let sig = f.verifier.sign(body);

        f.ingestor.ingest(body, Some(&format!("sha256={sig}"))).await.unwrap();
        f.ingestor.ingest(body, Some(&sig)).await.unwrap();

        assert!(f.storage.get_membership(id).unwrap().unwrap().response_received);
        assert_eq!(f.storage.get_campaign(campaign).unwrap().unwrap().counters.opt_outs, 1);
    }
}
