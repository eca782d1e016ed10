//! Provider event envelope.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Delivery status update type.
pub const MESSAGE_STATUS: &str = "message.status";

/// Inbound SMS type.
pub const MESSAGE_RECEIVED: &str = "message.received";

/// `{id, type, data}` envelope wrapping every provider event.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    /// Provider event ID, the idempotency key
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        let envelope: Self = serde_json::from_slice(body)?;
        if envelope.id.trim().is_empty() {
            return Err(serde::de::Error::custom("event id must not be empty"));
        }
        Ok(envelope)
    }

    pub fn event(&self) -> Result<ProviderEvent, serde_json::Error> {
        match self.event_type.as_str() {
            MESSAGE_STATUS => Ok(ProviderEvent::Status(serde_json::from_value(self.data.clone())?)),
            MESSAGE_RECEIVED => Ok(ProviderEvent::Received(serde_json::from_value(self.data.clone())?)),
            _ => Ok(ProviderEvent::Unknown),
        }
    }
}

/// Typed event payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    Status(StatusUpdate),
    Received(InboundReply),
    Unknown,
}

/// `message.status` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusUpdate {
    /// Provider message ID returned at send time
    pub message_id: String,
    pub status: String,
    #[serde(default)]
    pub error_code: Option<String>,
}

/// `message.received` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundReply {
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

/// Provider delivery status, collapsed to what membership state needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Delivered,
    Failed,
    /// Queued, sent, accepted and other non-final states
    Interim,
}

impl DeliveryState {
    pub fn from_provider(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "delivered" | "delivrd" => Self::Delivered,
            "failed" | "undelivered" | "undeliv" | "undeliverable" | "rejected" | "rejectd"
            | "expired" | "deleted" | "error" => Self::Failed,
            _ => Self::Interim,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_event() {
        let body = br#"{"id":"evt_1","type":"message.status","data":{"message_id":"SM1","status":"delivered"}}"#;
        let env = Envelope::parse(body).unwrap();
        assert_eq!(env.id, "evt_1");
        match env.event().unwrap() {
            ProviderEvent::Status(s) => {
                assert_eq!(s.message_id, "SM1");
                assert_eq!(DeliveryState::from_provider(&s.status), DeliveryState::Delivered);
                assert_eq!(s.error_code, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_received_event() {
        let body = br#"{"id":"evt_2","type":"message.received","data":{"from":"+15550001111","body":"STOP","received_at":"2026-03-02T12:00:00Z"}}"#;
        match Envelope::parse(body).unwrap().event().unwrap() {
            ProviderEvent::Received(r) => {
                assert_eq!(r.body, "STOP");
                assert!(r.received_at.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_and_bad_envelopes() {
        let env = Envelope::parse(br#"{"id":"evt_3","type":"number.ported"}"#).unwrap();
        assert_eq!(env.event().unwrap(), ProviderEvent::Unknown);

        assert!(Envelope::parse(b"not json").is_err());
        assert!(Envelope::parse(br#"{"type":"message.status"}"#).is_err());
        assert!(Envelope::parse(br#"{"id":" ","type":"x"}"#).is_err());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(DeliveryState::from_provider("UNDELIV"), DeliveryState::Failed);
        assert_eq!(DeliveryState::from_provider("expired"), DeliveryState::Failed);
        assert_eq!(DeliveryState::from_provider("queued"), DeliveryState::Interim);
        assert_eq!(DeliveryState::from_provider("sent"), DeliveryState::Interim);
    }
}
