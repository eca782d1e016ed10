//! Provider webhook ingestion.
//!
//! ```text
//! raw body ─► verify signature ─► parse {id, type, data}
//!                                       │
//!                       record_event (write-ahead ledger)
//!                                       │
//!             processed? ── yes ──► Duplicate (no effects)
//!                                       │ no
//!                       begin_event ─► apply ─► finish_event
//!                                       │ error
//!                                       └──► release_event
//! ```

mod envelope;
mod ingest;
mod signature;

pub use envelope::{
    DeliveryState, Envelope, InboundReply, ProviderEvent, StatusUpdate, MESSAGE_RECEIVED,
    MESSAGE_STATUS,
};
pub use ingest::{EventEffect, IngestOutcome, WebhookIngestor};
pub use signature::{SignatureError, SignatureVerifier};

use thiserror::Error;

use crate::correlate::CorrelateError;
use crate::store::StoreError;

/// Webhook ingestion errors.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Rejected at ingress; nothing was recorded
    #[error("signature verification failed: {0}")]
    Signature(#[from] SignatureError),

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    /// Another worker is applying this event
    #[error("event {0} is being processed")]
    InProgress(String),

    /// Status for a provider message ID no send carries yet
    #[error("no send recorded for provider message {0}")]
    UnmatchedStatus(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Correlate(#[from] CorrelateError),
}

impl IngestError {
    /// Whether the provider should redeliver.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InProgress(_) | Self::UnmatchedStatus(_) | Self::Store(_) | Self::Correlate(_)
        )
    }
}
