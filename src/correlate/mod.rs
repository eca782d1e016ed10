//! Inbound reply correlation.

mod correlator;
mod inbox;
mod sentiment;

pub use correlator::{Correlation, ResponseCorrelator};
pub use inbox::{InboundMessage, Inbox, InboxEntry, LogInbox, MemoryInbox};
pub use sentiment::{KeywordClassifier, SentimentClassifier};

use thiserror::Error;

use crate::directory::DirectoryError;
use crate::store::StoreError;

/// Correlation errors.
#[derive(Debug, Error)]
pub enum CorrelateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("inbox delivery failed: {0}")]
    Inbox(String),
}
