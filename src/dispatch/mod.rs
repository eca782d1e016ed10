//! Rate-limited, compliance-checked sending.
//!
//! Each membership follows
//!
//! ```text
//! pending ──claim──► claimed ──send──► sent ──webhook──► delivered | failed
//!    ▲                 │  │
//!    └──── defer ──────┘  └──► opted_out | failed
//! ```
//!
//! Claims are taken through [`Storage::claim_pending`](crate::store::Storage::claim_pending),
//! which counts today's claims and claims new work in one atomic step, so
//! concurrent schedulers can never jointly exceed a campaign's daily limit.

mod gateway;
mod retry;
mod runner;
mod scheduler;

pub use gateway::{
    create_gateway, GatewayError, HttpGateway, MockGateway, SendGateway, SendRequest,
    SharedGateway,
};
pub use retry::RetryPolicy;
pub use runner::{Alert, AlertSeverity, AlertSink, DispatchRunner, LogAlertSink, MemoryAlertSink};
pub use scheduler::{DispatchScheduler, PassReport, RecoveryReport};

use thiserror::Error;

use crate::compliance::ComplianceError;
use crate::directory::DirectoryError;
use crate::store::StoreError;

/// Systemic failures that abort a dispatch pass.
///
/// Per-unit problems (gateway errors, opt-outs, closed windows) are recorded
/// on the membership and reported in [`PassReport`] instead.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("campaign business hours: {0}")]
    Compliance(#[from] ComplianceError),
}
