//! Compliance rules: opt-outs, business hours and contact frequency.
//!
//! Enforced at three points: when a list is built, immediately before each
//! send, and when a reply arrives.

mod guard;
mod hours;
mod optout;

pub(crate) use guard::chrono_duration;
pub use guard::{ComplianceGuard, SendCheck};
pub use hours::{BusinessHours, BusinessHoursWindow};
pub use optout::OptOutDetector;

use thiserror::Error;

/// Compliance configuration errors.
#[derive(Debug, Error)]
pub enum ComplianceError {
    #[error("invalid time (expected HH:MM): {0}")]
    InvalidTime(String),

    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error("unknown weekday: {0}")]
    InvalidDay(String),

    #[error("invalid opt-out keywords: {0}")]
    InvalidKeyword(#[from] regex::Error),
}
