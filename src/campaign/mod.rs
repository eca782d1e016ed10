//! Campaign definitions, recipient selection and enrollment.
//!
//! Enrollment runs the list pipeline and persists one pending membership per
//! eligible contact:
//!
//! ```text
//! CampaignList ─► ListBuilder ─► VariantAssigner ─► Personalizer ─► insert_memberships
//! ```

mod filter;
mod list;
mod personalize;
mod recurrence;
mod service;
mod variant;

pub use filter::{CampaignList, Condition, FilterValue, Operator, Predicate};
pub use list::{BuiltList, ListBuilder};
pub use personalize::{
    Encoding, Personalizer, Rendered, DEFAULT_FIRST_NAME, GSM_LIMIT, TRUNCATION_MARKER,
    UNICODE_LIMIT,
};
pub use recurrence::{RecurrenceFrequency, RecurrenceRule};
pub use service::{CampaignService, EnrollReport, LifecycleReport};
pub use variant::{VariantAssigner, FLOOR_MIN_ELIGIBLE, FLOOR_VARIANT_B};

use thiserror::Error;

use crate::compliance::ComplianceError;
use crate::directory::DirectoryError;
use crate::store::{Campaign, CampaignId, CampaignKind, CampaignStatus, StoreError};

/// Campaign errors.
#[derive(Debug, Error)]
pub enum CampaignError {
    /// Malformed campaign configuration
    #[error("invalid campaign: {0}")]
    Validation(String),

    #[error("cannot move campaign from {} to {}", .from.name(), .to.name())]
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },

    #[error("campaign not found: {0}")]
    NotFound(CampaignId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Compliance(#[from] ComplianceError),

    #[error("template engine: {0}")]
    Template(#[from] regex::Error),
}

/// Check a campaign definition before it is stored.
pub fn validate(campaign: &Campaign) -> Result<(), CampaignError> {
    let invalid = |msg: &str| Err(CampaignError::Validation(msg.to_string()));

    if campaign.template_a.trim().is_empty() {
        return invalid("template A must not be empty");
    }
    if campaign.ab_split_percent > 100 {
        return invalid("A/B split must be between 0 and 100");
    }
    if campaign.daily_limit == 0 {
        return invalid("daily limit must be greater than zero");
    }

    match campaign.kind {
        CampaignKind::AbTest => {
            if campaign
                .template_b
                .as_deref()
                .map_or(true, |b| b.trim().is_empty())
            {
                return invalid("A/B test campaigns require template B");
            }
        }
        CampaignKind::Recurring => {
            if campaign.recurrence.is_none() {
                return invalid("recurring campaigns require a recurrence rule");
            }
        }
        CampaignKind::Blast => {}
    }

    if let Some(window) = &campaign.business_hours {
        window.compile()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::BusinessHoursWindow;

    #[test]
    fn test_valid_campaigns() {
        assert!(validate(&Campaign::new("c", "Hi {first_name}", 100)).is_ok());
        assert!(validate(&Campaign::new("c", "A", 100).with_ab_test("B", 30)).is_ok());
        assert!(validate(&Campaign::new("c", "A", 1).with_recurrence(RecurrenceRule::daily(1))).is_ok());
    }

    #[test]
    fn test_ab_test_requires_template_b() {
        let mut c = Campaign::new("c", "A", 100).with_split(30);
        c.kind = CampaignKind::AbTest;
        let err = validate(&c).unwrap_err();
        assert!(matches!(err, CampaignError::Validation(ref m) if m.contains("template B")));

        let c = Campaign::new("c", "A", 100).with_ab_test("   ", 30);
        assert!(validate(&c).is_err());
    }

    #[test]
    fn test_rejects_bad_fields() {
        assert!(validate(&Campaign::new("c", "", 100)).is_err());
        assert!(validate(&Campaign::new("c", "A", 0)).is_err());
        assert!(validate(&Campaign::new("c", "A", 10).with_ab_test("B", 101)).is_err());

        let mut recurring = Campaign::new("c", "A", 10);
        recurring.kind = CampaignKind::Recurring;
        assert!(validate(&recurring).is_err());

        let bad_hours = Campaign::new("c", "A", 10)
            .with_business_hours(BusinessHoursWindow::new("25:00", "20:00", "UTC"));
        assert!(matches!(validate(&bad_hours), Err(CampaignError::Compliance(_))));
    }
}
