//! Compliance checks shared by list building, dispatch and reply handling.

use chrono::{DateTime, Duration, Utc};

use crate::config::ComplianceConfig;
use crate::store::Campaign;

use super::{BusinessHours, BusinessHoursWindow, ComplianceError, OptOutDetector};

/// Outcome of a send-time compliance check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCheck {
    /// Send may proceed
    Allowed,
    /// Contact has opted out; the send must be skipped
    OptedOut,
    /// Outside the sending window; retry at `resume_at`
    OutsideHours { resume_at: DateTime<Utc> },
}

/// Opt-out, business-hours and frequency rules.
///
/// Holds only configuration. Every check is evaluated from the arguments it
/// is given, so callers always see the current time and contact state.
#[derive(Debug, Clone)]
pub struct ComplianceGuard {
    default_hours: BusinessHoursWindow,
    frequency_cap: Duration,
    lookback: Duration,
    opt_out: OptOutDetector,
}

/// Convert a config duration, saturating on overflow.
pub(crate) fn chrono_duration(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or_else(|_| Duration::days(365 * 100))
}

impl ComplianceGuard {
    pub fn new(config: &ComplianceConfig) -> Result<Self, ComplianceError> {
        config.business_hours.compile()?;
        Ok(Self {
            default_hours: config.business_hours.clone(),
            frequency_cap: chrono_duration(config.frequency_cap),
            lookback: chrono_duration(config.lookback),
            opt_out: OptOutDetector::new(&config.opt_out_keywords)?,
        })
    }

    /// Sending window for a campaign, compiled fresh.
    pub fn business_hours(&self, campaign: &Campaign) -> Result<BusinessHours, ComplianceError> {
        campaign
            .business_hours
            .as_ref()
            .unwrap_or(&self.default_hours)
            .compile()
    }

    /// Send-time check. Opt-out takes precedence over the hours window.
    pub fn check_send(
        &self,
        contact_opted_out: bool,
        hours: &BusinessHours,
        now: DateTime<Utc>,
    ) -> SendCheck {
        if contact_opted_out {
            return SendCheck::OptedOut;
        }
        if hours.is_open(now) {
            return SendCheck::Allowed;
        }
        let resume_at = hours
            .next_open(now)
            .unwrap_or_else(|| now + Duration::days(1));
        SendCheck::OutsideHours { resume_at }
    }

    /// Check whether a contact was messaged too recently for a new list.
    pub fn is_frequency_capped(&self, last_sent: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        last_sent.is_some_and(|t| now - t < self.frequency_cap)
    }

    /// Check whether an inbound body requests an opt-out.
    pub fn is_opt_out(&self, body: &str) -> bool {
        self.opt_out.is_opt_out(body)
    }

    /// Reply attribution window.
    pub fn lookback(&self) -> Duration {
        self.lookback
    }

    pub fn frequency_cap(&self) -> Duration {
        self.frequency_cap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn guard() -> ComplianceGuard {
        ComplianceGuard::new(&ComplianceConfig::default()).unwrap()
    }

    #[test]
    fn test_opt_out_wins_over_hours() {
        let g = guard();
        let campaign = Campaign::new("c", "hi", 10);
        let hours = g.business_hours(&campaign).unwrap();
        let noon = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2026, 3, 2, 22, 0, 0).unwrap();

        assert_eq!(g.check_send(false, &hours, noon), SendCheck::Allowed);
        assert_eq!(g.check_send(true, &hours, noon), SendCheck::OptedOut);
        assert_eq!(g.check_send(true, &hours, night), SendCheck::OptedOut);
        assert_eq!(
            g.check_send(false, &hours, night),
            SendCheck::OutsideHours {
                resume_at: Utc.with_ymd_and_hms(2026, 3, 3, 9, 0, 0).unwrap()
            }
        );
    }

    #[test]
    fn test_campaign_window_overrides_default() {
        let g = guard();
        let campaign = Campaign::new("c", "hi", 10)
            .with_business_hours(BusinessHoursWindow::new("06:00", "07:00", "UTC"));
        let hours = g.business_hours(&campaign).unwrap();
        assert!(hours.is_open(Utc.with_ymd_and_hms(2026, 3, 2, 6, 30, 0).unwrap()));
        assert!(!hours.is_open(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()));
    }

    #[test]
    fn test_frequency_cap() {
        let g = guard();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        assert!(!g.is_frequency_capped(None, now));
        assert!(g.is_frequency_capped(Some(now - Duration::days(6)), now));
        assert!(!g.is_frequency_capped(Some(now - Duration::days(7)), now));
    }
}
