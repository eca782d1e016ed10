//! Recurrence rules for recurring campaigns.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Recurrence frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceFrequency {
    /// Every N hours
    Hourly,
    /// Every N days
    Daily,
    /// Every N weeks
    Weekly,
}

/// Recurrence rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: RecurrenceFrequency,
    /// Every N periods (0 is treated as 1)
    pub interval: u32,
    /// No runs after this instant
    pub end_date: Option<DateTime<Utc>>,
}

impl RecurrenceRule {
    pub fn hourly(interval: u32) -> Self {
        Self::every(RecurrenceFrequency::Hourly, interval)
    }

    pub fn daily(interval: u32) -> Self {
        Self::every(RecurrenceFrequency::Daily, interval)
    }

    pub fn weekly(interval: u32) -> Self {
        Self::every(RecurrenceFrequency::Weekly, interval)
    }

    fn every(frequency: RecurrenceFrequency, interval: u32) -> Self {
        Self {
            frequency,
            interval,
            end_date: None,
        }
    }

    /// Set end date.
    pub fn until(mut self, end: DateTime<Utc>) -> Self {
        self.end_date = Some(end);
        self
    }

    /// Next run after `from`, or None once past the end date.
    pub fn next_from(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let n = self.interval.max(1) as i64;
        let next = match self.frequency {
            RecurrenceFrequency::Hourly => from + Duration::hours(n),
            RecurrenceFrequency::Daily => from + Duration::days(n),
            RecurrenceFrequency::Weekly => from + Duration::weeks(n),
        };

        match self.end_date {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_next_from() {
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        assert_eq!(RecurrenceRule::hourly(6).next_from(t), Some(t + Duration::hours(6)));
        assert_eq!(RecurrenceRule::daily(1).next_from(t), Some(t + Duration::days(1)));
        assert_eq!(RecurrenceRule::weekly(2).next_from(t), Some(t + Duration::weeks(2)));
        assert_eq!(RecurrenceRule::daily(0).next_from(t), Some(t + Duration::days(1)));
    }

    #[test]
    fn test_end_date_stops_recurrence() {
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let rule = RecurrenceRule::daily(1).until(t + Duration::hours(12));
        assert_eq!(rule.next_from(t), None);
    }
}
