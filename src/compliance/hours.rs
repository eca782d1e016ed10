//! Business-hours windows.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::ComplianceError;

/// How many days ahead `next_open` searches before giving up.
const MAX_SEARCH_DAYS: i64 = 370;

/// Sending window as written in config and on campaigns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessHoursWindow {
    /// Opening time (HH:MM, local)
    #[serde(default = "default_start")]
    pub start: String,
    /// Closing time (HH:MM, local, exclusive)
    #[serde(default = "default_end")]
    pub end: String,
    /// IANA timezone name
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Allowed weekdays (empty = all days)
    #[serde(default)]
    pub days: Vec<String>,
    /// Local dates with no sending at all
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

fn default_start() -> String {
    "09:00".to_string()
}

fn default_end() -> String {
    "20:00".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for BusinessHoursWindow {
    fn default() -> Self {
        Self {
            start: default_start(),
            end: default_end(),
            timezone: default_timezone(),
            days: Vec::new(),
            holidays: Vec::new(),
        }
    }
}

impl BusinessHoursWindow {
    pub fn new(start: &str, end: &str, timezone: &str) -> Self {
        Self {
            start: start.to_string(),
            end: end.to_string(),
            timezone: timezone.to_string(),
            days: Vec::new(),
            holidays: Vec::new(),
        }
    }

    /// Restrict to the given weekdays ("mon", "tuesday", ...).
    pub fn with_days<S: AsRef<str>>(mut self, days: &[S]) -> Self {
        self.days = days.iter().map(|d| d.as_ref().to_string()).collect();
        self
    }

    pub fn with_holidays(mut self, holidays: Vec<NaiveDate>) -> Self {
        self.holidays = holidays;
        self
    }

    /// Parse into an evaluable window.
    pub fn compile(&self) -> Result<BusinessHours, ComplianceError> {
        let parse_time = |s: &str| {
            NaiveTime::parse_from_str(s, "%H:%M")
                .map_err(|_| ComplianceError::InvalidTime(s.to_string()))
        };
        let start = parse_time(&self.start)?;
        let end = parse_time(&self.end)?;
        let timezone: Tz = self
            .timezone
            .parse()
            .map_err(|_| ComplianceError::InvalidTimezone(self.timezone.clone()))?;

        let days = self
            .days
            .iter()
            .map(|d| {
                d.parse::<Weekday>()
                    .map_err(|_| ComplianceError::InvalidDay(d.clone()))
            })
            .collect::<Result<HashSet<_>, _>>()?;

        Ok(BusinessHours {
            start,
            end,
            days,
            holidays: self.holidays.iter().copied().collect(),
            timezone,
        })
    }
}

/// Evaluable business-hours window.
///
/// `start == end` means open around the clock on allowed days; `start > end`
/// is an overnight window (e.g. 22:00 - 06:00).
#[derive(Debug, Clone)]
pub struct BusinessHours {
    start: NaiveTime,
    end: NaiveTime,
    days: HashSet<Weekday>,
    holidays: HashSet<NaiveDate>,
    timezone: Tz,
}

impl BusinessHours {
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Check whether sending is allowed at `at`.
    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.timezone);
        let date = local.date_naive();

        if self.holidays.contains(&date) {
            return false;
        }
        if !self.days.is_empty() && !self.days.contains(&local.weekday()) {
            return false;
        }

        let time = local.time();
        if self.start == self.end {
            true
        } else if self.start < self.end {
            time >= self.start && time < self.end
        } else {
            time >= self.start || time < self.end
        }
    }

    /// Earliest instant at or after `at` when the window is open.
    pub fn next_open(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_open(at) {
            return Some(at);
        }

        let today = at.with_timezone(&self.timezone).date_naive();
        let overnight = self.start > self.end;

        for offset in 0..=MAX_SEARCH_DAYS {
            let date = today + Duration::days(offset);
            let mut candidates = Vec::with_capacity(2);
            if overnight {
                candidates.extend(date.and_hms_opt(0, 0, 0));
            }
            candidates.push(date.and_time(self.start));

            for local in candidates {
                if let Some(utc) = self.resolve_local(local) {
                    if utc > at && self.is_open(utc) {
                        return Some(utc);
                    }
                }
            }
        }

        None
    }

    /// Local wall time to UTC, stepping over DST gaps.
    fn resolve_local(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        self.timezone
            .from_local_datetime(&local)
            .earliest()
            .or_else(|| {
                self.timezone
                    .from_local_datetime(&(local + Duration::hours(1)))
                    .earliest()
            })
            .map(|t| t.with_timezone(&Utc))
    }
}
