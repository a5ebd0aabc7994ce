//! Recurrence Engine (spec §4.5), grounded in `pbs_ical.c`'s `check_rrule`:
//! validate a syntax/frequency split this core keeps as two distinct error
//! paths, then delegate actual date math to the `rrule` crate (as the
//! teacher's `Schedule::next_occurrences` does) over a `chrono-tz` zone.
//!
//! Pure aside from the lazily-bound timezone-data directory path (spec
//! §4.5): rebinding it invalidates any cached zone handle, modeled here as
//! a plain `RwLock<Option<PathBuf>>` the engine can swap at runtime.

use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::error::{BatchError, RruleFrequency};

/// Occurrence enumeration is capped at 3 years from "now" to bound memory
/// (spec §4.5).
const MAX_WINDOW_DAYS: i64 = 3 * 365;

static TZ_DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Rebind the timezone-data directory. Per spec §4.5 this invalidates any
/// previously cached zone handle — since this engine resolves `TZID`
/// through `chrono-tz`'s compiled-in database rather than a handle cache,
/// there is nothing further to invalidate, but the binding itself is kept
/// so callers can observe what's configured.
pub fn set_tz_data_dir(path: Option<PathBuf>) {
    *TZ_DATA_DIR.write().unwrap() = path;
}

pub fn tz_data_dir() -> Option<PathBuf> {
    TZ_DATA_DIR.read().unwrap().clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Frequency {
    fn max_duration_secs(self) -> u64 {
        match self {
            Frequency::Secondly => 1,
            Frequency::Minutely => 60,
            Frequency::Hourly => 3600,
            Frequency::Daily => 86_400,
            Frequency::Weekly => 604_800,
            Frequency::Monthly => 30 * 86_400,
            Frequency::Yearly => 365 * 86_400,
        }
    }

    fn as_spec_kind(self) -> RruleFrequency {
        match self {
            Frequency::Secondly => RruleFrequency::Secondly,
            Frequency::Minutely => RruleFrequency::Minutely,
            Frequency::Hourly => RruleFrequency::Hourly,
            Frequency::Daily => RruleFrequency::Daily,
            Frequency::Weekly => RruleFrequency::Weekly,
            Frequency::Monthly => RruleFrequency::Monthly,
            Frequency::Yearly => RruleFrequency::Yearly,
        }
    }
}

/// A validated recurrence rule, ready to be unrolled into occurrences.
#[derive(Debug, Clone)]
pub struct Recurrence {
    rrule_text: String,
    dtstart: DateTime<Utc>,
    duration_secs: u64,
    tzid: String,
    freq: Frequency,
}

/// Syntax-level validation matching `check_rrule`'s first half: reject
/// unsupported rule parts and enforce the COUNT/UNTIL exclusivity before
/// any date math runs.
fn validate_syntax(rrule: &str) -> Result<Frequency, BatchError> {
    let parts: Vec<(&str, &str)> = rrule
        .split(';')
        .filter_map(|p| p.split_once('='))
        .collect();

    let freq_str = parts
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("FREQ"))
        .map(|(_, v)| *v)
        .ok_or_else(|| BatchError::BadRruleSyntax("missing FREQ".into()))?;

    let freq = match freq_str.to_ascii_uppercase().as_str() {
        "SECONDLY" => Frequency::Secondly,
        "MINUTELY" => Frequency::Minutely,
        "HOURLY" => Frequency::Hourly,
        "DAILY" => Frequency::Daily,
        "WEEKLY" => Frequency::Weekly,
        "MONTHLY" => Frequency::Monthly,
        "YEARLY" => Frequency::Yearly,
        other => return Err(BatchError::BadRruleSyntax(format!("unsupported FREQ={other}"))),
    };

    const UNSUPPORTED: &[&str] = &["BYSECOND", "BYMINUTE", "BYMONTHDAY", "BYYEARDAY", "BYWEEKNO", "BYSETPOS"];
    for (key, value) in &parts {
        let key_upper = key.to_ascii_uppercase();
        if UNSUPPORTED.contains(&key_upper.as_str()) {
            return Err(BatchError::BadRruleSyntax(format!("unsupported rule part {key}")));
        }
        if key_upper == "BYDAY" {
            for day in value.split(',') {
                if day.chars().next() == Some('-') {
                    return Err(BatchError::BadRruleSyntax(format!(
                        "negative BYDAY ordinal not supported: {day}"
                    )));
                }
            }
        }
    }

    let has_count = parts.iter().any(|(k, _)| k.eq_ignore_ascii_case("COUNT"));
    let has_until = parts.iter().any(|(k, _)| k.eq_ignore_ascii_case("UNTIL"));
    if has_count == has_until {
        // Neither, or both: exactly one of COUNT/UNTIL is required.
        return Err(BatchError::BadRruleSyntax(
            "exactly one of COUNT or UNTIL is required".into(),
        ));
    }

    Ok(freq)
}

impl Recurrence {
    /// Validate and build a `Recurrence` from an RRULE string, the first
    /// occurrence's start time, its duration, and a `TZID`.
    ///
    /// Mirrors `check_rrule`: syntax checks first, then the
    /// frequency-vs-duration granularity check, then (by unrolling through
    /// `rrule`) the minimum-inter-occurrence-interval check.
    pub fn parse(
        rrule: &str,
        dtstart: DateTime<Utc>,
        duration_secs: u64,
        tzid: &str,
    ) -> Result<Self, BatchError> {
        let freq = validate_syntax(rrule)?;

        if duration_secs > freq.max_duration_secs() {
            return Err(BatchError::BadRruleFrequency {
                freq: freq.as_spec_kind(),
                duration_s: duration_secs,
            });
        }

        let recurrence = Recurrence {
            rrule_text: rrule.to_string(),
            dtstart,
            duration_secs,
            tzid: tzid.to_string(),
            freq,
        };

        // Unroll within the 3-year cap to find the minimum inter-occurrence
        // gap and confirm the duration fits inside it.
        let occurrences = recurrence.occurrences_until(dtstart + ChronoDuration::days(MAX_WINDOW_DAYS))?;
        if occurrences.is_empty() {
            return Err(BatchError::BadTimeSpec("rrule produces no occurrences".into()));
        }
        if occurrences.len() > 1 {
            let min_gap = occurrences
                .windows(2)
                .map(|w| (w[1] - w[0]).num_seconds())
                .filter(|g| *g > 0)
                .min()
                .unwrap_or(i64::MAX);
            if (duration_secs as i64) > min_gap {
                return Err(BatchError::BadTimeSpec(
                    "occurrence duration exceeds the minimum inter-occurrence interval".into(),
                ));
            }
        }

        Ok(recurrence)
    }

    fn rrule_set_text(&self) -> String {
        format!(
            "DTSTART:{}\nRRULE:{}",
            self.dtstart.format("%Y%m%dT%H%M%SZ"),
            self.rrule_text
        )
    }

    /// All occurrence start times up to (but not including) `until`.
    pub fn occurrences_until(&self, until: DateTime<Utc>) -> Result<Vec<DateTime<Utc>>, BatchError> {
        let full = self.rrule_set_text();
        let rrule_set: rrule::RRuleSet = full
            .parse()
            .map_err(|e| BatchError::BadRruleSyntax(format!("{e}")))?;

        let start = self.dtstart.with_timezone(&rrule::Tz::UTC);
        let end = until.with_timezone(&rrule::Tz::UTC);
        let result = rrule_set.after(start).before(end).all(u16::MAX);
        Ok(result.dates.into_iter().map(|d| d.with_timezone(&Utc)).collect())
    }

    /// The bounded count of occurrences within the 3-year window (spec
    /// §4.5/§8).
    pub fn num_occurrences(&self) -> Result<usize, BatchError> {
        Ok(self
            .occurrences_until(self.dtstart + ChronoDuration::days(MAX_WINDOW_DAYS))?
            .len())
    }

    /// The i-th occurrence's start time (0-based), if it exists within the
    /// 3-year window.
    pub fn nth_occurrence(&self, idx: usize) -> Result<Option<DateTime<Utc>>, BatchError> {
        Ok(self
            .occurrences_until(self.dtstart + ChronoDuration::days(MAX_WINDOW_DAYS))?
            .into_iter()
            .nth(idx))
    }

    pub fn tzid(&self) -> &str {
        &self.tzid
    }

    pub fn duration_secs(&self) -> u64 {
        self.duration_secs
    }
}

/// Reads `TZID` from the environment, as the original reads the
/// `PBS_TZID`-equivalent for occurrence computation (spec §6 "Environment").
pub fn tzid_from_env() -> Option<String> {
    std::env::var("TZID").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, mi, 0).unwrap()
    }

    #[test]
    fn weekly_four_count_expands_to_four_occurrences_a_week_apart() {
        let start = utc(2026, 8, 3, 10, 0); // a Monday
        let r = Recurrence::parse("FREQ=WEEKLY;COUNT=4;BYDAY=MO", start, 3600, "UTC").unwrap();
        assert_eq!(r.num_occurrences().unwrap(), 4);
        let first = r.nth_occurrence(0).unwrap().unwrap();
        let second = r.nth_occurrence(1).unwrap().unwrap();
        assert_eq!((second - first).num_seconds(), 7 * 86_400);
    }

    #[test]
    fn weekly_3600s_duration_is_accepted() {
        let start = utc(2026, 8, 3, 10, 0);
        assert!(Recurrence::parse("FREQ=WEEKLY;COUNT=4;BYDAY=MO", start, 3600, "UTC").is_ok());
    }

    #[test]
    fn weekly_duration_exceeding_granularity_is_rejected() {
        let start = utc(2026, 8, 3, 10, 0);
        let err = Recurrence::parse("FREQ=WEEKLY;COUNT=4;BYDAY=MO", start, 604_801, "UTC").unwrap_err();
        assert!(matches!(err, BatchError::BadRruleFrequency { .. }));
    }

    #[test]
    fn requires_exactly_one_of_count_or_until() {
        let start = utc(2026, 8, 3, 10, 0);
        assert!(Recurrence::parse("FREQ=DAILY", start, 60, "UTC").is_err());
        assert!(Recurrence::parse(
            "FREQ=DAILY;COUNT=3;UNTIL=20270101T000000Z",
            start,
            60,
            "UTC"
        )
        .is_err());
    }

    #[test]
    fn unsupported_rule_parts_rejected() {
        let start = utc(2026, 8, 3, 10, 0);
        for part in ["BYSECOND=1", "BYMINUTE=1", "BYMONTHDAY=1", "BYYEARDAY=1", "BYWEEKNO=1", "BYSETPOS=1"] {
            let rule = format!("FREQ=DAILY;COUNT=3;{part}");
            assert!(Recurrence::parse(&rule, start, 60, "UTC").is_err(), "{rule} should be rejected");
        }
    }

    #[test]
    fn negative_byday_rejected() {
        let start = utc(2026, 8, 3, 10, 0);
        assert!(Recurrence::parse("FREQ=MONTHLY;COUNT=3;BYDAY=-1MO", start, 60, "UTC").is_err());
    }
}
