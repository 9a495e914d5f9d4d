//! Cron expression parsing and next-run evaluation.
//!
//! The evaluator owns both halves of the contract: the grammar accepted by
//! [`CronExpr::parse`] is exactly the grammar [`CronExpr::next_after`] can
//! evaluate, so a stored expression can never validate but fail to schedule.
//!
//! Cadence arithmetic is performed on the IST wall clock (UTC+5:30, no DST):
//! the UTC instant is shifted by the fixed offset, matched against the
//! expression in civil time, and shifted back.

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, Timelike, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Civil timezone used for all cadence arithmetic.
pub const TIMEZONE: &str = "Asia/Kolkata";

/// Fixed IST offset from UTC, in minutes.
const IST_OFFSET_MINUTES: i64 = 330;

/// How far ahead `next_after` searches before giving up. Wide enough for any
/// expression with at least one firing per year.
const SEARCH_HORIZON_DAYS: i64 = 366;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronError {
    #[error("invalid cron expression '{expression}': expected 5 fields, found {found}")]
    FieldCount { expression: String, found: usize },

    #[error("invalid {field} field '{value}' in cron expression")]
    InvalidField { field: &'static str, value: String },

    #[error("{field} value {value} is out of range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

/// A parsed 5-field cron expression: `minute hour day month dayOfWeek`.
///
/// Supported field forms: `*`, bare integers, `*/N` steps, `a-b` ranges, and
/// comma lists of integers and ranges. Seconds fields, names, and the
/// Quartz-style `L`/`W`/`?` forms are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    expression: String,
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
}

struct FieldDef {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: FieldDef = FieldDef { name: "minute", min: 0, max: 59 };
const HOUR: FieldDef = FieldDef { name: "hour", min: 0, max: 23 };
const DAY: FieldDef = FieldDef { name: "day", min: 1, max: 31 };
const MONTH: FieldDef = FieldDef { name: "month", min: 1, max: 12 };
// 7 is accepted as an alias for Sunday and normalized to 0.
const WEEKDAY: FieldDef = FieldDef { name: "dayOfWeek", min: 0, max: 7 };

impl CronExpr {
    /// Parse and validate a 5-field expression.
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount {
                expression: expression.to_string(),
                found: fields.len(),
            });
        }

        let minutes = parse_field(fields[0], &MINUTE)?;
        let hours = parse_field(fields[1], &HOUR)?;
        let days = parse_field(fields[2], &DAY)?;
        let months = parse_field(fields[3], &MONTH)?;
        let mut weekdays = parse_field(fields[4], &WEEKDAY)?;

        // Fold the Sunday alias into bit 0.
        if weekdays & (1 << 7) != 0 {
            weekdays = (weekdays & !(1 << 7)) | 1;
        }

        Ok(CronExpr {
            expression: expression.to_string(),
            minutes,
            hours,
            days,
            months,
            weekdays,
        })
    }

    /// Whether `expression` is well-formed under the supported grammar.
    pub fn validate(expression: &str) -> bool {
        Self::parse(expression).is_ok()
    }

    /// The original expression text.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The smallest UTC instant strictly after `after` whose IST wall clock
    /// matches this expression. Seconds are truncated to zero; if `after`
    /// itself matches, the result is the following match.
    ///
    /// Falls back to `after + 1h` (with a warning) when no match exists
    /// within the search horizon, e.g. `0 0 31 2 *`.
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        match self.try_next_after(after) {
            Some(next) => next,
            None => {
                warn!(
                    expression = %self.expression,
                    "no cron match within {} days, falling back to +1h",
                    SEARCH_HORIZON_DAYS
                );
                after + Duration::hours(1)
            }
        }
    }

    /// `next_after` without the fallback; `None` when the expression has no
    /// match inside the search horizon.
    pub fn try_next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        // Shift into the IST frame and treat the result as a civil clock.
        let shifted = after.naive_utc() + Duration::minutes(IST_OFFSET_MINUTES);
        let mut civil = shifted.with_second(0)?.with_nanosecond(0)?;
        civil += Duration::minutes(1);

        let limit = civil + Duration::days(SEARCH_HORIZON_DAYS);
        while civil <= limit {
            if !self.date_matches(&civil) {
                civil = civil.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if self.hours & (1 << civil.hour()) == 0 {
                civil = civil.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if self.minutes & (1 << civil.minute()) == 0 {
                civil += Duration::minutes(1);
                continue;
            }
            let utc = civil - Duration::minutes(IST_OFFSET_MINUTES);
            return Some(DateTime::from_naive_utc_and_offset(utc, Utc));
        }
        None
    }

    /// The next `count` firings, each seeded from the prior result plus one
    /// second. Powers the validate-cron preview.
    pub fn preview(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut runs = Vec::with_capacity(count);
        let mut seed = from;
        for _ in 0..count {
            let next = self.next_after(seed);
            seed = next + Duration::seconds(1);
            runs.push(next);
        }
        runs
    }

    fn date_matches(&self, civil: &NaiveDateTime) -> bool {
        self.months & (1 << civil.month()) != 0
            && self.days & (1 << civil.day()) != 0
            && self.weekdays & (1 << civil.weekday().num_days_from_sunday()) != 0
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn parse_field(field: &str, def: &FieldDef) -> Result<u64, CronError> {
    let invalid = || CronError::InvalidField {
        field: def.name,
        value: field.to_string(),
    };

    if field.is_empty() {
        return Err(invalid());
    }

    let mut mask: u64 = 0;
    for part in field.split(',') {
        if part == "*" {
            mask |= range_mask(def.min, def.max);
        } else if let Some(step) = part.strip_prefix("*/") {
            let step: u32 = step.parse().map_err(|_| invalid())?;
            if step == 0 {
                return Err(invalid());
            }
            let mut value = def.min;
            while value <= def.max {
                mask |= 1 << value;
                value += step;
            }
        } else if let Some((start, end)) = part.split_once('-') {
            let start = parse_value(start, def)?;
            let end = parse_value(end, def)?;
            if start > end {
                return Err(invalid());
            }
            mask |= range_mask(start, end);
        } else {
            mask |= 1 << parse_value(part, def)?;
        }
    }
    Ok(mask)
}

fn parse_value(value: &str, def: &FieldDef) -> Result<u32, CronError> {
    let parsed: u32 = value.parse().map_err(|_| CronError::InvalidField {
        field: def.name,
        value: value.to_string(),
    })?;
    if parsed < def.min || parsed > def.max {
        return Err(CronError::OutOfRange {
            field: def.name,
            value: parsed,
            min: def.min,
            max: def.max,
        });
    }
    Ok(parsed)
}

fn range_mask(min: u32, max: u32) -> u64 {
    let mut mask = 0u64;
    for value in min..=max {
        mask |= 1 << value;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn accepts_supported_grammar() {
        for expr in [
            "* * * * *",
            "*/5 * * * *",
            "30 9 * * *",
            "0 0 1 1 *",
            "1-5 * * * *",
            "0 9 * * 1-5",
            "0 12 * * 6,0",
            "15,45 8,20 * * *",
            "59 23 31 12 7",
        ] {
            assert!(CronExpr::validate(expr), "expected valid: {expr}");
        }
    }

    #[test]
    fn rejects_unsupported_grammar() {
        for expr in [
            "",
            "bogus",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * 32 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-1 * * * *",
            "L * * * *",
            "* * ? * *",
            "* * * * MON",
            "@daily",
        ] {
            assert!(!CronExpr::validate(expr), "expected invalid: {expr}");
        }
    }

    #[test]
    fn every_minute_advances_to_next_minute_boundary() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        let next = expr.next_after(utc(2024, 1, 15, 10, 0, 30));
        assert_eq!(next, utc(2024, 1, 15, 10, 1, 0));
    }

    #[test]
    fn exact_match_yields_the_following_instant() {
        // If t0 itself matches, the result is the next match, never t0.
        let expr = CronExpr::parse("* * * * *").unwrap();
        let next = expr.next_after(utc(2024, 1, 15, 10, 0, 0));
        assert_eq!(next, utc(2024, 1, 15, 10, 1, 0));
    }

    #[test]
    fn step_minutes_align_in_ist() {
        // 10:07 UTC is 15:37 IST; the next */15 slot is 15:45 IST = 10:15 UTC.
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        let next = expr.next_after(utc(2024, 1, 15, 10, 7, 0));
        assert_eq!(next, utc(2024, 1, 15, 10, 15, 0));
    }

    #[test]
    fn fixed_minute_each_hour() {
        // 10:50 UTC is 16:20 IST; minute 10 next occurs at 17:10 IST = 11:40 UTC.
        let expr = CronExpr::parse("10 * * * *").unwrap();
        let next = expr.next_after(utc(2024, 1, 15, 10, 50, 0));
        assert_eq!(next, utc(2024, 1, 15, 11, 40, 0));
    }

    #[test]
    fn daily_at_fixed_ist_time() {
        // 9:30 IST daily is 04:00 UTC.
        let expr = CronExpr::parse("30 9 * * *").unwrap();
        let next = expr.next_after(utc(2024, 1, 15, 0, 0, 0));
        assert_eq!(next, utc(2024, 1, 15, 4, 0, 0));

        // Past 9:30 IST, the match rolls to the next day.
        let next = expr.next_after(utc(2024, 1, 15, 4, 0, 0));
        assert_eq!(next, utc(2024, 1, 16, 4, 0, 0));
    }

    #[test]
    fn midnight_ist_is_1830_utc() {
        let expr = CronExpr::parse("0 0 * * *").unwrap();
        let next = expr.next_after(utc(2024, 1, 15, 0, 0, 0));
        assert_eq!(next, utc(2024, 1, 15, 18, 30, 0));
    }

    #[test]
    fn weekday_match_uses_ist_calendar() {
        // 2024-01-15 is a Monday; Monday noon IST is 06:30 UTC.
        let expr = CronExpr::parse("0 12 * * 1").unwrap();
        let next = expr.next_after(utc(2024, 1, 15, 0, 0, 0));
        assert_eq!(next, utc(2024, 1, 15, 6, 30, 0));
    }

    #[test]
    fn sunday_alias_seven_matches_sunday() {
        let seven = CronExpr::parse("0 0 * * 7").unwrap();
        let zero = CronExpr::parse("0 0 * * 0").unwrap();
        let from = utc(2024, 1, 15, 0, 0, 0);
        assert_eq!(seven.next_after(from), zero.next_after(from));
    }

    #[test]
    fn yearly_rollover() {
        let expr = CronExpr::parse("0 0 1 1 *").unwrap();
        let next = expr.next_after(utc(2024, 6, 1, 0, 0, 0));
        // Jan 1 00:00 IST 2025 is Dec 31 18:30 UTC 2024.
        assert_eq!(next, utc(2024, 12, 31, 18, 30, 0));
    }

    #[test]
    fn unmatchable_date_falls_back_one_hour() {
        let expr = CronExpr::parse("0 0 31 2 *").unwrap();
        let from = utc(2024, 1, 15, 10, 0, 0);
        assert_eq!(expr.try_next_after(from), None);
        assert_eq!(expr.next_after(from), from + Duration::hours(1));
    }

    #[test]
    fn next_after_is_strictly_increasing() {
        for expr in ["* * * * *", "*/5 * * * *", "30 9 * * *", "0 9 * * 1-5"] {
            let expr = CronExpr::parse(expr).unwrap();
            let t1 = expr.next_after(utc(2024, 1, 15, 10, 0, 0));
            let t2 = expr.next_after(t1);
            assert!(t2 > t1, "{expr}: {t1} -> {t2}");
        }
    }

    #[test]
    fn validated_expressions_always_evaluate() {
        // Anything the parser accepts must produce a next run (possibly via
        // the fallback) for arbitrary inputs.
        let inputs = [
            utc(2024, 1, 1, 0, 0, 0),
            utc(2024, 2, 29, 23, 59, 59),
            utc(2024, 12, 31, 18, 29, 59),
        ];
        for expr in ["* * * * *", "59 23 31 12 *", "0 12 * * 6,0", "1-5 2 * * *"] {
            let parsed = CronExpr::parse(expr).unwrap();
            for t in inputs {
                assert!(parsed.next_after(t) > t);
            }
        }
    }

    #[test]
    fn preview_yields_successive_distinct_runs() {
        let expr = CronExpr::parse("*/5 * * * *").unwrap();
        let runs = expr.preview(utc(2024, 1, 15, 10, 2, 0), 5);
        assert_eq!(runs.len(), 5);
        for pair in runs.windows(2) {
            assert!(pair[1] > pair[0]);
            assert_eq!((pair[1] - pair[0]).num_minutes(), 5);
        }
    }

    #[test]
    fn range_and_list_fields_match_consistently() {
        let expr = CronExpr::parse("0 9 * * 1-5").unwrap();
        // 2024-01-13 is a Saturday; the next weekday 9:00 IST is Monday the
        // 15th, 03:30 UTC.
        let next = expr.next_after(utc(2024, 1, 13, 0, 0, 0));
        assert_eq!(next, utc(2024, 1, 15, 3, 30, 0));
    }
}
