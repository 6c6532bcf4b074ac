//! Cron schedule evaluation.
//!
//! Supports the standard five-field grammar (minute, hour, day of month, month,
//! day of week) with lists, ranges, steps, wildcards, month and weekday names
//! and the common `@` macros. When both day fields are restricted a day matches
//! if either of them does.

use std::str::FromStr;

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike,
};

use crate::{Error, Result};

/// Give up looking for an occurrence after this many years.
const SEARCH_YEARS: i32 = 5;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Upper bound used by `*` and `a/n`.
    open_max: u32,
    names: &'static [&'static str],
    /// Accepts `?` as a wildcard.
    day_field: bool,
}

const MINUTE: FieldSpec =
    FieldSpec { name: "minute", min: 0, max: 59, open_max: 59, names: &[], day_field: false };
const HOUR: FieldSpec =
    FieldSpec { name: "hour", min: 0, max: 23, open_max: 23, names: &[], day_field: false };
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day of month",
    min: 1,
    max: 31,
    open_max: 31,
    names: &[],
    day_field: true,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    open_max: 12,
    names: MONTH_NAMES,
    day_field: false,
};
// 7 is accepted as an alias for Sunday.
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day of week",
    min: 0,
    max: 7,
    open_max: 6,
    names: WEEKDAY_NAMES,
    day_field: true,
};

/// A parsed cron expression. Each field is a bitset of the values it matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        parse_schedule(expression).map_err(|reason| Error::InvalidSchedule {
            expression: expression.to_string(),
            reason,
        })
    }

    /// The first trigger instant strictly after `after`, evaluated in the
    /// calendar of `after`'s time zone. Local times that do not exist (DST
    /// gaps) are skipped.
    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let tz = after.timezone();
        let local = after.naive_local();
        let mut t = local.date().and_hms_opt(local.hour(), local.minute(), 0)? + Duration::minutes(1);
        let last_year = t.year() + SEARCH_YEARS;

        while t.year() <= last_year {
            if !has_bit(self.months, t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = (t.date() + Duration::days(1)).and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !has_bit(self.hours, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !has_bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }

            match tz.from_local_datetime(&t) {
                LocalResult::Single(candidate) if candidate > *after => return Some(candidate),
                LocalResult::Ambiguous(earliest, latest) => {
                    if earliest > *after {
                        return Some(earliest);
                    }
                    if latest > *after {
                        return Some(latest);
                    }
                }
                _ => {}
            }
            t += Duration::minutes(1);
        }

        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has_bit(self.days_of_month, date.day());
        let dow = has_bit(self.days_of_week, date.weekday().num_days_from_sunday());

        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Compute the next trigger instant of `expression` strictly after `reference`.
pub fn next_run<Tz: TimeZone>(expression: &str, reference: &DateTime<Tz>) -> Result<DateTime<Tz>> {
    CronSchedule::parse(expression)?
        .next_after(reference)
        .ok_or_else(|| Error::InvalidSchedule {
            expression: expression.to_string(),
            reason: format!("no occurrence within {} years", SEARCH_YEARS),
        })
}

fn parse_schedule(expression: &str) -> std::result::Result<CronSchedule, String> {
    let expression = expression.trim();
    let expanded = match expression {
        "@yearly" | "@annually" => "0 0 1 1 *",
        "@monthly" => "0 0 1 * *",
        "@weekly" => "0 0 * * 0",
        "@daily" | "@midnight" => "0 0 * * *",
        "@hourly" => "0 * * * *",
        other if other.starts_with('@') => {
            return Err(format!("unsupported macro {}", other));
        }
        other => other,
    };

    let fields: Vec<&str> = expanded.split_whitespace().collect();
    if fields.first().map_or(false, |first| first.contains('=')) {
        return Err("time zone prefixes are not supported".to_string());
    }
    if fields.len() != 5 {
        return Err(format!("expected 5 fields, found {}", fields.len()));
    }

    let (days_of_week, dow_restricted) = parse_field(fields[4], &DAY_OF_WEEK)?;
    let (days_of_month, dom_restricted) = parse_field(fields[2], &DAY_OF_MONTH)?;

    Ok(CronSchedule {
        minutes: parse_field(fields[0], &MINUTE)?.0,
        hours: parse_field(fields[1], &HOUR)?.0,
        days_of_month,
        months: parse_field(fields[3], &MONTH)?.0,
        days_of_week: fold_sunday(days_of_week),
        dom_restricted,
        dow_restricted,
    })
}

/// Parse one field into a bitset, also reporting whether it restricts values.
fn parse_field(field: &str, spec: &FieldSpec) -> std::result::Result<(u64, bool), String> {
    let mut bits = 0u64;
    let mut restricted = true;

    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("empty list element in {} field", spec.name));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{}' in {} field", step, spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        if range == "?" && !spec.day_field {
            return Err(format!("'?' is only allowed in day fields, not {}", spec.name));
        }

        let (start, end) = if range == "*" || range == "?" {
            if step.unwrap_or(1) == 1 {
                restricted = false;
            }
            (spec.min, spec.open_max)
        } else if let Some((low, high)) = range.split_once('-') {
            (parse_value(low, spec)?, parse_value(high, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            match step {
                Some(_) => (value, spec.open_max.max(value)),
                None => (value, value),
            }
        };

        if start > end {
            return Err(format!(
                "range {}-{} is backwards in {} field",
                start, end, spec.name
            ));
        }

        for value in (start..=end).step_by(step.unwrap_or(1) as usize) {
            bits |= 1 << value;
        }
    }

    Ok((bits, restricted))
}

fn parse_value(token: &str, spec: &FieldSpec) -> std::result::Result<u32, String> {
    let value = match token.parse::<u32>() {
        Ok(value) => value,
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(token))
            .map(|idx| idx as u32 + spec.min)
            .ok_or_else(|| format!("invalid value '{}' in {} field", token, spec.name))?,
    };

    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} out of range {}-{} in {} field",
            value, spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}

fn fold_sunday(days_of_week: u64) -> u64 {
    if has_bit(days_of_week, 7) {
        (days_of_week & !(1 << 7)) | 1
    } else {
        days_of_week
    }
}

fn has_bit(bits: u64, value: u32) -> bool {
    bits & (1 << value) != 0
}

fn start_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn every_five_minutes_from_top_of_hour() {
        let next = next_run("*/5 * * * *", &utc(2024, 5, 1, 12, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 1, 12, 5, 0));
    }

    #[test]
    fn result_is_strictly_after_reference() {
        let next = next_run("0 * * * *", &utc(2024, 5, 1, 13, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 1, 14, 0, 0));

        let next = next_run("*/5 * * * *", &utc(2024, 5, 1, 12, 3, 27)).unwrap();
        assert_eq!(next, utc(2024, 5, 1, 12, 5, 0));
    }

    #[test]
    fn ranges_with_steps() {
        let next = next_run("10-20/5 * * * *", &utc(2024, 5, 1, 12, 12, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 1, 12, 15, 0));

        let next = next_run("10-20/5 * * * *", &utc(2024, 5, 1, 12, 21, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 1, 13, 10, 0));
    }

    #[test]
    fn comma_lists() {
        let next = next_run("0 6,18 * * *", &utc(2024, 5, 1, 7, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 1, 18, 0, 0));
    }

    #[test]
    fn day_of_month_and_day_of_week_are_or_ed_when_both_restricted() {
        // 2024-01-01 is a Monday; the first Friday comes before the 13th.
        let next = next_run("0 0 13 * FRI", &utc(2024, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 5, 0, 0, 0));
    }

    #[test]
    fn weekday_only_schedule_skips_weekend() {
        // 2024-01-06 is a Saturday.
        let next = next_run("0 9 * * MON-FRI", &utc(2024, 1, 6, 10, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 8, 9, 0, 0));
    }

    #[test]
    fn seven_means_sunday() {
        let next = next_run("0 0 * * 7", &utc(2024, 1, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 7, 0, 0, 0));
    }

    #[test]
    fn month_names_roll_into_next_year() {
        let next = next_run("0 0 1 jan *", &utc(2024, 3, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, utc(2025, 1, 1, 0, 0, 0));
    }

    #[test]
    fn macros_expand() {
        let reference = utc(2024, 5, 1, 12, 30, 0);
        assert_eq!(next_run("@hourly", &reference).unwrap(), utc(2024, 5, 1, 13, 0, 0));
        assert_eq!(next_run("@daily", &reference).unwrap(), utc(2024, 5, 2, 0, 0, 0));
        assert_eq!(next_run("@monthly", &reference).unwrap(), utc(2024, 6, 1, 0, 0, 0));
        assert_eq!(next_run("@yearly", &reference).unwrap(), utc(2025, 1, 1, 0, 0, 0));
        // 2024-05-05 is a Sunday.
        assert_eq!(next_run("@weekly", &reference).unwrap(), utc(2024, 5, 5, 0, 0, 0));
    }

    #[test]
    fn evaluates_in_reference_time_zone() {
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let reference = offset.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let next = next_run("0 9 * * *", &reference).unwrap();
        assert_eq!(next, offset.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn wrong_field_count_is_invalid() {
        let err = next_run("* * *", &utc(2024, 5, 1, 12, 0, 0)).unwrap_err();
        assert!(matches!(err, Error::InvalidSchedule { .. }));
        assert!(err.to_string().contains("expected 5 fields"));
    }

    #[test]
    fn malformed_expressions_are_invalid() {
        for expression in [
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 8",
            "*/0 * * * *",
            "5-1 * * * *",
            "1,,2 * * * *",
            "* * * FOO *",
            "@reboot",
            "@every 5m",
            "TZ=UTC 0 * * * *",
            "CRON_TZ=Europe/Berlin 0 * * *",
            "? * * * *",
            "",
        ] {
            assert!(
                matches!(CronSchedule::parse(expression), Err(Error::InvalidSchedule { .. })),
                "{:?} should be rejected",
                expression
            );
        }
    }

    #[test]
    fn time_zone_prefix_is_rejected_by_name() {
        for expression in ["TZ=UTC 0 * * * *", "CRON_TZ=Europe/Berlin 0 * * *"] {
            let err = CronSchedule::parse(expression).unwrap_err();
            assert!(err.to_string().contains("time zone prefixes"), "{}", err);
        }
    }

    #[test]
    fn question_mark_is_a_day_wildcard() {
        // 2024-01-01 is a Monday.
        let next = next_run("0 12 ? * MON", &utc(2024, 1, 1, 13, 0, 0)).unwrap();
        assert_eq!(next, utc(2024, 1, 8, 12, 0, 0));

        let schedule: CronSchedule = "0 12 ? * MON".parse().unwrap();
        assert!(!schedule.dom_restricted);
        assert!(schedule.dow_restricted);
    }

    #[test]
    fn step_from_single_value_runs_to_field_end() {
        let next = next_run("5/15 * * * *", &utc(2024, 5, 1, 12, 6, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 1, 12, 20, 0));

        let next = next_run("5/15 * * * *", &utc(2024, 5, 1, 12, 51, 0)).unwrap();
        assert_eq!(next, utc(2024, 5, 1, 13, 5, 0));
    }

    #[test]
    fn skips_local_times_missing_in_dst_gap() {
        // 02:30 does not exist on 2024-03-31 in this zone.
        let reference = SpringForward.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap();
        let next = next_run("30 2 * * *", &reference).unwrap();
        assert_eq!(next, SpringForward.with_ymd_and_hms(2024, 4, 1, 2, 30, 0).unwrap());

        let reference = SpringForward.with_ymd_and_hms(2024, 3, 31, 1, 45, 0).unwrap();
        let next = next_run("30 * * * *", &reference).unwrap();
        assert_eq!(next, SpringForward.with_ymd_and_hms(2024, 3, 31, 3, 30, 0).unwrap());
        assert_eq!(next.offset().local_minus_utc(), 2 * 3600);
    }

    /// UTC+1 that moves to UTC+2 at 2024-03-31 02:00 local time.
    #[derive(Debug, Clone, Copy)]
    struct SpringForward;

    impl SpringForward {
        fn winter() -> FixedOffset {
            FixedOffset::east_opt(3600).unwrap()
        }

        fn summer() -> FixedOffset {
            FixedOffset::east_opt(2 * 3600).unwrap()
        }

        fn gap_start() -> NaiveDateTime {
            NaiveDate::from_ymd_opt(2024, 3, 31)
                .unwrap()
                .and_hms_opt(2, 0, 0)
                .unwrap()
        }
    }

    impl TimeZone for SpringForward {
        type Offset = FixedOffset;

        fn from_offset(_: &FixedOffset) -> Self {
            SpringForward
        }

        fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<FixedOffset> {
            self.offset_from_local_datetime(&local.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<FixedOffset> {
            let gap_start = Self::gap_start();
            if *local < gap_start {
                LocalResult::Single(Self::winter())
            } else if *local < gap_start + Duration::hours(1) {
                LocalResult::None
            } else {
                LocalResult::Single(Self::summer())
            }
        }

        fn offset_from_utc_date(&self, utc: &NaiveDate) -> FixedOffset {
            self.offset_from_utc_datetime(&utc.and_hms_opt(0, 0, 0).unwrap())
        }

        fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> FixedOffset {
            if *utc < Self::gap_start() - Duration::hours(1) {
                Self::winter()
            } else {
                Self::summer()
            }
        }
    }

    #[test]
    fn impossible_date_never_fires() {
        let err = next_run("0 0 30 2 *", &utc(2024, 1, 1, 0, 0, 0)).unwrap_err();
        assert!(err.to_string().contains("no occurrence"));
    }

    #[test]
    fn star_step_restricts_day_field() {
        let schedule: CronSchedule = "0 0 */2 * MON".parse().unwrap();
        assert!(schedule.dom_restricted);
        assert!(schedule.dow_restricted);

        let schedule: CronSchedule = "0 0 * * MON".parse().unwrap();
        assert!(!schedule.dom_restricted);
    }
}
