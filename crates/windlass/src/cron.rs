//! 5-field cron expressions.
//!
//! `minute hour day-of-month month day-of-week`, accepting `*`, `a`, `a,b,c`,
//! `a-b`, `*/n`, `a/n` and `a-b/n`. Month runs 1–12, day-of-week 0–6 with
//! Sunday = 0. When both day fields are restricted, both must match.

use crate::error::{QueueError, QueueResult};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Upper bound on field-advancing search steps.
const MAX_SEARCH_STEPS: usize = 1000;

/// Allowed value set for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        self.0 & (1u64 << value) != 0
    }
}

/// A parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
    source: String,
}

impl CronExpr {
    /// Parses a 5-field expression.
    pub fn parse(expr: &str) -> QueueResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(QueueError::InvalidCron(format!(
                "expected 5 fields, got {}: {expr:?}",
                fields.len()
            )));
        }

        Ok(Self {
            minute: parse_field(fields[0], 0, 59)?,
            hour: parse_field(fields[1], 0, 23)?,
            day_of_month: parse_field(fields[2], 1, 31)?,
            month: parse_field(fields[3], 1, 12)?,
            day_of_week: parse_field(fields[4], 0, 6)?,
            source: expr.to_string(),
        })
    }

    /// The expression this schedule was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the given wall-clock minute satisfies the schedule.
    fn matches(&self, t: &NaiveDateTime) -> bool {
        self.month.contains(t.month())
            && self.day_of_month.contains(t.day())
            && self.day_of_week.contains(t.weekday().num_days_from_sunday())
            && self.hour.contains(t.hour())
            && self.minute.contains(t.minute())
    }

    /// Next fire time strictly after `after`, computed in UTC.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = truncate_to_minute(after.naive_utc()) + ChronoDuration::minutes(1);
        let naive = self.search(start)?;
        Some(Utc.from_utc_datetime(&naive))
    }

    /// Next fire time strictly after `after`, computed on the wall clock of
    /// `tz` and mapped back to UTC. Fire times landing in a DST gap are
    /// skipped forward; ambiguous times resolve to the earlier instant.
    pub fn next_fire_in_tz(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let mut start = truncate_to_minute(local) + ChronoDuration::minutes(1);

        for _ in 0..4 {
            let naive = self.search(start)?;
            match tz.from_local_datetime(&naive) {
                chrono::LocalResult::Single(t) => return Some(t.with_timezone(&Utc)),
                chrono::LocalResult::Ambiguous(earliest, _) => {
                    return Some(earliest.with_timezone(&Utc))
                }
                chrono::LocalResult::None => {
                    // DST gap; resume the search past it.
                    start = naive + ChronoDuration::minutes(1);
                }
            }
        }

        None
    }

    /// Field-advancing search: each step jumps past the earliest failing
    /// field (month, then day-of-month, then day-of-week, then hour, then
    /// minute), bounded by [`MAX_SEARCH_STEPS`].
    fn search(&self, start: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut t = start;

        for _ in 0..MAX_SEARCH_STEPS {
            if !self.month.contains(t.month()) {
                t = first_of_next_month(&t)?;
                continue;
            }
            if !self.day_of_month.contains(t.day())
                || !self.day_of_week.contains(t.weekday().num_days_from_sunday())
            {
                t = midnight(t.date().succ_opt()?);
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t
                    .with_minute(0)
                    .and_then(|t| t.checked_add_signed(ChronoDuration::hours(1)))?;
                continue;
            }
            if !self.minute.contains(t.minute()) {
                t = t.checked_add_signed(ChronoDuration::minutes(1))?;
                continue;
            }
            return Some(t);
        }

        None
    }
}

fn truncate_to_minute(t: NaiveDateTime) -> NaiveDateTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(chrono::NaiveTime::MIN)
}

fn first_of_next_month(t: &NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).map(midnight)
}

/// Parses one field into its allowed value set.
fn parse_field(field: &str, min: u32, max: u32) -> QueueResult<FieldSet> {
    let mut mask = 0u64;

    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| invalid(field, "step is not a number"))?;
                if step == 0 {
                    return Err(invalid(field, "step must be at least 1"));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = match range {
            "*" => (min, max),
            _ => match range.split_once('-') {
                Some((a, b)) => {
                    let a: u32 = a.parse().map_err(|_| invalid(field, "bad range start"))?;
                    let b: u32 = b.parse().map_err(|_| invalid(field, "bad range end"))?;
                    (a, b)
                }
                None => {
                    let a: u32 = range.parse().map_err(|_| invalid(field, "not a number"))?;
                    // `a/n` runs from a to the field maximum.
                    if part.contains('/') {
                        (a, max)
                    } else {
                        (a, a)
                    }
                }
            },
        };

        if lo < min || hi > max || lo > hi {
            return Err(invalid(
                field,
                &format!("values must satisfy {min} <= a <= b <= {max}"),
            ));
        }

        let mut value = lo;
        while value <= hi {
            mask |= 1u64 << value;
            value += step;
        }
    }

    if mask == 0 {
        return Err(invalid(field, "empty field"));
    }

    Ok(FieldSet(mask))
}

fn invalid(field: &str, reason: &str) -> QueueError {
    QueueError::InvalidCron(format!("{field:?}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_every_minute() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        let next = expr.next_fire(utc(2026, 3, 10, 12, 30)).unwrap();
        assert_eq!(next, utc(2026, 3, 10, 12, 31));
    }

    #[test]
    fn test_next_fire_skips_partial_minute() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 10, 12, 30, 45).unwrap();
        assert_eq!(expr.next_fire(after).unwrap(), utc(2026, 3, 10, 12, 31));
    }

    #[test]
    fn test_daily_at_time() {
        let expr = CronExpr::parse("30 4 * * *").unwrap();
        assert_eq!(
            expr.next_fire(utc(2026, 3, 10, 12, 0)).unwrap(),
            utc(2026, 3, 11, 4, 30)
        );
        assert_eq!(
            expr.next_fire(utc(2026, 3, 10, 3, 0)).unwrap(),
            utc(2026, 3, 10, 4, 30)
        );
    }

    #[test]
    fn test_step_values() {
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        assert_eq!(
            expr.next_fire(utc(2026, 1, 1, 10, 16)).unwrap(),
            utc(2026, 1, 1, 10, 30)
        );

        let expr = CronExpr::parse("10/20 * * * *").unwrap();
        // 10, 30, 50
        assert_eq!(
            expr.next_fire(utc(2026, 1, 1, 10, 31)).unwrap(),
            utc(2026, 1, 1, 10, 50)
        );
    }

    #[test]
    fn test_lists_and_ranges() {
        let expr = CronExpr::parse("0 9-17 * * 1-5").unwrap();
        // Friday 2026-03-13 18:00 -> Monday 2026-03-16 09:00.
        assert_eq!(
            expr.next_fire(utc(2026, 3, 13, 18, 0)).unwrap(),
            utc(2026, 3, 16, 9, 0)
        );

        let expr = CronExpr::parse("0,30 12 * * *").unwrap();
        assert_eq!(
            expr.next_fire(utc(2026, 3, 10, 12, 5)).unwrap(),
            utc(2026, 3, 10, 12, 30)
        );
    }

    #[test]
    fn test_yearly() {
        let expr = CronExpr::parse("0 0 1 1 *").unwrap();
        assert_eq!(
            expr.next_fire(utc(2026, 3, 10, 0, 0)).unwrap(),
            utc(2027, 1, 1, 0, 0)
        );
    }

    #[test]
    fn test_both_day_fields_restricted_require_both() {
        // 13th and Friday: the next Friday the 13th after 2026-03-01.
        let expr = CronExpr::parse("0 0 13 * 5").unwrap();
        let next = expr.next_fire(utc(2026, 3, 1, 0, 0)).unwrap();
        assert_eq!(next, utc(2026, 3, 13, 0, 0));
        assert_eq!(
            next.naive_utc().weekday().num_days_from_sunday(),
            5,
            "must land on a Friday"
        );
    }

    #[test]
    fn test_never_matching_expression_exhausts_search() {
        let expr = CronExpr::parse("0 0 30 2 *").unwrap();
        assert_eq!(expr.next_fire(utc(2026, 1, 1, 0, 0)), None);
    }

    #[test]
    fn test_timezone_wall_clock() {
        // 09:00 in New York is 13:00 or 14:00 UTC depending on DST.
        let expr = CronExpr::parse("0 9 * * *").unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();

        // January: EST, UTC-5.
        let next = expr.next_fire_in_tz(utc(2026, 1, 10, 0, 0), tz).unwrap();
        assert_eq!(next, utc(2026, 1, 10, 14, 0));

        // July: EDT, UTC-4.
        let next = expr.next_fire_in_tz(utc(2026, 7, 10, 0, 0), tz).unwrap();
        assert_eq!(next, utc(2026, 7, 10, 13, 0));
    }

    #[test]
    fn test_dst_gap_is_skipped() {
        // 02:30 does not exist on 2026-03-08 in New York; the schedule must
        // fire on the next day's 02:30 instead of failing.
        let expr = CronExpr::parse("30 2 * * *").unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        let next = expr
            .next_fire_in_tz(utc(2026, 3, 8, 5, 0), tz)
            .unwrap();
        assert_eq!(next, utc(2026, 3, 9, 6, 30));
    }

    #[test]
    fn test_successive_fires_strictly_increase() {
        let expr = CronExpr::parse("*/5 * * * *").unwrap();
        let mut t = utc(2026, 3, 10, 0, 0);
        for _ in 0..50 {
            let next = expr.next_fire(t).unwrap();
            assert!(next > t);
            t = next;
        }
    }

    #[test]
    fn test_parse_rejects_bad_expressions() {
        assert!(CronExpr::parse("* * * *").is_err()); // 4 fields
        assert!(CronExpr::parse("60 * * * *").is_err()); // minute out of range
        assert!(CronExpr::parse("* 24 * * *").is_err()); // hour out of range
        assert!(CronExpr::parse("* * 0 * *").is_err()); // dom below minimum
        assert!(CronExpr::parse("* * * 13 *").is_err()); // month out of range
        assert!(CronExpr::parse("* * * * 7").is_err()); // dow out of range
        assert!(CronExpr::parse("5-2 * * * *").is_err()); // inverted range
        assert!(CronExpr::parse("*/0 * * * *").is_err()); // zero step
        assert!(CronExpr::parse("a * * * *").is_err()); // not a number
    }

    #[test]
    fn test_parse_keeps_source() {
        let expr = CronExpr::parse("0 12 * * 1").unwrap();
        assert_eq!(expr.source(), "0 12 * * 1");
    }
}
