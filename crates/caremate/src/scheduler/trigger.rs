//! Trigger specs for proactive check-ins.
//!
//! Two forms are accepted: a daily wall-clock time `HH:MM` and a standard
//! five-field cron expression `min hour dom month dow`. Fire times are
//! computed in the entry's timezone; local times that do not exist (DST
//! gaps) are skipped, and repeated local times fire only once.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use std::fmt;
use std::str::FromStr;

use crate::error::{CareError, CareResult};

/// How far ahead to look before declaring that a trigger never fires.
/// Eight years covers Feb 29 across a skipped leap year.
const SEARCH_HORIZON_DAYS: i64 = 366 * 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSpec {
    Daily { hour: u32, minute: u32 },
    Cron(CronExpr),
}

/// A parsed cron expression, one bitmask per field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

#[derive(Clone, Copy)]
struct Field {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: Field = Field { name: "minute", min: 0, max: 59 };
const HOUR: Field = Field { name: "hour", min: 0, max: 23 };
const DAY_OF_MONTH: Field = Field { name: "day-of-month", min: 1, max: 31 };
const MONTH: Field = Field { name: "month", min: 1, max: 12 };
// 7 is accepted as Sunday and folded onto 0.
const DAY_OF_WEEK: Field = Field { name: "day-of-week", min: 0, max: 7 };

impl TriggerSpec {
    pub fn parse(spec: &str) -> CareResult<Self> {
        let spec = spec.trim();
        if spec.split_whitespace().count() > 1 {
            CronExpr::parse(spec).map(TriggerSpec::Cron)
        } else {
            parse_daily(spec)
        }
    }

    /// First fire time strictly after `after`, evaluated in `tz`.
    pub fn next_after<Z: TimeZone>(&self, after: DateTime<Utc>, tz: &Z) -> CareResult<DateTime<Utc>> {
        let start = after.with_timezone(tz).date_naive();
        for offset in 0..SEARCH_HORIZON_DAYS {
            let date = start + Duration::days(offset);
            if !self.matches_date(date) {
                continue;
            }
            for (hour, minute) in self.times_of_day() {
                let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                    continue;
                };
                // Gap: skipped. Fold: the earlier instant only.
                let candidate = match tz.from_local_datetime(&naive) {
                    LocalResult::Single(dt) => dt,
                    LocalResult::Ambiguous(earliest, _) => earliest,
                    LocalResult::None => continue,
                };
                let candidate = candidate.with_timezone(&Utc);
                if candidate > after {
                    return Ok(candidate);
                }
            }
        }
        Err(CareError::invalid_trigger(&self.to_string(), "never fires"))
    }

    fn matches_date(&self, date: NaiveDate) -> bool {
        match self {
            TriggerSpec::Daily { .. } => true,
            TriggerSpec::Cron(expr) => expr.matches_date(date),
        }
    }

    fn times_of_day(&self) -> Vec<(u32, u32)> {
        match self {
            TriggerSpec::Daily { hour, minute } => vec![(*hour, *minute)],
            TriggerSpec::Cron(expr) => {
                let mut times = Vec::new();
                for hour in bits(expr.hours as u64, 0, 23) {
                    for minute in bits(expr.minutes, 0, 59) {
                        times.push((hour, minute));
                    }
                }
                times
            }
        }
    }
}

impl FromStr for TriggerSpec {
    type Err = CareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TriggerSpec::parse(s)
    }
}

impl fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerSpec::Daily { hour, minute } => write!(f, "{:02}:{:02}", hour, minute),
            TriggerSpec::Cron(expr) => write!(f, "{}", expr),
        }
    }
}

fn parse_daily(spec: &str) -> CareResult<TriggerSpec> {
    let (hour, minute) = spec
        .split_once(':')
        .ok_or_else(|| CareError::invalid_trigger(spec, "expected HH:MM or a five-field cron expression"))?;
    let parse = |part: &str, max: u32, what: &str| -> CareResult<u32> {
        if part.is_empty() || part.len() > 2 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CareError::invalid_trigger(spec, format!("bad {}", what)));
        }
        let value: u32 = part
            .parse()
            .map_err(|_| CareError::invalid_trigger(spec, format!("bad {}", what)))?;
        if value > max {
            return Err(CareError::invalid_trigger(spec, format!("{} out of range", what)));
        }
        Ok(value)
    };
    Ok(TriggerSpec::Daily {
        hour: parse(hour, 23, "hour")?,
        minute: parse(minute, 59, "minute")?,
    })
}

impl CronExpr {
    pub fn parse(spec: &str) -> CareResult<Self> {
        let fields: Vec<&str> = spec.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CareError::invalid_trigger(
                spec,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let minutes = parse_field(spec, fields[0], MINUTE)?;
        let hours = parse_field(spec, fields[1], HOUR)?;
        let days_of_month = parse_field(spec, fields[2], DAY_OF_MONTH)?;
        let months = parse_field(spec, fields[3], MONTH)?;
        let mut days_of_week = parse_field(spec, fields[4], DAY_OF_WEEK)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(CronExpr {
            minutes,
            hours: hours as u32,
            days_of_month: days_of_month as u32,
            months: months as u16,
            days_of_week: days_of_week as u8,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    /// Standard cron day rule: with both day fields restricted, either may match.
    fn matches_date(&self, date: NaiveDate) -> bool {
        if self.months & (1 << date.month()) == 0 {
            return false;
        }
        let dom = self.days_of_month & (1 << date.day()) != 0;
        let dow = self.days_of_week & (1 << date.weekday().num_days_from_sunday()) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = |mask: u64, min: u32, max: u32| {
            bits(mask, min, max)
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        write!(
            f,
            "{} {} {} {} {}",
            list(self.minutes, 0, 59),
            list(self.hours as u64, 0, 23),
            if self.dom_restricted { list(self.days_of_month as u64, 1, 31) } else { "*".to_string() },
            list(self.months as u64, 1, 12),
            if self.dow_restricted { list(self.days_of_week as u64, 0, 6) } else { "*".to_string() },
        )
    }
}

fn bits(mask: u64, min: u32, max: u32) -> impl Iterator<Item = u32> {
    (min..=max).filter(move |v| mask & (1u64 << v) != 0)
}

fn parse_field(spec: &str, text: &str, field: Field) -> CareResult<u64> {
    let mut mask = 0u64;
    for item in text.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step = parse_number(spec, step, field)?;
                if step == 0 {
                    return Err(CareError::invalid_trigger(spec, format!("zero step in {}", field.name)));
                }
                (range, Some(step))
            }
            None => (item, None),
        };

        let (low, high) = if range == "*" {
            (field.min, field.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_number(spec, a, field)?, parse_number(spec, b, field)?)
        } else {
            let value = parse_number(spec, range, field)?;
            // `n/step` runs from n to the end of the field.
            (value, if step.is_some() { field.max } else { value })
        };

        for value in [low, high] {
            if value < field.min || value > field.max {
                return Err(CareError::invalid_trigger(
                    spec,
                    format!("{} {} outside {}-{}", field.name, value, field.min, field.max),
                ));
            }
        }
        if low > high {
            return Err(CareError::invalid_trigger(
                spec,
                format!("{} range {}-{} is reversed", field.name, low, high),
            ));
        }

        let step = step.unwrap_or(1) as usize;
        for value in (low..=high).step_by(step) {
            mask |= 1u64 << value;
        }
    }
    Ok(mask)
}

fn parse_number(spec: &str, text: &str, field: Field) -> CareResult<u32> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CareError::invalid_trigger(
            spec,
            format!("'{}' is not a number in {}", text, field.name),
        ));
    }
    text.parse()
        .map_err(|_| CareError::invalid_trigger(spec, format!("'{}' is too large for {}", text, field.name)))
}

/// Parses an IANA timezone name such as `Asia/Shanghai`.
pub fn parse_timezone(name: &str) -> CareResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| CareError::invalid_trigger(name, "unknown IANA timezone"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;
    use proptest::prelude::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_daily_is_strictly_later() {
        let spec = TriggerSpec::parse("08:00").unwrap();
        let shanghai = parse_timezone("Asia/Shanghai").unwrap();
        // 08:00 in Shanghai is 00:00 UTC.
        assert_eq!(spec.next_after(utc(2024, 4, 30, 23, 59), &shanghai).unwrap(), utc(2024, 5, 1, 0, 0));
        assert_eq!(spec.next_after(utc(2024, 5, 1, 0, 0), &shanghai).unwrap(), utc(2024, 5, 2, 0, 0));
    }

    #[test]
    fn test_daily_parsing() {
        assert_eq!(TriggerSpec::parse("7:05").unwrap(), TriggerSpec::Daily { hour: 7, minute: 5 });
        for bad in ["24:00", "12:60", "noon", "12:", ":30", "1200", "12:3x"] {
            let err = TriggerSpec::parse(bad).unwrap_err();
            assert_eq!(err.category(), "invalid_trigger", "{}", bad);
        }
    }

    #[test]
    fn test_dst_gap_is_skipped() {
        let spec = TriggerSpec::parse("02:30").unwrap();
        let new_york = parse_timezone("America/New_York").unwrap();
        // 2024-03-10 02:30 does not exist in New York.
        let next = spec.next_after(utc(2024, 3, 10, 5, 0), &new_york).unwrap();
        assert_eq!(next, utc(2024, 3, 11, 6, 30));
    }

    #[test]
    fn test_dst_fold_fires_once() {
        let spec = TriggerSpec::parse("01:30").unwrap();
        let new_york = parse_timezone("America/New_York").unwrap();
        let first = spec.next_after(utc(2024, 11, 3, 4, 0), &new_york).unwrap();
        assert_eq!(first, utc(2024, 11, 3, 5, 30));
        let second = spec.next_after(first, &new_york).unwrap();
        assert_eq!(second, utc(2024, 11, 4, 6, 30));
    }

    #[test]
    fn test_cron_steps_lists_and_ranges() {
        let spec = TriggerSpec::parse("*/15 9-10 * * *").unwrap();
        let next = spec.next_after(utc(2024, 5, 1, 9, 50), &Utc).unwrap();
        assert_eq!(next, utc(2024, 5, 1, 10, 0));
        let next = spec.next_after(utc(2024, 5, 1, 10, 45), &Utc).unwrap();
        assert_eq!(next, utc(2024, 5, 2, 9, 0));

        let spec = TriggerSpec::parse("0 8,20 * * *").unwrap();
        assert_eq!(spec.next_after(utc(2024, 5, 1, 8, 0), &Utc).unwrap(), utc(2024, 5, 1, 20, 0));

        let spec = TriggerSpec::parse("10-30/10 12 * * *").unwrap();
        assert_eq!(spec.next_after(utc(2024, 5, 1, 12, 10), &Utc).unwrap(), utc(2024, 5, 1, 12, 20));
    }

    #[test]
    fn test_day_of_month_or_day_of_week() {
        // 2024-05-01 is a Wednesday; Monday the 6th comes before June 1st.
        let spec = TriggerSpec::parse("0 9 1 * 1").unwrap();
        assert_eq!(spec.next_after(utc(2024, 5, 1, 10, 0), &Utc).unwrap(), utc(2024, 5, 6, 9, 0));

        let weekdays_only = TriggerSpec::parse("0 9 * * 1-5").unwrap();
        // Friday evening rolls over to Monday.
        assert_eq!(
            weekdays_only.next_after(utc(2024, 5, 3, 10, 0), &Utc).unwrap(),
            utc(2024, 5, 6, 9, 0)
        );
    }

    #[test]
    fn test_sunday_as_seven() {
        let spec = TriggerSpec::parse("0 10 * * 7").unwrap();
        assert_eq!(spec.next_after(utc(2024, 5, 1, 0, 0), &Utc).unwrap(), utc(2024, 5, 5, 10, 0));
        assert_eq!(spec, TriggerSpec::parse("0 10 * * 0").unwrap());
    }

    #[test]
    fn test_invalid_cron_rejected() {
        for bad in ["61 * * * *", "* * *", "* * * * * *", "5-1 * * * *", "*/0 * * * *", "a * * * *", "0 0 0 * *"] {
            assert!(TriggerSpec::parse(bad).is_err(), "{}", bad);
        }
    }

    #[test]
    fn test_impossible_date_never_fires() {
        let spec = TriggerSpec::parse("0 0 31 2 *").unwrap();
        let err = spec.next_after(utc(2024, 1, 1, 0, 0), &Utc).unwrap_err();
        assert_eq!(err.category(), "invalid_trigger");

        let leap = TriggerSpec::parse("0 0 29 2 *").unwrap();
        assert_eq!(leap.next_after(utc(2024, 3, 1, 0, 0), &Utc).unwrap(), utc(2028, 2, 29, 0, 0));
    }

    #[test]
    fn test_unknown_timezone() {
        assert_eq!(parse_timezone("Mars/Olympus").unwrap_err().category(), "invalid_trigger");
    }

    proptest! {
        #[test]
        fn prop_next_is_later_and_matches(
            hour in 0u32..24,
            minute in 0u32..60,
            offset_minutes in 0i64..(60 * 24 * 400),
        ) {
            let spec = TriggerSpec::Daily { hour, minute };
            let tz = parse_timezone("Europe/Berlin").unwrap();
            let after = utc(2024, 1, 1, 0, 0) + Duration::minutes(offset_minutes);
            let next = spec.next_after(after, &tz).unwrap();
            prop_assert!(next > after);
            prop_assert!(next - after <= Duration::hours(48));
            let local = next.with_timezone(&tz);
            prop_assert_eq!((local.hour(), local.minute()), (hour, minute));
        }

        #[test]
        fn prop_cron_next_is_later(
            minute in 0u32..60,
            dow in 0u32..8,
            offset_minutes in 0i64..(60 * 24 * 400),
        ) {
            let spec = TriggerSpec::parse(&format!("{} */6 * * {}", minute, dow)).unwrap();
            let after = utc(2024, 1, 1, 0, 0) + Duration::minutes(offset_minutes);
            let next = spec.next_after(after, &Utc).unwrap();
            prop_assert!(next > after);
            prop_assert!(next - after <= Duration::days(7));
            prop_assert_eq!(next.minute(), minute);
            prop_assert_eq!(next.hour() % 6, 0);
            prop_assert_eq!(next.weekday().num_days_from_sunday(), dow % 7);
        }
    }
}
