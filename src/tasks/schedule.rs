use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::core::error::{CoreError, CoreResult};

/// Validates a five-field cron expression and returns it with single spaces.
pub fn normalize_cron(expr: &str) -> CoreResult<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CoreError::validation(format!(
            "Cron schedule '{}' must have 5 fields, found {}",
            expr.trim(),
            fields.len()
        )));
    }
    let normalized = fields.join(" ");
    parse_cron(&normalized)?;
    Ok(normalized)
}

/// Parses a five-field expression into the seconds-first form the `cron` crate expects.
///
/// Day-of-week numbers follow classic cron (0 or 7 = Sunday) and are shifted
/// to the crate's 1 = Sunday numbering.
pub fn parse_cron(expr: &str) -> CoreResult<Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let expanded = match fields.as_slice() {
        [minute, hour, dom, month, dow] => {
            format!("0 {minute} {hour} {dom} {month} {}", shift_weekdays(dow))
        }
        _ => expr.trim().to_string(),
    };
    Schedule::from_str(&expanded)
        .map_err(|e| CoreError::validation(format!("Invalid cron schedule '{}': {}", expr.trim(), e)))
}

pub fn next_run_after(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Rewrites numeric day-of-week items as ascending runs in the crate's numbering.
/// Names, `*` and out-of-range items pass through for the parser to judge.
fn shift_weekdays(field: &str) -> String {
    let mut days = BTreeSet::new();
    let mut passthrough = Vec::new();
    for item in field.split(',') {
        match classic_days(item) {
            Some(found) => days.extend(found.into_iter().map(|n| (n % 7) + 1)),
            None => passthrough.push(item.to_string()),
        }
    }

    let mut parts = Vec::new();
    let mut days = days.into_iter().peekable();
    while let Some(first) = days.next() {
        let mut last = first;
        while days.peek() == Some(&(last + 1)) {
            last += 1;
            days.next();
        }
        parts.push(if first == last {
            first.to_string()
        } else {
            format!("{first}-{last}")
        });
    }
    parts.extend(passthrough);
    parts.join(",")
}

/// Days (0-7) named by one numeric item such as `5`, `1-7`, `0-6/2` or `3/2`.
fn classic_days(item: &str) -> Option<Vec<u8>> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step.parse::<usize>().ok().filter(|s| *s > 0)?)),
        None => (item, None),
    };
    let (start, end) = match range.split_once('-') {
        Some((a, b)) => (a.parse::<u8>().ok()?, b.parse::<u8>().ok()?),
        None => {
            let day = range.parse::<u8>().ok()?;
            (day, if step.is_some() { 7 } else { day })
        }
    };
    if start > end || end > 7 {
        return None;
    }
    Some((start..=end).step_by(step.unwrap_or(1)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(normalize_cron(" */15  *  * * * ").unwrap(), "*/15 * * * *");
        assert!(normalize_cron("* * * *").is_err());
        assert!(normalize_cron("61 * * * *").is_err());
        assert!(normalize_cron("0 0 * * * *").is_err());
    }

    #[test]
    fn test_every_fifteen_minutes() {
        let schedule = parse_cron("*/15 * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 7, 30).unwrap();
        let next = next_run_after(&schedule, start).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (10, 15, 0));
    }

    #[test]
    fn test_weekday_numbers_follow_classic_cron() {
        assert_eq!(shift_weekdays("1-5"), "2-6");
        assert_eq!(shift_weekdays("0,7"), "1");
        assert_eq!(shift_weekdays("*/2"), "*/2");
        assert_eq!(shift_weekdays("MON-FRI"), "MON-FRI");

        let schedule = parse_cron("0 9 * * 1").unwrap();
        // 2024-05-01 is a Wednesday
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let next = next_run_after(&schedule, start).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 9);
    }

    #[test]
    fn test_weekday_ranges_reaching_sunday() {
        assert_eq!(shift_weekdays("1-7"), "1-7");
        assert_eq!(shift_weekdays("5-7"), "1,6-7");
        assert_eq!(shift_weekdays("0-6"), "1-7");
        assert_eq!(shift_weekdays("0-6/2"), "1,3,5,7");
        assert_eq!(shift_weekdays("6/1"), "1,7");
        assert_eq!(shift_weekdays("6-2"), "6-2");
        assert_eq!(shift_weekdays("1,SAT"), "2,SAT");

        for expr in ["0 9 * * 1-7", "0 9 * * 5-7", "0 9 * * 0-6", "0 9 * * 1-5"] {
            assert!(normalize_cron(expr).is_ok(), "{expr}");
        }
        assert!(normalize_cron("0 9 * * 8").is_err());

        // Fri-Sun from Wednesday 2024-05-01
        let schedule = parse_cron("0 9 * * 5-7").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let days: Vec<Weekday> = schedule.after(&start).take(4).map(|t| t.weekday()).collect();
        assert_eq!(days, vec![Weekday::Fri, Weekday::Sat, Weekday::Sun, Weekday::Fri]);
    }
}
