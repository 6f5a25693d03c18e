// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Small cron evaluator.
//!
//! Two expression forms: `@every:<seconds>` intervals and 5-field cron
//! (`<min> <hour> <dom> <month> <dow>`).  Fields support `*`, `a,b`, `a-b`
//! and `*/step`; day-of-week runs 0..=6 with 0 = Sunday.  A timestamp
//! matches by equality after truncating to the minute.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Timelike, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("unsupported cron expression: {0}")]
    Unsupported(String),
    #[error("invalid cron field: {0}")]
    InvalidField(String),
}

/// `@every:<N>` interval in seconds, or `None` for cron-form expressions.
pub fn parse_interval_seconds(cron_expr: &str) -> Option<u64> {
    let value = cron_expr.strip_prefix("@every:")?;
    let seconds: u64 = value.trim().parse().ok()?;
    Some(seconds.max(1))
}

fn parse_field(part: &str, minimum: u32, maximum: u32) -> Result<HashSet<u32>, CronError> {
    if part == "*" {
        return Ok((minimum..=maximum).collect());
    }
    let mut values = HashSet::new();
    for token in part.split(',') {
        if let Some(step) = token.strip_prefix("*/") {
            let step: u32 = step
                .parse()
                .map_err(|_| CronError::InvalidField(token.to_string()))?;
            if step == 0 {
                return Err(CronError::InvalidField(token.to_string()));
            }
            values.extend((minimum..=maximum).step_by(step as usize));
            continue;
        }
        if let Some((left, right)) = token.split_once('-') {
            let left: u32 = left
                .parse()
                .map_err(|_| CronError::InvalidField(token.to_string()))?;
            let right: u32 = right
                .parse()
                .map_err(|_| CronError::InvalidField(token.to_string()))?;
            values.extend(left..=right);
            continue;
        }
        values.insert(
            token
                .parse()
                .map_err(|_| CronError::InvalidField(token.to_string()))?,
        );
    }
    Ok(values)
}

/// Whether `slot` (truncated to the minute) matches the 5-field expression.
pub fn cron_matches(slot: DateTime<Utc>, cron_expr: &str) -> Result<bool, CronError> {
    let parts: Vec<&str> = cron_expr.split_whitespace().collect();
    if parts.len() != 5 {
        return Err(CronError::Unsupported(cron_expr.to_string()));
    }
    let minutes = parse_field(parts[0], 0, 59)?;
    let hours = parse_field(parts[1], 0, 23)?;
    let dom = parse_field(parts[2], 1, 31)?;
    let months = parse_field(parts[3], 1, 12)?;
    let dow = parse_field(parts[4], 0, 6)?;
    Ok(minutes.contains(&slot.minute())
        && hours.contains(&slot.hour())
        && dom.contains(&slot.day())
        && months.contains(&slot.month())
        && dow.contains(&slot.weekday().num_days_from_sunday()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn every_form_parses_seconds() {
        assert_eq!(parse_interval_seconds("@every:60"), Some(60));
        assert_eq!(parse_interval_seconds("@every: 300 "), Some(300));
        assert_eq!(parse_interval_seconds("@every:0"), Some(1));
        assert_eq!(parse_interval_seconds("* * * * *"), None);
        assert_eq!(parse_interval_seconds("@every:abc"), None);
    }

    #[test]
    fn wildcard_matches_every_minute() {
        assert!(cron_matches(at(2026, 3, 1, 12, 34), "* * * * *").unwrap());
    }

    #[test]
    fn fixed_minute_and_hour() {
        assert!(cron_matches(at(2026, 3, 1, 9, 30), "30 9 * * *").unwrap());
        assert!(!cron_matches(at(2026, 3, 1, 9, 31), "30 9 * * *").unwrap());
    }

    #[test]
    fn lists_and_ranges() {
        assert!(cron_matches(at(2026, 3, 1, 8, 15), "0,15,45 8-10 * * *").unwrap());
        assert!(cron_matches(at(2026, 3, 1, 10, 45), "0,15,45 8-10 * * *").unwrap());
        assert!(!cron_matches(at(2026, 3, 1, 11, 0), "0,15,45 8-10 * * *").unwrap());
    }

    #[test]
    fn step_values() {
        assert!(cron_matches(at(2026, 3, 1, 0, 0), "*/15 * * * *").unwrap());
        assert!(cron_matches(at(2026, 3, 1, 0, 45), "*/15 * * * *").unwrap());
        assert!(!cron_matches(at(2026, 3, 1, 0, 50), "*/15 * * * *").unwrap());
    }

    #[test]
    fn day_of_week_zero_is_sunday() {
        // 2026-03-01 is a Sunday.
        assert!(cron_matches(at(2026, 3, 1, 0, 0), "0 0 * * 0").unwrap());
        assert!(!cron_matches(at(2026, 3, 2, 0, 0), "0 0 * * 0").unwrap());
        // Monday = 1.
        assert!(cron_matches(at(2026, 3, 2, 0, 0), "0 0 * * 1").unwrap());
    }

    #[test]
    fn dom_and_month() {
        assert!(cron_matches(at(2026, 12, 25, 6, 0), "0 6 25 12 *").unwrap());
        assert!(!cron_matches(at(2026, 11, 25, 6, 0), "0 6 25 12 *").unwrap());
    }

    #[test]
    fn wrong_field_count_is_unsupported() {
        assert!(matches!(
            cron_matches(at(2026, 1, 1, 0, 0), "* * *"),
            Err(CronError::Unsupported(_))
        ));
    }

    #[test]
    fn garbage_field_is_invalid() {
        assert!(matches!(
            cron_matches(at(2026, 1, 1, 0, 0), "x * * * *"),
            Err(CronError::InvalidField(_))
        ));
        assert!(matches!(
            cron_matches(at(2026, 1, 1, 0, 0), "*/0 * * * *"),
            Err(CronError::InvalidField(_))
        ));
    }
}
