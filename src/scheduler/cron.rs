//! Cron expression helpers.
//!
//! The `cron` crate wants a seconds field (6 or 7 fields). Configuration
//! authors usually write classic 5-field crontab lines, so those get a
//! leading `0` seconds field before parsing.

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;

use crate::errors::ScheduleError;

/// Parse a 5-, 6-, or 7-field cron expression.
pub fn parse_cron(expression: &str) -> Result<Schedule, ScheduleError> {
    let trimmed = expression.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {trimmed}"),
        6 | 7 => trimmed.to_string(),
        n => {
            return Err(ScheduleError::InvalidCron {
                expression: expression.to_string(),
                reason: format!("expected 5, 6 or 7 fields, found {n}"),
            })
        }
    };
    Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Whether a cron schedule is due at `now`.
///
/// With no previous execution only a fire time inside the trailing `slack`
/// (one poll period) counts, so a restart does not replay old history. After that, any
/// fire time strictly after `last_execution` and not after `now` is due.
pub fn is_due(
    schedule: &Schedule,
    last_execution: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    slack: Duration,
) -> bool {
    let from = match last_execution {
        Some(last) => last,
        None => now
            .checked_sub_signed(slack)
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
    };
    schedule.after(&from).next().is_some_and(|t| t <= now)
}

pub fn next_fire(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&now).next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn five_field_expressions_get_seconds() {
        let daily = parse_cron("0 8 * * *").unwrap();
        assert_eq!(next_fire(&daily, at(7, 0, 0)), Some(at(8, 0, 0)));
        assert!(parse_cron("*/15 * * * * *").is_ok());
        assert!(matches!(
            parse_cron("not a cron"),
            Err(ScheduleError::InvalidCron { .. })
        ));
        assert!(parse_cron("61 * * * *").is_err());
    }

    #[test]
    fn first_evaluation_only_fires_inside_grace() {
        let daily = parse_cron("0 8 * * *").unwrap();
        let grace = Duration::seconds(60);
        assert!(is_due(&daily, None, at(8, 0, 20), grace));
        assert!(!is_due(&daily, None, at(8, 2, 0), grace));
        assert!(!is_due(&daily, None, at(7, 59, 59), grace));
    }

    #[test]
    fn later_evaluations_compare_against_last_execution() {
        let daily = parse_cron("0 8 * * *").unwrap();
        let grace = Duration::seconds(60);
        let fired = at(8, 0, 20);
        assert!(!is_due(&daily, Some(fired), at(8, 0, 50), grace));
        let next_day = Utc.with_ymd_and_hms(2024, 3, 2, 9, 30, 0).unwrap();
        // missed by far, but strictly after the last run: still due once
        assert!(is_due(&daily, Some(fired), next_day, grace));
    }
}
