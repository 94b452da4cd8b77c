//! Trigger clock: decides whether a job is due and when it fires next.
//!
//! Cron expressions follow standard 5-field form (`min hour dom mon dow`);
//! a 6/7-field expression with a seconds (and optional year) field is also
//! accepted and passed through unchanged. Day-of-week names (`Mon-Fri`)
//! are supported and preferred over numeric ordinals.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone, Utc};
use cron::Schedule;
use std::str::FromStr;

/// Prepend a zero seconds field to 5-field expressions so the parser
/// always sees its native 6/7-field form.
fn normalize(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    }
}

pub fn parse_expression(expr: &str) -> Result<Schedule> {
    Schedule::from_str(&normalize(expr))
        .with_context(|| format!("unparseable cron expression '{expr}'"))
}

/// True when at least one matching instant lies in `(last_ref, now]`.
///
/// Firing is coalesced: however many instants were missed since
/// `last_ref` (daemon asleep, long outage), one check yields one fire.
pub fn is_due_recurring(
    expr: &str,
    last_ref: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool> {
    let schedule = parse_expression(expr)?;
    Ok(schedule
        .after(&last_ref)
        .next()
        .is_some_and(|instant| instant <= now))
}

/// Next matching instant strictly after `now`, for status reporting.
pub fn next_due_recurring(expr: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let schedule = parse_expression(expr)?;
    Ok(schedule.after(&now).next())
}

/// Once jobs are due exactly when `now >= run_at` and the job has not been
/// consumed; permanently false afterwards.
pub fn is_due_once(run_at: DateTime<Utc>, consumed: bool, now: DateTime<Utc>) -> bool {
    !consumed && now >= run_at
}

/// Parse a one-shot timestamp in the accepted formats:
/// RFC 3339 (`2026-02-04T15:44:00+07:00`, `...Z`), or a naive local time
/// (`2026-02-04T15:44:00`, `2026-02-04 15:44:00`).
pub fn parse_run_at(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::<FixedOffset>::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = raw.parse::<DateTime<Utc>>() {
        return Some(dt);
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            if let Some(local) = Local.from_local_datetime(&naive).single() {
                return Some(local.with_timezone(&Utc));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn five_field_expression_is_normalized() {
        assert_eq!(normalize("0 9 * * *"), "0 0 9 * * *");
        assert_eq!(normalize("0 0 9 * * *"), "0 0 9 * * *");
        parse_expression("0 9 * * *").unwrap();
    }

    #[test]
    fn malformed_expression_is_rejected() {
        assert!(parse_expression("not a cron").is_err());
        assert!(parse_expression("99 * * * *").is_err());
    }

    #[test]
    fn due_when_instant_crossed_since_last_ref() {
        // Tuesday 2026-08-25, daily 09:00 schedule.
        let last = utc(2026, 8, 25, 8, 0, 0);
        let now = utc(2026, 8, 25, 9, 0, 30);
        assert!(is_due_recurring("0 9 * * *", last, now).unwrap());
    }

    #[test]
    fn not_due_twice_within_the_same_minute() {
        // First fire recorded at 09:00:30; a tick 20 s later must not refire.
        let last = utc(2026, 8, 25, 9, 0, 30);
        let now = utc(2026, 8, 25, 9, 0, 50);
        assert!(!is_due_recurring("0 9 * * *", last, now).unwrap());
    }

    #[test]
    fn weekday_schedule_fires_on_tuesday_not_sunday() {
        let expr = "0 9 * * Mon-Fri";
        // 2026-08-25 is a Tuesday.
        let last = utc(2026, 8, 25, 8, 0, 0);
        assert!(is_due_recurring(expr, last, utc(2026, 8, 25, 9, 0, 10)).unwrap());
        // 2026-08-23 is a Sunday: nothing matched between 08:00 and 10:00.
        let sunday = utc(2026, 8, 23, 8, 0, 0);
        assert!(!is_due_recurring(expr, sunday, utc(2026, 8, 23, 10, 0, 0)).unwrap());
    }

    #[test]
    fn outage_catch_up_coalesces_to_one_fire() {
        // Daemon slept through three daily 09:00 instants. One check, one
        // fire; recording that run suppresses further catch-up fires.
        let last = utc(2026, 8, 20, 9, 30, 0);
        let now = utc(2026, 8, 23, 12, 0, 0);
        assert!(is_due_recurring("0 9 * * *", last, now).unwrap());

        let after_fire = now;
        assert!(!is_due_recurring("0 9 * * *", after_fire, utc(2026, 8, 23, 12, 0, 1)).unwrap());
    }

    #[test]
    fn next_due_reports_upcoming_instant() {
        let now = utc(2026, 8, 25, 9, 30, 0);
        let next = next_due_recurring("0 9 * * *", now).unwrap().unwrap();
        assert_eq!(next, utc(2026, 8, 26, 9, 0, 0));
    }

    #[test]
    fn once_due_exactly_from_run_at_until_consumed() {
        let run_at = utc(2026, 8, 25, 15, 0, 0);
        assert!(!is_due_once(run_at, false, utc(2026, 8, 25, 14, 59, 59)));
        assert!(is_due_once(run_at, false, utc(2026, 8, 25, 15, 0, 0)));
        assert!(is_due_once(run_at, false, utc(2026, 9, 1, 0, 0, 0)));
        assert!(!is_due_once(run_at, true, utc(2026, 9, 1, 0, 0, 0)));
    }

    #[test]
    fn run_at_accepts_rfc3339_forms() {
        assert_eq!(
            parse_run_at("2026-02-04T15:44:00Z").unwrap(),
            utc(2026, 2, 4, 15, 44, 0)
        );
        assert_eq!(
            parse_run_at("2026-02-04T15:44:00+02:00").unwrap(),
            utc(2026, 2, 4, 13, 44, 0)
        );
    }

    #[test]
    fn run_at_accepts_naive_local_forms() {
        assert!(parse_run_at("2026-02-04T15:44:00").is_some());
        assert!(parse_run_at("2026-02-04 15:44:00").is_some());
        assert!(parse_run_at("next tuesday").is_none());
    }
}
