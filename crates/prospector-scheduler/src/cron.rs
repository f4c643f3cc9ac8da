//! Next-run computation over 5-field cron expressions.
//!
//! Supports: "MIN HOUR DOM MON DOW" with `*`, `*/N`, comma lists, and
//! single numbers in the minute field; single number or `*` in the hour and
//! day-of-week fields (DOM/MON are accepted but ignored). That covers every
//! expression the trigger canonicalizer produces, plus hand-written
//! schedules of the same shape.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

/// Compute the first instant strictly after `after` matching the expression.
pub fn next_run_from_cron(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = expression.split_whitespace().collect();
    if parts.len() != 5 {
        tracing::warn!(
            "Invalid cron expression: '{}' (need 5 fields: MIN HOUR DOM MON DOW)",
            expression
        );
        return None;
    }

    let minute_spec = parts[0];
    let hour_spec = parts[1];
    // Day-of-month and month are not constrained by canonical triggers.
    let dow_spec = parts[4];
    let dow = parse_dow(dow_spec)?;

    // An unconstrained hour means a minute-only schedule: scan forward for
    // the next matching minute (handles `*/N` and comma lists too).
    if hour_spec == "*" {
        let minutes = parse_field(minute_spec, 0, 59)?;
        let mut candidate = (after + Duration::minutes(1))
            .with_second(0)
            .and_then(|c| c.with_nanosecond(0))
            .unwrap_or(after);
        // Up to 8 days covers any weekday constraint.
        for _ in 0..(8 * 24 * 60) {
            let dow_ok = dow.is_none_or(|d| candidate.weekday().num_days_from_sunday() == d);
            if dow_ok && minutes.contains(&candidate.minute()) {
                return Some(candidate);
            }
            candidate += Duration::minutes(1);
        }
        return None;
    }

    // Fixed time of day: place hour/minute on the reference day, then
    // advance whole days until the instant is after the reference and on
    // the right weekday.
    let minute = *parse_field(minute_spec, 0, 59)?.first()?;
    let hour = *parse_field(hour_spec, 0, 23)?.first()?;
    let candidate = Utc
        .with_ymd_and_hms(after.year(), after.month(), after.day(), hour, minute, 0)
        .single()?;

    match dow {
        None => {
            if candidate > after {
                Some(candidate)
            } else {
                Some(candidate + Duration::days(1))
            }
        }
        Some(target) => {
            let current = candidate.weekday().num_days_from_sunday();
            let mut ahead = (target + 7 - current) % 7;
            if ahead == 0 && candidate <= after {
                ahead = 7;
            }
            Some(candidate + Duration::days(ahead as i64))
        }
    }
}

/// Day-of-week field: `*`, or a single 0–7 (7 wraps to Sunday).
fn parse_dow(spec: &str) -> Option<Option<u32>> {
    if spec == "*" {
        return Some(None);
    }
    let n: u32 = spec.parse().ok()?;
    if n <= 7 { Some(Some(n % 7)) } else { None }
}

/// Parse a cron field into the list of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Option<Vec<u32>> {
    if field == "*" {
        return Some((min..=max).collect());
    }

    // */N — every N
    if let Some(step) = field.strip_prefix("*/") {
        let n: u32 = step.parse().ok()?;
        if n == 0 {
            return None;
        }
        return Some((min..=max).step_by(n as usize).collect());
    }

    // Comma-separated: "0,15,30,45"
    if field.contains(',') {
        let vals: Result<Vec<u32>, _> = field.split(',').map(|s| s.trim().parse()).collect();
        return vals
            .ok()
            .map(|v| v.into_iter().filter(|x| *x >= min && *x <= max).collect());
    }

    let n: u32 = field.parse().ok()?;
    if n >= min && n <= max {
        Some(vec![n])
    } else {
        None
    }
}
