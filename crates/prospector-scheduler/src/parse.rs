//! Natural-language trigger parsing.
//!
//! Recognizes interval phrases (`daily`, `hourly`, `weekly`), explicit
//! weekday names, and a time of day in 12h (`9am`, `9:30pm`) or 24h
//! (`14:00`) form. The canonical form maps deterministically to a 5-field
//! cron string, so everything downstream only ever sees cron.

use serde::{Deserialize, Serialize};

/// Recurrence interval of a canonical trigger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Daily,
    Hourly,
    Weekly,
}

/// Canonical trigger: an interval or a specific weekday, plus a time of day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CanonicalTrigger {
    #[serde(default)]
    pub interval: Option<Interval>,
    /// 0 = Sunday … 6 = Saturday (cron convention).
    #[serde(default)]
    pub day_of_week: Option<u32>,
    pub hour: u32,
    pub minute: u32,
}

impl CanonicalTrigger {
    /// Deterministic mapping to `minute hour * * dow-or-*`.
    pub fn to_cron(&self) -> String {
        match (self.interval, self.day_of_week) {
            (Some(Interval::Hourly), _) => format!("{} * * * *", self.minute),
            (_, Some(dow)) => format!("{} {} * * {}", self.minute, self.hour, dow),
            // A bare "weekly" defaults to Monday.
            (Some(Interval::Weekly), None) => format!("{} {} * * 1", self.minute, self.hour),
            _ => format!("{} {} * * *", self.minute, self.hour),
        }
    }
}

const WEEKDAYS: &[(&str, u32)] = &[
    ("sunday", 0),
    ("monday", 1),
    ("tuesday", 2),
    ("wednesday", 3),
    ("thursday", 4),
    ("friday", 5),
    ("saturday", 6),
];

/// Parse a phrase like "every Monday at 9am" or "daily at 14:00".
/// Returns `None` when no recurrence is recognized.
pub fn parse_trigger(text: &str) -> Option<CanonicalTrigger> {
    let lower = text.to_lowercase();

    let interval = if lower.contains("hourly") || lower.contains("every hour") {
        Some(Interval::Hourly)
    } else if lower.contains("daily") || lower.contains("every day") {
        Some(Interval::Daily)
    } else if lower.contains("weekly") || lower.contains("every week") {
        Some(Interval::Weekly)
    } else {
        None
    };

    let day_of_week = WEEKDAYS
        .iter()
        .find(|(name, _)| lower.contains(name))
        .map(|(_, dow)| *dow);

    if interval.is_none() && day_of_week.is_none() {
        return None;
    }

    let (hour, minute) = parse_time_of_day(&lower).unwrap_or((9, 0));
    Some(CanonicalTrigger {
        interval,
        day_of_week,
        hour,
        minute,
    })
}

/// Find a time of day in free text. Accepts `9am`, `9 pm`, `9:30am`,
/// `14:00`, and a bare hour right after "at".
fn parse_time_of_day(text: &str) -> Option<(u32, u32)> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    for (i, raw) in tokens.iter().enumerate() {
        let token = raw.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != ':');

        let (core, mut meridiem) = if let Some(c) = token.strip_suffix("am") {
            (c, Some(Meridiem::Am))
        } else if let Some(c) = token.strip_suffix("pm") {
            (c, Some(Meridiem::Pm))
        } else {
            (token, None)
        };
        if meridiem.is_none() {
            meridiem = match tokens.get(i + 1).copied() {
                Some("am") | Some("am.") => Some(Meridiem::Am),
                Some("pm") | Some("pm.") => Some(Meridiem::Pm),
                _ => None,
            };
        }
        if core.is_empty() {
            continue;
        }

        let (hour_str, minute_str) = match core.split_once(':') {
            Some((h, m)) => (h, Some(m)),
            None => (core, None),
        };
        let Ok(mut hour) = hour_str.parse::<u32>() else {
            continue;
        };
        let minute = match minute_str {
            Some(m) => match m.parse::<u32>() {
                Ok(v) if v <= 59 => v,
                _ => continue,
            },
            None => {
                // A bare number only counts as a time right after "at"
                // or with an explicit am/pm.
                let after_at = i > 0 && tokens[i - 1] == "at";
                if meridiem.is_none() && !after_at {
                    continue;
                }
                0
            }
        };

        match meridiem {
            Some(Meridiem::Pm) if hour < 12 => hour += 12,
            Some(Meridiem::Am) if hour == 12 => hour = 0,
            _ => {}
        }
        if hour <= 23 {
            return Some((hour, minute));
        }
    }
    None
}

#[derive(Clone, Copy)]
enum Meridiem {
    Am,
    Pm,
}
