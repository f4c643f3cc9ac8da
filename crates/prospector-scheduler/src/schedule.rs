//! Schedule model.

use crate::cron::next_run_from_cron;
use crate::parse::{CanonicalTrigger, parse_trigger};
use chrono::{DateTime, Utc};
use prospector_core::{ProspectorError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a firing is dispatched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    /// Direct in-process pipeline call.
    #[default]
    InProcess,
    /// Spawned, tracked out-of-process worker for long-running or
    /// untrusted work.
    Worker,
}

/// Outcome of the most recent firing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub success: bool,
    /// Credential-redacted detail text.
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// A recurring trigger: the canonical parsed form (when it came from
/// natural language) and the cron string everything downstream uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default)]
    pub canonical: Option<CanonicalTrigger>,
    pub cron: String,
}

impl Trigger {
    /// Build from natural language, e.g. "every Monday at 9am".
    pub fn from_text(text: &str) -> Result<Self> {
        let canonical = parse_trigger(text).ok_or_else(|| {
            ProspectorError::Schedule(format!("could not recognize a recurrence in '{text}'"))
        })?;
        let cron = canonical.to_cron();
        Ok(Self {
            canonical: Some(canonical),
            cron,
        })
    }

    /// Build from an explicit cron expression.
    pub fn from_cron(expression: &str) -> Result<Self> {
        if next_run_from_cron(expression, Utc::now()).is_none() {
            return Err(ProspectorError::Schedule(format!(
                "invalid cron expression '{expression}'"
            )));
        }
        Ok(Self {
            canonical: None,
            cron: expression.to_string(),
        })
    }
}

/// A stored recurring schedule. Never auto-deleted on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    /// Workflow this schedule triggers.
    pub workflow_id: String,
    /// Parameters handed to the workflow on each firing.
    #[serde(default)]
    pub params: Value,
    pub trigger: Trigger,
    pub tenant_id: String,
    #[serde(default)]
    pub kind: ScheduleKind,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_result: Option<RunOutcome>,
    #[serde(default)]
    pub run_count: u64,
}

impl Schedule {
    pub fn new(
        name: &str,
        workflow_id: &str,
        params: Value,
        trigger: Trigger,
        tenant_id: &str,
        kind: ScheduleKind,
    ) -> Self {
        let now = Utc::now();
        let next_run = next_run_from_cron(&trigger.cron, now);
        Self {
            id: format!("sched-{}", uuid::Uuid::new_v4()),
            name: name.to_string(),
            workflow_id: workflow_id.to_string(),
            params,
            trigger,
            tenant_id: tenant_id.to_string(),
            kind,
            enabled: true,
            created_at: now,
            last_run: None,
            next_run,
            last_result: None,
            run_count: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run.is_some_and(|t| t <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_schedule_has_future_next_run() {
        let trigger = Trigger::from_text("every day at 9am").unwrap();
        let schedule = Schedule::new(
            "morning sweep",
            "region-discovery",
            json!({"region": "Austin"}),
            trigger,
            "t1",
            ScheduleKind::InProcess,
        );
        assert!(schedule.enabled);
        assert!(schedule.next_run.unwrap() > Utc::now());
        assert!(!schedule.is_due(Utc::now()));
    }

    #[test]
    fn test_trigger_from_bad_text() {
        assert!(Trigger::from_text("just once please").is_err());
    }

    #[test]
    fn test_trigger_from_cron_validates() {
        assert!(Trigger::from_cron("0 9 * * 1").is_ok());
        assert!(Trigger::from_cron("not cron").is_err());
    }
}
