//! Workflow execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Execution lifecycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// One run of a workflow template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub template_id: String,
    pub tenant_id: String,
    pub status: ExecutionStatus,
    pub params: Map<String, Value>,
    /// Step outputs keyed by declared variable name.
    pub outputs: HashMap<String, Value>,
    /// Every task this execution enqueued.
    pub task_ids: Vec<String>,
    /// Terminal error of a failed execution (credential-redacted).
    pub error: Option<String>,
    /// Accumulated capability cost.
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn new(template_id: &str, tenant_id: &str, params: Map<String, Value>) -> Self {
        Self {
            id: format!("exec-{}", uuid::Uuid::new_v4()),
            template_id: template_id.to_string(),
            tenant_id: tenant_id.to_string(),
            status: ExecutionStatus::Pending,
            params,
            outputs: HashMap::new(),
            task_ids: Vec::new(),
            error: None,
            cost: 0.0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }
}
