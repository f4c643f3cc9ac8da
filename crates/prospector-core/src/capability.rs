//! The capability boundary — the single seam between the orchestration core
//! and the systems that do real work (discovery providers, enrichment,
//! website audits, email send).
//!
//! The core never inspects a capability's input or output; it passes opaque
//! JSON through and looks only at the outcome envelope.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Per-invocation context passed across the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeOptions {
    /// Owning account/organization — isolation boundary.
    pub tenant_id: String,
    /// Service tier, forwarded untouched to the capability.
    pub tier: String,
}

impl InvokeOptions {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            tier: "standard".to_string(),
        }
    }
}

/// Outcome envelope returned by every capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityOutcome {
    pub success: bool,
    /// Opaque result payload; meaningful only to the caller that knows the
    /// capability.
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub error: Option<String>,
    /// Accumulated cost units for this invocation.
    #[serde(default)]
    pub cost: f64,
}

impl CapabilityOutcome {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            cost: 0.0,
        }
    }

    pub fn err(message: &str) -> Self {
        Self {
            success: false,
            output: Value::Null,
            error: Some(message.to_string()),
            cost: 0.0,
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Uniform invocation boundary consumed by the queue and executor.
///
/// Which capability implements discovery/enrichment/email-send is irrelevant
/// to the orchestration logic — it depends only on this signature.
#[async_trait]
pub trait CapabilityInvoker: Send + Sync {
    async fn invoke(
        &self,
        capability_id: &str,
        input: Value,
        opts: &InvokeOptions,
    ) -> Result<CapabilityOutcome>;
}

/// Closure-backed invoker, mostly for tests and small embedders.
pub struct FnInvoker<F>(pub F);

#[async_trait]
impl<F> CapabilityInvoker for FnInvoker<F>
where
    F: Fn(&str, Value) -> Result<CapabilityOutcome> + Send + Sync,
{
    async fn invoke(
        &self,
        capability_id: &str,
        input: Value,
        _opts: &InvokeOptions,
    ) -> Result<CapabilityOutcome> {
        (self.0)(capability_id, input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fn_invoker_passthrough() {
        let invoker = FnInvoker(|cap: &str, input: Value| {
            Ok(CapabilityOutcome::ok(serde_json::json!({
                "cap": cap,
                "echo": input,
            })))
        });
        let outcome = invoker
            .invoke(
                "discover-businesses",
                serde_json::json!({"region": "Austin"}),
                &InvokeOptions::new("t1"),
            )
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output["cap"], "discover-businesses");
        assert_eq!(outcome.output["echo"]["region"], "Austin");
    }

    #[test]
    fn test_outcome_envelope() {
        let ok = CapabilityOutcome::ok(Value::Null).with_cost(0.5);
        assert!(ok.success);
        assert_eq!(ok.cost, 0.5);
        let err = CapabilityOutcome::err("provider timeout");
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("provider timeout"));
    }
}
