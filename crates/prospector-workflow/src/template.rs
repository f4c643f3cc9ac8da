//! Workflow template model.
//!
//! Templates are plain serde data (loadable from JSON) and immutable once
//! compiled. Compilation turns every `{{…}}` marker into a typed binding and
//! validates all references: parameters must be declared, step outputs must
//! come from an *earlier* step, and `item` bindings only appear inside
//! `for_each` steps.

use crate::bindings::{BindingPath, BindingRoot, CompiledValue};
use prospector_core::{ProspectorError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// How a step is dispatched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStrategy {
    /// Direct capability call, inline retry.
    #[default]
    Sync,
    /// Fan-out through the bounded task queue, fan-in wait.
    Queue,
    /// Direct concurrent calls with a per-step cap.
    Parallel,
}

/// Per-step retry budget. Queued tasks use the queue's backoff base; the
/// base delay here drives inline retries of Sync steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 { 3 }
fn default_retry_base_ms() -> u64 { 1000 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_retry_base_ms(),
        }
    }
}

/// Step-output memoization directive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCache {
    /// Cache key, may contain bindings.
    pub key: String,
    /// None = cache forever.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// A declared pipeline parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

/// One step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub capability_id: String,
    /// Static or templated input, resolved against the execution scope.
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub strategy: StepStrategy,
    /// Binding to an array; one task/call per element, exposed as `item`.
    #[serde(default)]
    pub for_each: Option<String>,
    /// Per-step cap for the Parallel strategy.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Binding; the step is skipped when it resolves to null/empty.
    #[serde(default)]
    pub skip_if_empty: Option<String>,
    #[serde(default)]
    pub cache: Option<StepCache>,
    /// Override for the ephemeral token lifetime of queued tasks.
    #[serde(default)]
    pub token_ttl_secs: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Variable name the step's output is stored under.
    pub output_var: String,
}

/// A declarative multi-step pipeline. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    pub steps: Vec<WorkflowStep>,
}

/// Per-step compiled artifacts, index-aligned with the template's steps.
#[derive(Debug, Clone)]
pub struct CompiledStep {
    pub input: CompiledValue,
    pub for_each: Option<BindingPath>,
    pub skip_if_empty: Option<BindingPath>,
    pub cache_key: Option<CompiledValue>,
}

/// A validated template ready for execution.
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    pub spec: WorkflowTemplate,
    pub compiled: Vec<CompiledStep>,
}

impl WorkflowTemplate {
    /// Parse a template from JSON and compile it.
    pub fn load(raw: &Value) -> Result<CompiledTemplate> {
        let spec: WorkflowTemplate = serde_json::from_value(raw.clone())?;
        spec.compile()
    }

    /// Compile and validate every binding in the template.
    pub fn compile(self) -> Result<CompiledTemplate> {
        if self.steps.is_empty() {
            return Err(ProspectorError::Validation(format!(
                "template '{}' has no steps",
                self.id
            )));
        }

        let params: HashSet<&str> = self.parameters.iter().map(|p| p.name.as_str()).collect();
        let mut produced: HashSet<String> = HashSet::new();
        let mut compiled = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let input = CompiledValue::compile(&step.input)?;
            let for_each = step
                .for_each
                .as_deref()
                .map(BindingPath::parse)
                .transpose()?;
            let skip_if_empty = step
                .skip_if_empty
                .as_deref()
                .map(BindingPath::parse)
                .transpose()?;
            let cache_key = step
                .cache
                .as_ref()
                .map(|c| CompiledValue::compile(&Value::String(c.key.clone())))
                .transpose()?;

            let mut check_error: Option<ProspectorError> = None;
            let mut check = |binding: &BindingPath| {
                if check_error.is_some() {
                    return;
                }
                check_error = validate_binding(binding, step, &params, &produced).err();
            };

            input.for_each_binding(&mut check);
            if let Some(b) = &for_each {
                check(b);
            }
            if let Some(b) = &skip_if_empty {
                check(b);
            }
            if let Some(ck) = &cache_key {
                ck.for_each_binding(&mut check);
            }
            if let Some(err) = check_error {
                return Err(err);
            }

            // for_each may not itself reference the current item
            if let Some(b) = &for_each
                && b.root == BindingRoot::Item
            {
                return Err(ProspectorError::Validation(format!(
                    "step '{}': for_each cannot bind to item",
                    step.id
                )));
            }

            produced.insert(step.output_var.clone());
            compiled.push(CompiledStep {
                input,
                for_each,
                skip_if_empty,
                cache_key,
            });
        }

        Ok(CompiledTemplate {
            spec: self,
            compiled,
        })
    }
}

fn validate_binding(
    binding: &BindingPath,
    step: &WorkflowStep,
    params: &HashSet<&str>,
    produced: &HashSet<String>,
) -> Result<()> {
    match binding.root {
        BindingRoot::Params => {
            let name = binding.path[0].as_str();
            if !params.contains(name) {
                return Err(ProspectorError::Validation(format!(
                    "step '{}' references undeclared parameter '{}'",
                    step.id, name
                )));
            }
        }
        BindingRoot::Steps => {
            let var = binding.path[0].as_str();
            if !produced.contains(var) {
                return Err(ProspectorError::Validation(format!(
                    "step '{}' references output '{}' not produced by an earlier step",
                    step.id, var
                )));
            }
        }
        BindingRoot::Item => {
            if step.for_each.is_none() {
                return Err(ProspectorError::Validation(format!(
                    "step '{}' uses an item binding without for_each",
                    step.id
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_step_template(second_input: Value) -> Value {
        json!({
            "id": "wf-test",
            "name": "Test",
            "parameters": [{"name": "region", "required": true}],
            "steps": [
                {
                    "id": "resolve",
                    "capability_id": "resolve-subregions",
                    "input": {"region": "{{params.region}}"},
                    "output_var": "targets"
                },
                {
                    "id": "discover",
                    "capability_id": "discover-businesses",
                    "input": second_input,
                    "strategy": "queue",
                    "for_each": "steps.targets",
                    "output_var": "found"
                }
            ]
        })
    }

    #[test]
    fn test_load_valid_template() {
        let raw = two_step_template(json!({"sub_region": "{{item}}"}));
        let compiled = WorkflowTemplate::load(&raw).unwrap();
        assert_eq!(compiled.spec.steps.len(), 2);
        assert_eq!(compiled.spec.steps[1].strategy, StepStrategy::Queue);
        assert!(compiled.compiled[1].for_each.is_some());
    }

    #[test]
    fn test_undeclared_parameter_rejected_at_load() {
        let raw = json!({
            "id": "wf-bad",
            "name": "Bad",
            "steps": [{
                "id": "s1",
                "capability_id": "x",
                "input": {"q": "{{params.region}}"},
                "output_var": "out"
            }]
        });
        let err = WorkflowTemplate::load(&raw).unwrap_err();
        assert!(err.to_string().contains("undeclared parameter"));
    }

    #[test]
    fn test_forward_step_reference_rejected() {
        let raw = json!({
            "id": "wf-bad",
            "name": "Bad",
            "steps": [
                {
                    "id": "s1",
                    "capability_id": "x",
                    "input": {"q": "{{steps.later}}"},
                    "output_var": "early"
                },
                {
                    "id": "s2",
                    "capability_id": "y",
                    "input": {},
                    "output_var": "later"
                }
            ]
        });
        let err = WorkflowTemplate::load(&raw).unwrap_err();
        assert!(err.to_string().contains("not produced by an earlier step"));
    }

    #[test]
    fn test_item_outside_for_each_rejected() {
        let raw = json!({
            "id": "wf-bad",
            "name": "Bad",
            "steps": [{
                "id": "s1",
                "capability_id": "x",
                "input": {"q": "{{item.name}}"},
                "output_var": "out"
            }]
        });
        let err = WorkflowTemplate::load(&raw).unwrap_err();
        assert!(err.to_string().contains("without for_each"));
    }

    #[test]
    fn test_empty_template_rejected() {
        let raw = json!({"id": "wf-empty", "name": "Empty", "steps": []});
        assert!(WorkflowTemplate::load(&raw).is_err());
    }
}
