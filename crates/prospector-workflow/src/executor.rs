//! The generic template executor and the fan-in wait.

use crate::bindings::{BindingPath, ExecutionScope};
use crate::context::PipelineContext;
use crate::execution::{ExecutionStatus, WorkflowExecution};
use crate::template::{CompiledStep, CompiledTemplate, RetryPolicy, StepStrategy, WorkflowStep};
use chrono::Utc;
use futures::StreamExt;
use prospector_core::audit::AuditRecord;
use prospector_core::capability::InvokeOptions;
use prospector_core::{ProspectorError, Result, redact_credentials};
use prospector_queue::{TaskEvent, TaskQueue, TaskStatus};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Terminal state of one task, as seen by a fan-in.
#[derive(Debug, Clone)]
pub enum TaskTerminal {
    Completed(Value),
    Failed(String),
}

/// What a fan-in wait produced.
#[derive(Debug, Clone, Default)]
pub struct FanInResult {
    /// Terminal outcomes keyed by task id. Tasks still in flight when the
    /// ceiling was hit are absent.
    pub outcomes: HashMap<String, TaskTerminal>,
    /// The hard ceiling was reached. Not an error — the outcomes gathered
    /// so far are returned as-is, and in-flight work keeps running.
    pub timed_out: bool,
}

/// Wait for exactly the given task ids to reach a terminal state.
///
/// Subscribes to the queue's event stream before sampling current task
/// states, so a completion landing in between cannot be lost. Zero ids
/// resolves immediately.
pub async fn wait_for_tasks(
    queue: &TaskQueue,
    task_ids: &[String],
    timeout: Duration,
) -> FanInResult {
    let mut result = FanInResult::default();
    if task_ids.is_empty() {
        return result;
    }

    let mut events = queue.subscribe();
    let mut waiting: HashSet<String> = task_ids.iter().cloned().collect();

    // Tasks that finished before we subscribed.
    for id in task_ids {
        if let Some(task) = queue.get_task(id).await {
            match task.status {
                TaskStatus::Completed => {
                    result
                        .outcomes
                        .insert(id.clone(), TaskTerminal::Completed(task.output.unwrap_or(Value::Null)));
                    waiting.remove(id);
                }
                TaskStatus::Failed => {
                    result.outcomes.insert(
                        id.clone(),
                        TaskTerminal::Failed(task.error.unwrap_or_else(|| "failed".into())),
                    );
                    waiting.remove(id);
                }
                _ => {}
            }
        }
    }

    let deadline = tokio::time::Instant::now() + timeout;
    while !waiting.is_empty() {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Err(_) => {
                result.timed_out = true;
                tracing::warn!(
                    "⏱️ Fan-in ceiling hit with {} task(s) still in flight",
                    waiting.len()
                );
                break;
            }
            Ok(Ok(event)) => {
                if !waiting.remove(event.task_id()) {
                    continue;
                }
                match event {
                    TaskEvent::Completed { task_id, output, .. } => {
                        result.outcomes.insert(task_id, TaskTerminal::Completed(output));
                    }
                    TaskEvent::Failed { task_id, error, .. } => {
                        result.outcomes.insert(task_id, TaskTerminal::Failed(error));
                    }
                }
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Lagged(_))) => {
                // Missed events — re-sample the stragglers from the table.
                let ids: Vec<String> = waiting.iter().cloned().collect();
                for id in ids {
                    if let Some(task) = queue.get_task(&id).await {
                        match task.status {
                            TaskStatus::Completed => {
                                result.outcomes.insert(
                                    id.clone(),
                                    TaskTerminal::Completed(task.output.unwrap_or(Value::Null)),
                                );
                                waiting.remove(&id);
                            }
                            TaskStatus::Failed => {
                                result.outcomes.insert(
                                    id.clone(),
                                    TaskTerminal::Failed(
                                        task.error.unwrap_or_else(|| "failed".into()),
                                    ),
                                );
                                waiting.remove(&id);
                            }
                            _ => {}
                        }
                    }
                }
            }
            Ok(Err(tokio::sync::broadcast::error::RecvError::Closed)) => break,
        }
    }

    result
}

/// Interprets a compiled template against the pipeline context.
pub struct WorkflowExecutor {
    ctx: Arc<PipelineContext>,
}

impl WorkflowExecutor {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }

    /// Run a template to completion. Step failures mark the execution
    /// `Failed` and are reported on the record, not as an `Err` — the
    /// caller always gets a usable (possibly partial) execution back.
    pub async fn execute(
        &self,
        template: &CompiledTemplate,
        params: Map<String, Value>,
        tenant_id: &str,
    ) -> Result<WorkflowExecution> {
        let params = self.apply_parameter_defaults(template, params)?;
        let mut execution = WorkflowExecution::new(&template.spec.id, tenant_id, params.clone());
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        self.ctx.audit.emit(AuditRecord::new(
            "execution",
            &execution.id,
            "running",
            &format!("template={}", template.spec.id),
        ));
        tracing::info!(
            "▶️ Execution {} started (template {})",
            execution.id,
            template.spec.id
        );

        let mut scope = ExecutionScope {
            params,
            outputs: HashMap::new(),
            item: None,
        };

        for (step, compiled) in template.spec.steps.iter().zip(&template.compiled) {
            match self
                .run_step(step, compiled, &mut scope, &mut execution, tenant_id)
                .await
            {
                Ok(()) => {}
                Err(e) => {
                    let redacted = redact_credentials(&e.to_string());
                    // Keep whatever earlier steps produced — a failed
                    // execution is still a usable partial result.
                    execution.outputs = scope.outputs;
                    execution.status = ExecutionStatus::Failed;
                    execution.error = Some(redacted.clone());
                    execution.finished_at = Some(Utc::now());
                    self.ctx.audit.emit(AuditRecord::new(
                        "execution",
                        &execution.id,
                        "failed",
                        &format!("step={} {}", step.id, redacted),
                    ));
                    tracing::warn!("❌ Execution {} failed at step {}", execution.id, step.id);
                    return Ok(execution);
                }
            }
        }

        execution.outputs = scope.outputs;
        execution.status = ExecutionStatus::Completed;
        execution.finished_at = Some(Utc::now());
        self.ctx
            .audit
            .emit(AuditRecord::new("execution", &execution.id, "completed", ""));
        tracing::info!("✅ Execution {} completed", execution.id);
        Ok(execution)
    }

    fn apply_parameter_defaults(
        &self,
        template: &CompiledTemplate,
        mut params: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        for spec in &template.spec.parameters {
            if params.contains_key(&spec.name) {
                continue;
            }
            if let Some(default) = &spec.default {
                params.insert(spec.name.clone(), default.clone());
            } else if spec.required {
                return Err(ProspectorError::Validation(format!(
                    "missing required parameter '{}'",
                    spec.name
                )));
            }
        }
        Ok(params)
    }

    async fn run_step(
        &self,
        step: &WorkflowStep,
        compiled: &CompiledStep,
        scope: &mut ExecutionScope,
        execution: &mut WorkflowExecution,
        tenant_id: &str,
    ) -> Result<()> {
        if let Some(binding) = &compiled.skip_if_empty {
            let value = crate::bindings::CompiledValue::Binding(binding.clone())
                .resolve(scope)
                .unwrap_or(Value::Null);
            if is_empty_value(&value) {
                tracing::debug!("⏭️ Step {} skipped (empty condition)", step.id);
                scope.outputs.insert(step.output_var.clone(), Value::Null);
                return Ok(());
            }
        }

        // Step-output memoization: a resumed execution picks up completed
        // cacheable work instead of repeating it.
        let cache_key = match &compiled.cache_key {
            Some(key) => match key.resolve(scope)? {
                Value::String(s) => Some(s),
                other => Some(other.to_string()),
            },
            None => None,
        };
        if let Some(key) = &cache_key
            && let Some(hit) = self.ctx.cache.get(key).await
        {
            tracing::debug!("♻️ Step {} served from cache ({})", step.id, key);
            scope.outputs.insert(step.output_var.clone(), hit);
            return Ok(());
        }

        let output = match step.strategy {
            StepStrategy::Sync => {
                let input = compiled.input.resolve(scope)?;
                let (output, cost) = self
                    .invoke_with_retry(&step.capability_id, input, tenant_id, &step.retry)
                    .await?;
                execution.cost += cost;
                output
            }
            StepStrategy::Queue => {
                self.run_queued(step, compiled, scope, execution, tenant_id)
                    .await?
            }
            StepStrategy::Parallel => {
                let (output, cost) = self
                    .run_parallel(step, compiled, scope, tenant_id)
                    .await?;
                execution.cost += cost;
                output
            }
        };

        if let Some(key) = cache_key {
            let ttl = step
                .cache
                .as_ref()
                .and_then(|c| c.ttl_secs)
                .map(|s| chrono::Duration::seconds(s as i64));
            self.ctx.cache.save(&key, output.clone(), ttl).await;
        }
        scope.outputs.insert(step.output_var.clone(), output);
        Ok(())
    }

    /// Direct capability call with the step's own retry budget and backoff.
    async fn invoke_with_retry(
        &self,
        capability_id: &str,
        input: Value,
        tenant_id: &str,
        retry: &RetryPolicy,
    ) -> Result<(Value, f64)> {
        let opts = InvokeOptions::new(tenant_id);
        let max = retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self
                .ctx
                .invoker
                .invoke(capability_id, input.clone(), &opts)
                .await
            {
                Ok(outcome) if outcome.success => return Ok((outcome.output, outcome.cost)),
                Ok(outcome) => ProspectorError::Capability(
                    outcome
                        .error
                        .unwrap_or_else(|| "capability reported failure".into()),
                ),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };
            if attempt >= max {
                return Err(error);
            }
            let delay = retry.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
            tracing::warn!(
                "🔁 Sync step attempt {}/{} failed, retrying in {}ms: {}",
                attempt,
                max,
                delay,
                error
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    /// Fan-out through the bounded task queue, then fan-in.
    async fn run_queued(
        &self,
        step: &WorkflowStep,
        compiled: &CompiledStep,
        scope: &mut ExecutionScope,
        execution: &mut WorkflowExecution,
        tenant_id: &str,
    ) -> Result<Value> {
        let inputs = self.fan_out_inputs(compiled, scope)?;
        let token_ttl = step
            .token_ttl_secs
            .unwrap_or(self.ctx.config.tokens.default_ttl_secs);

        let mut task_ids = Vec::with_capacity(inputs.len());
        for input in inputs {
            let id = self
                .ctx
                .queue
                .enqueue(
                    &execution.id,
                    &step.id,
                    &step.capability_id,
                    input,
                    tenant_id,
                    token_ttl,
                    step.retry.max_attempts,
                )
                .await;
            task_ids.push(id);
        }
        execution.task_ids.extend(task_ids.iter().cloned());

        let timeout = Duration::from_secs(self.ctx.config.scheduler.fan_in_timeout_secs);
        let fan_in = wait_for_tasks(&self.ctx.queue, &task_ids, timeout).await;

        // Terminal outcomes in enqueue order; in-flight tasks are omitted.
        let mut entries = Vec::new();
        for id in &task_ids {
            if let Some(task) = self.ctx.queue.get_task(id).await {
                execution.cost += task.cost;
            }
            match fan_in.outcomes.get(id) {
                Some(TaskTerminal::Completed(output)) => entries.push(json!({
                    "task_id": id,
                    "status": "completed",
                    "output": output,
                })),
                Some(TaskTerminal::Failed(error)) => entries.push(json!({
                    "task_id": id,
                    "status": "failed",
                    "error": error,
                })),
                None => {}
            }
        }
        Ok(Value::Array(entries))
    }

    /// Direct concurrent calls with a per-step cap, preserving item order.
    async fn run_parallel(
        &self,
        step: &WorkflowStep,
        compiled: &CompiledStep,
        scope: &mut ExecutionScope,
        tenant_id: &str,
    ) -> Result<(Value, f64)> {
        let inputs = self.fan_out_inputs(compiled, scope)?;
        let cap = step
            .max_concurrency
            .unwrap_or(self.ctx.config.queue.max_concurrency)
            .max(1);
        let opts = InvokeOptions::new(tenant_id);

        let results: Vec<(Value, f64)> = futures::stream::iter(inputs)
            .map(|input| {
                let invoker = Arc::clone(&self.ctx.invoker);
                let capability = step.capability_id.clone();
                let opts = opts.clone();
                async move {
                    match invoker.invoke(&capability, input, &opts).await {
                        Ok(o) if o.success => (json!({"status": "completed", "output": o.output}), o.cost),
                        Ok(o) => (
                            json!({
                                "status": "failed",
                                "error": o.error.unwrap_or_else(|| "failed".into()),
                            }),
                            o.cost,
                        ),
                        Err(e) => (
                            json!({
                                "status": "failed",
                                "error": redact_credentials(&e.to_string()),
                            }),
                            0.0,
                        ),
                    }
                }
            })
            .buffered(cap)
            .collect()
            .await;

        let cost = results.iter().map(|(_, c)| c).sum();
        let entries = results.into_iter().map(|(v, _)| v).collect();
        Ok((Value::Array(entries), cost))
    }

    /// Resolve one input per fan-out item, or a single input without
    /// `for_each`.
    fn fan_out_inputs(
        &self,
        compiled: &CompiledStep,
        scope: &mut ExecutionScope,
    ) -> Result<Vec<Value>> {
        match &compiled.for_each {
            None => Ok(vec![compiled.input.resolve(scope)?]),
            Some(binding) => {
                let list = crate::bindings::CompiledValue::Binding(binding.clone())
                    .resolve(scope)?;
                let Value::Array(items) = list else {
                    return Err(ProspectorError::Workflow(
                        "for_each binding did not resolve to an array".into(),
                    ));
                };
                let mut inputs = Vec::with_capacity(items.len());
                for item in items {
                    scope.item = Some(item);
                    inputs.push(compiled.input.resolve(scope)?);
                }
                scope.item = None;
                Ok(inputs)
            }
        }
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        Value::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::WorkflowTemplate;
    use async_trait::async_trait;
    use prospector_core::capability::{CapabilityInvoker, CapabilityOutcome};
    use prospector_core::config::OrchestratorConfig;
    use prospector_core::{MemorySink, audit::AuditSink};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoInvoker {
        calls: AtomicUsize,
        delay_ms: u64,
    }

    #[async_trait]
    impl CapabilityInvoker for EchoInvoker {
        async fn invoke(
            &self,
            capability_id: &str,
            input: Value,
            _opts: &InvokeOptions,
        ) -> prospector_core::Result<CapabilityOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            Ok(CapabilityOutcome::ok(json!({"cap": capability_id, "echo": input})))
        }
    }

    fn context_with(invoker: Arc<dyn CapabilityInvoker>) -> Arc<PipelineContext> {
        let mut config = OrchestratorConfig::default();
        config.queue.dispatch_idle_ms = 10;
        config.queue.base_delay_ms = 20;
        config.scheduler.fan_in_timeout_secs = 10;
        let ctx = PipelineContext::new(config, invoker, Arc::new(MemorySink::new()) as Arc<dyn AuditSink>);
        ctx.spawn_background();
        ctx
    }

    fn discovery_like_template() -> CompiledTemplate {
        WorkflowTemplate::load(&json!({
            "id": "wf-discovery",
            "name": "Discovery",
            "parameters": [
                {"name": "region", "required": true},
                {"name": "kind", "default": "coffee shop"}
            ],
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
                    "input": {"sub_region": "{{item}}", "kind": "{{params.kind}}"},
                    "strategy": "queue",
                    "for_each": "steps.targets.echo.region.subs",
                    "output_var": "found"
                }
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_sync_steps_chain_outputs() {
        let ctx = context_with(Arc::new(EchoInvoker { calls: AtomicUsize::new(0), delay_ms: 0 }));
        let executor = WorkflowExecutor::new(Arc::clone(&ctx));

        let template = WorkflowTemplate::load(&json!({
            "id": "wf-chain",
            "name": "Chain",
            "parameters": [{"name": "region", "required": true}],
            "steps": [
                {
                    "id": "a",
                    "capability_id": "first",
                    "input": {"q": "{{params.region}}"},
                    "output_var": "one"
                },
                {
                    "id": "b",
                    "capability_id": "second",
                    "input": {"from": "{{steps.one.echo.q}}"},
                    "output_var": "two"
                }
            ]
        }))
        .unwrap();

        let mut params = Map::new();
        params.insert("region".into(), json!("austin"));
        let execution = executor.execute(&template, params, "t1").await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.outputs["two"]["echo"]["from"], "austin");
    }

    #[tokio::test]
    async fn test_missing_required_parameter() {
        let ctx = context_with(Arc::new(EchoInvoker { calls: AtomicUsize::new(0), delay_ms: 0 }));
        let executor = WorkflowExecutor::new(ctx);
        let template = discovery_like_template();

        let err = executor.execute(&template, Map::new(), "t1").await.unwrap_err();
        assert!(matches!(err, ProspectorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_queued_fan_out_per_item() {
        // resolve-subregions echoes {"subs": [..]} back; discover fans out
        // one queued task per element.
        let ctx = context_with(Arc::new(EchoInvoker { calls: AtomicUsize::new(0), delay_ms: 0 }));
        let executor = WorkflowExecutor::new(Arc::clone(&ctx));
        let template = discovery_like_template();

        let mut params = Map::new();
        params.insert(
            "region".into(),
            json!({"subs": ["north", "south", "east"]}),
        );
        let execution = executor.execute(&template, params, "t1").await.unwrap();

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.task_ids.len(), 3);
        let found = execution.outputs["found"].as_array().unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|e| e["status"] == "completed"));
        let subs: Vec<&str> = found
            .iter()
            .map(|e| e["output"]["echo"]["sub_region"].as_str().unwrap())
            .collect();
        assert_eq!(subs, vec!["north", "south", "east"]);
    }

    #[tokio::test]
    async fn test_step_cache_memoizes() {
        let invoker = Arc::new(EchoInvoker { calls: AtomicUsize::new(0), delay_ms: 0 });
        let ctx = context_with(Arc::clone(&invoker) as Arc<dyn CapabilityInvoker>);
        let executor = WorkflowExecutor::new(Arc::clone(&ctx));

        let template = WorkflowTemplate::load(&json!({
            "id": "wf-cached",
            "name": "Cached",
            "parameters": [{"name": "region", "required": true}],
            "steps": [{
                "id": "resolve",
                "capability_id": "resolve-subregions",
                "input": {"region": "{{params.region}}"},
                "cache": {"key": "subregions:{{params.region}}", "ttl_secs": 3600},
                "output_var": "targets"
            }]
        }))
        .unwrap();

        let mut params = Map::new();
        params.insert("region".into(), json!("austin"));
        executor.execute(&template, params.clone(), "t1").await.unwrap();
        executor.execute(&template, params, "t1").await.unwrap();

        // Second run was served from cache.
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
        assert!(ctx.cache.has("subregions:austin").await);
    }

    #[tokio::test]
    async fn test_skip_condition() {
        let invoker = Arc::new(EchoInvoker { calls: AtomicUsize::new(0), delay_ms: 0 });
        let ctx = context_with(Arc::clone(&invoker) as Arc<dyn CapabilityInvoker>);
        let executor = WorkflowExecutor::new(ctx);

        let template = WorkflowTemplate::load(&json!({
            "id": "wf-skip",
            "name": "Skip",
            "parameters": [{"name": "targets", "default": []}],
            "steps": [{
                "id": "discover",
                "capability_id": "discover-businesses",
                "input": {},
                "skip_if_empty": "params.targets",
                "output_var": "found"
            }]
        }))
        .unwrap();

        let execution = executor.execute(&template, Map::new(), "t1").await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.outputs["found"], Value::Null);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fan_in_zero_ids_resolves_immediately() {
        let ctx = context_with(Arc::new(EchoInvoker { calls: AtomicUsize::new(0), delay_ms: 0 }));
        let result = wait_for_tasks(&ctx.queue, &[], Duration::from_secs(60)).await;
        assert!(result.outcomes.is_empty());
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_fan_in_timeout_returns_partial() {
        // A task slower than the fan-in ceiling.
        let ctx = context_with(Arc::new(EchoInvoker { calls: AtomicUsize::new(0), delay_ms: 700 }));
        let slow_id = ctx
            .queue
            .enqueue("exec-t", "s1", "discover-businesses", json!({"slow": true}), "t1", 120, 1)
            .await;

        let result =
            wait_for_tasks(&ctx.queue, std::slice::from_ref(&slow_id), Duration::from_millis(150)).await;
        assert!(result.timed_out);
        assert!(!result.outcomes.contains_key(&slow_id));

        // The abandoned task keeps running and still completes.
        let later = wait_for_tasks(
            &ctx.queue,
            std::slice::from_ref(&slow_id),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(
            later.outcomes.get(&slow_id),
            Some(TaskTerminal::Completed(_))
        ));
    }

    #[tokio::test]
    async fn test_parallel_strategy_preserves_order() {
        let ctx = context_with(Arc::new(EchoInvoker { calls: AtomicUsize::new(0), delay_ms: 10 }));
        let executor = WorkflowExecutor::new(ctx);

        let template = WorkflowTemplate::load(&json!({
            "id": "wf-par",
            "name": "Parallel",
            "parameters": [{"name": "targets", "required": true}],
            "steps": [{
                "id": "audit",
                "capability_id": "audit-website",
                "input": {"target": "{{item}}"},
                "strategy": "parallel",
                "for_each": "params.targets",
                "max_concurrency": 2,
                "output_var": "audits"
            }]
        }))
        .unwrap();

        let mut params = Map::new();
        params.insert("targets".into(), json!(["a", "b", "c", "d"]));
        let execution = executor.execute(&template, params, "t1").await.unwrap();

        let audits = execution.outputs["audits"].as_array().unwrap();
        let order: Vec<&str> = audits
            .iter()
            .map(|e| e["output"]["echo"]["target"].as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }
}
