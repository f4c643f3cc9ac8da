//! Task table, dispatch loop, and completion handling.

use chrono::{DateTime, Utc};
use prospector_core::audit::{AuditRecord, AuditSink};
use prospector_core::capability::{CapabilityInvoker, InvokeOptions};
use prospector_core::config::QueueConfig;
use prospector_core::redact_credentials;
use prospector_security::TokenAuthority;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, broadcast};

/// Task lifecycle: Pending → Running → Completed | Failed.
/// A failed attempt with budget remaining goes back to Pending after a
/// backoff delay. Completed and Failed are terminal — a task in either
/// state is never re-dispatched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// A unit of delegated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: String,
    /// Owning workflow execution.
    pub execution_id: String,
    pub step_id: String,
    pub capability_id: String,
    pub tenant_id: String,
    pub input: Value,
    /// Ephemeral token minted at enqueue, scoped to `capability_id`.
    pub token: String,
    pub token_expires_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: TaskStatus,
    pub output: Option<Value>,
    /// Terminal error text (credential-redacted).
    pub error: Option<String>,
    /// Accumulated capability cost.
    pub cost: f64,
    /// Backoff gate — the task is not eligible for dispatch before this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Terminal-state notification broadcast to fan-in listeners.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Completed {
        task_id: String,
        execution_id: String,
        output: Value,
    },
    Failed {
        task_id: String,
        execution_id: String,
        error: String,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Completed { task_id, .. } => task_id,
            TaskEvent::Failed { task_id, .. } => task_id,
        }
    }
}

/// Queue-wide counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_processed: u64,
}

struct QueueState {
    tasks: HashMap<String, QueuedTask>,
    /// Insertion order, so dispatch prefers older tasks. Dispatch is
    /// concurrency-capped, not sequence-preserving.
    order: Vec<String>,
    running: usize,
    total_processed: u64,
}

/// Bounded-concurrency task runner.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    config: QueueConfig,
    tokens: Arc<TokenAuthority>,
    invoker: Arc<dyn CapabilityInvoker>,
    audit: Arc<dyn AuditSink>,
    events: broadcast::Sender<TaskEvent>,
    wake: Notify,
}

struct DispatchSlip {
    task_id: String,
    attempt: u32,
    capability_id: String,
    input: Value,
    token: String,
    tenant_id: String,
}

enum AttemptOutcome {
    Success { output: Value, cost: f64 },
    /// Transient capability failure — retried while budget remains.
    Retryable(String),
    /// Validation/credential failure — never retried.
    Fatal(String),
}

impl TaskQueue {
    pub fn new(
        config: QueueConfig,
        tokens: Arc<TokenAuthority>,
        invoker: Arc<dyn CapabilityInvoker>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(QueueState {
                tasks: HashMap::new(),
                order: Vec::new(),
                running: 0,
                total_processed: 0,
            }),
            config,
            tokens,
            invoker,
            audit,
            events,
            wake: Notify::new(),
        }
    }

    /// Subscribe to terminal-state notifications. Subscribe *before*
    /// sampling task state so no completion slips through the gap.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Queue a task. Mints a token scoped to exactly this capability and
    /// returns the task id immediately — never blocks on execution.
    #[allow(clippy::too_many_arguments)]
    pub async fn enqueue(
        &self,
        execution_id: &str,
        step_id: &str,
        capability_id: &str,
        input: Value,
        tenant_id: &str,
        token_ttl_secs: u64,
        max_attempts: u32,
    ) -> String {
        let token = self
            .tokens
            .create(
                tenant_id,
                execution_id,
                token_ttl_secs,
                vec![capability_id.to_string()],
            )
            .await;

        let task = QueuedTask {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            execution_id: execution_id.to_string(),
            step_id: step_id.to_string(),
            capability_id: capability_id.to_string(),
            tenant_id: tenant_id.to_string(),
            input,
            token: token.token,
            token_expires_at: token.expires_at,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            status: TaskStatus::Pending,
            output: None,
            error: None,
            cost: 0.0,
            not_before: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let id = task.id.clone();

        {
            let mut state = self.state.lock().await;
            state.order.push(id.clone());
            state.tasks.insert(id.clone(), task);
        }
        self.audit.emit(AuditRecord::new(
            "task",
            &id,
            "pending",
            &format!("capability={capability_id} execution={execution_id}"),
        ));
        tracing::debug!("📥 Task {} queued (capability {})", id, capability_id);
        self.wake.notify_one();
        id
    }

    /// Look up a task by id.
    pub async fn get_task(&self, id: &str) -> Option<QueuedTask> {
        self.state.lock().await.tasks.get(id).cloned()
    }

    /// All tasks belonging to one execution, in enqueue order.
    pub async fn get_tasks_for_execution(&self, execution_id: &str) -> Vec<QueuedTask> {
        let state = self.state.lock().await;
        state
            .order
            .iter()
            .filter_map(|id| state.tasks.get(id))
            .filter(|t| t.execution_id == execution_id)
            .cloned()
            .collect()
    }

    /// Cancel a task that has not been dispatched yet. Running tasks cannot
    /// be preempted — the only recourse for a caller is the fan-in's own
    /// timeout, which abandons waiting without touching in-flight work.
    pub async fn cancel_task(&self, id: &str) -> bool {
        let (token, execution_id) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            match state.tasks.get_mut(id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    task.status = TaskStatus::Failed;
                    task.error = Some("cancelled".to_string());
                    task.finished_at = Some(Utc::now());
                    state.total_processed += 1;
                    (task.token.clone(), task.execution_id.clone())
                }
                _ => return false,
            }
        };

        self.tokens.revoke(&token).await;
        self.audit
            .emit(AuditRecord::new("task", id, "failed", "cancelled"));
        let _ = self.events.send(TaskEvent::Failed {
            task_id: id.to_string(),
            execution_id,
            error: "cancelled".to_string(),
        });
        tracing::info!("🚫 Task {} cancelled", id);
        true
    }

    /// Current counters.
    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            total_processed: state.total_processed,
            running: state.running,
            ..Default::default()
        };
        for task in state.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => {}
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Dispatch loop. Spawn once; wakes on enqueue/completion signals with
    /// an idle-timeout fallback for backoff gates coming due.
    pub async fn run(self: Arc<Self>) {
        tracing::info!(
            "🚦 Task queue dispatcher started (max {} concurrent)",
            self.config.max_concurrency
        );
        loop {
            self.dispatch_ready().await;
            let idle = std::time::Duration::from_millis(self.config.dispatch_idle_ms.max(10));
            let _ = tokio::time::timeout(idle, self.wake.notified()).await;
        }
    }

    /// Promote eligible pending tasks to running, up to the concurrency cap.
    async fn dispatch_ready(self: &Arc<Self>) {
        let now = Utc::now();
        let mut to_run = Vec::new();
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let capacity = self.config.max_concurrency.saturating_sub(state.running);
            if capacity == 0 {
                return;
            }

            let eligible: Vec<String> = state
                .order
                .iter()
                .filter(|id| {
                    state.tasks.get(*id).is_some_and(|t| {
                        t.status == TaskStatus::Pending
                            && t.not_before.is_none_or(|nb| now >= nb)
                    })
                })
                .take(capacity)
                .cloned()
                .collect();

            for id in eligible {
                let task = state.tasks.get_mut(&id).expect("eligible id exists");
                task.status = TaskStatus::Running;
                task.attempts += 1;
                task.started_at = Some(now);
                task.not_before = None;
                to_run.push(DispatchSlip {
                    task_id: id,
                    attempt: task.attempts,
                    capability_id: task.capability_id.clone(),
                    input: task.input.clone(),
                    token: task.token.clone(),
                    tenant_id: task.tenant_id.clone(),
                });
                state.running += 1;
            }
        }

        for slip in to_run {
            self.audit.emit(AuditRecord::new(
                "task",
                &slip.task_id,
                "running",
                &format!("attempt {}", slip.attempt),
            ));
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                queue.run_attempt(slip).await;
            });
        }
    }

    /// One capability invocation for one task attempt.
    async fn run_attempt(self: Arc<Self>, slip: DispatchSlip) {
        // The token must still be live at dispatch time; a dead token is a
        // credential failure and is never retried.
        if self.tokens.validate(&slip.token).await.is_none() {
            self.finish_attempt(
                &slip.task_id,
                slip.attempt,
                AttemptOutcome::Fatal("token missing, expired, or revoked".to_string()),
            )
            .await;
            return;
        }

        let opts = InvokeOptions::new(&slip.tenant_id);
        let outcome = self
            .invoker
            .invoke(&slip.capability_id, slip.input.clone(), &opts)
            .await;

        let result = match outcome {
            Ok(o) if o.success => AttemptOutcome::Success {
                output: o.output,
                cost: o.cost,
            },
            Ok(o) => AttemptOutcome::Retryable(
                o.error
                    .unwrap_or_else(|| "capability reported failure".to_string()),
            ),
            Err(e) if e.is_retryable() => AttemptOutcome::Retryable(e.to_string()),
            Err(e) => AttemptOutcome::Fatal(e.to_string()),
        };

        self.finish_attempt(&slip.task_id, slip.attempt, result).await;
    }

    /// Apply an attempt outcome, guarding against stale completions: a
    /// result is dropped unless the task is still Running on the same
    /// attempt number that produced it.
    async fn finish_attempt(&self, task_id: &str, attempt: u32, outcome: AttemptOutcome) {
        let now = Utc::now();
        let mut terminal_event = None;
        let mut revoke_token = None;

        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(task) = state.tasks.get_mut(task_id) else {
                tracing::warn!("⚠️ Completion for unknown task {}", task_id);
                return;
            };
            if task.status != TaskStatus::Running || task.attempts != attempt {
                tracing::warn!(
                    "⚠️ Stale completion dropped for task {} (attempt {}, current {})",
                    task_id,
                    attempt,
                    task.attempts
                );
                self.audit.emit(AuditRecord::new(
                    "task",
                    task_id,
                    "stale-completion",
                    &format!("attempt {attempt} dropped"),
                ));
                return;
            }

            let max_attempts = task.max_attempts;
            match outcome {
                AttemptOutcome::Success { output, cost } => {
                    task.status = TaskStatus::Completed;
                    task.output = Some(output.clone());
                    task.cost += cost;
                    task.finished_at = Some(now);
                    revoke_token = Some(task.token.clone());
                    terminal_event = Some(TaskEvent::Completed {
                        task_id: task_id.to_string(),
                        execution_id: task.execution_id.clone(),
                        output,
                    });
                    state.total_processed += 1;
                }
                AttemptOutcome::Retryable(error) if attempt < max_attempts => {
                    let delay_ms = self
                        .config
                        .base_delay_ms
                        .saturating_mul(1u64 << attempt.min(16));
                    task.status = TaskStatus::Pending;
                    task.not_before =
                        Some(now + chrono::Duration::milliseconds(delay_ms as i64));
                    let redacted = redact_credentials(&error);
                    tracing::warn!(
                        "🔁 Task {} attempt {} failed, retrying in {}ms: {}",
                        task_id,
                        attempt,
                        delay_ms,
                        redacted
                    );
                    self.audit.emit(AuditRecord::new(
                        "task",
                        task_id,
                        "pending",
                        &format!("retry after attempt {attempt}: {redacted}"),
                    ));
                }
                AttemptOutcome::Retryable(error) | AttemptOutcome::Fatal(error) => {
                    let redacted = redact_credentials(&error);
                    task.status = TaskStatus::Failed;
                    task.error = Some(redacted.clone());
                    task.finished_at = Some(now);
                    revoke_token = Some(task.token.clone());
                    terminal_event = Some(TaskEvent::Failed {
                        task_id: task_id.to_string(),
                        execution_id: task.execution_id.clone(),
                        error: redacted,
                    });
                    state.total_processed += 1;
                }
            }
            state.running = state.running.saturating_sub(1);
        }

        // Token revoked on both terminal outcomes, outside the table lock.
        if let Some(token) = revoke_token {
            self.tokens.revoke(&token).await;
        }
        if let Some(event) = terminal_event {
            let (status, detail) = match &event {
                TaskEvent::Completed { .. } => ("completed", String::new()),
                TaskEvent::Failed { error, .. } => ("failed", error.clone()),
            };
            self.audit
                .emit(AuditRecord::new("task", task_id, status, &detail));
            tracing::info!("🏁 Task {} {}", task_id, status);
            let _ = self.events.send(event);
        }
        self.wake.notify_one();
    }
}
