//! The heartbeat engine — scans enabled schedules and fires the due ones.
//!
//! Firings within one tick run sequentially to bound resource use; a
//! failure is recorded in `last_result` and never disables the schedule.
//! The next run is computed from the completion instant, not the stale
//! trigger instant, so a slow firing cannot build a backlog.

use crate::cron::next_run_from_cron;
use crate::schedule::{RunOutcome, Schedule, ScheduleKind, Trigger};
use crate::store::ScheduleStore;
use crate::worker::WorkerTable;
use chrono::Utc;
use prospector_core::audit::AuditRecord;
use prospector_core::{ProspectorError, Result, redact_credentials};
use prospector_workflow::{DiscoveryPipeline, DiscoveryRequest, PipelineContext};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Workflow id the in-process dispatcher knows how to run.
pub const REGION_DISCOVERY: &str = "region-discovery";

pub struct ScheduleEngine {
    ctx: Arc<PipelineContext>,
    store: Arc<dyn ScheduleStore>,
    pub workers: WorkerTable,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl ScheduleEngine {
    pub fn new(ctx: Arc<PipelineContext>, store: Arc<dyn ScheduleStore>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            store,
            workers: WorkerTable::new(),
            heartbeat: Mutex::new(None),
        })
    }

    // ---- management surface -------------------------------------------

    pub async fn create(
        &self,
        name: &str,
        workflow_id: &str,
        params: Value,
        trigger: Trigger,
        tenant_id: &str,
        kind: ScheduleKind,
    ) -> Result<Schedule> {
        let schedule = Schedule::new(name, workflow_id, params, trigger, tenant_id, kind);
        tracing::info!(
            "📅 Schedule created: '{}' ({}) cron='{}' next={:?}",
            schedule.name,
            schedule.id,
            schedule.trigger.cron,
            schedule.next_run
        );
        self.store.create(schedule.clone()).await?;
        self.ctx.audit.emit(AuditRecord::new(
            "schedule",
            &schedule.id,
            "created",
            &schedule.trigger.cron,
        ));
        Ok(schedule)
    }

    pub async fn list(&self, tenant_id: Option<&str>) -> Result<Vec<Schedule>> {
        self.store.list(tenant_id).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Schedule>> {
        self.store.get(id).await
    }

    pub async fn update(&self, schedule: Schedule) -> Result<()> {
        self.store.update(schedule).await
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let existed = self.store.delete(id).await?;
        if existed {
            tracing::info!("🗑️ Schedule removed: {}", id);
            self.ctx
                .audit
                .emit(AuditRecord::new("schedule", id, "deleted", ""));
        }
        Ok(existed)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut schedule = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| ProspectorError::Schedule(format!("no schedule '{id}'")))?;
        schedule.enabled = enabled;
        if enabled {
            schedule.next_run = next_run_from_cron(&schedule.trigger.cron, Utc::now());
        }
        self.store.update(schedule).await
    }

    // ---- firing -------------------------------------------------------

    /// One heartbeat: fire every due schedule, sequentially.
    /// Returns how many schedules fired.
    pub async fn tick(&self) -> Result<usize> {
        let now = Utc::now();
        let mut due: Vec<Schedule> = self
            .store
            .list(None)
            .await?
            .into_iter()
            .filter(|s| s.is_due(now))
            .collect();
        due.sort_by_key(|s| s.next_run);

        let fired = due.len();
        for schedule in due {
            self.fire(schedule).await;
        }
        Ok(fired)
    }

    async fn fire(&self, mut schedule: Schedule) {
        tracing::info!("🔔 Schedule firing: '{}' ({})", schedule.name, schedule.id);
        schedule.last_run = Some(Utc::now());
        self.ctx
            .audit
            .emit(AuditRecord::new("schedule", &schedule.id, "firing", ""));

        let outcome = match schedule.kind {
            ScheduleKind::InProcess => self.dispatch_in_process(&schedule).await,
            ScheduleKind::Worker => self.dispatch_worker(&schedule).await,
        };

        let (success, detail) = match outcome {
            Ok(detail) => (true, detail),
            Err(e) => (false, e.to_string()),
        };
        let detail = redact_credentials(&detail);
        if success {
            tracing::info!("✅ Schedule '{}' fired: {}", schedule.name, detail);
        } else {
            tracing::warn!("⚠️ Schedule '{}' firing failed: {}", schedule.name, detail);
        }

        let completed_at = Utc::now();
        schedule.last_result = Some(RunOutcome {
            success,
            detail: detail.clone(),
            at: completed_at,
        });
        schedule.run_count += 1;
        // Recompute from the completion instant so a slow firing does not
        // leave a backlog of immediately-due runs.
        schedule.next_run = next_run_from_cron(&schedule.trigger.cron, completed_at);

        self.ctx.audit.emit(AuditRecord::new(
            "schedule",
            &schedule.id,
            if success { "fired" } else { "failed" },
            &detail,
        ));
        if let Err(e) = self.store.update(schedule).await {
            tracing::warn!("⚠️ Failed to persist schedule after firing: {e}");
        }
    }

    async fn dispatch_in_process(&self, schedule: &Schedule) -> Result<String> {
        if schedule.workflow_id != REGION_DISCOVERY {
            return Err(ProspectorError::Schedule(format!(
                "no in-process dispatcher for workflow '{}'",
                schedule.workflow_id
            )));
        }

        let region = schedule
            .params
            .get("region")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProspectorError::Schedule("schedule params are missing 'region'".into())
            })?;
        let kind = schedule
            .params
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("business");
        let mut request = DiscoveryRequest::new(region, kind, &schedule.tenant_id);
        if let Some(subs) = schedule.params.get("sub_regions") {
            request.sub_regions = serde_json::from_value(subs.clone()).ok();
        }

        let pipeline = DiscoveryPipeline::new(Arc::clone(&self.ctx));
        let report = pipeline.run(&request).await?;
        Ok(format!(
            "{} businesses ({} succeeded / {} failed sub-targets)",
            report.summary.total_records, report.summary.succeeded, report.summary.failed
        ))
    }

    async fn dispatch_worker(&self, schedule: &Schedule) -> Result<String> {
        let command = self
            .ctx
            .config
            .scheduler
            .worker_command
            .as_deref()
            .ok_or_else(|| {
                ProspectorError::Schedule(
                    "worker-kind schedule but no worker_command configured".into(),
                )
            })?;
        let args = vec![schedule.workflow_id.clone(), schedule.params.to_string()];
        let pid = self.workers.spawn(&schedule.id, command, &args).await?;
        Ok(format!("worker spawned (pid {pid})"))
    }

    // ---- heartbeat ----------------------------------------------------

    /// Start the heartbeat loop. A second start is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut heartbeat = self.heartbeat.lock().await;
        if heartbeat.is_some() {
            return;
        }
        let engine = Arc::clone(self);
        let secs = self.ctx.config.scheduler.heartbeat_secs.max(1);
        tracing::info!("💓 Heartbeat started ({}s interval)", secs);
        *heartbeat = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = engine.tick().await {
                    tracing::warn!("⚠️ Heartbeat tick failed: {e}");
                }
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.heartbeat.lock().await.take() {
            handle.abort();
            tracing::info!("💓 Heartbeat stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.heartbeat.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Trigger;
    use crate::store::MemoryScheduleStore;
    use prospector_core::capability::{CapabilityInvoker, CapabilityOutcome, FnInvoker};
    use prospector_core::config::OrchestratorConfig;
    use prospector_core::{MemorySink, audit::AuditSink};
    use serde_json::json;

    fn happy_invoker() -> Arc<dyn CapabilityInvoker> {
        Arc::new(FnInvoker(|cap: &str, _input: Value| match cap {
            "resolve-subregions" => Ok(CapabilityOutcome::ok(json!({"sub_regions": ["north"]}))),
            "discover-businesses" => Ok(CapabilityOutcome::ok(
                json!({"businesses": [{"id": "b1", "name": "Biz"}]}),
            )),
            other => Ok(CapabilityOutcome::err(&format!("unknown capability {other}"))),
        }))
    }

    fn failing_invoker() -> Arc<dyn CapabilityInvoker> {
        Arc::new(FnInvoker(|_cap: &str, _input: Value| {
            Ok(CapabilityOutcome::err("provider down"))
        }))
    }

    fn engine_with(
        invoker: Arc<dyn CapabilityInvoker>,
        worker_command: Option<&str>,
    ) -> Arc<ScheduleEngine> {
        let mut config = OrchestratorConfig::default();
        config.queue.dispatch_idle_ms = 10;
        config.queue.base_delay_ms = 10;
        config.scheduler.fan_in_timeout_secs = 10;
        config.scheduler.worker_command = worker_command.map(str::to_string);
        let ctx = PipelineContext::new(
            config,
            invoker,
            Arc::new(MemorySink::new()) as Arc<dyn AuditSink>,
        );
        ctx.spawn_background();
        ScheduleEngine::new(ctx, Arc::new(MemoryScheduleStore::new()))
    }

    async fn make_due(engine: &ScheduleEngine, kind: ScheduleKind) -> String {
        let schedule = engine
            .create(
                "sweep",
                REGION_DISCOVERY,
                json!({"region": "Austin", "kind": "coffee shop"}),
                Trigger::from_cron("0 9 * * *").unwrap(),
                "t1",
                kind,
            )
            .await
            .unwrap();
        let id = schedule.id.clone();
        let mut due = schedule;
        due.next_run = Some(Utc::now() - chrono::Duration::seconds(1));
        engine.update(due).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_due_schedule_fires_and_recomputes_next_run() {
        let engine = engine_with(happy_invoker(), None);
        let id = make_due(&engine, ScheduleKind::InProcess).await;

        let fired = engine.tick().await.unwrap();
        assert_eq!(fired, 1);

        let after = engine.get(&id).await.unwrap().unwrap();
        assert_eq!(after.run_count, 1);
        assert!(after.last_run.is_some());
        let result = after.last_result.unwrap();
        assert!(result.success);
        assert!(result.detail.contains("1 businesses"));
        // Recomputed from completion, strictly in the future.
        assert!(after.next_run.unwrap() > Utc::now());

        // Nothing due anymore.
        assert_eq!(engine.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_firing_failure_never_disables() {
        let engine = engine_with(failing_invoker(), None);
        let id = make_due(&engine, ScheduleKind::InProcess).await;

        engine.tick().await.unwrap();
        let after = engine.get(&id).await.unwrap().unwrap();
        assert!(after.enabled);
        assert!(!after.last_result.unwrap().success);
        assert!(after.next_run.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_disabled_schedule_not_fired() {
        let engine = engine_with(happy_invoker(), None);
        let id = make_due(&engine, ScheduleKind::InProcess).await;
        engine.set_enabled(&id, false).await.unwrap();

        // set_enabled(false) keeps next_run, but is_due requires enabled.
        let mut schedule = engine.get(&id).await.unwrap().unwrap();
        schedule.next_run = Some(Utc::now() - chrono::Duration::seconds(1));
        engine.update(schedule).await.unwrap();

        assert_eq!(engine.tick().await.unwrap(), 0);
        assert_eq!(engine.get(&id).await.unwrap().unwrap().run_count, 0);
    }

    #[tokio::test]
    async fn test_worker_kind_spawns_process() {
        let engine = engine_with(happy_invoker(), Some("true"));
        let id = make_due(&engine, ScheduleKind::Worker).await;

        engine.tick().await.unwrap();
        let after = engine.get(&id).await.unwrap().unwrap();
        let result = after.last_result.unwrap();
        assert!(result.success, "{}", result.detail);
        assert!(result.detail.contains("worker spawned"));
    }

    #[tokio::test]
    async fn test_worker_kind_without_command_fails_firing() {
        let engine = engine_with(happy_invoker(), None);
        let id = make_due(&engine, ScheduleKind::Worker).await;

        engine.tick().await.unwrap();
        let after = engine.get(&id).await.unwrap().unwrap();
        assert!(!after.last_result.unwrap().success);
        assert!(after.enabled);
    }

    #[tokio::test]
    async fn test_heartbeat_start_stop() {
        let engine = engine_with(happy_invoker(), None);
        assert!(!engine.is_running().await);
        engine.start().await;
        assert!(engine.is_running().await);
        engine.start().await; // idempotent
        engine.stop().await;
        assert!(!engine.is_running().await);
    }
}
