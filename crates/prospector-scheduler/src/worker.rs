//! Out-of-process workers for `Worker`-kind schedules.
//!
//! Long-running or untrusted firings run in a spawned child process instead
//! of the orchestrator's own runtime. The table tracks active children so
//! concurrency is observable and completion can be awaited.

use prospector_core::{ProspectorError, Result};
use std::collections::HashMap;
use std::process::ExitStatus;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

/// Tracks spawned worker processes, keyed by the owning schedule id.
#[derive(Default)]
pub struct WorkerTable {
    active: Mutex<HashMap<String, Child>>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a worker and track it. Returns the OS pid.
    /// An existing worker for the same schedule is left running; the new
    /// spawn is rejected so one schedule never stacks children.
    pub async fn spawn(&self, schedule_id: &str, command: &str, args: &[String]) -> Result<u32> {
        let mut active = self.active.lock().await;
        if let Some(child) = active.get_mut(schedule_id) {
            match child.try_wait() {
                Ok(None) => {
                    return Err(ProspectorError::Schedule(format!(
                        "schedule '{schedule_id}' already has a running worker"
                    )));
                }
                // Finished or unobservable — replace it.
                _ => {
                    active.remove(schedule_id);
                }
            }
        }

        let child = Command::new(command)
            .args(args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProspectorError::Schedule(format!("failed to spawn worker '{command}': {e}"))
            })?;
        let pid = child.id().unwrap_or(0);
        tracing::info!("🧰 Worker spawned for {} (pid {})", schedule_id, pid);
        active.insert(schedule_id.to_string(), child);
        Ok(pid)
    }

    /// Number of workers currently tracked (finished ones are pruned).
    pub async fn count(&self) -> usize {
        let mut active = self.active.lock().await;
        active.retain(|_, child| matches!(child.try_wait(), Ok(None)));
        active.len()
    }

    /// Await the worker for a schedule, removing it from the table.
    /// Returns `None` when no worker is tracked for that schedule.
    pub async fn wait(&self, schedule_id: &str) -> Result<Option<ExitStatus>> {
        let child = self.active.lock().await.remove(schedule_id);
        match child {
            None => Ok(None),
            Some(mut child) => {
                let status = child.wait().await?;
                tracing::debug!("🧰 Worker for {} exited: {}", schedule_id, status);
                Ok(Some(status))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_wait_and_count() {
        let table = WorkerTable::new();
        let pid = table
            .spawn("sched-1", "sh", &["-c".into(), "sleep 0.1".into()])
            .await
            .unwrap();
        assert!(pid > 0);
        assert_eq!(table.count().await, 1);

        let status = table.wait("sched-1").await.unwrap().unwrap();
        assert!(status.success());
        assert_eq!(table.count().await, 0);
        assert!(table.wait("sched-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_spawn_while_running_rejected() {
        let table = WorkerTable::new();
        table
            .spawn("sched-1", "sh", &["-c".into(), "sleep 5".into()])
            .await
            .unwrap();
        let err = table
            .spawn("sched-1", "sh", &["-c".into(), "true".into()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already has a running worker"));
    }

    #[tokio::test]
    async fn test_spawn_missing_command_fails() {
        let table = WorkerTable::new();
        assert!(
            table
                .spawn("sched-1", "/nonexistent/worker-bin", &[])
                .await
                .is_err()
        );
    }
}
