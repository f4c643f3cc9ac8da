//! Schedule persistence.
//!
//! The engine talks to a `ScheduleStore` trait; the JSON store keeps
//! everything in one human-readable `schedules.json` and writes only on
//! mutation, never on a tick. A durable database belongs behind the same
//! trait for multi-process deployments.

use crate::schedule::Schedule;
use async_trait::async_trait;
use prospector_core::{ProspectorError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create(&self, schedule: Schedule) -> Result<()>;
    /// All schedules, optionally filtered to one tenant.
    async fn list(&self, tenant_id: Option<&str>) -> Result<Vec<Schedule>>;
    async fn get(&self, id: &str) -> Result<Option<Schedule>>;
    async fn update(&self, schedule: Schedule) -> Result<()>;
    /// Returns whether the schedule existed.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// In-memory store, mostly for tests and ephemeral embedders.
#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: Mutex<HashMap<String, Schedule>>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn create(&self, schedule: Schedule) -> Result<()> {
        self.schedules
            .lock()
            .await
            .insert(schedule.id.clone(), schedule);
        Ok(())
    }

    async fn list(&self, tenant_id: Option<&str>) -> Result<Vec<Schedule>> {
        let schedules = self.schedules.lock().await;
        let mut out: Vec<Schedule> = schedules
            .values()
            .filter(|s| tenant_id.is_none_or(|t| s.tenant_id == t))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn get(&self, id: &str) -> Result<Option<Schedule>> {
        Ok(self.schedules.lock().await.get(id).cloned())
    }

    async fn update(&self, schedule: Schedule) -> Result<()> {
        let mut schedules = self.schedules.lock().await;
        if !schedules.contains_key(&schedule.id) {
            return Err(ProspectorError::Schedule(format!(
                "no schedule '{}'",
                schedule.id
            )));
        }
        schedules.insert(schedule.id.clone(), schedule);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.schedules.lock().await.remove(id).is_some())
    }
}

/// File-backed store — schedules saved as one pretty JSON file.
pub struct JsonScheduleStore {
    path: PathBuf,
    schedules: Mutex<HashMap<String, Schedule>>,
}

impl JsonScheduleStore {
    /// Open (or create) a store in the given directory.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("schedules.json");
        let schedules = Self::load(&path);
        Ok(Self {
            path,
            schedules: Mutex::new(schedules),
        })
    }

    /// Default store directory (~/.prospector/scheduler).
    pub fn default_dir() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".prospector").join("scheduler")
    }

    fn load(path: &Path) -> HashMap<String, Schedule> {
        if !path.exists() {
            return HashMap::new();
        }
        match std::fs::read_to_string(path) {
            Ok(json) => match serde_json::from_str::<Vec<Schedule>>(&json) {
                Ok(list) => list.into_iter().map(|s| (s.id.clone(), s)).collect(),
                Err(e) => {
                    tracing::warn!("⚠️ Failed to parse schedules.json: {e}");
                    HashMap::new()
                }
            },
            Err(e) => {
                tracing::warn!("⚠️ Failed to read schedules.json: {e}");
                HashMap::new()
            }
        }
    }

    fn persist(&self, schedules: &HashMap<String, Schedule>) -> Result<()> {
        let mut list: Vec<&Schedule> = schedules.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let json = serde_json::to_string_pretty(&list)?;
        std::fs::write(&self.path, json)?;
        tracing::debug!(
            "💾 Saved {} schedule(s) to {}",
            list.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for JsonScheduleStore {
    async fn create(&self, schedule: Schedule) -> Result<()> {
        let mut schedules = self.schedules.lock().await;
        schedules.insert(schedule.id.clone(), schedule);
        self.persist(&schedules)
    }

    async fn list(&self, tenant_id: Option<&str>) -> Result<Vec<Schedule>> {
        let schedules = self.schedules.lock().await;
        let mut out: Vec<Schedule> = schedules
            .values()
            .filter(|s| tenant_id.is_none_or(|t| s.tenant_id == t))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn get(&self, id: &str) -> Result<Option<Schedule>> {
        Ok(self.schedules.lock().await.get(id).cloned())
    }

    async fn update(&self, schedule: Schedule) -> Result<()> {
        let mut schedules = self.schedules.lock().await;
        if !schedules.contains_key(&schedule.id) {
            return Err(ProspectorError::Schedule(format!(
                "no schedule '{}'",
                schedule.id
            )));
        }
        schedules.insert(schedule.id.clone(), schedule);
        self.persist(&schedules)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut schedules = self.schedules.lock().await;
        let existed = schedules.remove(id).is_some();
        if existed {
            self.persist(&schedules)?;
        }
        Ok(existed)
    }
}
