//! Audit hook — every task and schedule state transition emits a structured
//! record to an external sink. The physical log format is the collaborator's
//! concern; the default sink writes one `tracing` line per record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// One state-transition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    /// What kind of entity transitioned: "task", "schedule", "execution", "token".
    pub kind: String,
    /// Entity id.
    pub id: String,
    /// New status.
    pub status: String,
    /// Free-form detail (already credential-redacted by the emitter).
    pub detail: String,
}

impl AuditRecord {
    pub fn new(kind: &str, id: &str, status: &str, detail: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: kind.to_string(),
            id: id.to_string(),
            status: status.to_string(),
            detail: detail.to_string(),
        }
    }
}

/// External observability sink.
pub trait AuditSink: Send + Sync {
    fn emit(&self, record: AuditRecord);
}

/// Default sink — one structured tracing line per record.
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn emit(&self, record: AuditRecord) {
        tracing::info!(
            kind = %record.kind,
            id = %record.id,
            status = %record.status,
            detail = %record.detail,
            "📋 audit"
        );
    }
}

/// In-memory ring buffer sink (max 1000 records) — used by tests and the
/// CLI history view.
pub struct MemorySink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of recorded entries, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for MemorySink {
    fn emit(&self, record: AuditRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
            // Ring buffer — keep last 1000
            if records.len() > 1000 {
                records.remove(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records() {
        let sink = MemorySink::new();
        sink.emit(AuditRecord::new("task", "t-1", "running", "attempt 1"));
        sink.emit(AuditRecord::new("task", "t-1", "completed", ""));

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, "running");
        assert_eq!(records[1].status, "completed");
    }

    #[test]
    fn test_ring_buffer_cap() {
        let sink = MemorySink::new();
        for i in 0..1100 {
            sink.emit(AuditRecord::new("task", &format!("t-{i}"), "pending", ""));
        }
        let records = sink.records();
        assert_eq!(records.len(), 1000);
        assert_eq!(records[0].id, "t-100");
    }
}
