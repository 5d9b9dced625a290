//! Audit trail
//!
//! Appends one JSON object per line to `audit.jsonl` for every mutation,
//! kill-switch toggle, snapshot restore and commit rollback. Writing never
//! fails the caller: a broken audit file is logged and the operation goes on.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const AUDIT_FILE: &str = "audit.jsonl";

/// Entry in the audit log
#[derive(Debug, Serialize)]
struct AuditEntry<'a> {
    timestamp: DateTime<Utc>,
    entry_type: &'a str,
    session_id: Option<String>,
    cycle: Option<u64>,
    details: &'a Value,
}

/// Writer for audit log entries
struct AuditLogWriter {
    path: PathBuf,
}

impl AuditLogWriter {
    fn write(&self, entry: &AuditEntry<'_>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let json = serde_json::to_string(entry)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }
}

/// Cloning shares the writer.
#[derive(Clone)]
pub struct AuditLog {
    writer: Arc<Mutex<AuditLogWriter>>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(AuditLogWriter { path: path.into() })),
        }
    }

    /// `audit.jsonl` inside `session_dir`.
    pub fn in_dir(session_dir: &Path) -> Self {
        Self::new(session_dir.join(AUDIT_FILE))
    }

    pub async fn path(&self) -> PathBuf {
        self.writer.lock().await.path.clone()
    }

    pub async fn record(&self, entry_type: &str, details: Value) {
        self.write(entry_type, None, None, &details).await;
    }

    /// Record an event correlated with a session and cycle.
    pub async fn record_for(
        &self,
        entry_type: &str,
        session_id: uuid::Uuid,
        cycle: u64,
        details: Value,
    ) {
        self.write(entry_type, Some(session_id.to_string()), Some(cycle), &details)
            .await;
    }

    async fn write(
        &self,
        entry_type: &str,
        session_id: Option<String>,
        cycle: Option<u64>,
        details: &Value,
    ) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            entry_type,
            session_id,
            cycle,
            details,
        };
        let writer = self.writer.lock().await;
        if let Err(e) = writer.write(&entry) {
            tracing::warn!(error = %e, entry_type, "Failed to write audit log entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn appends_one_line_per_event() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::in_dir(&dir.path().join("session"));
        let sid = uuid::Uuid::new_v4();

        audit.record("kill_switch_activated", json!({"reason": "manual"})).await;
        audit
            .record_for("mutation", sid, 4, json!({"diff": ["- a", "+ b"]}))
            .await;

        let content = std::fs::read_to_string(audit.path().await).unwrap();
        let lines: Vec<Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["entry_type"], "kill_switch_activated");
        assert!(lines[0]["session_id"].is_null());
        assert_eq!(lines[1]["session_id"], sid.to_string());
        assert_eq!(lines[1]["cycle"], 4);
        assert_eq!(lines[1]["details"]["diff"][1], "+ b");
    }

    #[tokio::test]
    async fn unwritable_path_does_not_fail_caller() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be.
        let audit = AuditLog::new(dir.path());
        audit.record("noop", json!({})).await;
    }
}
