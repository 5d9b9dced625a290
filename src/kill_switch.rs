//! System-wide kill switch
//!
//! The switch is a single marker object whose existence means "halt". It is
//! re-read from storage on every call; there is no in-process cache, so an
//! activation by any process is seen by every other process on its next
//! check. If the marker cannot be read at all the switch reports itself
//! active (fail closed).

use crate::storage::ObjectStore;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// Marker name used by the original file-based deployments.
pub const DEFAULT_MARKER_KEY: &str = ".system_kill_activated";

const UNREACHABLE_REASON: &str = "kill switch state unreadable";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillSwitchStatus {
    pub active: bool,
    pub reason: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct KillSwitch {
    store: Arc<dyn ObjectStore>,
    key: String,
}

impl KillSwitch {
    pub fn new(store: Arc<dyn ObjectStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn with_default_key(store: Arc<dyn ObjectStore>) -> Self {
        Self::new(store, DEFAULT_MARKER_KEY)
    }

    pub fn location(&self) -> String {
        self.store.locate(&self.key)
    }

    pub async fn is_active(&self) -> bool {
        match self.store.exists(&self.key).await {
            Ok(active) => active,
            Err(e) => {
                tracing::error!(error = %e, key = %self.key, "Kill switch unreadable, failing closed");
                true
            }
        }
    }

    /// Current state with the recorded reason and activation time.
    pub async fn status(&self) -> KillSwitchStatus {
        match self.store.get(&self.key).await {
            Ok(None) => KillSwitchStatus {
                active: false,
                reason: None,
                activated_at: None,
            },
            Ok(Some(bytes)) => {
                let (reason, activated_at) = parse_marker(&String::from_utf8_lossy(&bytes));
                KillSwitchStatus {
                    active: true,
                    reason,
                    activated_at,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, key = %self.key, "Kill switch unreadable, failing closed");
                KillSwitchStatus {
                    active: true,
                    reason: Some(format!("{}: {}", UNREACHABLE_REASON, e)),
                    activated_at: None,
                }
            }
        }
    }

    /// Gate for every capital-moving path.
    pub async fn check(&self) -> Result<()> {
        let status = self.status().await;
        if status.active {
            return Err(Error::kill_switch(
                status.reason.unwrap_or_else(|| "no reason recorded".to_string()),
            ));
        }
        Ok(())
    }

    /// Activate with `reason`. A second activation while already active
    /// keeps the original reason and timestamp.
    pub async fn activate(&self, reason: &str) -> Result<()> {
        let now = Utc::now();
        let marker = render_marker(reason, now);
        if self.store.put_new(&self.key, marker.as_bytes()).await? {
            tracing::error!(
                reason,
                activated_at = %now.to_rfc3339(),
                location = %self.location(),
                "KILL SWITCH ACTIVATED"
            );
        } else {
            tracing::debug!(reason, "Kill switch already active, activation ignored");
        }
        Ok(())
    }

    /// Clear the flag together with its reason and timestamp.
    pub async fn deactivate(&self) -> Result<()> {
        let previous = self.status().await;
        self.store.delete(&self.key).await?;
        tracing::warn!(
            previous_reason = ?previous.reason,
            location = %self.location(),
            "Kill switch deactivated"
        );
        Ok(())
    }
}

fn render_marker(reason: &str, at: DateTime<Utc>) -> String {
    // Newlines would break the line-oriented marker format.
    let reason = reason.replace(['\n', '\r'], " ");
    format!("ACTIVATED at {}\nREASON: {}\n", at.to_rfc3339(), reason)
}

fn parse_marker(raw: &str) -> (Option<String>, Option<DateTime<Utc>>) {
    let mut reason = None;
    let mut activated_at = None;
    for line in raw.lines() {
        if let Some(ts) = line.strip_prefix("ACTIVATED at ") {
            activated_at = DateTime::parse_from_rfc3339(ts.trim())
                .ok()
                .map(|t| t.with_timezone(&Utc));
        } else if let Some(r) = line.strip_prefix("REASON: ") {
            reason = Some(r.trim().to_string());
        }
    }
    // A bare marker (e.g. `touch`ed by an operator) still halts everything.
    if reason.is_none() && !raw.trim().is_empty() && activated_at.is_none() {
        reason = Some(raw.trim().to_string());
    }
    (reason, activated_at)
}
