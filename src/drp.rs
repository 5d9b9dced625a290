//! Disaster-recovery snapshots
//!
//! Snapshots are write-once objects named `{prefix}/{session_id}_{ts}.json`.
//! Each one wraps the state in an envelope carrying a format version and a
//! BLAKE3 checksum of the state body, so a truncated or edited file is
//! rejected as a whole instead of being partially loaded.
//!
//! The same store also keeps the session's *current* state under
//! `sessions/{session_id}.json`, overwritten after every cycle.

use crate::state::SessionState;
use crate::storage::ObjectStore;
use crate::{Error, Result};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

pub const FORMAT_VERSION: u32 = 1;
pub const DEFAULT_PREFIX: &str = "drp_snapshots";
pub const SESSIONS_PREFIX: &str = "sessions";
pub const LAST_SNAPSHOT_KEY: &str = "last_snapshot.ts";
/// Rendering of "no snapshot yet" for operators and the health endpoint.
pub const NEVER: &str = "never";

const TS_FORMAT: &str = "%Y%m%dT%H%M%S%.6fZ";
const MAX_NAME_COLLISIONS: u32 = 64;

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope {
    format_version: u32,
    checksum: String,
    state: Value,
}

impl Envelope {
    fn seal(state: &SessionState) -> Result<Self> {
        let state = serde_json::to_value(state)?;
        Ok(Self {
            format_version: FORMAT_VERSION,
            checksum: checksum(&state)?,
            state,
        })
    }

    fn open(self) -> Result<SessionState> {
        if self.format_version != FORMAT_VERSION {
            return Err(Error::Validation(format!(
                "unsupported snapshot format_version {}",
                self.format_version
            )));
        }
        let actual = checksum(&self.state)?;
        if actual != self.checksum {
            return Err(Error::Validation(format!(
                "snapshot checksum mismatch (expected {}, got {})",
                self.checksum, actual
            )));
        }
        SessionState::from_value(self.state)
    }
}

fn checksum(state: &Value) -> Result<String> {
    let canonical = serde_json::to_vec(state)?;
    Ok(blake3::hash(&canonical).to_hex().to_string())
}

/// Decode a stored snapshot. Objects without an envelope are read as a bare
/// state, which is how snapshots were written before checksums existed.
fn decode(bytes: &[u8]) -> Result<SessionState> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| Error::Validation(format!("snapshot is not valid JSON: {}", e)))?;
    if value.get("format_version").is_some() {
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| Error::Validation(format!("malformed snapshot envelope: {}", e)))?;
        envelope.open()
    } else {
        SessionState::from_value(value)
    }
}

/// `(timestamp, collision index)` encoded in a snapshot key, if it is one.
fn parse_key(key: &str) -> Option<(String, DateTime<Utc>, u32)> {
    let name = key.rsplit('/').next()?.strip_suffix(".json")?;
    let (session, stamp) = name.rsplit_once('_')?;
    let (stamp, index) = match stamp.split_once('-') {
        Some((s, n)) => (s, n.parse().ok()?),
        None => (stamp, 0),
    };
    let ts = NaiveDateTime::parse_from_str(stamp, TS_FORMAT).ok()?.and_utc();
    Some((session.to_string(), ts, index))
}

pub struct SnapshotStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    ttl: Option<Duration>,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into().trim_matches('/').to_string(),
            ttl: None,
        }
    }

    /// Delete snapshots older than `ttl` on subsequent saves.
    pub fn with_ttl(mut self, ttl: Option<std::time::Duration>) -> Self {
        self.ttl = ttl.and_then(|t| Duration::from_std(t).ok());
        self
    }

    fn last_key(&self) -> String {
        format!("{}/{}", self.prefix, LAST_SNAPSHOT_KEY)
    }

    fn current_key(session_id: Uuid) -> String {
        format!("{}/{}.json", SESSIONS_PREFIX, session_id)
    }

    /// Write a new, never-overwritten snapshot and return its location.
    pub async fn save_snapshot(&self, state: &SessionState) -> Result<String> {
        let now = Utc::now();
        let stamp = now.format(TS_FORMAT).to_string();
        let body = serde_json::to_vec_pretty(&Envelope::seal(state)?)?;

        let mut written = None;
        for index in 0..MAX_NAME_COLLISIONS {
            let key = if index == 0 {
                format!("{}/{}_{}.json", self.prefix, state.session_id(), stamp)
            } else {
                format!("{}/{}_{}-{}.json", self.prefix, state.session_id(), stamp, index)
            };
            let created = self
                .store
                .put_new(&key, &body)
                .await
                .map_err(|e| Error::SnapshotWrite {
                    path: self.store.locate(&key),
                    reason: e.to_string(),
                })?;
            if created {
                written = Some(key);
                break;
            }
        }
        let key = written.ok_or_else(|| Error::SnapshotWrite {
            path: format!("{}/{}_{}", self.prefix, state.session_id(), stamp),
            reason: "too many snapshots with the same timestamp".into(),
        })?;
        let location = self.store.locate(&key);

        self.store
            .put(&self.last_key(), now.to_rfc3339().as_bytes())
            .await
            .map_err(|e| Error::SnapshotWrite {
                path: self.store.locate(&self.last_key()),
                reason: e.to_string(),
            })?;

        tracing::info!(
            session_id = %state.session_id(),
            cycle = state.cycle_counter(),
            path = %location,
            "DRP snapshot saved"
        );

        if let Some(ttl) = self.ttl {
            if let Err(e) = self.prune(now - ttl).await {
                tracing::warn!(error = %e, "DRP retention pass failed");
            }
        }
        Ok(location)
    }

    /// Load and validate the snapshot at `location` (a location returned by
    /// [`SnapshotStore::save_snapshot`] or a bare key).
    pub async fn load_snapshot(&self, location: &str) -> Result<SessionState> {
        let key = self
            .store
            .key_for(location)
            .unwrap_or_else(|| location.to_string());
        let bytes = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| Error::Storage(format!("snapshot not found: {}", location)))?;
        let state = decode(&bytes)?;
        tracing::info!(
            session_id = %state.session_id(),
            cycle = state.cycle_counter(),
            path = location,
            "DRP snapshot loaded"
        );
        Ok(state)
    }

    /// Time of the most recent save, `None` if nothing was ever saved.
    pub async fn get_last_snapshot_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(bytes) = self.store.get(&self.last_key()).await? else {
            return Ok(None);
        };
        let raw = String::from_utf8_lossy(&bytes);
        let raw = raw.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(Some(ts.with_timezone(&Utc)));
        }
        // Older markers hold the compact filename stamp.
        NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%SZ")
            .map(|t| Some(t.and_utc()))
            .map_err(|e| Error::Validation(format!("bad last snapshot marker {:?}: {}", raw, e)))
    }

    /// Location of the newest snapshot for `session_id`.
    pub async fn latest_for_session(&self, session_id: Uuid) -> Result<Option<String>> {
        let keys = self
            .store
            .list(&format!("{}/{}_", self.prefix, session_id))
            .await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| parse_key(&k).map(|(_, ts, n)| ((ts, n), k)))
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, k)| self.store.locate(&k)))
    }

    /// Overwrite the session's current persisted state.
    pub async fn persist_session(&self, state: &SessionState) -> Result<String> {
        let key = Self::current_key(state.session_id());
        let body = serde_json::to_vec_pretty(&Envelope::seal(state)?)?;
        self.store
            .put(&key, &body)
            .await
            .map_err(|e| Error::SnapshotWrite {
                path: self.store.locate(&key),
                reason: e.to_string(),
            })?;
        tracing::debug!(
            session_id = %state.session_id(),
            cycle = state.cycle_counter(),
            "Session state persisted"
        );
        Ok(self.store.locate(&key))
    }

    pub async fn load_current(&self, session_id: Uuid) -> Result<Option<SessionState>> {
        match self.store.get(&Self::current_key(session_id)).await? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0;
        for key in self.store.list(&format!("{}/", self.prefix)).await? {
            let Some((_, ts, _)) = parse_key(&key) else {
                continue;
            };
            if ts < cutoff {
                self.store.delete(&key).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, cutoff = %cutoff.to_rfc3339(), "Expired DRP snapshots deleted");
        }
        Ok(removed)
    }
}

/// Render an optional last-snapshot time, `"never"` when absent.
pub fn render_timestamp(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.to_rfc3339()).unwrap_or_else(|| NEVER.to_string())
}
