//! Out-of-band approval queue
//!
//! One slot per strategy, held as a file in the approval directory:
//!
//! ```text
//! (none) --propose--> {strategy}.pending --approve (rename)--> {strategy}.approved --consume--> (none)
//!                            \--withdraw (TTL)--> (none)
//! ```
//!
//! Approval is a single `rename`, so it either wins before the withdrawal or
//! fails because the pending artifact is gone. A late approval therefore has
//! no effect. Operators can approve with the CLI or by renaming the file.

use super::MutationProposal;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

const PENDING_SUFFIX: &str = "pending";
const APPROVED_SUFFIX: &str = "approved";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    None,
    Pending,
    Approved,
}

/// Contents of a `.pending` / `.approved` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub proposal: MutationProposal,
    pub diff: Vec<String>,
    pub pre_snapshot: String,
    pub proposed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ApprovalQueue {
    dir: PathBuf,
}

impl ApprovalQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn artifact(&self, strategy: &str, suffix: &str) -> Result<PathBuf> {
        if strategy.is_empty()
            || !strategy
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        {
            return Err(Error::Validation(format!(
                "strategy name {:?} cannot name an approval artifact",
                strategy
            )));
        }
        Ok(self.dir.join(format!("{}.{}", strategy, suffix)))
    }

    pub fn pending_path(&self, strategy: &str) -> Result<PathBuf> {
        self.artifact(strategy, PENDING_SUFFIX)
    }

    pub fn approved_path(&self, strategy: &str) -> Result<PathBuf> {
        self.artifact(strategy, APPROVED_SUFFIX)
    }

    /// Open a new request, discarding any stale approval for the strategy.
    pub async fn propose(&self, request: &ApprovalRequest) -> Result<PathBuf> {
        let strategy = &request.proposal.strategy;
        let pending = self.pending_path(strategy)?;
        remove_if_present(&self.approved_path(strategy)?).await?;

        fs::create_dir_all(&self.dir).await?;
        fs::write(&pending, serde_json::to_vec_pretty(request)?).await?;
        tracing::warn!(
            strategy = %strategy,
            path = %pending.display(),
            "Mutation awaiting manual approval"
        );
        Ok(pending)
    }

    /// Promote the pending request. Fails if there is nothing pending,
    /// including when it was already withdrawn.
    pub async fn approve(&self, strategy: &str) -> Result<()> {
        let pending = self.pending_path(strategy)?;
        let approved = self.approved_path(strategy)?;
        match fs::rename(&pending, &approved).await {
            Ok(()) => {
                tracing::warn!(strategy, "Mutation approved");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::Validation(format!(
                "no pending mutation for {}",
                strategy
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn status(&self, strategy: &str) -> Result<ApprovalStatus> {
        if fs::try_exists(self.approved_path(strategy)?).await? {
            Ok(ApprovalStatus::Approved)
        } else if fs::try_exists(self.pending_path(strategy)?).await? {
            Ok(ApprovalStatus::Pending)
        } else {
            Ok(ApprovalStatus::None)
        }
    }

    /// The pending request, if any.
    pub async fn pending(&self, strategy: &str) -> Result<Option<ApprovalRequest>> {
        match fs::read(self.pending_path(strategy)?).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::Validation(format!("bad approval artifact: {}", e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the approval once applied. `true` if there was one.
    pub async fn consume(&self, strategy: &str) -> Result<bool> {
        remove_if_present(&self.approved_path(strategy)?).await
    }

    /// Withdraw the pending request. `false` means an approval got there
    /// first (or nothing was pending).
    pub async fn withdraw(&self, strategy: &str) -> Result<bool> {
        remove_if_present(&self.pending_path(strategy)?).await
    }
}

async fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
