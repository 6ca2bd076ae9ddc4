//! Operation confirmation: deciding whether a submitted operation was
//! included on chain and applied.
//!
//! Two discovery strategies feed one [`OperationConfirmer`]:
//!
//! | Strategy | Source                                  | Module     |
//! |----------|-----------------------------------------|------------|
//! | `poll`   | head level + per-block operation lists  | [`poll`]   |
//! | `push`   | real-time operation feed + point lookup | [`push`]   |
//! | `both`   | both, first settlement wins             | [`engine`] |
//!
//! A non-`applied` status for the target hash is always a failure, even if
//! another record for the same hash reports `applied`.

pub mod engine;
pub mod poll;
pub mod push;
pub mod rpc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{AppError, Result};

pub use engine::{ConfirmerOptions, OperationConfirmer};

/// Status reported by the network for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Included and applied.
    Applied,
    /// Included but failed.
    Failed,
    /// Rolled back because a later operation in its group failed.
    Backtracked,
    /// Not executed because an earlier operation in its group failed.
    Skipped,
    /// Any status this crate does not know; never treated as success.
    #[serde(other)]
    Unknown,
}

impl OperationStatus {
    /// Parse a wire status string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "applied" => Self::Applied,
            "failed" => Self::Failed,
            "backtracked" => Self::Backtracked,
            "skipped" => Self::Skipped,
            _ => Self::Unknown,
        }
    }

    /// Whether this is the terminal success status.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// One operation as reported by the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Operation hash.
    pub hash: String,
    /// Combined status of the operation's contents.
    pub status: OperationStatus,
    /// Block level the operation was included at, when known.
    pub level: Option<u64>,
    /// Raw network data for the operation.
    #[serde(default)]
    pub data: Value,
}

/// State of one logical confirmation attempt.
///
/// `initialized_at` never changes across retries, so the overall bound is
/// measured from the first attempt.
#[derive(Debug, Clone)]
pub struct ConfirmationAttempt {
    /// Hash being confirmed.
    pub operation_hash: String,
    /// When the first attempt started.
    pub initialized_at: Instant,
    /// Next block level to scan; `None` means "start at head".
    pub from_block_level: Option<u64>,
}

impl ConfirmationAttempt {
    /// Start a new attempt now.
    #[must_use]
    pub fn new(operation_hash: impl Into<String>) -> Self {
        Self {
            operation_hash: operation_hash.into(),
            initialized_at: Instant::now(),
            from_block_level: None,
        }
    }

    /// Start scanning at `level` instead of the current head.
    #[must_use]
    pub fn from_level(mut self, level: u64) -> Self {
        self.from_block_level = Some(level);
        self
    }

    /// Time since the first attempt started.
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.initialized_at.elapsed()
    }
}

/// Which discovery strategies the confirmer runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmStrategy {
    /// Block-scanning poll only.
    #[default]
    Poll,
    /// Real-time feed only.
    Push,
    /// Both, raced.
    Both,
}

/// Optional narrowing of the real-time feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedFilter {
    /// Only operations sent by this account.
    pub sender: Option<String>,
    /// Only these operation kinds; empty means all.
    #[serde(default)]
    pub types: Vec<String>,
}

/// Chain queries used by the block-scanning poll.
pub trait NetworkQueries: Send + Sync {
    /// Current head block level.
    fn head_level(&self) -> BoxFuture<'_, Result<u64>>;

    /// Operations included in the block at `level`.
    fn block_operations(&self, level: u64) -> BoxFuture<'_, Result<Vec<OperationRecord>>>;
}

/// Real-time operation feed used by the push strategy.
pub trait OperationFeed: Send + Sync {
    /// Subscribe to batches of newly indexed operations.
    fn subscribe(
        &self,
        filter: FeedFilter,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<Vec<OperationRecord>>>>;

    /// Point query for operations with this hash that are already indexed.
    fn lookup<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, Result<Vec<OperationRecord>>>;
}

/// Decide what `records` say about `target`.
///
/// Returns `None` when `target` is absent. Any non-applied record for the
/// target wins over an applied one.
///
/// # Errors
///
/// The inner result is `AppError::OperationFailed` for a non-applied status.
pub fn judge(target: &str, records: &[OperationRecord]) -> Option<Result<OperationRecord>> {
    let mut matching = records.iter().filter(|record| record.hash == target);

    if let Some(failed) = matching.clone().find(|record| !record.status.is_applied()) {
        return Some(Err(AppError::OperationFailed(format!(
            "{target} reached the chain with status {:?}",
            failed.status
        ))));
    }

    matching.next().cloned().map(Ok)
}
