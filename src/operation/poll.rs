//! Block-scanning poll.
//!
//! Each pass reads the head level and scans every block from
//! `from_block_level` (or the head, on the first pass) through the head,
//! inclusive. After a pass `from_block_level` moves to one past the last
//! scanned level, so no block is fetched twice within an attempt. A failed
//! query is retried on the next pass rather than ending the attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::operation::{judge, ConfirmationAttempt, NetworkQueries, OperationRecord};
use crate::{AppError, Result};

/// Polls the chain until the target operation shows up.
pub struct BlockScanner {
    network: Arc<dyn NetworkQueries>,
    interval: Duration,
    timeout: Duration,
}

impl BlockScanner {
    /// Create a scanner sleeping `interval` between passes, bounded by `timeout`.
    #[must_use]
    pub fn new(network: Arc<dyn NetworkQueries>, interval: Duration, timeout: Duration) -> Self {
        Self {
            network,
            interval,
            timeout,
        }
    }

    /// Scan until found, failed, timed out, or cancelled.
    ///
    /// `attempt` is updated in place so a caller may resume it later with
    /// the same `initialized_at`.
    ///
    /// # Errors
    ///
    /// - `AppError::OperationFailed` for a non-applied status.
    /// - `AppError::OperationTimeout` once the bound is exceeded.
    /// - `AppError::Cancelled` when `cancel` fires.
    ///
    /// Failed network queries are logged and retried on the next pass; the
    /// bound still applies.
    pub async fn run(
        &self,
        attempt: &mut ConfirmationAttempt,
        cancel: &CancellationToken,
    ) -> Result<OperationRecord> {
        let hash = attempt.operation_hash.clone();
        let mut pass: u32 = 0;

        loop {
            pass += 1;
            match self.network.head_level().await {
                Ok(head) => {
                    if let Some(verdict) = self.scan(&hash, attempt, head, pass).await {
                        return verdict;
                    }
                }
                Err(err) => warn!(%hash, pass, %err, "head query failed; retrying next pass"),
            }

            let elapsed = attempt.elapsed();
            if elapsed >= self.timeout {
                return Err(AppError::OperationTimeout(format!(
                    "{hash} not found after {}ms",
                    elapsed.as_millis()
                )));
            }
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled(format!("confirmation of {hash} aborted")));
            }

            let nap = self.interval.min(self.timeout - elapsed);
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(AppError::Cancelled(format!("confirmation of {hash} aborted")));
                }
                () = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Scan `from_block_level` (or `head`) through `head`.
    ///
    /// Returns a verdict once the operation is found. A failing block query
    /// ends the pass early and leaves `from_block_level` on that block so the
    /// next pass retries it.
    async fn scan(
        &self,
        hash: &str,
        attempt: &mut ConfirmationAttempt,
        head: u64,
        pass: u32,
    ) -> Option<Result<OperationRecord>> {
        let from = attempt.from_block_level.unwrap_or(head);
        debug!(%hash, pass, from, head, "poll pass");

        for level in from..=head {
            let records = match self.network.block_operations(level).await {
                Ok(records) => records,
                Err(err) => {
                    warn!(%hash, level, %err, "block query failed; retrying next pass");
                    attempt.from_block_level = Some(level);
                    return None;
                }
            };
            if let Some(verdict) = judge(hash, &records) {
                info!(%hash, level, pass, ok = verdict.is_ok(), "operation found");
                return Some(verdict.map(|mut record| {
                    record.level.get_or_insert(level);
                    record
                }));
            }
        }
        if from <= head {
            attempt.from_block_level = Some(head + 1);
        }
        None
    }
}
