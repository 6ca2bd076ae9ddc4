//! Push-subscribed confirmation over a real-time operation feed.
//!
//! The subscription is opened first; then a single point lookup catches an
//! operation indexed before the subscription took effect. Lookup errors are
//! logged and swallowed because the subscription stays authoritative.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::operation::{judge, FeedFilter, OperationFeed, OperationRecord};
use crate::Result;

/// Waits for the target operation on a real-time feed.
pub struct FeedWatcher {
    feed: Arc<dyn OperationFeed>,
    filter: FeedFilter,
}

impl FeedWatcher {
    /// Create a watcher over `feed`, narrowed by `filter`.
    #[must_use]
    pub fn new(feed: Arc<dyn OperationFeed>, filter: FeedFilter) -> Self {
        Self { feed, filter }
    }

    /// Wait for `hash` to appear on the feed.
    ///
    /// If the feed closes without a verdict this future never resolves;
    /// the caller's deadline or cancellation settles the race.
    ///
    /// # Errors
    ///
    /// - `AppError::OperationFailed` for a non-applied status.
    /// - `AppError::Network` if the subscription cannot be opened.
    pub async fn run(&self, hash: &str) -> Result<OperationRecord> {
        let mut batches = self.feed.subscribe(self.filter.clone()).await?;

        match self.feed.lookup(hash).await {
            Ok(records) => {
                if let Some(verdict) = judge(hash, &records) {
                    info!(hash, ok = verdict.is_ok(), "operation found by point lookup");
                    return verdict;
                }
            }
            Err(err) => warn!(hash, %err, "point lookup failed; relying on subscription"),
        }

        while let Some(batch) = batches.recv().await {
            debug!(hash, size = batch.len(), "feed batch");
            if let Some(verdict) = judge(hash, &batch) {
                info!(hash, ok = verdict.is_ok(), "operation found on feed");
                return verdict;
            }
        }

        warn!(hash, "operation feed closed without a verdict");
        std::future::pending().await
    }
}
