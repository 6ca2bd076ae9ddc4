//! Races discovery against a hard deadline and caller cancellation.
//!
//! The discovery future, the deadline timer, and the cancellation token are
//! polled by one `tokio::select!`. Whichever settles first decides the
//! outcome; the others are dropped on the spot, so no timer or listener
//! outlives the attempt.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::config::OperationsConfig;
use crate::operation::poll::BlockScanner;
use crate::operation::push::FeedWatcher;
use crate::operation::{
    ConfirmStrategy, ConfirmationAttempt, FeedFilter, NetworkQueries, OperationFeed,
    OperationRecord,
};
use crate::{AppError, Result};

/// Tuning for an [`OperationConfirmer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmerOptions {
    /// Discovery strategies to run.
    pub strategy: ConfirmStrategy,
    /// Delay between poll passes.
    pub poll_interval: Duration,
    /// Overall bound measured from `initialized_at`.
    pub timeout: Duration,
}

impl From<&OperationsConfig> for ConfirmerOptions {
    fn from(config: &OperationsConfig) -> Self {
        Self {
            strategy: config.strategy,
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
        }
    }
}

/// Decides whether a submitted operation was included and applied.
pub struct OperationConfirmer {
    network: Arc<dyn NetworkQueries>,
    feed: Option<(Arc<dyn OperationFeed>, FeedFilter)>,
    options: ConfirmerOptions,
}

impl OperationConfirmer {
    /// Create a confirmer over `network`.
    #[must_use]
    pub fn new(network: Arc<dyn NetworkQueries>, options: ConfirmerOptions) -> Self {
        Self {
            network,
            feed: None,
            options,
        }
    }

    /// Attach a real-time feed for the `push` and `both` strategies.
    #[must_use]
    pub fn with_feed(mut self, feed: Arc<dyn OperationFeed>, filter: FeedFilter) -> Self {
        self.feed = Some((feed, filter));
        self
    }

    /// Configured options.
    #[must_use]
    pub fn options(&self) -> &ConfirmerOptions {
        &self.options
    }

    /// Confirm `hash`, starting a fresh attempt now.
    ///
    /// # Errors
    ///
    /// See [`confirm_attempt`](Self::confirm_attempt).
    pub async fn confirm(&self, hash: &str, cancel: CancellationToken) -> Result<OperationRecord> {
        self.confirm_attempt(ConfirmationAttempt::new(hash), cancel)
            .await
    }

    /// Confirm an existing attempt, keeping its `initialized_at`.
    ///
    /// # Errors
    ///
    /// - `AppError::OperationFailed` if the operation was not applied.
    /// - `AppError::OperationTimeout` when the deadline passes first.
    /// - `AppError::Cancelled` when `cancel` fires first.
    /// - `AppError::Config` if a push strategy has no feed attached.
    /// - `AppError::Network` from the queries.
    pub async fn confirm_attempt(
        &self,
        mut attempt: ConfirmationAttempt,
        cancel: CancellationToken,
    ) -> Result<OperationRecord> {
        let hash = attempt.operation_hash.clone();
        let deadline = attempt.initialized_at + self.options.timeout;
        let span = info_span!("confirm_operation", %hash, strategy = ?self.options.strategy);

        async {
            let outcome = tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    Err(AppError::Cancelled(format!("confirmation of {hash} aborted")))
                }
                () = tokio::time::sleep_until(deadline) => {
                    Err(AppError::OperationTimeout(format!(
                        "{hash} not confirmed within {}ms",
                        self.options.timeout.as_millis()
                    )))
                }
                outcome = self.discover(&mut attempt, &cancel) => outcome,
            };

            match &outcome {
                Ok(record) => info!(level = ?record.level, "operation applied"),
                Err(err) => info!(%err, "operation confirmation ended"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn discover(
        &self,
        attempt: &mut ConfirmationAttempt,
        cancel: &CancellationToken,
    ) -> Result<OperationRecord> {
        match self.options.strategy {
            ConfirmStrategy::Poll => self.scanner().run(attempt, cancel).await,
            ConfirmStrategy::Push => {
                let hash = attempt.operation_hash.clone();
                self.feed_watcher()?.run(&hash).await
            }
            ConfirmStrategy::Both => {
                let hash = attempt.operation_hash.clone();
                let watcher = self.feed_watcher()?;
                let scanner = self.scanner();
                tokio::select! {
                    outcome = scanner.run(attempt, cancel) => outcome,
                    outcome = watcher.run(&hash) => outcome,
                }
            }
        }
    }

    fn scanner(&self) -> BlockScanner {
        BlockScanner::new(
            Arc::clone(&self.network),
            self.options.poll_interval,
            self.options.timeout,
        )
    }

    fn feed_watcher(&self) -> Result<FeedWatcher> {
        let (feed, filter) = self.feed.as_ref().ok_or_else(|| {
            AppError::Config("push confirmation requires an operation feed".into())
        })?;
        Ok(FeedWatcher::new(Arc::clone(feed), filter.clone()))
    }
}
