//! Serialized confirmation gate.
//!
//! Interactive or side-effecting requests are queued here and run strictly
//! one at a time, in arrival order, across all channels. A single worker
//! task drains the queue. Right before running an item the worker checks
//! whether the item's originating channel is still connected; if it is not,
//! the item is skipped and its caller gets [`AppError::Disconnected`]. Work
//! that has already started is never interrupted.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};

use crate::intercom::{ChannelHandle, ChannelId};
use crate::{AppError, Result};

/// Runs a queued item. The flag says whether its channel is still live.
type GateJob = Box<dyn FnOnce(bool) -> BoxFuture<'static, ()> + Send>;

struct GateItem {
    origin: ChannelHandle,
    job: GateJob,
}

/// Single-concurrency FIFO gate.
pub struct ConfirmationGate {
    queue_tx: mpsc::UnboundedSender<GateItem>,
    queued: Arc<AtomicUsize>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ConfirmationGate {
    /// Start the gate worker. It stops when `cancel` fires.
    #[must_use]
    pub fn start(cancel: CancellationToken) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(
            drain(queue_rx, Arc::clone(&queued), cancel.clone())
                .instrument(info_span!("confirmation_gate")),
        );

        Self {
            queue_tx,
            queued,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue `factory` behind all earlier items and wait for its outcome.
    ///
    /// `factory` is only invoked if `origin` is still connected when the
    /// item reaches the front of the queue.
    ///
    /// # Errors
    ///
    /// - `AppError::Disconnected` if `origin` closed before its turn.
    /// - `AppError::Ipc` if the gate was shut down.
    /// - Whatever the factory's future returns, including
    ///   `AppError::Dispatch` if it panicked.
    pub async fn enqueue<F, Fut, T>(&self, origin: &ChannelHandle, factory: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.admit(origin, factory)?.await
    }

    /// Place `factory` in the queue now and return a future for its outcome.
    ///
    /// The item takes its queue position during this call, before anything
    /// is awaited, so callers admitting items one after another get exactly
    /// that order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` if the gate was shut down. The returned future
    /// fails like [`ConfirmationGate::enqueue`].
    pub fn admit<F, Fut, T>(
        &self,
        origin: &ChannelHandle,
        factory: F,
    ) -> Result<impl Future<Output = Result<T>> + Send + 'static>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T>>();
        let channel = origin.id();

        let job: GateJob = Box::new(move |live| {
            if !live {
                let _ = tx.send(Err(disconnected(channel)));
                return Box::pin(future::ready(()));
            }
            Box::pin(async move {
                let outcome = match tokio::spawn(factory()).await {
                    Ok(outcome) => outcome,
                    Err(join_err) => {
                        error!(%channel, %join_err, "gated work aborted");
                        Err(AppError::Dispatch("gated request aborted".into()))
                    }
                };
                let _ = tx.send(outcome);
            })
        });

        self.queued.fetch_add(1, Ordering::SeqCst);
        if self
            .queue_tx
            .send(GateItem {
                origin: origin.clone(),
                job,
            })
            .is_err()
        {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(AppError::Ipc("confirmation gate stopped".into()));
        }

        Ok(async move {
            rx.await
                .map_err(|_| AppError::Ipc("confirmation gate stopped".into()))?
        })
    }

    /// Number of items waiting for their turn (excluding the running one).
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Stop the worker; items still queued are abandoned.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

fn disconnected(channel: ChannelId) -> AppError {
    AppError::Disconnected(format!("{channel} closed before its queued request ran"))
}

async fn drain(
    mut queue_rx: mpsc::UnboundedReceiver<GateItem>,
    queued: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            item = queue_rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };
        queued.fetch_sub(1, Ordering::SeqCst);

        let live = item.origin.is_connected();
        if live {
            debug!(channel = %item.origin.id(), "gate: running item");
        } else {
            info!(channel = %item.origin.id(), "gate: skipping item from closed channel");
        }
        (item.job)(live).await;
    }
    debug!("gate worker exiting");
}
