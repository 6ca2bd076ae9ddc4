//! Channel handles and the server-side live channel registry.
//!
//! A [`ChannelHandle`] is the server's view of one connected front-end: an
//! outbound message queue drained by the channel's writer task plus a
//! cancellation token that fires when the channel closes. Handles are cheap
//! to clone; every clone observes the same lifecycle.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::intercom::envelope::ServerMessage;
use crate::{AppError, Result};

/// Capacity of each channel's outbound queue.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Server-assigned channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl Display for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Channel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Registered, I/O tasks not yet running.
    Opened,
    /// Reader and writer tasks running.
    Active,
    /// Peer disconnected or the server closed the channel.
    Closed,
}

/// Server-side handle to one connected channel.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    outbound: mpsc::Sender<ServerMessage>,
    active: Arc<AtomicBool>,
    closed: CancellationToken,
}

impl ChannelHandle {
    /// Create a handle whose outbound messages are delivered to `outbound`.
    #[must_use]
    pub fn new(id: ChannelId, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id,
            outbound,
            active: Arc::new(AtomicBool::new(false)),
            closed: CancellationToken::new(),
        }
    }

    /// Channel identifier.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        if self.closed.is_cancelled() {
            ChannelState::Closed
        } else if self.active.load(Ordering::SeqCst) {
            ChannelState::Active
        } else {
            ChannelState::Opened
        }
    }

    /// Whether the channel can still receive messages.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Mark the I/O tasks as running.
    pub fn mark_active(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Token cancelled when the channel closes.
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Wait until the channel closes.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Queue a message, waiting for outbound capacity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Disconnected` if the channel has closed.
    pub async fn send(&self, message: ServerMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(AppError::Disconnected(format!("{} closed", self.id)));
        }
        self.outbound
            .send(message)
            .await
            .map_err(|_| AppError::Disconnected(format!("{} writer gone", self.id)))
    }

    /// Queue a message without waiting. Used for best-effort broadcasts.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Disconnected` if the channel is closed or its
    /// outbound queue is full.
    pub fn try_send(&self, message: ServerMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(AppError::Disconnected(format!("{} closed", self.id)));
        }
        self.outbound
            .try_send(message)
            .map_err(|err| AppError::Disconnected(format!("{}: {err}", self.id)))
    }
}

/// Set of live channels shared between the server and broadcasters.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: Mutex<HashMap<ChannelId, ChannelHandle>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a channel.
    pub async fn insert(&self, handle: ChannelHandle) {
        self.channels.lock().await.insert(handle.id(), handle);
    }

    /// Stop tracking a channel, returning its handle if it was present.
    pub async fn remove(&self, id: ChannelId) -> Option<ChannelHandle> {
        self.channels.lock().await.remove(&id)
    }

    /// Look up a tracked channel.
    pub async fn get(&self, id: ChannelId) -> Option<ChannelHandle> {
        self.channels.lock().await.get(&id).cloned()
    }

    /// Number of tracked channels.
    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    /// Whether no channel is tracked.
    pub async fn is_empty(&self) -> bool {
        self.channels.lock().await.is_empty()
    }

    /// Ids of every tracked channel, sorted.
    pub async fn ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.channels.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Best-effort send of `data` to every tracked channel.
    ///
    /// Channels that are closing or whose queue is full are skipped, not
    /// retried. Returns the number of channels the message was queued on.
    pub async fn broadcast(&self, data: Value) -> usize {
        let targets: Vec<ChannelHandle> = self.channels.lock().await.values().cloned().collect();
        let mut delivered = 0;
        for handle in targets {
            let message = ServerMessage::Subscription { data: data.clone() };
            match handle.try_send(message) {
                Ok(()) => delivered += 1,
                Err(err) => debug!(channel = %handle.id(), %err, "broadcast skipped"),
            }
        }
        delivered
    }

    /// Close and forget every channel.
    pub async fn close_all(&self) {
        let drained: Vec<ChannelHandle> = self.channels.lock().await.drain().map(|(_, h)| h).collect();
        for handle in drained {
            handle.close();
        }
    }
}
