//! Server side of the interactive confirmation handshake.
//!
//! At most one confirmation is outstanding. Opening a new one supersedes
//! the previous one, which expires with a broadcast. A pending confirmation
//! also expires when its window elapses or when the channel that triggered
//! it closes. Expiry is always broadcast, never silent.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::intercom::{BroadcastEvent, ChannelRegistry};
use crate::{AppError, Result};

/// Decision delivered to the gated request that asked for confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// The user approved, optionally supplying a password for the key store.
    Confirmed {
        /// Password entered alongside the approval.
        password: Option<String>,
    },
    /// The user declined.
    Denied,
    /// Superseded, timed out, abandoned, or the service shut down.
    Expired,
}

/// Observable handshake state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConfirmationState {
    /// Nothing has been requested yet.
    Idle,
    /// Waiting for a decision on `id`.
    Awaiting {
        /// Pending confirmation id.
        id: String,
    },
    /// The last confirmation received a decision.
    Resolved {
        /// Id of the resolved confirmation.
        id: String,
    },
    /// The last confirmation expired.
    Expired {
        /// Id of the expired confirmation.
        id: String,
    },
}

/// Summary of what a pending confirmation is asking for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfirmationSummary {
    /// Opaque confirmation id.
    pub id: String,
    /// Request payload awaiting approval.
    pub payload: Value,
    /// When the confirmation was opened.
    pub requested_at: DateTime<Utc>,
}

struct PendingConfirmation {
    summary: ConfirmationSummary,
    reply: oneshot::Sender<ConfirmationOutcome>,
}

#[derive(Default)]
struct BrokerSlot {
    pending: Option<PendingConfirmation>,
    last: Option<ConfirmationState>,
}

/// Allocates, resolves, and expires interactive confirmations.
pub struct ConfirmationBroker {
    registry: Arc<ChannelRegistry>,
    timeout: Duration,
    slot: Mutex<BrokerSlot>,
}

impl ConfirmationBroker {
    /// Create a broker broadcasting through `registry`.
    #[must_use]
    pub fn new(registry: Arc<ChannelRegistry>, timeout: Duration) -> Self {
        Self {
            registry,
            timeout,
            slot: Mutex::new(BrokerSlot::default()),
        }
    }

    /// Open a confirmation for `payload` and wait for its outcome.
    ///
    /// `origin_closed` is the triggering channel's close token; if it fires
    /// first the confirmation expires.
    pub async fn request_confirmation(
        &self,
        payload: Value,
        origin_closed: CancellationToken,
    ) -> ConfirmationOutcome {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let summary = ConfirmationSummary {
            id: id.clone(),
            payload,
            requested_at: Utc::now(),
        };

        let superseded = {
            let mut slot = self.slot.lock().await;
            slot.last = Some(ConfirmationState::Awaiting { id: id.clone() });
            slot.pending
                .replace(PendingConfirmation { summary, reply: tx })
        };
        if let Some(old) = superseded {
            info!(old_id = %old.summary.id, new_id = %id, "confirmation superseded");
            let _ = old.reply.send(ConfirmationOutcome::Expired);
            self.announce(&BroadcastEvent::ConfirmationExpired {
                id: old.summary.id,
            })
            .await;
        }

        self.announce(&BroadcastEvent::ConfirmationRequested { id: id.clone() })
            .await;

        let span = info_span!("confirmation", id = %id);
        async {
            let mut rx = rx;
            let expired = tokio::select! {
                received = &mut rx => return delivered(received),
                () = tokio::time::sleep(self.timeout) => {
                    info!(timeout_ms = self.timeout.as_millis(), "confirmation timed out");
                    self.expire(&id).await
                }
                () = origin_closed.cancelled() => {
                    info!("originating channel closed; expiring confirmation");
                    self.expire(&id).await
                }
            };
            if expired {
                ConfirmationOutcome::Expired
            } else {
                // A decision took the slot first; it is on its way.
                delivered(rx.await)
            }
        }
        .instrument(span)
        .await
    }

    /// Deliver a decision for `id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `id` is not the pending confirmation.
    pub async fn resolve(&self, id: &str, confirm: bool, password: Option<String>) -> Result<()> {
        let pending = {
            let mut slot = self.slot.lock().await;
            match slot.pending.take() {
                Some(pending) if pending.summary.id == id => {
                    slot.last = Some(ConfirmationState::Resolved { id: id.to_owned() });
                    pending
                }
                other => {
                    slot.pending = other;
                    return Err(AppError::NotFound(format!(
                        "confirmation {id} is not pending"
                    )));
                }
            }
        };

        let outcome = if confirm {
            ConfirmationOutcome::Confirmed { password }
        } else {
            ConfirmationOutcome::Denied
        };
        if pending.reply.send(outcome).is_err() {
            warn!(id, "confirmation resolved after its requester stopped waiting");
        }
        info!(id, confirm, "confirmation resolved");
        Ok(())
    }

    /// Summary of the pending confirmation with this id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if `id` is not pending.
    pub async fn summary(&self, id: &str) -> Result<ConfirmationSummary> {
        let slot = self.slot.lock().await;
        slot.pending
            .as_ref()
            .filter(|pending| pending.summary.id == id)
            .map(|pending| pending.summary.clone())
            .ok_or_else(|| AppError::NotFound(format!("confirmation {id} is not pending")))
    }

    /// Id of the pending confirmation, if any.
    pub async fn pending_id(&self) -> Option<String> {
        let slot = self.slot.lock().await;
        slot.pending.as_ref().map(|pending| pending.summary.id.clone())
    }

    /// Current handshake state.
    pub async fn state(&self) -> ConfirmationState {
        let slot = self.slot.lock().await;
        slot.last.clone().unwrap_or(ConfirmationState::Idle)
    }

    /// Expire whatever is pending. Used at shutdown.
    pub async fn expire_pending(&self) {
        let id = self.pending_id().await;
        if let Some(id) = id {
            self.expire(&id).await;
        }
    }

    /// Expire `id` if it is still the pending confirmation, then broadcast.
    ///
    /// Returns `false` when `id` was no longer pending.
    async fn expire(&self, id: &str) -> bool {
        let expired = {
            let mut slot = self.slot.lock().await;
            match slot.pending.take() {
                Some(pending) if pending.summary.id == id => {
                    slot.last = Some(ConfirmationState::Expired { id: id.to_owned() });
                    Some(pending)
                }
                other => {
                    slot.pending = other;
                    None
                }
            }
        };

        let Some(pending) = expired else {
            return false;
        };
        let _ = pending.reply.send(ConfirmationOutcome::Expired);
        self.announce(&BroadcastEvent::ConfirmationExpired { id: id.to_owned() })
            .await;
        true
    }

    async fn announce(&self, event: &BroadcastEvent) {
        match event.to_value() {
            Ok(data) => {
                let delivered = self.registry.broadcast(data).await;
                info!(?event, delivered, "confirmation broadcast");
            }
            Err(err) => warn!(%err, "failed to encode confirmation broadcast"),
        }
    }
}

/// Outcome carried by the reply slot; a dropped sender means the slot was
/// replaced or the broker was torn down.
fn delivered(
    received: std::result::Result<ConfirmationOutcome, oneshot::error::RecvError>,
) -> ConfirmationOutcome {
    received.unwrap_or(ConfirmationOutcome::Expired)
}
