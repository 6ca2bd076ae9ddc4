//! Front-end side of the interactive confirmation handshake.
//!
//! A front-end only reacts to `confirmation_requested` when it knows it
//! just triggered a gated request. Expiry is scoped by id: an expired
//! broadcast clears the local waiting state only when the ids match, so the
//! expiry of a superseded confirmation never clears the newer one. Once its
//! own confirmation expired the triggering request has failed, so later
//! prompts belong to some other front-end.

use serde_json::Value;
use tracing::debug;

use crate::intercom::BroadcastEvent;

/// What the front-end should do after observing a broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherUpdate {
    /// Show the approval prompt for this id.
    Prompt(String),
    /// Clear the "waiting for approval" UI for this id.
    Cleared(String),
    /// Nothing to do.
    Ignored,
}

/// Local view of the confirmation this front-end is waiting on.
#[derive(Debug, Default, Clone)]
pub struct ConfirmationWatcher {
    expecting: bool,
    pending_id: Option<String>,
}

impl ConfirmationWatcher {
    /// Create an idle watcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that this front-end just sent a request that may need approval.
    pub fn expect_confirmation(&mut self) {
        self.expecting = true;
    }

    /// The id currently shown to the user, if any.
    #[must_use]
    pub fn pending_id(&self) -> Option<&str> {
        self.pending_id.as_deref()
    }

    /// Whether the front-end is waiting for (or showing) a confirmation.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.expecting || self.pending_id.is_some()
    }

    /// Stop waiting once the triggering request settled.
    pub fn finish(&mut self) {
        self.expecting = false;
        self.pending_id = None;
    }

    /// Apply a typed broadcast event.
    pub fn observe(&mut self, event: &BroadcastEvent) -> WatcherUpdate {
        match event {
            BroadcastEvent::ConfirmationRequested { id } => {
                if !self.is_waiting() {
                    return WatcherUpdate::Ignored;
                }
                // A newer id replaces a superseded one.
                self.pending_id = Some(id.clone());
                WatcherUpdate::Prompt(id.clone())
            }
            BroadcastEvent::ConfirmationExpired { id } => {
                if self.pending_id.as_deref() == Some(id.as_str()) {
                    self.finish();
                    WatcherUpdate::Cleared(id.clone())
                } else {
                    debug!(id, "expiry for a confirmation this front-end is not showing");
                    WatcherUpdate::Ignored
                }
            }
            BroadcastEvent::StateUpdated => WatcherUpdate::Ignored,
        }
    }

    /// Apply a raw subscription payload; unknown payloads are ignored.
    pub fn observe_value(&mut self, data: &Value) -> WatcherUpdate {
        match BroadcastEvent::from_value(data) {
            Ok(event) => self.observe(&event),
            Err(err) => {
                debug!(%err, "ignoring unrecognised broadcast");
                WatcherUpdate::Ignored
            }
        }
    }
}
