//! Interactive confirmation handshake.
//!
//! States: `Idle` → `Awaiting(id)` → `Resolved` | `Expired`. The broker
//! lives in the background service; the watcher lives in each front-end.
//! Both sides ride on ordinary intercom requests and broadcasts.

pub mod broker;
pub mod watcher;

pub use broker::{ConfirmationBroker, ConfirmationOutcome, ConfirmationState, ConfirmationSummary};
pub use watcher::{ConfirmationWatcher, WatcherUpdate};
