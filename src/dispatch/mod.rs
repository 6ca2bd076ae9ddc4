//! Typed requests and responses serviced by the [`Dispatcher`].
//!
//! Request payloads are tagged by `type`:
//!
//! | `type`             | Gated | Response                |
//! |--------------------|-------|-------------------------|
//! | `ping`             | no    | `pong`                  |
//! | `get_state`        | no    | `state`                 |
//! | `get_confirmation` | no    | `confirmation`          |
//! | `confirmation`     | no    | `confirmation_resolved` |
//! | `dapp_disconnect`  | no    | `dapp_disconnected`     |
//! | `await_operation`  | no    | `operation_applied`     |
//! | `operations`       | yes   | `operations_sent`       |
//! | `sign`             | yes   | `signed`                |
//! | `dapp_permission`  | yes   | `permission_granted`    |
//!
//! Gated requests pass through the confirmation gate and open an
//! interactive confirmation before they run.

pub mod handler;
pub mod signer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::confirmation::{ConfirmationState, ConfirmationSummary};
use crate::operation::OperationRecord;

pub use handler::Dispatcher;
pub use signer::{DecisionSigner, NoKeystore};

/// Request payload sent by a front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntercomRequest {
    /// Liveness probe.
    Ping,
    /// Service state summary.
    GetState,
    /// Details of a pending confirmation.
    GetConfirmation {
        /// Confirmation id from the `confirmation_requested` broadcast.
        id: String,
    },
    /// Confirm or deny a pending confirmation.
    Confirmation {
        /// Confirmation id.
        id: String,
        /// `true` to approve.
        confirm: bool,
        /// Password handed to the key store on approval.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Submit operations on behalf of `source`.
    Operations {
        /// Sending account.
        source: String,
        /// Target network name.
        network: String,
        /// Operation contents, passed through to the key store untouched.
        operations: Vec<Value>,
    },
    /// Sign raw bytes with `source`'s key.
    Sign {
        /// Signing account.
        source: String,
        /// Hex-encoded bytes.
        bytes: String,
    },
    /// A third-party page asks for permission to use the wallet.
    DappPermission {
        /// Requesting page origin.
        origin: String,
        /// Display name of the application.
        name: String,
        /// Network the application wants to use.
        network: String,
    },
    /// Revoke a previously granted permission.
    DappDisconnect {
        /// Page origin whose permission is revoked.
        origin: String,
    },
    /// Wait until a submitted operation is applied.
    AwaitOperation {
        /// Operation hash.
        hash: String,
        /// First block level to scan; defaults to the current head.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_block_level: Option<u64>,
    },
}

impl IntercomRequest {
    /// Wire name of the request kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::GetState => "get_state",
            Self::GetConfirmation { .. } => "get_confirmation",
            Self::Confirmation { .. } => "confirmation",
            Self::Operations { .. } => "operations",
            Self::Sign { .. } => "sign",
            Self::DappPermission { .. } => "dapp_permission",
            Self::DappDisconnect { .. } => "dapp_disconnect",
            Self::AwaitOperation { .. } => "await_operation",
        }
    }

    /// Whether the request must pass the gate and a human confirmation.
    #[must_use]
    pub fn requires_confirmation(&self) -> bool {
        matches!(
            self,
            Self::Operations { .. } | Self::Sign { .. } | Self::DappPermission { .. }
        )
    }
}

/// A permission granted to a third-party page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DappPermission {
    /// Page origin.
    pub origin: String,
    /// Display name of the application.
    pub name: String,
    /// Network the permission applies to.
    pub network: String,
    /// When the user approved it.
    pub granted_at: DateTime<Utc>,
}

/// Service state summary returned by `get_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Live channel count.
    pub channels: usize,
    /// Gated requests waiting behind the running one.
    pub queued: usize,
    /// Interactive confirmation state.
    pub confirmation: Value,
    /// Granted dApp permissions, sorted by origin.
    pub permissions: Vec<DappPermission>,
}

impl StateSnapshot {
    pub(crate) fn confirmation_value(state: &ConfirmationState) -> Value {
        serde_json::to_value(state).unwrap_or(Value::Null)
    }
}

/// Response data returned to a front-end.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntercomResponse {
    /// Answer to `ping`.
    Pong,
    /// Answer to `get_state`.
    State(StateSnapshot),
    /// Answer to `get_confirmation`.
    Confirmation(ConfirmationSummary),
    /// Answer to `confirmation`.
    ConfirmationResolved {
        /// Resolved confirmation id.
        id: String,
    },
    /// Operations were approved and submitted.
    OperationsSent {
        /// Hash of the injected operation group.
        hash: String,
    },
    /// Bytes were approved and signed.
    Signed {
        /// Signature produced by the key store.
        signature: String,
    },
    /// Permission approved and recorded.
    PermissionGranted(DappPermission),
    /// Permission revoked.
    DappDisconnected {
        /// Origin whose permission was revoked.
        origin: String,
    },
    /// Operation confirmed applied.
    OperationApplied(OperationRecord),
}
