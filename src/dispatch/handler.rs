//! Request dispatcher: the server's single [`RequestHandler`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::{self, BoxFuture};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::confirmation::{ConfirmationBroker, ConfirmationOutcome};
use crate::dispatch::{
    DappPermission, DecisionSigner, IntercomRequest, IntercomResponse, StateSnapshot,
};
use crate::gate::ConfirmationGate;
use crate::intercom::{BroadcastEvent, ChannelHandle, ChannelRegistry, RequestHandler};
use crate::operation::{ConfirmationAttempt, OperationConfirmer};
use crate::{AppError, Result};

/// Granted permissions keyed by page origin.
pub type PermissionStore = Arc<Mutex<HashMap<String, DappPermission>>>;

/// Executes typed requests, bridging gated ones through a confirmation.
pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    gate: Arc<ConfirmationGate>,
    broker: Arc<ConfirmationBroker>,
    signer: Arc<dyn DecisionSigner>,
    confirmer: Arc<OperationConfirmer>,
    permissions: PermissionStore,
}

impl Dispatcher {
    /// Wire a dispatcher from its collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<ChannelRegistry>,
        gate: Arc<ConfirmationGate>,
        broker: Arc<ConfirmationBroker>,
        signer: Arc<dyn DecisionSigner>,
        confirmer: Arc<OperationConfirmer>,
    ) -> Self {
        Self {
            registry,
            gate,
            broker,
            signer,
            confirmer,
            permissions: PermissionStore::default(),
        }
    }

    /// Decode one request payload from `origin` and return its execution.
    ///
    /// Gated requests take their place in the confirmation gate during this
    /// call, so requests dispatched one after another reach the gate in that
    /// order no matter how the returned futures are scheduled.
    ///
    /// # Errors
    ///
    /// The returned future fails with:
    /// - `AppError::Protocol` if `payload` is not a known request.
    /// - `AppError::Disconnected` if `origin` closed while the request was queued.
    /// - `AppError::Rejected` / `AppError::Expired` for denied or expired confirmations.
    /// - Errors from the signer, broker, or operation confirmer.
    pub fn dispatch(
        self: Arc<Self>,
        origin: ChannelHandle,
        payload: Value,
    ) -> BoxFuture<'static, Result<Value>> {
        let request: IntercomRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(err) => {
                return Box::pin(future::ready(Err::<Value, _>(AppError::Protocol(format!(
                    "invalid request: {err}"
                )))))
            }
        };
        let kind = request.kind();
        let span = info_span!("dispatch", channel = %origin.id(), kind);

        if request.requires_confirmation() {
            let this = Arc::clone(&self);
            let gated_origin = origin.clone();
            let admitted = span.in_scope(|| {
                self.gate.admit(&origin, move || async move {
                    this.run_gated(gated_origin, request).await
                })
            });
            return Box::pin(
                async move {
                    let response = admitted?.await?;
                    Ok::<_, AppError>(serde_json::to_value(response)?)
                }
                .instrument(span),
            );
        }

        Box::pin(
            async move {
                let response = self.run_direct(&origin, request).await?;
                Ok::<_, AppError>(serde_json::to_value(response)?)
            }
            .instrument(span),
        )
    }

    async fn run_direct(
        &self,
        origin: &ChannelHandle,
        request: IntercomRequest,
    ) -> Result<IntercomResponse> {
        match request {
            IntercomRequest::Ping => Ok(IntercomResponse::Pong),
            IntercomRequest::GetState => Ok(IntercomResponse::State(self.snapshot().await)),
            IntercomRequest::GetConfirmation { id } => Ok(IntercomResponse::Confirmation(
                self.broker.summary(&id).await?,
            )),
            IntercomRequest::Confirmation {
                id,
                confirm,
                password,
            } => {
                self.broker.resolve(&id, confirm, password).await?;
                Ok(IntercomResponse::ConfirmationResolved { id })
            }
            IntercomRequest::DappDisconnect { origin: app } => {
                let removed = self.permissions.lock().await.remove(&app);
                if removed.is_none() {
                    return Err(AppError::NotFound(format!("no permission for {app}")));
                }
                info!(origin = %app, "dapp permission revoked");
                self.announce_state().await;
                Ok(IntercomResponse::DappDisconnected { origin: app })
            }
            IntercomRequest::AwaitOperation {
                hash,
                from_block_level,
            } => {
                let mut attempt = ConfirmationAttempt::new(hash);
                attempt.from_block_level = from_block_level;
                // A closing channel aborts the wait.
                let cancel = origin.closed_token().child_token();
                let record = self.confirmer.confirm_attempt(attempt, cancel).await?;
                Ok(IntercomResponse::OperationApplied(record))
            }
            gated => Err(AppError::Dispatch(format!(
                "{} must pass the confirmation gate",
                gated.kind()
            ))),
        }
    }

    async fn run_gated(
        &self,
        origin: ChannelHandle,
        request: IntercomRequest,
    ) -> Result<IntercomResponse> {
        let payload = serde_json::to_value(&request)?;
        let outcome = self
            .broker
            .request_confirmation(payload, origin.closed_token())
            .await;

        let password = match outcome {
            ConfirmationOutcome::Confirmed { password } => password,
            ConfirmationOutcome::Denied => {
                return Err(AppError::Rejected(format!("{} declined by user", request.kind())))
            }
            ConfirmationOutcome::Expired => {
                return Err(AppError::Expired(format!(
                    "{} confirmation expired",
                    request.kind()
                )))
            }
        };

        match request {
            IntercomRequest::Operations {
                source,
                network,
                operations,
            } => {
                let hash = self
                    .signer
                    .submit_operations(&source, &network, &operations, password.as_deref())
                    .await?;
                info!(%source, %hash, "operations submitted");
                Ok(IntercomResponse::OperationsSent { hash })
            }
            IntercomRequest::Sign { source, bytes } => {
                let signature = self
                    .signer
                    .sign(&source, &bytes, password.as_deref())
                    .await?;
                Ok(IntercomResponse::Signed { signature })
            }
            IntercomRequest::DappPermission {
                origin: app,
                name,
                network,
            } => {
                let permission = DappPermission {
                    origin: app.clone(),
                    name,
                    network,
                    granted_at: Utc::now(),
                };
                self.permissions
                    .lock()
                    .await
                    .insert(app.clone(), permission.clone());
                info!(origin = %app, "dapp permission granted");
                self.announce_state().await;
                Ok(IntercomResponse::PermissionGranted(permission))
            }
            other => Err(AppError::Dispatch(format!(
                "{} is not a gated request",
                other.kind()
            ))),
        }
    }

    async fn snapshot(&self) -> StateSnapshot {
        let mut permissions: Vec<DappPermission> =
            self.permissions.lock().await.values().cloned().collect();
        permissions.sort_by(|a, b| a.origin.cmp(&b.origin));
        StateSnapshot {
            channels: self.registry.len().await,
            queued: self.gate.queued(),
            confirmation: StateSnapshot::confirmation_value(&self.broker.state().await),
            permissions,
        }
    }

    async fn announce_state(&self) {
        match BroadcastEvent::StateUpdated.to_value() {
            Ok(data) => {
                self.registry.broadcast(data).await;
            }
            Err(err) => warn!(%err, "failed to encode state broadcast"),
        }
    }
}

impl RequestHandler for Dispatcher {
    fn handle(
        self: Arc<Self>,
        origin: ChannelHandle,
        payload: Value,
    ) -> BoxFuture<'static, Result<Value>> {
        self.dispatch(origin, payload)
    }
}
