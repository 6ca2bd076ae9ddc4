//! Intercom server: live channel tracking, request multiplexing, broadcast.
//!
//! Every attached stream becomes a channel with a reader task and a writer
//! task. Inbound lines are decoded into [`RequestEnvelope`]s and handed to
//! the single [`RequestHandler`] in delivery order: the reader itself calls
//! [`RequestHandler::handle`], and only the returned future runs in its own
//! task, so a request that waits on a human decision never blocks the
//! decision request arriving behind it on the same channel.
//!
//! Whatever the handler does (returns an error, panics) the request is
//! answered: failures become `{"type": "error"}` responses.
//!
//! The local socket listener uses the `interprocess` crate: a named pipe on
//! Windows, a Unix domain socket on Linux/macOS.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use futures_util::StreamExt;
use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::intercom::channel::{ChannelHandle, ChannelId, ChannelRegistry, OUTBOUND_CAPACITY};
use crate::intercom::codec::IntercomCodec;
use crate::intercom::envelope::{
    decode_request, encode_line, BroadcastEvent, ReqId, RequestEnvelope, ServerMessage,
};
use crate::{AppError, Result};

/// Message used when a handler fails without a usable error text.
pub const FALLBACK_ERROR: &str = "unexpected error while handling request";

/// Buffer size of in-memory channels created by [`IntercomServer::attach_in_memory`].
const IN_MEMORY_BUFFER: usize = 64 * 1024;

/// The single logical handler for every inbound request.
pub trait RequestHandler: Send + Sync + 'static {
    /// Service `payload`, which arrived on `origin`.
    ///
    /// Called from the channel's reader in delivery order. Work done before
    /// the returned future is first polled (such as queueing) therefore keeps
    /// that order; the future itself runs concurrently with later requests.
    ///
    /// # Errors
    ///
    /// Any error is turned into an error response on `origin`.
    fn handle(self: Arc<Self>, origin: ChannelHandle, payload: Value)
        -> BoxFuture<'static, Result<Value>>;
}

/// Adapter turning an async closure into a [`RequestHandler`].
pub struct FnHandler<F>(F);

impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(ChannelHandle, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    fn handle(
        self: Arc<Self>,
        origin: ChannelHandle,
        payload: Value,
    ) -> BoxFuture<'static, Result<Value>> {
        Box::pin((self.0)(origin, payload))
    }
}

/// Wrap an async closure as a shareable request handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<FnHandler<F>>
where
    F: Fn(ChannelHandle, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct ServerInner {
    registry: Arc<ChannelRegistry>,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    next_channel: AtomicU64,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

/// Server side of the intercom protocol.
#[derive(Clone)]
pub struct IntercomServer {
    inner: Arc<ServerInner>,
}

impl Default for IntercomServer {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl IntercomServer {
    /// Create a server whose tasks stop when `cancel` fires.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                registry: Arc::new(ChannelRegistry::new()),
                handler: RwLock::new(None),
                next_channel: AtomicU64::new(1),
                cancel,
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Shared live-channel registry, used by broadcasters.
    #[must_use]
    pub fn registry(&self) -> Arc<ChannelRegistry> {
        Arc::clone(&self.inner.registry)
    }

    /// Attach the request handler for all channels, current and future.
    ///
    /// Replaces any previously attached handler.
    pub async fn subscribe_to_requests(&self, handler: Arc<dyn RequestHandler>) {
        *self.inner.handler.write().await = Some(handler);
    }

    /// Attach a bidirectional stream as a new channel.
    pub async fn attach<S>(&self, stream: S) -> ChannelHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.attach_split(reader, writer).await
    }

    /// Attach separate read and write halves as a new channel.
    pub async fn attach_split<R, W>(&self, reader: R, writer: W) -> ChannelHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = ChannelId(self.inner.next_channel.fetch_add(1, Ordering::SeqCst));
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let handle = ChannelHandle::new(id, outbound_tx);
        self.inner.registry.insert(handle.clone()).await;

        let span = info_span!("channel", channel = %id);
        self.inner.tasks.spawn(
            run_writer(handle.clone(), writer, outbound_rx, self.inner.cancel.clone())
                .instrument(span.clone()),
        );
        self.inner
            .tasks
            .spawn(run_reader(Arc::clone(&self.inner), handle.clone(), reader).instrument(span));
        handle.mark_active();

        info!(channel = %id, "channel opened");
        handle
    }

    /// Create an in-process channel and return the client end of it.
    pub async fn attach_in_memory(&self) -> (ChannelHandle, DuplexStream) {
        let (server_end, client_end) = tokio::io::duplex(IN_MEMORY_BUFFER);
        let handle = self.attach(server_end).await;
        (handle, client_end)
    }

    /// Best-effort send of `data` to every live channel.
    ///
    /// Returns the number of channels the broadcast was queued on.
    pub async fn broadcast(&self, data: Value) -> usize {
        self.inner.registry.broadcast(data).await
    }

    /// Broadcast a typed service event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the event cannot be serialized.
    pub async fn broadcast_event(&self, event: &BroadcastEvent) -> Result<usize> {
        Ok(self.broadcast(event.to_value()?).await)
    }

    /// Close one channel; other channels are unaffected.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no live channel has this id.
    pub async fn disconnect(&self, id: ChannelId) -> Result<()> {
        let handle = self
            .inner
            .registry
            .remove(id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("channel {id}")))?;
        handle.close();
        info!(channel = %id, "channel disconnected by server");
        Ok(())
    }

    /// Number of live channels.
    pub async fn channel_count(&self) -> usize {
        self.inner.registry.len().await
    }

    /// Spawn the local socket listener task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` if the listener cannot be created.
    pub fn spawn_local_listener(&self, ipc_name: &str) -> Result<tokio::task::JoinHandle<()>> {
        let name = ipc_name.to_owned();

        let listener_name = name
            .clone()
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

        let listener = ListenerOptions::new()
            .name(listener_name)
            .create_tokio()
            .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

        info!(ipc_name = %name, "intercom listener ready");

        let server = self.clone();
        let ct = self.inner.cancel.clone();
        let handle = tokio::spawn(async move {
            let span = info_span!("intercom_listener", name = %name);
            async move {
                loop {
                    tokio::select! {
                        () = ct.cancelled() => {
                            info!("intercom listener shutting down");
                            break;
                        }
                        accept_result = listener.accept() => {
                            match accept_result {
                                Ok(stream) => {
                                    let (reader, writer) = stream.split();
                                    server.attach_split(reader, writer).await;
                                }
                                Err(err) => {
                                    warn!(%err, "intercom accept failed");
                                }
                            }
                        }
                    }
                }
            }
            .instrument(span)
            .await;
        });

        Ok(handle)
    }

    /// Stop all channel tasks and wait for them to exit.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.registry.close_all().await;
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("intercom server stopped");
    }
}

/// Read and dispatch inbound lines until EOF, error, or cancellation.
async fn run_reader<R>(inner: Arc<ServerInner>, handle: ChannelHandle, reader: R)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(reader, IntercomCodec::new());

    loop {
        tokio::select! {
            biased;

            () = inner.cancel.cancelled() => break,
            () = handle.closed() => break,

            item = framed.next() => {
                match item {
                    None => {
                        debug!("channel reader: EOF");
                        break;
                    }
                    Some(Err(AppError::Protocol(msg))) => {
                        warn!(error = msg.as_str(), "channel reader: framing error, skipping");
                    }
                    Some(Err(err)) => {
                        warn!(%err, "channel reader: io error, closing");
                        break;
                    }
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode_request(&line) {
                            Ok(envelope) => admit_request(&inner, &handle, envelope).await,
                            Err(err) => reject_malformed(&handle, &line, &err).await,
                        }
                    }
                }
            }
        }
    }

    handle.close();
    inner.registry.remove(handle.id()).await;
    info!(channel = %handle.id(), "channel closed");
}

/// Answer a malformed line when it still carries a usable `reqId`.
async fn reject_malformed(handle: &ChannelHandle, line: &str, err: &AppError) {
    let req_id = serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|value| value.get("reqId").and_then(Value::as_u64));

    match req_id {
        Some(req_id) => {
            warn!(req_id, %err, "rejecting malformed request");
            let message = ServerMessage::Error {
                req_id,
                data: err.to_string(),
            };
            if let Err(send_err) = handle.send(message).await {
                debug!(req_id, %send_err, "malformed-request reply dropped");
            }
        }
        None => warn!(%err, "dropping malformed message without reqId"),
    }
}

/// Hand one request to the handler on the reader, then spawn its completion.
async fn admit_request(
    inner: &Arc<ServerInner>,
    handle: &ChannelHandle,
    envelope: RequestEnvelope,
) {
    let RequestEnvelope { req_id, payload } = envelope;
    let handler = inner.handler.read().await.clone();

    let work: BoxFuture<'static, Result<Value>> = match handler {
        None => Box::pin(future::ready(Err::<Value, _>(AppError::Dispatch(
            "no request handler attached".into(),
        )))),
        Some(handler) => {
            let origin = handle.clone();
            let admitted = panic::catch_unwind(AssertUnwindSafe(move || {
                handler.handle(origin, payload)
            }));
            match admitted {
                Ok(work) => work,
                Err(_) => {
                    error!(req_id, "request handler panicked during admission");
                    Box::pin(future::ready(Err::<Value, _>(AppError::Dispatch(
                        FALLBACK_ERROR.into(),
                    ))))
                }
            }
        }
    };

    inner
        .tasks
        .spawn(serve_request(handle.clone(), req_id, work).in_current_span());
}

/// Drive one admitted request and queue exactly one response.
async fn serve_request(
    handle: ChannelHandle,
    req_id: ReqId,
    work: BoxFuture<'static, Result<Value>>,
) {
    let outcome = match tokio::spawn(work).await {
        Ok(result) => result,
        Err(join_err) => {
            error!(req_id, %join_err, "request handler aborted");
            Err(AppError::Dispatch(FALLBACK_ERROR.into()))
        }
    };

    let message = match outcome {
        Ok(data) => ServerMessage::Response { req_id, data },
        Err(err) => {
            let text = err.to_string();
            debug!(req_id, error = %text, "request failed");
            ServerMessage::Error {
                req_id,
                data: if text.trim().is_empty() {
                    FALLBACK_ERROR.to_owned()
                } else {
                    text
                },
            }
        }
    };

    if let Err(err) = handle.send(message).await {
        debug!(req_id, %err, "response dropped; channel gone");
    }
}

/// Serialize queued messages and write them as NDJSON lines.
async fn run_writer<W>(
    handle: ChannelHandle,
    mut writer: W,
    mut outbound_rx: mpsc::Receiver<ServerMessage>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,
            () = handle.closed() => break,

            message = outbound_rx.recv() => {
                let Some(message) = message else {
                    break;
                };
                let bytes = match encode_line(&message) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(%err, "channel writer: failed to encode message, skipping");
                        continue;
                    }
                };
                let written = async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                }
                .await;
                if let Err(err) = written {
                    warn!(%err, "channel writer: write failed, closing");
                    handle.close();
                    break;
                }
            }
        }
    }

    let _ = writer.shutdown().await;
}
