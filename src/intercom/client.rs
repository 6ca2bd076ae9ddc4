//! Intercom client: one channel, correlated requests, broadcast fan-out.
//!
//! Each outgoing request gets a fresh monotonic `reqId` and a slot in the
//! pending-request table. The reader task settles the slot when the matching
//! response arrives; responses for unknown ids are logged and dropped.
//!
//! If the channel closes before a response arrives the request stays
//! pending. Callers that cannot wait forever use
//! [`IntercomClient::request_with_timeout`], which also removes the orphaned
//! slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::intercom::codec::IntercomCodec;
use crate::intercom::envelope::{
    decode_server_message, encode_line, ReqId, RequestEnvelope, ServerMessage,
};
use crate::{AppError, Result};

/// Capacity of the broadcast fan-out; slow subscribers lag rather than block.
const BROADCAST_CAPACITY: usize = 64;

/// Outcome delivered to a pending request: data or the server's error text.
type Settlement = std::result::Result<Value, String>;

/// Pending-request table keyed by `reqId`.
type PendingRequests = Arc<Mutex<HashMap<ReqId, oneshot::Sender<Settlement>>>>;

type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Client side of one intercom channel.
pub struct IntercomClient {
    writer: Mutex<BoxedWriter>,
    next_req_id: AtomicU64,
    pending: PendingRequests,
    broadcasts: broadcast::Sender<Value>,
    closed: CancellationToken,
    reader_task: JoinHandle<()>,
}

impl IntercomClient {
    /// Wrap a connected bidirectional stream.
    pub fn connect<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::from_split(reader, writer)
    }

    /// Wrap separate read and write halves of one channel.
    pub fn from_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending = PendingRequests::default();
        let (broadcasts, _) = broadcast::channel(BROADCAST_CAPACITY);
        let closed = CancellationToken::new();

        let reader_task = tokio::spawn(
            run_reader(
                reader,
                Arc::clone(&pending),
                broadcasts.clone(),
                closed.clone(),
            )
            .instrument(info_span!("intercom_client")),
        );

        Self {
            writer: Mutex::new(Box::new(writer)),
            next_req_id: AtomicU64::new(1),
            pending,
            broadcasts,
            closed,
            reader_task,
        }
    }

    /// Send `payload` and wait for the correlated response.
    ///
    /// # Errors
    ///
    /// - `AppError::Remote` with the server's message for an error response.
    /// - `AppError::Ipc` if the request could not be written.
    /// - `AppError::Disconnected` if the client is torn down while waiting.
    pub async fn request(&self, payload: Value) -> Result<Value> {
        let (req_id, rx) = self.send_request(payload).await?;
        settle(req_id, rx.await)
    }

    /// Like [`request`](Self::request) but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Ipc` on timeout, after removing the pending slot.
    pub async fn request_with_timeout(&self, payload: Value, timeout: Duration) -> Result<Value> {
        let (req_id, rx) = self.send_request(payload).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(received) => settle(req_id, received),
            Err(_elapsed) => {
                self.pending.lock().await.remove(&req_id);
                Err(AppError::Ipc(format!(
                    "request {req_id} timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    /// Serialize `payload`, send it, and decode the response data as `T`.
    ///
    /// # Errors
    ///
    /// Propagates [`request`](Self::request) errors; returns
    /// `AppError::Protocol` if either side fails to (de)serialize.
    pub async fn request_as<P, T>(&self, payload: &P) -> Result<T>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let data = self.request(serde_json::to_value(payload)?).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Subscribe to broadcasts on this channel.
    ///
    /// Every subscriber receives every broadcast; dropping the receiver
    /// unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.broadcasts.subscribe()
    }

    /// Whether the channel is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Wait until the channel closes.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Number of requests still waiting for a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn send_request(&self, payload: Value) -> Result<(ReqId, oneshot::Receiver<Settlement>)> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(req_id, tx);

        let bytes = encode_line(&RequestEnvelope { req_id, payload })?;
        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(&bytes).await {
                Ok(()) => writer.flush().await,
                Err(err) => Err(err),
            }
        };

        if let Err(err) = written {
            self.pending.lock().await.remove(&req_id);
            return Err(AppError::Ipc(format!("failed to send request {req_id}: {err}")));
        }

        debug!(req_id, "request sent");
        Ok((req_id, rx))
    }
}

impl Drop for IntercomClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn settle(
    req_id: ReqId,
    received: std::result::Result<Settlement, oneshot::error::RecvError>,
) -> Result<Value> {
    match received {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(message)) => Err(AppError::Remote(message)),
        Err(_) => Err(AppError::Disconnected(format!(
            "request {req_id} abandoned: client torn down"
        ))),
    }
}

/// Route inbound server messages to pending requests and subscribers.
async fn run_reader<R>(
    reader: R,
    pending: PendingRequests,
    broadcasts: broadcast::Sender<Value>,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(reader, IntercomCodec::new());

    while let Some(item) = framed.next().await {
        let line = match item {
            Ok(line) => line,
            Err(AppError::Protocol(msg)) => {
                warn!(error = msg.as_str(), "client reader: framing error, skipping");
                continue;
            }
            Err(err) => {
                warn!(%err, "client reader: io error, stopping");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message = match decode_server_message(&line) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "client reader: dropping malformed message");
                continue;
            }
        };

        match message {
            ServerMessage::Response { req_id, data } => complete(&pending, req_id, Ok(data)).await,
            ServerMessage::Error { req_id, data } => complete(&pending, req_id, Err(data)).await,
            ServerMessage::Subscription { data } => {
                // No subscribers is fine.
                let _ = broadcasts.send(data);
            }
        }
    }

    closed.cancel();
    debug!("client reader: channel closed");
}

async fn complete(pending: &PendingRequests, req_id: ReqId, settlement: Settlement) {
    let slot = pending.lock().await.remove(&req_id);
    match slot {
        Some(tx) => {
            if tx.send(settlement).is_err() {
                debug!(req_id, "response arrived after caller stopped waiting");
            }
        }
        None => warn!(req_id, "response for unknown or settled reqId dropped"),
    }
}
