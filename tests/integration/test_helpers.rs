//! Shared fixtures for integration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};

use vault_intercom::intercom::envelope::{decode_server_message, ServerMessage};
use vault_intercom::intercom::{BroadcastEvent, IntercomClient, IntercomServer};
use vault_intercom::operation::{
    FeedFilter, NetworkQueries, OperationFeed, OperationRecord, OperationStatus,
};
use vault_intercom::{AppError, Result};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(5);

/// Attach an in-memory channel and wrap its client end.
pub async fn connect_client(server: &IntercomServer) -> Arc<IntercomClient> {
    let (_handle, stream) = server.attach_in_memory().await;
    Arc::new(IntercomClient::connect(stream))
}

/// Wait for the next broadcast matching `pred`, skipping others.
pub async fn next_event<F>(rx: &mut broadcast::Receiver<Value>, mut pred: F) -> BroadcastEvent
where
    F: FnMut(&BroadcastEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            let data = rx.recv().await.expect("broadcast stream open");
            if let Ok(event) = BroadcastEvent::from_value(&data) {
                if pred(&event) {
                    return event;
                }
            }
        }
    })
    .await
    .expect("broadcast within deadline")
}

/// Wait for the next `confirmation_requested` and return its id.
pub async fn next_requested_id(rx: &mut broadcast::Receiver<Value>) -> String {
    match next_event(rx, |event| {
        matches!(event, BroadcastEvent::ConfirmationRequested { .. })
    })
    .await
    {
        BroadcastEvent::ConfirmationRequested { id } => id,
        other => panic!("unexpected event {other:?}"),
    }
}

/// Wait for the next `confirmation_expired` and return its id.
pub async fn next_expired_id(rx: &mut broadcast::Receiver<Value>) -> String {
    match next_event(rx, |event| {
        matches!(event, BroadcastEvent::ConfirmationExpired { .. })
    })
    .await
    {
        BroadcastEvent::ConfirmationExpired { id } => id,
        other => panic!("unexpected event {other:?}"),
    }
}

/// Raw line-level peer for exercising malformed traffic.
pub struct RawPeer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl RawPeer {
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    pub async fn send_line(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\n").as_bytes())
            .await
            .expect("write line");
        self.writer.flush().await.expect("flush");
    }

    pub async fn read_line(&mut self) -> String {
        tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("line within deadline")
            .expect("read line")
            .expect("stream open")
    }

    pub async fn read_message(&mut self) -> ServerMessage {
        decode_server_message(&self.read_line().await).expect("server message")
    }
}

// ── Operation mocks ──────────────────────────────────────────

/// Build a record for `hash` with `status`.
pub fn op(hash: &str, status: OperationStatus) -> OperationRecord {
    OperationRecord {
        hash: hash.into(),
        status,
        level: None,
        data: Value::Null,
    }
}

/// Scripted chain: successive head levels and per-level block contents.
#[derive(Default)]
pub struct MockNetwork {
    heads: Mutex<Vec<u64>>,
    blocks: Mutex<HashMap<u64, Vec<OperationRecord>>>,
    fetched: Mutex<Vec<u64>>,
    head_calls: AtomicUsize,
    head_failures: AtomicUsize,
    block_failures: Mutex<HashMap<u64, usize>>,
}

impl MockNetwork {
    /// Heads returned in order; the last one repeats forever.
    pub fn with_heads(heads: &[u64]) -> Self {
        Self {
            heads: Mutex::new(heads.to_vec()),
            ..Self::default()
        }
    }

    pub fn put_block(&self, level: u64, records: Vec<OperationRecord>) {
        self.blocks.lock().unwrap().insert(level, records);
    }

    /// Make the next `count` head queries fail.
    pub fn fail_heads(&self, count: usize) {
        self.head_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` queries of block `level` fail.
    pub fn fail_block(&self, level: u64, count: usize) {
        self.block_failures.lock().unwrap().insert(level, count);
    }

    pub fn fetched_levels(&self) -> Vec<u64> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn head_calls(&self) -> usize {
        self.head_calls.load(Ordering::SeqCst)
    }
}

impl NetworkQueries for MockNetwork {
    fn head_level(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            self.head_calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .head_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failing {
                return Err(AppError::Network("node unreachable".into()));
            }
            let mut heads = self.heads.lock().unwrap();
            let head = match heads.len() {
                0 => return Err(AppError::Network("no head scripted".into())),
                1 => heads[0],
                _ => heads.remove(0),
            };
            Ok(head)
        })
    }

    fn block_operations(&self, level: u64) -> BoxFuture<'_, Result<Vec<OperationRecord>>> {
        Box::pin(async move {
            self.fetched.lock().unwrap().push(level);
            if let Some(left) = self.block_failures.lock().unwrap().get_mut(&level) {
                if *left > 0 {
                    *left -= 1;
                    return Err(AppError::Network(format!("block {level} unavailable")));
                }
            }
            Ok(self
                .blocks
                .lock()
                .unwrap()
                .get(&level)
                .cloned()
                .unwrap_or_default())
        })
    }
}

/// Real-time feed whose batches are pushed by the test.
pub struct MockFeed {
    lookup: Mutex<Option<Result<Vec<OperationRecord>>>>,
    batches: Mutex<Option<mpsc::Receiver<Vec<OperationRecord>>>>,
    pub subscribed: AtomicUsize,
}

impl MockFeed {
    /// Returns the feed and the sender used to push batches into it.
    pub fn new(
        lookup: Result<Vec<OperationRecord>>,
    ) -> (Arc<Self>, mpsc::Sender<Vec<OperationRecord>>) {
        let (tx, rx) = mpsc::channel(16);
        let feed = Arc::new(Self {
            lookup: Mutex::new(Some(lookup)),
            batches: Mutex::new(Some(rx)),
            subscribed: AtomicUsize::new(0),
        });
        (feed, tx)
    }
}

impl OperationFeed for MockFeed {
    fn subscribe(
        &self,
        _filter: FeedFilter,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<Vec<OperationRecord>>>> {
        Box::pin(async move {
            self.subscribed.fetch_add(1, Ordering::SeqCst);
            self.batches
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| AppError::Network("already subscribed".into()))
        })
    }

    fn lookup<'a>(&'a self, _hash: &'a str) -> BoxFuture<'a, Result<Vec<OperationRecord>>> {
        Box::pin(async move {
            self.lookup
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(Vec::new()))
        })
    }
}
