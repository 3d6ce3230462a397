use std::{
    collections::{HashMap, VecDeque},
    future::Future as _,
    pin::Pin,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use http_body_util::BodyExt as _;
use hyper::{
    Request, Response, StatusCode,
    body::{Body, Frame, Incoming},
    header::{HeaderName, HeaderValue},
};
use tokio::time::{Instant, Sleep};

use crate::{
    inventory::{FormFactor, Headers, InventoryRepository, Transaction},
    proxy::{
        BoxError, ProxyBody, ProxyHandler, RequestIdentifier, failed_response,
        strip_hop_by_hop_headers,
    },
};

const MAX_CHUNKS: usize = 10;
const MIN_CHUNK_INTERVAL_MS: f64 = 10.0;
const MIN_CHUNK_SIZE: usize = 16 * 1024;
const REPLAYED_ERROR: &str = "ON_REQUEST_ERROR";

#[derive(Debug, Clone)]
struct PlaybackTransaction {
    url: String,
    ttfb: Duration,
    status_code: Option<u16>,
    error_message: Option<String>,
    headers: Headers,
    chunks: Vec<Bytes>,
    duration: Duration,
}

impl From<Transaction> for PlaybackTransaction {
    fn from(transaction: Transaction) -> Self {
        let duration_ms = transaction.duration_ms.unwrap_or(0.0).max(0.0);
        let chunks = transaction
            .content
            .map(|content| split_into_chunks(content, duration_ms))
            .unwrap_or_default();
        Self {
            url: transaction.url,
            ttfb: Duration::from_millis(transaction.ttfb_ms),
            status_code: transaction.status_code,
            error_message: transaction.error_message,
            headers: transaction.raw_headers,
            chunks,
            duration: Duration::try_from_secs_f64(duration_ms / 1000.0)
                .unwrap_or(Duration::MAX),
        }
    }
}

/// At most ten chunks, none shorter than 16 KiB, so that no write interval
/// falls under 10ms. A transfer under 10ms is a single chunk.
fn split_into_chunks(content: Bytes, duration_ms: f64) -> Vec<Bytes> {
    if content.is_empty() {
        return Vec::new();
    }
    let chunk_count = MAX_CHUNKS.min((duration_ms / MIN_CHUNK_INTERVAL_MS).floor() as usize);
    let chunk_size = match chunk_count {
        0 => content.len(),
        count => MIN_CHUNK_SIZE.max(content.len().div_ceil(count)),
    };
    (0..content.len())
        .step_by(chunk_size)
        .map(|start| content.slice(start..content.len().min(start + chunk_size)))
        .collect()
}

type TransactionMap = HashMap<String, HashMap<String, Arc<PlaybackTransaction>>>;

/// Answers requests from a recorded inventory, reproducing the recorded TTFB
/// and transfer duration.
pub struct PlaybackProxy {
    repository: InventoryRepository,
    transactions: RwLock<TransactionMap>,
    entry_url: Mutex<Option<String>>,
    device_type: Mutex<Option<FormFactor>>,
    request_seq: AtomicU64,
}

impl PlaybackProxy {
    pub fn new(repository: InventoryRepository) -> Self {
        Self {
            repository,
            transactions: RwLock::new(HashMap::new()),
            entry_url: Mutex::new(None),
            device_type: Mutex::new(None),
            request_seq: AtomicU64::new(0),
        }
    }

    /// Entry URL of the loaded inventory; available once the session started.
    pub fn entry_url(&self) -> Option<String> {
        self.entry_url
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn device_type(&self) -> Option<FormFactor> {
        *self
            .device_type
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(HashMap::len)
            .sum()
    }

    fn load_transactions(&self, transactions: Vec<Transaction>) {
        let mut map = TransactionMap::new();
        for transaction in transactions {
            let method = transaction.method.to_ascii_lowercase();
            let playback = PlaybackTransaction::from(transaction);
            map.entry(method)
                .or_default()
                .insert(playback.url.clone(), Arc::new(playback));
        }
        *self
            .transactions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = map;
    }

    fn lookup(&self, identifier: &RequestIdentifier) -> Option<Arc<PlaybackTransaction>> {
        self.transactions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&identifier.method)
            .and_then(|by_url| by_url.get(&identifier.url))
            .cloned()
    }
}

impl ProxyHandler for PlaybackProxy {
    async fn setup(&self) -> anyhow::Result<()> {
        let inventory = self.repository.load_inventory().await?;
        let transactions = self.repository.load_transactions(inventory.resources).await;
        self.load_transactions(transactions);

        if let Some(entry_url) = inventory.entry_url {
            *self
                .entry_url
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(entry_url);
        }
        if let Some(device_type) = inventory.device_type {
            *self
                .device_type
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(device_type);
        }
        tracing::info!(
            transactions = self.transaction_count(),
            inventory_dir = %self.repository.dir().display(),
            "loaded inventory for playback"
        );
        Ok(())
    }

    async fn handle(
        &self,
        identifier: RequestIdentifier,
        _req: Request<Incoming>,
    ) -> Response<ProxyBody> {
        let number = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let Some(transaction) = self.lookup(&identifier) else {
            tracing::warn!(
                request = number,
                method = %identifier.method,
                url = %identifier.url,
                "request not found in inventory"
            );
            // Left unanswered: the client runs into its own timeout.
            return std::future::pending().await;
        };

        tracing::debug!(request = number, url = %transaction.url, "request started");
        tokio::time::sleep(transaction.ttfb).await;
        replay_response(&transaction)
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn replay_response(transaction: &PlaybackTransaction) -> Response<ProxyBody> {
    if let Some(message) = transaction.error_message.as_deref() {
        return failed_response(REPLAYED_ERROR, message);
    }

    let status = transaction
        .status_code
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ReplayChunkBody::new(transaction.chunks.clone(), transaction.duration);
    let mut response = Response::new(body.boxed());
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &transaction.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            tracing::debug!(
                url = %transaction.url,
                header = %name,
                "skipping invalid recorded header"
            );
            continue;
        };
        headers.insert(name, value);
    }
    strip_hop_by_hop_headers(headers);
    response
}

/// Emits chunk `i` at `(i + 1) * duration / chunks` after the body is created.
struct ReplayChunkBody {
    chunks: VecDeque<Bytes>,
    interval: Duration,
    started_at: Instant,
    sent: u32,
    delay: Option<Pin<Box<Sleep>>>,
}

impl ReplayChunkBody {
    fn new(chunks: Vec<Bytes>, duration: Duration) -> Self {
        let interval = match u32::try_from(chunks.len()) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(count) => duration / count,
        };
        Self {
            chunks: chunks.into(),
            interval,
            started_at: Instant::now(),
            sent: 0,
            delay: None,
        }
    }
}

impl Body for ReplayChunkBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.chunks.is_empty() {
            return Poll::Ready(None);
        }

        let deadline = this
            .interval
            .checked_mul(this.sent + 1)
            .and_then(|offset| this.started_at.checked_add(offset));
        if deadline.is_none_or(|deadline| Instant::now() < deadline) {
            let delay = this.delay.get_or_insert_with(|| {
                Box::pin(match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline),
                    // Past the timer's range; `sleep` saturates instead of panicking.
                    None => tokio::time::sleep(Duration::MAX),
                })
            });
            if delay.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
        }
        this.delay = None;
        this.sent += 1;
        Poll::Ready(this.chunks.pop_front().map(|chunk| Ok(Frame::data(chunk))))
    }

    fn is_end_stream(&self) -> bool {
        self.chunks.is_empty()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        let remaining: usize = self.chunks.iter().map(Bytes::len).sum();
        hyper::body::SizeHint::with_exact(remaining as u64)
    }
}
