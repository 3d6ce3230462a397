use std::{
    pin::Pin,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll, ready},
};

use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt as _;
use hyper::{
    HeaderMap, Request, Response, Uri, Version,
    body::{Body, Frame, Incoming},
};
use tokio::{sync::mpsc, time::Instant};

use crate::{
    inventory::{FormFactor, Headers, Inventory, InventoryRepository, Transaction},
    proxy::{
        BoxError, HttpClient, ProxyBody, ProxyHandler, RequestIdentifier, boxed_incoming,
        build_http_client, failed_response, strip_hop_by_hop_headers,
    },
};

const UPSTREAM_REQUEST_ERROR: &str = "PROXY_TO_SERVER_REQUEST_ERROR";
const UPSTREAM_RESPONSE_ERROR: &str = "SERVER_TO_PROXY_RESPONSE_ERROR";

/// Per-request capture. Owned by the request's handling task until the
/// response finishes, then handed to the session.
#[derive(Debug)]
struct RecordingTransaction {
    number: u64,
    identifier: RequestIdentifier,
    started_at: Instant,
    response_started_at: Option<Instant>,
    response_ended_at: Option<Instant>,
    status_code: Option<u16>,
    headers: Option<Headers>,
    content: BytesMut,
    error: Option<RecordedError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordedError {
    kind: &'static str,
    message: String,
}

impl RecordingTransaction {
    fn started(number: u64, identifier: RequestIdentifier) -> Self {
        Self {
            number,
            identifier,
            started_at: Instant::now(),
            response_started_at: None,
            response_ended_at: None,
            status_code: None,
            headers: None,
            content: BytesMut::new(),
            error: None,
        }
    }

    fn into_transaction(self) -> Transaction {
        let ttfb_ms = self
            .response_started_at
            .map_or(0, |at| at.duration_since(self.started_at).as_millis() as u64);
        let duration_ms = match (self.response_started_at, self.response_ended_at) {
            (Some(started), Some(ended)) => Some(ended.duration_since(started).as_millis() as f64),
            _ => None,
        };
        Transaction {
            method: self.identifier.method,
            url: self.identifier.url,
            ttfb_ms,
            status_code: self.status_code,
            error_message: self.error.map(|error| error.message),
            raw_headers: self.headers.unwrap_or_default(),
            content: (!self.content.is_empty()).then(|| self.content.freeze()),
            duration_ms,
        }
    }
}

/// Lowercases header names, joining repeated values with `,`.
fn capture_headers(headers: &HeaderMap) -> Headers {
    let mut captured = Headers::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        captured
            .entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing: &mut String| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    captured
}

/// Forwards every request upstream and captures the exchange. The inventory
/// is written when the session stops.
pub struct RecordingProxy {
    repository: InventoryRepository,
    client: HttpClient,
    entry_url: Option<String>,
    device_type: Option<FormFactor>,
    request_seq: AtomicU64,
    completed_tx: mpsc::UnboundedSender<RecordingTransaction>,
    completed_rx: Mutex<mpsc::UnboundedReceiver<RecordingTransaction>>,
}

impl RecordingProxy {
    pub fn new(repository: InventoryRepository) -> anyhow::Result<Self> {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        Ok(Self {
            repository,
            client: build_http_client()?,
            entry_url: None,
            device_type: None,
            request_seq: AtomicU64::new(0),
            completed_tx,
            completed_rx: Mutex::new(completed_rx),
        })
    }

    pub fn with_entry_url(mut self, entry_url: impl Into<String>) -> Self {
        self.entry_url = Some(entry_url.into());
        self
    }

    pub fn with_device_type(mut self, device_type: FormFactor) -> Self {
        self.device_type = Some(device_type);
        self
    }

    pub fn repository(&self) -> &InventoryRepository {
        &self.repository
    }

    fn drain_completed(&self) -> Vec<Transaction> {
        let mut completed_rx = self
            .completed_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut transactions = Vec::new();
        while let Ok(transaction) = completed_rx.try_recv() {
            transactions.push(transaction.into_transaction());
        }
        transactions
    }

    fn complete(&self, transaction: RecordingTransaction) {
        let _ = self.completed_tx.send(transaction);
    }
}

impl ProxyHandler for RecordingProxy {
    async fn setup(&self) -> anyhow::Result<()> {
        tracing::info!(
            inventory_dir = %self.repository.dir().display(),
            "recording into inventory"
        );
        Ok(())
    }

    async fn handle(
        &self,
        identifier: RequestIdentifier,
        req: Request<Incoming>,
    ) -> Response<ProxyBody> {
        let number = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut transaction = RecordingTransaction::started(number, identifier);
        let url = transaction.identifier.url.clone();
        tracing::debug!(request = number, %url, "request started");

        let upstream_uri = match url.parse::<Uri>() {
            Ok(uri) => uri,
            Err(err) => {
                return self.fail(transaction, UPSTREAM_REQUEST_ERROR, err.to_string());
            }
        };
        let (mut parts, body) = req.into_parts();
        parts.uri = upstream_uri;
        parts.version = Version::HTTP_11;
        strip_hop_by_hop_headers(&mut parts.headers);
        let upstream_req = Request::from_parts(parts, boxed_incoming(body));

        let upstream_res = match self.client.request(upstream_req).await {
            Ok(res) => res,
            Err(err) => {
                let message = std::error::Error::source(&err)
                    .map_or_else(|| err.to_string(), |source| format!("{err}: {source}"));
                return self.fail(transaction, UPSTREAM_REQUEST_ERROR, message);
            }
        };

        transaction.response_started_at = Some(Instant::now());
        transaction.status_code = Some(upstream_res.status().as_u16());
        transaction.headers = Some(capture_headers(upstream_res.headers()));
        tracing::debug!(
            request = number,
            %url,
            status = upstream_res.status().as_u16(),
            "request responded"
        );

        let (mut parts, body) = upstream_res.into_parts();
        strip_hop_by_hop_headers(&mut parts.headers);
        if body.is_end_stream() {
            transaction.response_ended_at = transaction.response_started_at;
            tracing::debug!(request = number, %url, "request completed");
            self.complete(transaction);
            return Response::from_parts(parts, boxed_incoming(body));
        }

        let body = RecordingBody {
            inner: body,
            transaction: Some(transaction),
            completed_tx: self.completed_tx.clone(),
        };
        Response::from_parts(parts, body.boxed())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let transactions = self.drain_completed();
        tracing::info!(
            transactions = transactions.len(),
            inventory_dir = %self.repository.dir().display(),
            "saving inventory"
        );
        let resources = self.repository.save_transactions(transactions).await?;
        let inventory = Inventory {
            entry_url: self.entry_url.clone(),
            device_type: self.device_type,
            resources,
        };
        self.repository.save_inventory(&inventory).await
    }
}

impl RecordingProxy {
    fn fail(
        &self,
        mut transaction: RecordingTransaction,
        kind: &'static str,
        message: String,
    ) -> Response<ProxyBody> {
        tracing::warn!(
            request = transaction.number,
            url = %transaction.identifier.url,
            "request failed: {message}"
        );
        transaction.response_started_at = Some(Instant::now());
        let response = failed_response(kind, &message);
        transaction.error = Some(RecordedError { kind, message });
        self.complete(transaction);
        response
    }
}

/// Passes the upstream body through while keeping a copy of every chunk.
/// The transaction is handed over when the stream ends or fails; a body
/// dropped halfway (client went away) is not recorded.
struct RecordingBody {
    inner: Incoming,
    transaction: Option<RecordingTransaction>,
    completed_tx: mpsc::UnboundedSender<RecordingTransaction>,
}

impl RecordingBody {
    fn finish(&mut self, error: Option<RecordedError>) {
        let Some(mut transaction) = self.transaction.take() else {
            return;
        };
        transaction.response_ended_at = Some(Instant::now());
        match &error {
            Some(error) => tracing::warn!(
                request = transaction.number,
                url = %transaction.identifier.url,
                kind = error.kind,
                "response stream failed: {}",
                error.message
            ),
            None => tracing::debug!(
                request = transaction.number,
                url = %transaction.identifier.url,
                "request completed"
            ),
        }
        transaction.error = error;
        let _ = self.completed_tx.send(transaction);
    }
}

impl Body for RecordingBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let (Some(data), Some(transaction)) = (frame.data_ref(), this.transaction.as_mut())
                {
                    transaction.content.extend_from_slice(data);
                }
                if this.inner.is_end_stream() {
                    this.finish(None);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(err)) => {
                this.finish(Some(RecordedError {
                    kind: UPSTREAM_RESPONSE_ERROR,
                    message: err.to_string(),
                }));
                Poll::Ready(Some(Err(Box::new(err))))
            }
            None => {
                this.finish(None);
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for RecordingBody {
    fn drop(&mut self) {
        if let Some(transaction) = self.transaction.as_ref() {
            tracing::debug!(
                request = transaction.number,
                url = %transaction.identifier.url,
                "response abandoned before completion"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::BytesMut;
    use hyper::{HeaderMap, header::HeaderValue};
    use tokio::time::Instant;

    use super::{RecordedError, RecordingTransaction, capture_headers};
    use crate::proxy::RequestIdentifier;

    #[test]
    fn capture_headers_lowercases_and_joins_repeated_values() {
        let mut headers = HeaderMap::new();
        headers.append("Set-Cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));
        headers.insert("Content-Type", HeaderValue::from_static("text/plain"));

        let captured = capture_headers(&headers);
        assert_eq!(captured.get("set-cookie").unwrap(), "a=1,b=2");
        assert_eq!(captured.get("content-type").unwrap(), "text/plain");
        assert_eq!(captured.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn completed_transaction_carries_ttfb_and_duration() {
        let mut transaction = RecordingTransaction::started(
            1,
            RequestIdentifier::new("GET", "http://www.example.com/"),
        );
        tokio::time::advance(Duration::from_millis(120)).await;
        transaction.response_started_at = Some(Instant::now());
        tokio::time::advance(Duration::from_millis(300)).await;
        transaction.response_ended_at = Some(Instant::now());
        transaction.status_code = Some(200);
        transaction.content = BytesMut::from(&b"ok"[..]);

        let converted = transaction.into_transaction();
        assert_eq!(converted.method, "get");
        assert_eq!(converted.ttfb_ms, 120);
        assert_eq!(converted.duration_ms, Some(300.0));
        assert_eq!(converted.content.as_deref(), Some(&b"ok"[..]));
        assert_eq!(converted.status_code, Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn transaction_without_response_has_zero_timing_and_keeps_error() {
        let mut transaction = RecordingTransaction::started(
            7,
            RequestIdentifier::new("get", "https://down.example.com/"),
        );
        transaction.error = Some(RecordedError {
            kind: "PROXY_TO_SERVER_REQUEST_ERROR",
            message: "connection refused".to_owned(),
        });

        let converted = transaction.into_transaction();
        assert_eq!(converted.ttfb_ms, 0);
        assert_eq!(converted.duration_ms, None);
        assert_eq!(converted.content, None);
        assert!(converted.raw_headers.is_empty());
        assert_eq!(converted.error_message.as_deref(), Some("connection refused"));
    }
}
