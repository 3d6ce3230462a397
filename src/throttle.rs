use std::{
    collections::BTreeMap,
    future::Future as _,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, Weak},
    task::{Context, Poll, ready},
    time::Duration,
};

use bytes::Bytes;
use hyper::body::{Body, Frame};
use tokio::{
    task::JoinHandle,
    time::{Instant, Sleep},
};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Bandwidth shape for a proxy session's responses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleSettings {
    pub mbps: f64,
    pub flush_interval: Duration,
    pub retry_interval: Duration,
}

impl ThrottleSettings {
    pub fn from_mbps(mbps: f64) -> Self {
        Self {
            mbps,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ThrottleError {
    #[error("throttle is not started")]
    NotStarted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub consumed: u64,
    pub carryover: u64,
}

/// Bytes admitted during one refill interval, stamped with the interval's
/// scheduled end relative to `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleLog {
    pub elapsed_ms: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleReport {
    pub max_bytes_per_unit: u64,
    pub avg_mib_per_unit: f64,
}

#[derive(Debug, Default)]
struct ThrottleState {
    current_bytes: u64,
    started: bool,
    logs: Vec<ThrottleLog>,
}

/// Byte budget shared by every response stream of a proxy session.
///
/// Streams call [`Throttle::check_and_stack`] before forwarding a chunk. Once
/// the interval budget is spent further chunks are refused until the refill
/// task runs; overshoot from the last admitted chunk is carried into the next
/// interval instead of being forgiven.
#[derive(Debug)]
pub struct Throttle {
    limit_bytes: u64,
    flush_interval: Duration,
    state: Mutex<ThrottleState>,
    refill_task: Mutex<Option<JoinHandle<()>>>,
}

impl Throttle {
    pub fn new(limit_bytes: u64, flush_interval: Duration) -> Self {
        Self {
            limit_bytes,
            flush_interval,
            state: Mutex::new(ThrottleState::default()),
            refill_task: Mutex::new(None),
        }
    }

    pub fn from_mbps(mbps: f64, flush_interval: Duration) -> Self {
        let bytes_per_sec = mbps * 1024.0 * 1024.0 / 8.0;
        let limit_bytes = (bytes_per_sec * flush_interval.as_secs_f64()).floor().max(0.0) as u64;
        Self::new(limit_bytes, flush_interval)
    }

    pub fn limit_bytes(&self) -> u64 {
        self.limit_bytes
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    fn state(&self) -> MutexGuard<'_, ThrottleState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn compute_capacity(&self) -> Capacity {
        capacity_of(self.state().current_bytes, self.limit_bytes)
    }

    /// Spawns the refill task. Calling it on a running throttle does nothing.
    pub fn start(self: &Arc<Self>) {
        let mut refill_task = self
            .refill_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if refill_task.is_some() {
            return;
        }
        self.state().started = true;

        let throttle: Weak<Self> = Arc::downgrade(self);
        let period = self.flush_interval.max(Duration::from_millis(1));
        *refill_task = Some(tokio::spawn(async move {
            let origin = Instant::now();
            let mut ticker = tokio::time::interval_at(origin + period, period);
            loop {
                let tick = ticker.tick().await;
                let Some(throttle) = throttle.upgrade() else {
                    break;
                };
                throttle.refill(tick.duration_since(origin));
            }
        }));
        tracing::debug!(
            limit_bytes = self.limit_bytes,
            flush_interval_ms = self.flush_interval.as_millis() as u64,
            "throttle started"
        );
    }

    pub fn stop(&self) {
        let task = self
            .refill_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.state().started = false;
    }

    fn refill(&self, elapsed: Duration) {
        let mut state = self.state();
        let capacity = capacity_of(state.current_bytes, self.limit_bytes);
        state.logs.push(ThrottleLog {
            elapsed_ms: elapsed.as_millis() as u64,
            bytes: capacity.consumed,
        });
        state.current_bytes = capacity.carryover;
    }

    /// Admits `bytes` when the current interval still has budget left.
    pub fn check_and_stack(&self, bytes: u64) -> Result<bool, ThrottleError> {
        let mut state = self.state();
        if !state.started {
            return Err(ThrottleError::NotStarted);
        }
        if state.current_bytes >= self.limit_bytes {
            return Ok(false);
        }
        state.current_bytes += bytes;
        Ok(true)
    }

    pub fn logs(&self) -> Vec<ThrottleLog> {
        self.state().logs.clone()
    }

    pub fn report(&self, unit: Duration) -> ThrottleReport {
        let unit_ms = (unit.as_millis() as u64).max(1);
        let mut per_unit: BTreeMap<u64, u64> = BTreeMap::new();
        for log in &self.state().logs {
            *per_unit.entry(log.elapsed_ms / unit_ms).or_default() += log.bytes;
        }

        let max_bytes_per_unit = per_unit.values().copied().max().unwrap_or(0);
        let avg_mib_per_unit = if per_unit.is_empty() {
            0.0
        } else {
            let total: u64 = per_unit.values().sum();
            (total / per_unit.len() as u64) as f64 / 1024.0 / 1024.0
        };
        ThrottleReport {
            max_bytes_per_unit,
            avg_mib_per_unit,
        }
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        if let Some(task) = self
            .refill_task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

fn capacity_of(current_bytes: u64, limit_bytes: u64) -> Capacity {
    let consumed = current_bytes.min(limit_bytes);
    Capacity {
        consumed,
        carryover: current_bytes - consumed,
    }
}

/// Response body that forwards each data frame only once the shared
/// [`Throttle`] admits it, re-checking every `retry_interval`.
pub struct ThrottledBody<B> {
    inner: B,
    throttle: Arc<Throttle>,
    retry_interval: Duration,
    pending: Option<Bytes>,
    retry: Option<Pin<Box<Sleep>>>,
}

impl<B> ThrottledBody<B> {
    pub fn new(inner: B, throttle: Arc<Throttle>, retry_interval: Duration) -> Self {
        Self {
            inner,
            throttle,
            retry_interval,
            pending: None,
            retry: None,
        }
    }
}

impl<B> Body for ThrottledBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: From<ThrottleError>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            if this.pending.is_none() {
                match ready!(Pin::new(&mut this.inner).poll_frame(cx)) {
                    Some(Ok(frame)) => match frame.into_data() {
                        Ok(data) if data.is_empty() => continue,
                        Ok(data) => this.pending = Some(data),
                        Err(frame) => return Poll::Ready(Some(Ok(frame))),
                    },
                    finished => return Poll::Ready(finished),
                }
            }

            if let Some(retry) = this.retry.as_mut() {
                ready!(retry.as_mut().poll(cx));
                this.retry = None;
            }

            let len = this.pending.as_ref().map_or(0, |data| data.len() as u64);
            match this.throttle.check_and_stack(len) {
                Ok(true) => {
                    return Poll::Ready(this.pending.take().map(|data| Ok(Frame::data(data))));
                }
                Ok(false) => {
                    this.retry = Some(Box::pin(tokio::time::sleep(this.retry_interval)));
                }
                Err(err) => {
                    this.pending = None;
                    return Poll::Ready(Some(Err(err.into())));
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.pending.is_none() && self.inner.is_end_stream()
    }
}
