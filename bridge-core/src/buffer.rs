//! Bounded point buffer between ingestion and the batcher

use crate::metrics::SharedMetrics;
use crate::{BridgeError, Point, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

/// What `enqueue` does when the buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicy {
    /// Wait for space until the enqueue deadline, then fail
    #[default]
    Block,
    /// Evict the oldest buffered point to make space
    DropOldest,
    /// Discard the incoming point
    DropNewest,
}

/// Buffer configuration
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum number of buffered points
    pub capacity: usize,
    /// Behaviour on a full buffer
    pub drop_policy: DropPolicy,
    /// Default deadline for a blocking enqueue
    pub enqueue_timeout: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: crate::config::BUFFER_CAPACITY,
            drop_policy: DropPolicy::default(),
            enqueue_timeout: Duration::from_millis(crate::config::ENQUEUE_TIMEOUT_MS),
        }
    }
}

struct BufferInner {
    queue: VecDeque<Point>,
    closed: bool,
}

/// Capacity-limited FIFO of points.
///
/// The queue and the closed flag live under one mutex; producers waiting for
/// space and the consumer waiting for points are woken through `Notify`.
pub struct BoundedBuffer {
    inner: Mutex<BufferInner>,
    capacity: usize,
    policy: DropPolicy,
    enqueue_timeout: Duration,
    not_empty: Notify,
    not_full: Notify,
    dropped: AtomicU64,
    metrics: SharedMetrics,
}

impl BoundedBuffer {
    /// Create a new buffer
    pub fn new(config: BufferConfig, metrics: SharedMetrics) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            inner: Mutex::new(BufferInner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            policy: config.drop_policy,
            enqueue_timeout: config.enqueue_timeout,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            dropped: AtomicU64::new(0),
            metrics,
        }
    }

    /// Enqueue with the configured deadline
    pub async fn enqueue(&self, point: Point) -> Result<()> {
        self.enqueue_timeout(point, self.enqueue_timeout).await
    }

    /// Enqueue a point.
    ///
    /// Under [`DropPolicy::Block`] this waits up to `timeout` for space and
    /// then fails with [`BridgeError::BackpressureTimeout`]. The drop
    /// policies never wait.
    pub async fn enqueue_timeout(&self, point: Point, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            // Register before checking so a dequeue between the check and the
            // await still wakes us
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(BridgeError::Closed);
                }

                if inner.queue.len() < self.capacity {
                    inner.queue.push_back(point);
                    let len = inner.queue.len();
                    drop(inner);
                    self.pushed(len);
                    return Ok(());
                }

                match self.policy {
                    DropPolicy::Block => {}
                    DropPolicy::DropOldest => {
                        inner.queue.pop_front();
                        inner.queue.push_back(point);
                        let len = inner.queue.len();
                        drop(inner);
                        self.record_drop();
                        self.pushed(len);
                        return Ok(());
                    }
                    DropPolicy::DropNewest => {
                        drop(inner);
                        self.record_drop();
                        return Ok(());
                    }
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Err(BridgeError::BackpressureTimeout(timeout));
            }
        }
    }

    /// Take up to `max_n` points.
    ///
    /// Returns as soon as `max_n` points are buffered, the buffer is closed,
    /// or `max_wait` elapses, whichever comes first. The result may be empty.
    pub async fn dequeue_batch(&self, max_n: usize, max_wait: Duration) -> Vec<Point> {
        let max_n = max_n.max(1);
        let deadline = Instant::now() + max_wait;

        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.queue.len() >= max_n || inner.closed {
                    return self.take(&mut inner, max_n);
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                let mut inner = self.inner.lock();
                return self.take(&mut inner, max_n);
            }
        }
    }

    /// Stop accepting points and wake every waiter
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
    }

    /// Remove and return everything still buffered
    pub fn drain_remaining(&self) -> Vec<Point> {
        let mut inner = self.inner.lock();
        let len = inner.queue.len();
        self.take(&mut inner, len.max(1))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Get the current number of buffered points
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> DropPolicy {
        self.policy
    }

    /// Points evicted or refused by the drop policy
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn take(&self, inner: &mut BufferInner, max_n: usize) -> Vec<Point> {
        let n = max_n.min(inner.queue.len());
        let points: Vec<Point> = inner.queue.drain(..n).collect();
        let len = inner.queue.len();
        if n > 0 {
            self.not_full.notify_waiters();
        }
        self.metrics.buffer_occupancy(len);
        points
    }

    fn pushed(&self, len: usize) {
        self.metrics.points_ingested(1);
        self.metrics.buffer_occupancy(len);
        self.not_empty.notify_waiters();
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.metrics.points_dropped(1);
    }
}
