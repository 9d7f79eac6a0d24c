//! Batch writer with retry, circuit breaking and dead-lettering
//!
//! [`Writer::write`] is a single attempt. [`Writer::run`] is the long-lived
//! task fed by the batcher: it keeps failed batches as [`WriteAttempt`]s in a
//! pending queue and retries them when their backoff expires, and it stops
//! taking new batches while that queue is full.

mod circuit;
mod retry;
mod transport;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState};
pub use retry::RetryPolicy;
pub use transport::{classify_status, HttpTransport, InfluxConfig, Transport};

use crate::deadletter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::line_protocol;
use crate::metrics::SharedMetrics;
use crate::{Batch, BridgeError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DRAIN_EXCEEDED: &str = "drain deadline exceeded";

/// Writer configuration
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub retry: RetryPolicy,
    pub circuit: CircuitConfig,
    /// Upper bound on one transmission, separate from backoff delays
    pub request_timeout: Duration,
    /// Failed batches held for retry before new batches stop being accepted
    pub max_pending_retries: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            circuit: CircuitConfig::default(),
            request_timeout: Duration::from_millis(crate::config::REQUEST_TIMEOUT_MS),
            max_pending_retries: crate::config::MAX_PENDING_RETRIES,
        }
    }
}

/// A batch on its way to the database
#[derive(Debug)]
pub struct WriteAttempt {
    pub batch: Batch,
    /// Attempts that reached the transport
    pub attempts: u32,
    pub last_error: Option<String>,
    due: Instant,
}

impl WriteAttempt {
    pub fn new(batch: Batch) -> Self {
        Self {
            batch,
            attempts: 0,
            last_error: None,
            due: Instant::now(),
        }
    }

    /// When the attempt may be made
    pub fn due(&self) -> Instant {
        self.due
    }
}

/// How a batch left the writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Committed,
    DeadLettered(DeadLetterReason),
}

/// Writes batches to the database through a [`Transport`]
pub struct Writer<T: Transport> {
    transport: T,
    breaker: Arc<CircuitBreaker>,
    config: WriterConfig,
    dead_letters: Arc<dyn DeadLetterSink>,
    metrics: SharedMetrics,
}

impl<T: Transport> Writer<T> {
    pub fn new(
        transport: T,
        config: WriterConfig,
        dead_letters: Arc<dyn DeadLetterSink>,
        metrics: SharedMetrics,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.circuit.clone(), metrics.clone()));
        Self {
            transport,
            breaker,
            config,
            dead_letters,
            metrics,
        }
    }

    /// The breaker guarding this writer's endpoint
    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    /// Make one attempt to write `batch`.
    ///
    /// Fails with [`BridgeError::CircuitOpen`] without touching the network
    /// while the breaker is open.
    pub async fn write(&self, batch: &Batch) -> Result<()> {
        let payload = line_protocol::encode_batch(batch)?;

        self.breaker.try_acquire()?;

        let result = match timeout(self.config.request_timeout, self.transport.send(payload)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::RetryableTransport(format!(
                "request timed out after {:?}",
                self.config.request_timeout
            ))),
        };

        match &result {
            Ok(()) => self.breaker.record_success(),
            Err(e) if e.is_retryable() => self.breaker.record_failure(),
            // A permanent rejection still proves the endpoint is up
            Err(_) => self.breaker.record_success(),
        }

        result
    }

    /// Deliver one batch, waiting out backoffs inline
    pub async fn deliver(&self, batch: Batch) -> Delivery {
        let mut attempt = WriteAttempt::new(batch);
        loop {
            let result = self.write(&attempt.batch).await;
            match self.settle(attempt, result) {
                Settled::Done(delivery) => return delivery,
                Settled::Retry(next) => {
                    sleep_until(next.due).await;
                    attempt = next;
                }
            }
        }
    }

    /// Consume batches until the channel closes and every pending attempt is
    /// settled, or until `cancel` fires.
    ///
    /// On cancellation, pending and queued batches are dead-lettered with
    /// [`DeadLetterReason::Shutdown`]. A transmission already under way is
    /// never interrupted. Returns the number of batches abandoned that way.
    pub async fn run(self, mut batches: mpsc::Receiver<Batch>, cancel: CancellationToken) -> usize {
        let mut pending: Vec<WriteAttempt> = Vec::new();
        let mut accepting = true;

        loop {
            if !accepting && pending.is_empty() {
                break;
            }

            let next_due = pending.iter().map(|a| a.due).min();
            let room = pending.len() < self.config.max_pending_retries.max(1);

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    batches.close();
                    let mut count = 0;
                    for attempt in pending {
                        let error = attempt.last_error.as_deref().unwrap_or(DRAIN_EXCEEDED);
                        self.dead_letter(attempt.batch, DeadLetterReason::Shutdown, attempt.attempts, error);
                        count += 1;
                    }
                    while let Ok(batch) = batches.try_recv() {
                        self.dead_letter(batch, DeadLetterReason::Shutdown, 0, DRAIN_EXCEEDED);
                        count += 1;
                    }
                    if count > 0 {
                        warn!(batches = count, "Writer cancelled with undelivered batches");
                    }
                    return count;
                }

                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    let idx = pending
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, a)| a.due)
                        .map(|(idx, _)| idx)
                        .unwrap_or(0);
                    let attempt = pending.swap_remove(idx);
                    let result = self.write(&attempt.batch).await;
                    if let Settled::Retry(next) = self.settle(attempt, result) {
                        pending.push(next);
                    }
                }

                batch = batches.recv(), if accepting && room => match batch {
                    Some(batch) => {
                        let attempt = WriteAttempt::new(batch);
                        let result = self.write(&attempt.batch).await;
                        if let Settled::Retry(next) = self.settle(attempt, result) {
                            pending.push(next);
                        }
                    }
                    None => {
                        accepting = false;
                        if !pending.is_empty() {
                            info!(pending = pending.len(), "Batch channel closed, flushing retries");
                        }
                    }
                },
            }
        }

        debug!("Writer finished");
        0
    }

    fn settle(&self, mut attempt: WriteAttempt, result: Result<()>) -> Settled {
        match result {
            Ok(()) => {
                attempt.attempts += 1;
                debug!(
                    sequence = attempt.batch.sequence,
                    points = attempt.batch.len(),
                    attempts = attempt.attempts,
                    "Batch committed"
                );
                self.metrics.batch_written(attempt.batch.len());
                Settled::Done(Delivery::Committed)
            }
            Err(BridgeError::CircuitOpen { retry_in }) => {
                // no request was made, so no attempt is spent
                attempt.due = Instant::now() + retry_in;
                Settled::Retry(attempt)
            }
            Err(e) if e.is_retryable() => {
                attempt.attempts += 1;
                let message = e.to_string();
                if self.config.retry.allows_another(attempt.attempts) {
                    let delay = self.config.retry.delay_for(attempt.attempts);
                    warn!(
                        sequence = attempt.batch.sequence,
                        attempt = attempt.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Write failed, retrying"
                    );
                    self.metrics.write_retried();
                    attempt.last_error = Some(message);
                    attempt.due = Instant::now() + delay;
                    Settled::Retry(attempt)
                } else {
                    let reason = DeadLetterReason::RetriesExhausted;
                    self.dead_letter(attempt.batch, reason, attempt.attempts, &message);
                    Settled::Done(Delivery::DeadLettered(reason))
                }
            }
            Err(e @ BridgeError::Encoding(_)) => {
                let reason = DeadLetterReason::Encoding;
                self.dead_letter(attempt.batch, reason, attempt.attempts, &e.to_string());
                Settled::Done(Delivery::DeadLettered(reason))
            }
            Err(e) => {
                attempt.attempts += 1;
                let reason = DeadLetterReason::NonRetryable;
                self.dead_letter(attempt.batch, reason, attempt.attempts, &e.to_string());
                Settled::Done(Delivery::DeadLettered(reason))
            }
        }
    }

    fn dead_letter(&self, batch: Batch, reason: DeadLetterReason, attempts: u32, error: &str) {
        let sequence = batch.sequence;
        let points = batch.len();
        self.metrics.batch_dead_lettered(points);
        if let Err(e) = self
            .dead_letters
            .send(DeadLetter::new(batch, reason, attempts, error))
        {
            error!(sequence, points, "Failed to store dead letter: {}", e);
        }
    }
}

enum Settled {
    Done(Delivery),
    Retry(WriteAttempt),
}
