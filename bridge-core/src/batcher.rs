//! Batcher: drains the buffer into sequenced batches for the writer

use crate::buffer::BoundedBuffer;
use crate::writer::CircuitBreaker;
use crate::Batch;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Batching configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Most points in one batch
    pub max_points: usize,
    /// Longest a partial batch waits for more points
    pub max_wait: Duration,
    /// Capacity of the channel to the writer
    pub max_in_flight_batches: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_points: crate::config::BATCH_MAX_POINTS,
            max_wait: Duration::from_millis(crate::config::BATCH_MAX_WAIT_MS),
            max_in_flight_batches: crate::config::MAX_IN_FLIGHT_BATCHES,
        }
    }
}

/// Pulls points out of the buffer and hands numbered batches to the writer
pub struct Batcher {
    buffer: Arc<BoundedBuffer>,
    breaker: Arc<CircuitBreaker>,
    config: BatchConfig,
    next_sequence: u64,
}

impl Batcher {
    pub fn new(buffer: Arc<BoundedBuffer>, breaker: Arc<CircuitBreaker>, config: BatchConfig) -> Self {
        Self {
            buffer,
            breaker,
            config,
            next_sequence: 1,
        }
    }

    /// Run until the buffer is closed and empty, the writer goes away, or
    /// `cancel` fires. Returns the number of batches handed over.
    ///
    /// A channel slot is reserved before points leave the buffer, so a
    /// cancelled batcher never holds points that are in neither place.
    pub async fn run(mut self, batches: mpsc::Sender<Batch>, cancel: CancellationToken) -> u64 {
        let mut sent = 0u64;

        loop {
            if let Some(wait) = self.breaker.retry_in() {
                debug!(wait_ms = wait.as_millis() as u64, "Circuit open, pausing batcher");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => continue,
                }
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = batches.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        info!("Writer stopped, batcher exiting");
                        break;
                    }
                },
            };

            let points = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                points = self.buffer.dequeue_batch(self.config.max_points, self.config.max_wait) => points,
            };

            if points.is_empty() {
                if self.buffer.is_closed() {
                    break;
                }
                trace!("Idle tick");
                continue;
            }

            let batch = Batch::new(self.next_sequence, points);
            self.next_sequence += 1;
            debug!(sequence = batch.sequence, points = batch.len(), "Batch formed");
            permit.send(batch);
            sent += 1;
        }

        debug!(batches = sent, "Batcher finished");
        sent
    }
}
