//! Pipeline coordinator - wires buffer, batcher and writer together

use crate::batcher::{BatchConfig, Batcher};
use crate::buffer::{BoundedBuffer, BufferConfig, DropPolicy};
use crate::deadletter::DeadLetterSink;
use crate::metrics::SharedMetrics;
use crate::writer::{CircuitBreaker, CircuitState, Transport, Writer, WriterConfig};
use crate::{Point, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub buffer: BufferConfig,
    pub batch: BatchConfig,
    pub writer: WriterConfig,
    /// Time allowed for draining on shutdown
    pub drain_timeout: Duration,
    /// Tags added to every submitted point that lacks them
    pub default_tags: BTreeMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            batch: BatchConfig::default(),
            writer: WriterConfig::default(),
            drain_timeout: Duration::from_millis(crate::config::DRAIN_TIMEOUT_MS),
            default_tags: BTreeMap::new(),
        }
    }
}

/// What happened during shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Batches the batcher handed to the writer over the pipeline's life
    pub batches_formed: u64,
    /// Batches dead-lettered because the drain deadline passed
    pub abandoned_batches: usize,
    /// Points still buffered when the drain deadline passed
    pub lost_points: usize,
    /// Whether the drain deadline was hit
    pub timed_out: bool,
}

/// Point-in-time view of the pipeline
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub buffered: usize,
    pub capacity: usize,
    pub drop_policy: DropPolicy,
    pub dropped: u64,
    pub circuit: CircuitState,
    pub closed: bool,
}

/// Cloneable ingestion handle
#[derive(Clone)]
pub struct PipelineHandle {
    buffer: Arc<BoundedBuffer>,
    breaker: Arc<CircuitBreaker>,
    default_tags: Arc<BTreeMap<String, String>>,
}

impl PipelineHandle {
    /// Submit a point, waiting at most the configured enqueue timeout
    pub async fn submit(&self, point: Point) -> Result<()> {
        self.buffer.enqueue(self.tagged(point)).await
    }

    /// Submit a point with an explicit enqueue deadline
    pub async fn submit_timeout(&self, point: Point, timeout: Duration) -> Result<()> {
        self.buffer.enqueue_timeout(self.tagged(point), timeout).await
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            buffered: self.buffer.len(),
            capacity: self.buffer.capacity(),
            drop_policy: self.buffer.policy(),
            dropped: self.buffer.dropped_count(),
            circuit: self.breaker.state(),
            closed: self.buffer.is_closed(),
        }
    }

    fn tagged(&self, point: Point) -> Point {
        if self.default_tags.is_empty() {
            point
        } else {
            point.with_default_tags(&self.default_tags)
        }
    }
}

/// A running pipeline: one batcher task and one writer task
pub struct Pipeline {
    handle: PipelineHandle,
    batcher: JoinHandle<u64>,
    writer: JoinHandle<usize>,
    cancel: CancellationToken,
    drain_timeout: Duration,
    metrics: SharedMetrics,
}

impl Pipeline {
    /// Spawn the pipeline tasks on the current runtime
    pub fn start<T: Transport>(
        config: PipelineConfig,
        transport: T,
        dead_letters: Arc<dyn DeadLetterSink>,
        metrics: SharedMetrics,
    ) -> Self {
        let buffer = Arc::new(BoundedBuffer::new(config.buffer.clone(), metrics.clone()));
        let writer = Writer::new(transport, config.writer.clone(), dead_letters, metrics.clone());
        let breaker = writer.breaker();
        let batcher = Batcher::new(buffer.clone(), breaker.clone(), config.batch.clone());

        let (tx, rx) = mpsc::channel(config.batch.max_in_flight_batches.max(1));
        let cancel = CancellationToken::new();

        info!(
            capacity = buffer.capacity(),
            policy = ?buffer.policy(),
            max_points = config.batch.max_points,
            max_attempts = config.writer.retry.max_attempts,
            "Pipeline started"
        );

        let batcher = tokio::spawn(batcher.run(tx, cancel.clone()));
        let writer = tokio::spawn(writer.run(rx, cancel.clone()));

        Self {
            handle: PipelineHandle {
                buffer,
                breaker,
                default_tags: Arc::new(config.default_tags),
            },
            batcher,
            writer,
            cancel,
            drain_timeout: config.drain_timeout,
            metrics,
        }
    }

    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Stop accepting points and drain.
    ///
    /// Buffered and pending batches are written within the retry budget
    /// until the drain deadline. Past it, the tasks are cancelled, pending
    /// batches are dead-lettered and points still buffered are counted lost.
    pub async fn shutdown(self) -> ShutdownReport {
        let Pipeline {
            handle,
            mut batcher,
            mut writer,
            cancel,
            drain_timeout,
            metrics,
        } = self;

        info!(
            buffered = handle.buffer.len(),
            drain_timeout_ms = drain_timeout.as_millis() as u64,
            "Draining pipeline"
        );
        handle.buffer.close();
        let deadline = Instant::now() + drain_timeout;
        let mut timed_out = false;

        let batches_formed = match timeout_at(deadline, &mut batcher).await {
            Ok(joined) => joined_or(joined, "batcher", 0),
            Err(_) => {
                timed_out = true;
                cancel.cancel();
                joined_or(batcher.await, "batcher", 0)
            }
        };

        let abandoned_batches = match timeout_at(deadline, &mut writer).await {
            Ok(joined) => joined_or(joined, "writer", 0),
            Err(_) => {
                timed_out = true;
                cancel.cancel();
                joined_or(writer.await, "writer", 0)
            }
        };

        let lost_points = handle.buffer.drain_remaining().len();
        if lost_points > 0 {
            metrics.points_lost(lost_points as u64);
        }

        let report = ShutdownReport {
            batches_formed,
            abandoned_batches,
            lost_points,
            timed_out,
        };
        if timed_out {
            warn!(
                abandoned_batches,
                lost_points, "Drain deadline exceeded, pipeline stopped"
            );
        } else {
            info!(batches = batches_formed, "Pipeline drained");
        }
        report
    }
}

fn joined_or<T>(joined: std::result::Result<T, JoinError>, task: &str, fallback: T) -> T {
    joined.unwrap_or_else(|e| {
        error!("{} task failed: {}", task, e);
        fallback
    })
}
