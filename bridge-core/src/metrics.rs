//! Pipeline counters
//!
//! Components never touch process-wide state; they report through a
//! [`MetricsSink`] handed to them at construction.

use crate::writer::CircuitState;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Receiver of pipeline observations
pub trait MetricsSink: Send + Sync {
    /// Points accepted into the buffer
    fn points_ingested(&self, count: u64);
    /// Points evicted or refused by a drop policy
    fn points_dropped(&self, count: u64);
    /// Points still buffered when the drain deadline passed
    fn points_lost(&self, count: u64);
    /// A batch was committed by the database
    fn batch_written(&self, points: usize);
    /// A batch was routed to the dead-letter sink
    fn batch_dead_lettered(&self, points: usize);
    /// A write attempt failed and was rescheduled
    fn write_retried(&self);
    /// The circuit breaker changed state
    fn circuit_transition(&self, from: CircuitState, to: CircuitState);
    /// Current number of buffered points
    fn buffer_occupancy(&self, occupancy: usize);
}

/// Shared handle to a metrics sink
pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Atomic counter implementation of [`MetricsSink`]
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    points_ingested: AtomicU64,
    points_dropped: AtomicU64,
    points_lost: AtomicU64,
    batches_written: AtomicU64,
    points_written: AtomicU64,
    batches_dead_lettered: AtomicU64,
    points_dead_lettered: AtomicU64,
    write_retries: AtomicU64,
    circuit_opened: AtomicU64,
    circuit_half_opened: AtomicU64,
    circuit_closed: AtomicU64,
    buffer_occupancy: AtomicU64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a snapshot of current counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            points_ingested: self.points_ingested.load(Ordering::Relaxed),
            points_dropped: self.points_dropped.load(Ordering::Relaxed),
            points_lost: self.points_lost.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            batches_dead_lettered: self.batches_dead_lettered.load(Ordering::Relaxed),
            points_dead_lettered: self.points_dead_lettered.load(Ordering::Relaxed),
            write_retries: self.write_retries.load(Ordering::Relaxed),
            circuit_opened: self.circuit_opened.load(Ordering::Relaxed),
            circuit_half_opened: self.circuit_half_opened.load(Ordering::Relaxed),
            circuit_closed: self.circuit_closed.load(Ordering::Relaxed),
            buffer_occupancy: self.buffer_occupancy.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSink for PipelineMetrics {
    fn points_ingested(&self, count: u64) {
        self.points_ingested.fetch_add(count, Ordering::Relaxed);
    }

    fn points_dropped(&self, count: u64) {
        self.points_dropped.fetch_add(count, Ordering::Relaxed);
    }

    fn points_lost(&self, count: u64) {
        self.points_lost.fetch_add(count, Ordering::Relaxed);
    }

    fn batch_written(&self, points: usize) {
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        self.points_written.fetch_add(points as u64, Ordering::Relaxed);
    }

    fn batch_dead_lettered(&self, points: usize) {
        self.batches_dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.points_dead_lettered.fetch_add(points as u64, Ordering::Relaxed);
    }

    fn write_retried(&self) {
        self.write_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn circuit_transition(&self, _from: CircuitState, to: CircuitState) {
        let counter = match to {
            CircuitState::Open => &self.circuit_opened,
            CircuitState::HalfOpen => &self.circuit_half_opened,
            CircuitState::Closed => &self.circuit_closed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn buffer_occupancy(&self, occupancy: usize) {
        self.buffer_occupancy.store(occupancy as u64, Ordering::Relaxed);
    }
}

/// A snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub points_ingested: u64,
    pub points_dropped: u64,
    pub points_lost: u64,
    pub batches_written: u64,
    pub points_written: u64,
    pub batches_dead_lettered: u64,
    pub points_dead_lettered: u64,
    pub write_retries: u64,
    pub circuit_opened: u64,
    pub circuit_half_opened: u64,
    pub circuit_closed: u64,
    pub buffer_occupancy: u64,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable string
    pub fn format(&self) -> String {
        format!(
            "Ingested: {}, Dropped: {}, Lost: {}, Written: {} points in {} batches, \
             Dead-lettered: {} points in {} batches, Retries: {}, Buffered: {}",
            self.points_ingested,
            self.points_dropped,
            self.points_lost,
            self.points_written,
            self.batches_written,
            self.points_dead_lettered,
            self.batches_dead_lettered,
            self.write_retries,
            self.buffer_occupancy
        )
    }
}
