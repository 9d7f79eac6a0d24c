//! Bridge Core - reliable delivery of measurements to InfluxDB
//!
//! Producers submit points; the bridge buffers, batches and writes them to
//! the database, surviving outages without unbounded memory growth.
//!
//! # Architecture
//!
//! - **Buffer**: bounded FIFO with a block, drop-oldest or drop-newest policy
//! - **Batcher**: cuts the buffer into sequenced batches by size or age
//! - **Writer**: line protocol over HTTP with backoff and a circuit breaker
//! - **Dead letters**: batches that cannot be delivered, kept on disk for replay

pub mod batcher;
pub mod buffer;
pub mod config;
pub mod deadletter;
pub mod line_protocol;
pub mod metrics;
pub mod pipeline;
pub mod writer;

mod error;
mod types;

pub use error::{BridgeError, Result};
pub use types::*;

/// Bridge version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
