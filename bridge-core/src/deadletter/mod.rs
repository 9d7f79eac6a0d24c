//! Dead-letter sink for batches that could not be delivered
//!
//! The default sink is an append-only log of checksummed records split into
//! numbered segment files. Records carry the original points so a later
//! replay can resubmit them.

mod log;
mod reader;
mod record;
mod replay;

pub use log::DeadLetterLog;
pub use reader::{DeadLetterReader, SegmentRead};
pub use record::{decode_record, encode_record};
pub use replay::{replay, ReplayReport};

use crate::{Batch, Point, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Why a batch was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// The database rejected the batch permanently
    NonRetryable,
    /// Every allowed attempt failed
    RetriesExhausted,
    /// The batch could not be encoded
    Encoding,
    /// The drain deadline passed while the batch was still pending
    Shutdown,
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeadLetterReason::NonRetryable => "non_retryable",
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
            DeadLetterReason::Encoding => "encoding",
            DeadLetterReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// An undeliverable batch with the reason it was given up on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub sequence: u64,
    pub reason: DeadLetterReason,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
    pub points: Vec<Point>,
}

impl DeadLetter {
    pub fn new(
        batch: Batch,
        reason: DeadLetterReason,
        attempts: u32,
        last_error: impl Into<String>,
    ) -> Self {
        Self {
            sequence: batch.sequence,
            reason,
            attempts,
            last_error: last_error.into(),
            failed_at: Utc::now(),
            points: batch.points,
        }
    }

    /// Rebuild a batch for resubmission
    pub fn into_batch(self) -> Batch {
        Batch::new(self.sequence, self.points)
    }
}

/// Append-only destination for undeliverable batches
pub trait DeadLetterSink: Send + Sync {
    fn send(&self, letter: DeadLetter) -> Result<()>;
}

/// Dead-letter log configuration
#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    /// Directory holding the segment files
    pub dir: PathBuf,
    /// Maximum segment size in bytes
    pub segment_size: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/dead-letter"),
            segment_size: crate::config::DEAD_LETTER_SEGMENT_SIZE,
        }
    }
}

/// Keeps dead letters in memory; for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for MemoryDeadLetterSink {
    fn send(&self, letter: DeadLetter) -> Result<()> {
        self.letters.lock().push(letter);
        Ok(())
    }
}

fn segment_name(segment_id: u64) -> String {
    format!("dlq_{:020}.log", segment_id)
}

fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix("dlq_")
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_names() {
        assert_eq!(segment_name(7), "dlq_00000000000000000007.log");
        assert_eq!(parse_segment_id(&segment_name(42)), Some(42));
        assert_eq!(parse_segment_id("wal_1.log"), None);
    }

    #[test]
    fn test_letter_round_trips_batch() {
        let point = Point::builder("cpu").with_field("v", 1i64).at(3).build().unwrap();
        let batch = Batch::new(9, vec![point.clone()]);
        let letter = DeadLetter::new(batch, DeadLetterReason::RetriesExhausted, 5, "503");

        assert_eq!(letter.reason.to_string(), "retries_exhausted");
        let batch = letter.into_batch();
        assert_eq!(batch.sequence, 9);
        assert_eq!(batch.points, vec![point]);
    }
}
