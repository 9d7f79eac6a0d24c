//! Resubmission of dead-lettered batches

use super::{DeadLetterLog, DeadLetterReader};
use crate::writer::{Delivery, Transport, Writer};
use crate::Result;
use serde::Serialize;
use tracing::{info, warn};

/// Outcome of a replay run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Letters read from segments that decoded completely
    pub letters: usize,
    pub delivered: usize,
    /// Letters that failed again and were appended anew
    pub dead_lettered: usize,
    pub segments_removed: usize,
    /// Segments left on disk because they did not decode completely
    pub segments_kept: usize,
}

/// Resubmit every dead letter recorded so far through `writer`.
///
/// The log is sealed first, so batches that fail again land in a fresh
/// segment. A replayed segment is deleted once all of its letters are
/// settled. Segments that do not decode completely are neither replayed nor
/// deleted. `writer` should dead-letter into `log`.
pub async fn replay<T: Transport>(log: &DeadLetterLog, writer: &Writer<T>) -> Result<ReplayReport> {
    let sealed = log.seal()?;
    let segments = DeadLetterReader::new(log.config().clone()).read_segments_before(sealed)?;

    let mut report = ReplayReport::default();
    for segment in segments {
        if !segment.complete {
            warn!(
                segment = segment.segment_id,
                readable = segment.letters.len(),
                valid_len = segment.valid_len,
                "Dead-letter segment is damaged, keeping it for inspection"
            );
            report.segments_kept += 1;
            continue;
        }

        report.letters += segment.letters.len();
        for letter in segment.letters {
            let sequence = letter.sequence;
            match writer.deliver(letter.into_batch()).await {
                Delivery::Committed => report.delivered += 1,
                Delivery::DeadLettered(reason) => {
                    warn!(sequence, %reason, "Replayed batch failed again");
                    report.dead_lettered += 1;
                }
            }
        }

        log.remove_segment(segment.segment_id)?;
        report.segments_removed += 1;
    }

    info!(
        letters = report.letters,
        delivered = report.delivered,
        dead_lettered = report.dead_lettered,
        segments_removed = report.segments_removed,
        segments_kept = report.segments_kept,
        "Replay finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadletter::{encode_record, segment_name, DeadLetter, DeadLetterConfig, DeadLetterReason};
    use crate::metrics::PipelineMetrics;
    use crate::writer::{classify_status, WriterConfig};
    use crate::{Batch, Point};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Rejects any payload for the `broken` measurement
    struct PickyInflux;

    impl Transport for PickyInflux {
        async fn send(&self, payload: Bytes) -> Result<()> {
            if payload.starts_with(b"broken") {
                classify_status(400, "unknown measurement")
            } else {
                classify_status(204, "")
            }
        }
    }

    /// Accepts everything and records the timestamps it saw
    #[derive(Default)]
    struct CountingInflux {
        sequences: Mutex<Vec<u64>>,
    }

    impl Transport for Arc<CountingInflux> {
        async fn send(&self, payload: Bytes) -> Result<()> {
            let text = String::from_utf8_lossy(&payload);
            for line in text.lines() {
                if let Some(ts) = line.rsplit(' ').next().and_then(|t| t.parse().ok()) {
                    self.sequences.lock().push(ts);
                }
            }
            Ok(())
        }
    }

    fn letter(sequence: u64, measurement: &str) -> DeadLetter {
        let point = Point::builder(measurement)
            .with_field("value", sequence as i64)
            .at(sequence as i64)
            .build()
            .unwrap();
        DeadLetter::new(
            Batch::new(sequence, vec![point]),
            DeadLetterReason::RetriesExhausted,
            5,
            "503",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_delivers_and_keeps_failures() {
        let temp_dir = TempDir::new().unwrap();
        let config = DeadLetterConfig {
            dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let log = Arc::new(DeadLetterLog::open(config.clone()).unwrap());
        log.append(&letter(1, "ok")).unwrap();
        log.append(&letter(2, "broken")).unwrap();
        log.append(&letter(3, "ok")).unwrap();

        let writer = Writer::new(
            PickyInflux,
            WriterConfig::default(),
            log.clone(),
            Arc::new(PipelineMetrics::new()),
        );
        let report = replay(&log, &writer).await.unwrap();
        assert_eq!(report.letters, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.segments_removed, 1);

        let remaining = DeadLetterReader::new(config).read_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].sequence, 2);
        assert_eq!(remaining[0].reason, DeadLetterReason::NonRetryable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_after_crash_keeps_later_letters() {
        let temp_dir = TempDir::new().unwrap();
        let config = DeadLetterConfig {
            dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };

        {
            let log = DeadLetterLog::open(config.clone()).unwrap();
            log.append(&letter(1, "ok")).unwrap();
        }
        // crash halfway through the second record
        let partial = encode_record(&letter(2, "ok")).unwrap();
        let path = temp_dir.path().join(segment_name(0));
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&partial[..partial.len() / 2]).unwrap();
        drop(file);

        let log = Arc::new(DeadLetterLog::open(config.clone()).unwrap());
        log.append(&letter(3, "ok")).unwrap();

        let transport = Arc::new(CountingInflux::default());
        let writer = Writer::new(
            transport.clone(),
            WriterConfig::default(),
            log.clone(),
            Arc::new(PipelineMetrics::new()),
        );
        let report = replay(&log, &writer).await.unwrap();
        assert_eq!(report.letters, 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.segments_removed, 1);
        assert_eq!(*transport.sequences.lock(), vec![1, 3]);
        assert!(DeadLetterReader::new(config).read_all().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_keeps_corrupt_segment() {
        let temp_dir = TempDir::new().unwrap();
        let config = DeadLetterConfig {
            dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };

        {
            let log = DeadLetterLog::open(config.clone()).unwrap();
            log.append(&letter(1, "ok")).unwrap();
            log.append(&letter(2, "ok")).unwrap();
        }
        let path = temp_dir.path().join(segment_name(0));
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 10;
        data[last] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let log = Arc::new(DeadLetterLog::open(config).unwrap());
        let transport = Arc::new(CountingInflux::default());
        let writer = Writer::new(
            transport.clone(),
            WriterConfig::default(),
            log.clone(),
            Arc::new(PipelineMetrics::new()),
        );
        let report = replay(&log, &writer).await.unwrap();
        assert_eq!(report.segments_kept, 1);
        assert_eq!(report.segments_removed, 0);
        assert_eq!(report.delivered, 0);
        assert!(transport.sequences.lock().is_empty());
        assert_eq!(fs::read(&path).unwrap(), data);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_empty_log() {
        let temp_dir = TempDir::new().unwrap();
        let log = Arc::new(
            DeadLetterLog::open(DeadLetterConfig {
                dir: temp_dir.path().to_path_buf(),
                ..Default::default()
            })
            .unwrap(),
        );
        let writer = Writer::new(
            PickyInflux,
            WriterConfig::default(),
            log.clone(),
            Arc::new(PipelineMetrics::new()),
        );

        let report = replay(&log, &writer).await.unwrap();
        assert_eq!(report, ReplayReport::default());
    }
}
