//! Dead-letter log writer

use super::{encode_record, parse_segment_id, segment_name, DeadLetter, DeadLetterConfig, DeadLetterReader, DeadLetterSink};
use crate::{BridgeError, Result};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{info, warn};

/// Segmented append-only dead-letter log
pub struct DeadLetterLog {
    config: DeadLetterConfig,
    inner: Mutex<LogInner>,
}

struct LogInner {
    file: BufWriter<File>,
    segment_id: u64,
    bytes_written: usize,
}

impl DeadLetterLog {
    /// Open the log, appending to the latest segment.
    ///
    /// A torn record at the end of the latest segment is cut off. If that
    /// segment is corrupt, appends go to a fresh segment instead.
    pub fn open(config: DeadLetterConfig) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        let latest = Self::find_latest_segment(&config.dir)?;
        let segment_id = Self::recover_segment(&config.dir, latest)?;
        let file = Self::open_segment(&config.dir, segment_id)?;
        let bytes_written = file.metadata()?.len() as usize;

        Ok(Self {
            config,
            inner: Mutex::new(LogInner {
                file: BufWriter::new(file),
                segment_id,
                bytes_written,
            }),
        })
    }

    /// Append a dead letter and sync it to disk
    pub fn append(&self, letter: &DeadLetter) -> Result<()> {
        let serialized = encode_record(letter)?;
        let mut inner = self.inner.lock();

        if inner.bytes_written > 0
            && inner.bytes_written + serialized.len() > self.config.segment_size
        {
            self.rotate_segment(&mut inner)?;
        }

        inner.file.write_all(&serialized)?;
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        inner.bytes_written += serialized.len();

        Ok(())
    }

    pub fn config(&self) -> &DeadLetterConfig {
        &self.config
    }

    /// Get current segment ID
    pub fn current_segment(&self) -> u64 {
        self.inner.lock().segment_id
    }

    /// Start a new segment so later appends do not mix with existing ones.
    ///
    /// Returns the ID of the new segment.
    pub fn seal(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.bytes_written > 0 {
            self.rotate_segment(&mut inner)?;
        }
        Ok(inner.segment_id)
    }

    /// Delete a sealed segment
    pub fn remove_segment(&self, segment_id: u64) -> Result<()> {
        if segment_id >= self.current_segment() {
            return Err(BridgeError::InvalidFormat(format!(
                "segment {} is still open for appends",
                segment_id
            )));
        }
        fs::remove_file(self.config.dir.join(segment_name(segment_id)))?;
        Ok(())
    }

    fn rotate_segment(&self, inner: &mut LogInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;

        inner.segment_id += 1;
        let file = Self::open_segment(&self.config.dir, inner.segment_id)?;
        inner.file = BufWriter::new(file);
        inner.bytes_written = 0;

        info!(segment = inner.segment_id, "Rotated dead-letter segment");
        Ok(())
    }

    fn recover_segment(dir: &Path, segment_id: u64) -> Result<u64> {
        let path = dir.join(segment_name(segment_id));
        if !path.exists() {
            return Ok(segment_id);
        }

        let segment = DeadLetterReader::read_segment(segment_id, &path)?;
        if segment.complete {
            Ok(segment_id)
        } else if segment.torn {
            warn!(
                segment = segment_id,
                valid_len = segment.valid_len,
                "Cutting torn record off dead-letter segment"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(segment.valid_len)?;
            file.sync_all()?;
            Ok(segment_id)
        } else {
            warn!(
                segment = segment_id,
                "Dead-letter segment is corrupt, appending to a new segment"
            );
            Ok(segment_id + 1)
        }
    }

    fn find_latest_segment(dir: &Path) -> Result<u64> {
        let mut max_id = 0u64;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_segment_id)
            {
                max_id = max_id.max(id);
            }
        }
        Ok(max_id)
    }

    fn open_segment(dir: &Path, segment_id: u64) -> Result<File> {
        let path = dir.join(segment_name(segment_id));
        Ok(OpenOptions::new().create(true).append(true).open(path)?)
    }
}

impl DeadLetterSink for DeadLetterLog {
    fn send(&self, letter: DeadLetter) -> Result<()> {
        warn!(
            sequence = letter.sequence,
            reason = %letter.reason,
            points = letter.points.len(),
            attempts = letter.attempts,
            error = %letter.last_error,
            "Dead-lettering batch"
        );
        self.append(&letter)
    }
}
