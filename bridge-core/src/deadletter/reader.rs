//! Dead-letter log reader

use super::{decode_record, parse_segment_id, DeadLetter, DeadLetterConfig};
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One segment as read back from disk
#[derive(Debug)]
pub struct SegmentRead {
    pub segment_id: u64,
    pub letters: Vec<DeadLetter>,
    /// Bytes covered by whole, valid records
    pub valid_len: u64,
    /// Every byte of the segment decoded
    pub complete: bool,
    /// The segment ends in a partial record
    pub torn: bool,
}

/// Reads dead letters back for inspection or replay
pub struct DeadLetterReader {
    config: DeadLetterConfig,
}

impl DeadLetterReader {
    pub fn new(config: DeadLetterConfig) -> Self {
        Self { config }
    }

    /// Read every dead letter, oldest segment first
    pub fn read_all(&self) -> Result<Vec<DeadLetter>> {
        self.read_before(u64::MAX)
    }

    /// Read dead letters from segments older than `segment_id`
    pub fn read_before(&self, segment_id: u64) -> Result<Vec<DeadLetter>> {
        Ok(self
            .read_segments_before(segment_id)?
            .into_iter()
            .flat_map(|segment| segment.letters)
            .collect())
    }

    /// Read segments older than `segment_id`, reporting how far each decoded.
    ///
    /// A segment that cannot be opened comes back empty and incomplete.
    pub fn read_segments_before(&self, segment_id: u64) -> Result<Vec<SegmentRead>> {
        let mut segments = Vec::new();

        for (id, path) in self.find_segments()? {
            if id >= segment_id {
                continue;
            }
            match Self::read_segment(id, &path) {
                Ok(segment) => {
                    info!(
                        "Read {} dead letters from {:?}",
                        segment.letters.len(),
                        path
                    );
                    segments.push(segment);
                }
                Err(e) => {
                    warn!("Error reading segment {:?}: {}", path, e);
                    segments.push(SegmentRead {
                        segment_id: id,
                        letters: Vec::new(),
                        valid_len: 0,
                        complete: false,
                        torn: false,
                    });
                }
            }
        }

        Ok(segments)
    }

    fn find_segments(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();

        if !self.config.dir.exists() {
            return Ok(segments);
        }

        for entry in fs::read_dir(&self.config.dir)? {
            let path = entry?.path();
            let id = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_segment_id);
            if let Some(id) = id {
                segments.push((id, path));
            }
        }

        segments.sort_by_key(|(id, _)| *id);
        Ok(segments)
    }

    pub(super) fn read_segment(segment_id: u64, path: &Path) -> Result<SegmentRead> {
        let data = fs::read(path)?;

        let mut letters = Vec::new();
        let mut offset = 0;
        let mut torn = false;

        while offset < data.len() {
            match decode_record(&data[offset..]) {
                Ok(Some((letter, bytes_read))) => {
                    letters.push(letter);
                    offset += bytes_read;
                }
                Ok(None) => {
                    // Incomplete record at end (crash during write)
                    warn!("Torn record at offset {} in {:?}", offset, path);
                    torn = true;
                    break;
                }
                Err(e) if e.is_corruption() => {
                    warn!("{} at offset {} in {:?}, stopping", e, offset, path);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(SegmentRead {
            segment_id,
            letters,
            valid_len: offset as u64,
            complete: offset == data.len(),
            torn,
        })
    }
}
