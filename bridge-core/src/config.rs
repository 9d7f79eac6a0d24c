//! Bridge configuration
//!
//! Every section is optional in the JSON file; missing values fall back to
//! the constants below.

use crate::batcher::BatchConfig;
use crate::buffer::{BufferConfig, DropPolicy};
use crate::deadletter::DeadLetterConfig;
use crate::pipeline::PipelineConfig;
use crate::writer::{CircuitConfig, InfluxConfig, RetryPolicy, WriterConfig};
use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Buffered points (10K)
pub const BUFFER_CAPACITY: usize = 10_000;

/// Blocking enqueue deadline
pub const ENQUEUE_TIMEOUT_MS: u64 = 1_000;

/// Points per batch
pub const BATCH_MAX_POINTS: usize = 5_000;

/// Longest wait for a full batch
pub const BATCH_MAX_WAIT_MS: u64 = 1_000;

/// Batches queued between batcher and writer
pub const MAX_IN_FLIGHT_BATCHES: usize = 4;

/// Attempts per batch, including the first
pub const RETRY_MAX_ATTEMPTS: u32 = 5;

pub const RETRY_BASE_DELAY_MS: u64 = 200;

pub const RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Jitter as a fraction of the backoff delay
pub const RETRY_JITTER: f64 = 0.2;

/// Failed batches the writer holds before it stops taking new ones
pub const MAX_PENDING_RETRIES: usize = 16;

/// Consecutive failures that open the circuit
pub const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;

pub const CIRCUIT_COOLDOWN_MS: u64 = 10_000;

/// Per-request timeout
pub const REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Dead-letter segment size (16MB)
pub const DEAD_LETTER_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// Shutdown drain deadline
pub const DRAIN_TIMEOUT_MS: u64 = 30_000;

/// HTTP ingestion listen address
pub const LISTEN_ADDR: &str = "0.0.0.0:8186";

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub buffer: BufferSection,
    pub batch: BatchSection,
    pub retry: RetrySection,
    pub circuit: CircuitSection,
    pub influx: InfluxSection,
    pub dead_letter: DeadLetterSection,
    pub server: ServerSection,
    pub ingest: IngestSection,
    pub shutdown: ShutdownSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSection {
    pub capacity: usize,
    pub drop_policy: DropPolicy,
    pub enqueue_timeout_ms: u64,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            capacity: BUFFER_CAPACITY,
            drop_policy: DropPolicy::Block,
            enqueue_timeout_ms: ENQUEUE_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    pub max_points: usize,
    pub max_wait_ms: u64,
    pub max_in_flight_batches: usize,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            max_points: BATCH_MAX_POINTS,
            max_wait_ms: BATCH_MAX_WAIT_MS,
            max_in_flight_batches: MAX_IN_FLIGHT_BATCHES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub max_pending_retries: usize,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_delay_ms: RETRY_BASE_DELAY_MS,
            max_delay_ms: RETRY_MAX_DELAY_MS,
            jitter: RETRY_JITTER,
            max_pending_retries: MAX_PENDING_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSection {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
}

impl Default for CircuitSection {
    fn default() -> Self {
        Self {
            failure_threshold: CIRCUIT_FAILURE_THRESHOLD,
            cooldown_ms: CIRCUIT_COOLDOWN_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxSection {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for InfluxSection {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            org: String::new(),
            bucket: String::new(),
            token: None,
            request_timeout_ms: REQUEST_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterSection {
    pub dir: PathBuf,
    pub segment_size: usize,
}

impl Default for DeadLetterSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/dead-letter"),
            segment_size: DEAD_LETTER_SEGMENT_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: LISTEN_ADDR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub default_tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownSection {
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            drain_timeout_ms: DRAIN_TIMEOUT_MS,
        }
    }
}

impl BridgeConfig {
    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("cannot read {:?}: {}", path, e)))?;
        Self::from_json(&data)
    }

    /// Parse and validate a JSON document
    pub fn from_json(data: &str) -> Result<Self> {
        let config: BridgeConfig =
            serde_json::from_str(data).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let checks: [(bool, &str); 9] = [
            (self.buffer.capacity > 0, "buffer.capacity must be positive"),
            (self.batch.max_points > 0, "batch.max_points must be positive"),
            (
                self.batch.max_in_flight_batches > 0,
                "batch.max_in_flight_batches must be positive",
            ),
            (self.retry.max_attempts > 0, "retry.max_attempts must be positive"),
            (
                self.retry.max_pending_retries > 0,
                "retry.max_pending_retries must be positive",
            ),
            (
                self.retry.base_delay_ms <= self.retry.max_delay_ms,
                "retry.base_delay_ms exceeds retry.max_delay_ms",
            ),
            (
                (0.0..=1.0).contains(&self.retry.jitter),
                "retry.jitter must be between 0.0 and 1.0",
            ),
            (
                self.circuit.failure_threshold > 0,
                "circuit.failure_threshold must be positive",
            ),
            (
                self.dead_letter.segment_size > 0,
                "dead_letter.segment_size must be positive",
            ),
        ];
        if let Some((_, message)) = checks.iter().find(|(ok, _)| !ok) {
            return Err(BridgeError::Config(message.to_string()));
        }
        let line_break = |s: &str| s.contains(['\n', '\r']);
        for (key, value) in &self.ingest.default_tags {
            if key.is_empty() || value.is_empty() {
                return Err(BridgeError::Config(format!(
                    "ingest.default_tags entry {:?} has an empty key or value",
                    key
                )));
            }
            if line_break(key) || line_break(value) {
                return Err(BridgeError::Config(format!(
                    "ingest.default_tags entry {:?} contains a line break",
                    key
                )));
            }
        }
        self.listen_addr()?;
        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen
            .parse()
            .map_err(|e| BridgeError::Config(format!("server.listen {:?}: {}", self.server.listen, e)))
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            buffer: BufferConfig {
                capacity: self.buffer.capacity,
                drop_policy: self.buffer.drop_policy,
                enqueue_timeout: Duration::from_millis(self.buffer.enqueue_timeout_ms),
            },
            batch: BatchConfig {
                max_points: self.batch.max_points,
                max_wait: Duration::from_millis(self.batch.max_wait_ms),
                max_in_flight_batches: self.batch.max_in_flight_batches,
            },
            writer: self.writer(),
            drain_timeout: Duration::from_millis(self.shutdown.drain_timeout_ms),
            default_tags: self.ingest.default_tags.clone(),
        }
    }

    pub fn writer(&self) -> WriterConfig {
        WriterConfig {
            retry: RetryPolicy {
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                jitter: self.retry.jitter,
            },
            circuit: CircuitConfig {
                failure_threshold: self.circuit.failure_threshold,
                cooldown: Duration::from_millis(self.circuit.cooldown_ms),
            },
            request_timeout: Duration::from_millis(self.influx.request_timeout_ms),
            max_pending_retries: self.retry.max_pending_retries,
        }
    }

    pub fn influx(&self) -> InfluxConfig {
        InfluxConfig {
            url: self.influx.url.clone(),
            org: self.influx.org.clone(),
            bucket: self.influx.bucket.clone(),
            token: self.influx.token.clone(),
            request_timeout: Duration::from_millis(self.influx.request_timeout_ms),
        }
    }

    pub fn dead_letter(&self) -> DeadLetterConfig {
        DeadLetterConfig {
            dir: self.dead_letter.dir.clone(),
            segment_size: self.dead_letter.segment_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = BridgeConfig::from_json("{}").unwrap();
        assert_eq!(config.buffer.capacity, BUFFER_CAPACITY);
        assert_eq!(config.retry.max_attempts, RETRY_MAX_ATTEMPTS);
        assert_eq!(config.listen_addr().unwrap().port(), 8186);

        let pipeline = config.pipeline();
        assert_eq!(pipeline.batch.max_wait, Duration::from_millis(BATCH_MAX_WAIT_MS));
        assert_eq!(pipeline.drain_timeout, Duration::from_millis(DRAIN_TIMEOUT_MS));
    }

    #[test]
    fn test_partial_sections() {
        let config = BridgeConfig::from_json(
            r#"{
                "buffer": { "capacity": 50, "drop_policy": "drop_oldest" },
                "influx": { "url": "http://db:8086", "org": "helium", "bucket": "miners" },
                "ingest": { "default_tags": { "entity_id": "bridge-1", "version": "1" } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.buffer.capacity, 50);
        assert_eq!(config.buffer.drop_policy, DropPolicy::DropOldest);
        assert_eq!(config.buffer.enqueue_timeout_ms, ENQUEUE_TIMEOUT_MS);
        assert_eq!(config.influx().bucket, "miners");
        assert_eq!(config.influx().token, None);
        assert_eq!(config.pipeline().default_tags.len(), 2);
    }

    #[test]
    fn test_validation() {
        let zero = BridgeConfig::from_json(r#"{ "retry": { "max_attempts": 0 } }"#);
        assert!(matches!(zero, Err(BridgeError::Config(_))));

        let inverted =
            BridgeConfig::from_json(r#"{ "retry": { "base_delay_ms": 500, "max_delay_ms": 100 } }"#);
        assert!(matches!(inverted, Err(BridgeError::Config(_))));

        let listen = BridgeConfig::from_json(r#"{ "server": { "listen": "nowhere" } }"#);
        assert!(matches!(listen, Err(BridgeError::Config(_))));

        let policy = BridgeConfig::from_json(r#"{ "buffer": { "drop_policy": "drop_all" } }"#);
        assert!(matches!(policy, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_default_tags_validation() {
        let ok = BridgeConfig::from_json(r#"{ "ingest": { "default_tags": { "region": "eu west" } } }"#);
        assert!(ok.is_ok());

        for bad in [
            r#"{ "ingest": { "default_tags": { "": "eu" } } }"#,
            r#"{ "ingest": { "default_tags": { "region": "" } } }"#,
            r#"{ "ingest": { "default_tags": { "reg\nion": "eu" } } }"#,
            r#"{ "ingest": { "default_tags": { "region": "eu\r\nwest" } } }"#,
        ] {
            assert!(matches!(BridgeConfig::from_json(bad), Err(BridgeError::Config(_))), "{}", bad);
        }
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        std::fs::write(&path, r#"{ "circuit": { "cooldown_ms": 250 } }"#).unwrap();

        let config = BridgeConfig::from_file(&path).unwrap();
        assert_eq!(config.writer().circuit.cooldown, Duration::from_millis(250));

        let missing = BridgeConfig::from_file(dir.path().join("absent.json"));
        assert!(matches!(missing, Err(BridgeError::Config(_))));
    }
}
