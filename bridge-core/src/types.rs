//! Core types for the bridge

use crate::{BridgeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// Current wall-clock time in nanoseconds
pub fn now_nanos() -> Timestamp {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// Possible field value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// 64-bit float
    Float(f64),
    /// 64-bit signed integer
    Integer(i64),
    /// Boolean
    Boolean(bool),
    /// String
    String(String),
}

impl FieldValue {
    /// Get the size in bytes
    pub fn size(&self) -> usize {
        match self {
            FieldValue::Float(_) => 8,
            FieldValue::Integer(_) => 8,
            FieldValue::Boolean(_) => 1,
            FieldValue::String(s) => s.len(),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Boolean(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

/// One measurement: name, tags, typed fields and a timestamp.
///
/// A `Point` can only be obtained through [`PointBuilder::build`], which
/// enforces that there is at least one field, that tag and field keys do not
/// overlap, that names and keys are non-empty and that the timestamp is not
/// negative. There are no mutating accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    name: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Timestamp,
}

impl Point {
    /// Start building a point for the given measurement
    pub fn builder(name: impl Into<String>) -> PointBuilder {
        PointBuilder::new(name)
    }

    /// Measurement name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tags in lexicographic key order
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Get a tag value
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Fields in lexicographic key order
    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    /// Get a field value
    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// Timestamp in nanoseconds
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Return a copy carrying every default tag whose key is not already
    /// used by a tag or field of this point.
    pub fn with_default_tags(&self, defaults: &BTreeMap<String, String>) -> Point {
        let mut point = self.clone();
        for (k, v) in defaults {
            if !point.tags.contains_key(k) && !point.fields.contains_key(k) {
                point.tags.insert(k.clone(), v.clone());
            }
        }
        point
    }

    /// Get the size in bytes (approximate)
    pub fn size(&self) -> usize {
        self.name.len()
            + self.tags.iter().map(|(k, v)| k.len() + v.len()).sum::<usize>()
            + self.fields.iter().map(|(k, v)| k.len() + v.size()).sum::<usize>()
            + 8
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (k, v) in &self.tags {
            write!(f, ",{}={}", k, v)?;
        }
        write!(f, " ({} fields) @{}", self.fields.len(), self.timestamp)
    }
}

/// Builder for [`Point`]
#[derive(Debug, Clone)]
pub struct PointBuilder {
    name: String,
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, FieldValue>,
    timestamp: Option<Timestamp>,
}

impl PointBuilder {
    /// Create a builder for the given measurement
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp: None,
        }
    }

    /// Add a tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Add a field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Set the timestamp in nanoseconds. Defaults to the build time.
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set the timestamp from a UTC instant
    pub fn at_time(self, time: DateTime<Utc>) -> Self {
        let nanos = time.timestamp_nanos_opt().unwrap_or(-1);
        self.at(nanos)
    }

    /// Validate and produce the point
    pub fn build(self) -> Result<Point> {
        if self.name.is_empty() {
            return Err(BridgeError::Validation("empty measurement name".into()));
        }
        if self.fields.is_empty() {
            return Err(BridgeError::Validation(format!(
                "point '{}' has no fields",
                self.name
            )));
        }
        if self.tags.keys().chain(self.fields.keys()).any(|k| k.is_empty()) {
            return Err(BridgeError::Validation(format!(
                "point '{}' has an empty tag or field key",
                self.name
            )));
        }
        if let Some(k) = self.tags.keys().find(|k| self.fields.contains_key(*k)) {
            return Err(BridgeError::Validation(format!(
                "point '{}' uses '{}' as both tag and field",
                self.name, k
            )));
        }

        let timestamp = self.timestamp.unwrap_or_else(now_nanos);
        if timestamp < 0 {
            return Err(BridgeError::Validation(format!(
                "point '{}' has negative timestamp {}",
                self.name, timestamp
            )));
        }

        Ok(Point {
            name: self.name,
            tags: self.tags,
            fields: self.fields,
            timestamp,
        })
    }
}

/// Points collected in one flush cycle
#[derive(Debug, Clone)]
pub struct Batch {
    /// Monotonically increasing per process, starting at 1
    pub sequence: u64,
    /// When the batcher sealed the batch
    pub created_at: DateTime<Utc>,
    /// Points in dequeue order
    pub points: Vec<Point>,
}

impl Batch {
    /// Create a new batch
    pub fn new(sequence: u64, points: Vec<Point>) -> Self {
        Self {
            sequence,
            created_at: Utc::now(),
            points,
        }
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the batch carries no points
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_point() {
        let point = Point::builder("hbbft_perf")
            .with_tag("entity_id", "validator-1")
            .with_tag("version", "1.2.3")
            .with_field("penalty", 1.5)
            .with_field("bba_completions", 12i64)
            .at(1_609_459_200_000_000_000)
            .build()
            .unwrap();

        assert_eq!(point.name(), "hbbft_perf");
        assert_eq!(point.tag("entity_id"), Some("validator-1"));
        assert_eq!(point.field("bba_completions"), Some(&FieldValue::Integer(12)));
        assert_eq!(point.timestamp(), 1_609_459_200_000_000_000);
        let keys: Vec<_> = point.tags().keys().cloned().collect();
        assert_eq!(keys, vec!["entity_id", "version"]);
    }

    #[test]
    fn test_point_requires_field() {
        let result = Point::builder("cpu").with_tag("host", "a").at(1).build();
        assert!(matches!(result, Err(BridgeError::Validation(_))));
    }

    #[test]
    fn test_tag_field_overlap_rejected() {
        let result = Point::builder("cpu")
            .with_tag("host", "a")
            .with_field("host", 1i64)
            .at(1)
            .build();
        assert!(matches!(result, Err(BridgeError::Validation(_))));
    }

    #[test]
    fn test_negative_timestamp_rejected() {
        let result = Point::builder("cpu").with_field("v", 1.0).at(-5).build();
        assert!(matches!(result, Err(BridgeError::Validation(_))));
    }

    #[test]
    fn test_empty_names_rejected() {
        assert!(Point::builder("").with_field("v", 1.0).build().is_err());
        assert!(Point::builder("cpu").with_field("", 1.0).build().is_err());
        assert!(Point::builder("cpu").with_tag("", "x").with_field("v", 1.0).build().is_err());
    }

    #[test]
    fn test_default_timestamp_is_now() {
        let before = now_nanos();
        let point = Point::builder("cpu").with_field("v", true).build().unwrap();
        assert!(point.timestamp() >= before);
    }

    #[test]
    fn test_default_tags() {
        let point = Point::builder("cpu")
            .with_tag("host", "a")
            .with_field("region", "inline")
            .with_field("v", 1.0)
            .at(10)
            .build()
            .unwrap();

        let mut defaults = BTreeMap::new();
        defaults.insert("host".to_string(), "default".to_string());
        defaults.insert("region".to_string(), "eu".to_string());
        defaults.insert("dc".to_string(), "fra1".to_string());

        let tagged = point.with_default_tags(&defaults);
        assert_eq!(tagged.tag("host"), Some("a"));
        assert_eq!(tagged.tag("region"), None);
        assert_eq!(tagged.tag("dc"), Some("fra1"));
        assert_eq!(point.tag("dc"), None);
    }
}
