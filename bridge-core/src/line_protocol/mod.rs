//! InfluxDB line protocol
//!
//! ```text
//! measurement[,tag=value...] field=value[,field=value...] [timestamp]
//! ```
//!
//! The encoder is the wire format of the writer. The decoder exists for the
//! HTTP ingestion surface and for checking encoder output.

mod decoder;
mod encoder;

pub use decoder::{decode, decode_with_precision};
pub use encoder::{encode, encode_batch, encode_point};

/// Timestamp precision of incoming line protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl Precision {
    /// Parse the `precision` query parameter value
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ns" | "n" => Some(Precision::Nanoseconds),
            "us" | "u" => Some(Precision::Microseconds),
            "ms" => Some(Precision::Milliseconds),
            "s" => Some(Precision::Seconds),
            _ => None,
        }
    }

    /// Factor converting a timestamp in this precision to nanoseconds
    pub fn multiplier(&self) -> i64 {
        match self {
            Precision::Nanoseconds => 1,
            Precision::Microseconds => 1_000,
            Precision::Milliseconds => 1_000_000,
            Precision::Seconds => 1_000_000_000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Nanoseconds => "ns",
            Precision::Microseconds => "us",
            Precision::Milliseconds => "ms",
            Precision::Seconds => "s",
        }
    }
}
