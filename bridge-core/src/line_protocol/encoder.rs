//! Line protocol encoder

use crate::{Batch, BridgeError, FieldValue, Point, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Encode a batch into a line protocol payload
pub fn encode_batch(batch: &Batch) -> Result<Bytes> {
    encode(&batch.points)
}

/// Encode points, one line each, in the given order
pub fn encode(points: &[Point]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(points.iter().map(|p| p.size() + 32).sum());
    for point in points {
        encode_point(point, &mut buf)?;
    }
    Ok(buf.freeze())
}

/// Append one point followed by a newline.
///
/// On error nothing is appended.
pub fn encode_point(point: &Point, buf: &mut BytesMut) -> Result<()> {
    let mut line = String::with_capacity(point.size() + 32);

    // a leading '#' reads back as a comment and leading whitespace is trimmed
    if point
        .name()
        .starts_with(|c: char| c == '#' || (c.is_whitespace() && c != ' '))
    {
        line.push('\\');
    }
    write_escaped(&mut line, point.name(), &[',', ' '], "measurement")?;

    // BTreeMap iteration keeps tags and fields in lexicographic order
    for (key, value) in point.tags() {
        line.push(',');
        write_escaped(&mut line, key, &[',', '=', ' '], "tag key")?;
        line.push('=');
        write_escaped(&mut line, value, &[',', '=', ' '], "tag value")?;
    }

    let mut first = true;
    for (key, value) in point.fields() {
        line.push(if first { ' ' } else { ',' });
        first = false;
        write_escaped(&mut line, key, &[',', '=', ' '], "field key")?;
        line.push('=');
        write_field_value(&mut line, key, value)?;
    }

    line.push(' ');
    line.push_str(&point.timestamp().to_string());
    line.push('\n');

    buf.put_slice(line.as_bytes());
    Ok(())
}

fn write_escaped(out: &mut String, s: &str, special: &[char], what: &str) -> Result<()> {
    for c in s.chars() {
        if c == '\n' || c == '\r' {
            return Err(BridgeError::Encoding(format!(
                "{} {:?} contains a line break",
                what, s
            )));
        }
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    Ok(())
}

fn write_field_value(out: &mut String, key: &str, value: &FieldValue) -> Result<()> {
    match value {
        FieldValue::Float(v) => {
            if !v.is_finite() {
                return Err(BridgeError::Encoding(format!(
                    "field {:?} has non-finite float {}",
                    key, v
                )));
            }
            // Display for f64 is the shortest representation that round-trips
            out.push_str(&v.to_string());
        }
        FieldValue::Integer(v) => {
            out.push_str(&v.to_string());
            out.push('i');
        }
        FieldValue::Boolean(v) => out.push_str(if *v { "true" } else { "false" }),
        FieldValue::String(v) => {
            out.push('"');
            for c in v.chars() {
                match c {
                    '\n' | '\r' => {
                        return Err(BridgeError::Encoding(format!(
                            "string field {:?} contains a line break",
                            key
                        )))
                    }
                    '"' | '\\' => {
                        out.push('\\');
                        out.push(c);
                    }
                    _ => out.push(c),
                }
            }
            out.push('"');
        }
    }
    Ok(())
}
