//! Line protocol decoder

use super::Precision;
use crate::{now_nanos, BridgeError, FieldValue, Point, PointBuilder, Result};

/// Decode nanosecond-precision line protocol
pub fn decode(data: &str) -> Result<Vec<Point>> {
    decode_with_precision(data, Precision::Nanoseconds)
}

/// Decode line protocol whose timestamps use `precision`.
///
/// Blank lines and `#` comments are skipped. Lines without a timestamp are
/// stamped with the current time.
pub fn decode_with_precision(data: &str, precision: Precision) -> Result<Vec<Point>> {
    let mut points = Vec::new();

    for (idx, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let point = parse_line(line, precision).map_err(|message| BridgeError::Parse {
            line: idx + 1,
            message,
        })?;
        points.push(point);
    }

    Ok(points)
}

fn parse_line(line: &str, precision: Precision) -> std::result::Result<Point, String> {
    // Format: measurement,tag1=val1,tag2=val2 field1=val1,field2=val2 timestamp
    let mut cursor = Cursor::new(line);

    let measurement = cursor.read_escaped(&[',', ' '])?;
    if measurement.is_empty() {
        return Err("missing measurement".into());
    }
    let mut builder = PointBuilder::new(measurement);

    while cursor.eat(',') {
        let key = cursor.read_escaped(&['=', ',', ' '])?;
        if !cursor.eat('=') {
            return Err(format!("tag {:?} has no value", key));
        }
        let value = cursor.read_escaped(&[',', ' '])?;
        builder = builder.with_tag(key, value);
    }

    if !cursor.eat(' ') {
        return Err("missing field set".into());
    }

    loop {
        let key = cursor.read_escaped(&['=', ',', ' '])?;
        if !cursor.eat('=') {
            return Err(format!("field {:?} has no value", key));
        }
        let value = if cursor.peek() == Some('"') {
            FieldValue::String(cursor.read_quoted()?)
        } else {
            parse_field_value(&cursor.read_raw(&[',', ' ']))?
        };
        builder = builder.with_field(key, value);

        if !cursor.eat(',') {
            break;
        }
    }

    let rest = cursor.rest().trim();
    let timestamp = if rest.is_empty() {
        now_nanos()
    } else {
        rest.parse::<i64>()
            .ok()
            .and_then(|ts| ts.checked_mul(precision.multiplier()))
            .ok_or_else(|| format!("invalid timestamp {:?}", rest))?
    };

    builder.at(timestamp).build().map_err(|e| e.to_string())
}

fn parse_field_value(s: &str) -> std::result::Result<FieldValue, String> {
    // Boolean
    match s {
        "t" | "T" | "true" | "True" | "TRUE" => return Ok(FieldValue::Boolean(true)),
        "f" | "F" | "false" | "False" | "FALSE" => return Ok(FieldValue::Boolean(false)),
        _ => {}
    }

    // Integer (ends with 'i')
    if let Some(n) = s.strip_suffix('i') {
        return n
            .parse::<i64>()
            .map(FieldValue::Integer)
            .map_err(|_| format!("invalid integer {:?}", s));
    }

    // Unsigned (ends with 'u'), narrowed to i64
    if let Some(n) = s.strip_suffix('u') {
        return n
            .parse::<u64>()
            .ok()
            .and_then(|n| i64::try_from(n).ok())
            .map(FieldValue::Integer)
            .ok_or_else(|| format!("invalid or out of range unsigned {:?}", s));
    }

    // Float (default)
    match s.parse::<f64>() {
        Ok(n) if n.is_finite() => Ok(FieldValue::Float(n)),
        _ => Err(format!("invalid field value {:?}", s)),
    }
}

struct Cursor<'a> {
    line: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(line: &'a str) -> Self {
        Self { line, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.line[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.pos += expected.len_utf8();
            true
        } else {
            false
        }
    }

    fn rest(&self) -> &'a str {
        &self.line[self.pos..]
    }

    /// Read up to the first unescaped stop character, removing escapes
    fn read_escaped(&mut self, stops: &[char]) -> std::result::Result<String, String> {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if stops.contains(&c) {
                break;
            }
            self.bump();
            if c == '\\' {
                match self.bump() {
                    Some(escaped) => out.push(escaped),
                    None => return Err("dangling escape at end of line".into()),
                }
            } else {
                out.push(c);
            }
        }
        Ok(out)
    }

    /// Read up to the first stop character, verbatim
    fn read_raw(&mut self, stops: &[char]) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if stops.contains(&c) {
                break;
            }
            self.bump();
        }
        self.line[start..self.pos].to_string()
    }

    fn read_quoted(&mut self) -> std::result::Result<String, String> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some(c @ ('"' | '\\')) => out.push(c),
                    Some(c) => {
                        out.push('\\');
                        out.push(c);
                    }
                    None => return Err("unterminated string field".into()),
                },
                Some(c) => out.push(c),
                None => return Err("unterminated string field".into()),
            }
        }
    }
}
