//! Line encoding
//!
//! After labels are carved off, the remaining record is serialized into the
//! log line in one of two formats: compact JSON or logfmt-style sorted
//! `key=value` pairs.

use crate::error::{Error, Result};
use crate::record::{value_to_string, Record};
use serde_json::Value;

/// Output line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LineFormat {
    /// Compact JSON object
    #[default]
    Json,
    /// Space-separated `key=value` pairs, keys sorted ascending
    KeyValue,
}

/// Encode the record as a single log line.
pub fn encode_line(record: &Record, format: LineFormat) -> Result<String> {
    match format {
        LineFormat::Json => {
            serde_json::to_string(record).map_err(|e| Error::Encode(e.to_string()))
        }
        LineFormat::KeyValue => Ok(encode_key_value(record)),
    }
}

/// Logfmt-style encoding. The record map iterates in sorted key order, so
/// no extra sort pass is needed. Values that are not scalar are rendered
/// to their compact JSON form first and encoded as a plain string.
fn encode_key_value(record: &Record) -> String {
    let mut line = String::new();
    for (key, value) in record {
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(key);
        line.push('=');
        line.push_str(&quote_if_needed(&scalar_text(value)));
    }
    line
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => value_to_string(other),
    }
}

/// Quote a value if it is empty or contains characters that break the
/// `key=value` grammar; `"` and `\` are backslash-escaped inside quotes.
fn quote_if_needed(value: &str) -> String {
    let needs_quoting = value.is_empty()
        || value
            .chars()
            .any(|c| c == ' ' || c == '=' || c == '"' || c.is_control());
    if !needs_quoting {
        return value.to_string();
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}
