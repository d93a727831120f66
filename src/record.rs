//! Record normalization
//!
//! The host collector hands over records as untyped msgpack maps. Before any
//! routing decision they are normalized into a string-keyed `serde_json` map:
//! binary values become UTF-8 strings (no base64 detour), nested maps and
//! arrays are converted recursively, and non-string map keys are silently
//! dropped.

use serde_json::Value;

/// A normalized log record: string keys, JSON-model values.
pub type Record = serde_json::Map<String, Value>;

/// Normalize a raw msgpack record into a [`Record`].
///
/// Anything that is not a map at the top level yields an empty record.
pub fn normalize(raw: &rmpv::Value) -> Record {
    match raw {
        rmpv::Value::Map(entries) => normalize_map(entries),
        _ => Record::new(),
    }
}

fn normalize_map(entries: &[(rmpv::Value, rmpv::Value)]) -> Record {
    let mut record = Record::new();
    for (key, value) in entries {
        // Non-string keys violate the forward protocol; drop them rather
        // than fail the whole record.
        let Some(key) = value_as_string(key) else {
            continue;
        };
        record.insert(key, normalize_value(value));
    }
    record
}

/// Convert one msgpack value into the canonical JSON model.
pub fn normalize_value(raw: &rmpv::Value) -> Value {
    match raw {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(*b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                Value::from(n)
            } else if let Some(n) = i.as_u64() {
                Value::from(n)
            } else {
                Value::String(i.to_string())
            }
        }
        rmpv::Value::F32(f) => serde_json::Number::from_f64(f64::from(*f))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        rmpv::Value::F64(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        rmpv::Value::String(s) => Value::String(lossy_utf8(s.as_bytes())),
        rmpv::Value::Binary(bytes) => Value::String(lossy_utf8(bytes)),
        rmpv::Value::Array(values) => Value::Array(values.iter().map(normalize_value).collect()),
        rmpv::Value::Map(entries) => Value::Object(normalize_map(entries)),
        rmpv::Value::Ext(code, bytes) => {
            let mut fields = serde_json::Map::new();
            fields.insert("msgpack_extension_code".to_string(), Value::from(*code));
            fields.insert("bytes".to_string(), Value::String(lossy_utf8(bytes)));
            Value::Object(fields)
        }
    }
}

fn value_as_string(value: &rmpv::Value) -> Option<String> {
    match value {
        rmpv::Value::String(s) => s.as_str().map(str::to_string),
        _ => None,
    }
}

fn lossy_utf8(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Render a JSON value the way it should appear in a label value or a
/// single-field line: strings verbatim, everything else in its compact
/// JSON form.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Remove the given top-level keys from the record.
pub fn remove_keys<S: AsRef<str>>(record: &mut Record, keys: &[S]) {
    for key in keys {
        record.remove(key.as_ref());
    }
}
