//! Label extraction and dynamic host resolution
//!
//! Three strategies project record fields into labels: automatic Kubernetes
//! label promotion, explicit top-level keys, and a recursive mapping tree.
//! The same tree walk also resolves the dynamic destination key, so both
//! consumers share one traversal.

use crate::error::{Error, Result};
use crate::record::{value_to_string, Record};
use serde_json::Value;
use std::collections::btree_map;
use std::collections::BTreeMap;

/// A nested key -> (subtree | string leaf) mapping loaded from JSON config.
pub type MappingTree = serde_json::Map<String, Value>;

/// Validated label name/value pairs attached to a log line.
///
/// Insertion enforces the label grammar; invalid candidates are dropped
/// rather than surfaced as errors, so a `LabelSet` only ever holds valid
/// pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Insert a pair if both name and value pass validation.
    ///
    /// Returns whether the pair was accepted. An accepted pair replaces any
    /// previous value under the same name.
    pub fn insert_checked(&mut self, name: impl Into<String>, value: impl Into<String>) -> bool {
        let name = name.into();
        let value = value.into();
        if !is_valid_label_name(&name) || !is_valid_label_value(&value) {
            return false;
        }
        self.0.insert(name, value);
        true
    }

    /// Merge pairs from `other` that are not already present.
    ///
    /// Existing entries win, so automatic labels are never overwritten by
    /// explicitly extracted ones.
    pub fn merge_missing(&mut self, other: LabelSet) {
        for (name, value) in other.0 {
            self.0.entry(name).or_insert(value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a LabelSet {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<(String, String)> for LabelSet {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut set = LabelSet::new();
        for (name, value) in iter {
            set.insert_checked(name, value);
        }
        set
    }
}

/// Prometheus label name grammar: `[a-zA-Z_][a-zA-Z0-9_]*`.
fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Label values must be non-empty; UTF-8 safety is guaranteed by `&str`.
fn is_valid_label_value(value: &str) -> bool {
    !value.is_empty()
}

/// Promote the record's `kubernetes` sub-mapping into labels.
///
/// Entries under `kubernetes.labels` are flattened with `/`, `.` and `-`
/// replaced by `_`; `docker_id`, `pod_id` and `annotations` are skipped;
/// every other entry becomes a label of the same name.
///
/// Fails with [`Error::LabelExtraction`] when the record has no
/// `kubernetes` key. Callers report this and keep dispatching.
pub fn auto_kubernetes_labels(record: &Record, labels: &mut LabelSet) -> Result<()> {
    let Some(Value::Object(kube)) = record.get("kubernetes") else {
        return Err(Error::LabelExtraction);
    };

    for (key, value) in kube {
        match key.as_str() {
            "labels" => {
                if let Value::Object(pod_labels) = value {
                    for (name, v) in pod_labels {
                        let name: String = name
                            .chars()
                            .map(|c| if matches!(c, '/' | '.' | '-') { '_' } else { c })
                            .collect();
                        labels.insert_checked(name, value_to_string(v));
                    }
                }
            }
            "docker_id" | "pod_id" | "annotations" => {}
            _ => {
                labels.insert_checked(key.clone(), value_to_string(value));
            }
        }
    }

    Ok(())
}

/// Extract explicitly configured top-level keys as same-named labels.
pub fn extract_labels<S: AsRef<str>>(record: &Record, keys: &[S]) -> LabelSet {
    let mut labels = LabelSet::new();
    for key in keys {
        let key = key.as_ref();
        if let Some(value) = record.get(key) {
            labels.insert_checked(key, value_to_string(value));
        }
    }
    labels
}

/// Project record fields into labels according to a mapping tree.
///
/// Inner nodes descend into the record's same-named sub-mapping; a string
/// leaf names the destination label for the record field at that key.
pub fn map_labels(record: &Record, mapping: &MappingTree, labels: &mut LabelSet) {
    walk_mapping(record, mapping, &mut |record, key, leaf| {
        if let Some(value) = record_value(record, key) {
            labels.insert_checked(leaf, value);
        }
        false
    });
}

/// Resolve the dynamic destination key from the host-path mapping tree.
///
/// Returns the first record value found along the tree, in lexicographic
/// key order (the tree is a `serde_json` map, which iterates sorted), or
/// an empty string when nothing resolves. Empty means "use the default
/// client".
pub fn resolve_dynamic_host(record: &Record, mapping: Option<&MappingTree>) -> String {
    let Some(mapping) = mapping else {
        return String::new();
    };

    let mut host = String::new();
    walk_mapping(record, mapping, &mut |record, key, _leaf| {
        match record_value(record, key) {
            Some(value) => {
                host = value;
                true
            }
            None => false,
        }
    });
    host
}

/// Depth-first walk of a mapping tree in lock-step with the record.
///
/// `visit` is called for every string leaf with the record level reached,
/// the record key to read and the leaf string; returning `true` stops the
/// walk. Subtrees whose record counterpart is absent are skipped whole.
fn walk_mapping<F>(record: &Record, mapping: &MappingTree, visit: &mut F) -> bool
where
    F: FnMut(&Record, &str, &str) -> bool,
{
    for (key, node) in mapping {
        match node {
            Value::Object(subtree) => {
                if let Some(Value::Object(sub_record)) = record.get(key) {
                    if walk_mapping(sub_record, subtree, visit) {
                        return true;
                    }
                }
            }
            Value::String(leaf) => {
                if visit(record, key, leaf) {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

fn record_value(record: &Record, key: &str) -> Option<String> {
    record.get(key).map(value_to_string)
}
