//! Configuration for REITTI
//!
//! The host collector hands configuration over as flat string key/value
//! pairs. [`Config::parse`] turns them into typed settings, applying the
//! same defaults and validation the plugin has always used.

use crate::client::ClientConfig;
use crate::codec::LineFormat;
use crate::error::{Error, Result};
use crate::labels::{LabelSet, MappingTree};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Source of raw configuration values.
///
/// Implemented for plain maps; the host runtime supplies its own getter.
pub trait ConfigGetter {
    fn get(&self, key: &str) -> Option<&str>;
}

impl ConfigGetter for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, key).map(String::as_str)
    }
}

impl ConfigGetter for BTreeMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        BTreeMap::get(self, key).map(String::as_str)
    }
}

/// Parsed plugin configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base config for the default client; also the template for dynamic ones
    pub client: ClientConfig,
    /// Log level requested by the host config
    pub log_level: tracing::Level,
    /// Promote `kubernetes.labels` and metadata into labels
    pub auto_kubernetes_labels: bool,
    /// Top-level keys stripped from every record before encoding
    pub remove_keys: Vec<String>,
    /// Top-level keys extracted as same-named labels (and stripped)
    pub label_keys: Vec<String>,
    /// Output line format
    pub line_format: LineFormat,
    /// Send a lone remaining field's value as the raw line
    pub drop_single_key: bool,
    /// Mapping tree projecting record fields into labels; supersedes `label_keys`
    pub label_map: Option<MappingTree>,
    /// Namespace labels a namespace must carry to get a dynamic client
    pub label_selector: BTreeMap<String, String>,
    /// Mapping tree resolving the dynamic destination key per record
    pub dynamic_host_path: Option<MappingTree>,
    /// Host template: `prefix + namespace + suffix`
    pub dynamic_host_prefix: String,
    pub dynamic_host_suffix: String,
    /// Namespace names must match to count as dynamic destinations.
    /// The default (empty pattern) matches everything.
    pub dynamic_host_pattern: Regex,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: default_client_config(),
            log_level: tracing::Level::INFO,
            auto_kubernetes_labels: false,
            remove_keys: Vec::new(),
            label_keys: Vec::new(),
            line_format: LineFormat::Json,
            drop_single_key: true,
            label_map: None,
            label_selector: BTreeMap::new(),
            dynamic_host_path: None,
            dynamic_host_prefix: String::new(),
            dynamic_host_suffix: String::new(),
            dynamic_host_pattern: Regex::new("").unwrap(),
        }
    }
}

fn default_client_config() -> ClientConfig {
    let mut client = ClientConfig::default();
    client.external_labels = LabelSet::from_iter([("job".to_string(), "fluent-bit".to_string())]);
    client
}

impl Config {
    /// Parse configuration from a key/value getter.
    pub fn parse(getter: &impl ConfigGetter) -> Result<Self> {
        let mut config = Config::default();

        if let Some(url) = non_empty(getter.get("URL")) {
            config.client.url = url
                .parse()
                .map_err(|e| Error::Config(format!("failed to parse client URL: {e}")))?;
        }

        if let Some(tenant) = getter.get("TenantID") {
            config.client.tenant_id = tenant.to_string();
        }

        if let Some(wait) = non_empty(getter.get("BatchWait")) {
            let seconds: u64 = wait
                .parse()
                .map_err(|_| Error::Config(format!("failed to parse BatchWait: {wait}")))?;
            config.client.batch_wait = Duration::from_secs(seconds);
        }

        if let Some(size) = non_empty(getter.get("BatchSize")) {
            config.client.batch_size = size
                .parse()
                .map_err(|_| Error::Config(format!("failed to parse BatchSize: {size}")))?;
        }

        if let Some(labels) = non_empty(getter.get("Labels")) {
            config.client.external_labels = parse_external_labels(labels)?;
        }

        if let Some(level) = non_empty(getter.get("LogLevel")) {
            config.log_level = level
                .parse()
                .map_err(|_| Error::Config(format!("invalid log level: {level}")))?;
        }

        config.auto_kubernetes_labels = parse_bool(
            getter.get("AutoKubernetesLabels"),
            false,
            "AutoKubernetesLabels",
        )?;

        if let Some(keys) = non_empty(getter.get("RemoveKeys")) {
            config.remove_keys = split_list(keys);
        }

        if let Some(keys) = non_empty(getter.get("LabelKeys")) {
            config.label_keys = split_list(keys);
        }

        config.drop_single_key = parse_bool(getter.get("DropSingleKey"), true, "DropSingleKey")?;

        match getter.get("LineFormat") {
            None | Some("") | Some("json") => config.line_format = LineFormat::Json,
            Some("key_value") => config.line_format = LineFormat::KeyValue,
            Some(other) => return Err(Error::Config(format!("invalid format: {other}"))),
        }

        if let Some(path) = non_empty(getter.get("LabelMapPath")) {
            let content = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("failed to open LabelMap file: {e}")))?;
            config.label_map = Some(parse_mapping_tree(&content, "LabelMap")?);
            // A label map supersedes explicit label keys.
            config.label_keys.clear();
        }

        if let Some(selector) = non_empty(getter.get("LabelSelector")) {
            for pair in selector.split(',') {
                let Some((name, value)) = pair.split_once(':') else {
                    continue;
                };
                config
                    .label_selector
                    .insert(name.trim().to_string(), value.trim().to_string());
            }
        }

        if let Some(path) = non_empty(getter.get("DynamicHostPath")) {
            config.dynamic_host_path = Some(parse_mapping_tree(path, "DynamicHostPath")?);
        }

        if let Some(prefix) = getter.get("DynamicHostPrefix") {
            config.dynamic_host_prefix = prefix.to_string();
        }
        if let Some(suffix) = getter.get("DynamicHostSuffix") {
            config.dynamic_host_suffix = suffix.to_string();
        }

        if let Some(pattern) = non_empty(getter.get("DynamicHostRegex")) {
            config.dynamic_host_pattern = Regex::new(pattern)
                .map_err(|e| Error::Config(format!("invalid DynamicHostRegex: {e}")))?;
        }

        Ok(config)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(str::to_string).collect()
}

fn parse_bool(value: Option<&str>, default: bool, key: &str) -> Result<bool> {
    match value {
        None | Some("") => Ok(default),
        Some("true") => Ok(true),
        Some("false") => Ok(false),
        Some(other) => Err(Error::Config(format!("invalid boolean {key}: {other}"))),
    }
}

fn parse_mapping_tree(content: &str, key: &str) -> Result<MappingTree> {
    let value: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| Error::Config(format!("failed to unmarshal {key} json: {e}")))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(Error::Config(format!("{key} must be a JSON object"))),
    }
}

/// Parse a static label matcher string such as `{job="fluent-bit",env="dev"}`.
fn parse_external_labels(input: &str) -> Result<LabelSet> {
    let trimmed = input.trim();
    let inner = trimmed
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| Error::Config(format!("failed to parse Labels: {input}")))?;

    let matcher = Regex::new(r#"^\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*=\s*"([^"]*)"\s*$"#)
        .map_err(|e| Error::Config(e.to_string()))?;

    let mut labels = LabelSet::new();
    for pair in inner.split(',') {
        if pair.trim().is_empty() {
            continue;
        }
        let captures = matcher
            .captures(pair)
            .ok_or_else(|| Error::Config(format!("failed to parse Labels: {input}")))?;
        labels.insert_checked(&captures[1], &captures[2]);
    }
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DEFAULT_URL;
    use std::io::Write;

    fn conf(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse(&conf(&[])).unwrap();
        assert_eq!(config.client.url.as_str(), DEFAULT_URL);
        assert!(config.client.tenant_id.is_empty());
        assert_eq!(
            config.client.external_labels.get("job"),
            Some("fluent-bit")
        );
        assert_eq!(config.line_format, LineFormat::Json);
        assert!(config.drop_single_key);
        assert!(!config.auto_kubernetes_labels);
        assert!(config.label_map.is_none());
        assert!(config.dynamic_host_pattern.is_match("anything"));
        assert_eq!(config.log_level, tracing::Level::INFO);
    }

    #[test]
    fn test_setting_values() {
        let config = Config::parse(&conf(&[
            ("URL", "http://somewhere.com:3100/loki/api/v1/push"),
            ("TenantID", "my-tenant-id"),
            ("LineFormat", "key_value"),
            ("LogLevel", "warn"),
            ("Labels", r#"{app="foo"}"#),
            ("BatchWait", "30"),
            ("BatchSize", "100"),
            ("RemoveKeys", "buzz,fuzz"),
            ("LabelKeys", "foo,bar"),
            ("DropSingleKey", "false"),
        ]))
        .unwrap();

        assert_eq!(
            config.client.url.as_str(),
            "http://somewhere.com:3100/loki/api/v1/push"
        );
        assert_eq!(config.client.tenant_id, "my-tenant-id");
        assert_eq!(config.client.batch_wait, Duration::from_secs(30));
        assert_eq!(config.client.batch_size, 100);
        assert_eq!(config.client.external_labels.get("app"), Some("foo"));
        assert_eq!(config.line_format, LineFormat::KeyValue);
        assert_eq!(config.log_level, tracing::Level::WARN);
        assert_eq!(config.remove_keys, vec!["buzz", "fuzz"]);
        assert_eq!(config.label_keys, vec!["foo", "bar"]);
        assert!(!config.drop_single_key);
    }

    #[test]
    fn test_label_map_supersedes_label_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "kubernetes": {{
                    "namespace_name": "namespace",
                    "labels": {{"component": "component", "tier": "tier"}}
                }},
                "stream": "stream"
            }}"#
        )
        .unwrap();

        let config = Config::parse(&conf(&[
            ("LabelKeys", "foo,bar"),
            ("LabelMapPath", file.path().to_str().unwrap()),
        ]))
        .unwrap();

        assert!(config.label_keys.is_empty());
        let map = config.label_map.unwrap();
        let kube = map.get("kubernetes").and_then(|v| v.as_object()).unwrap();
        assert_eq!(
            kube.get("namespace_name"),
            Some(&serde_json::Value::String("namespace".into()))
        );
    }

    #[test]
    fn test_dynamic_configuration() {
        let config = Config::parse(&conf(&[
            (
                "DynamicHostPath",
                r#"{"kubernetes": {"namespace_name": "namespace"}}"#,
            ),
            ("DynamicHostPrefix", "http://loki."),
            ("DynamicHostSuffix", ".svc:3100/loki/api/v1/push"),
            ("DynamicHostRegex", "shoot--"),
            ("LabelSelector", "role:shoot, seed:aws"),
        ]))
        .unwrap();

        assert!(config.dynamic_host_path.is_some());
        assert_eq!(config.dynamic_host_prefix, "http://loki.");
        assert_eq!(config.dynamic_host_suffix, ".svc:3100/loki/api/v1/push");
        assert!(config.dynamic_host_pattern.is_match("shoot--foo"));
        assert!(!config.dynamic_host_pattern.is_match("garden"));
        assert_eq!(config.label_selector.get("role"), Some(&"shoot".to_string()));
        assert_eq!(config.label_selector.get("seed"), Some(&"aws".to_string()));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for pairs in [
            vec![("URL", "::doh.com")],
            vec![("BatchWait", "a")],
            vec![("BatchSize", "a")],
            vec![("Labels", "a")],
            vec![("LineFormat", "a")],
            vec![("LogLevel", "a")],
            vec![("DropSingleKey", "a")],
            vec![("AutoKubernetesLabels", "a")],
            vec![("LabelMapPath", "/nonexistent/labelmap.json")],
            vec![("DynamicHostPath", "a")],
            vec![("DynamicHostRegex", "(unclosed")],
        ] {
            assert!(Config::parse(&conf(&pairs)).is_err(), "expected error for {pairs:?}");
        }
    }

    #[test]
    fn test_external_labels_multiple() {
        let labels = parse_external_labels(r#"{job="fluent-bit", env="dev"}"#).unwrap();
        assert_eq!(labels.get("job"), Some("fluent-bit"));
        assert_eq!(labels.get("env"), Some("dev"));
    }
}
