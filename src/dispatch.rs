//! Record dispatch
//!
//! The per-record pipeline: normalize the raw record, extract labels,
//! resolve the dynamic destination, strip consumed fields, encode the line
//! and hand it to the right client. This path runs on every log line.

use crate::client::{ClientFactory, LogClient};
use crate::codec::encode_line;
use crate::config::Config;
use crate::controller::{
    start_namespace_watch, Controller, ControllerConfig, NamespaceEventSink, NamespaceWatch,
};
use crate::error::{Error, Result};
use crate::labels::{
    auto_kubernetes_labels, extract_labels, map_labels, resolve_dynamic_host, LabelSet,
};
use crate::metrics;
use crate::record::{self, Record};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Routes each incoming record to the default client or a per-namespace
/// dynamic client.
pub struct Dispatcher {
    config: Config,
    default_client: Arc<dyn LogClient>,
    controller: Arc<Controller>,
    watch: Option<NamespaceWatch>,
}

impl Dispatcher {
    /// Assemble a dispatcher from already-constructed parts, without a
    /// namespace watch.
    pub fn new(
        config: Config,
        default_client: Arc<dyn LogClient>,
        controller: Arc<Controller>,
    ) -> Self {
        Self {
            config,
            default_client,
            controller,
            watch: None,
        }
    }

    /// Build the default client, the controller and the namespace watch,
    /// and block until the initial namespace snapshot is processed. The
    /// watch is owned by the dispatcher and stopped by [`close`].
    ///
    /// Fails with [`Error::Initialization`] when the default client cannot
    /// be built or the initial sync does not finish within `sync_timeout`.
    ///
    /// [`close`]: Dispatcher::close
    pub async fn connect(
        config: Config,
        factory: Arc<dyn ClientFactory>,
        kube_client: kube::Client,
        sync_timeout: Duration,
    ) -> Result<Self> {
        let default_client = factory
            .build(&config.client)
            .await
            .map_err(|e| Error::Initialization(format!("default client: {e}")))?;

        let controller = Arc::new(Controller::new(
            ControllerConfig {
                label_selector: config.label_selector.clone(),
                name_pattern: config.dynamic_host_pattern.clone(),
                host_prefix: config.dynamic_host_prefix.clone(),
                host_suffix: config.dynamic_host_suffix.clone(),
                client_template: config.client.clone(),
            },
            factory,
        ));

        let sink = Arc::clone(&controller) as Arc<dyn NamespaceEventSink>;
        let watch = start_namespace_watch(kube_client, sink, sync_timeout).await?;

        Ok(Self {
            config,
            default_client,
            controller,
            watch: Some(watch),
        })
    }

    /// Dispatch one raw record.
    pub async fn send_record(&self, raw: &rmpv::Value, timestamp: DateTime<Utc>) -> Result<()> {
        let record = record::normalize(raw);
        debug!(fields = record.len(), "processing record");
        match self.dispatch(record, timestamp).await {
            Ok(outcome) => {
                metrics::try_record_dispatched(outcome);
                Ok(())
            }
            Err(e) => {
                metrics::try_record_dispatched("failed");
                error!(error = %e, "failed to dispatch record");
                Err(e)
            }
        }
    }

    async fn dispatch(&self, mut record: Record, timestamp: DateTime<Utc>) -> Result<&'static str> {
        let mut labels = LabelSet::new();
        if self.config.auto_kubernetes_labels {
            if let Err(e) = auto_kubernetes_labels(&record, &mut labels) {
                // Reported, never fatal: the record still ships without them.
                error!(error = %e, "automatic kubernetes labels skipped");
            }
        }

        if let Some(mapping) = &self.config.label_map {
            map_labels(&record, mapping, &mut labels);
        } else {
            labels.merge_missing(extract_labels(&record, &self.config.label_keys));
        }

        // Resolved over the record before any stripping.
        let dynamic_host =
            resolve_dynamic_host(&record, self.config.dynamic_host_path.as_ref());

        record::remove_keys(&mut record, &self.config.label_keys);
        record::remove_keys(&mut record, &self.config.remove_keys);

        if record.is_empty() {
            // Fully consumed by labels; nothing left to send.
            return Ok("consumed");
        }

        let line = if self.config.drop_single_key && record.len() == 1 {
            let (_, value) = record.iter().next().ok_or_else(|| {
                Error::Encode("single-key record disappeared".to_string())
            })?;
            record::value_to_string(value)
        } else {
            encode_line(&record, self.config.line_format)?
        };

        let client = self.resolve_client(&dynamic_host)?;
        client
            .send(&labels, timestamp, &line)
            .await
            .map_err(|e| Error::Client {
                client: client.name().to_string(),
                message: e.to_string(),
            })?;
        Ok("sent")
    }

    /// Pick the dynamic client when the destination key is non-empty and
    /// falls under the name pattern; the default client otherwise.
    fn resolve_client(&self, dynamic_host: &str) -> Result<Arc<dyn LogClient>> {
        if !dynamic_host.is_empty() && self.controller.is_dynamic_host(dynamic_host) {
            return self
                .controller
                .lookup(dynamic_host)
                .ok_or_else(|| Error::DestinationNotFound(dynamic_host.to_string()));
        }
        Ok(Arc::clone(&self.default_client))
    }

    /// Stop the namespace watch, then the default client, then shut the
    /// controller down. Aborting the watch first keeps new events from
    /// arriving during teardown.
    pub async fn close(&self) {
        if let Some(watch) = &self.watch {
            watch.stop();
        }
        self.default_client.stop().await;
        self.controller.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::codec::LineFormat;
    use crate::error::ClientError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use regex::Regex;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq)]
    struct Sent {
        labels: LabelSet,
        line: String,
    }

    #[derive(Default)]
    struct RecordingClient {
        name: String,
        sent: Mutex<Vec<Sent>>,
    }

    impl RecordingClient {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn lines(&self) -> Vec<String> {
            self.sent.lock().iter().map(|s| s.line.clone()).collect()
        }
    }

    #[async_trait]
    impl LogClient for RecordingClient {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(
            &self,
            labels: &LabelSet,
            _timestamp: DateTime<Utc>,
            line: &str,
        ) -> std::result::Result<(), ClientError> {
            self.sent.lock().push(Sent {
                labels: labels.clone(),
                line: line.to_string(),
            });
            Ok(())
        }

        async fn stop(&self) {}
    }

    fn mp(value: serde_json::Value) -> rmpv::Value {
        fn convert(value: &serde_json::Value) -> rmpv::Value {
            match value {
                serde_json::Value::Null => rmpv::Value::Nil,
                serde_json::Value::Bool(b) => rmpv::Value::Boolean(*b),
                serde_json::Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        rmpv::Value::from(i)
                    } else {
                        rmpv::Value::F64(n.as_f64().unwrap_or(0.0))
                    }
                }
                serde_json::Value::String(s) => rmpv::Value::String(s.as_str().into()),
                serde_json::Value::Array(items) => {
                    rmpv::Value::Array(items.iter().map(convert).collect())
                }
                serde_json::Value::Object(map) => rmpv::Value::Map(
                    map.iter()
                        .map(|(k, v)| (rmpv::Value::String(k.as_str().into()), convert(v)))
                        .collect(),
                ),
            }
        }
        convert(&value)
    }

    fn dispatcher(config: Config, default_client: Arc<RecordingClient>) -> Dispatcher {
        let controller = Arc::new(Controller::new(
            ControllerConfig {
                label_selector: config.label_selector.clone(),
                name_pattern: config.dynamic_host_pattern.clone(),
                host_prefix: "http://loki.".to_string(),
                host_suffix: ".svc:3100".to_string(),
                client_template: ClientConfig::default(),
            },
            Arc::new(NoFactory),
        ));
        Dispatcher::new(config, default_client, controller)
    }

    struct NoFactory;

    #[async_trait]
    impl ClientFactory for NoFactory {
        async fn build(
            &self,
            _config: &ClientConfig,
        ) -> std::result::Result<Arc<dyn LogClient>, ClientError> {
            Err(ClientError::Init("not available in this test".to_string()))
        }
    }

    #[tokio::test]
    async fn test_plain_record_goes_to_default_client() {
        let client = RecordingClient::new("default");
        let d = dispatcher(Config::default(), client.clone());

        d.send_record(
            &mp(json!({"message": "hello", "stream": "stdout"})),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(
            client.lines(),
            vec![r#"{"message":"hello","stream":"stdout"}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn test_record_fully_consumed_by_labels() {
        let mut config = Config::default();
        config.label_keys = vec!["app".to_string()];
        let client = RecordingClient::new("default");
        let d = dispatcher(config, client.clone());

        d.send_record(&mp(json!({"app": "x"})), Utc::now())
            .await
            .unwrap();

        assert!(client.lines().is_empty());
    }

    #[tokio::test]
    async fn test_drop_single_key_bypasses_codec() {
        let mut config = Config::default();
        config.label_keys = vec!["app".to_string()];
        config.drop_single_key = true;
        let client = RecordingClient::new("default");
        let d = dispatcher(config, client.clone());

        d.send_record(&mp(json!({"app": "x", "msg": "hi"})), Utc::now())
            .await
            .unwrap();

        let sent = client.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].line, "hi");
        assert_eq!(sent[0].labels.get("app"), Some("x"));
    }

    #[tokio::test]
    async fn test_remove_keys_stripped_before_encoding() {
        let mut config = Config::default();
        config.remove_keys = vec!["noisy".to_string()];
        config.drop_single_key = false;
        let client = RecordingClient::new("default");
        let d = dispatcher(config, client.clone());

        d.send_record(&mp(json!({"msg": "hi", "noisy": "drop me"})), Utc::now())
            .await
            .unwrap();

        assert_eq!(client.lines(), vec![r#"{"msg":"hi"}"#.to_string()]);
    }

    #[tokio::test]
    async fn test_key_value_format() {
        let mut config = Config::default();
        config.line_format = LineFormat::KeyValue;
        config.drop_single_key = false;
        let client = RecordingClient::new("default");
        let d = dispatcher(config, client.clone());

        d.send_record(&mp(json!({"b": "two words", "a": "one"})), Utc::now())
            .await
            .unwrap();

        assert_eq!(client.lines(), vec![r#"a=one b="two words""#.to_string()]);
    }

    #[tokio::test]
    async fn test_unmatched_dynamic_host_uses_default() {
        let mut config = Config::default();
        config.dynamic_host_path = json!({"kubernetes": {"namespace_name": "host"}})
            .as_object()
            .cloned();
        config.dynamic_host_pattern = Regex::new("^shoot--").unwrap();
        let client = RecordingClient::new("default");
        let d = dispatcher(config, client.clone());

        // "garden" does not match the pattern, so the default client is used.
        d.send_record(
            &mp(json!({
                "kubernetes": {"namespace_name": "garden"},
                "message": "hello"
            })),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(client.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_matched_dynamic_host_without_client_fails() {
        let mut config = Config::default();
        config.dynamic_host_path = json!({"kubernetes": {"namespace_name": "host"}})
            .as_object()
            .cloned();
        config.dynamic_host_pattern = Regex::new("^shoot--").unwrap();
        let client = RecordingClient::new("default");
        let d = dispatcher(config, client.clone());

        let err = d
            .send_record(
                &mp(json!({
                    "kubernetes": {"namespace_name": "shoot--foo"},
                    "message": "hello"
                })),
                Utc::now(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DestinationNotFound(ref ns) if ns == "shoot--foo"));
        assert!(client.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_auto_labels_missing_kubernetes_not_fatal() {
        let mut config = Config::default();
        config.auto_kubernetes_labels = true;
        config.drop_single_key = false;
        let client = RecordingClient::new("default");
        let d = dispatcher(config, client.clone());

        d.send_record(&mp(json!({"message": "hello"})), Utc::now())
            .await
            .unwrap();

        let sent = client.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].labels.is_empty());
    }

    #[tokio::test]
    async fn test_auto_labels_survive_explicit_extraction() {
        let mut config = Config::default();
        config.auto_kubernetes_labels = true;
        config.label_keys = vec!["pod_name".to_string()];
        config.drop_single_key = false;
        let client = RecordingClient::new("default");
        let d = dispatcher(config, client.clone());

        d.send_record(
            &mp(json!({
                "kubernetes": {"pod_name": "from-kubernetes"},
                "pod_name": "from-record",
                "message": "hello"
            })),
            Utc::now(),
        )
        .await
        .unwrap();

        let sent = client.sent.lock().clone();
        // The automatic label wins over the explicitly extracted one.
        assert_eq!(sent[0].labels.get("pod_name"), Some("from-kubernetes"));
    }
}
