//! Backend client contract
//!
//! The wire client that batches and pushes lines to the log store is
//! external. REITTI consumes it through the [`LogClient`] trait and creates
//! per-destination instances through a [`ClientFactory`], so the controller
//! never depends on a concrete transport.

use crate::error::ClientError;
use crate::labels::LabelSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Configuration for one backend client.
///
/// The controller clones the base config and substitutes the URL when it
/// creates a per-namespace client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Push endpoint
    pub url: Url,
    /// Tenant identifier; empty means no tenant header
    pub tenant_id: String,
    /// Maximum time to hold an incomplete batch
    pub batch_wait: Duration,
    /// Maximum batch size in bytes
    pub batch_size: usize,
    /// Static labels attached to every line sent through this client
    pub external_labels: LabelSet,
}

/// Default push endpoint used when the config leaves `URL` unset.
pub const DEFAULT_URL: &str = "http://localhost:3100/loki/api/v1/push";

const DEFAULT_BATCH_WAIT: Duration = Duration::from_secs(1);
const DEFAULT_BATCH_SIZE: usize = 100 * 1024;

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.parse().unwrap(),
            tenant_id: String::new(),
            batch_wait: DEFAULT_BATCH_WAIT,
            batch_size: DEFAULT_BATCH_SIZE,
            external_labels: LabelSet::new(),
        }
    }
}

impl ClientConfig {
    /// Copy of this config pointing at a different endpoint.
    pub fn with_url(&self, url: Url) -> Self {
        Self {
            url,
            ..self.clone()
        }
    }
}

/// Opaque sender pushing lines to one log-storage endpoint.
///
/// Implementations own batching and transport. `stop` must be idempotent,
/// flush or discard buffered data, and complete in finite time.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Client name for logging
    fn name(&self) -> &str;

    /// Hand one line with its labels and timestamp to the client
    async fn send(
        &self,
        labels: &LabelSet,
        timestamp: DateTime<Utc>,
        line: &str,
    ) -> Result<(), ClientError>;

    /// Stop the client, releasing its resources
    async fn stop(&self);
}

/// Builds [`LogClient`] instances from a [`ClientConfig`].
///
/// One factory serves both the default client and every dynamic
/// per-namespace client.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn build(&self, config: &ClientConfig) -> Result<Arc<dyn LogClient>, ClientError>;
}
