//! Namespace watch controller
//!
//! Keeps a registry of per-namespace backend clients synchronized with the
//! cluster's namespace lifecycle. Namespaces that satisfy the configured
//! label selector and name pattern get a client pointed at
//! `prefix + name + suffix`; when they disappear (or stop matching) the
//! client is stopped and removed.
//!
//! The controller is decoupled from the watch machinery: it consumes
//! [`NamespaceEvent`]s through the [`NamespaceEventSink`] trait, and
//! [`start_namespace_watch`] adapts a kube watcher stream into that
//! interface.

use crate::client::{ClientConfig, ClientFactory, LogClient};
use crate::error::{Error, Result};
use crate::metrics;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::Api;
use kube::runtime::watcher::{self, Event as WatcherEvent};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Name and labels of one namespace, as carried by watch events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceMeta {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl NamespaceMeta {
    pub fn new(name: impl Into<String>, labels: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            labels,
        }
    }
}

/// One namespace lifecycle event.
#[derive(Debug, Clone)]
pub enum NamespaceEvent {
    Added(NamespaceMeta),
    Updated { old: NamespaceMeta, new: NamespaceMeta },
    Deleted(NamespaceMeta),
}

/// Consumer of namespace lifecycle events.
///
/// The watch adapter feeds this interface; tests can drive it directly
/// without a cluster.
#[async_trait]
pub trait NamespaceEventSink: Send + Sync {
    async fn namespace_added(&self, ns: &NamespaceMeta);
    async fn namespace_updated(&self, old: &NamespaceMeta, new: &NamespaceMeta);
    async fn namespace_deleted(&self, ns: &NamespaceMeta);

    /// Deliver a tagged event to the matching handler.
    async fn handle(&self, event: NamespaceEvent) {
        match event {
            NamespaceEvent::Added(ns) => self.namespace_added(&ns).await,
            NamespaceEvent::Updated { old, new } => self.namespace_updated(&old, &new).await,
            NamespaceEvent::Deleted(ns) => self.namespace_deleted(&ns).await,
        }
    }
}

/// Concurrency-safe client registry keyed by destination name.
///
/// One exclusive lock serializes all mutations; check-then-act operations
/// are atomic so interleaved add/delete for the same key cannot race into
/// a half-inserted or double-removed entry. Client start/stop is awaited
/// outside the lock. Once closed, the store refuses insertions, so a
/// client built while shutdown drained the map cannot be registered after
/// the fact.
pub struct ClientStore {
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    clients: HashMap<String, Arc<dyn LogClient>>,
    closed: bool,
}

impl ClientStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                clients: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Insert unless an entry already exists or the store is closed.
    /// Returns whether it was inserted; a refused client is the caller's
    /// to stop.
    pub fn insert_if_absent(&self, name: &str, client: Arc<dyn LogClient>) -> bool {
        let mut inner = self.inner.lock();
        if inner.closed || inner.clients.contains_key(name) {
            return false;
        }
        inner.clients.insert(name.to_string(), client);
        true
    }

    /// Remove and return the entry, if present.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn LogClient>> {
        self.inner.lock().clients.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn LogClient>> {
        self.inner.lock().clients.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().clients.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().clients.is_empty()
    }

    /// Take every entry out of the store and refuse all further insertions.
    pub fn close(&self) -> Vec<(String, Arc<dyn LogClient>)> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.clients.drain().collect()
    }
}

impl Default for ClientStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings for the [`Controller`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Labels a namespace must carry to get a dynamic client
    pub label_selector: BTreeMap<String, String>,
    /// Names must match to count as dynamic destinations
    pub name_pattern: Regex,
    /// Host template around the namespace name
    pub host_prefix: String,
    pub host_suffix: String,
    /// Template for per-namespace client configs; only the URL is substituted
    pub client_template: ClientConfig,
}

/// Maintains one live backend client per matching namespace.
pub struct Controller {
    config: ControllerConfig,
    factory: Arc<dyn ClientFactory>,
    store: ClientStore,
    terminated: AtomicBool,
}

impl Controller {
    pub fn new(config: ControllerConfig, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            config,
            factory,
            store: ClientStore::new(),
            terminated: AtomicBool::new(false),
        }
    }

    /// Whether a destination name falls under dynamic routing.
    pub fn is_dynamic_host(&self, name: &str) -> bool {
        self.config.name_pattern.is_match(name)
    }

    /// Look up the client for a destination name.
    ///
    /// Returns `None` when no client is registered or the controller has
    /// been shut down.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn LogClient>> {
        if self.terminated.load(Ordering::Acquire) {
            return None;
        }
        self.store.get(name)
    }

    /// Number of registered dynamic clients.
    pub fn client_count(&self) -> usize {
        self.store.len()
    }

    /// Stop every registered client exactly once and mark the controller
    /// terminated. Subsequent lookups return `None`; late events are ignored.
    pub async fn shutdown(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let clients = self.store.close();
        info!(count = clients.len(), "stopping dynamic clients");
        for (namespace, client) in clients {
            client.stop().await;
            metrics::try_record_namespace_event("removed");
            if let Some(m) = metrics::Metrics::get() {
                m.dec_dynamic_clients();
            }
            tracing::debug!(namespace = %namespace, "stopped dynamic client");
        }
    }

    fn matches(&self, ns: &NamespaceMeta) -> bool {
        self.config
            .label_selector
            .iter()
            .all(|(name, value)| ns.labels.get(name) == Some(value))
            && self.config.name_pattern.is_match(&ns.name)
    }

    /// Per-namespace client config: the template with the substituted URL.
    fn client_config_for(&self, namespace: &str) -> Result<ClientConfig> {
        let host = format!(
            "{}{}{}",
            self.config.host_prefix, namespace, self.config.host_suffix
        );
        let url = host.parse().map_err(|e| Error::MalformedDestination {
            namespace: namespace.to_string(),
            source: e,
        })?;
        Ok(self.config.client_template.with_url(url))
    }

    async fn create_client(&self, ns: &NamespaceMeta) {
        if self.store.contains(&ns.name) {
            return;
        }

        let client_config = match self.client_config_for(&ns.name) {
            Ok(config) => config,
            Err(e) => {
                error!(namespace = %ns.name, error = %e, "skipping namespace");
                metrics::try_record_namespace_event("rejected");
                return;
            }
        };

        let client = match self.factory.build(&client_config).await {
            Ok(client) => client,
            Err(e) => {
                error!(
                    namespace = %ns.name,
                    url = %client_config.url,
                    error = %e,
                    "failed to create client for namespace"
                );
                metrics::try_record_namespace_event("rejected");
                return;
            }
        };

        if self.store.insert_if_absent(&ns.name, Arc::clone(&client)) {
            info!(namespace = %ns.name, url = %client_config.url, "added client for namespace");
            metrics::try_record_namespace_event("created");
            if let Some(m) = metrics::Metrics::get() {
                m.inc_dynamic_clients();
            }
        } else {
            // Lost the insert race, or the store closed while we were
            // building; either way ours goes.
            client.stop().await;
        }
    }

    async fn remove_client(&self, ns: &NamespaceMeta) {
        if let Some(client) = self.store.remove(&ns.name) {
            client.stop().await;
            info!(namespace = %ns.name, "removed client for namespace");
            metrics::try_record_namespace_event("removed");
            if let Some(m) = metrics::Metrics::get() {
                m.dec_dynamic_clients();
            }
        }
    }
}

#[async_trait]
impl NamespaceEventSink for Controller {
    async fn namespace_added(&self, ns: &NamespaceMeta) {
        if self.terminated.load(Ordering::Acquire) || !self.matches(ns) {
            return;
        }
        self.create_client(ns).await;
    }

    async fn namespace_updated(&self, old: &NamespaceMeta, new: &NamespaceMeta) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        match (self.matches(old), self.matches(new)) {
            (false, true) => self.create_client(new).await,
            (true, false) => self.remove_client(new).await,
            _ => {}
        }
    }

    async fn namespace_deleted(&self, ns: &NamespaceMeta) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        self.remove_client(ns).await;
    }
}

/// Handle to the background namespace watch task.
pub struct NamespaceWatch {
    handle: tokio::task::JoinHandle<()>,
}

impl NamespaceWatch {
    /// Stop the event subscription.
    pub fn stop(&self) {
        self.handle.abort();
    }
}

/// Subscribe to the cluster's namespace lifecycle and feed the sink.
///
/// Blocks until the initial namespace snapshot has been delivered and
/// processed, so dispatch never races an empty registry at startup. Fails
/// with [`Error::Initialization`] if the sync does not complete within
/// `sync_timeout`.
pub async fn start_namespace_watch(
    kube_client: kube::Client,
    sink: Arc<dyn NamespaceEventSink>,
    sync_timeout: Duration,
) -> Result<NamespaceWatch> {
    let api: Api<Namespace> = Api::all(kube_client);
    let (ready_tx, mut ready_rx) = tokio::sync::watch::channel(false);

    let handle = tokio::spawn(async move {
        let stream = watcher::watcher(api, watcher::Config::default());
        tokio::pin!(stream);

        let mut state = WatchState::new();
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    if state.apply(event, sink.as_ref()).await {
                        let _ = ready_tx.send(true);
                    }
                }
                Err(e) => {
                    // The watcher restarts itself; keep consuming.
                    warn!(error = %e, "namespace watcher error");
                }
            }
        }
    });

    // The watch ref borrows the receiver; map it away before matching.
    let synced = tokio::time::timeout(sync_timeout, ready_rx.wait_for(|ready| *ready))
        .await
        .map(|result| result.map(|_| ()));
    match synced {
        Ok(Ok(())) => {
            info!("namespace cache synced");
            Ok(NamespaceWatch { handle })
        }
        Ok(Err(_)) => {
            handle.abort();
            Err(Error::Initialization(
                "namespace watch ended before initial sync".to_string(),
            ))
        }
        Err(_) => {
            handle.abort();
            Err(Error::Initialization(format!(
                "initial namespace sync did not complete within {sync_timeout:?}"
            )))
        }
    }
}

/// Bookkeeping that turns the raw watcher stream into sink calls.
struct WatchState {
    /// Last seen meta per namespace, to tell Added from Updated and to
    /// hand the old state to update handlers.
    known: HashMap<String, NamespaceMeta>,
    /// Names seen during an in-progress listing; `None` outside one.
    relist: Option<HashSet<String>>,
}

impl WatchState {
    fn new() -> Self {
        Self {
            known: HashMap::new(),
            relist: None,
        }
    }

    /// Apply one watcher event, feeding the sink. Returns `true` when a
    /// listing just completed.
    async fn apply(
        &mut self,
        event: WatcherEvent<Namespace>,
        sink: &dyn NamespaceEventSink,
    ) -> bool {
        match event {
            WatcherEvent::Apply(ns) | WatcherEvent::InitApply(ns) => {
                let Some(meta) = namespace_meta(&ns) else {
                    return false;
                };
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(meta.name.clone());
                }
                match self.known.insert(meta.name.clone(), meta.clone()) {
                    Some(old) => sink.namespace_updated(&old, &meta).await,
                    None => sink.namespace_added(&meta).await,
                }
            }
            WatcherEvent::Delete(ns) => {
                if let Some(meta) = namespace_meta(&ns) {
                    self.known.remove(&meta.name);
                    sink.namespace_deleted(&meta).await;
                }
            }
            WatcherEvent::Init => {
                self.relist = Some(HashSet::new());
            }
            WatcherEvent::InitDone => {
                if let Some(seen) = self.relist.take() {
                    // Namespaces deleted while the watch was down never get
                    // a Delete event; the listing reveals them by absence.
                    let gone: Vec<NamespaceMeta> = self
                        .known
                        .values()
                        .filter(|meta| !seen.contains(&meta.name))
                        .cloned()
                        .collect();
                    for meta in gone {
                        self.known.remove(&meta.name);
                        sink.namespace_deleted(&meta).await;
                    }
                }
                return true;
            }
        }
        false
    }
}

fn namespace_meta(ns: &Namespace) -> Option<NamespaceMeta> {
    let name = ns.metadata.name.clone()?;
    let labels = ns.metadata.labels.clone().unwrap_or_default();
    Some(NamespaceMeta { name, labels })
}
