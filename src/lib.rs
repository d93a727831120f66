//! REITTI - Multi-tenant Log Dispatch Gateway for Kubernetes
//!
//! Ingests structured log records from a host collector and forwards each
//! one to a log-storage backend, choosing the destination per record from
//! a field such as the Kubernetes namespace.
//!
//! # Architecture
//!
//! ```text
//! Namespace watch ──► Controller ──► client registry
//!                                         │
//! Record ──► Dispatcher ──► labels / host / line ──► client.send()
//! ```
//!
//! A controller watches the cluster's namespaces and keeps one live backend
//! client per namespace that matches a label selector and a name pattern.
//! The dispatcher extracts labels, resolves the destination, strips the
//! consumed fields, encodes the rest into a line and hands it to the
//! matching client, falling back to the default client when no dynamic
//! destination applies.
//!
//! The backend transport is pluggable via the [`LogClient`] and
//! [`ClientFactory`] traits.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod client;
pub mod codec;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod labels;
pub mod metrics;
pub mod record;

pub use client::{ClientConfig, ClientFactory, LogClient};
pub use codec::LineFormat;
pub use config::{Config, ConfigGetter};
pub use controller::{Controller, NamespaceEvent, NamespaceEventSink, NamespaceMeta};
pub use dispatch::Dispatcher;
pub use error::{ClientError, Error, Result};
pub use labels::{LabelSet, MappingTree};
pub use record::Record;
