//! Transport boundary for the resource mirror.
//!
//! The sync core never talks to a cluster directly; it consumes this trait.
//! The production implementation ([`KubeGateway`]) wraps the Kubernetes API
//! through the kube crate; tests script an in-memory one.

mod kube_gateway;

pub use kube_gateway::KubeGateway;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Boundary-level failures.
///
/// `Transport` leaves the operation in a retryable state; retries are always
/// caller-initiated. `NotFound` is an expected outcome (e.g. a custom kind
/// that is not registered yet) and must never be treated as fatal.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("kind {kind}.{group} is not served by the cluster")]
    NotFound { kind: String, group: String },
}

impl GatewayError {
    #[allow(dead_code)]
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. })
    }
}

/// Identity and capabilities of one resource kind, as reported by the
/// cluster's discovery catalog. Immutable once obtained from a given
/// catalog snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindDescriptor {
    pub kind: String,
    /// API group; empty string for the core group.
    pub group: String,
    pub version: String,
    /// Plural resource name used in API paths (e.g. "deployments").
    pub plural: String,
    pub namespaced: bool,
    /// Some kinds (ComponentStatus) are listable but reject watches.
    pub watchable: bool,
}

impl KindDescriptor {
    /// Full apiVersion string ("v1", "apps/v1", "cert-manager.io/v1").
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Registry key: kinds are unique per (kind, group) within a cluster.
    pub fn key(&self) -> (String, String) {
        (self.kind.clone(), self.group.clone())
    }
}

/// One mirrored object: identifying metadata plus the raw payload.
///
/// `uid` is the stable identifier the cache is keyed by; `resource_version`
/// is the cluster's opaque per-kind change marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceObject {
    pub uid: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub resource_version: String,
    pub payload: serde_json::Value,
}

/// One bounded slice of a list enumeration.
#[derive(Debug, Clone)]
pub struct ResourcePage {
    pub items: Vec<ResourceObject>,
    /// `None` means the enumeration is complete.
    pub next_token: Option<String>,
    /// List-time resource version; watches anchor here.
    pub snapshot_marker: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub object: ResourceObject,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, GatewayError>> + Send>>;

/// What the sync core needs from a cluster. One instance per connected
/// cluster; the session controller constructs a fresh one on every connect.
#[async_trait]
pub trait ResourceGateway: Send + Sync + 'static {
    /// Cheap liveness check, used before any cache is populated.
    async fn probe(&self) -> Result<(), GatewayError>;

    /// Fetch the cluster's kind catalog. Called once per connection.
    async fn discover_kinds(&self) -> Result<Vec<KindDescriptor>, GatewayError>;

    /// Fetch one bounded page. Passing the `next_token` of a prior page
    /// continues the same enumeration; items are never re-delivered across
    /// pages of one enumeration.
    async fn fetch_page(
        &self,
        kind: &KindDescriptor,
        limit: u32,
        token: Option<&str>,
    ) -> Result<ResourcePage, GatewayError>;

    /// Open a watch anchored at a snapshot marker. Events observed since the
    /// marker are delivered in cluster order per identifier.
    async fn open_watch(
        &self,
        kind: &KindDescriptor,
        marker: &str,
    ) -> Result<WatchStream, GatewayError>;
}
