//! Change sources: the control-plane seam, the event stream and the poller
//!
//! Both the push event stream and the reconciliation poller produce the same
//! [`ChangeEvent`] shape, so the listener does not care where a change came
//! from.

pub mod docker;
pub mod poller;
pub mod stream;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::entity::{
    minify_node, minify_service, node_create_parameters, node_remove_parameters,
    service_create_parameters, service_remove_parameters, EntityKind, LabelFilter, Minified,
    NodeMini, NodeSnapshot, Parameters, ServiceMini, ServiceSnapshot, STACK_NAMESPACE_LABEL,
};

pub use docker::DockerClient;
pub use poller::Poller;
pub use stream::EventStreamListener;

/// Errors reported by the control plane
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("Invalid Docker host: {0}")]
    InvalidHost(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Docker API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Event stream error: {0}")]
    Stream(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),
}

/// A raw change notice from the control plane's event stream
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub kind: EntityKind,
    pub action: String,
    pub id: String,
    pub attributes: HashMap<String, String>,
    pub time_nanos: i64,
}

pub type RawEventStream = BoxStream<'static, Result<RawEvent, ControlPlaneError>>;

/// What the cluster control plane offers the pipeline
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn list_services(&self) -> Result<Vec<ServiceSnapshot>, ControlPlaneError>;

    async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>, ControlPlaneError>;

    /// `Ok(None)` when the service no longer exists
    async fn inspect_service(&self, id: &str)
        -> Result<Option<ServiceSnapshot>, ControlPlaneError>;

    /// `Ok(None)` when the node no longer exists
    async fn inspect_node(&self, id: &str) -> Result<Option<NodeSnapshot>, ControlPlaneError>;

    /// Open a change stream for one entity kind.
    ///
    /// Returning `Ok` means the stream is established; no change after this
    /// point is missed.
    async fn stream_changes(&self, kind: EntityKind) -> Result<RawEventStream, ControlPlaneError>;
}

pub type SharedControlPlane = Arc<dyn ControlPlane>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Remove,
}

/// A detected change, from either the event stream or the poller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub id: String,
    pub observed_at_nanos: i64,
    /// Diff through the cache before notifying. Only administrator-forced
    /// resyncs set this to false.
    pub use_cache: bool,
}

impl ChangeEvent {
    pub fn create(id: impl Into<String>, use_cache: bool) -> Self {
        Self {
            kind: ChangeKind::Create,
            id: id.into(),
            observed_at_nanos: now_nanos(),
            use_cache,
        }
    }

    pub fn remove(id: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Remove,
            id: id.into(),
            observed_at_nanos: now_nanos(),
            use_cache: true,
        }
    }
}

pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Something that can list, inspect and minify one kind of entity, and
/// encode its minis as notification parameters
#[async_trait]
pub trait EntitySource: Send + Sync + 'static {
    type Mini: Minified;

    fn kind(&self) -> EntityKind;

    async fn list(&self) -> Result<Vec<Self::Mini>, ControlPlaneError>;

    /// `Ok(None)` when the entity is gone or no longer eligible
    async fn inspect(&self, id: &str) -> Result<Option<Self::Mini>, ControlPlaneError>;

    fn create_parameters(&self, mini: &Self::Mini) -> Parameters;

    fn remove_parameters(&self, mini: &Self::Mini) -> Parameters;
}

/// Services carrying `<notify_label>=true`
pub struct ServiceSource {
    client: SharedControlPlane,
    notify_label: String,
    filter: LabelFilter,
}

impl ServiceSource {
    pub fn new(client: SharedControlPlane, label_prefix: &str, notify_label: &str) -> Self {
        Self {
            client,
            notify_label: notify_label.to_string(),
            filter: LabelFilter::new(
                label_prefix,
                Some(notify_label.to_string()),
                Some(STACK_NAMESPACE_LABEL.to_string()),
            ),
        }
    }

    fn eligible(&self, snapshot: &ServiceSnapshot) -> bool {
        snapshot
            .spec
            .labels
            .get(&self.notify_label)
            .is_some_and(|v| v == "true")
    }
}

#[async_trait]
impl EntitySource for ServiceSource {
    type Mini = ServiceMini;

    fn kind(&self) -> EntityKind {
        EntityKind::Service
    }

    async fn list(&self) -> Result<Vec<ServiceMini>, ControlPlaneError> {
        let services = self.client.list_services().await?;
        Ok(services
            .iter()
            .filter(|s| self.eligible(s))
            .map(|s| minify_service(s, &self.filter))
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<Option<ServiceMini>, ControlPlaneError> {
        let snapshot = self.client.inspect_service(id).await?;
        Ok(snapshot
            .filter(|s| self.eligible(s))
            .map(|s| minify_service(&s, &self.filter)))
    }

    fn create_parameters(&self, mini: &ServiceMini) -> Parameters {
        service_create_parameters(mini, self.filter.prefix())
    }

    fn remove_parameters(&self, mini: &ServiceMini) -> Parameters {
        service_remove_parameters(mini, self.filter.prefix())
    }
}

pub struct NodeSource {
    client: SharedControlPlane,
    filter: LabelFilter,
}

impl NodeSource {
    pub fn new(client: SharedControlPlane, label_prefix: &str) -> Self {
        Self {
            client,
            filter: LabelFilter::prefixed(label_prefix),
        }
    }
}

#[async_trait]
impl EntitySource for NodeSource {
    type Mini = NodeMini;

    fn kind(&self) -> EntityKind {
        EntityKind::Node
    }

    async fn list(&self) -> Result<Vec<NodeMini>, ControlPlaneError> {
        let nodes = self.client.list_nodes().await?;
        Ok(nodes.iter().map(|n| minify_node(n, &self.filter)).collect())
    }

    async fn inspect(&self, id: &str) -> Result<Option<NodeMini>, ControlPlaneError> {
        let snapshot = self.client.inspect_node(id).await?;
        Ok(snapshot.map(|n| minify_node(&n, &self.filter)))
    }

    fn create_parameters(&self, mini: &NodeMini) -> Parameters {
        node_create_parameters(mini, self.filter.prefix())
    }

    fn remove_parameters(&self, mini: &NodeMini) -> Parameters {
        node_remove_parameters(mini)
    }
}
