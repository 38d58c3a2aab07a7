//! Swarm entities and their minified, comparison-friendly projections
//!
//! The control plane reports full service and node snapshots. Change
//! detection only cares about a handful of fields, so every snapshot is
//! projected to a mini form before it is diffed or turned into outbound
//! notification parameters.

pub mod mini;
pub mod params;
pub mod snapshot;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use mini::{minify_node, minify_service, LabelFilter, NodeIp, NodeMini, ServiceMini};
pub use params::{
    encode_parameters, node_create_parameters, node_remove_parameters,
    service_create_parameters, service_remove_parameters, Parameters,
};
pub use snapshot::{NodeSnapshot, ServiceSnapshot};

/// Default prefix of the labels that are tracked and forwarded
pub const DEFAULT_LABEL_PREFIX: &str = "com.df.";

/// Label that marks a service for notification
pub const DEFAULT_NOTIFY_LABEL: &str = "com.df.notify";

/// Stack namespace label set by `docker stack deploy`
pub const STACK_NAMESPACE_LABEL: &str = "com.docker.stack.namespace";

/// The two kinds of entity the pipeline tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Service,
    Node,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Service => "service",
            EntityKind::Node => "node",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A minified snapshot that can be stored in the change cache
///
/// Equality is the change-detection relation: two minis are equal iff every
/// tracked field is equal, independent of label or address ordering.
pub trait Minified: Clone + PartialEq + Send + Sync + 'static {
    /// Stable identity assigned by the control plane
    fn id(&self) -> &str;
}
