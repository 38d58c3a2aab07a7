//! Minification: projecting snapshots down to the fields that matter

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::snapshot::{NodeSnapshot, ServiceSnapshot};
use super::Minified;

/// Selects which labels survive minification
///
/// A label is kept when its key carries the prefix and is not the excluded
/// key, or when it is exactly the force-included key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilter {
    prefix: String,
    exclude: Option<String>,
    include: Option<String>,
}

impl LabelFilter {
    pub fn new(
        prefix: impl Into<String>,
        exclude: Option<String>,
        include: Option<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            exclude,
            include,
        }
    }

    /// Keep every label with `prefix`, nothing else
    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self::new(prefix, None, None)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn keeps(&self, key: &str) -> bool {
        if self.include.as_deref() == Some(key) {
            return true;
        }
        key.starts_with(&self.prefix) && self.exclude.as_deref() != Some(key)
    }

    pub fn apply(&self, labels: &HashMap<String, String>) -> HashMap<String, String> {
        labels
            .iter()
            .filter(|(k, _)| self.keeps(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Where one task of a service runs: node hostname, task address, node id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIp {
    pub name: String,
    pub addr: String,
    pub id: String,
}

impl NodeIp {
    pub fn new(name: impl Into<String>, addr: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceMini {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub global: bool,
    pub replicas: u64,
    pub container_image: String,
    pub node_info: Option<HashSet<NodeIp>>,
}

impl Minified for ServiceMini {
    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodeMini {
    pub id: String,
    pub hostname: String,
    pub address: String,
    pub role: String,
    pub state: String,
    pub availability: String,
    pub node_labels: HashMap<String, String>,
    pub engine_labels: HashMap<String, String>,
}

impl Minified for NodeMini {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Project a service snapshot down to its tracked fields.
///
/// Pure and infallible: a missing replica config means global mode or zero
/// replicas, and an empty node-info set is stored as `None`.
pub fn minify_service(snapshot: &ServiceSnapshot, filter: &LabelFilter) -> ServiceMini {
    let global = snapshot.is_global();
    let replicas = if global { 0 } else { snapshot.replicas() };

    ServiceMini {
        id: snapshot.id.clone(),
        name: snapshot.spec.name.clone(),
        labels: filter.apply(&snapshot.spec.labels),
        global,
        replicas,
        container_image: snapshot.spec.task_template.container_spec.image.clone(),
        node_info: snapshot
            .node_info
            .as_ref()
            .filter(|set| !set.is_empty())
            .cloned(),
    }
}

pub fn minify_node(snapshot: &NodeSnapshot, filter: &LabelFilter) -> NodeMini {
    NodeMini {
        id: snapshot.id.clone(),
        hostname: snapshot.description.hostname.clone(),
        address: snapshot.status.addr.clone(),
        role: snapshot.spec.role.clone(),
        state: snapshot.status.state.clone(),
        availability: snapshot.spec.availability.clone(),
        node_labels: filter.apply(&snapshot.spec.labels),
        engine_labels: filter.apply(&snapshot.description.engine.labels),
    }
}
