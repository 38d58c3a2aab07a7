//! Full service and node snapshots as reported by the Docker Engine API

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::mini::NodeIp;

/// A Swarm service as returned by `GET /services/{id}`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceSnapshot {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(default)]
    pub spec: ServiceSpec,

    /// Placement of running tasks, attached by the client when node-IP
    /// info is enabled. Not part of the Engine API payload.
    #[serde(skip)]
    pub node_info: Option<HashSet<NodeIp>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceSpec {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub mode: ServiceMode,

    #[serde(default)]
    pub task_template: TaskTemplate,
}

/// Either `{"Replicated": {"Replicas": n}}` or `{"Global": {}}`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceMode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicated: Option<ReplicatedMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ReplicatedMode {
    #[serde(default)]
    pub replicas: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskTemplate {
    #[serde(default)]
    pub container_spec: ContainerSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSpec {
    #[serde(default)]
    pub image: String,
}

impl ServiceSnapshot {
    /// Build a replicated service snapshot (used by tests and fakes)
    pub fn replicated(
        id: impl Into<String>,
        name: impl Into<String>,
        replicas: u64,
        labels: HashMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            spec: ServiceSpec {
                name: name.into(),
                labels,
                mode: ServiceMode {
                    replicated: Some(ReplicatedMode {
                        replicas: Some(replicas),
                    }),
                    global: None,
                },
                task_template: TaskTemplate::default(),
            },
            node_info: None,
        }
    }

    /// Global-mode services run one task per node and have no replica count.
    pub fn is_global(&self) -> bool {
        self.spec.mode.global.is_some()
    }

    pub fn replicas(&self) -> u64 {
        self.spec
            .mode
            .replicated
            .as_ref()
            .and_then(|r| r.replicas)
            .unwrap_or(0)
    }
}

/// A Swarm node as returned by `GET /nodes/{id}`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeSnapshot {
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(default)]
    pub spec: NodeSpec,

    #[serde(default)]
    pub description: NodeDescription,

    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeSpec {
    #[serde(default)]
    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub role: String,

    #[serde(default)]
    pub availability: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeDescription {
    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub engine: EngineDescription,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EngineDescription {
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NodeStatus {
    #[serde(default)]
    pub state: String,

    #[serde(default)]
    pub addr: String,
}

impl NodeSnapshot {
    /// Build a node snapshot (used by tests and fakes)
    pub fn new(
        id: impl Into<String>,
        hostname: impl Into<String>,
        role: impl Into<String>,
        labels: HashMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            spec: NodeSpec {
                labels,
                role: role.into(),
                availability: "active".to_string(),
            },
            description: NodeDescription {
                hostname: hostname.into(),
                engine: EngineDescription::default(),
            },
            status: NodeStatus {
                state: "ready".to_string(),
                addr: String::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_replicated_service() {
        let json = r#"{
            "ID": "svc1",
            "Version": {"Index": 12},
            "Spec": {
                "Name": "proxy_app",
                "Labels": {"com.df.notify": "true", "com.df.servicePath": "/app"},
                "Mode": {"Replicated": {"Replicas": 3}},
                "TaskTemplate": {"ContainerSpec": {"Image": "nginx:1.25"}}
            }
        }"#;

        let svc: ServiceSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(svc.id, "svc1");
        assert_eq!(svc.spec.name, "proxy_app");
        assert_eq!(svc.replicas(), 3);
        assert!(!svc.is_global());
        assert_eq!(svc.spec.task_template.container_spec.image, "nginx:1.25");
        assert!(svc.node_info.is_none());
    }

    #[test]
    fn test_deserialize_global_service() {
        let json = r#"{"ID": "svc2", "Spec": {"Name": "agent", "Mode": {"Global": {}}}}"#;

        let svc: ServiceSnapshot = serde_json::from_str(json).unwrap();
        assert!(svc.is_global());
        assert_eq!(svc.replicas(), 0);
    }

    #[test]
    fn test_deserialize_node() {
        let json = r#"{
            "ID": "node1",
            "Spec": {"Labels": {"com.df.zone": "a"}, "Role": "manager", "Availability": "active"},
            "Description": {"Hostname": "host-1", "Engine": {"Labels": {"com.df.gpu": "no"}}},
            "Status": {"State": "ready", "Addr": "10.0.0.5"}
        }"#;

        let node: NodeSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(node.description.hostname, "host-1");
        assert_eq!(node.spec.role, "manager");
        assert_eq!(node.status.addr, "10.0.0.5");
        assert_eq!(node.description.engine.labels["com.df.gpu"], "no");
    }
}
