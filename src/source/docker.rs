//! Docker Engine API client
//!
//! Talks to the Engine's HTTP API over TCP (`DOCKER_HOST=tcp://host:port`).
//! Events are read from `GET /events` as newline-delimited JSON.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{ControlPlane, ControlPlaneError, RawEvent, RawEventStream};
use crate::entity::{EntityKind, NodeIp, NodeSnapshot, ServiceSnapshot};

/// Label naming the network whose task addresses go into node-IP info
pub const SCRAPE_NETWORK_LABEL: &str = "com.df.scrapeNetwork";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest `/events` line accepted before the stream is treated as broken
pub const MAX_EVENT_LINE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DockerClientConfig {
    /// `tcp://host:port`, `http://host:port` or `https://host:port`
    pub host: String,
    /// Only services carrying `<label>=true` are listed
    pub service_label_filter: Option<String>,
    /// Attach task placement to service snapshots
    pub include_node_ip_info: bool,
}

pub struct DockerClient {
    http_client: Client,
    base_url: Url,
    config: DockerClientConfig,
}

/// Convert a Docker host string into an HTTP base URL
pub fn parse_docker_host(host: &str) -> Result<Url, ControlPlaneError> {
    let normalized = if let Some(rest) = host.strip_prefix("tcp://") {
        format!("http://{}", rest)
    } else if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        return Err(ControlPlaneError::InvalidHost(format!(
            "{} (only tcp://, http:// and https:// hosts are supported)",
            host
        )));
    };

    Url::parse(&normalized).map_err(|e| ControlPlaneError::InvalidHost(format!("{}: {}", host, e)))
}

#[derive(Debug, Deserialize)]
struct DockerEvent {
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: DockerActor,
    #[serde(rename = "timeNano", default)]
    time_nano: i64,
}

#[derive(Debug, Default, Deserialize)]
struct DockerActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Task {
    #[serde(rename = "NodeID", default)]
    node_id: String,
    #[serde(default)]
    networks_attachments: Vec<NetworkAttachment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkAttachment {
    #[serde(default)]
    network: AttachedNetwork,
    #[serde(default)]
    addresses: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachedNetwork {
    #[serde(default)]
    spec: AttachedNetworkSpec,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachedNetworkSpec {
    #[serde(default)]
    name: String,
}

/// Parse one line of the `/events` stream
pub fn parse_event_line(kind: EntityKind, line: &[u8]) -> Result<Option<RawEvent>, ControlPlaneError> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let event: DockerEvent =
        serde_json::from_slice(trimmed).map_err(|e| ControlPlaneError::Decode(e.to_string()))?;

    Ok(Some(RawEvent {
        kind,
        action: event.action,
        id: event.actor.id,
        attributes: event.actor.attributes,
        time_nanos: event.time_nano,
    }))
}

/// Split a byte stream into newline-terminated lines.
///
/// A line growing past `max_line` bytes yields one `Stream` error and ends
/// the stream, so the caller reconnects instead of buffering forever.
pub fn split_lines<B, E>(
    body: impl Stream<Item = Result<B, E>> + Send + 'static,
    max_line: usize,
) -> impl Stream<Item = Result<Vec<u8>, ControlPlaneError>> + Send
where
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = (body.boxed(), Vec::<u8>::new(), false);
    futures::stream::unfold(state, move |(mut body, mut buf, done)| async move {
        if done {
            return None;
        }
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                return Some((Ok(line), (body, buf, false)));
            }
            if buf.len() > max_line {
                let err = ControlPlaneError::Stream(format!(
                    "event line exceeds {} bytes without a newline",
                    max_line
                ));
                return Some((Err(err), (body, Vec::new(), true)));
            }
            match body.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    let err = ControlPlaneError::Stream(e.to_string());
                    return Some((Err(err), (body, buf, false)));
                }
                None => return None,
            }
        }
    })
}

/// Pick one address per task: the scrape network's if named, else the first
fn task_address(task: &Task, network: Option<&str>) -> Option<String> {
    let attachment = match network {
        Some(name) => task
            .networks_attachments
            .iter()
            .find(|a| a.network.spec.name == name),
        None => task.networks_attachments.first(),
    }?;

    let address = attachment.addresses.first()?;
    // Addresses come in CIDR form
    Some(address.split('/').next().unwrap_or(address).to_string())
}

impl DockerClient {
    pub fn new(config: DockerClientConfig) -> Result<Self, ControlPlaneError> {
        let base_url = parse_docker_host(&config.host)?;
        // No client-wide timeout: the events request stays open indefinitely
        let http_client = Client::builder().build()?;

        Ok(Self {
            http_client,
            base_url,
            config,
        })
    }

    fn url(&self, path: &str) -> Result<Url, ControlPlaneError> {
        self.base_url
            .join(path)
            .map_err(|e| ControlPlaneError::InvalidHost(e.to_string()))
    }

    async fn check(response: Response) -> Result<Response, ControlPlaneError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        Err(ControlPlaneError::Api { status, message })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        filters: Option<serde_json::Value>,
    ) -> Result<Option<T>, ControlPlaneError> {
        let mut request = self.http_client.get(self.url(path)?).timeout(REQUEST_TIMEOUT);
        if let Some(filters) = filters {
            request = request.query(&[("filters", filters.to_string())]);
        }

        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body = Self::check(response).await?.bytes().await?;
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| ControlPlaneError::Decode(e.to_string()))
    }

    async fn get_list<T: DeserializeOwned>(
        &self,
        path: &str,
        filters: Option<serde_json::Value>,
    ) -> Result<Vec<T>, ControlPlaneError> {
        Ok(self.get_json(path, filters).await?.unwrap_or_default())
    }

    async fn node_hostnames(&self) -> Result<HashMap<String, String>, ControlPlaneError> {
        let nodes: Vec<NodeSnapshot> = self.get_list("nodes", None).await?;
        Ok(nodes
            .into_iter()
            .map(|n| (n.id, n.description.hostname))
            .collect())
    }

    /// Collect `(hostname, address, node id)` for the running tasks of a service
    async fn node_info(
        &self,
        service: &ServiceSnapshot,
        hostnames: &HashMap<String, String>,
    ) -> Result<HashSet<NodeIp>, ControlPlaneError> {
        let filters = serde_json::json!({
            "service": [service.id],
            "desired-state": ["running"],
        });
        let tasks: Vec<Task> = self.get_list("tasks", Some(filters)).await?;
        let network = service.spec.labels.get(SCRAPE_NETWORK_LABEL).map(String::as_str);

        Ok(tasks
            .iter()
            .filter_map(|task| {
                let addr = task_address(task, network)?;
                let name = hostnames.get(&task.node_id).cloned().unwrap_or_default();
                Some(NodeIp::new(name, addr, task.node_id.clone()))
            })
            .collect())
    }

    /// A failed `/nodes` or `/tasks` call fails the whole snapshot; a
    /// snapshot missing its placement would read as a change.
    async fn attach_node_info(&self, services: &mut [ServiceSnapshot]) -> Result<(), ControlPlaneError> {
        if !self.config.include_node_ip_info || services.is_empty() {
            return Ok(());
        }

        let hostnames = self.node_hostnames().await.inspect_err(|e| {
            warn!("Failed to list nodes for node-IP info: {}", e);
        })?;

        for service in services.iter_mut() {
            let info = self.node_info(service, &hostnames).await.inspect_err(|e| {
                warn!("Failed to collect node-IP info for {}: {}", service.id, e);
            })?;
            service.node_info = Some(info);
        }
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for DockerClient {
    async fn list_services(&self) -> Result<Vec<ServiceSnapshot>, ControlPlaneError> {
        let filters = self
            .config
            .service_label_filter
            .as_ref()
            .map(|label| serde_json::json!({ "label": [format!("{}=true", label)] }));

        let mut services: Vec<ServiceSnapshot> = self.get_list("services", filters).await?;
        self.attach_node_info(&mut services).await?;
        Ok(services)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeSnapshot>, ControlPlaneError> {
        self.get_list("nodes", None).await
    }

    async fn inspect_service(
        &self,
        id: &str,
    ) -> Result<Option<ServiceSnapshot>, ControlPlaneError> {
        let Some(service) = self
            .get_json::<ServiceSnapshot>(&format!("services/{}", id), None)
            .await?
        else {
            return Ok(None);
        };

        let mut services = [service];
        self.attach_node_info(&mut services).await?;
        let [service] = services;
        Ok(Some(service))
    }

    async fn inspect_node(&self, id: &str) -> Result<Option<NodeSnapshot>, ControlPlaneError> {
        self.get_json(&format!("nodes/{}", id), None).await
    }

    async fn stream_changes(&self, kind: EntityKind) -> Result<RawEventStream, ControlPlaneError> {
        let filters = serde_json::json!({ "type": [kind.as_str()] });
        let response = self
            .http_client
            .get(self.url("events")?)
            .query(&[("filters", filters.to_string())])
            .send()
            .await?;
        let response = Self::check(response).await?;
        debug!("Opened {} event stream", kind);

        let lines = split_lines(response.bytes_stream(), MAX_EVENT_LINE);
        let events = lines.filter_map(move |line| async move {
            match line {
                Ok(line) => parse_event_line(kind, &line).transpose(),
                Err(e) => Some(Err(e)),
            }
        });

        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode as HttpStatus;
    use axum::response::{IntoResponse, Response as AxumResponse};
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn web_service() -> serde_json::Value {
        json!({
            "ID": "s1",
            "Spec": {"Name": "web", "Labels": {"com.df.notify": "true"}}
        })
    }

    async fn tasks(State(fail): State<Arc<AtomicBool>>) -> AxumResponse {
        if fail.load(Ordering::SeqCst) {
            return (HttpStatus::INTERNAL_SERVER_ERROR, "tasks unavailable").into_response();
        }
        Json(json!([{
            "NodeID": "n1",
            "NetworksAttachments": [
                {"Network": {"Spec": {"Name": "proxy"}}, "Addresses": ["10.0.1.7/24"]}
            ]
        }]))
        .into_response()
    }

    /// Minimal Engine API serving one service, one node and switchable tasks
    async fn start_fake_engine(fail_tasks: Arc<AtomicBool>) -> String {
        let app = Router::new()
            .route("/services", get(|| async { Json(json!([web_service()])) }))
            .route("/services/{id}", get(|| async { Json(web_service()) }))
            .route(
                "/nodes",
                get(|| async { Json(json!([{"ID": "n1", "Description": {"Hostname": "host-1"}}])) }),
            )
            .route("/tasks", get(tasks))
            .with_state(fail_tasks);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("tcp://{}", addr)
    }

    fn client_with_node_info(host: String) -> DockerClient {
        DockerClient::new(DockerClientConfig {
            host,
            service_label_filter: Some("com.df.notify".to_string()),
            include_node_ip_info: true,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_task_listing_failure_fails_inspect() {
        let fail_tasks = Arc::new(AtomicBool::new(true));
        let client = client_with_node_info(start_fake_engine(fail_tasks.clone()).await);

        let result = client.inspect_service("s1").await;
        assert!(matches!(result, Err(ControlPlaneError::Api { status: 500, .. })));
        assert!(client.list_services().await.is_err());

        fail_tasks.store(false, Ordering::SeqCst);
        let service = client.inspect_service("s1").await.unwrap().unwrap();
        let expected: HashSet<NodeIp> = [NodeIp::new("host-1", "10.0.1.7", "n1")].into();
        assert_eq!(service.node_info, Some(expected));
    }

    #[tokio::test]
    async fn test_inspect_without_node_info_skips_tasks() {
        let fail_tasks = Arc::new(AtomicBool::new(true));
        let host = start_fake_engine(fail_tasks).await;
        let client = DockerClient::new(DockerClientConfig {
            host,
            service_label_filter: None,
            include_node_ip_info: false,
        })
        .unwrap();

        let service = client.inspect_service("s1").await.unwrap().unwrap();
        assert_eq!(service.spec.name, "web");
        assert!(service.node_info.is_none());
    }

    #[tokio::test]
    async fn test_split_lines() {
        let chunks = vec![
            Ok::<_, std::io::Error>(b"{\"a\":1}\n{\"b\"".to_vec()),
            Ok(b":2}\n".to_vec()),
        ];
        let lines: Vec<_> = split_lines(futures::stream::iter(chunks), 64).collect().await;

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].as_ref().unwrap(), b"{\"a\":1}\n");
        assert_eq!(lines[1].as_ref().unwrap(), b"{\"b\":2}\n");
    }

    #[tokio::test]
    async fn test_split_lines_caps_unterminated_line() {
        let chunks = vec![
            Ok::<_, std::io::Error>(vec![b'x'; 40]),
            Ok(vec![b'x'; 40]),
            Ok(b"\n".to_vec()),
        ];
        let lines: Vec<_> = split_lines(futures::stream::iter(chunks), 64).collect().await;

        assert_eq!(lines.len(), 1);
        assert!(matches!(lines[0], Err(ControlPlaneError::Stream(_))));
    }

    #[test]
    fn test_parse_docker_host() {
        assert_eq!(
            parse_docker_host("tcp://localhost:2375").unwrap().as_str(),
            "http://localhost:2375/"
        );
        assert_eq!(
            parse_docker_host("https://docker.internal:2376").unwrap().as_str(),
            "https://docker.internal:2376/"
        );
        assert!(matches!(
            parse_docker_host("unix:///var/run/docker.sock"),
            Err(ControlPlaneError::InvalidHost(_))
        ));
    }

    #[test]
    fn test_parse_event_line() {
        let line = br#"{"Type":"service","Action":"update","Actor":{"ID":"svc1","Attributes":{"name":"web"}},"scope":"swarm","time":1700000000,"timeNano":1700000000123456789}"#;

        let event = parse_event_line(EntityKind::Service, line).unwrap().unwrap();
        assert_eq!(event.action, "update");
        assert_eq!(event.id, "svc1");
        assert_eq!(event.attributes["name"], "web");
        assert_eq!(event.time_nanos, 1_700_000_000_123_456_789);
    }

    #[test]
    fn test_parse_blank_and_invalid_lines() {
        assert!(parse_event_line(EntityKind::Node, b"\n").unwrap().is_none());
        assert!(matches!(
            parse_event_line(EntityKind::Node, b"{not json"),
            Err(ControlPlaneError::Decode(_))
        ));
    }

    #[test]
    fn test_task_address_prefers_scrape_network() {
        let task: Task = serde_json::from_str(
            r#"{
                "NodeID": "node1",
                "NetworksAttachments": [
                    {"Network": {"Spec": {"Name": "ingress"}}, "Addresses": ["10.255.0.5/16"]},
                    {"Network": {"Spec": {"Name": "proxy"}}, "Addresses": ["10.0.1.7/24"]}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(task_address(&task, Some("proxy")).as_deref(), Some("10.0.1.7"));
        assert_eq!(task_address(&task, None).as_deref(), Some("10.255.0.5"));
        assert!(task_address(&task, Some("missing")).is_none());
    }

    #[test]
    fn test_client_rejects_unix_socket() {
        let result = DockerClient::new(DockerClientConfig {
            host: "unix:///var/run/docker.sock".to_string(),
            service_label_filter: None,
            include_node_ip_info: false,
        });
        assert!(result.is_err());
    }
}
