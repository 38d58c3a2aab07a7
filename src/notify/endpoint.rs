//! Recipient endpoints, grouped by host
//!
//! Create and remove URLs for services and nodes are configured as separate
//! comma-separated lists. URLs that share a host belong to the same physical
//! recipient and therefore share one delivery lane.

use std::collections::BTreeMap;

use reqwest::Url;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EndpointError {
    #[error("{host} already has {kind} URL {existing}; cannot also use {addr}")]
    DuplicateSlot {
        host: String,
        kind: &'static str,
        existing: String,
        addr: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointAddrs {
    /// Empty when the recipient does not want creates
    pub create: String,
    /// Empty when the recipient does not want removes
    pub remove: String,
}

/// All notification targets of one recipient host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub service: Option<EndpointAddrs>,
    pub node: Option<EndpointAddrs>,
}

#[derive(Clone, Copy)]
enum Slot {
    ServiceCreate,
    ServiceRemove,
    NodeCreate,
    NodeRemove,
}

impl Slot {
    fn as_str(self) -> &'static str {
        match self {
            Slot::ServiceCreate => "service create",
            Slot::ServiceRemove => "service remove",
            Slot::NodeCreate => "node create",
            Slot::NodeRemove => "node remove",
        }
    }
}

/// `host` or `host:port`, the grouping key for a recipient URL
pub fn host_key(addr: &str) -> Option<String> {
    let url = Url::parse(addr).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn split_addrs(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Group the configured URL lists into one endpoint per host.
///
/// Malformed URLs are logged and skipped. A host has one lane, so it may
/// list at most one URL per slot; a second one is an error.
pub fn build_endpoints(
    service_create: &str,
    service_remove: &str,
    node_create: &str,
    node_remove: &str,
) -> Result<Vec<Endpoint>, EndpointError> {
    let mut by_host: BTreeMap<String, Endpoint> = BTreeMap::new();

    let lists = [
        (service_create, Slot::ServiceCreate),
        (service_remove, Slot::ServiceRemove),
        (node_create, Slot::NodeCreate),
        (node_remove, Slot::NodeRemove),
    ];

    for (list, slot) in lists {
        for addr in split_addrs(list) {
            let Some(host) = host_key(addr) else {
                warn!("Skipping malformed notification URL: {}", addr);
                continue;
            };

            let endpoint = by_host.entry(host.clone()).or_insert_with(|| Endpoint {
                host: host.clone(),
                ..Default::default()
            });

            let (addrs, is_create) = match slot {
                Slot::ServiceCreate => (endpoint.service.get_or_insert_with(Default::default), true),
                Slot::ServiceRemove => (endpoint.service.get_or_insert_with(Default::default), false),
                Slot::NodeCreate => (endpoint.node.get_or_insert_with(Default::default), true),
                Slot::NodeRemove => (endpoint.node.get_or_insert_with(Default::default), false),
            };

            let target = if is_create {
                &mut addrs.create
            } else {
                &mut addrs.remove
            };
            if !target.is_empty() {
                return Err(EndpointError::DuplicateSlot {
                    host,
                    kind: slot.as_str(),
                    existing: target.clone(),
                    addr: addr.to_string(),
                });
            }
            *target = addr.to_string();
        }
    }

    Ok(by_host.into_values().collect())
}
