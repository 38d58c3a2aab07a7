//! Outbound notification parameters
//!
//! Parameters are kept in a sorted map so the encoded query string is
//! deterministic, then percent-encoded with `url::form_urlencoded`.

use std::collections::BTreeMap;

use url::form_urlencoded;

use super::mini::{NodeMini, ServiceMini};
use super::STACK_NAMESPACE_LABEL;

pub type Parameters = BTreeMap<String, String>;

const SHORT_NAME_LABEL: &str = "shortName";
const DISTRIBUTE_LABEL: &str = "distribute";

/// Strip `prefix` from every tracked label, dropping labels without it.
fn prefixed_labels<'a>(
    labels: impl IntoIterator<Item = (&'a String, &'a String)>,
    prefix: &str,
) -> Parameters {
    labels
        .into_iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(prefix)
                .filter(|stripped| !stripped.is_empty())
                .map(|stripped| (stripped.to_string(), v.clone()))
        })
        .collect()
}

/// The name recipients should use for the service.
///
/// With `<prefix>shortName=true` and a stack namespace label, the
/// `<stack>_` prefix Docker adds to stack services is trimmed.
fn service_name(mini: &ServiceMini, prefix: &str) -> String {
    let short = mini
        .labels
        .get(&format!("{}{}", prefix, SHORT_NAME_LABEL))
        .is_some_and(|v| v == "true");

    if short {
        if let Some(stack) = mini.labels.get(STACK_NAMESPACE_LABEL) {
            let stack_prefix = format!("{}_", stack);
            if let Some(trimmed) = mini.name.strip_prefix(&stack_prefix) {
                return trimmed.to_string();
            }
        }
    }
    mini.name.clone()
}

fn distribute(mini: &ServiceMini, prefix: &str) -> String {
    mini.labels
        .get(&format!("{}{}", prefix, DISTRIBUTE_LABEL))
        .cloned()
        .unwrap_or_else(|| "true".to_string())
}

pub fn service_create_parameters(mini: &ServiceMini, prefix: &str) -> Parameters {
    let mut params = prefixed_labels(&mini.labels, prefix);

    params.insert("serviceName".to_string(), service_name(mini, prefix));
    params.insert("distribute".to_string(), distribute(mini, prefix));

    if !mini.global {
        params.insert("replicas".to_string(), mini.replicas.to_string());
    }

    if let Some(node_info) = mini.node_info.as_ref().filter(|s| !s.is_empty()) {
        let mut triples: Vec<[&str; 3]> = node_info
            .iter()
            .map(|n| [n.name.as_str(), n.addr.as_str(), n.id.as_str()])
            .collect();
        triples.sort_unstable();
        if let Ok(json) = serde_json::to_string(&triples) {
            params.insert("nodeInfo".to_string(), json);
        }
    }

    params
}

pub fn service_remove_parameters(mini: &ServiceMini, prefix: &str) -> Parameters {
    let mut params = Parameters::new();
    params.insert("serviceName".to_string(), service_name(mini, prefix));
    params.insert("distribute".to_string(), distribute(mini, prefix));
    params
}

pub fn node_create_parameters(mini: &NodeMini, prefix: &str) -> Parameters {
    // Node labels win over engine labels on key collision
    let mut params = prefixed_labels(&mini.engine_labels, prefix);
    params.extend(prefixed_labels(&mini.node_labels, prefix));

    params.insert("id".to_string(), mini.id.clone());
    params.insert("hostname".to_string(), mini.hostname.clone());
    params.insert("address".to_string(), mini.address.clone());
    params.insert("role".to_string(), mini.role.clone());
    params.insert("state".to_string(), mini.state.clone());
    params.insert("availability".to_string(), mini.availability.clone());
    params
}

pub fn node_remove_parameters(mini: &NodeMini) -> Parameters {
    let mut params = Parameters::new();
    params.insert("id".to_string(), mini.id.clone());
    params.insert("hostname".to_string(), mini.hostname.clone());
    params.insert("address".to_string(), mini.address.clone());
    params
}

/// Percent-encode parameters as a query string (without the leading `?`)
pub fn encode_parameters(params: &Parameters) -> String {
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish()
}
