use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "swarm-listener")]
#[command(about = "Relay Docker Swarm service and node changes to HTTP listeners")]
#[command(version)]
pub struct Args {
    /// Docker Engine API address (tcp:// or http://)
    #[arg(long, env = "DOCKER_HOST", default_value = "tcp://localhost:2375")]
    pub docker_host: String,

    /// Comma-separated URLs notified when a service is created or updated
    /// (at most one per host)
    #[arg(long, env = "DF_NOTIFY_CREATE_SERVICE_URL", default_value = "")]
    pub notify_create_service_url: String,

    /// Comma-separated URLs notified when a service is removed (at most one per host)
    #[arg(long, env = "DF_NOTIFY_REMOVE_SERVICE_URL", default_value = "")]
    pub notify_remove_service_url: String,

    /// Comma-separated URLs notified when a node is created or updated
    /// (at most one per host)
    #[arg(long, env = "DF_NOTIFY_CREATE_NODE_URL", default_value = "")]
    pub notify_create_node_url: String,

    /// Comma-separated URLs notified when a node is removed (at most one per host)
    #[arg(long, env = "DF_NOTIFY_REMOVE_NODE_URL", default_value = "")]
    pub notify_remove_node_url: String,

    /// Delivery attempts per notification
    #[arg(long, env = "DF_RETRY", default_value = "50")]
    pub retry: u32,

    /// Seconds between delivery attempts
    #[arg(long, env = "DF_RETRY_INTERVAL", default_value = "5")]
    pub retry_interval: u64,

    /// Seconds between full service reconciliations (<= 0 disables)
    #[arg(
        long,
        env = "DF_SERVICE_POLLING_INTERVAL",
        default_value = "-1",
        allow_hyphen_values = true
    )]
    pub service_polling_interval: i64,

    /// Seconds between full node reconciliations (<= 0 disables)
    #[arg(
        long,
        env = "DF_NODE_POLLING_INTERVAL",
        default_value = "-1",
        allow_hyphen_values = true
    )]
    pub node_polling_interval: i64,

    /// Follow the Docker event stream for services
    #[arg(long, env = "DF_USE_DOCKER_SERVICE_EVENTS", default_value_t = true, action = ArgAction::Set)]
    pub use_docker_service_events: bool,

    /// Follow the Docker event stream for nodes
    #[arg(long, env = "DF_USE_DOCKER_NODE_EVENTS", default_value_t = true, action = ArgAction::Set)]
    pub use_docker_node_events: bool,

    /// Only services with `<label>=true` are tracked
    #[arg(long, env = "DF_NOTIFY_LABEL", default_value = "com.df.notify")]
    pub notify_label: String,

    /// Prefix of labels forwarded to listeners
    #[arg(long, env = "DF_LABEL_PREFIX", default_value = "com.df.")]
    pub label_prefix: String,

    /// Send task placement (`nodeInfo`) with service notifications
    #[arg(long, env = "DF_INCLUDE_NODE_IP_INFO", default_value_t = false, action = ArgAction::Set)]
    pub include_node_ip_info: bool,

    /// Notify listeners about every existing service and node at startup
    #[arg(long, env = "DF_NOTIFY_ON_START", default_value_t = false, action = ArgAction::Set)]
    pub notify_on_start: bool,

    /// Bind address of the admin HTTP surface
    #[arg(long, env = "DF_BIND_ADDR", value_name = "ADDR", default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Port of the admin HTTP surface
    #[arg(short, long, env = "DF_PORT", value_name = "PORT", default_value = "8080")]
    pub port: u16,

    /// Path to a .env file loaded before reading the environment
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Validate configuration and print it without running
    #[arg(long)]
    pub dry_run: bool,
}

// ============================================================================
// Pure display logic (no I/O - returns formatted strings)
// ============================================================================

use crate::config::Config;
use crate::notify::Endpoint;

fn format_polling(interval: Option<std::time::Duration>) -> String {
    match interval {
        Some(d) => format!("every {}s", d.as_secs()),
        None => "disabled".to_string(),
    }
}

fn format_endpoint(endpoint: &Endpoint) -> String {
    let mut output = format!("  - {}\n", endpoint.host);
    for (category, addrs) in [("service", &endpoint.service), ("node", &endpoint.node)] {
        if let Some(addrs) = addrs {
            if !addrs.create.is_empty() {
                output.push_str(&format!("      {} create: {}\n", category, addrs.create));
            }
            if !addrs.remove.is_empty() {
                output.push_str(&format!("      {} remove: {}\n", category, addrs.remove));
            }
        }
    }
    output
}

/// Format the effective configuration for `--dry-run`.
pub fn format_dry_run(config: &Config) -> String {
    let mut output = String::new();

    output.push_str("swarm-listener - Dry Run Mode\n\n");
    output.push_str(&format!("Docker host: {}\n", config.docker.host));
    output.push_str(&format!(
        "Tracked services: {}=true, labels {}*\n",
        config.listener.notify_label, config.listener.label_prefix
    ));
    output.push_str(&format!(
        "Delivery: {} attempt(s), {}s apart\n\n",
        config.notifier.retries,
        config.notifier.retry_interval.as_secs()
    ));

    output.push_str(&format!("Listeners ({}):\n", config.endpoints.len()));
    if config.endpoints.is_empty() {
        output.push_str("  (none)\n");
    }
    for endpoint in &config.endpoints {
        output.push_str(&format_endpoint(endpoint));
    }
    output.push('\n');

    output.push_str("Sources:\n");
    output.push_str(&format!(
        "  services: events {}, polling {}\n",
        if config.listener.use_service_events { "on" } else { "off" },
        format_polling(config.listener.service_polling)
    ));
    output.push_str(&format!(
        "  nodes: events {}, polling {}\n",
        if config.listener.use_node_events { "on" } else { "off" },
        format_polling(config.listener.node_polling)
    ));
    output.push_str(&format!(
        "\nAdmin: http://{}:{}/v1/swarm-listener\n",
        config.bind_addr, config.port
    ));

    output
}
