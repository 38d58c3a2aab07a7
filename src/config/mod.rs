//! Typed process configuration built from command-line arguments

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::cli::Args;
use crate::listener::ListenerSettings;
use crate::notify::{build_endpoints, Endpoint, EndpointError, NotifierSettings};
use crate::source::docker::{parse_docker_host, DockerClientConfig};
use crate::source::stream::STREAM_RECONNECT_DELAY;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid Docker host: {0}")]
    InvalidDockerHost(String),

    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: &'static str, message: String },

    #[error("Invalid notification URLs: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Failed to load env file: {0}")]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub docker: DockerClientConfig,
    pub endpoints: Vec<Endpoint>,
    pub notifier: NotifierSettings,
    pub listener: ListenerSettings,
    pub notify_on_start: bool,
    pub bind_addr: String,
    pub port: u16,
}

/// Non-positive intervals disable polling
pub fn polling_interval(seconds: i64) -> Option<Duration> {
    u64::try_from(seconds)
        .ok()
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
}

/// Load a `.env` file into the process environment.
///
/// Variables already set in the environment are not overridden.
pub fn load_env_file(path: &Path) -> Result<(), ConfigError> {
    dotenvy::from_path(path)?;
    Ok(())
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        parse_docker_host(&args.docker_host)
            .map_err(|e| ConfigError::InvalidDockerHost(e.to_string()))?;

        if args.retry == 0 {
            return Err(ConfigError::InvalidValue {
                name: "retry",
                message: "at least one attempt is required".to_string(),
            });
        }
        if args.label_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "label-prefix",
                message: "must not be empty".to_string(),
            });
        }

        let endpoints = build_endpoints(
            &args.notify_create_service_url,
            &args.notify_remove_service_url,
            &args.notify_create_node_url,
            &args.notify_remove_node_url,
        )?;
        if endpoints.is_empty() {
            warn!("No notification URLs configured; changes will not be delivered anywhere");
        }

        Ok(Self {
            docker: DockerClientConfig {
                host: args.docker_host.clone(),
                service_label_filter: Some(args.notify_label.clone()),
                include_node_ip_info: args.include_node_ip_info,
            },
            endpoints,
            notifier: NotifierSettings {
                retries: args.retry,
                retry_interval: Duration::from_secs(args.retry_interval),
                ..Default::default()
            },
            listener: ListenerSettings {
                label_prefix: args.label_prefix.clone(),
                notify_label: args.notify_label.clone(),
                use_service_events: args.use_docker_service_events,
                use_node_events: args.use_docker_node_events,
                service_polling: polling_interval(args.service_polling_interval),
                node_polling: polling_interval(args.node_polling_interval),
                reconnect_delay: STREAM_RECONNECT_DELAY,
            },
            notify_on_start: args.notify_on_start,
            bind_addr: args.bind_addr.clone(),
            port: args.port,
        })
    }
}
