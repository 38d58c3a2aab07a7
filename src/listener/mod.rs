//! Composition root of the change pipeline
//!
//! ```text
//!   event stream ─┐
//!                 ├─> relay (inspect, minify, diff) ─> distributor ─> lanes
//!   poller ───────┘
//! ```
//!
//! One relay per entity kind. Sources are only started for kinds that have at
//! least one configured recipient.

pub mod relay;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::entity::{EntityKind, Parameters};
use crate::metrics::SharedMetrics;
use crate::notify::NotifyDistributor;
use crate::source::stream::STREAM_RECONNECT_DELAY;
use crate::source::{
    ControlPlaneError, EventStreamListener, NodeSource, Poller, ServiceSource, SharedControlPlane,
};

pub use relay::Relay;

/// Which change sources to run for each kind
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    pub label_prefix: String,
    pub notify_label: String,
    pub use_service_events: bool,
    pub use_node_events: bool,
    /// `None` disables service polling
    pub service_polling: Option<Duration>,
    /// `None` disables node polling
    pub node_polling: Option<Duration>,
    pub reconnect_delay: Duration,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            label_prefix: crate::entity::DEFAULT_LABEL_PREFIX.to_string(),
            notify_label: crate::entity::DEFAULT_NOTIFY_LABEL.to_string(),
            use_service_events: true,
            use_node_events: true,
            service_polling: None,
            node_polling: None,
            reconnect_delay: STREAM_RECONNECT_DELAY,
        }
    }
}

/// Background tasks started by [`SwarmListener::start`]
#[derive(Default)]
pub struct ListenerHandles {
    pub streams: Vec<EventStreamListener>,
    pub pollers: Vec<JoinHandle<()>>,
}

impl ListenerHandles {
    pub fn abort(&self) {
        for stream in &self.streams {
            stream.abort();
        }
        for poller in &self.pollers {
            poller.abort();
        }
    }
}

pub struct SwarmListener {
    client: SharedControlPlane,
    services: Arc<Relay<ServiceSource>>,
    nodes: Arc<Relay<NodeSource>>,
    distributor: Arc<NotifyDistributor>,
    settings: ListenerSettings,
    metrics: SharedMetrics,
    _distributor_tasks: Vec<JoinHandle<()>>,
}

impl SwarmListener {
    /// Wire relays to the distributor and start delivery.
    ///
    /// Change sources are not started until [`SwarmListener::start`].
    pub fn new(
        client: SharedControlPlane,
        distributor: NotifyDistributor,
        settings: ListenerSettings,
        metrics: SharedMetrics,
    ) -> Self {
        let (service_tx, service_rx) = mpsc::channel(1);
        let (node_tx, node_rx) = mpsc::channel(1);

        let distributor = Arc::new(distributor);
        let distributor_tasks = distributor.run(service_rx, node_rx);

        let services = Relay::spawn(
            Arc::new(ServiceSource::new(
                client.clone(),
                &settings.label_prefix,
                &settings.notify_label,
            )),
            service_tx,
            metrics.clone(),
        );
        let nodes = Relay::spawn(
            Arc::new(NodeSource::new(client.clone(), &settings.label_prefix)),
            node_tx,
            metrics.clone(),
        );

        Self {
            client,
            services,
            nodes,
            distributor,
            settings,
            metrics,
            _distributor_tasks: distributor_tasks,
        }
    }

    pub fn services(&self) -> &Arc<Relay<ServiceSource>> {
        &self.services
    }

    pub fn nodes(&self) -> &Arc<Relay<NodeSource>> {
        &self.nodes
    }

    pub fn distributor(&self) -> &Arc<NotifyDistributor> {
        &self.distributor
    }

    /// Start event streams and pollers for kinds that have recipients.
    ///
    /// Each event stream is open by the time this returns.
    pub async fn start(&self) -> ListenerHandles {
        let mut handles = ListenerHandles::default();

        if self.distributor.has_service_listeners() {
            if self.settings.use_service_events {
                handles.streams.push(
                    EventStreamListener::start(
                        self.client.clone(),
                        EntityKind::Service,
                        self.services.events(),
                        self.metrics.clone(),
                        self.settings.reconnect_delay,
                    )
                    .await,
                );
            }
            if let Some(period) = self.settings.service_polling {
                let poller = Poller::new(
                    self.services.source().clone(),
                    self.services.cache().clone(),
                    period,
                    self.metrics.clone(),
                );
                handles.pollers.extend(poller.spawn(self.services.events()));
            }
        } else {
            info!("No service listeners configured, not watching services");
        }

        if self.distributor.has_node_listeners() {
            if self.settings.use_node_events {
                handles.streams.push(
                    EventStreamListener::start(
                        self.client.clone(),
                        EntityKind::Node,
                        self.nodes.events(),
                        self.metrics.clone(),
                        self.settings.reconnect_delay,
                    )
                    .await,
                );
            }
            if let Some(period) = self.settings.node_polling {
                let poller = Poller::new(
                    self.nodes.source().clone(),
                    self.nodes.cache().clone(),
                    period,
                    self.metrics.clone(),
                );
                handles.pollers.extend(poller.spawn(self.nodes.events()));
            }
        } else {
            info!("No node listeners configured, not watching nodes");
        }

        handles
    }

    /// "Notify all now" for services; see [`Relay::notify_all`]
    pub async fn notify_services(&self, use_cache: bool) -> Result<usize, ControlPlaneError> {
        self.services.notify_all(use_cache).await
    }

    pub async fn notify_nodes(&self, use_cache: bool) -> Result<usize, ControlPlaneError> {
        self.nodes.notify_all(use_cache).await
    }

    pub async fn service_parameters(&self) -> Result<Vec<Parameters>, ControlPlaneError> {
        self.services.list_parameters().await
    }

    pub async fn node_parameters(&self) -> Result<Vec<Parameters>, ControlPlaneError> {
        self.nodes.list_parameters().await
    }

    /// Cached resync of every kind that has recipients, logging failures
    pub async fn notify_on_start(&self) {
        if self.distributor.has_service_listeners() {
            if let Err(e) = self.notify_services(true).await {
                warn!("Initial service notification failed: {}", e);
            }
        }
        if self.distributor.has_node_listeners() {
            if let Err(e) = self.notify_nodes(true).await {
                warn!("Initial node notification failed: {}", e);
            }
        }
    }
}
