//! Fan-out of notifications to every recipient lane
//!
//! A dispatcher per entity kind admits each notification with that kind's
//! cancel manager exactly once, then hands a copy carrying the admitted scope
//! to every lane subscribed to the kind. Lanes drain their inbox serially and
//! report completion back to the cancel manager, whatever the outcome.

use std::sync::Arc;

use reqwest::Client;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::endpoint::Endpoint;
use super::notifier::{Delivery, HttpNotifier, Notifier, NotifierSettings};
use super::Notification;
use crate::cancel::CancelManager;
use crate::entity::EntityKind;
use crate::metrics::SharedMetrics;
use crate::source::ChangeKind;

/// One recipient host and the notifiers for the kinds it subscribes to
pub struct NotifyLane {
    pub host: String,
    pub service: Option<Arc<dyn Notifier>>,
    pub node: Option<Arc<dyn Notifier>>,
}

impl NotifyLane {
    fn notifier(&self, kind: EntityKind) -> Option<&Arc<dyn Notifier>> {
        match kind {
            EntityKind::Service => self.service.as_ref(),
            EntityKind::Node => self.node.as_ref(),
        }
    }
}

pub struct NotifyDistributor {
    lanes: Vec<Arc<NotifyLane>>,
    service_cancel: Arc<CancelManager>,
    node_cancel: Arc<CancelManager>,
}

type LaneSender = mpsc::UnboundedSender<Notification>;

impl NotifyDistributor {
    pub fn new(lanes: Vec<NotifyLane>) -> Self {
        let service_width = lanes.iter().filter(|l| l.service.is_some()).count();
        let node_width = lanes.iter().filter(|l| l.node.is_some()).count();

        Self {
            lanes: lanes.into_iter().map(Arc::new).collect(),
            service_cancel: Arc::new(CancelManager::new(service_width)),
            node_cancel: Arc::new(CancelManager::new(node_width)),
        }
    }

    /// Build one HTTP-backed lane per endpoint
    pub fn from_endpoints(
        endpoints: &[Endpoint],
        settings: NotifierSettings,
        metrics: SharedMetrics,
    ) -> Self {
        let http_client = Client::new();
        let notifier = |kind: EntityKind, create: &str, remove: &str| -> Arc<dyn Notifier> {
            Arc::new(HttpNotifier::new(
                http_client.clone(),
                kind,
                create,
                remove,
                settings,
                metrics.clone(),
            ))
        };

        let lanes = endpoints
            .iter()
            .map(|endpoint| NotifyLane {
                host: endpoint.host.clone(),
                service: endpoint
                    .service
                    .as_ref()
                    .map(|a| notifier(EntityKind::Service, &a.create, &a.remove)),
                node: endpoint
                    .node
                    .as_ref()
                    .map(|a| notifier(EntityKind::Node, &a.create, &a.remove)),
            })
            .collect();

        Self::new(lanes)
    }

    pub fn has_service_listeners(&self) -> bool {
        self.lanes.iter().any(|l| l.service.is_some())
    }

    pub fn has_node_listeners(&self) -> bool {
        self.lanes.iter().any(|l| l.node.is_some())
    }

    pub fn service_cancel_manager(&self) -> &Arc<CancelManager> {
        &self.service_cancel
    }

    pub fn node_cancel_manager(&self) -> &Arc<CancelManager> {
        &self.node_cancel
    }

    /// Spawn one task per lane plus a dispatcher per kind.
    pub fn run(
        &self,
        services: mpsc::Receiver<Notification>,
        nodes: mpsc::Receiver<Notification>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.lanes.len() + 2);
        let mut service_senders = Vec::new();
        let mut node_senders = Vec::new();

        for lane in &self.lanes {
            // A lane without a kind keeps no sender, so its inbox closes at once
            let (service_tx, service_rx) = mpsc::unbounded_channel();
            let (node_tx, node_rx) = mpsc::unbounded_channel();
            if lane.service.is_some() {
                service_senders.push(service_tx);
            }
            if lane.node.is_some() {
                node_senders.push(node_tx);
            }

            handles.push(tokio::spawn(run_lane(
                lane.clone(),
                service_rx,
                node_rx,
                self.service_cancel.clone(),
                self.node_cancel.clone(),
            )));
        }

        handles.push(tokio::spawn(dispatch(
            EntityKind::Service,
            services,
            service_senders,
            self.service_cancel.clone(),
        )));
        handles.push(tokio::spawn(dispatch(
            EntityKind::Node,
            nodes,
            node_senders,
            self.node_cancel.clone(),
        )));

        handles
    }
}

async fn dispatch(
    kind: EntityKind,
    mut inbox: mpsc::Receiver<Notification>,
    lanes: Vec<LaneSender>,
    cancel_manager: Arc<CancelManager>,
) {
    while let Some(mut notification) = inbox.recv().await {
        if lanes.is_empty() {
            debug!("No {} listeners, dropping notification for {}", kind, notification.id);
            continue;
        }

        let cancel = cancel_manager.admit(&notification.id, notification.generation);
        for lane in &lanes {
            if lane.send(notification.for_lane(cancel.clone())).is_err() {
                // The lane task is gone; account for it so the entry can drain
                cancel_manager.complete(&notification.id, notification.generation);
            }
        }

        if let Some(done) = notification.done.take() {
            let _ = done.send(());
        }
    }
    debug!("{} dispatcher stopped", kind);
}

async fn run_lane(
    lane: Arc<NotifyLane>,
    mut services: mpsc::UnboundedReceiver<Notification>,
    mut nodes: mpsc::UnboundedReceiver<Notification>,
    service_cancel: Arc<CancelManager>,
    node_cancel: Arc<CancelManager>,
) {
    loop {
        let (kind, notification) = tokio::select! {
            Some(n) = services.recv() => (EntityKind::Service, n),
            Some(n) = nodes.recv() => (EntityKind::Node, n),
            else => break,
        };

        let cancel_manager = match kind {
            EntityKind::Service => &service_cancel,
            EntityKind::Node => &node_cancel,
        };

        if let Some(notifier) = lane.notifier(kind) {
            let result = match notification.kind {
                ChangeKind::Create => {
                    notifier
                        .create(&notification.cancel, &notification.parameters)
                        .await
                }
                ChangeKind::Remove => {
                    notifier
                        .remove(&notification.cancel, &notification.parameters)
                        .await
                }
            };

            match result {
                Ok(Delivery::Sent) => info!(
                    "Sent {:?} notification for {} {} to {}",
                    notification.kind, kind, notification.id, lane.host
                ),
                Ok(Delivery::Cancelled) => info!(
                    "Superseded {:?} notification for {} {} to {}",
                    notification.kind, kind, notification.id, lane.host
                ),
                Ok(Delivery::Skipped) => {}
                Err(e) => error!(
                    "Dropping {:?} notification for {} {} to {}: {}",
                    notification.kind, kind, notification.id, lane.host, e
                ),
            }
        }

        cancel_manager.complete(&notification.id, notification.generation);
    }
    debug!("Lane {} stopped", lane.host);
}
