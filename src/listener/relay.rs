//! Per-kind relay from change events to notifications
//!
//! A relay owns the cache for one entity kind. Events are handled one at a
//! time: inspect, minify, diff against the cache, then hand a notification to
//! the distributor and wait until it has been fanned out.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::cache::{Cache, SharedCache};
use crate::entity::{encode_parameters, EntityKind, Minified, Parameters};
use crate::metrics::SharedMetrics;
use crate::notify::Notification;
use crate::source::{now_nanos, ChangeEvent, ChangeKind, ControlPlaneError, EntitySource};

pub struct Relay<S: EntitySource> {
    source: Arc<S>,
    cache: SharedCache<S::Mini>,
    notifications: mpsc::Sender<Notification>,
    events: mpsc::Sender<ChangeEvent>,
    metrics: SharedMetrics,
    last_generation: AtomicI64,
}

impl<S: EntitySource> Relay<S> {
    /// Build the relay and spawn the task that drains its event inbox.
    pub fn spawn(
        source: Arc<S>,
        notifications: mpsc::Sender<Notification>,
        metrics: SharedMetrics,
    ) -> Arc<Self> {
        let (events, mut inbox) = mpsc::channel(1);
        let relay = Arc::new(Self {
            source,
            cache: Arc::new(Cache::new()),
            notifications,
            events,
            metrics,
            last_generation: AtomicI64::new(0),
        });

        let worker = relay.clone();
        tokio::spawn(async move {
            while let Some(event) = inbox.recv().await {
                worker.handle(event).await;
            }
        });

        relay
    }

    pub fn kind(&self) -> EntityKind {
        self.source.kind()
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn cache(&self) -> &SharedCache<S::Mini> {
        &self.cache
    }

    /// Sender feeding this relay; handed to the event stream and poller
    pub fn events(&self) -> mpsc::Sender<ChangeEvent> {
        self.events.clone()
    }

    /// Strictly increasing per relay, close to wall-clock nanos
    fn next_generation(&self) -> i64 {
        let now = now_nanos();
        let mut current = self.last_generation.load(Ordering::SeqCst);
        loop {
            let next = now.max(current + 1);
            match self.last_generation.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub async fn handle(&self, event: ChangeEvent) {
        match event.kind {
            ChangeKind::Create => self.handle_create(&event.id, event.use_cache).await,
            ChangeKind::Remove => self.handle_remove(&event.id).await,
        }
    }

    async fn handle_create(&self, id: &str, use_cache: bool) {
        let kind = self.kind();
        let mini = match self.source.inspect(id).await {
            Ok(Some(mini)) => mini,
            Ok(None) => {
                debug!("{} {} is gone or not tracked, skipping", kind, id);
                return;
            }
            Err(e) => {
                warn!("Failed to inspect {} {}: {}", kind, id, e);
                self.metrics.record_error(&format!("inspect_{}s", kind));
                return;
            }
        };

        let params = self.source.create_parameters(&mini);
        let changed = self.cache.upsert_and_check(mini);
        if use_cache && !changed {
            debug!("{} {} unchanged", kind, id);
            return;
        }

        self.record_count();
        self.send(ChangeKind::Create, id, &params).await;
    }

    async fn handle_remove(&self, id: &str) {
        let Some(mini) = self.cache.delete(id) else {
            debug!("{} {} not cached, nothing to remove", self.kind(), id);
            return;
        };

        self.record_count();
        let params = self.source.remove_parameters(&mini);
        self.send(ChangeKind::Remove, id, &params).await;
    }

    fn record_count(&self) {
        if self.kind() == EntityKind::Service {
            self.metrics.record_service_count(self.cache.len());
        }
    }

    async fn send(&self, kind: ChangeKind, id: &str, params: &Parameters) {
        let (done_tx, done_rx) = oneshot::channel();
        let notification = Notification::new(
            kind,
            id,
            encode_parameters(params),
            self.next_generation(),
        )
        .with_done(done_tx);

        if self.notifications.send(notification).await.is_err() {
            warn!("Distributor is gone, dropping {:?} for {} {}", kind, self.kind(), id);
            return;
        }
        // Dropped without firing when nobody listens for this kind
        let _ = done_rx.await;
    }

    /// Resync every live entity.
    ///
    /// With the cache, each entity is re-injected as a create event and only
    /// changed ones are notified. Without it, every entity is notified and
    /// the cache overwritten. Returns the number of entities listed.
    pub async fn notify_all(&self, use_cache: bool) -> Result<usize, ControlPlaneError> {
        let live = self.source.list().await?;
        let count = live.len();
        info!(
            "Notifying {} {}s ({})",
            count,
            self.kind(),
            if use_cache { "cached" } else { "forced" }
        );

        for mini in live {
            if use_cache {
                if self.events.send(ChangeEvent::create(mini.id(), true)).await.is_err() {
                    break;
                }
                continue;
            }

            let id = mini.id().to_string();
            let params = self.source.create_parameters(&mini);
            self.cache.upsert_and_check(mini);
            self.record_count();
            self.send(ChangeKind::Create, &id, &params).await;
        }

        Ok(count)
    }

    /// Create parameters of every live entity, without touching the cache
    pub async fn list_parameters(&self) -> Result<Vec<Parameters>, ControlPlaneError> {
        let live = self.source.list().await?;
        Ok(live
            .iter()
            .map(|mini| self.source.create_parameters(mini))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{ServiceSnapshot, STACK_NAMESPACE_LABEL};
    use crate::metrics::new_shared_metrics;
    use crate::source::mock::MockControlPlane;
    use crate::source::ServiceSource;
    use std::collections::HashMap;
    use std::time::Duration;

    fn tracked(id: &str, name: &str, replicas: u64) -> ServiceSnapshot {
        let labels: HashMap<String, String> = [
            ("com.df.notify", "true"),
            ("com.df.port", "8080"),
            (STACK_NAMESPACE_LABEL, "stack"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        ServiceSnapshot::replicated(id, name, replicas, labels)
    }

    fn service_relay(
        client: Arc<MockControlPlane>,
    ) -> (Arc<Relay<ServiceSource>>, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(1);
        let source = Arc::new(ServiceSource::new(client, "com.df.", "com.df.notify"));
        (Relay::spawn(source, tx, new_shared_metrics()), rx)
    }

    async fn next(rx: &mut mpsc::Receiver<Notification>) -> Notification {
        let mut notification = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("channel closed");
        if let Some(done) = notification.done.take() {
            let _ = done.send(());
        }
        notification
    }

    #[test]
    fn test_generations_strictly_increase() {
        let (tx, _rx) = mpsc::channel(1);
        let (events, _inbox) = mpsc::channel(1);
        let relay = Relay {
            source: Arc::new(ServiceSource::new(
                Arc::new(MockControlPlane::default()),
                "com.df.",
                "com.df.notify",
            )),
            cache: Arc::new(Cache::new()),
            notifications: tx,
            events,
            metrics: new_shared_metrics(),
            last_generation: AtomicI64::new(i64::MAX - 10),
        };

        let first = relay.next_generation();
        let second = relay.next_generation();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_create_is_notified_once() {
        let client = Arc::new(MockControlPlane::default());
        client.set_services(vec![tracked("s1", "web", 1)]);
        let (relay, mut rx) = service_relay(client);

        relay.events().send(ChangeEvent::create("s1", true)).await.unwrap();
        let notification = next(&mut rx).await;
        assert_eq!(notification.kind, ChangeKind::Create);
        assert_eq!(notification.id, "s1");
        assert!(notification.parameters.contains("serviceName=web"));
        assert!(notification.parameters.contains("port=8080"));

        relay.events().send(ChangeEvent::create("s1", true)).await.unwrap();
        let repeat = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(repeat.is_err(), "unchanged service must not be notified again");
    }

    #[tokio::test]
    async fn test_changed_service_gets_newer_generation() {
        let client = Arc::new(MockControlPlane::default());
        client.set_services(vec![tracked("s1", "web", 1)]);
        let (relay, mut rx) = service_relay(client.clone());

        relay.events().send(ChangeEvent::create("s1", true)).await.unwrap();
        let first = next(&mut rx).await;

        client.set_services(vec![tracked("s1", "web", 3)]);
        relay.events().send(ChangeEvent::create("s1", true)).await.unwrap();
        let second = next(&mut rx).await;

        assert!(second.generation > first.generation);
        assert!(second.parameters.contains("replicas=3"));
    }

    #[tokio::test]
    async fn test_gone_service_is_skipped() {
        let client = Arc::new(MockControlPlane::default());
        let (relay, mut rx) = service_relay(client);

        relay.events().send(ChangeEvent::create("missing", true)).await.unwrap();
        let none = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(none.is_err());
        assert!(relay.cache().is_empty());
    }

    #[tokio::test]
    async fn test_remove_only_for_cached() {
        let client = Arc::new(MockControlPlane::default());
        client.set_services(vec![tracked("s1", "web", 1)]);
        let (relay, mut rx) = service_relay(client);

        relay.events().send(ChangeEvent::remove("unknown")).await.unwrap();
        relay.events().send(ChangeEvent::create("s1", true)).await.unwrap();
        assert_eq!(next(&mut rx).await.kind, ChangeKind::Create);

        relay.events().send(ChangeEvent::remove("s1")).await.unwrap();
        let removed = next(&mut rx).await;
        assert_eq!(removed.kind, ChangeKind::Remove);
        assert_eq!(removed.parameters, "distribute=true&serviceName=web");
        assert!(relay.cache().get("s1").is_none());
    }

    #[tokio::test]
    async fn test_forced_notify_all_ignores_cache() {
        let client = Arc::new(MockControlPlane::default());
        client.set_services(vec![tracked("s1", "web", 1), tracked("s2", "api", 2)]);
        let (relay, mut rx) = service_relay(client);

        let drain = tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..4 {
                ids.push(next(&mut rx).await.id);
            }
            ids
        });

        assert_eq!(relay.notify_all(false).await.unwrap(), 2);
        assert_eq!(relay.notify_all(false).await.unwrap(), 2);

        let mut ids = drain.await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["s1", "s1", "s2", "s2"]);
        assert_eq!(relay.cache().len(), 2);
    }

    #[tokio::test]
    async fn test_cached_notify_all_skips_unchanged() {
        let client = Arc::new(MockControlPlane::default());
        client.set_services(vec![tracked("s1", "web", 1)]);
        let (relay, mut rx) = service_relay(client);

        relay.notify_all(true).await.unwrap();
        assert_eq!(next(&mut rx).await.id, "s1");

        relay.notify_all(true).await.unwrap();
        let repeat = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(repeat.is_err());
    }

    #[tokio::test]
    async fn test_list_parameters_leaves_cache_alone() {
        let client = Arc::new(MockControlPlane::default());
        client.set_services(vec![tracked("s1", "web", 1)]);
        let (relay, _rx) = service_relay(client);

        let params = relay.list_parameters().await.unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0]["serviceName"], "web");
        assert!(relay.cache().is_empty());
    }
}
