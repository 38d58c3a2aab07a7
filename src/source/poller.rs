//! Periodic full-reconciliation poller
//!
//! Each sweep lists every live entity and diffs it against the cache:
//! changed or new entities become create events, and cached ids missing from
//! the listing become remove events (mark and sweep). This is the only way
//! removals are noticed when the event stream misses them.
//!
//! The poller never writes the cache. The listener does that once it decides
//! to notify, so a sweep can only ever propose changes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ChangeEvent, ControlPlaneError, EntitySource};
use crate::cache::SharedCache;
use crate::entity::Minified;
use crate::metrics::SharedMetrics;

pub struct Poller<S: EntitySource> {
    source: Arc<S>,
    cache: SharedCache<S::Mini>,
    period: Duration,
    metrics: SharedMetrics,
}

impl<S: EntitySource> Poller<S> {
    /// A zero `period` disables the poller.
    pub fn new(
        source: Arc<S>,
        cache: SharedCache<S::Mini>,
        period: Duration,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            source,
            cache,
            period,
            metrics,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.period.is_zero()
    }

    /// Run one sweep and return the events it synthesizes.
    ///
    /// A listing failure returns the error and proposes nothing; it must
    /// never be mistaken for "everything was removed".
    pub async fn sweep(&self) -> Result<Vec<ChangeEvent>, ControlPlaneError> {
        let live = self.source.list().await?;
        let mut remaining = self.cache.snapshot_keys();
        let mut events = Vec::new();

        for mini in &live {
            remaining.remove(mini.id());
            if self.cache.peek_changed(mini) {
                events.push(ChangeEvent::create(mini.id(), true));
            }
        }

        for id in remaining {
            events.push(ChangeEvent::remove(id));
        }

        Ok(events)
    }

    /// Spawn the polling loop. Returns `None` when the poller is disabled.
    pub fn spawn(self, events: mpsc::Sender<ChangeEvent>) -> Option<JoinHandle<()>> {
        if !self.is_enabled() {
            debug!("{} poller disabled", self.source.kind());
            return None;
        }
        Some(tokio::spawn(self.run(events)))
    }

    async fn run(self, events: mpsc::Sender<ChangeEvent>) {
        let kind = self.source.kind();
        info!("Polling {}s every {:?}", kind, self.period);

        loop {
            tokio::time::sleep(self.period).await;

            let proposed = match self.sweep().await {
                Ok(proposed) => proposed,
                Err(e) => {
                    warn!("Failed to list {}s while polling: {}", kind, e);
                    self.metrics.record_error(&format!("poll_{}s", kind));
                    continue;
                }
            };

            if !proposed.is_empty() {
                debug!("{} poll proposed {} change(s)", kind, proposed.len());
            }

            for event in proposed {
                if events.send(event).await.is_err() {
                    debug!("{} poller stopping: event receiver closed", kind);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ServiceCache;
    use crate::entity::{minify_service, LabelFilter, ServiceSnapshot};
    use crate::metrics::new_shared_metrics;
    use crate::source::mock::MockControlPlane;
    use crate::source::{ChangeKind, ServiceSource};
    use std::collections::HashMap;

    fn notified(id: &str, replicas: u64) -> ServiceSnapshot {
        let labels: HashMap<String, String> =
            [("com.df.notify".to_string(), "true".to_string())].into();
        ServiceSnapshot::replicated(id, format!("{}-name", id), replicas, labels)
    }

    fn filter() -> LabelFilter {
        LabelFilter::new(
            "com.df.",
            Some("com.df.notify".to_string()),
            Some(crate::entity::STACK_NAMESPACE_LABEL.to_string()),
        )
    }

    fn poller(client: Arc<MockControlPlane>, cache: Arc<ServiceCache>) -> Poller<ServiceSource> {
        let source = Arc::new(ServiceSource::new(client, "com.df.", "com.df.notify"));
        Poller::new(source, cache, Duration::from_millis(10), new_shared_metrics())
    }

    #[tokio::test]
    async fn test_mark_and_sweep() {
        let client = Arc::new(MockControlPlane::default());
        let cache = Arc::new(ServiceCache::new());

        // A unchanged, B about to change, C about to disappear
        for snapshot in [notified("A", 1), notified("B", 1), notified("C", 1)] {
            cache.upsert_and_check(minify_service(&snapshot, &filter()));
        }
        client.set_services(vec![notified("A", 1), notified("B", 3)]);

        let events = poller(client, cache.clone()).sweep().await.unwrap();

        let creates: Vec<_> = events.iter().filter(|e| e.kind == ChangeKind::Create).collect();
        let removes: Vec<_> = events.iter().filter(|e| e.kind == ChangeKind::Remove).collect();
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].id, "B");
        assert!(creates[0].use_cache);
        assert_eq!(removes.len(), 1);
        assert_eq!(removes[0].id, "C");

        // Sweeping never writes the cache
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("B").unwrap().replicas, 1);
    }

    #[tokio::test]
    async fn test_listing_failure_proposes_nothing() {
        let client = Arc::new(MockControlPlane::default());
        let cache = Arc::new(ServiceCache::new());
        cache.upsert_and_check(minify_service(&notified("A", 1), &filter()));
        client.set_fail_listing(true);

        assert!(poller(client, cache.clone()).sweep().await.is_err());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_create_then_remove_scenario() {
        let client = Arc::new(MockControlPlane::default());
        let cache = Arc::new(ServiceCache::new());
        let poller = poller(client.clone(), cache.clone());

        client.set_services(vec![notified("S1", 1)]);
        let events = poller.sweep().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Create);
        assert_eq!(events[0].id, "S1");

        // The listener records what it notified
        cache.upsert_and_check(minify_service(&notified("S1", 1), &filter()));
        assert!(poller.sweep().await.unwrap().is_empty());

        client.set_services(vec![]);
        let events = poller.sweep().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Remove);
        assert_eq!(events[0].id, "S1");
    }

    #[tokio::test]
    async fn test_spawned_poller_sends_events() {
        let client = Arc::new(MockControlPlane::default());
        client.set_services(vec![notified("S1", 1)]);
        let (tx, mut rx) = mpsc::channel(1);

        let handle = poller(client, Arc::new(ServiceCache::new())).spawn(tx).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.id, "S1");
        handle.abort();
    }

    #[tokio::test]
    async fn test_spawned_poller_survives_listing_failure() {
        let client = Arc::new(MockControlPlane::default());
        client.set_services(vec![notified("S1", 1)]);
        client.set_fail_listing(true);
        let metrics = new_shared_metrics();
        let source = Arc::new(ServiceSource::new(client.clone(), "com.df.", "com.df.notify"));
        let poller = Poller::new(
            source,
            Arc::new(ServiceCache::new()),
            Duration::from_millis(10),
            metrics.clone(),
        );
        let (tx, mut rx) = mpsc::channel(1);

        let handle = poller.spawn(tx).unwrap();

        for _ in 0..200 {
            if metrics.error_count("poll_services") > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(metrics.error_count("poll_services") > 0);
        assert!(rx.try_recv().is_err());

        client.set_fail_listing(false);
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.id, "S1");
        assert_eq!(event.kind, ChangeKind::Create);
        handle.abort();
    }

    #[test]
    fn test_zero_period_disables() {
        let client = Arc::new(MockControlPlane::default());
        let source = Arc::new(ServiceSource::new(client, "com.df.", "com.df.notify"));
        let poller = Poller::new(
            source,
            Arc::new(ServiceCache::new()),
            Duration::ZERO,
            new_shared_metrics(),
        );
        assert!(!poller.is_enabled());
    }
}
