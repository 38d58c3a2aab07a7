//! Push change stream with automatic reconnect
//!
//! The listener opens the control plane's event stream for one entity kind,
//! filters and translates raw events into [`ChangeEvent`]s, and reopens the
//! stream after a fixed delay whenever it errors or ends. It never gives up.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ChangeEvent, ChangeKind, RawEvent, RawEventStream, SharedControlPlane};
use crate::entity::EntityKind;
use crate::metrics::SharedMetrics;

/// Delay before reopening a failed stream
pub const STREAM_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Translate a raw event, or `None` if it should be ignored.
///
/// Node updates without a `name` attribute are transient states emitted
/// while a promotion or demotion settles and are dropped.
pub fn translate(raw: &RawEvent) -> Option<ChangeEvent> {
    let kind = match raw.action.as_str() {
        "create" | "update" => ChangeKind::Create,
        "remove" => ChangeKind::Remove,
        _ => return None,
    };

    if raw.kind == EntityKind::Node && raw.action == "update" {
        let named = raw.attributes.get("name").is_some_and(|n| !n.is_empty());
        if !named {
            return None;
        }
    }

    if raw.id.is_empty() {
        return None;
    }

    Some(ChangeEvent {
        kind,
        id: raw.id.clone(),
        observed_at_nanos: raw.time_nanos,
        use_cache: true,
    })
}

pub struct EventStreamListener {
    handle: JoinHandle<()>,
}

impl EventStreamListener {
    /// Open the stream and spawn the reader task.
    ///
    /// The first open attempt completes before this returns, so no change
    /// that happens afterwards can be missed. A failed first attempt is
    /// retried by the task like any later disconnect.
    pub async fn start(
        client: SharedControlPlane,
        kind: EntityKind,
        events: mpsc::Sender<ChangeEvent>,
        metrics: SharedMetrics,
        reconnect_delay: Duration,
    ) -> Self {
        let first = client.stream_changes(kind).await;
        if first.is_ok() {
            info!("Listening to {} events", kind);
        }

        let handle = tokio::spawn(async move {
            let mut current = first;
            loop {
                match current {
                    Ok(stream) => {
                        if !forward(kind, stream, &events, &metrics).await {
                            debug!("{} event listener stopping: receiver closed", kind);
                            return;
                        }
                    }
                    Err(e) => {
                        error!("Failed to open {} event stream: {}", kind, e);
                        metrics.record_error(&format!("stream_{}s", kind));
                    }
                }

                tokio::time::sleep(reconnect_delay).await;
                current = client.stream_changes(kind).await;
                if current.is_ok() {
                    info!("Reconnected to {} events", kind);
                }
            }
        });

        Self { handle }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Forward events until the stream errors or ends. Returns false once the
/// receiving side is gone.
async fn forward(
    kind: EntityKind,
    mut stream: RawEventStream,
    events: &mpsc::Sender<ChangeEvent>,
    metrics: &SharedMetrics,
) -> bool {
    while let Some(item) = stream.next().await {
        match item {
            Ok(raw) => {
                let Some(event) = translate(&raw) else {
                    debug!("Ignoring {} event {} for {}", kind, raw.action, raw.id);
                    continue;
                };
                if events.send(event).await.is_err() {
                    return false;
                }
            }
            Err(e) => {
                error!("{} event stream failed: {}", kind, e);
                metrics.record_error(&format!("stream_{}s", kind));
                return true;
            }
        }
    }

    warn!("{} event stream ended", kind);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::new_shared_metrics;
    use crate::source::mock::MockControlPlane;
    use crate::source::ControlPlaneError;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn raw(kind: EntityKind, action: &str, id: &str, attrs: &[(&str, &str)]) -> RawEvent {
        RawEvent {
            kind,
            action: action.to_string(),
            id: id.to_string(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            time_nanos: 42,
        }
    }

    #[test]
    fn test_translate_service_actions() {
        let create = translate(&raw(EntityKind::Service, "create", "s1", &[])).unwrap();
        assert_eq!(create.kind, ChangeKind::Create);
        assert_eq!(create.observed_at_nanos, 42);
        assert!(create.use_cache);

        let update = translate(&raw(EntityKind::Service, "update", "s1", &[])).unwrap();
        assert_eq!(update.kind, ChangeKind::Create);

        let remove = translate(&raw(EntityKind::Service, "remove", "s1", &[])).unwrap();
        assert_eq!(remove.kind, ChangeKind::Remove);

        assert!(translate(&raw(EntityKind::Service, "exec_start", "s1", &[])).is_none());
    }

    #[test]
    fn test_translate_ignores_unnamed_node_updates() {
        assert!(translate(&raw(EntityKind::Node, "update", "n1", &[])).is_none());
        assert!(translate(&raw(EntityKind::Node, "update", "n1", &[("name", "")])).is_none());
        assert!(translate(&raw(EntityKind::Node, "update", "n1", &[("name", "host")])).is_some());
        assert!(translate(&raw(EntityKind::Node, "create", "n1", &[])).is_some());
        assert!(translate(&raw(EntityKind::Node, "remove", "n1", &[])).is_some());
    }

    #[tokio::test]
    async fn test_stream_opened_before_start_returns() {
        let client = Arc::new(MockControlPlane::default());
        let _events_tx = client.push_stream();
        let (tx, _rx) = mpsc::channel(1);

        let listener = EventStreamListener::start(
            client.clone(),
            EntityKind::Service,
            tx,
            new_shared_metrics(),
            Duration::from_millis(10),
        )
        .await;

        assert_eq!(client.stream_opens.load(Ordering::SeqCst), 1);
        listener.abort();
    }

    #[tokio::test]
    async fn test_reconnects_after_stream_error() {
        let client = Arc::new(MockControlPlane::default());
        let first = client.push_stream();
        client.push_stream_failure("daemon restarting");
        let second = client.push_stream();
        let metrics = new_shared_metrics();
        let (tx, mut rx) = mpsc::channel(1);

        let listener = EventStreamListener::start(
            client.clone(),
            EntityKind::Service,
            tx,
            metrics.clone(),
            Duration::from_millis(10),
        )
        .await;

        first
            .send(Ok(raw(EntityKind::Service, "create", "s1", &[])))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().id, "s1");

        first
            .send(Err(ControlPlaneError::Stream("connection reset".to_string())))
            .await
            .unwrap();

        second
            .send(Ok(raw(EntityKind::Service, "remove", "s1", &[])))
            .await
            .unwrap();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Remove);

        assert_eq!(client.stream_opens.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.error_count("stream_services"), 2);
        listener.abort();
    }
}
