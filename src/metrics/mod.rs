//! Operational counters for the listener
//!
//! Error counters are keyed by operation tag and the service gauge holds the
//! last reported number of tracked services. Both are updated lock-free from
//! any task and exposed as a serializable snapshot on the admin surface.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Metrics sink shared across the pipeline
#[derive(Debug, Default)]
pub struct Metrics {
    errors: DashMap<String, AtomicU64>,
    service_count: AtomicUsize,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub errors: BTreeMap<String, u64>,
    pub service_count: usize,
    pub collected_at: DateTime<Utc>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the error counter for `operation`
    pub fn record_error(&self, operation: &str) {
        if let Some(counter) = self.errors.get(operation) {
            counter.fetch_add(1, Ordering::SeqCst);
            return;
        }
        self.errors
            .entry(operation.to_string())
            .or_default()
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_service_count(&self, count: usize) {
        self.service_count.store(count, Ordering::SeqCst);
    }

    pub fn error_count(&self, operation: &str) -> u64 {
        self.errors
            .get(operation)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn service_count(&self) -> usize {
        self.service_count.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            errors: self
                .errors
                .iter()
                .map(|r| (r.key().clone(), r.value().load(Ordering::SeqCst)))
                .collect(),
            service_count: self.service_count(),
            collected_at: Utc::now(),
        }
    }
}

pub type SharedMetrics = Arc<Metrics>;

pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(Metrics::new())
}
