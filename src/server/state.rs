use std::sync::Arc;

use crate::listener::SwarmListener;
use crate::metrics::SharedMetrics;

/// Shared state of the admin surface
#[derive(Clone)]
pub struct AppState {
    pub listener: Arc<SwarmListener>,
    pub metrics: SharedMetrics,
}

impl AppState {
    pub fn new(listener: Arc<SwarmListener>, metrics: SharedMetrics) -> Self {
        Self { listener, metrics }
    }
}
