//! HTTP delivery with bounded retry and cooperative cancellation

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use super::NotifyError;
use crate::entity::EntityKind;
use crate::metrics::SharedMetrics;

/// Outcome of a delivery that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The recipient acknowledged the notification
    Sent,
    /// No address is configured for this direction
    Skipped,
    /// A newer change superseded this one before it was acknowledged
    Cancelled,
}

/// Something that delivers create and remove notifications to one recipient
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn create(
        &self,
        cancel: &CancellationToken,
        parameters: &str,
    ) -> Result<Delivery, NotifyError>;

    async fn remove(
        &self,
        cancel: &CancellationToken,
        parameters: &str,
    ) -> Result<Delivery, NotifyError>;
}

#[derive(Debug, Clone, Copy)]
pub struct NotifierSettings {
    /// Attempts per notification, at least one is always made
    pub retries: u32,
    pub retry_interval: Duration,
    pub request_timeout: Duration,
}

impl Default for NotifierSettings {
    fn default() -> Self {
        Self {
            retries: 50,
            retry_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Create,
    Remove,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Create => "Create",
            Direction::Remove => "Remove",
        }
    }

    fn accepts(&self, status: StatusCode) -> bool {
        match self {
            // 409 means the recipient already has this state
            Direction::Create => status == StatusCode::OK || status == StatusCode::CONFLICT,
            Direction::Remove => status == StatusCode::OK,
        }
    }
}

/// Merge the static query of `addr` with `parameters`; `parameters` win.
pub fn build_url(addr: &str, parameters: &str) -> Result<Url, NotifyError> {
    let mut url = Url::parse(addr).map_err(|e| NotifyError::InvalidUrl {
        url: addr.to_string(),
        message: e.to_string(),
    })?;

    let mut merged: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    for (key, value) in form_urlencoded::parse(parameters.as_bytes()).into_owned() {
        merged.retain(|(existing, _)| *existing != key);
        merged.push((key, value));
    }

    if merged.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(merged.iter());
    }
    Ok(url)
}

/// Delivers one entity kind's notifications to one recipient over HTTP GET
pub struct HttpNotifier {
    http_client: Client,
    kind: EntityKind,
    create_addr: String,
    remove_addr: String,
    settings: NotifierSettings,
    metrics: SharedMetrics,
}

impl HttpNotifier {
    pub fn new(
        http_client: Client,
        kind: EntityKind,
        create_addr: impl Into<String>,
        remove_addr: impl Into<String>,
        settings: NotifierSettings,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            http_client,
            kind,
            create_addr: create_addr.into(),
            remove_addr: remove_addr.into(),
            settings,
            metrics,
        }
    }

    fn error_tag(&self, direction: Direction) -> String {
        let kind = match self.kind {
            EntityKind::Service => "Service",
            EntityKind::Node => "Node",
        };
        format!("notificationSend{}{}Request", direction.as_str(), kind)
    }

    async fn attempt(&self, url: &Url, direction: Direction) -> Result<(), NotifyError> {
        let response = self
            .http_client
            .get(url.clone())
            .timeout(self.settings.request_timeout)
            .send()
            .await?;

        let status = response.status();
        if direction.accepts(status) {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn deliver(
        &self,
        direction: Direction,
        addr: &str,
        cancel: &CancellationToken,
        parameters: &str,
    ) -> Result<Delivery, NotifyError> {
        if addr.is_empty() {
            return Ok(Delivery::Skipped);
        }

        let url = match build_url(addr, parameters) {
            Ok(url) => url,
            Err(e) => {
                self.metrics.record_error(&self.error_tag(direction));
                return Err(e);
            }
        };
        let attempts = self.settings.retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                info!("Cancelled {} notification to {}", direction.as_str(), addr);
                return Ok(Delivery::Cancelled);
            }

            debug!("Sending {} notification to {} (attempt {})", direction.as_str(), url, attempt);
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cancelled {} notification to {}", direction.as_str(), addr);
                    return Ok(Delivery::Cancelled);
                }
                result = self.attempt(&url, direction) => result,
            };

            match result {
                Ok(()) => return Ok(Delivery::Sent),
                Err(e) => {
                    warn!(
                        "{} notification to {} failed (attempt {}/{}): {}",
                        direction.as_str(),
                        addr,
                        attempt,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("Cancelled {} notification to {}", direction.as_str(), addr);
                        return Ok(Delivery::Cancelled);
                    }
                    _ = tokio::time::sleep(self.settings.retry_interval) => {}
                }
            }
        }

        error!(
            "Giving up on {} notification to {} after {} attempts",
            direction.as_str(),
            addr,
            attempts
        );
        self.metrics.record_error(&self.error_tag(direction));

        Err(last_error.unwrap_or_else(|| NotifyError::Status {
            status: 0,
            body: "no attempt made".to_string(),
        }))
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn create(
        &self,
        cancel: &CancellationToken,
        parameters: &str,
    ) -> Result<Delivery, NotifyError> {
        self.deliver(Direction::Create, &self.create_addr, cancel, parameters)
            .await
    }

    async fn remove(
        &self,
        cancel: &CancellationToken,
        parameters: &str,
    ) -> Result<Delivery, NotifyError> {
        self.deliver(Direction::Remove, &self.remove_addr, cancel, parameters)
            .await
    }
}
