//! Notification delivery: recipients, transport and fan-out
//!
//! ```text
//!   services ─┐                    ┌─> lane host-a ─> notifier ─> HTTP
//!             ├─ dispatcher/admit ─┼─> lane host-b ─> notifier ─> HTTP
//!   nodes ────┘   (cancel manager) └─> lane host-c ─> notifier ─> HTTP
//! ```
//!
//! Each recipient host owns one lane that drains its inbox serially, which
//! gives per-recipient ordering. Lanes run independently, so a slow recipient
//! never holds up the others.

pub mod distributor;
pub mod endpoint;
pub mod notifier;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::source::ChangeKind;

pub use distributor::{NotifyDistributor, NotifyLane};
pub use endpoint::{build_endpoints, Endpoint, EndpointAddrs, EndpointError};
pub use notifier::{build_url, Delivery, HttpNotifier, Notifier, NotifierSettings};

/// Errors from delivering a notification
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Invalid notification URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Recipient returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// One change to deliver to every recipient of its category
#[derive(Debug)]
pub struct Notification {
    pub kind: ChangeKind,
    pub id: String,
    /// Percent-encoded query string
    pub parameters: String,
    /// Distinguishes this change from earlier ones for the same id
    pub generation: i64,
    /// Replaced by the distributor at admission
    pub cancel: CancellationToken,
    /// Fired once the notification has been handed to every lane
    pub done: Option<oneshot::Sender<()>>,
}

impl Notification {
    pub fn new(kind: ChangeKind, id: impl Into<String>, parameters: String, generation: i64) -> Self {
        Self {
            kind,
            id: id.into(),
            parameters,
            generation,
            cancel: CancellationToken::new(),
            done: None,
        }
    }

    pub fn with_done(mut self, done: oneshot::Sender<()>) -> Self {
        self.done = Some(done);
        self
    }

    /// Copy for one lane, carrying the admitted scope
    fn for_lane(&self, cancel: CancellationToken) -> Self {
        Self {
            kind: self.kind,
            id: self.id.clone(),
            parameters: self.parameters.clone(),
            generation: self.generation,
            cancel,
            done: None,
        }
    }
}
