//! Relays Docker Swarm service and node changes to HTTP listeners.
//!
//! Changes are detected from the Docker event stream and, optionally, by
//! periodic reconciliation. Each change is diffed against a cache of minimal
//! snapshots and fanned out to every configured listener, one ordered lane
//! per listener host. A newer change for an entity cancels delivery of the
//! older one still in flight.

pub mod cache;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod entity;
pub mod listener;
pub mod metrics;
pub mod notify;
pub mod server;
pub mod source;
