//! HTTP surface of the funnel: chat and payment webhooks plus liveness and
//! readiness probes. Metrics are served by a separate exporter.

#![warn(clippy::unwrap_used)]

pub mod rest;
pub mod server;
pub mod webhook;

pub use rest::AppState;
pub use server::{router, ApiServer};
