//! Chat channel plumbing.
//!
//! Inbound: parses platform updates and classifies them into the closed set
//! of funnel events.
//! Outbound: delivers messages and menus through the platform API, with a
//! fire-and-forget dispatcher that records every failure.

#![warn(clippy::unwrap_used)]

pub mod dispatcher;
pub mod inbound;
pub mod notifier;

pub use dispatcher::Dispatcher;
pub use inbound::{classify, InboundPayload, InboundUpdate};
pub use notifier::{Notifier, RecordingNotifier, TelegramNotifier};
