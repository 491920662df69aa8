//! Fire-and-forget delivery with an observable failure channel.
//!
//! Emits `MessageDelivered` or `DeliveryFailed` for every attempt.

use crate::notifier::Notifier;
use funnel_core::event_bus::{make_event, EventKind, EventSink};
use funnel_core::types::OutboundMessage;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Clone)]
pub struct Dispatcher {
    notifier: Arc<dyn Notifier>,
    event_sink: Arc<dyn EventSink>,
}

impl Dispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            event_sink: funnel_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for delivery outcomes.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Send and wait. Failures are logged and recorded, never returned.
    pub async fn deliver(&self, message: &OutboundMessage) -> bool {
        match self.notifier.send(message).await {
            Ok(()) => {
                metrics::counter!("funnel.outbound_delivered").increment(1);
                self.event_sink.emit(make_event(
                    EventKind::MessageDelivered,
                    Some(message.participant.clone()),
                ));
                true
            }
            Err(e) => {
                warn!(
                    participant = %message.participant,
                    error = %e,
                    "Outbound message lost"
                );
                metrics::counter!("funnel.outbound_failures").increment(1);
                self.event_sink.emit(
                    make_event(EventKind::DeliveryFailed, Some(message.participant.clone()))
                        .with_detail(e.to_string()),
                );
                false
            }
        }
    }

    /// Deliver on a background task so the caller never waits on the channel API.
    pub fn dispatch(&self, message: OutboundMessage) -> JoinHandle<bool> {
        let this = self.clone();
        tokio::spawn(async move { this.deliver(&message).await })
    }

    /// Deliver `messages` one after another on a single background task, so
    /// they reach the participant in order. Resolves to the delivered count.
    pub fn dispatch_all(&self, messages: Vec<OutboundMessage>) -> JoinHandle<usize> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut delivered = 0;
            for message in &messages {
                if this.deliver(message).await {
                    delivered += 1;
                }
            }
            delivered
        })
    }
}
