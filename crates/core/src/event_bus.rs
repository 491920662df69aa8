//! Funnel event bus: structured record of what the service did.
//!
//! Components accept an `Arc<dyn EventSink>` so outbound failures, stage
//! firings and reconciliation outcomes are observable (and countable in
//! tests) instead of only showing up in logs.

use crate::types::{OrderId, ParticipantId, RemarketingStage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InboundReceived,
    MessageDelivered,
    DeliveryFailed,
    StageSent,
    LeadExpired,
    OrderCreated,
    OrderExpired,
    PaymentUnavailable,
    PaymentReconciled,
    PaymentIgnored,
    PaymentRejected,
    PaymentUnknownOrder,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunnelEvent {
    pub kind: EventKind,
    pub participant: Option<ParticipantId>,
    pub order_id: Option<OrderId>,
    pub stage: Option<RemarketingStage>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FunnelEvent {
    pub fn with_order(mut self, order_id: OrderId) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn with_stage(mut self, stage: RemarketingStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Trait for emitting funnel events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FunnelEvent);
}

/// No-op sink for modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: FunnelEvent) {}
}

/// Forwards events to `tracing` at debug level.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: FunnelEvent) {
        tracing::debug!(
            kind = ?event.kind,
            participant = ?event.participant.as_ref().map(ParticipantId::as_str),
            order_id = ?event.order_id.as_ref().map(OrderId::as_str),
            stage = ?event.stage,
            detail = ?event.detail,
            "funnel event"
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<FunnelEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<FunnelEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_kind(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: FunnelEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for creating a `FunnelEvent` with minimal boilerplate.
pub fn make_event(kind: EventKind, participant: Option<ParticipantId>) -> FunnelEvent {
    FunnelEvent {
        kind,
        participant,
        order_id: None,
        stage: None,
        detail: None,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
