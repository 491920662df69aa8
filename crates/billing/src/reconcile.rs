//! Payment reconciler: matches provider notifications to pending orders
//! and grants access exactly once per order.

use crate::ledger::OrderLedger;
use crate::signature::SignatureVerifier;
use funnel_channels::Dispatcher;
use funnel_core::event_bus::{make_event, EventKind, EventSink};
use funnel_core::types::{Button, Catalog, Menu, Order, OrderId, OutboundMessage};
use funnel_core::FunnelError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Provider status values that mean the money arrived.
const SUCCESS_STATUSES: [&str; 3] = ["finished", "confirmed", "paid"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileOutcome {
    Success,
    Ignored,
    Unauthorized,
    UnknownOrder,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Success => "success",
            ReconcileOutcome::Ignored => "ignored",
            ReconcileOutcome::Unauthorized => "unauthorized",
            ReconcileOutcome::UnknownOrder => "unknown-order",
        }
    }
}

/// Inbound payment notification. Providers disagree on field names, so the
/// common spellings are accepted; everything else is kept in `extra`.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentNotification {
    #[serde(default, alias = "orderIdentifier", alias = "orderId")]
    pub order_id: Option<String>,
    #[serde(default, alias = "payment_status")]
    pub status: Option<String>,
    #[serde(default, alias = "order_description", alias = "description")]
    pub reference: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PaymentNotification {
    pub fn is_success(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.trim().to_ascii_lowercase())
            .is_some_and(|s| SUCCESS_STATUSES.contains(&s.as_str()))
    }

    /// Explicit id field first, then an id embedded in the echoed reference.
    pub fn order_id(&self) -> Option<OrderId> {
        self.order_id
            .as_deref()
            .and_then(OrderId::parse)
            .or_else(|| self.reference.as_deref().and_then(OrderId::find_in))
    }
}

pub struct PaymentReconciler {
    ledger: OrderLedger,
    verifier: Option<SignatureVerifier>,
    dispatcher: Dispatcher,
    catalog: Arc<Catalog>,
    access_link: String,
    event_sink: Arc<dyn EventSink>,
}

impl PaymentReconciler {
    pub fn new(
        ledger: OrderLedger,
        dispatcher: Dispatcher,
        catalog: Arc<Catalog>,
        access_link: impl Into<String>,
    ) -> Self {
        Self {
            ledger,
            verifier: None,
            dispatcher,
            catalog,
            access_link: access_link.into(),
            event_sink: funnel_core::event_bus::noop_sink(),
        }
    }

    /// Require a valid signature on every notification.
    pub fn with_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Attach an event sink for emitting reconciliation events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Reconcile one raw notification. Never fails: every path ends in an
    /// outcome the transport layer can acknowledge. Does not wait on the
    /// channel API; the access message goes out on a background task.
    pub fn reconcile(&self, body: &[u8], signature: Option<&str>) -> ReconcileOutcome {
        let outcome = self.reconcile_inner(body, signature);
        metrics::counter!("payments.reconciled", "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    fn reconcile_inner(&self, body: &[u8], signature: Option<&str>) -> ReconcileOutcome {
        if let Some(verifier) = &self.verifier {
            if !verifier.verify(body, signature) {
                let e = FunnelError::UnauthorizedNotification;
                warn!(has_signature = signature.is_some(), error = %e, "Dropping payment notification");
                self.event_sink.emit(make_event(EventKind::PaymentRejected, None));
                return ReconcileOutcome::Unauthorized;
            }
        }

        let notification: PaymentNotification = match serde_json::from_slice(body) {
            Ok(n) => n,
            Err(e) => {
                let e = FunnelError::from(e);
                warn!(error = %e, "Unreadable payment notification");
                self.event_sink.emit(
                    make_event(EventKind::PaymentIgnored, None).with_detail("malformed body"),
                );
                return ReconcileOutcome::Ignored;
            }
        };

        let Some(order_id) = notification.order_id() else {
            info!(status = ?notification.status, "Payment notification without order id");
            self.event_sink.emit(
                make_event(EventKind::PaymentIgnored, None).with_detail("no order id"),
            );
            return ReconcileOutcome::Ignored;
        };

        if !notification.is_success() {
            info!(
                order_id = %order_id,
                status = ?notification.status,
                "Payment not final yet"
            );
            self.event_sink.emit(
                make_event(EventKind::PaymentIgnored, None)
                    .with_order(order_id)
                    .with_detail(notification.status.unwrap_or_default()),
            );
            return ReconcileOutcome::Ignored;
        }

        // Removal is the claim: a replayed notification finds nothing.
        let Some(order) = self.ledger.take(&order_id) else {
            let e = FunnelError::UnknownOrder(order_id.to_string());
            warn!(error = %e, "Paid notification needs manual follow-up");
            self.event_sink
                .emit(make_event(EventKind::PaymentUnknownOrder, None).with_order(order_id));
            return ReconcileOutcome::UnknownOrder;
        };

        info!(
            order_id = %order.order_id,
            participant = %order.participant,
            product = %order.product_id,
            "Payment confirmed"
        );
        self.event_sink.emit(
            make_event(EventKind::PaymentReconciled, Some(order.participant.clone()))
                .with_order(order.order_id.clone()),
        );
        self.dispatcher.dispatch(self.access_message(&order));
        ReconcileOutcome::Success
    }

    fn access_message(&self, order: &Order) -> OutboundMessage {
        let title = self
            .catalog
            .get(&order.product_id)
            .map(|p| p.title.as_str())
            .unwrap_or("your VIP access");
        OutboundMessage::text(
            order.participant.clone(),
            format!(
                "✅ Payment confirmed!\n\n*{title}* is unlocked. Tap below to get in 💕"
            ),
        )
        .with_menu(Menu::single(Button::url("🔓 Enter VIP", &self.access_link)))
    }
}
