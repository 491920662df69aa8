//! Funnel state machine: maps one classified inbound event to the
//! participant's next state and the single reply to send.
//!
//! Transition table:
//!
//! | State            | Event           | Next              | Reply                     |
//! |------------------|-----------------|-------------------|---------------------------|
//! | any              | ConfirmAge      | ViewingOffers     | intro, lead tracked       |
//! | New / AgeGate    | anything else   | AgeGate           | age gate                  |
//! | later            | Start           | AgeGate           | age gate                  |
//! | later            | ShowOffers      | ViewingOffers     | product menu              |
//! | later            | Tease           | unchanged         | teaser                    |
//! | later            | SelectProduct   | AwaitingPayment   | payment link              |
//! | AwaitingPayment  | CheckPayment    | AwaitingPayment   | "checking" acknowledgement|
//! | later            | unrecognized    | unchanged         | corrective nudge          |
//!
//! Payment trouble (unconfigured or failing provider) degrades to the
//! "not available yet" reply and leaves the participant on the offers.

use crate::content::FunnelContent;
use crate::leads::LeadTracker;
use crate::session::{InMemorySessionStore, PendingPayment, Session, SessionStore};
use chrono::{DateTime, Utc};
use funnel_billing::gateway::InvoiceRequest;
use funnel_billing::{InvoiceProvider, OrderLedger};
use funnel_core::event_bus::{make_event, EventKind, EventSink};
use funnel_core::FunnelError;
use funnel_core::types::{
    Catalog, FunnelState, InboundEvent, OrderId, OutboundMessage, ParticipantId, Product,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct FunnelMachine {
    sessions: Arc<dyn SessionStore>,
    leads: LeadTracker,
    ledger: OrderLedger,
    catalog: Arc<Catalog>,
    content: FunnelContent,
    payments: Option<Arc<dyn InvoiceProvider>>,
    callback_url: String,
    event_sink: Arc<dyn EventSink>,
}

impl FunnelMachine {
    pub fn new(
        leads: LeadTracker,
        ledger: OrderLedger,
        catalog: Arc<Catalog>,
        content: FunnelContent,
    ) -> Self {
        Self {
            sessions: Arc::new(InMemorySessionStore::new()),
            leads,
            ledger,
            catalog,
            content,
            payments: None,
            callback_url: String::new(),
            event_sink: funnel_core::event_bus::noop_sink(),
        }
    }

    /// Enable purchases. Invoices ask the provider to notify `callback_url`.
    pub fn with_payments(
        mut self,
        provider: Arc<dyn InvoiceProvider>,
        callback_url: impl Into<String>,
    ) -> Self {
        self.payments = Some(provider);
        self.callback_url = callback_url.into();
        self
    }

    /// Attach an event sink for emitting funnel events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn state_of(&self, participant: &ParticipantId) -> FunnelState {
        self.sessions.get(participant).state
    }

    pub fn leads(&self) -> &LeadTracker {
        &self.leads
    }

    pub async fn handle(&self, participant: &ParticipantId, event: InboundEvent) -> OutboundMessage {
        self.handle_at(participant, event, Utc::now()).await
    }

    /// Apply one inbound event observed at `now`. Never fails: every path
    /// ends in a reply for the participant.
    pub async fn handle_at(
        &self,
        participant: &ParticipantId,
        event: InboundEvent,
        now: DateTime<Utc>,
    ) -> OutboundMessage {
        metrics::counter!("funnel.inbound_events", "event" => event.label()).increment(1);
        self.event_sink.emit(
            make_event(EventKind::InboundReceived, Some(participant.clone()))
                .with_detail(event.label()),
        );

        // Any activity restarts the idle window of an existing lead.
        self.leads.touch(participant, now);

        let session = self.sessions.get(participant);
        debug!(
            participant = %participant,
            state = ?session.state,
            event = event.label(),
            "Inbound event"
        );

        match (session.state, event) {
            (_, InboundEvent::ConfirmAge) => {
                self.sessions
                    .put(participant, Session::at(FunnelState::ViewingOffers));
                self.leads.start_tracking(participant, now);
                self.content.intro(participant)
            }
            (FunnelState::New | FunnelState::AgeGate, _) | (_, InboundEvent::Start) => {
                self.sessions.put(participant, Session::at(FunnelState::AgeGate));
                self.content.age_gate(participant)
            }
            (_, InboundEvent::ShowOffers) => self.show_offers(participant, now),
            (_, InboundEvent::Tease) => self.content.tease(participant),
            (_, InboundEvent::SelectProduct(product_id)) => {
                self.select_product(participant, &session, &product_id, now).await
            }
            (FunnelState::AwaitingPayment, InboundEvent::CheckPayment) => {
                self.content.checking_payment(participant)
            }
            (FunnelState::AwaitingPayment, InboundEvent::Unrecognized(_)) => {
                match session.pending_payment {
                    Some(pending) => self.content.payment_prompt(participant, &pending.payment_url),
                    None => self.show_offers(participant, now),
                }
            }
            (FunnelState::ViewingOffers, InboundEvent::CheckPayment | InboundEvent::Unrecognized(_)) => {
                self.show_offers(participant, now)
            }
        }
    }

    fn show_offers(&self, participant: &ParticipantId, now: DateTime<Utc>) -> OutboundMessage {
        self.sessions
            .put(participant, Session::at(FunnelState::ViewingOffers));
        self.leads.start_tracking(participant, now);
        self.content.offers(participant, &self.catalog)
    }

    /// `observed` is the session read before the invoice call; the outcome
    /// is only written back if no later event replaced it meanwhile.
    async fn select_product(
        &self,
        participant: &ParticipantId,
        observed: &Session,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> OutboundMessage {
        let Some(product) = self.catalog.get(product_id) else {
            let e = FunnelError::UnknownProduct(product_id.to_string());
            info!(participant = %participant, error = %e, "Ignoring product selection");
            return self.show_offers(participant, now);
        };

        let Some(provider) = &self.payments else {
            info!(participant = %participant, "Purchase attempted while payments are not configured");
            return self.payments_unavailable(participant, observed, "payments not configured");
        };

        let order = self.ledger.create_order(participant, &product.id, now);
        let request = self.invoice_request(product, &order.order_id);

        match provider.create_invoice(&request).await {
            Ok(invoice) => {
                info!(
                    participant = %participant,
                    order_id = %order.order_id,
                    invoice_id = invoice.invoice_id.as_deref().unwrap_or("-"),
                    "Payment link issued"
                );
                let next = Session {
                    state: FunnelState::AwaitingPayment,
                    pending_payment: Some(PendingPayment {
                        order_id: order.order_id.clone(),
                        payment_url: invoice.payment_url.clone(),
                    }),
                };
                if !self.sessions.compare_and_put(participant, observed, next) {
                    // The order stays payable through the ledger.
                    debug!(
                        participant = %participant,
                        order_id = %order.order_id,
                        "Session moved on during invoice creation; keeping newer state"
                    );
                }
                self.content.payment_prompt(participant, &invoice.payment_url)
            }
            Err(e) => {
                warn!(
                    participant = %participant,
                    order_id = %order.order_id,
                    error = %e,
                    recoverable = e.is_recoverable(),
                    "Invoice creation failed"
                );
                // No link was handed out, so nothing can ever pay this order.
                self.ledger.take(&order.order_id);
                self.payments_unavailable(participant, observed, &e.to_string())
            }
        }
    }

    fn invoice_request(&self, product: &Product, order_id: &OrderId) -> InvoiceRequest {
        InvoiceRequest {
            order_id: order_id.clone(),
            amount: product.price_amount,
            currency: product.price_currency.clone(),
            description: format!("{} | {}", product.title, order_id),
            callback_url: self.callback_url.clone(),
        }
    }

    fn payments_unavailable(
        &self,
        participant: &ParticipantId,
        observed: &Session,
        reason: &str,
    ) -> OutboundMessage {
        self.sessions.compare_and_put(
            participant,
            observed,
            Session::at(FunnelState::ViewingOffers),
        );
        self.event_sink.emit(
            make_event(EventKind::PaymentUnavailable, Some(participant.clone())).with_detail(reason),
        );
        self.content.payments_unavailable(participant)
    }
}
