//! Order ledger: single-use order → participant mapping.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use funnel_core::event_bus::{make_event, EventKind, EventSink};
use funnel_core::types::{Order, OrderId, ParticipantId};
use std::sync::Arc;
use tracing::info;

/// Backing store for pending orders. Every method is atomic per order id.
pub trait OrderStore: Send + Sync {
    /// Insert unless the id is already taken; `false` on collision.
    fn insert_new(&self, order: Order) -> bool;
    fn get(&self, id: &OrderId) -> Option<Order>;
    fn remove(&self, id: &OrderId) -> Option<Order>;
    /// Remove the order only if `predicate` holds for it.
    fn remove_if(&self, id: &OrderId, predicate: &dyn Fn(&Order) -> bool) -> Option<Order>;
    fn list(&self) -> Vec<Order>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process store backed by `DashMap`.
#[derive(Default)]
pub struct InMemoryOrderStore {
    orders: DashMap<OrderId, Order>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OrderStore for InMemoryOrderStore {
    fn insert_new(&self, order: Order) -> bool {
        match self.orders.entry(order.order_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(order);
                true
            }
        }
    }

    fn get(&self, id: &OrderId) -> Option<Order> {
        self.orders.get(id).map(|r| r.clone())
    }

    fn remove(&self, id: &OrderId) -> Option<Order> {
        self.orders.remove(id).map(|(_, order)| order)
    }

    fn remove_if(&self, id: &OrderId, predicate: &dyn Fn(&Order) -> bool) -> Option<Order> {
        self.orders
            .remove_if(id, |_, order| predicate(order))
            .map(|(_, order)| order)
    }

    fn list(&self) -> Vec<Order> {
        self.orders.iter().map(|r| r.value().clone()).collect()
    }

    fn len(&self) -> usize {
        self.orders.len()
    }
}

#[derive(Clone)]
pub struct OrderLedger {
    store: Arc<dyn OrderStore>,
    event_sink: Arc<dyn EventSink>,
}

impl Default for OrderLedger {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryOrderStore::new()))
    }
}

impl OrderLedger {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self {
            store,
            event_sink: funnel_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for emitting ledger events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Record a pending order and return it. The id is derived from the
    /// participant, product and creation time; a same-millisecond collision
    /// moves the timestamp forward until the id is free.
    pub fn create_order(
        &self,
        participant: &ParticipantId,
        product_id: &str,
        now: DateTime<Utc>,
    ) -> Order {
        let mut created_at = now;
        loop {
            let order = Order {
                order_id: OrderId::compose(participant, product_id, created_at.timestamp_millis()),
                participant: participant.clone(),
                product_id: product_id.to_string(),
                created_at,
            };
            if self.store.insert_new(order.clone()) {
                info!(
                    order_id = %order.order_id,
                    participant = %participant,
                    product = product_id,
                    "Order created"
                );
                self.event_sink.emit(
                    make_event(EventKind::OrderCreated, Some(participant.clone()))
                        .with_order(order.order_id.clone()),
                );
                return order;
            }
            created_at += Duration::milliseconds(1);
        }
    }

    pub fn get(&self, id: &OrderId) -> Option<Order> {
        self.store.get(id)
    }

    /// Remove and return the order. Only one caller can ever win this for a
    /// given id, which is what makes access grants exactly-once.
    pub fn take(&self, id: &OrderId) -> Option<Order> {
        self.store.remove(id)
    }

    /// Drop unpaid orders created more than `ttl` ago. A paid notification
    /// for one of them later reconciles as an unknown order.
    pub fn expire(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<Order> {
        let expired: Vec<Order> = self
            .store
            .list()
            .into_iter()
            .filter(|order| now - order.created_at >= ttl)
            .filter_map(|order| {
                self.store
                    .remove_if(&order.order_id, &|o| now - o.created_at >= ttl)
            })
            .collect();

        for order in &expired {
            info!(
                order_id = %order.order_id,
                participant = %order.participant,
                "Unpaid order expired"
            );
            self.event_sink.emit(
                make_event(EventKind::OrderExpired, Some(order.participant.clone()))
                    .with_order(order.order_id.clone()),
            );
        }
        expired
    }

    pub fn pending(&self) -> usize {
        self.store.len()
    }
}
