use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use funnel_core::types::{FunnelState, OrderId, ParticipantId};

/// Invoice the participant was last sent, re-shown on corrective nudges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingPayment {
    pub order_id: OrderId,
    pub payment_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub state: FunnelState,
    pub pending_payment: Option<PendingPayment>,
}

impl Session {
    pub fn at(state: FunnelState) -> Self {
        Self {
            state,
            pending_payment: None,
        }
    }
}

/// Conversation state per participant. Unknown participants are `New`.
pub trait SessionStore: Send + Sync {
    fn get(&self, id: &ParticipantId) -> Session;
    fn put(&self, id: &ParticipantId, session: Session);
    /// Store `next` only if the current session still equals `expected`.
    fn compare_and_put(&self, id: &ParticipantId, expected: &Session, next: Session) -> bool;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<ParticipantId, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn get(&self, id: &ParticipantId) -> Session {
        self.sessions
            .get(id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn put(&self, id: &ParticipantId, session: Session) {
        self.sessions.insert(id.clone(), session);
    }

    fn compare_and_put(&self, id: &ParticipantId, expected: &Session, next: Session) -> bool {
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get() != expected {
                    return false;
                }
                entry.insert(next);
                true
            }
            Entry::Vacant(entry) => {
                if *expected != Session::default() {
                    return false;
                }
                entry.insert(next);
                true
            }
        }
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}
