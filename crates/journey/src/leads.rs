//! Lead tracker: last-activity time and fired remarketing stages per
//! participant.
//!
//! All operations are keyed by participant; nothing reads across records.
//! Read-modify-write happens inside one store call, under the store's
//! per-key lock, so the sweep never observes a half-updated record.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use funnel_core::types::{LeadRecord, ParticipantId, RemarketingStage};
use std::sync::Arc;
use tracing::debug;

/// Backing store for lead records.
pub trait LeadStore: Send + Sync {
    fn get(&self, id: &ParticipantId) -> Option<LeadRecord>;
    fn put(&self, record: LeadRecord);
    fn remove(&self, id: &ParticipantId) -> Option<LeadRecord>;
    fn list(&self) -> Vec<LeadRecord>;
    /// Apply `f` to the stored record atomically; `false` if there is none.
    fn update(&self, id: &ParticipantId, f: &mut dyn FnMut(&mut LeadRecord)) -> bool;
    /// Remove the record only if `predicate` holds for it.
    fn remove_if(
        &self,
        id: &ParticipantId,
        predicate: &dyn Fn(&LeadRecord) -> bool,
    ) -> Option<LeadRecord>;

    fn len(&self) -> usize {
        self.list().len()
    }
}

#[derive(Default)]
pub struct InMemoryLeadStore {
    records: DashMap<ParticipantId, LeadRecord>,
}

impl InMemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeadStore for InMemoryLeadStore {
    fn get(&self, id: &ParticipantId) -> Option<LeadRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    fn put(&self, record: LeadRecord) {
        self.records.insert(record.participant.clone(), record);
    }

    fn remove(&self, id: &ParticipantId) -> Option<LeadRecord> {
        self.records.remove(id).map(|(_, record)| record)
    }

    fn list(&self) -> Vec<LeadRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    fn update(&self, id: &ParticipantId, f: &mut dyn FnMut(&mut LeadRecord)) -> bool {
        match self.records.get_mut(id) {
            Some(mut record) => {
                f(record.value_mut());
                true
            }
            None => false,
        }
    }

    fn remove_if(
        &self,
        id: &ParticipantId,
        predicate: &dyn Fn(&LeadRecord) -> bool,
    ) -> Option<LeadRecord> {
        self.records
            .remove_if(id, |_, record| predicate(record))
            .map(|(_, record)| record)
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

#[derive(Clone)]
pub struct LeadTracker {
    store: Arc<dyn LeadStore>,
}

impl Default for LeadTracker {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryLeadStore::new()))
    }
}

impl LeadTracker {
    pub fn new(store: Arc<dyn LeadStore>) -> Self {
        Self { store }
    }

    /// Begin tracking with no stages sent. An existing record is refreshed
    /// instead, so a participant never has two.
    pub fn start_tracking(&self, id: &ParticipantId, now: DateTime<Utc>) {
        if !self.touch(id, now) {
            debug!(participant = %id, "Lead tracking started");
            self.store.put(LeadRecord::new(id.clone(), now));
        }
    }

    /// Register activity: restart the idle clock and clear fired stages so
    /// the full remarketing cycle can run again. `false` if not tracked.
    pub fn touch(&self, id: &ParticipantId, now: DateTime<Utc>) -> bool {
        self.store.update(id, &mut |record| {
            record.last_interaction_at = now;
            record.stages_sent.clear();
        })
    }

    pub fn stage_already_sent(&self, id: &ParticipantId, stage: RemarketingStage) -> bool {
        self.store
            .get(id)
            .is_some_and(|record| record.stages_sent.contains(&stage))
    }

    /// `false` if the participant is not tracked.
    pub fn mark_stage_sent(&self, id: &ParticipantId, stage: RemarketingStage) -> bool {
        self.store.update(id, &mut |record| {
            record.stages_sent.insert(stage);
        })
    }

    /// Atomically mark `stage` as sent, but only if the record still exists,
    /// has seen no activity since `observed_at`, and the stage is unsent.
    /// Exactly one caller can win a given stage for a given idle window.
    pub fn claim_stage(
        &self,
        id: &ParticipantId,
        stage: RemarketingStage,
        observed_at: DateTime<Utc>,
    ) -> bool {
        let mut claimed = false;
        self.store.update(id, &mut |record| {
            if record.last_interaction_at == observed_at && !record.stages_sent.contains(&stage) {
                record.stages_sent.insert(stage);
                claimed = true;
            }
        });
        claimed
    }

    pub fn forget(&self, id: &ParticipantId) -> bool {
        self.store.remove(id).is_some()
    }

    /// Forget the lead unless it saw activity after `observed_at`.
    pub fn forget_if_idle_since(&self, id: &ParticipantId, observed_at: DateTime<Utc>) -> bool {
        self.store
            .remove_if(id, &|record| record.last_interaction_at == observed_at)
            .is_some()
    }

    /// Drop records created more than `ttl` ago.
    pub fn expire(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<ParticipantId> {
        self.store
            .list()
            .into_iter()
            .filter(|record| now - record.created_at >= ttl)
            .filter_map(|record| {
                self.store
                    .remove_if(&record.participant, &|r| now - r.created_at >= ttl)
                    .map(|r| r.participant)
            })
            .collect()
    }

    pub fn get(&self, id: &ParticipantId) -> Option<LeadRecord> {
        self.store.get(id)
    }

    pub fn records(&self) -> Vec<LeadRecord> {
        self.store.list()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_start_tracking_creates_single_record() {
        let tracker = LeadTracker::default();
        let a = ParticipantId::from("A");
        tracker.start_tracking(&a, t(0));
        tracker.start_tracking(&a, t(10));

        assert_eq!(tracker.len(), 1);
        let record = tracker.get(&a).unwrap();
        assert_eq!(record.created_at, t(0));
        assert_eq!(record.last_interaction_at, t(10));
        assert!(record.stages_sent.is_empty());
    }

    #[test]
    fn test_touch_untracked_is_noop() {
        let tracker = LeadTracker::default();
        assert!(!tracker.touch(&ParticipantId::from("nobody"), t(0)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_touch_resets_stages() {
        let tracker = LeadTracker::default();
        let a = ParticipantId::from("A");
        tracker.start_tracking(&a, t(0));
        assert!(tracker.mark_stage_sent(&a, RemarketingStage::First));
        assert!(tracker.stage_already_sent(&a, RemarketingStage::First));

        assert!(tracker.touch(&a, t(400)));
        assert!(!tracker.stage_already_sent(&a, RemarketingStage::First));
        assert_eq!(tracker.get(&a).unwrap().last_interaction_at, t(400));
    }

    #[test]
    fn test_claim_stage_is_exactly_once() {
        let tracker = LeadTracker::default();
        let a = ParticipantId::from("A");
        tracker.start_tracking(&a, t(0));

        assert!(tracker.claim_stage(&a, RemarketingStage::First, t(0)));
        assert!(!tracker.claim_stage(&a, RemarketingStage::First, t(0)));
    }

    #[test]
    fn test_claim_fails_after_concurrent_touch() {
        let tracker = LeadTracker::default();
        let a = ParticipantId::from("A");
        tracker.start_tracking(&a, t(0));
        tracker.touch(&a, t(5));

        assert!(!tracker.claim_stage(&a, RemarketingStage::First, t(0)));
        assert!(!tracker.claim_stage(&ParticipantId::from("B"), RemarketingStage::First, t(0)));
    }

    #[test]
    fn test_forget_if_idle_since() {
        let tracker = LeadTracker::default();
        let a = ParticipantId::from("A");
        tracker.start_tracking(&a, t(0));
        tracker.touch(&a, t(1));

        assert!(!tracker.forget_if_idle_since(&a, t(0)));
        assert!(tracker.forget_if_idle_since(&a, t(1)));
        assert!(!tracker.forget(&a));
    }

    #[test]
    fn test_expire_by_absolute_age() {
        let tracker = LeadTracker::default();
        let old = ParticipantId::from("old");
        let fresh = ParticipantId::from("fresh");
        tracker.start_tracking(&old, t(0));
        tracker.start_tracking(&fresh, t(500));
        tracker.touch(&old, t(900));

        let expired = tracker.expire(t(1000), Duration::seconds(1000));
        assert_eq!(expired, vec![old]);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get(&fresh).is_some());
    }

    #[test]
    fn test_records_are_isolated_per_participant() {
        let tracker = LeadTracker::default();
        let a = ParticipantId::from("A");
        let b = ParticipantId::from("B");
        tracker.start_tracking(&a, t(0));
        tracker.start_tracking(&b, t(0));
        tracker.mark_stage_sent(&a, RemarketingStage::Second);

        assert!(!tracker.stage_already_sent(&b, RemarketingStage::Second));
        assert_eq!(tracker.records().len(), 2);
    }
}
