//! Remarketing scheduler: periodic sweep over tracked leads that sends each
//! idle-triggered nudge at most once per idle window.
//!
//! Stages are claimed in the lead tracker before anything is sent. A claim
//! only succeeds if the record is still idle since the moment the sweep
//! observed it, so an overlapping tick or a concurrent inbound event can
//! never cause a duplicate.

use crate::content::FunnelContent;
use crate::leads::LeadTracker;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use funnel_channels::Dispatcher;
use funnel_core::config::{CatchUpPolicy, RemarketingConfig};
use funnel_core::event_bus::{make_event, EventKind, EventSink};
use funnel_billing::OrderLedger;
use funnel_core::types::{LeadRecord, OrderId, ParticipantId, RemarketingStage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Stages claimed for one participant in one sweep, lowest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNudges {
    pub participant: ParticipantId,
    pub stages: Vec<RemarketingStage>,
}

#[derive(Debug, Default)]
pub struct SweepReport {
    pub nudges: Vec<PlannedNudges>,
    /// Leads forgotten after their final stage.
    pub exhausted: Vec<ParticipantId>,
    /// Leads dropped for exceeding the absolute TTL.
    pub expired: Vec<ParticipantId>,
    /// Unpaid orders dropped for exceeding the order TTL.
    pub expired_orders: Vec<OrderId>,
}

impl SweepReport {
    pub fn stages_sent(&self) -> usize {
        self.nudges.iter().map(|n| n.stages.len()).sum()
    }
}

pub struct RemarketingScheduler {
    tracker: LeadTracker,
    dispatcher: Dispatcher,
    content: FunnelContent,
    thresholds: [(RemarketingStage, u64); 3],
    catch_up: CatchUpPolicy,
    lead_ttl: ChronoDuration,
    orders: Option<(OrderLedger, ChronoDuration)>,
    interval: Duration,
    event_sink: Arc<dyn EventSink>,
}

impl RemarketingScheduler {
    pub fn new(
        tracker: LeadTracker,
        dispatcher: Dispatcher,
        content: FunnelContent,
        config: &RemarketingConfig,
    ) -> Self {
        Self {
            tracker,
            dispatcher,
            content,
            thresholds: config.thresholds(),
            catch_up: config.catch_up,
            lead_ttl: ttl_from_secs(config.lead_ttl_secs),
            orders: None,
            interval: config.sweep_interval().max(Duration::from_millis(10)),
            event_sink: funnel_core::event_bus::noop_sink(),
        }
    }

    /// Attach an event sink for emitting stage events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Also drop unpaid orders older than `order_ttl_secs` on every sweep.
    pub fn with_order_expiry(mut self, ledger: OrderLedger, order_ttl_secs: u64) -> Self {
        self.orders = Some((ledger, ttl_from_secs(order_ttl_secs)));
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Decide and claim what this sweep sends. Claims are recorded in the
    /// tracker immediately; nothing is delivered here.
    pub fn plan_sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for participant in self.tracker.expire(now, self.lead_ttl) {
            debug!(participant = %participant, "Lead expired");
            self.event_sink
                .emit(make_event(EventKind::LeadExpired, Some(participant.clone())));
            report.expired.push(participant);
        }

        if let Some((ledger, ttl)) = &self.orders {
            report.expired_orders = ledger
                .expire(now, *ttl)
                .into_iter()
                .map(|order| order.order_id)
                .collect();
        }

        for record in self.tracker.records() {
            let claimed = self.claim_due_stages(&record, now);
            let Some(&highest) = claimed.last() else {
                continue;
            };

            let stages = match self.catch_up {
                CatchUpPolicy::AllDue => claimed,
                CatchUpPolicy::LatestOnly => vec![highest],
            };
            for stage in &stages {
                metrics::counter!("remarketing.nudges_sent", "stage" => stage.to_string())
                    .increment(1);
                self.event_sink.emit(
                    make_event(EventKind::StageSent, Some(record.participant.clone()))
                        .with_stage(*stage),
                );
            }
            info!(
                participant = %record.participant,
                stage = %highest,
                count = stages.len(),
                "Remarketing nudge due"
            );

            if highest.is_final()
                && self
                    .tracker
                    .forget_if_idle_since(&record.participant, record.last_interaction_at)
            {
                debug!(participant = %record.participant, "Lead exhausted");
                report.exhausted.push(record.participant.clone());
            }

            report.nudges.push(PlannedNudges {
                participant: record.participant,
                stages,
            });
        }

        report
    }

    /// Claim every stage whose threshold has elapsed, in ascending order.
    /// Stops at the first failed claim so a later stage is never recorded
    /// without the earlier ones.
    fn claim_due_stages(&self, record: &LeadRecord, now: DateTime<Utc>) -> Vec<RemarketingStage> {
        let idle = record.idle_secs(now);
        let mut claimed = Vec::new();
        for (stage, threshold) in self.thresholds {
            if idle < i64::try_from(threshold).unwrap_or(i64::MAX) {
                break;
            }
            if record.stages_sent.contains(&stage) {
                continue;
            }
            if !self
                .tracker
                .claim_stage(&record.participant, stage, record.last_interaction_at)
            {
                break;
            }
            claimed.push(stage);
        }
        claimed
    }

    /// Plan one sweep and hand the nudges to the dispatcher. Each
    /// participant's nudges go out in order on one background task, so a
    /// slow channel API never holds up the sweep.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<JoinHandle<usize>> {
        let report = self.plan_sweep(now);
        if report.stages_sent() > 0
            || !report.expired.is_empty()
            || !report.expired_orders.is_empty()
        {
            debug!(
                nudges = report.stages_sent(),
                exhausted = report.exhausted.len(),
                expired = report.expired.len(),
                expired_orders = report.expired_orders.len(),
                tracked = self.tracker.len(),
                "Remarketing sweep"
            );
        }

        report
            .nudges
            .into_iter()
            .map(|planned| {
                let messages = planned
                    .stages
                    .iter()
                    .map(|stage| self.content.nudge(&planned.participant, *stage))
                    .collect();
                self.dispatcher.dispatch_all(messages)
            })
            .collect()
    }
}

fn ttl_from_secs(secs: u64) -> ChronoDuration {
    i64::try_from(secs)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .unwrap_or(ChronoDuration::MAX)
}

/// Owns the running sweep loop. Dropping the handle does not stop the loop;
/// call [`SchedulerHandle::stop`].
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn start(scheduler: Arc<RemarketingScheduler>) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                interval_ms = scheduler.interval().as_millis() as u64,
                "Remarketing scheduler started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.sweep(Utc::now());
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Remarketing scheduler stopped");
        });

        Self { shutdown, task }
    }

    /// Signal the loop and wait for it to finish its current tick.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Remarketing scheduler task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use funnel_channels::RecordingNotifier;
    use funnel_core::event_bus::capture_sink;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    fn scheduler_with(
        config: RemarketingConfig,
    ) -> (RemarketingScheduler, LeadTracker, Arc<RecordingNotifier>) {
        let tracker = LeadTracker::default();
        let notifier = Arc::new(RecordingNotifier::new());
        let scheduler = RemarketingScheduler::new(
            tracker.clone(),
            Dispatcher::new(notifier.clone()),
            FunnelContent::default(),
            &config,
        );
        (scheduler, tracker, notifier)
    }

    fn scheduler() -> (RemarketingScheduler, LeadTracker, Arc<RecordingNotifier>) {
        scheduler_with(RemarketingConfig::default())
    }

    fn a() -> ParticipantId {
        ParticipantId::from("A")
    }

    fn stages(report: &SweepReport) -> Vec<RemarketingStage> {
        report.nudges.iter().flat_map(|n| n.stages.clone()).collect()
    }

    #[test]
    fn test_nothing_due_before_first_threshold() {
        let (s, tracker, _) = scheduler();
        tracker.start_tracking(&a(), t(0));
        assert!(s.plan_sweep(t(299)).nudges.is_empty());
    }

    #[test]
    fn test_each_stage_fires_once_across_many_ticks() {
        let (s, tracker, _) = scheduler();
        tracker.start_tracking(&a(), t(0));

        let mut fired = Vec::new();
        for tick in (0..4000).step_by(4) {
            fired.extend(stages(&s.plan_sweep(t(tick))));
        }

        assert_eq!(
            fired,
            vec![
                RemarketingStage::First,
                RemarketingStage::Second,
                RemarketingStage::Third
            ]
        );
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_all_due_sends_every_stage_in_order() {
        let (s, tracker, _) = scheduler();
        tracker.start_tracking(&a(), t(0));

        let report = s.plan_sweep(t(4000));
        assert_eq!(
            stages(&report),
            vec![
                RemarketingStage::First,
                RemarketingStage::Second,
                RemarketingStage::Third
            ]
        );
        assert_eq!(report.exhausted, vec![a()]);
    }

    #[test]
    fn test_partial_catch_up_stops_at_first_undue_stage() {
        let (s, tracker, _) = scheduler();
        tracker.start_tracking(&a(), t(0));

        assert_eq!(
            stages(&s.plan_sweep(t(1000))),
            vec![RemarketingStage::First, RemarketingStage::Second]
        );
        let record = tracker.get(&a()).unwrap();
        assert!(!record.stages_sent.contains(&RemarketingStage::Third));
    }

    #[test]
    fn test_latest_only_sends_highest_and_marks_lower() {
        let config = RemarketingConfig {
            catch_up: CatchUpPolicy::LatestOnly,
            ..RemarketingConfig::default()
        };
        let (s, tracker, _) = scheduler_with(config);
        tracker.start_tracking(&a(), t(0));

        assert_eq!(stages(&s.plan_sweep(t(1000))), vec![RemarketingStage::Second]);
        let record = tracker.get(&a()).unwrap();
        assert!(record.stages_sent.contains(&RemarketingStage::First));
        assert!(record.stages_sent.contains(&RemarketingStage::Second));

        assert!(s.plan_sweep(t(1001)).nudges.is_empty());
    }

    #[test]
    fn test_activity_restarts_the_clock() {
        let (s, tracker, _) = scheduler();
        tracker.start_tracking(&a(), t(0));
        assert_eq!(stages(&s.plan_sweep(t(310))), vec![RemarketingStage::First]);

        tracker.touch(&a(), t(320));
        assert!(s.plan_sweep(t(400)).nudges.is_empty());
        assert!(s.plan_sweep(t(619)).nudges.is_empty());
        assert_eq!(stages(&s.plan_sweep(t(620))), vec![RemarketingStage::First]);
    }

    #[test]
    fn test_participants_are_independent() {
        let (s, tracker, _) = scheduler();
        tracker.start_tracking(&a(), t(0));
        tracker.start_tracking(&ParticipantId::from("B"), t(200));

        let report = s.plan_sweep(t(300));
        assert_eq!(report.nudges.len(), 1);
        assert_eq!(report.nudges[0].participant, a());
    }

    #[test]
    fn test_ttl_drops_old_leads() {
        let config = RemarketingConfig {
            lead_ttl_secs: 100,
            ..RemarketingConfig::default()
        };
        let (s, tracker, _) = scheduler_with(config);
        let sink = capture_sink();
        let s = s.with_event_sink(sink.clone());
        tracker.start_tracking(&a(), t(0));

        let report = s.plan_sweep(t(100));
        assert_eq!(report.expired, vec![a()]);
        assert!(report.nudges.is_empty());
        assert!(tracker.is_empty());
        assert_eq!(sink.count_kind(EventKind::LeadExpired), 1);
    }

    #[test]
    fn test_sweep_expires_unpaid_orders() {
        let (scheduler, _, _) = scheduler();
        let ledger = OrderLedger::default();
        let scheduler = scheduler.with_order_expiry(ledger.clone(), 3600);
        let stale = ledger.create_order(&a(), "pack1", t(0));
        let fresh = ledger.create_order(&a(), "pack2", t(3000));

        let report = scheduler.plan_sweep(t(3600));
        assert_eq!(report.expired_orders, vec![stale.order_id]);
        assert_eq!(ledger.pending(), 1);
        assert!(ledger.get(&fresh.order_id).is_some());
    }

    #[tokio::test]
    async fn test_sweep_delivers_nudges_in_order() {
        let (s, tracker, notifier) = scheduler();
        let sink = capture_sink();
        let s = s.with_event_sink(sink.clone());
        tracker.start_tracking(&a(), t(0));

        for handle in s.sweep(t(1000)) {
            handle.await.unwrap();
        }

        let sent = notifier.sent_to(&a());
        let expected = FunnelContent::default();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].text, expected.nudge(&a(), RemarketingStage::First).text);
        assert_eq!(sent[1].text, expected.nudge(&a(), RemarketingStage::Second).text);
        assert_eq!(sink.count_kind(EventKind::StageSent), 2);
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_resend() {
        let (s, tracker, notifier) = scheduler();
        tracker.start_tracking(&a(), t(0));
        notifier.set_failing(true);

        for handle in s.sweep(t(301)) {
            assert_eq!(handle.await.unwrap(), 0);
        }
        notifier.set_failing(false);
        assert!(s.sweep(t(305)).is_empty());
        assert_eq!(notifier.count(), 0);
    }

    #[tokio::test]
    async fn test_handle_runs_and_stops() {
        let config = RemarketingConfig {
            sweep_interval_secs: 0,
            ..RemarketingConfig::default()
        };
        let (s, tracker, notifier) = scheduler_with(config);
        tracker.start_tracking(&a(), Utc::now() - ChronoDuration::seconds(310));

        let handle = SchedulerHandle::start(Arc::new(s));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;

        assert_eq!(notifier.sent_to(&a()).len(), 1);
    }
}
