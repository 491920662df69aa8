//! Router-level tests: drive the webhooks in-process with `oneshot`.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use funnel_api::{router, AppState};
use funnel_billing::{OrderLedger, PaymentReconciler, RecordingInvoiceProvider, SignatureVerifier};
use funnel_channels::{Dispatcher, RecordingNotifier};
use funnel_core::config::{RemarketingConfig, SignatureAlgorithm};
use funnel_core::types::{ButtonAction, Catalog, FunnelState, ParticipantId, Product, RemarketingStage};
use funnel_journey::{FunnelContent, FunnelMachine, LeadTracker, RemarketingScheduler};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceExt;

const SIG_HEADER: &str = "x-nowpayments-sig";

struct Harness {
    app: Router,
    machine: Arc<FunnelMachine>,
    ledger: OrderLedger,
    tracker: LeadTracker,
    notifier: Arc<RecordingNotifier>,
    dispatcher: Dispatcher,
}

fn harness(verifier: Option<SignatureVerifier>) -> Harness {
    harness_with(
        verifier,
        RecordingNotifier::new(),
        RecordingInvoiceProvider::new("https://pay.test/i"),
    )
}

fn harness_with(
    verifier: Option<SignatureVerifier>,
    notifier: RecordingNotifier,
    provider: RecordingInvoiceProvider,
) -> Harness {
    let catalog = Arc::new(Catalog::new(vec![Product::new(
        "pack1",
        "Photo pack",
        20.0,
        "EUR",
    )]));
    let notifier = Arc::new(notifier);
    let dispatcher = Dispatcher::new(notifier.clone());
    let ledger = OrderLedger::default();
    let tracker = LeadTracker::default();

    let machine = Arc::new(
        FunnelMachine::new(
            tracker.clone(),
            ledger.clone(),
            catalog.clone(),
            FunnelContent::default(),
        )
        .with_payments(Arc::new(provider), "https://bot.test/webhook/payment"),
    );

    let mut reconciler =
        PaymentReconciler::new(ledger.clone(), dispatcher.clone(), catalog, "https://t.me/+vip");
    if let Some(v) = verifier {
        reconciler = reconciler.with_verifier(v);
    }

    let state = AppState::new(
        machine.clone(),
        dispatcher.clone(),
        Arc::new(reconciler),
        SIG_HEADER,
    );

    Harness {
        app: router(state),
        machine,
        ledger,
        tracker,
        notifier,
        dispatcher,
    }
}

async fn post(app: &Router, uri: &str, body: Vec<u8>, signature: Option<&str>) -> (StatusCode, Value) {
    let mut request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(sig) = signature {
        request = request.header(SIG_HEADER, sig);
    }
    let response = app
        .clone()
        .oneshot(request.body(Body::from(body)).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn send_update(app: &Router, participant: &str, payload: Value) -> StatusCode {
    let mut body = json!({ "participantId": participant });
    body.as_object_mut().unwrap().extend(payload.as_object().unwrap().clone());
    post(app, "/webhook/channel", serde_json::to_vec(&body).unwrap(), None)
        .await
        .0
}

/// Channel processing is spawned; wait until `expected` messages arrived.
async fn wait_for_messages(notifier: &RecordingNotifier, expected: usize) {
    for _ in 0..100 {
        if notifier.count() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {expected} messages, got {}", notifier.count());
}

#[tokio::test]
async fn test_root_and_probes() {
    let h = harness(None);
    for uri in ["/", "/health", "/live", "/ready"] {
        let response = h
            .app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
    }
}

#[tokio::test]
async fn test_channel_webhook_always_acknowledges() {
    let h = harness(None);

    let (status, body) = post(&h.app, "/webhook/channel", b"not json".to_vec(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, _) = post(&h.app, "/webhook/channel", br#"{"update_id": 1}"#.to_vec(), None).await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.notifier.count(), 0);
}

#[tokio::test]
async fn test_channel_webhook_acknowledges_even_when_delivery_fails() {
    let h = harness(None);
    h.notifier.set_failing(true);

    assert_eq!(send_update(&h.app, "A", json!({ "text": "/start" })).await, StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.machine.state_of(&ParticipantId::from("A")), FunnelState::AgeGate);
}

#[tokio::test]
async fn test_platform_update_shape() {
    let h = harness(None);
    let update = json!({
        "update_id": 10,
        "message": { "message_id": 1, "chat": { "id": 4242 }, "text": "/start" }
    });
    let (status, _) = post(&h.app, "/webhook/channel", serde_json::to_vec(&update).unwrap(), None).await;
    assert_eq!(status, StatusCode::OK);

    wait_for_messages(&h.notifier, 1).await;
    assert_eq!(h.notifier.sent_to(&ParticipantId::from(4242)).len(), 1);
}

#[tokio::test]
async fn test_payment_webhook_outcomes() {
    let h = harness(None);

    let (status, body) = post(
        &h.app,
        "/webhook/payment",
        br#"{"order_id":"Z_pack1_1","payment_status":"finished"}"#.to_vec(),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ok": true, "outcome": "unknown-order" }));

    let (status, body) = post(&h.app, "/webhook/payment", br#"{"payment_status":"waiting"}"#.to_vec(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "ignored");
}

#[tokio::test]
async fn test_payment_webhook_rejects_bad_signature() {
    let verifier = SignatureVerifier::new("ipn-secret", SignatureAlgorithm::Sha512);
    let h = harness(Some(verifier.clone()));
    let order = h
        .ledger
        .create_order(&ParticipantId::from("A"), "pack1", Utc::now());
    let body = serde_json::to_vec(&json!({
        "order_id": order.order_id.as_str(),
        "payment_status": "finished",
    }))
    .unwrap();

    let (status, response) = post(&h.app, "/webhook/payment", body.clone(), Some("deadbeef")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["ok"], false);
    assert_eq!(h.ledger.pending(), 1);

    let (status, response) = post(&h.app, "/webhook/payment", body.clone(), Some(&verifier.sign(&body))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["outcome"], "success");
    assert_eq!(h.ledger.pending(), 0);
}

#[tokio::test]
async fn test_payment_webhook_acks_before_access_message_is_sent() {
    let h = harness_with(
        None,
        RecordingNotifier::new().with_delay(Duration::from_secs(3)),
        RecordingInvoiceProvider::new("https://pay.test/i"),
    );
    let order = h
        .ledger
        .create_order(&ParticipantId::from("A"), "pack1", Utc::now());
    let body = serde_json::to_vec(&json!({
        "order_id": order.order_id.as_str(),
        "payment_status": "paid",
    }))
    .unwrap();

    let started = Instant::now();
    let (status, response) = post(&h.app, "/webhook/payment", body, None).await;
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["outcome"], "success");
    assert_eq!(h.ledger.pending(), 0);
}

/// start → age gate, confirm → intro + lead, idle sweep → stage 1,
/// purchase → payment link, paid webhook → access once, replay → no-op.
#[tokio::test]
async fn test_full_funnel_scenario() {
    let h = harness(None);
    let a = ParticipantId::from("A");

    send_update(&h.app, "A", json!({ "text": "start" })).await;
    wait_for_messages(&h.notifier, 1).await;
    assert_eq!(h.machine.state_of(&a), FunnelState::AgeGate);

    send_update(&h.app, "A", json!({ "data": "age_ok" })).await;
    wait_for_messages(&h.notifier, 2).await;
    let lead = h.tracker.get(&a).unwrap();
    let t0 = lead.last_interaction_at;

    let scheduler = RemarketingScheduler::new(
        h.tracker.clone(),
        h.dispatcher.clone(),
        FunnelContent::default(),
        &RemarketingConfig::default(),
    );
    for handle in scheduler.sweep(t0 + ChronoDuration::seconds(310)) {
        handle.await.unwrap();
    }
    assert_eq!(h.notifier.count(), 3);
    assert!(h
        .tracker
        .get(&a)
        .unwrap()
        .stages_sent
        .contains(&RemarketingStage::First));

    send_update(&h.app, "A", json!({ "data": "buy:pack1" })).await;
    wait_for_messages(&h.notifier, 4).await;
    assert_eq!(h.machine.state_of(&a), FunnelState::AwaitingPayment);
    assert_eq!(h.ledger.pending(), 1);

    let prompt = h.notifier.sent_to(&a).pop().unwrap();
    let ButtonAction::Url(payment_url) = &prompt.menu.rows[0][0].action else {
        panic!("payment prompt must carry a link");
    };
    let order_id = payment_url.rsplit('/').next().unwrap().to_string();

    let paid = serde_json::to_vec(&json!({ "order_id": order_id, "payment_status": "paid" })).unwrap();
    let (status, body) = post(&h.app, "/webhook/payment", paid.clone(), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "success");
    assert_eq!(h.ledger.pending(), 0);
    wait_for_messages(&h.notifier, 5).await;

    let (status, body) = post(&h.app, "/webhook/payment", paid, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "unknown-order");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.notifier.count(), 5);
}
