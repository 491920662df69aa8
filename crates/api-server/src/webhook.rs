//! Webhook handlers.
//!
//! The chat webhook acknowledges before doing any work: the funnel step and
//! its reply run on a spawned task, so a slow channel or payment API can
//! never make the platform retry the same update. The payment webhook claims
//! the order inline, hands the access message to a background task, and
//! acknowledges every outcome except a bad signature.

use crate::rest::{Ack, AppState};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use funnel_billing::ReconcileOutcome;
use funnel_channels::InboundUpdate;
use tracing::{debug, warn};

/// POST /webhook/channel
pub async fn channel_webhook(State(state): State<AppState>, body: Bytes) -> Json<Ack> {
    let update = match InboundUpdate::parse(&body) {
        Ok(Some(update)) => update,
        Ok(None) => {
            debug!("Channel update without a funnel event");
            return Json(Ack::ok());
        }
        Err(e) => {
            warn!(error = %e, "Unreadable channel update");
            metrics::counter!("api.malformed_updates").increment(1);
            return Json(Ack::ok());
        }
    };

    tokio::spawn(async move {
        let event = update.event();
        let reply = state.machine.handle(&update.participant, event).await;
        state.dispatcher.deliver(&reply).await;
    });

    Json(Ack::ok())
}

/// POST /webhook/payment
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Ack>) {
    let signature = headers
        .get(state.signature_header.as_str())
        .and_then(|v| v.to_str().ok());

    let outcome = state.reconciler.reconcile(&body, signature);
    match outcome {
        ReconcileOutcome::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            Json(Ack::with_outcome(false, outcome.as_str())),
        ),
        _ => (StatusCode::OK, Json(Ack::with_outcome(true, outcome.as_str()))),
    }
}
