//! Shared handler state and operational endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use funnel_billing::PaymentReconciler;
use funnel_channels::Dispatcher;
use funnel_journey::FunnelMachine;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Shared application state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<FunnelMachine>,
    pub dispatcher: Dispatcher,
    pub reconciler: Arc<PaymentReconciler>,
    /// Header carrying the payment notification signature.
    pub signature_header: String,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        machine: Arc<FunnelMachine>,
        dispatcher: Dispatcher,
        reconciler: Arc<PaymentReconciler>,
        signature_header: impl Into<String>,
    ) -> Self {
        Self {
            machine,
            dispatcher,
            reconciler,
            signature_header: signature_header.into().to_ascii_lowercase(),
            start_time: Instant::now(),
        }
    }
}

/// GET /: fixed liveness text, no state involved.
pub async fn root() -> &'static str {
    "funnel bot running"
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        tracked_leads: state.machine.leads().len(),
    })
}

/// GET /ready: the router only exists once configuration validated.
pub async fn readiness() -> StatusCode {
    StatusCode::OK
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub tracked_leads: usize,
}

#[derive(Serialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<&'static str>,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            ok: true,
            outcome: None,
        }
    }

    pub fn with_outcome(ok: bool, outcome: &'static str) -> Self {
        Self {
            ok,
            outcome: Some(outcome),
        }
    }
}
