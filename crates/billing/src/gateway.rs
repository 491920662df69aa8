//! Outbound payment API: turns an order into a hosted payment link.

use async_trait::async_trait;
use funnel_core::config::PaymentConfig;
use funnel_core::types::OrderId;
use funnel_core::{FunnelError, FunnelResult};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Invoice request sent to the payment provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceRequest {
    pub order_id: OrderId,
    pub amount: f64,
    pub currency: String,
    /// Echoed back by the provider; carries the order id as a fallback reference.
    pub description: String,
    pub callback_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoice {
    pub invoice_id: Option<String>,
    pub payment_url: String,
}

#[async_trait]
pub trait InvoiceProvider: Send + Sync {
    async fn create_invoice(&self, request: &InvoiceRequest) -> FunnelResult<Invoice>;
}

#[derive(Serialize)]
struct NowPaymentsInvoiceBody<'a> {
    price_amount: f64,
    price_currency: &'a str,
    order_id: &'a str,
    order_description: &'a str,
    ipn_callback_url: &'a str,
}

#[derive(Deserialize)]
struct NowPaymentsInvoiceResponse {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    invoice_url: Option<String>,
}

/// Hosted-invoice client for a NOWPayments-compatible API.
pub struct NowPaymentsProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl NowPaymentsProvider {
    /// `Ok(None)` when no API key is configured: payments are simply not
    /// available yet, which the funnel reports to the participant.
    pub fn from_config(config: &PaymentConfig) -> FunnelResult<Option<Self>> {
        if !config.is_configured() {
            info!("Payment provider not configured; purchases will be declined gracefully");
            return Ok(None);
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| FunnelError::Transport(format!("http client: {e}")))?;
        Ok(Some(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
        }))
    }
}

#[async_trait]
impl InvoiceProvider for NowPaymentsProvider {
    async fn create_invoice(&self, request: &InvoiceRequest) -> FunnelResult<Invoice> {
        let body = NowPaymentsInvoiceBody {
            price_amount: request.amount,
            price_currency: &request.currency,
            order_id: request.order_id.as_str(),
            order_description: &request.description,
            ipn_callback_url: &request.callback_url,
        };

        let response = self
            .client
            .post(format!("{}/invoice", self.api_base))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| FunnelError::Transport(format!("create invoice: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(FunnelError::Transport(format!(
                "create invoice: {status} {detail}"
            )));
        }

        let parsed: NowPaymentsInvoiceResponse = response
            .json()
            .await
            .map_err(|e| FunnelError::Transport(format!("create invoice: bad response: {e}")))?;
        let payment_url = parsed.invoice_url.filter(|u| !u.is_empty()).ok_or_else(|| {
            FunnelError::Transport("create invoice: response has no invoice_url".to_string())
        })?;

        debug!(order_id = %request.order_id, "Invoice created");
        Ok(Invoice {
            invoice_id: parsed.id.map(|id| match id {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            }),
            payment_url,
        })
    }
}

/// Provider double that hands out `{base}/{order_id}` links and records requests.
#[derive(Default)]
pub struct RecordingInvoiceProvider {
    base_url: String,
    requests: Mutex<Vec<InvoiceRequest>>,
    failing: Mutex<bool>,
    delay: Option<Duration>,
}

impl RecordingInvoiceProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Every `create_invoice` sleeps for `delay` first.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().expect("invoice mutex poisoned") = failing;
    }

    pub fn requests(&self) -> Vec<InvoiceRequest> {
        self.requests.lock().expect("invoice mutex poisoned").clone()
    }
}

#[async_trait]
impl InvoiceProvider for RecordingInvoiceProvider {
    async fn create_invoice(&self, request: &InvoiceRequest) -> FunnelResult<Invoice> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if *self.failing.lock().expect("invoice mutex poisoned") {
            return Err(FunnelError::Transport("invoice provider set to fail".into()));
        }
        self.requests
            .lock()
            .expect("invoice mutex poisoned")
            .push(request.clone());
        Ok(Invoice {
            invoice_id: None,
            payment_url: format!("{}/{}", self.base_url, request.order_id),
        })
    }
}
