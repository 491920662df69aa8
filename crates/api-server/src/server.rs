//! API server: HTTP webhooks and probes, metrics on a separate port.

use crate::rest::{self, AppState};
use crate::webhook;
use axum::routing::{get, post};
use axum::Router;
use funnel_core::config::ApiConfig;
use std::future::Future;
use std::net::SocketAddr;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Build the router. Exposed separately so tests can drive it in-process.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Webhooks
        .route("/webhook/channel", post(webhook::channel_webhook))
        .route("/webhook/payment", post(webhook::payment_webhook))
        // Operational endpoints
        .route("/", get(rest::root))
        .route("/health", get(rest::health_check))
        .route("/ready", get(rest::readiness))
        .route("/live", get(rest::liveness))
        // Middleware
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct ApiServer {
    config: ApiConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Serve HTTP until `shutdown` resolves, then drain in-flight requests.
    pub async fn start_http<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = router(self.state.clone());
        let addr = SocketAddr::new(self.config.host.parse()?, self.config.http_port);

        info!(addr = %addr, "Starting HTTP server");

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    /// Start the metrics server on a separate port.
    pub fn start_metrics(&self) -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(SocketAddr::new(
                self.config.host.parse()?,
                self.config.metrics_port,
            ))
            .install()?;

        info!(port = self.config.metrics_port, "Metrics exporter started");
        Ok(())
    }
}
