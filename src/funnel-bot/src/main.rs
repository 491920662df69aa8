//! Funnel bot: webhook-driven sales funnel with idle remarketing and
//! payment reconciliation.
//!
//! Main entry point: validates configuration, wires the subsystems, then
//! serves webhooks until SIGINT/SIGTERM.

use clap::Parser;
use funnel_api::{ApiServer, AppState};
use funnel_billing::{NowPaymentsProvider, OrderLedger, PaymentReconciler, SignatureVerifier};
use funnel_channels::{Dispatcher, TelegramNotifier};
use funnel_core::config::AppConfig;
use funnel_core::event_bus::{EventSink, TracingSink};
use funnel_journey::{FunnelContent, FunnelMachine, LeadTracker, RemarketingScheduler, SchedulerHandle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "funnel-bot")]
#[command(about = "Webhook-driven conversational sales funnel")]
#[command(version)]
struct Cli {
    /// Optional configuration file (TOML/YAML/JSON); environment still wins
    #[arg(long, env = "FUNNEL_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP port (overrides config)
    #[arg(long, env = "FUNNEL__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Remarketing sweep period in seconds (overrides config)
    #[arg(long, env = "FUNNEL__REMARKETING__SWEEP_INTERVAL_SECS")]
    sweep_interval_secs: Option<u64>,

    /// Do not register the chat webhook at startup
    #[arg(long, default_value_t = false)]
    skip_webhook_registration: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Funnel bot starting up");

    let mut config = AppConfig::load(cli.config.as_deref())?;

    // Apply CLI overrides
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(secs) = cli.sweep_interval_secs {
        config.remarketing.sweep_interval_secs = secs;
    }
    if cli.skip_webhook_registration {
        config.channel.register_webhook = false;
    }

    // Missing mandatory configuration is the only fatal error.
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration; refusing to start");
        return Err(e.into());
    }

    info!(
        http_port = config.api.http_port,
        metrics_port = config.api.metrics_port,
        products = config.catalog.len(),
        payments = config.payment.is_configured(),
        signed_notifications = config.payment.ipn_secret.is_some(),
        "Configuration loaded"
    );

    let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
    let catalog = Arc::new(config.catalog());
    let content = FunnelContent::new(config.channel.media_ref.clone());

    let notifier = Arc::new(TelegramNotifier::new(&config.channel)?);
    let dispatcher = Dispatcher::new(notifier.clone()).with_event_sink(sink.clone());
    let leads = LeadTracker::default();
    let ledger = OrderLedger::default().with_event_sink(sink.clone());

    let mut machine = FunnelMachine::new(leads.clone(), ledger.clone(), catalog.clone(), content.clone())
        .with_event_sink(sink.clone());
    if let Some(provider) = NowPaymentsProvider::from_config(&config.payment)? {
        machine = machine.with_payments(Arc::new(provider), config.payment_callback_url());
    }

    let mut reconciler = PaymentReconciler::new(
        ledger.clone(),
        dispatcher.clone(),
        catalog,
        config.access_link.clone(),
    )
    .with_event_sink(sink.clone());
    match config.payment.ipn_secret.as_deref().filter(|s| !s.is_empty()) {
        Some(secret) => {
            reconciler = reconciler.with_verifier(SignatureVerifier::new(
                secret,
                config.payment.signature_algorithm,
            ));
        }
        None => warn!("No payment secret configured; notifications are accepted unsigned"),
    }

    let scheduler = Arc::new(
        RemarketingScheduler::new(leads, dispatcher.clone(), content, &config.remarketing)
            .with_order_expiry(ledger, config.payment.order_ttl_secs)
            .with_event_sink(sink),
    );

    if config.channel.register_webhook {
        if let Err(e) = notifier.register_webhook(&config.channel_webhook_url()).await {
            error!(error = %e, "Failed to register channel webhook");
        }
    }

    let state = AppState::new(
        Arc::new(machine),
        dispatcher,
        Arc::new(reconciler),
        config.payment.signature_header.clone(),
    );
    let api_server = ApiServer::new(config.api.clone(), state);

    // Start metrics exporter
    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    let scheduler_handle = SchedulerHandle::start(scheduler);

    info!("Funnel bot is ready to serve traffic");

    // Serve until a shutdown signal, then stop the sweep.
    let served = api_server.start_http(shutdown_signal()).await;
    scheduler_handle.stop().await;

    info!("Funnel bot stopped");
    served
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
