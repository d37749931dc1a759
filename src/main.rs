//! Koboloan backend server
//!
//! Wires the loan lifecycle engine together: configuration, database pool,
//! gateway client, orchestration services, the background sweeps, and a
//! thin HTTP surface for admin/webhook entry points.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tower_http::trace::TraceLayer;

use koboloan_server::collections::CollectionsService;
use koboloan_server::config::Config;
use koboloan_server::gateway::HttpGateway;
use koboloan_server::ledger::LedgerService;
use koboloan_server::notify::OutboxNotifier;
use koboloan_server::orchestrator::OrchestratorService;
use koboloan_server::reconciliation::ReconciliationService;
use koboloan_server::routes;
use koboloan_server::schedule::TokioScheduler;
use koboloan_server::state::AppState;
use koboloan_server::sweeps::{self, SweepContext};
use koboloan_server::{db, gateway::Gateway, notify::NotificationSink};

#[tokio::main]
async fn main() {
    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .with_target(true)
        .init();

    tracing::info!(environment = config.environment.as_str(), "Starting koboloan engine");

    // Database
    let db_pool = match db::create_pool(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = db::run_migrations(&db_pool).await {
        tracing::error!("Failed to run migrations: {}", e);
        std::process::exit(1);
    }

    // Gateway client
    let gateway: Arc<dyn Gateway> = match HttpGateway::new(
        config.gateway_base_url.clone(),
        config.gateway_client_id.clone(),
        config.gateway_client_secret.clone(),
        config.gateway_token_ttl_seconds,
    ) {
        Ok(g) => Arc::new(g),
        Err(e) => {
            tracing::error!("Failed to build gateway client: {}", e);
            std::process::exit(1);
        }
    };

    // Services
    let ledger = LedgerService::new(db_pool.clone());
    let notifier: Arc<dyn NotificationSink> = Arc::new(OutboxNotifier::new(db_pool.clone()));

    let reconciliation = Arc::new(ReconciliationService::new(
        ledger.clone(),
        gateway.clone(),
        notifier.clone(),
        config.policy.clone(),
    ));

    let scheduler = Arc::new(TokioScheduler::start(
        reconciliation.clone(),
        config.policy.reconcile_max_attempts,
    ));

    let orchestrator = Arc::new(OrchestratorService::new(
        ledger.clone(),
        gateway.clone(),
        notifier.clone(),
        scheduler,
        config.policy.clone(),
    ));

    let collections = Arc::new(CollectionsService::new(
        ledger.clone(),
        gateway.clone(),
        notifier.clone(),
        config.policy.clone(),
    ));

    // Background sweeps
    sweeps::spawn_all(
        SweepContext {
            ledger: ledger.clone(),
            orchestrator: orchestrator.clone(),
            reconciliation: reconciliation.clone(),
            collections,
        },
        config.sweep_interval,
    );

    // HTTP surface
    let app_state = AppState::new(orchestrator, reconciliation, db_pool);

    let app = routes::engine_routes()
        .with_state(app_state)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    tracing::info!("Server listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("Server error: {}", e);
    }

    tracing::info!("Server shutdown complete");
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
