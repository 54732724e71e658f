//! Broker HTTP Server

use std::sync::Arc;

use axum::{Router, routing::get};
use sigbroker::{BrokerContext, Dispatcher, SigningBackend};

use crate::{
    config::ServiceConfig,
    error::ServiceError,
    handlers::{self, AppState},
    remote_signer::RemoteSigningBackend,
};

/// Create and configure the Axum router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))
        // Signature protocol
        .route("/fireService", get(handlers::fire_get).post(handlers::fire_post))
        .route(
            "/chooseOrigin",
            get(handlers::choose_origin_get).post(handlers::choose_origin_post),
        )
        // Temporary document retrieval
        .route("/retrieveService", get(handlers::retrieve_get).post(handlers::retrieve_post))
        .with_state(state)
}

/// Builds a dispatcher whose broker context is created on first use.
///
/// # Errors
///
/// Returns [`ServiceError::Client`] if the signing gateway client cannot be built.
pub fn dispatcher(config: &ServiceConfig) -> Result<Dispatcher, ServiceError> {
    let signer: Arc<dyn SigningBackend> = Arc::new(RemoteSigningBackend::new(&config.signer)?);
    let broker = config.broker.clone();
    Ok(Dispatcher::lazy(move || {
        let config = broker.clone();
        let signer = Arc::clone(&signer);
        async move {
            tracing::info!(ha = config.is_ha(), "initializing broker context");
            BrokerContext::builder().config(config).signer(signer).build().await
        }
    }))
}

/// Run the HTTP server until SIGTERM or Ctrl+C.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or serving fails.
pub async fn run(config: ServiceConfig) -> Result<(), ServiceError> {
    let state = Arc::new(AppState { dispatcher: dispatcher(&config)? });
    let app = create_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    tracing::info!(addr = %config.listen, signer = %config.signer.url, "broker listening");

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    if let Some(context) = state.dispatcher.loaded_context() {
        tracing::info!(grace = ?config.shutdown_grace, "draining background work");
        context.shutdown(config.shutdown_grace).await;
    }
    tracing::info!("broker stopped");
    Ok(())
}

/// Wait for SIGTERM or SIGINT signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C signal"),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                tracing::info!("Received SIGTERM signal");
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
