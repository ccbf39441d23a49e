//! REST API server module
//!
//! Serves the polling UI contract: dispatch, status, cancellation, retries
//! and history, plus health, an SSE event stream and OpenAPI documentation.

use crate::{Config, DownloadEngine, Result};
use axum::{
    Router,
    routing::{delete, get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use utoipa_swagger_ui::SwaggerUi;

pub mod error_response;
pub mod openapi;
pub mod routes;
pub mod state;

pub use openapi::ApiDoc;
pub use state::AppState;

/// Create the API router with all route definitions
///
/// # Routes
///
/// ## Dispatch
/// - `POST /downloads/execute` - Full fetch for all (or listed) companies
/// - `POST /downloads/update` - Delta-only fetch (only new documents)
///
/// ## Monitoring
/// - `GET /downloads/status` - Ordered run list plus engine stats
///
/// ## Cancellation
/// - `POST /downloads/:id/cancel` - Cancel one run
/// - `POST /downloads/cancel-all` - Cancel everything in flight
///
/// ## Retries
/// - `POST /downloads/:id/retry` - Retry one failed run
/// - `POST /downloads/retry-all` - Retry every failed run
///
/// ## History
/// - `DELETE /downloads/history` - Remove terminal runs
///
/// ## System
/// - `GET /health` - Health check
/// - `GET /openapi.json` - OpenAPI specification
/// - `GET /swagger-ui` - Interactive Swagger UI documentation
/// - `GET /events` - Server-sent events stream
pub fn create_router(engine: Arc<DownloadEngine>, config: Arc<Config>) -> Router {
    let state = AppState::new(engine, config);

    let router = Router::new()
        // Dispatch
        .route("/downloads/execute", post(routes::execute_downloads))
        .route("/downloads/update", post(routes::update_downloads))
        // Monitoring
        .route("/downloads/status", get(routes::download_status))
        // Cancellation
        .route("/downloads/:id/cancel", post(routes::cancel_download))
        .route("/downloads/cancel-all", post(routes::cancel_all_downloads))
        // Retries
        .route("/downloads/:id/retry", post(routes::retry_download))
        .route("/downloads/retry-all", post(routes::retry_all_downloads))
        // History
        .route("/downloads/history", delete(routes::clear_history))
        // System
        .route("/health", get(routes::health_check))
        .route("/openapi.json", get(routes::openapi_spec))
        .route("/events", get(routes::event_stream));

    let router = Router::new()
        .nest("/api/v1", router)
        .merge(
            SwaggerUi::new("/swagger-ui")
                .config(utoipa_swagger_ui::Config::from("/api/v1/openapi.json")),
        )
        .with_state(state);

    // The UI polls from arbitrary local origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router.layer(cors)
}

/// Start the API server on the configured bind address.
///
/// Creates a TCP listener, binds it to the configured address, and serves
/// the API router until the server is shut down.
pub async fn start_api_server(engine: Arc<DownloadEngine>, config: Arc<Config>) -> Result<()> {
    let bind_address = config.api.bind_address;

    tracing::info!(
        address = %bind_address,
        "Starting API server"
    );

    let app = create_router(engine, config);

    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(crate::error::Error::Io)?;

    tracing::info!(
        address = %bind_address,
        "API server listening"
    );

    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::Error::ApiServerError(e.to_string()))?;

    tracing::info!("API server stopped");
    Ok(())
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
