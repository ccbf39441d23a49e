//! OpenAPI documentation and schema generation
//!
//! Defines the OpenAPI specification for the fiscal-dl REST API using
//! utoipa for compile-time spec generation.

use utoipa::OpenApi;

/// OpenAPI documentation for the fiscal-dl REST API
///
/// The spec can be accessed via:
/// - `/api/v1/openapi.json` - JSON format OpenAPI specification
/// - `/swagger-ui` - Interactive Swagger UI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "fiscal-dl REST API",
        version = "0.1.0",
        description = "REST API for orchestrating NFSe and CT-e downloads from the national fiscal API",
        license(
            name = "MIT OR Apache-2.0"
        )
    ),
    servers(
        (url = "http://localhost:8990/api/v1", description = "Local development server")
    ),
    paths(
        // Dispatch
        crate::api::routes::execute_downloads,
        crate::api::routes::update_downloads,

        // Monitoring
        crate::api::routes::download_status,

        // Cancellation
        crate::api::routes::cancel_download,
        crate::api::routes::cancel_all_downloads,

        // Retries
        crate::api::routes::retry_download,
        crate::api::routes::retry_all_downloads,

        // History
        crate::api::routes::clear_history,

        // System
        crate::api::routes::health_check,
        crate::api::routes::openapi_spec,
        crate::api::routes::event_stream,
    ),
    components(schemas(
        // Core types from types.rs
        crate::types::RunId,
        crate::types::CompanyId,
        crate::types::RunStatus,
        crate::types::DocumentType,
        crate::types::Trigger,
        crate::types::Direction,
        crate::types::DispatchMode,
        crate::types::Period,
        crate::types::RunInfo,
        crate::types::EngineStats,

        // Request/response envelopes
        crate::api::routes::ExecuteRequest,
        crate::api::routes::DispatchResponse,
        crate::api::routes::StatusResponse,
        crate::api::routes::CancelAllResponse,
        crate::api::routes::RetryResponse,
        crate::api::routes::ClearHistoryResponse,

        // Error envelope
        crate::error::ApiError,
        crate::error::ErrorDetail,
    )),
    tags(
        (name = "downloads", description = "Dispatch, status, cancellation, retries and history"),
        (name = "system", description = "Health, events and API documentation")
    )
)]
pub struct ApiDoc;
