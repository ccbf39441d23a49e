//! Download dispatch and control handlers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

use super::{
    CancelAllResponse, ClearHistoryResponse, DispatchResponse, ExecuteRequest, RetryResponse,
    StatusResponse,
};
use crate::api::AppState;
use crate::engine::DispatchRequest;
use crate::error::Error;
use crate::types::{CompanyId, DispatchMode, Period, RunId, Trigger};

fn dispatch_request(body: ExecuteRequest, mode: DispatchMode) -> DispatchRequest {
    DispatchRequest {
        companies: body
            .company_ids
            .map(|ids| ids.into_iter().map(CompanyId::new).collect()),
        doc_type: body.doc_type,
        period: Period {
            inicio: body.periodo_inicio,
            fim: body.periodo_fim,
        },
        trigger: Trigger::Manual,
        mode,
    }
}

/// POST /downloads/execute - Dispatch a full fetch for companies
#[utoipa::path(
    post,
    path = "/api/v1/downloads/execute",
    tag = "downloads",
    request_body = ExecuteRequest,
    responses(
        (status = 202, description = "Runs queued", body = DispatchResponse),
        (status = 404, description = "A requested company does not exist"),
        (status = 503, description = "Engine is shutting down"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn execute_downloads(
    State(state): State<AppState>,
    Json(body): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<DispatchResponse>), Error> {
    let run_ids = state
        .engine
        .dispatch(dispatch_request(body, DispatchMode::Full))
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DispatchResponse {
            started: run_ids.len(),
            run_ids,
        }),
    ))
}

/// POST /downloads/update - Dispatch a delta-only fetch (only new documents)
#[utoipa::path(
    post,
    path = "/api/v1/downloads/update",
    tag = "downloads",
    request_body = ExecuteRequest,
    responses(
        (status = 202, description = "Runs queued", body = DispatchResponse),
        (status = 404, description = "A requested company does not exist"),
        (status = 503, description = "Engine is shutting down"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn update_downloads(
    State(state): State<AppState>,
    Json(body): Json<ExecuteRequest>,
) -> Result<(StatusCode, Json<DispatchResponse>), Error> {
    let run_ids = state
        .engine
        .dispatch(dispatch_request(body, DispatchMode::DeltaOnly))
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DispatchResponse {
            started: run_ids.len(),
            run_ids,
        }),
    ))
}

/// GET /downloads/status - Ordered run list plus engine counters
#[utoipa::path(
    get,
    path = "/api/v1/downloads/status",
    tag = "downloads",
    responses(
        (status = 200, description = "Runs in display order with engine stats", body = StatusResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn download_status(
    State(state): State<AppState>,
) -> Result<Json<StatusResponse>, Error> {
    let runs = state.engine.download_status().await?;
    let stats = state.engine.stats().await?;

    Ok(Json(StatusResponse { runs, stats }))
}

/// POST /downloads/:id/cancel - Cancel one run
#[utoipa::path(
    post,
    path = "/api/v1/downloads/{id}/cancel",
    tag = "downloads",
    params(
        ("id" = i64, Path, description = "Run ID")
    ),
    responses(
        (status = 204, description = "Run cancelled (or already terminal)"),
        (status = 404, description = "Run not found"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn cancel_download(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, Error> {
    state.engine.cancel(RunId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /downloads/cancel-all - Cancel every pendente and executando run
#[utoipa::path(
    post,
    path = "/api/v1/downloads/cancel-all",
    tag = "downloads",
    responses(
        (status = 200, description = "Sweep finished", body = CancelAllResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn cancel_all_downloads(
    State(state): State<AppState>,
) -> Result<Json<CancelAllResponse>, Error> {
    let cancelled = state.engine.cancel_all().await?;
    Ok(Json(CancelAllResponse { cancelled }))
}

/// POST /downloads/:id/retry - Retry one failed run
#[utoipa::path(
    post,
    path = "/api/v1/downloads/{id}/retry",
    tag = "downloads",
    params(
        ("id" = i64, Path, description = "Run ID (must have status erro)")
    ),
    responses(
        (status = 202, description = "New run queued", body = RetryResponse),
        (status = 404, description = "Run not found"),
        (status = 409, description = "Run is not in erro, or the company is already active"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn retry_download(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<(StatusCode, Json<RetryResponse>), Error> {
    let run_id = state.engine.retry_one(RunId::new(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(RetryResponse { run_id })))
}

/// POST /downloads/retry-all - Retry every failed run, one per company
#[utoipa::path(
    post,
    path = "/api/v1/downloads/retry-all",
    tag = "downloads",
    responses(
        (status = 202, description = "Retries queued", body = DispatchResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn retry_all_downloads(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<DispatchResponse>), Error> {
    let run_ids = state.engine.retry_all().await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(DispatchResponse {
            started: run_ids.len(),
            run_ids,
        }),
    ))
}

/// DELETE /downloads/history - Remove terminal runs
#[utoipa::path(
    delete,
    path = "/api/v1/downloads/history",
    tag = "downloads",
    responses(
        (status = 200, description = "History cleared", body = ClearHistoryResponse),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn clear_history(
    State(state): State<AppState>,
) -> Result<Json<ClearHistoryResponse>, Error> {
    let removed = state.engine.clear_history().await?;
    Ok(Json(ClearHistoryResponse { removed }))
}
