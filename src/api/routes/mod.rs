//! Route handlers for the REST API
//!
//! Handlers are organized by domain:
//! - [`downloads`] — Dispatch, status, cancellation, retries, history
//! - [`system`] — Health, events, OpenAPI

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::types::{DocumentType, RunId};

mod downloads;
mod system;

// Re-export all handlers so `routes::function_name` continues to work
pub use downloads::*;
pub use system::*;

// ============================================================================
// Request/Response Types (shared across handlers)
// ============================================================================

/// Request body for POST /downloads/execute and POST /downloads/update
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct ExecuteRequest {
    /// Document type to fetch (default: nfse)
    #[serde(default)]
    pub doc_type: DocumentType,

    /// Companies to dispatch for; omitted means every active company
    #[serde(default)]
    pub company_ids: Option<Vec<i64>>,

    /// Competence period start (ISO date)
    pub periodo_inicio: NaiveDate,

    /// Competence period end (ISO date)
    pub periodo_fim: NaiveDate,
}

/// Response for dispatch and retry-all operations
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct DispatchResponse {
    /// Number of runs queued
    pub started: usize,

    /// IDs of the queued runs
    pub run_ids: Vec<RunId>,
}

/// Response for GET /downloads/status
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct StatusResponse {
    /// Runs in display order (executando, pendente, concluido, erro, cancelado)
    pub runs: Vec<crate::types::RunInfo>,

    /// Engine counters and pool state
    pub stats: crate::types::EngineStats,
}

/// Response for POST /downloads/cancel-all
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct CancelAllResponse {
    /// Number of runs cancelled by the sweep
    pub cancelled: usize,
}

/// Response for POST /downloads/{id}/retry
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct RetryResponse {
    /// The freshly queued run
    pub run_id: RunId,
}

/// Response for DELETE /downloads/history
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct ClearHistoryResponse {
    /// Number of terminal runs removed
    pub removed: u64,
}
