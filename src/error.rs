//! Error types for fiscal-dl
//!
//! This module provides the error taxonomy for the engine:
//! - `FetchError` — failures talking to the national fiscal API, classified
//!   so the retry machinery can tell terminal failures (expired certificate)
//!   from retryable ones (network, rate limit, malformed response)
//! - `RunError` — lifecycle violations (unknown run, invalid state)
//! - `DatabaseError` — persistence failures
//! - `Error` — top-level type nesting the above

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use crate::types::{CompanyId, RunId};

/// Result type alias for fiscal-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for fiscal-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The settings key that caused the error (e.g., "max_concurrent_companies")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Failure talking to the national fiscal API
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Run lifecycle error
    #[error("run error: {0}")]
    Run(#[from] RunError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Entity not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new dispatches
    #[error("shutdown in progress: not accepting new dispatches")]
    ShuttingDown,

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Constraint violation (e.g., duplicate key)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

/// Failures talking to the national fiscal API
///
/// The variants map onto the retry policy: `CertificateExpired` is terminal
/// and flagged distinctly on the run; `Timeout`, `RateLimited`, `Api` and
/// `MalformedResponse` are retryable by the resume coordinator.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The company's digital certificate is expired — terminal, never retried
    #[error("certificado digital vencido para empresa {company_id}")]
    CertificateExpired {
        /// The company whose certificate is expired
        company_id: CompanyId,
    },

    /// Authentication with the certificate was rejected
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Request exceeded its deadline
    #[error("request timed out after {elapsed_secs}s")]
    Timeout {
        /// Seconds elapsed when the deadline fired
        elapsed_secs: u64,
    },

    /// The API returned an error response
    #[error("API error (status {status}): {message}")]
    Api {
        /// HTTP-ish status code reported by the API
        status: u16,
        /// Error message from the response body
        message: String,
    },

    /// The API is rate limiting us
    #[error("rate limited by the fiscal API")]
    RateLimited,

    /// The response could not be parsed
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// A document's PDF could not be fetched
    #[error("PDF unavailable for document {chave_acesso}")]
    PdfUnavailable {
        /// Access key of the document whose PDF failed
        chave_acesso: String,
    },
}

impl FetchError {
    /// Whether this failure should flag the run with certificado_vencido
    pub fn is_certificate_expired(&self) -> bool {
        matches!(self, FetchError::CertificateExpired { .. })
    }
}

/// Run lifecycle errors
#[derive(Debug, Error)]
pub enum RunError {
    /// Run not found in the tracker
    #[error("run {id} not found")]
    NotFound {
        /// The run ID that was not found
        id: RunId,
    },

    /// Cannot perform operation in current state
    #[error("cannot {operation} run {id} in state {current_state}")]
    InvalidState {
        /// The run ID that is in an invalid state for the operation
        id: RunId,
        /// The operation that was attempted (e.g., "cancel", "retry")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// A run for this (company, document type) is already active
    #[error("company {company_id} already has an active {doc_type} run")]
    AlreadyActive {
        /// The company with an active run
        company_id: CompanyId,
        /// Document type of the active run
        doc_type: crate::types::DocumentType,
    },
}

/// Standard error response body returned by the REST API
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "not_found", "invalid_state")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context (run id, company id, current state)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create an API error with additional details
    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }
}

/// Maps domain errors to HTTP status codes and machine-readable codes
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request - invalid input
            Error::Config { .. } => 400,
            Error::Other(_) => 400,

            // 404 Not Found
            Error::NotFound(_) => 404,
            Error::Run(RunError::NotFound { .. }) => 404,
            Error::Database(DatabaseError::NotFound(_)) => 404,

            // 409 Conflict - the run is not in a state accepting the operation
            Error::Run(RunError::InvalidState { .. }) => 409,
            Error::Run(RunError::AlreadyActive { .. }) => 409,
            Error::Database(DatabaseError::ConstraintViolation(_)) => 409,

            // 500 Internal Server Error
            Error::Database(_) => 500,
            Error::Sqlx(_) => 500,
            Error::Io(_) => 500,
            Error::Serialization(_) => 500,
            Error::ApiServerError(_) => 500,

            // 502 Bad Gateway - the national API misbehaved
            Error::Fetch(_) => 502,
            Error::Network(_) => 502,

            // 503 Service Unavailable
            Error::ShuttingDown => 503,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(_) => "database_error",
            Error::Sqlx(_) => "database_error",
            Error::Fetch(e) => match e {
                FetchError::CertificateExpired { .. } => "certificate_expired",
                FetchError::Authentication(_) => "authentication_failed",
                FetchError::Timeout { .. } => "fetch_timeout",
                FetchError::Api { .. } => "api_error",
                FetchError::RateLimited => "rate_limited",
                FetchError::MalformedResponse(_) => "malformed_response",
                FetchError::PdfUnavailable { .. } => "pdf_unavailable",
            },
            Error::Run(e) => match e {
                RunError::NotFound { .. } => "run_not_found",
                RunError::InvalidState { .. } => "invalid_state",
                RunError::AlreadyActive { .. } => "already_active",
            },
            Error::Io(_) => "io_error",
            Error::NotFound(_) => "not_found",
            Error::ShuttingDown => "shutting_down",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::ApiServerError(_) => "api_server_error",
            Error::Other(_) => "invalid_request",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let details = match &error {
            Error::Run(RunError::NotFound { id }) => Some(serde_json::json!({
                "run_id": id,
            })),
            Error::Run(RunError::InvalidState {
                id,
                operation,
                current_state,
            }) => Some(serde_json::json!({
                "run_id": id,
                "operation": operation,
                "current_state": current_state,
            })),
            Error::Run(RunError::AlreadyActive {
                company_id,
                doc_type,
            }) => Some(serde_json::json!({
                "company_id": company_id,
                "doc_type": doc_type,
            })),
            Error::Config { key, .. } => key
                .as_ref()
                .map(|k| serde_json::json!({ "key": k })),
            _ => None,
        };

        match details {
            Some(details) => ApiError::with_details(code, message, details),
            None => ApiError::new(code, message),
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentType;

    #[test]
    fn certificate_expired_is_flagged_distinctly() {
        let err = FetchError::CertificateExpired {
            company_id: CompanyId(7),
        };
        assert!(err.is_certificate_expired());
        assert!(
            err.to_string().contains("vencido"),
            "UI surfaces the certificate message verbatim"
        );

        let other = FetchError::RateLimited;
        assert!(!other.is_certificate_expired());
    }

    #[test]
    fn run_error_messages_include_context() {
        let err = RunError::InvalidState {
            id: RunId(3),
            operation: "retry".to_string(),
            current_state: "Concluido".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("retry"));
        assert!(msg.contains("Concluido"));

        let err = RunError::AlreadyActive {
            company_id: CompanyId(1),
            doc_type: DocumentType::Nfse,
        };
        assert!(err.to_string().contains("nfse"));
    }

    #[test]
    fn fetch_error_nests_into_top_level_error() {
        let err: Error = FetchError::RateLimited.into();
        assert!(matches!(err, Error::Fetch(FetchError::RateLimited)));
    }

    #[test]
    fn run_errors_map_to_client_status_codes() {
        let err = Error::Run(RunError::NotFound { id: RunId(42) });
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.error_code(), "run_not_found");

        let err = Error::Run(RunError::InvalidState {
            id: RunId(42),
            operation: "retry".to_string(),
            current_state: "concluido".to_string(),
        });
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.error_code(), "invalid_state");

        assert_eq!(Error::ShuttingDown.status_code(), 503);
    }

    #[test]
    fn api_error_carries_run_details() {
        let err = Error::Run(RunError::NotFound { id: RunId(42) });
        let api_error: ApiError = err.into();

        assert_eq!(api_error.error.code, "run_not_found");
        assert!(api_error.error.message.contains("42"));
        let details = api_error.error.details.unwrap();
        assert_eq!(details["run_id"], 42);
    }
}
