//! # fiscal-dl
//!
//! Download orchestration engine for Brazilian fiscal documents (NFSe
//! service invoices and CT-e transport waybills), built for accounting
//! firms that fetch documents for many client companies from the national
//! distribution API.
//!
//! ## Design Philosophy
//!
//! fiscal-dl is designed to be:
//! - **Resumable** - Per-company NSU cursors survive crashes and restarts;
//!   a retried run continues from the last committed page, never from zero
//! - **Bounded** - A fixed-size worker pool with staggered admissions keeps
//!   the engine inside the API's tolerance for a whole client portfolio
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding;
//!   the bundled REST API serves a polling front end
//! - **Observable** - Consumers subscribe to lifecycle events or poll the
//!   ordered status view
//!
//! ## Quick Start
//!
//! ```no_run
//! use fiscal_dl::{Config, DownloadEngine, DispatchRequest};
//! use fiscal_dl::types::{DocumentType, DispatchMode, Period, Trigger};
//! use chrono::NaiveDate;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let engine = DownloadEngine::new(config).await?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     // Fetch June 2025 NFSe for every active company
//!     let queued = engine
//!         .dispatch(DispatchRequest {
//!             companies: None,
//!             doc_type: DocumentType::Nfse,
//!             period: Period {
//!                 inicio: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
//!                 fim: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
//!             },
//!             trigger: Trigger::Manual,
//!             mode: DispatchMode::Full,
//!         })
//!         .await?;
//!     println!("queued {} runs", queued.len());
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// REST API module
pub mod api;
/// National fiscal API client boundary
pub mod client;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Core download engine (decomposed into focused submodules)
pub mod engine;
/// Error types
pub mod error;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use client::{FiscalClient, HttpFiscalClient};
pub use config::Config;
pub use db::Database;
pub use engine::{DispatchRequest, DownloadEngine};
pub use error::{
    ApiError, DatabaseError, Error, ErrorDetail, FetchError, Result, RunError, ToHttpStatus,
};
pub use types::{
    CompanyId, DispatchMode, DocumentType, EngineStats, Event, Period, RunId, RunInfo, RunStatus,
    Trigger,
};

/// Helper function to run the engine with graceful signal handling.
///
/// Waits for a termination signal and then calls the engine's `shutdown()`
/// method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use fiscal_dl::{Config, DownloadEngine, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let engine = DownloadEngine::new(config).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(engine).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(engine: DownloadEngine) -> Result<()> {
    wait_for_signal().await;
    engine.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
