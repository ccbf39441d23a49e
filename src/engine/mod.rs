//! Core download engine split into focused submodules.
//!
//! The `DownloadEngine` struct and its methods are organized by domain:
//! - [`dispatcher`] - Run creation and the bounded worker pool
//! - [`worker`] - Per-company fetch execution (the run state machine)
//! - [`control`] - Cancellation, retries and history maintenance
//! - [`resume`] - Auto-resume rounds for failed runs
//! - [`lifecycle`] - Startup recovery and graceful shutdown

mod control;
mod dispatcher;
mod lifecycle;
mod resume;
mod worker;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use dispatcher::DispatchRequest;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::client::{FiscalClient, HttpFiscalClient};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{DocumentType, EngineStats, Event, RunId, RunStatus};

/// Queue and worker pool state
#[derive(Clone)]
pub(crate) struct PoolState {
    /// FIFO queue of pendente runs waiting for a worker slot
    pub(crate) queue: Arc<tokio::sync::Mutex<VecDeque<RunId>>>,
    /// Semaphore bounding concurrent company workers (max_concurrent_companies)
    pub(crate) worker_slots: Arc<tokio::sync::Semaphore>,
    /// Map of executando runs to their cancellation tokens
    pub(crate) active_runs:
        Arc<tokio::sync::Mutex<HashMap<RunId, tokio_util::sync::CancellationToken>>>,
    /// Whether new dispatches are accepted (set to false during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Token cancelled on shutdown; stops the queue processor and resume loops
    pub(crate) shutdown: tokio_util::sync::CancellationToken,
}

/// Per-document-type auto-resume round counters.
///
/// Reset to zero by a fresh external dispatch or when the error set drains,
/// so bounded mode counts rounds since the last user action.
#[derive(Clone)]
pub(crate) struct ResumeRounds {
    nfse: Arc<AtomicU32>,
    cte: Arc<AtomicU32>,
}

impl ResumeRounds {
    fn new() -> Self {
        Self {
            nfse: Arc::new(AtomicU32::new(0)),
            cte: Arc::new(AtomicU32::new(0)),
        }
    }

    fn counter(&self, doc_type: DocumentType) -> &AtomicU32 {
        match doc_type {
            DocumentType::Nfse => &self.nfse,
            DocumentType::Cte => &self.cte,
        }
    }

    pub(crate) fn reset(&self, doc_type: DocumentType) {
        self.counter(doc_type).store(0, Ordering::SeqCst);
    }

    pub(crate) fn next_round(&self, doc_type: DocumentType) -> u32 {
        self.counter(doc_type).fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn current(&self, doc_type: DocumentType) -> u32 {
        self.counter(doc_type).load(Ordering::SeqCst)
    }
}

/// Main download engine instance (cloneable - all fields are Arc-wrapped)
///
/// One engine instance serves one accounting firm: companies, runs, cursors
/// and documents in its database all belong to that firm.
#[derive(Clone)]
pub struct DownloadEngine {
    /// Database instance for persistence (wrapped in Arc for sharing across tasks)
    /// Public for integration tests to query run status
    pub db: Arc<Database>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Configuration snapshot (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// National fiscal API client (trait object for pluggable implementations)
    pub(crate) client: Arc<dyn FiscalClient>,
    /// Queue and worker pool state
    pub(crate) pool_state: PoolState,
    /// Auto-resume round counters
    pub(crate) resume_rounds: ResumeRounds,
}

impl DownloadEngine {
    /// Create a new DownloadEngine instance
    ///
    /// This initializes all core components:
    /// - Opens/creates the SQLite database and runs migrations
    /// - Finalizes runs interrupted by a previous process
    /// - Creates the HTTP client for the national API
    /// - Sets up the event broadcast channel
    pub async fn new(config: Config) -> Result<Self> {
        let client = Arc::new(HttpFiscalClient::new(&config.client)?);
        Self::with_client(config, client).await
    }

    /// Create a DownloadEngine with a custom [`FiscalClient`] implementation
    pub async fn with_client(config: Config, client: Arc<dyn FiscalClient>) -> Result<Self> {
        // Ensure the PDF directory exists
        tokio::fs::create_dir_all(&config.persistence.pdf_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create PDF directory '{}': {}",
                        config.persistence.pdf_dir.display(),
                        e
                    ),
                ))
            })?;

        // Initialize database
        let db = Database::new(&config.persistence.database_path).await?;

        // Runs left non-terminal by an unclean shutdown get an explicit
        // terminal status; their cursors keep the last committed page, so a
        // retry resumes instead of restarting.
        let interrupted = db.finalize_interrupted_runs().await?;
        if interrupted > 0 {
            tracing::warn!(
                interrupted,
                "Finalized runs interrupted by a previous shutdown as erro"
            );
        }

        // Create broadcast channel with buffer size of 1000 events
        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);

        let pool_state = PoolState {
            queue: Arc::new(tokio::sync::Mutex::new(VecDeque::new())),
            worker_slots: Arc::new(tokio::sync::Semaphore::new(
                config.pool.effective_pool_size(),
            )),
            active_runs: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            accepting_new: Arc::new(AtomicBool::new(true)),
            shutdown: tokio_util::sync::CancellationToken::new(),
        };

        let engine = Self {
            db: Arc::new(db),
            event_tx,
            config: Arc::new(config),
            client,
            pool_state,
            resume_rounds: ResumeRounds::new(),
        };

        // Start the queue processor and, where enabled, the per-document-type
        // resume coordinators
        engine.start_queue_processor();
        for doc_type in [DocumentType::Nfse, DocumentType::Cte] {
            if engine.config.resume_for(doc_type).auto_resume {
                engine.start_resume_coordinator(doc_type);
            }
        }

        Ok(engine)
    }

    /// Subscribe to engine events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events
    /// independently. Events are buffered, but if a subscriber falls behind by
    /// more than 1000 events, it will receive a `RecvError::Lagged` error.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Ordered run list for the polling UI.
    ///
    /// Executando first, then pendente, concluido (with new documents
    /// first), erro, cancelado; company names joined in.
    pub async fn download_status(&self) -> Result<Vec<crate::types::RunInfo>> {
        let runs = self.db.list_runs().await?;

        let mut names: HashMap<i64, String> = HashMap::new();
        let mut infos = Vec::with_capacity(runs.len());
        for run in runs {
            let name = match names.get(&run.company_id) {
                Some(name) => name.clone(),
                None => {
                    let name = self
                        .db
                        .get_company(crate::types::CompanyId::new(run.company_id))
                        .await?
                        .map(|c| c.nome)
                        .unwrap_or_else(|| format!("empresa {}", run.company_id));
                    names.insert(run.company_id, name.clone());
                    name
                }
            };
            infos.push(run.into_info(name));
        }

        Ok(infos)
    }

    /// Snapshot of run counts and pool state
    pub async fn stats(&self) -> Result<EngineStats> {
        let pendentes = self.db.count_runs_by_status(RunStatus::Pendente).await? as usize;
        let executando = self.db.count_runs_by_status(RunStatus::Executando).await? as usize;
        let concluidos = self.db.count_runs_by_status(RunStatus::Concluido).await? as usize;
        let erros = self.db.count_runs_by_status(RunStatus::Erro).await? as usize;
        let cancelados = self.db.count_runs_by_status(RunStatus::Cancelado).await? as usize;

        Ok(EngineStats {
            total: pendentes + executando + concluidos + erros + cancelados,
            pendentes,
            executando,
            concluidos,
            erros,
            cancelados,
            pool_size: self.config.pool.effective_pool_size(),
            accepting_new: self.pool_state.accepting_new.load(Ordering::SeqCst),
        })
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub(crate) fn emit_event(&self, event: Event) {
        // send() returns Err if there are no receivers, which is fine
        self.event_tx.send(event).ok();
    }

    /// Spawn the REST API server in a background task
    ///
    /// The server runs concurrently with run processing and listens on the
    /// configured bind address (default: 127.0.0.1:8990).
    pub fn spawn_api_server(self: &Arc<Self>) -> tokio::task::JoinHandle<Result<()>> {
        let engine = self.clone();
        let config = self.config.clone();

        tokio::spawn(async move { crate::api::start_api_server(engine, config).await })
    }
}
