//! Scheduler/dispatcher — run creation and the bounded worker pool.

use std::sync::Arc;
use std::time::Duration;

use crate::db::{Company, NewDownloadRun};
use crate::error::{Error, Result};
use crate::types::{
    CompanyId, DispatchMode, DocumentType, Event, Period, RunId, RunStatus, Trigger,
};

use super::DownloadEngine;
use super::worker::WorkerContext;

/// Interval between queue polling attempts when the queue is empty
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Parameters for a dispatch, shared by the execute and update operations
#[derive(Clone, Debug)]
pub struct DispatchRequest {
    /// Companies to fetch for; `None` dispatches every active company
    pub companies: Option<Vec<CompanyId>>,
    /// Document type to fetch
    pub doc_type: DocumentType,
    /// Competence period
    pub period: Period,
    /// What initiated the dispatch
    pub trigger: Trigger,
    /// Full fetch or cursor-forward only
    pub mode: DispatchMode,
}

impl DownloadEngine {
    /// Dispatch download runs for a set of companies.
    ///
    /// Creates one pendente run per company and enqueues it for the worker
    /// pool. Companies that already have an active run for the document type
    /// are skipped. Companies with an expired certificate are recorded as
    /// erro with `certificado_vencido` immediately, without consuming a
    /// worker slot.
    ///
    /// Returns the IDs of the runs that were queued.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<Vec<RunId>> {
        if !self
            .pool_state
            .accepting_new
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(Error::ShuttingDown);
        }

        let companies = self.resolve_companies(request.companies.as_deref()).await?;

        // A fresh external dispatch starts a new batch: auto-resume rounds
        // count from here
        self.resume_rounds.reset(request.doc_type);

        let queued = self
            .dispatch_companies(
                &companies,
                request.doc_type,
                request.period,
                request.trigger,
                request.mode,
            )
            .await?;

        tracing::info!(
            doc_type = %request.doc_type,
            companies = companies.len(),
            queued = queued.len(),
            delta_only = request.mode.is_delta_only(),
            "Dispatch complete"
        );

        Ok(queued)
    }

    /// Resolve an optional company-id list into company rows.
    ///
    /// With no list, every active company is selected. Unknown IDs are an
    /// error; the caller named a company that does not exist.
    async fn resolve_companies(&self, ids: Option<&[CompanyId]>) -> Result<Vec<Company>> {
        match ids {
            None => self.db.list_active_companies().await,
            Some(ids) => {
                let mut companies = Vec::with_capacity(ids.len());
                for &id in ids {
                    let company = self.db.get_company(id).await?.ok_or_else(|| {
                        Error::NotFound(format!("Company {} not found", id))
                    })?;
                    companies.push(company);
                }
                Ok(companies)
            }
        }
    }

    /// Create and enqueue runs for the given companies.
    ///
    /// Internal dispatch path shared by [`dispatch`](Self::dispatch), the
    /// retry operations and the resume coordinator; does not touch the
    /// resume round counters.
    pub(crate) async fn dispatch_companies(
        &self,
        companies: &[Company],
        doc_type: DocumentType,
        period: Period,
        trigger: Trigger,
        mode: DispatchMode,
    ) -> Result<Vec<RunId>> {
        let now = chrono::Utc::now();
        let mut queued = Vec::new();

        for company in companies {
            let company_id = company.company_id();

            // At most one pendente/executando run per (company, docType)
            if self.db.has_active_run(company_id, doc_type).await? {
                tracing::debug!(
                    company_id = %company_id,
                    doc_type = %doc_type,
                    "Company already has an active run, skipping"
                );
                continue;
            }

            let new_run = NewDownloadRun {
                company_id,
                doc_type,
                trigger,
                mode,
                period,
            };
            let id = self.db.insert_run(&new_run).await?;

            // Expired certificate: fail fast, no worker slot consumed
            if company.certificate_expired(now) {
                let erro = format!("certificado digital vencido para empresa {}", company_id);
                self.db
                    .finalize_run(id, RunStatus::Erro, Some(&erro), true)
                    .await?;
                self.emit_event(Event::RunFailed {
                    id,
                    error: erro.clone(),
                    certificado_vencido: true,
                });
                tracing::warn!(
                    run_id = id.0,
                    company_id = %company_id,
                    "Certificate expired, run recorded as erro without dispatch"
                );
                continue;
            }

            {
                let mut queue = self.pool_state.queue.lock().await;
                queue.push_back(id);
            }
            self.emit_event(Event::RunQueued {
                id,
                company_id,
                doc_type,
            });
            queued.push(id);
        }

        Ok(queued)
    }

    /// Start the queue processor task
    ///
    /// This method spawns a background task that continuously:
    /// 1. Takes the next run from the FIFO queue
    /// 2. Acquires a permit from the worker pool semaphore
    /// 3. Spawns a company worker for that run
    /// 4. Waits the inter-company stagger delay
    /// 5. Repeats until shutdown
    pub(crate) fn start_queue_processor(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.pool_state.queue.clone();
        let worker_slots = self.pool_state.worker_slots.clone();
        let active_runs = self.pool_state.active_runs.clone();
        let shutdown = self.pool_state.shutdown.clone();
        let db = self.db.clone();
        let event_tx = self.event_tx.clone();
        let client = self.client.clone();
        let config = self.config.clone();
        let stagger = self.config.pool.inter_company_delay;

        tokio::spawn(async move {
            loop {
                let next = {
                    let mut queue_guard = queue.lock().await;
                    queue_guard.pop_front()
                };

                let Some(run_id) = next else {
                    // Queue is empty, wait a bit before checking again
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(QUEUE_POLL_INTERVAL) => continue,
                    }
                };

                // Acquire a permit (blocks while the pool is full)
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => {
                        // Re-queue the run so it isn't lost; startup recovery
                        // or a later processor handles it
                        let mut queue_guard = queue.lock().await;
                        queue_guard.push_front(run_id);
                        break;
                    }
                    permit = worker_slots.clone().acquire_owned() => match permit {
                        Ok(p) => p,
                        Err(_) => break, // Semaphore closed
                    },
                };

                let cancel_token = tokio_util::sync::CancellationToken::new();
                {
                    let mut active = active_runs.lock().await;
                    active.insert(run_id, cancel_token.clone());
                }

                let ctx = WorkerContext {
                    run_id,
                    db: Arc::clone(&db),
                    client: Arc::clone(&client),
                    config: Arc::clone(&config),
                    event_tx: event_tx.clone(),
                    active_runs: Arc::clone(&active_runs),
                    cancel_token,
                };

                tokio::spawn(async move {
                    let _permit = permit;
                    super::worker::run_company_worker(ctx).await;
                });

                // Stagger consecutive admissions
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(stagger) => {}
                }
            }

            tracing::debug!("Queue processor stopped");
        })
    }
}
