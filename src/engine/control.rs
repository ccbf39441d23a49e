//! Run lifecycle control — cancellation, retries and history maintenance.

use chrono::NaiveDate;

use crate::db::DownloadRun;
use crate::error::{Error, Result, RunError};
use crate::types::{CompanyId, DocumentType, Event, Period, RunId, RunStatus, Trigger};

use super::DownloadEngine;

impl DownloadEngine {
    /// Cancel a single run.
    ///
    /// A pendente run is finalized as cancelado immediately; its queue entry
    /// becomes a no-op when the processor reaches it. An executando run has
    /// its cancellation token fired and is finalized by its own worker at
    /// the next page/document boundary. Cancelling a run that is already
    /// terminal is a no-op.
    pub async fn cancel(&self, id: RunId) -> Result<()> {
        let run = self
            .db
            .get_run(id)
            .await?
            .ok_or(Error::Run(RunError::NotFound { id }))?;

        if run.run_status().is_terminal() {
            // Already finished, nothing to do
            return Ok(());
        }

        if run.run_status() == RunStatus::Pendente
            && self
                .db
                .finalize_run(id, RunStatus::Cancelado, None, false)
                .await?
        {
            self.emit_event(Event::RunCancelled { id });
            tracing::info!(run_id = id.0, "Cancelled queued run");
            return Ok(());
        }

        // Executando (or promoted to it since the read above): signal the
        // worker; it observes the token between units of work and finalizes
        // cancelado itself
        let active = self.pool_state.active_runs.lock().await;
        if let Some(token) = active.get(&id) {
            token.cancel();
            tracing::info!(run_id = id.0, "Signalled cancellation to running worker");
        } else {
            tracing::debug!(
                run_id = id.0,
                "Run executando but no active worker token; worker is finalizing"
            );
        }
        Ok(())
    }

    /// Cancel every pendente and executando run in one sweep.
    ///
    /// Idempotent: a second call finds nothing to cancel.
    pub async fn cancel_all(&self) -> Result<usize> {
        let mut cancelled = 0;

        // Purge the pending queue first so nothing gets admitted mid-sweep
        {
            let mut queue = self.pool_state.queue.lock().await;
            queue.clear();
        }

        for run in self.db.list_runs_by_status(RunStatus::Pendente).await? {
            let id = run.run_id();
            // A worker may have claimed the run since the listing; its
            // token is signalled below in that case
            if self
                .db
                .finalize_run(id, RunStatus::Cancelado, None, false)
                .await?
            {
                self.emit_event(Event::RunCancelled { id });
                cancelled += 1;
            }
        }

        // Signal every active worker
        {
            let active = self.pool_state.active_runs.lock().await;
            for (id, token) in active.iter() {
                tracing::debug!(run_id = id.0, "Signalling cancellation");
                token.cancel();
                cancelled += 1;
            }
        }

        tracing::info!(cancelled, "Cancel-all sweep complete");
        Ok(cancelled)
    }

    /// Re-dispatch a single failed run.
    ///
    /// Only runs in the erro state can be retried; the new run resumes from
    /// the persisted NSU cursor, so already committed pages are not
    /// refetched.
    pub async fn retry_one(&self, id: RunId) -> Result<RunId> {
        let run = self
            .db
            .get_run(id)
            .await?
            .ok_or(Error::Run(RunError::NotFound { id }))?;

        let status = run.run_status();
        if status != RunStatus::Erro {
            return Err(Error::Run(RunError::InvalidState {
                id,
                operation: "retry".to_string(),
                current_state: format!("{:?}", status),
            }));
        }

        let company_id = CompanyId::new(run.company_id);
        let doc_type = run.document_type();
        if self.db.has_active_run(company_id, doc_type).await? {
            return Err(Error::Run(RunError::AlreadyActive {
                company_id,
                doc_type,
            }));
        }

        let company = self
            .db
            .get_company(company_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Company {} not found", company_id)))?;

        let period = run_period(&run)?;
        let queued = self
            .dispatch_companies(
                std::slice::from_ref(&company),
                doc_type,
                period,
                Trigger::Manual,
                run.dispatch_mode(),
            )
            .await?;

        queued
            .into_iter()
            .next()
            .ok_or(Error::Run(RunError::AlreadyActive {
                company_id,
                doc_type,
            }))
    }

    /// Re-dispatch every company with a failed run.
    ///
    /// Companies that meanwhile acquired an active run are skipped, as are
    /// duplicate erro rows for the same (company, document type): only the
    /// most recent failure per pair is re-dispatched.
    pub async fn retry_all(&self) -> Result<Vec<RunId>> {
        let failed = self.db.list_runs_by_status(RunStatus::Erro).await?;

        let mut queued = Vec::new();
        let mut seen: std::collections::HashSet<(CompanyId, DocumentType)> =
            std::collections::HashSet::new();

        for run in failed {
            let company_id = CompanyId::new(run.company_id);
            let doc_type = run.document_type();
            if !seen.insert((company_id, doc_type)) {
                continue;
            }

            let Some(company) = self.db.get_company(company_id).await? else {
                tracing::warn!(
                    company_id = %company_id,
                    "Failed run references a missing company, skipping retry"
                );
                continue;
            };

            let period = run_period(&run)?;
            let ids = self
                .dispatch_companies(
                    std::slice::from_ref(&company),
                    doc_type,
                    period,
                    Trigger::Manual,
                    run.dispatch_mode(),
                )
                .await?;
            queued.extend(ids);
        }

        // A manual retry is a fresh batch for resume-round accounting
        self.resume_rounds.reset(DocumentType::Nfse);
        self.resume_rounds.reset(DocumentType::Cte);

        tracing::info!(queued = queued.len(), "Retry-all dispatched");
        Ok(queued)
    }

    /// Delete all terminal runs from the tracker.
    ///
    /// Active runs, stored documents and cursors are untouched.
    pub async fn clear_history(&self) -> Result<u64> {
        let removed = self.db.clear_finished_runs().await?;
        tracing::info!(removed, "Cleared finished runs from history");
        Ok(removed)
    }
}

fn run_period(run: &DownloadRun) -> Result<Period> {
    let inicio = NaiveDate::parse_from_str(&run.periodo_inicio, "%Y-%m-%d")
        .map_err(|e| Error::Other(format!("invalid period on run {}: {}", run.id, e)))?;
    let fim = NaiveDate::parse_from_str(&run.periodo_fim, "%Y-%m-%d")
        .map_err(|e| Error::Other(format!("invalid period on run {}: {}", run.id, e)))?;
    Ok(Period { inicio, fim })
}
