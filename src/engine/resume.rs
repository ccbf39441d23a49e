//! Retry/resume coordinator — automatic re-dispatch of failed runs.
//!
//! One single-flight loop per document type, started at engine construction
//! when auto-resume is enabled. Each tick re-dispatches the companies whose
//! latest run failed, as a new round. Rounds are anchored to the end of a
//! batch: a round starts only once the configured wait has passed since the
//! last run of the document type finalized, so a batch that settles just
//! before a tick is not retried early. Bounded mode stops after
//! `max_rounds`; infinite mode repeats until the error set drains, with
//! round starts spaced at least [`ResumeConfig::MIN_ROUND_GAP`] apart. A
//! round never starts while any run of the document type is still pendente
//! or executando.

use std::collections::HashSet;

use chrono::NaiveDate;

use crate::config::ResumeConfig;
use crate::error::Result;
use crate::types::{CompanyId, DocumentType, Event, Period, RunStatus, Trigger};

use super::DownloadEngine;

impl DownloadEngine {
    /// Spawn the auto-resume loop for one document type
    pub(crate) fn start_resume_coordinator(
        &self,
        doc_type: DocumentType,
    ) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let shutdown = self.pool_state.shutdown.clone();

        tokio::spawn(async move {
            let cfg = engine.config.resume_for(doc_type).clone();
            let wait = cfg.effective_wait();
            tracing::info!(
                doc_type = %doc_type,
                wait_secs = wait.as_secs(),
                infinite = cfg.infinite,
                max_rounds = cfg.max_rounds,
                "Resume coordinator started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                if let Err(e) = engine.run_resume_round(doc_type, &cfg).await {
                    tracing::error!(
                        doc_type = %doc_type,
                        error = %e,
                        "Resume round failed"
                    );
                }
            }

            tracing::debug!(doc_type = %doc_type, "Resume coordinator stopped");
        })
    }

    /// Attempt one resume round for a document type.
    ///
    /// No-op when a batch is still in flight, when the batch ended less
    /// than the configured wait ago, when there is nothing to retry, or
    /// when bounded mode has exhausted its rounds.
    pub(crate) async fn run_resume_round(
        &self,
        doc_type: DocumentType,
        cfg: &ResumeConfig,
    ) -> Result<()> {
        // Re-entrancy guard: wait for the batch to settle first
        if self.has_runs_in_flight(doc_type).await? {
            tracing::debug!(doc_type = %doc_type, "Batch still in flight, skipping resume round");
            return Ok(());
        }

        // Anchor the round to the end of the batch, not to the loop tick
        let wait_secs = cfg.wait.as_secs() as i64;
        if wait_secs > 0 {
            if let Some(batch_end) = self.db.latest_finalizado_em(doc_type).await? {
                let since = chrono::Utc::now().timestamp() - batch_end;
                if since < wait_secs {
                    tracing::debug!(
                        doc_type = %doc_type,
                        since_secs = since,
                        wait_secs,
                        "Batch ended recently, waiting out the round gap"
                    );
                    return Ok(());
                }
            }
        }

        let failed: Vec<_> = self
            .db
            .list_runs_by_status(RunStatus::Erro)
            .await?
            .into_iter()
            .filter(|run| run.document_type() == doc_type)
            .collect();

        if failed.is_empty() {
            // Error set drained; the next failure starts a fresh count
            self.resume_rounds.reset(doc_type);
            return Ok(());
        }

        if !cfg.infinite && self.resume_rounds.current(doc_type) >= cfg.max_rounds {
            tracing::debug!(
                doc_type = %doc_type,
                rounds = cfg.max_rounds,
                "Resume rounds exhausted, waiting for a fresh dispatch"
            );
            return Ok(());
        }

        let round = self.resume_rounds.next_round(doc_type);

        // One retry per company, from the most recent failure
        let mut seen: HashSet<CompanyId> = HashSet::new();
        let mut queued = 0usize;
        let mut targets = 0usize;

        for run in failed {
            let company_id = CompanyId::new(run.company_id);
            if !seen.insert(company_id) {
                continue;
            }
            targets += 1;

            let Some(company) = self.db.get_company(company_id).await? else {
                tracing::warn!(
                    company_id = %company_id,
                    "Failed run references a missing company, skipping resume"
                );
                continue;
            };

            let Some(period) = parse_period(&run.periodo_inicio, &run.periodo_fim) else {
                tracing::warn!(run_id = run.id, "Failed run has an unparseable period");
                continue;
            };

            let ids = self
                .dispatch_companies(
                    std::slice::from_ref(&company),
                    doc_type,
                    period,
                    Trigger::Agendado,
                    run.dispatch_mode(),
                )
                .await?;
            queued += ids.len();
        }

        self.emit_event(Event::ResumeRoundStarted {
            doc_type,
            round,
            companies: targets,
        });
        tracing::info!(
            doc_type = %doc_type,
            round,
            companies = targets,
            queued,
            "Resume round dispatched"
        );

        Ok(())
    }

    /// Whether any run of the document type is pendente or executando
    async fn has_runs_in_flight(&self, doc_type: DocumentType) -> Result<bool> {
        for status in [RunStatus::Pendente, RunStatus::Executando] {
            let in_flight = self
                .db
                .list_runs_by_status(status)
                .await?
                .into_iter()
                .any(|run| run.document_type() == doc_type);
            if in_flight {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn parse_period(inicio: &str, fim: &str) -> Option<Period> {
    Some(Period {
        inicio: NaiveDate::parse_from_str(inicio, "%Y-%m-%d").ok()?,
        fim: NaiveDate::parse_from_str(fim, "%Y-%m-%d").ok()?,
    })
}
