//! Company worker — executes one download run end to end.
//!
//! State machine: pendente → executando → {concluido | erro | cancelado}.
//! The worker authenticates with the company's certificate, pages through
//! the distribution API from the persisted cursor forward, upserts each
//! document, optionally fetches PDFs, and commits the cursor and progress
//! counters after every fully stored page. Cancellation is cooperative and
//! observed only between units of work, so the cursor and the document set
//! always reflect whole committed pages.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;

use crate::client::{DocumentPage, FiscalClient, PageRequest, Session};
use crate::db::{Database, DownloadRun, NewDocument};
use crate::retry::fetch_with_retry;
use crate::types::{CompanyId, Event, Period, RunId, RunStatus};

/// Shared context for a single company worker, reducing parameter passing
pub(crate) struct WorkerContext {
    pub(crate) run_id: RunId,
    pub(crate) db: Arc<Database>,
    pub(crate) client: Arc<dyn FiscalClient>,
    pub(crate) config: Arc<crate::config::Config>,
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    pub(crate) active_runs:
        Arc<tokio::sync::Mutex<HashMap<RunId, tokio_util::sync::CancellationToken>>>,
    pub(crate) cancel_token: tokio_util::sync::CancellationToken,
}

/// How a run ended
enum RunOutcome {
    Completed,
    Cancelled,
    Failed {
        erro: String,
        certificado_vencido: bool,
    },
}

/// Mutable per-run accounting carried through the page loop
struct RunProgress {
    total_docs: i64,
    docs_novos: i64,
    ultimo_nsu: i64,
}

impl WorkerContext {
    async fn remove_from_active(&self) {
        let mut active = self.active_runs.lock().await;
        active.remove(&self.run_id);
    }

    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    async fn set_etapa(&self, etapa: &str) {
        if let Err(e) = self.db.set_etapa(self.run_id, etapa).await {
            tracing::warn!(run_id = self.run_id.0, error = %e, "Failed to update etapa");
        }
    }
}

/// Run a single company worker to completion.
///
/// Spawned by the queue processor with a pool permit held for the duration.
pub(crate) async fn run_company_worker(ctx: WorkerContext) {
    let id = ctx.run_id;

    // Claim the run. Fails if it was cancelled while queued; the queue entry
    // is then a no-op and the worker slot is released immediately.
    let claimed = match ctx.db.mark_executando(id).await {
        Ok(claimed) => claimed,
        Err(e) => {
            tracing::error!(run_id = id.0, error = %e, "Failed to claim run");
            ctx.remove_from_active().await;
            return;
        }
    };
    if !claimed {
        tracing::debug!(run_id = id.0, "Run no longer pendente, skipping");
        ctx.remove_from_active().await;
        return;
    }

    let run = match ctx.db.get_run(id).await {
        Ok(Some(run)) => run,
        Ok(None) => {
            tracing::error!(run_id = id.0, "Run row disappeared after claim");
            ctx.remove_from_active().await;
            return;
        }
        Err(e) => {
            tracing::error!(run_id = id.0, error = %e, "Failed to load run");
            ctx.remove_from_active().await;
            return;
        }
    };

    ctx.emit(Event::RunStarted { id });
    tracing::info!(
        run_id = id.0,
        company_id = run.company_id,
        doc_type = %run.document_type(),
        "Run started"
    );

    let outcome = execute_run(&ctx, &run).await;
    finalize(&ctx, &run, outcome).await;
    ctx.remove_from_active().await;
}

/// The fetch loop: authenticate, page through the feed, commit pages.
async fn execute_run(ctx: &WorkerContext, run: &DownloadRun) -> RunOutcome {
    let id = ctx.run_id;
    let company_id = CompanyId::new(run.company_id);
    let doc_type = run.document_type();

    let period = match parse_period(run) {
        Some(p) => p,
        None => {
            return RunOutcome::Failed {
                erro: format!(
                    "período inválido no registro do run: {}..{}",
                    run.periodo_inicio, run.periodo_fim
                ),
                certificado_vencido: false,
            };
        }
    };

    let started = Instant::now();
    let mut deadline = ctx.config.worker.deadline_for(None);

    // Authenticate with the company's certificate
    ctx.set_etapa("autenticando").await;
    let session = match fetch_with_retry(&ctx.config.retry, || ctx.client.authenticate(company_id))
        .await
    {
        Ok(session) => session,
        Err(e) => {
            return RunOutcome::Failed {
                certificado_vencido: e.is_certificate_expired(),
                erro: e.to_string(),
            };
        }
    };

    // Resume from the persisted cursor; 0 means fetch from the beginning
    let mut from_nsu = match ctx.db.get_cursor(company_id, doc_type).await {
        Ok(nsu) => nsu,
        Err(e) => {
            return RunOutcome::Failed {
                erro: format!("falha ao ler cursor NSU: {}", e),
                certificado_vencido: false,
            };
        }
    };

    let mut progress = RunProgress {
        total_docs: 0,
        docs_novos: 0,
        ultimo_nsu: from_nsu,
    };
    let mut page_number: u32 = 1;

    loop {
        if ctx.cancel_token.is_cancelled() {
            return RunOutcome::Cancelled;
        }
        if started.elapsed() > deadline {
            return RunOutcome::Failed {
                erro: format!(
                    "tempo limite excedido após {}s",
                    started.elapsed().as_secs()
                ),
                certificado_vencido: false,
            };
        }

        ctx.set_etapa(&format!("baixando página {}", page_number))
            .await;

        let request = PageRequest {
            company_id,
            doc_type,
            from_nsu,
            period,
        };
        let page = match fetch_with_retry(&ctx.config.retry, || {
            ctx.client.fetch_page(&session, &request)
        })
        .await
        {
            Ok(page) => page,
            Err(e) => {
                return RunOutcome::Failed {
                    certificado_vencido: e.is_certificate_expired(),
                    erro: e.to_string(),
                };
            }
        };

        // First page tells us the expected volume; scale the deadline so
        // large companies aren't starved by the base timeout
        if page_number == 1 {
            if let Some(total) = page.total_esperado {
                if let Err(e) = ctx.db.set_total_esperado(id, total).await {
                    tracing::warn!(run_id = id.0, error = %e, "Failed to record total esperado");
                }
                deadline = ctx.config.worker.deadline_for(Some(total));
            }
        }

        let novos_before = progress.docs_novos;
        match process_page(ctx, run, &session, &page, &mut progress).await {
            PageResult::Committed => {}
            PageResult::Cancelled => return RunOutcome::Cancelled,
            PageResult::Failed(erro) => {
                return RunOutcome::Failed {
                    erro,
                    certificado_vencido: false,
                };
            }
        }

        ctx.emit(Event::PageCommitted {
            id,
            page: page_number,
            docs: page.documents.len() as u32,
            docs_novos: (progress.docs_novos - novos_before) as u32,
            ultimo_nsu: progress.ultimo_nsu,
        });

        if !page.has_more {
            return RunOutcome::Completed;
        }

        from_nsu = page.ultimo_nsu;
        page_number += 1;

        // Pace consecutive page fetches
        tokio::select! {
            _ = ctx.cancel_token.cancelled() => return RunOutcome::Cancelled,
            _ = tokio::time::sleep(ctx.config.worker.inter_page_delay) => {}
        }
    }
}

/// Outcome of storing one page
enum PageResult {
    Committed,
    Cancelled,
    Failed(String),
}

/// Store a page's documents, fetch their PDFs per policy, then commit the
/// cursor and progress counters.
///
/// The cursor is advanced only here, after every document of the page is
/// durably stored; a worker that dies mid-page leaves the cursor at the
/// previous page.
async fn process_page(
    ctx: &WorkerContext,
    run: &DownloadRun,
    session: &Session,
    page: &DocumentPage,
    progress: &mut RunProgress,
) -> PageResult {
    let id = ctx.run_id;
    let company_id = CompanyId::new(run.company_id);
    let doc_type = run.document_type();
    let total_on_page = page.documents.len();

    for (idx, doc) in page.documents.iter().enumerate() {
        // Cancellation is observed between documents, never mid-write
        if ctx.cancel_token.is_cancelled() {
            return PageResult::Cancelled;
        }

        let new_doc = NewDocument {
            chave_acesso: doc.chave_acesso.clone(),
            company_id,
            doc_type,
            direcao: doc.direction.to_i32(),
            nsu: doc.nsu,
            xml: doc.xml.clone(),
            numero: doc.numero.clone(),
            valor_total: doc.valor_total,
            emitido_em: doc.emitido_em.map(|dt| dt.timestamp()),
            contraparte: doc.contraparte.clone(),
        };
        let inserted = match ctx.db.upsert_document(&new_doc).await {
            Ok(inserted) => inserted,
            Err(e) => return PageResult::Failed(format!("falha ao gravar documento: {}", e)),
        };
        progress.total_docs += 1;
        if inserted {
            progress.docs_novos += 1;
        }

        if ctx.config.worker.fetch_pdfs {
            ctx.set_etapa(&format!("baixando PDF {}/{}", idx + 1, total_on_page))
                .await;
            match fetch_pdf_with_policy(ctx, session, &doc.chave_acesso).await {
                PdfResult::Stored | PdfResult::Skipped => {}
                PdfResult::Cancelled => return PageResult::Cancelled,
                PdfResult::Failed(erro) => return PageResult::Failed(erro),
            }
        }
    }

    // Commit: cursor first, then counters. Both only move forward, so a
    // crash between the two statements is recovered by the next run.
    if let Err(e) = ctx
        .db
        .advance_cursor(company_id, doc_type, page.ultimo_nsu)
        .await
    {
        return PageResult::Failed(format!("falha ao avançar cursor NSU: {}", e));
    }
    progress.ultimo_nsu = progress.ultimo_nsu.max(page.ultimo_nsu);

    if let Err(e) = ctx
        .db
        .update_progress(
            id,
            progress.total_docs,
            progress.total_docs,
            progress.docs_novos,
            progress.ultimo_nsu,
        )
        .await
    {
        return PageResult::Failed(format!("falha ao gravar progresso: {}", e));
    }

    PageResult::Committed
}

/// Outcome of a PDF fetch under the failure policy
enum PdfResult {
    Stored,
    Skipped,
    Cancelled,
    Failed(String),
}

/// Fetch and store one document's PDF.
///
/// A PDF failing `pdf_failure_limit` times is skipped when the
/// skip-failed-PDFs policy is enabled; otherwise the whole run errors.
async fn fetch_pdf_with_policy(
    ctx: &WorkerContext,
    session: &Session,
    chave_acesso: &str,
) -> PdfResult {
    let limit = ctx.config.worker.pdf_failure_limit.max(1);
    let mut failures: u32 = 0;

    loop {
        if ctx.cancel_token.is_cancelled() {
            return PdfResult::Cancelled;
        }

        match ctx.client.fetch_pdf(session, chave_acesso).await {
            Ok(bytes) => {
                let path = ctx
                    .config
                    .persistence
                    .pdf_dir
                    .join(format!("{}.pdf", chave_acesso));
                if let Err(e) = tokio::fs::write(&path, &bytes).await {
                    return PdfResult::Failed(format!(
                        "falha ao salvar PDF {}: {}",
                        chave_acesso, e
                    ));
                }
                if let Err(e) = ctx
                    .db
                    .set_document_pdf(chave_acesso, &path.to_string_lossy())
                    .await
                {
                    return PdfResult::Failed(format!("falha ao registrar PDF: {}", e));
                }

                // Pace consecutive PDF fetches
                tokio::time::sleep(ctx.config.worker.inter_pdf_delay).await;
                return PdfResult::Stored;
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    run_id = ctx.run_id.0,
                    chave_acesso,
                    failures,
                    error = %e,
                    "PDF fetch failed"
                );

                if failures >= limit {
                    if ctx.config.worker.skip_failed_pdfs {
                        tracing::warn!(
                            run_id = ctx.run_id.0,
                            chave_acesso,
                            "Skipping PDF after repeated failures"
                        );
                        return PdfResult::Skipped;
                    }
                    return PdfResult::Failed(format!(
                        "falha ao baixar PDF do documento {}: {}",
                        chave_acesso, e
                    ));
                }

                tokio::time::sleep(ctx.config.worker.inter_pdf_delay).await;
            }
        }
    }
}

/// Record the terminal state and emit the matching event
async fn finalize(ctx: &WorkerContext, run: &DownloadRun, outcome: RunOutcome) {
    let id = ctx.run_id;

    let result = match &outcome {
        RunOutcome::Completed => {
            ctx.db
                .finalize_run(id, RunStatus::Concluido, None, false)
                .await
        }
        RunOutcome::Cancelled => {
            ctx.db
                .finalize_run(id, RunStatus::Cancelado, None, false)
                .await
        }
        RunOutcome::Failed {
            erro,
            certificado_vencido,
        } => {
            ctx.db
                .finalize_run(id, RunStatus::Erro, Some(erro), *certificado_vencido)
                .await
        }
    };
    match result {
        Ok(true) => {}
        Ok(false) => {
            // Someone else already finalized the row; the terminal state
            // stands and the matching event was already emitted
            tracing::warn!(run_id = id.0, "Run was already terminal, keeping the first outcome");
            return;
        }
        Err(e) => {
            tracing::error!(run_id = id.0, error = %e, "Failed to finalize run");
        }
    }

    match outcome {
        RunOutcome::Completed => {
            // Re-read for the final counters; the row is authoritative
            let (total_docs, docs_novos) = match ctx.db.get_run(id).await {
                Ok(Some(row)) => (row.total_docs, row.docs_novos),
                _ => (0, 0),
            };
            tracing::info!(run_id = id.0, total_docs, docs_novos, "Run completed");
            ctx.emit(Event::RunCompleted {
                id,
                total_docs,
                docs_novos,
            });
        }
        RunOutcome::Cancelled => {
            tracing::info!(run_id = id.0, "Run cancelled");
            ctx.emit(Event::RunCancelled { id });
        }
        RunOutcome::Failed {
            erro,
            certificado_vencido,
        } => {
            tracing::warn!(
                run_id = id.0,
                company_id = run.company_id,
                certificado_vencido,
                error = %erro,
                "Run failed"
            );
            ctx.emit(Event::RunFailed {
                id,
                error: erro,
                certificado_vencido,
            });
        }
    }
}

fn parse_period(run: &DownloadRun) -> Option<Period> {
    let inicio = NaiveDate::parse_from_str(&run.periodo_inicio, "%Y-%m-%d").ok()?;
    let fim = NaiveDate::parse_from_str(&run.periodo_fim, "%Y-%m-%d").ok()?;
    Some(Period { inicio, fim })
}
