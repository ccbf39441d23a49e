//! Shared test helpers: a scripted fiscal API client and engine factories.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tempfile::tempdir;

use crate::client::{DocumentPage, FetchedDocument, FiscalClient, PageRequest, Session};
use crate::config::Config;
use crate::error::FetchError;
use crate::types::{CompanyId, Direction, Period, RunId, RunStatus};

use super::DownloadEngine;

/// Scripted stand-in for the national fiscal API.
///
/// Each company gets a feed of documents keyed by NSU; `fetch_page` serves
/// slices of the feed past the requested cursor, so pagination, cursors and
/// idempotent re-dispatch behave like the real distribution endpoint.
pub(crate) struct MockFiscalClient {
    state: std::sync::Mutex<MockState>,
    /// Artificial latency per page fetch (for concurrency/cancellation tests)
    pub(crate) page_delay: Duration,
    pub(crate) auth_calls: AtomicU32,
    pub(crate) page_calls: AtomicU32,
}

struct MockState {
    feeds: HashMap<CompanyId, Vec<FetchedDocument>>,
    page_size: usize,
    /// Companies whose authentication fails with an expired certificate
    expired_certs: Vec<CompanyId>,
    /// Companies whose page fetches always fail with a server error
    failing_pages: Vec<CompanyId>,
    /// company -> NSU threshold: fetches starting at or past it fail
    failing_from: HashMap<CompanyId, i64>,
    /// chave_acesso -> remaining PDF failures before success (u32::MAX = always)
    pdf_failures: HashMap<String, u32>,
}

impl MockFiscalClient {
    pub(crate) fn new() -> Self {
        Self {
            state: std::sync::Mutex::new(MockState {
                feeds: HashMap::new(),
                page_size: 10,
                expired_certs: Vec::new(),
                failing_pages: Vec::new(),
                failing_from: HashMap::new(),
                pdf_failures: HashMap::new(),
            }),
            page_delay: Duration::ZERO,
            auth_calls: AtomicU32::new(0),
            page_calls: AtomicU32::new(0),
        }
    }

    pub(crate) fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub(crate) fn set_page_size(&self, size: usize) {
        self.state.lock().unwrap().page_size = size;
    }

    /// Seed a company's feed with `count` documents starting at `start_nsu`
    pub(crate) fn seed_documents(&self, company_id: CompanyId, start_nsu: i64, count: usize) {
        let docs: Vec<FetchedDocument> = (0..count)
            .map(|i| {
                let nsu = start_nsu + i as i64;
                FetchedDocument {
                    chave_acesso: format!("chave-{}-{}", company_id.0, nsu),
                    nsu,
                    direction: Direction::Recebida,
                    xml: format!("<NFSe nsu=\"{}\"/>", nsu),
                    numero: Some(nsu.to_string()),
                    valor_total: Some(100.0),
                    emitido_em: None,
                    contraparte: None,
                }
            })
            .collect();
        self.state
            .lock()
            .unwrap()
            .feeds
            .entry(company_id)
            .or_default()
            .extend(docs);
    }

    /// Add one document with an explicit chave (for duplicate-key tests)
    pub(crate) fn seed_document(&self, company_id: CompanyId, nsu: i64, chave: &str) {
        let doc = FetchedDocument {
            chave_acesso: chave.to_string(),
            nsu,
            direction: Direction::Recebida,
            xml: format!("<NFSe nsu=\"{}\"/>", nsu),
            numero: None,
            valor_total: None,
            emitido_em: None,
            contraparte: None,
        };
        self.state
            .lock()
            .unwrap()
            .feeds
            .entry(company_id)
            .or_default()
            .push(doc);
    }

    pub(crate) fn expire_certificate(&self, company_id: CompanyId) {
        self.state.lock().unwrap().expired_certs.push(company_id);
    }

    pub(crate) fn fail_pages_for(&self, company_id: CompanyId) {
        self.state.lock().unwrap().failing_pages.push(company_id);
    }

    /// Fail page fetches whose cursor is at or past `from_nsu`
    pub(crate) fn fail_pages_from(&self, company_id: CompanyId, from_nsu: i64) {
        self.state
            .lock()
            .unwrap()
            .failing_from
            .insert(company_id, from_nsu);
    }

    pub(crate) fn clear_page_failures(&self) {
        let mut state = self.state.lock().unwrap();
        state.failing_pages.clear();
        state.failing_from.clear();
    }

    pub(crate) fn fail_pdf(&self, chave: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .pdf_failures
            .insert(chave.to_string(), times);
    }
}

#[async_trait]
impl FiscalClient for MockFiscalClient {
    async fn authenticate(&self, company_id: CompanyId) -> Result<Session, FetchError> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);

        let expired = self
            .state
            .lock()
            .unwrap()
            .expired_certs
            .contains(&company_id);
        if expired {
            return Err(FetchError::CertificateExpired { company_id });
        }

        Ok(Session {
            token: format!("token-{}", company_id.0),
            company_id,
        })
    }

    async fn fetch_page(
        &self,
        _session: &Session,
        request: &PageRequest,
    ) -> Result<DocumentPage, FetchError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);

        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }

        let (documents, ultimo_nsu, has_more, total) = {
            let state = self.state.lock().unwrap();
            if state.failing_pages.contains(&request.company_id) {
                return Err(FetchError::Api {
                    status: 503,
                    message: "serviço indisponível".to_string(),
                });
            }
            if let Some(&threshold) = state.failing_from.get(&request.company_id) {
                if request.from_nsu >= threshold {
                    return Err(FetchError::Api {
                        status: 503,
                        message: "serviço indisponível".to_string(),
                    });
                }
            }

            let feed = state.feeds.get(&request.company_id).cloned().unwrap_or_default();
            let mut remaining: Vec<FetchedDocument> = feed
                .into_iter()
                .filter(|d| d.nsu > request.from_nsu)
                .collect();
            remaining.sort_by_key(|d| d.nsu);

            let total = remaining.len() as i64;
            let page: Vec<FetchedDocument> =
                remaining.iter().take(state.page_size).cloned().collect();
            let has_more = remaining.len() > page.len();
            let ultimo_nsu = page.last().map(|d| d.nsu).unwrap_or(request.from_nsu);
            (page, ultimo_nsu, has_more, total)
        };

        Ok(DocumentPage {
            documents,
            ultimo_nsu,
            has_more,
            total_esperado: Some(total),
        })
    }

    async fn fetch_pdf(
        &self,
        _session: &Session,
        chave_acesso: &str,
    ) -> Result<Vec<u8>, FetchError> {
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.pdf_failures.get_mut(chave_acesso) {
            if *remaining == u32::MAX {
                return Err(FetchError::PdfUnavailable {
                    chave_acesso: chave_acesso.to_string(),
                });
            }
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FetchError::PdfUnavailable {
                    chave_acesso: chave_acesso.to_string(),
                });
            }
        }
        Ok(b"%PDF-1.4 mock".to_vec())
    }
}

/// Fast configuration for tests: zero pacing delays, no PDFs, tiny backoff
pub(crate) fn test_config(temp: &tempfile::TempDir) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = temp.path().join("test.db");
    config.persistence.pdf_dir = temp.path().join("pdfs");
    config.api.enabled = false;
    config.pool.inter_company_delay = Duration::ZERO;
    config.worker.inter_page_delay = Duration::ZERO;
    config.worker.inter_pdf_delay = Duration::ZERO;
    config.worker.fetch_pdfs = false;
    config.retry.max_attempts = 1;
    config.retry.initial_delay = Duration::from_millis(1);
    config.retry.jitter = false;
    config.resume_nfse.auto_resume = false;
    config.resume_cte.auto_resume = false;
    config
}

/// Create a test engine over a scripted client and a temp database.
/// Returns the engine, the client and the tempdir (which must be kept alive).
pub(crate) async fn create_test_engine() -> (DownloadEngine, Arc<MockFiscalClient>, tempfile::TempDir)
{
    let temp = tempdir().unwrap();
    let config = test_config(&temp);
    create_test_engine_with(config, MockFiscalClient::new(), temp).await
}

/// Create a test engine with explicit config and client
pub(crate) async fn create_test_engine_with(
    config: Config,
    client: MockFiscalClient,
    temp: tempfile::TempDir,
) -> (DownloadEngine, Arc<MockFiscalClient>, tempfile::TempDir) {
    let client = Arc::new(client);
    let engine = DownloadEngine::with_client(config, client.clone())
        .await
        .unwrap();
    (engine, client, temp)
}

/// A June 2025 competence period used across tests
pub(crate) fn test_period() -> Period {
    Period {
        inicio: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        fim: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
    }
}

/// Poll until a run reaches a terminal state, panicking after `timeout`
pub(crate) async fn wait_for_terminal(
    engine: &DownloadEngine,
    id: RunId,
    timeout: Duration,
) -> RunStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let run = engine.db.get_run(id).await.unwrap().unwrap();
        let status = run.run_status();
        if status.is_terminal() {
            return status;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("run {} did not reach a terminal state within {:?}", id, timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
