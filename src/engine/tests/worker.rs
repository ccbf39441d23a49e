use std::time::Duration;

use crate::engine::DispatchRequest;
use crate::engine::test_helpers::*;
use crate::types::{CompanyId, DispatchMode, DocumentType, RunStatus, Trigger};

fn single_company_request(company: CompanyId, mode: DispatchMode) -> DispatchRequest {
    DispatchRequest {
        companies: Some(vec![company]),
        doc_type: DocumentType::Nfse,
        period: test_period(),
        trigger: Trigger::Manual,
        mode,
    }
}

async fn dispatch_and_wait(
    engine: &crate::engine::DownloadEngine,
    company: CompanyId,
) -> (crate::types::RunId, RunStatus) {
    let queued = engine
        .dispatch(single_company_request(company, DispatchMode::Full))
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
    let status = wait_for_terminal(engine, queued[0], Duration::from_secs(5)).await;
    (queued[0], status)
}

#[tokio::test]
async fn completed_run_populates_counters_and_cursor() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(&temp);
    let client = MockFiscalClient::new();
    let (engine, client, _guard) = create_test_engine_with(config, client, temp).await;

    let company = engine
        .db
        .insert_company("Empresa A", "11111111000111", Some(i64::MAX))
        .await
        .unwrap();
    client.set_page_size(4);
    client.seed_documents(company, 1, 10);

    let (id, status) = dispatch_and_wait(&engine, company).await;
    assert_eq!(status, RunStatus::Concluido);

    let run = engine.db.get_run(id).await.unwrap().unwrap();
    assert_eq!(run.total_docs, 10);
    assert_eq!(run.docs_novos, 10);
    assert_eq!(run.total_esperado, Some(10));
    assert_eq!(run.ultimo_nsu, Some(10));
    assert!(run.etapa.is_none(), "etapa cleared on finalization");
    assert!(run.finalizado_em.is_some());

    assert_eq!(
        engine.db.get_cursor(company, DocumentType::Nfse).await.unwrap(),
        10
    );
    // 10 docs at page size 4 = 3 pages
    assert_eq!(client.page_calls.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[tokio::test]
async fn re_dispatch_after_completion_finds_nothing_new() {
    let (engine, client, _guard) = create_test_engine().await;

    let company = engine
        .db
        .insert_company("Empresa A", "11111111000111", Some(i64::MAX))
        .await
        .unwrap();
    client.seed_documents(company, 1, 6);

    let (_, status) = dispatch_and_wait(&engine, company).await;
    assert_eq!(status, RunStatus::Concluido);

    // Same feed, second dispatch: the cursor is past everything
    let (second, status) = dispatch_and_wait(&engine, company).await;
    assert_eq!(status, RunStatus::Concluido);

    let run = engine.db.get_run(second).await.unwrap().unwrap();
    assert_eq!(run.docs_novos, 0, "re-dispatch must not count anything as new");
    assert_eq!(engine.db.count_all_documents().await.unwrap(), 6);
}

#[tokio::test]
async fn duplicate_chave_counts_total_but_not_novos() {
    let (engine, client, _guard) = create_test_engine().await;

    let company = engine
        .db
        .insert_company("Empresa A", "11111111000111", Some(i64::MAX))
        .await
        .unwrap();
    // The API re-distributes the same document under a second NSU
    client.seed_document(company, 1, "chave-repetida");
    client.seed_document(company, 2, "chave-repetida");

    let (id, status) = dispatch_and_wait(&engine, company).await;
    assert_eq!(status, RunStatus::Concluido);

    let run = engine.db.get_run(id).await.unwrap().unwrap();
    assert_eq!(run.total_docs, 2);
    assert_eq!(run.docs_novos, 1);
    assert_eq!(engine.db.count_all_documents().await.unwrap(), 1);
}

#[tokio::test]
async fn failed_run_keeps_cursor_at_last_committed_page() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(&temp);
    let client = MockFiscalClient::new();
    let (engine, client, _guard) = create_test_engine_with(config, client, temp).await;

    let company = engine
        .db
        .insert_company("Empresa A", "11111111000111", Some(i64::MAX))
        .await
        .unwrap();
    client.set_page_size(2);
    client.seed_documents(company, 1, 4);
    // Page 1 (NSU 1..2) succeeds; the fetch starting past NSU 2 fails
    client.fail_pages_from(company, 2);

    let queued = engine
        .dispatch(single_company_request(company, DispatchMode::Full))
        .await
        .unwrap();
    let status = wait_for_terminal(&engine, queued[0], Duration::from_secs(5)).await;
    assert_eq!(status, RunStatus::Erro);

    // Cursor reads the committed page, not zero and not page 2
    assert_eq!(
        engine.db.get_cursor(company, DocumentType::Nfse).await.unwrap(),
        2
    );
    let run = engine.db.get_run(queued[0]).await.unwrap().unwrap();
    assert_eq!(run.total_docs, 2);
    assert!(run.erro.is_some());

    // After the API recovers, a retry resumes from NSU 2, not from zero
    client.clear_page_failures();
    let retried = engine.retry_one(queued[0]).await.unwrap();
    let status = wait_for_terminal(&engine, retried, Duration::from_secs(5)).await;
    assert_eq!(status, RunStatus::Concluido);

    let run = engine.db.get_run(retried).await.unwrap().unwrap();
    assert_eq!(run.docs_novos, 2, "only the uncommitted half is new");
    assert_eq!(
        engine.db.get_cursor(company, DocumentType::Nfse).await.unwrap(),
        4
    );
}

#[tokio::test]
async fn certificate_rejected_at_auth_flags_the_run() {
    let (engine, client, _guard) = create_test_engine().await;

    // Registry says the certificate is fine, the API disagrees
    let company = engine
        .db
        .insert_company("Empresa A", "11111111000111", Some(i64::MAX))
        .await
        .unwrap();
    client.expire_certificate(company);

    let queued = engine
        .dispatch(single_company_request(company, DispatchMode::Full))
        .await
        .unwrap();
    let status = wait_for_terminal(&engine, queued[0], Duration::from_secs(5)).await;
    assert_eq!(status, RunStatus::Erro);

    let run = engine.db.get_run(queued[0]).await.unwrap().unwrap();
    assert_eq!(run.certificado_vencido, 1);
    assert!(run.erro.as_deref().unwrap().contains("vencido"));
}

#[tokio::test]
async fn skipped_pdf_policy_lets_the_run_complete() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(&temp);
    config.worker.fetch_pdfs = true;
    config.worker.skip_failed_pdfs = true;
    config.worker.pdf_failure_limit = 2;
    let client = MockFiscalClient::new();
    let (engine, client, _guard) = create_test_engine_with(config, client, temp).await;

    let company = engine
        .db
        .insert_company("Empresa A", "11111111000111", Some(i64::MAX))
        .await
        .unwrap();
    client.seed_documents(company, 1, 2);
    client.fail_pdf(&format!("chave-{}-1", company.0), u32::MAX);

    let (id, status) = dispatch_and_wait(&engine, company).await;
    assert_eq!(status, RunStatus::Concluido);

    let broken = engine
        .db
        .get_document(&format!("chave-{}-1", company.0))
        .await
        .unwrap()
        .unwrap();
    assert!(broken.pdf_path.is_none(), "failed PDF is skipped, not stored");

    let ok = engine
        .db
        .get_document(&format!("chave-{}-2", company.0))
        .await
        .unwrap()
        .unwrap();
    assert!(ok.pdf_path.is_some());

    let run = engine.db.get_run(id).await.unwrap().unwrap();
    assert_eq!(run.total_docs, 2);
}

#[tokio::test]
async fn pdf_failure_escalates_when_skipping_is_disabled() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(&temp);
    config.worker.fetch_pdfs = true;
    config.worker.skip_failed_pdfs = false;
    config.worker.pdf_failure_limit = 2;
    let client = MockFiscalClient::new();
    let (engine, client, _guard) = create_test_engine_with(config, client, temp).await;

    let company = engine
        .db
        .insert_company("Empresa A", "11111111000111", Some(i64::MAX))
        .await
        .unwrap();
    client.seed_documents(company, 1, 1);
    client.fail_pdf(&format!("chave-{}-1", company.0), u32::MAX);

    let (id, status) = dispatch_and_wait(&engine, company).await;
    assert_eq!(status, RunStatus::Erro);

    let run = engine.db.get_run(id).await.unwrap().unwrap();
    assert!(run.erro.as_deref().unwrap().contains("PDF"));
    // Cursor did not move: the page never committed
    assert_eq!(
        engine.db.get_cursor(company, DocumentType::Nfse).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn transient_pdf_failure_recovers_within_the_limit() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(&temp);
    config.worker.fetch_pdfs = true;
    config.worker.skip_failed_pdfs = false;
    config.worker.pdf_failure_limit = 3;
    let client = MockFiscalClient::new();
    let (engine, client, _guard) = create_test_engine_with(config, client, temp).await;

    let company = engine
        .db
        .insert_company("Empresa A", "11111111000111", Some(i64::MAX))
        .await
        .unwrap();
    client.seed_documents(company, 1, 1);
    // Fails twice, succeeds on the third attempt
    client.fail_pdf(&format!("chave-{}-1", company.0), 2);

    let (_, status) = dispatch_and_wait(&engine, company).await;
    assert_eq!(status, RunStatus::Concluido);

    let doc = engine
        .db
        .get_document(&format!("chave-{}-1", company.0))
        .await
        .unwrap()
        .unwrap();
    assert!(doc.pdf_path.is_some());
}

#[tokio::test]
async fn deadline_expiry_finalizes_the_run_as_erro() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(&temp);
    config.worker.per_company_timeout = Duration::from_millis(100);
    config.worker.dynamic_timeout = false;
    let client = MockFiscalClient::new().with_page_delay(Duration::from_millis(80));
    let (engine, client, _guard) = create_test_engine_with(config, client, temp).await;

    let company = engine
        .db
        .insert_company("Empresa A", "11111111000111", Some(i64::MAX))
        .await
        .unwrap();
    client.set_page_size(1);
    client.seed_documents(company, 1, 10);

    let queued = engine
        .dispatch(single_company_request(company, DispatchMode::Full))
        .await
        .unwrap();
    let status = wait_for_terminal(&engine, queued[0], Duration::from_secs(5)).await;
    assert_eq!(status, RunStatus::Erro);

    let run = engine.db.get_run(queued[0]).await.unwrap().unwrap();
    assert!(run.erro.as_deref().unwrap().contains("tempo limite"));
    // Whatever committed before the deadline is kept
    let cursor = engine.db.get_cursor(company, DocumentType::Nfse).await.unwrap();
    assert!(cursor >= 1, "at least one page committed before expiry");
}
