use std::time::Duration;

use crate::engine::DispatchRequest;
use crate::engine::test_helpers::*;
use crate::types::{DispatchMode, DocumentType, RunStatus, Trigger};

fn request_for_all(doc_type: DocumentType) -> DispatchRequest {
    DispatchRequest {
        companies: None,
        doc_type,
        period: test_period(),
        trigger: Trigger::Manual,
        mode: DispatchMode::Full,
    }
}

#[tokio::test]
async fn dispatch_runs_every_active_company_to_completion() {
    let (engine, client, _guard) = create_test_engine().await;

    let a = engine
        .db
        .insert_company("Empresa A", "11111111000111", Some(i64::MAX))
        .await
        .unwrap();
    let b = engine
        .db
        .insert_company("Empresa B", "22222222000122", Some(i64::MAX))
        .await
        .unwrap();
    client.seed_documents(a, 1, 5);
    client.seed_documents(b, 1, 3);

    let queued = engine
        .dispatch(request_for_all(DocumentType::Nfse))
        .await
        .unwrap();
    assert_eq!(queued.len(), 2);

    for id in &queued {
        let status = wait_for_terminal(&engine, *id, Duration::from_secs(5)).await;
        assert_eq!(status, RunStatus::Concluido);
    }

    // Cursors landed on the last NSU of each feed
    assert_eq!(engine.db.get_cursor(a, DocumentType::Nfse).await.unwrap(), 5);
    assert_eq!(engine.db.get_cursor(b, DocumentType::Nfse).await.unwrap(), 3);
    assert_eq!(engine.db.count_all_documents().await.unwrap(), 8);
}

#[tokio::test]
async fn dispatch_skips_companies_with_an_active_run() {
    let temp = tempfile::tempdir().unwrap();
    let config = test_config(&temp);
    let client = MockFiscalClient::new().with_page_delay(Duration::from_millis(300));
    let (engine, client, _guard) = create_test_engine_with(config, client, temp).await;

    let a = engine
        .db
        .insert_company("Empresa A", "11111111000111", Some(i64::MAX))
        .await
        .unwrap();
    client.seed_documents(a, 1, 2);

    let first = engine
        .dispatch(request_for_all(DocumentType::Nfse))
        .await
        .unwrap();
    assert_eq!(first.len(), 1);

    // While the first run is still in flight, a second dispatch must skip it
    let second = engine
        .dispatch(request_for_all(DocumentType::Nfse))
        .await
        .unwrap();
    assert!(second.is_empty(), "active company must not be re-dispatched");

    // A different document type is independent
    let cte = engine
        .dispatch(request_for_all(DocumentType::Cte))
        .await
        .unwrap();
    assert_eq!(cte.len(), 1);

    wait_for_terminal(&engine, first[0], Duration::from_secs(5)).await;
}

#[tokio::test]
async fn expired_certificate_fails_fast_without_a_worker_slot() {
    let (engine, client, _guard) = create_test_engine().await;

    // Certificate already expired in the registry
    let expired = engine
        .db
        .insert_company("Expirada", "33333333000133", Some(0))
        .await
        .unwrap();
    let ok = engine
        .db
        .insert_company("Valida", "44444444000144", Some(i64::MAX))
        .await
        .unwrap();
    client.seed_documents(ok, 1, 1);

    let queued = engine
        .dispatch(request_for_all(DocumentType::Nfse))
        .await
        .unwrap();
    // Only the valid company consumed a queue slot
    assert_eq!(queued.len(), 1);

    let runs = engine.db.list_runs().await.unwrap();
    let failed = runs
        .iter()
        .find(|r| r.company_id == expired.get())
        .expect("expired company still gets a run row");
    assert_eq!(failed.run_status(), RunStatus::Erro);
    assert_eq!(failed.certificado_vencido, 1);
    assert!(failed.erro.as_deref().unwrap().contains("vencido"));

    // The mock was never even asked to authenticate the expired company
    wait_for_terminal(&engine, queued[0], Duration::from_secs(5)).await;
    assert_eq!(
        client.auth_calls.load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

#[tokio::test]
async fn worker_pool_never_exceeds_configured_bound() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(&temp);
    config.pool.max_concurrent_companies = 2;
    let client = MockFiscalClient::new().with_page_delay(Duration::from_millis(100));
    let (engine, client, _guard) = create_test_engine_with(config, client, temp).await;

    for i in 0..5 {
        let id = engine
            .db
            .insert_company(
                &format!("Empresa {}", i),
                &format!("0000000000{:04}", i),
                Some(i64::MAX),
            )
            .await
            .unwrap();
        client.seed_documents(id, 1, 2);
    }

    let queued = engine
        .dispatch(request_for_all(DocumentType::Nfse))
        .await
        .unwrap();
    assert_eq!(queued.len(), 5);

    // Sample the executando count while the batch drains
    let mut max_executando = 0usize;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let executando = engine
            .db
            .count_runs_by_status(RunStatus::Executando)
            .await
            .unwrap() as usize;
        max_executando = max_executando.max(executando);

        let stats = engine.stats().await.unwrap();
        if stats.pendentes == 0 && stats.executando == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "batch did not drain in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(max_executando >= 1);
    assert!(
        max_executando <= 2,
        "concurrency bound violated: saw {} executando",
        max_executando
    );
}

#[tokio::test]
async fn admissions_are_staggered_by_the_inter_company_delay() {
    let temp = tempfile::tempdir().unwrap();
    let mut config = test_config(&temp);
    config.pool.inter_company_delay = Duration::from_millis(150);
    let client = MockFiscalClient::new();
    let (engine, client, _guard) = create_test_engine_with(config, client, temp).await;

    let mut events = engine.subscribe();

    let a = engine
        .db
        .insert_company("Empresa A", "11111111000111", Some(i64::MAX))
        .await
        .unwrap();
    let b = engine
        .db
        .insert_company("Empresa B", "22222222000122", Some(i64::MAX))
        .await
        .unwrap();
    client.seed_documents(a, 1, 1);
    client.seed_documents(b, 1, 1);

    let queued = engine
        .dispatch(request_for_all(DocumentType::Nfse))
        .await
        .unwrap();
    assert_eq!(queued.len(), 2);

    // Collect the two RunStarted instants
    let mut started_at = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while started_at.len() < 2 && tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(crate::types::Event::RunStarted { .. })) => {
                started_at.push(tokio::time::Instant::now());
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    assert_eq!(started_at.len(), 2, "both runs must start");
    let gap = started_at[1] - started_at[0];
    assert!(
        gap >= Duration::from_millis(100),
        "starts not staggered: gap was {:?}",
        gap
    );
}

#[tokio::test]
async fn dispatch_rejects_unknown_company_ids() {
    let (engine, _client, _guard) = create_test_engine().await;

    let err = engine
        .dispatch(DispatchRequest {
            companies: Some(vec![crate::types::CompanyId::new(999)]),
            doc_type: DocumentType::Nfse,
            period: test_period(),
            trigger: Trigger::Manual,
            mode: DispatchMode::Full,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, crate::error::Error::NotFound(_)));
}
