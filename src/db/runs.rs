//! Download run persistence operations.

use crate::error::DatabaseError;
use crate::types::{CompanyId, DocumentType, RunId, RunStatus};
use crate::{Error, Result};

use super::{Database, DownloadRun, NewDownloadRun};

impl Database {
    /// Insert a new download run in the pendente state.
    pub async fn insert_run(&self, run: &NewDownloadRun) -> Result<RunId> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO download_runs
                (company_id, doc_type, status, trigger_kind, delta_only,
                 periodo_inicio, periodo_fim, criado_em)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.company_id)
        .bind(run.doc_type.to_i32())
        .bind(RunStatus::Pendente.to_i32())
        .bind(run.trigger.to_i32())
        .bind(if run.mode.is_delta_only() { 1_i32 } else { 0_i32 })
        .bind(run.period.inicio.format("%Y-%m-%d").to_string())
        .bind(run.period.fim.format("%Y-%m-%d").to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert run: {}",
                e
            )))
        })?;

        Ok(RunId::new(result.last_insert_rowid()))
    }

    /// Get a run by ID
    pub async fn get_run(&self, id: RunId) -> Result<Option<DownloadRun>> {
        let run = sqlx::query_as::<_, DownloadRun>("SELECT * FROM download_runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get run: {}",
                    e
                )))
            })?;

        Ok(run)
    }

    /// List all runs in display order.
    ///
    /// Executando first, then pendente, then concluido (runs that found
    /// documents before runs that found none, even when every document was
    /// already known), then erro, then cancelado. Within a group the most
    /// recently created run comes first.
    pub async fn list_runs(&self) -> Result<Vec<DownloadRun>> {
        let runs = sqlx::query_as::<_, DownloadRun>(
            r#"
            SELECT * FROM download_runs
            ORDER BY
                CASE status
                    WHEN 1 THEN 0
                    WHEN 0 THEN 1
                    WHEN 2 THEN 2
                    WHEN 3 THEN 3
                    ELSE 4
                END,
                CASE WHEN status = 2 AND total_docs > 0 THEN 0 ELSE 1 END,
                criado_em DESC,
                id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list runs: {}",
                e
            )))
        })?;

        Ok(runs)
    }

    /// List runs in a given status
    pub async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<DownloadRun>> {
        let runs = sqlx::query_as::<_, DownloadRun>(
            "SELECT * FROM download_runs WHERE status = ? ORDER BY criado_em DESC, id DESC",
        )
        .bind(status.to_i32())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list runs by status: {}",
                e
            )))
        })?;

        Ok(runs)
    }

    /// Check whether a company already has an active (pendente or executando)
    /// run for the given document type.
    pub async fn has_active_run(
        &self,
        company_id: CompanyId,
        doc_type: DocumentType,
    ) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM download_runs
            WHERE company_id = ? AND doc_type = ? AND status IN (?, ?)
            "#,
        )
        .bind(company_id)
        .bind(doc_type.to_i32())
        .bind(RunStatus::Pendente.to_i32())
        .bind(RunStatus::Executando.to_i32())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to check active run: {}",
                e
            )))
        })?;

        Ok(count > 0)
    }

    /// Transition a run from pendente to executando.
    ///
    /// Returns false if the run was no longer pendente (e.g. cancelled while
    /// it waited in the queue).
    pub async fn mark_executando(&self, id: RunId) -> Result<bool> {
        let result = sqlx::query("UPDATE download_runs SET status = ? WHERE id = ? AND status = ?")
            .bind(RunStatus::Executando.to_i32())
            .bind(id)
            .bind(RunStatus::Pendente.to_i32())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to mark run executando: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected() > 0)
    }

    /// Update the human-readable stage of a run
    pub async fn set_etapa(&self, id: RunId, etapa: &str) -> Result<()> {
        sqlx::query("UPDATE download_runs SET etapa = ? WHERE id = ?")
            .bind(etapa)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to set etapa: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Record progress after a committed page
    pub async fn update_progress(
        &self,
        id: RunId,
        progresso: i64,
        total_docs: i64,
        docs_novos: i64,
        ultimo_nsu: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE download_runs
            SET progresso = ?, total_docs = ?, docs_novos = ?, ultimo_nsu = ?
            WHERE id = ?
            "#,
        )
        .bind(progresso)
        .bind(total_docs)
        .bind(docs_novos)
        .bind(ultimo_nsu)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to update progress: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Record the total the API reported for the query, once known
    pub async fn set_total_esperado(&self, id: RunId, total: i64) -> Result<()> {
        sqlx::query("UPDATE download_runs SET total_esperado = ? WHERE id = ?")
            .bind(total)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to set total esperado: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Finalize a run with a terminal status.
    ///
    /// Sets finalizado_em and clears the etapa; erro and certificado_vencido
    /// are recorded when provided. Only a pendente or executando run can be
    /// finalized: a run already in a terminal state is left untouched and
    /// false is returned, so a run is finalized exactly once even when two
    /// callers race.
    pub async fn finalize_run(
        &self,
        id: RunId,
        status: RunStatus,
        erro: Option<&str>,
        certificado_vencido: bool,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE download_runs
            SET status = ?, erro = ?, certificado_vencido = ?, etapa = NULL, finalizado_em = ?
            WHERE id = ? AND status IN (?, ?)
            "#,
        )
        .bind(status.to_i32())
        .bind(erro)
        .bind(if certificado_vencido { 1_i32 } else { 0_i32 })
        .bind(now)
        .bind(id)
        .bind(RunStatus::Pendente.to_i32())
        .bind(RunStatus::Executando.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to finalize run: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Unix timestamp of the most recently finalized run for a document
    /// type, or None when no run has finished yet.
    pub async fn latest_finalizado_em(&self, doc_type: DocumentType) -> Result<Option<i64>> {
        let ts: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(finalizado_em) FROM download_runs WHERE doc_type = ?",
        )
        .bind(doc_type.to_i32())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to read latest finalizado_em: {}",
                e
            )))
        })?;

        Ok(ts)
    }

    /// Mark runs left pendente or executando by a previous process as erro.
    ///
    /// Called once at startup. Cursors already committed by those runs are
    /// untouched, so a retry resumes from the last committed page.
    pub async fn finalize_interrupted_runs(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            UPDATE download_runs
            SET status = ?, erro = 'interrompido por reinicio do servico',
                etapa = NULL, finalizado_em = ?
            WHERE status IN (?, ?)
            "#,
        )
        .bind(RunStatus::Erro.to_i32())
        .bind(now)
        .bind(RunStatus::Pendente.to_i32())
        .bind(RunStatus::Executando.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to finalize interrupted runs: {}",
                e
            )))
        })?;

        Ok(result.rows_affected())
    }

    /// Delete all finished runs (concluido, erro, cancelado).
    ///
    /// Active runs, documents and cursors are untouched.
    pub async fn clear_finished_runs(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM download_runs WHERE status IN (?, ?, ?)")
            .bind(RunStatus::Concluido.to_i32())
            .bind(RunStatus::Erro.to_i32())
            .bind(RunStatus::Cancelado.to_i32())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to clear finished runs: {}",
                    e
                )))
            })?;

        Ok(result.rows_affected())
    }

    /// Count runs in a given status
    pub async fn count_runs_by_status(&self, status: RunStatus) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM download_runs WHERE status = ?")
                .bind(status.to_i32())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to count runs: {}",
                        e
                    )))
                })?;

        Ok(count)
    }
}
