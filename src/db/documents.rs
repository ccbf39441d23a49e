//! Fiscal document persistence.

use crate::error::DatabaseError;
use crate::types::{CompanyId, DocumentType};
use crate::{Error, Result};

use super::{Database, DocumentRow, NewDocument};

impl Database {
    /// Insert a document if its chave de acesso is not already stored.
    ///
    /// Returns true when the document was inserted, false when it already
    /// existed. Re-downloads of the same document are counted in total_docs
    /// but not in docs_novos.
    pub async fn upsert_document(&self, doc: &NewDocument) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO documents
                (chave_acesso, company_id, doc_type, direcao, nsu, xml,
                 numero, valor_total, emitido_em, contraparte, inserido_em)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (chave_acesso) DO NOTHING
            "#,
        )
        .bind(&doc.chave_acesso)
        .bind(doc.company_id)
        .bind(doc.doc_type.to_i32())
        .bind(doc.direcao)
        .bind(doc.nsu)
        .bind(&doc.xml)
        .bind(&doc.numero)
        .bind(doc.valor_total)
        .bind(doc.emitido_em)
        .bind(&doc.contraparte)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to upsert document: {}",
                e
            )))
        })?;

        Ok(result.rows_affected() > 0)
    }

    /// Record the stored PDF path for a document
    pub async fn set_document_pdf(&self, chave_acesso: &str, pdf_path: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET pdf_path = ? WHERE chave_acesso = ?")
            .bind(pdf_path)
            .bind(chave_acesso)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to set document PDF path: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Get a document by its chave de acesso
    pub async fn get_document(&self, chave_acesso: &str) -> Result<Option<DocumentRow>> {
        let doc =
            sqlx::query_as::<_, DocumentRow>("SELECT * FROM documents WHERE chave_acesso = ?")
                .bind(chave_acesso)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to get document: {}",
                        e
                    )))
                })?;

        Ok(doc)
    }

    /// Count documents stored for a company and document type
    pub async fn count_documents(
        &self,
        company_id: CompanyId,
        doc_type: DocumentType,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM documents WHERE company_id = ? AND doc_type = ?",
        )
        .bind(company_id)
        .bind(doc_type.to_i32())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to count documents: {}",
                e
            )))
        })?;

        Ok(count)
    }

    /// Count all stored documents
    pub async fn count_all_documents(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count documents: {}",
                    e
                )))
            })?;

        Ok(count)
    }
}
