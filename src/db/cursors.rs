//! NSU cursor persistence.
//!
//! One cursor row per (company, document type). A cursor only ever moves
//! forward; failed or cancelled runs never roll it back, so a retry resumes
//! from the last committed page.

use crate::error::DatabaseError;
use crate::types::{CompanyId, DocumentType};
use crate::{Error, Result};

use super::{Database, NsuCursorRow};

impl Database {
    /// Get the persisted NSU cursor for a company and document type.
    ///
    /// Returns 0 when no cursor exists yet (fetch from the beginning).
    pub async fn get_cursor(&self, company_id: CompanyId, doc_type: DocumentType) -> Result<i64> {
        let cursor: Option<i64> = sqlx::query_scalar(
            "SELECT ultimo_nsu FROM nsu_cursors WHERE company_id = ? AND doc_type = ?",
        )
        .bind(company_id)
        .bind(doc_type.to_i32())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get cursor: {}",
                e
            )))
        })?;

        Ok(cursor.unwrap_or(0))
    }

    /// Advance the NSU cursor after a committed page.
    ///
    /// The update is guarded in SQL: a value at or below the stored cursor
    /// is a no-op and returns false. The cursor is monotonic even under
    /// concurrent writers.
    pub async fn advance_cursor(
        &self,
        company_id: CompanyId,
        doc_type: DocumentType,
        ultimo_nsu: i64,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO nsu_cursors (company_id, doc_type, ultimo_nsu, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (company_id, doc_type) DO UPDATE
            SET ultimo_nsu = excluded.ultimo_nsu, updated_at = excluded.updated_at
            WHERE excluded.ultimo_nsu > nsu_cursors.ultimo_nsu
            "#,
        )
        .bind(company_id)
        .bind(doc_type.to_i32())
        .bind(ultimo_nsu)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to advance cursor: {}",
                e
            )))
        })?;

        let advanced = result.rows_affected() > 0;
        if !advanced {
            tracing::debug!(
                company_id = %company_id,
                doc_type = %doc_type,
                ultimo_nsu,
                "Cursor advance ignored: value not past stored cursor"
            );
        }

        Ok(advanced)
    }

    /// Delete the cursor for a company and document type.
    ///
    /// Administrative operation; the run flow never calls this. The next
    /// full dispatch refetches from NSU 0.
    pub async fn reset_cursor(&self, company_id: CompanyId, doc_type: DocumentType) -> Result<()> {
        sqlx::query("DELETE FROM nsu_cursors WHERE company_id = ? AND doc_type = ?")
            .bind(company_id)
            .bind(doc_type.to_i32())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to reset cursor: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// List all persisted cursors
    pub async fn list_cursors(&self) -> Result<Vec<NsuCursorRow>> {
        let cursors = sqlx::query_as::<_, NsuCursorRow>(
            "SELECT * FROM nsu_cursors ORDER BY company_id, doc_type",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list cursors: {}",
                e
            )))
        })?;

        Ok(cursors)
    }
}
