//! Company lookups.
//!
//! Company registration and certificate management live in an external CRUD;
//! the engine only reads the table. Insert exists for embedded deployments
//! and tests.

use crate::error::DatabaseError;
use crate::types::CompanyId;
use crate::{Error, Result};

use super::{Company, Database};

impl Database {
    /// List all active companies, ordered by name
    pub async fn list_active_companies(&self) -> Result<Vec<Company>> {
        let companies =
            sqlx::query_as::<_, Company>("SELECT * FROM companies WHERE ativo = 1 ORDER BY nome")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to list companies: {}",
                        e
                    )))
                })?;

        Ok(companies)
    }

    /// Get a company by ID
    pub async fn get_company(&self, id: CompanyId) -> Result<Option<Company>> {
        let company = sqlx::query_as::<_, Company>("SELECT * FROM companies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to get company: {}",
                    e
                )))
            })?;

        Ok(company)
    }

    /// Insert a company
    pub async fn insert_company(
        &self,
        nome: &str,
        cnpj: &str,
        cert_valido_ate: Option<i64>,
    ) -> Result<CompanyId> {
        let result = sqlx::query(
            "INSERT INTO companies (nome, cnpj, cert_valido_ate, ativo) VALUES (?, ?, ?, 1)",
        )
        .bind(nome)
        .bind(cnpj)
        .bind(cert_valido_ate)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert company: {}",
                e
            )))
        })?;

        Ok(CompanyId::new(result.last_insert_rowid()))
    }
}
