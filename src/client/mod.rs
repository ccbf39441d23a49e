//! Boundary to the national fiscal distribution API.
//!
//! The engine only depends on the [`FiscalClient`] trait; the production
//! implementation lives in [`http`] and tests substitute a scripted mock.
//! The exact national wire format is deliberately outside this crate's
//! scope — the trait speaks in already-decoded pages and documents.

pub mod http;

use chrono::{DateTime, Utc};

use crate::error::FetchError;
use crate::types::{CompanyId, Direction, DocumentType, Period};

pub use http::HttpFiscalClient;

/// An authenticated session for one company, returned by
/// [`FiscalClient::authenticate`] and passed back on every page fetch.
#[derive(Clone, Debug)]
pub struct Session {
    /// Opaque session token issued by the API
    pub token: String,
    /// Company the session belongs to
    pub company_id: CompanyId,
}

/// One fiscal document as decoded from a distribution page
#[derive(Clone, Debug)]
pub struct FetchedDocument {
    /// Globally unique access key (44-digit chave de acesso)
    pub chave_acesso: String,
    /// NSU under which the API distributed this document
    pub nsu: i64,
    /// Direction relative to the company
    pub direction: Direction,
    /// Raw XML payload
    pub xml: String,
    /// Document number parsed from the payload
    pub numero: Option<String>,
    /// Total value parsed from the payload
    pub valor_total: Option<f64>,
    /// Issue date parsed from the payload
    pub emitido_em: Option<DateTime<Utc>>,
    /// Counterpart tax id (issuer or recipient, depending on direction)
    pub contraparte: Option<String>,
}

/// One page of the distribution feed
#[derive(Clone, Debug)]
pub struct DocumentPage {
    /// Documents on this page, in NSU order
    pub documents: Vec<FetchedDocument>,
    /// Highest NSU on the page — the cursor value after committing it
    pub ultimo_nsu: i64,
    /// Whether the API has more pages past `ultimo_nsu`
    pub has_more: bool,
    /// Total documents the API expects to serve for this query, if reported
    pub total_esperado: Option<i64>,
}

/// Parameters for one page fetch
#[derive(Clone, Debug)]
pub struct PageRequest {
    /// Company being fetched
    pub company_id: CompanyId,
    /// Document type to fetch
    pub doc_type: DocumentType,
    /// Fetch documents with NSU strictly greater than this value
    pub from_nsu: i64,
    /// Competence period restriction
    pub period: Period,
}

/// Abstraction over the national fiscal API, enabling testability.
#[async_trait::async_trait]
pub trait FiscalClient: Send + Sync {
    /// Authenticate with the company's digital certificate.
    ///
    /// Returns `FetchError::CertificateExpired` when the certificate is past
    /// its validity — the caller flags the run distinctly rather than
    /// retrying.
    async fn authenticate(&self, company_id: CompanyId) -> Result<Session, FetchError>;

    /// Fetch one page of documents starting past `request.from_nsu`.
    async fn fetch_page(
        &self,
        session: &Session,
        request: &PageRequest,
    ) -> Result<DocumentPage, FetchError>;

    /// Fetch the rendered PDF for a document. Returns the raw bytes.
    async fn fetch_pdf(&self, session: &Session, chave_acesso: &str)
    -> Result<Vec<u8>, FetchError>;
}
