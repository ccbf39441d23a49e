//! Database layer for fiscal-dl
//!
//! Handles SQLite persistence for download runs, NSU cursors, documents and
//! companies.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] — Database lifecycle, schema migrations
//! - [`runs`] — Run Tracker (download log) CRUD and the UI listing order
//! - [`cursors`] — NSU cursor store (monotonic resumption bookmarks)
//! - [`documents`] — Document sink (idempotent upsert on chave_acesso)
//! - [`companies`] — Read access to companies (managed by external CRUD)

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};

use crate::types::{
    CompanyId, DispatchMode, DocumentType, Period, RunId, RunInfo, RunStatus, Trigger,
};

mod companies;
mod cursors;
mod documents;
mod migrations;
mod runs;

/// New download run to be inserted into the database (always pendente)
#[derive(Debug, Clone)]
pub struct NewDownloadRun {
    /// Company this run fetches for
    pub company_id: CompanyId,
    /// Document type to fetch
    pub doc_type: DocumentType,
    /// What initiated the run
    pub trigger: Trigger,
    /// Whether the run is restricted to documents past the cursor
    pub mode: DispatchMode,
    /// Competence period
    pub period: Period,
}

/// Download run record from database
#[derive(Debug, Clone, FromRow)]
pub struct DownloadRun {
    /// Unique database ID
    pub id: i64,
    /// Company this run fetches for
    pub company_id: i64,
    /// Document type code (0 = nfse, 1 = cte)
    pub doc_type: i32,
    /// Status code (0 = pendente .. 4 = cancelado)
    pub status: i32,
    /// Trigger code (0 = manual, 1 = agendado)
    pub trigger_kind: i32,
    /// Whether the run is delta-only (cursor-forward)
    pub delta_only: i32,
    /// Period start (ISO date)
    pub periodo_inicio: String,
    /// Period end (ISO date)
    pub periodo_fim: String,
    /// Documents processed so far
    pub progresso: i64,
    /// Expected document count, if the API reported one
    pub total_esperado: Option<i64>,
    /// Documents seen by this run
    pub total_docs: i64,
    /// Documents newly inserted by this run
    pub docs_novos: i64,
    /// Free-text current-step label
    pub etapa: Option<String>,
    /// Error text if the run failed
    pub erro: Option<String>,
    /// Cursor value observed in this run
    pub ultimo_nsu: Option<i64>,
    /// Whether the run failed on an expired certificate
    pub certificado_vencido: i32,
    /// Unix timestamp when the run was created
    pub criado_em: i64,
    /// Unix timestamp when the run reached a terminal state
    pub finalizado_em: Option<i64>,
}

impl DownloadRun {
    /// Typed run ID
    pub fn run_id(&self) -> RunId {
        RunId(self.id)
    }

    /// Typed status
    pub fn run_status(&self) -> RunStatus {
        RunStatus::from_i32(self.status)
    }

    /// Typed document type
    pub fn document_type(&self) -> DocumentType {
        DocumentType::from_i32(self.doc_type)
    }

    /// Typed dispatch mode
    pub fn dispatch_mode(&self) -> DispatchMode {
        if self.delta_only != 0 {
            DispatchMode::DeltaOnly
        } else {
            DispatchMode::Full
        }
    }

    /// Build the UI-facing view, joining in the company name
    pub fn into_info(self, company_name: String) -> RunInfo {
        RunInfo {
            id: RunId(self.id),
            company_id: CompanyId(self.company_id),
            company_name,
            doc_type: DocumentType::from_i32(self.doc_type),
            status: RunStatus::from_i32(self.status),
            trigger: Trigger::from_i32(self.trigger_kind),
            progresso: self.progresso,
            total_esperado: self.total_esperado,
            total_docs: self.total_docs,
            docs_novos: self.docs_novos,
            etapa: self.etapa,
            erro: self.erro,
            ultimo_nsu: self.ultimo_nsu,
            certificado_vencido: self.certificado_vencido != 0,
            criado_em: timestamp_to_datetime(self.criado_em),
            finalizado_em: self.finalizado_em.map(timestamp_to_datetime),
        }
    }
}

/// Company record from database (managed by external CRUD, read-only here)
#[derive(Debug, Clone, FromRow)]
pub struct Company {
    /// Unique database ID
    pub id: i64,
    /// Display name (razão social)
    pub nome: String,
    /// Tax id (CNPJ)
    pub cnpj: String,
    /// Unix timestamp the active certificate expires at (None = no certificate)
    pub cert_valido_ate: Option<i64>,
    /// Whether the company is active (0 = inactive, 1 = active)
    pub ativo: i32,
}

impl Company {
    /// Typed company ID
    pub fn company_id(&self) -> CompanyId {
        CompanyId(self.id)
    }

    /// Whether the company's certificate is missing or expired at `now`
    pub fn certificate_expired(&self, now: DateTime<Utc>) -> bool {
        match self.cert_valido_ate {
            Some(valid_until) => valid_until <= now.timestamp(),
            None => true,
        }
    }
}

/// NSU cursor record from database
#[derive(Debug, Clone, FromRow)]
pub struct NsuCursorRow {
    /// Company the cursor belongs to
    pub company_id: i64,
    /// Document type code
    pub doc_type: i32,
    /// Last successfully processed NSU
    pub ultimo_nsu: i64,
    /// Unix timestamp of the last advance
    pub updated_at: i64,
}

/// New fiscal document to be inserted into the sink
#[derive(Debug, Clone)]
pub struct NewDocument {
    /// Globally unique access key — the natural idempotency key
    pub chave_acesso: String,
    /// Company the document belongs to
    pub company_id: CompanyId,
    /// Document type
    pub doc_type: DocumentType,
    /// Direction code
    pub direcao: i32,
    /// NSU under which the API distributed the document
    pub nsu: i64,
    /// Raw XML payload
    pub xml: String,
    /// Document number parsed from the payload
    pub numero: Option<String>,
    /// Total value parsed from the payload
    pub valor_total: Option<f64>,
    /// Unix timestamp the document was issued at
    pub emitido_em: Option<i64>,
    /// Counterpart tax id
    pub contraparte: Option<String>,
}

/// Fiscal document record from database
#[derive(Debug, Clone, FromRow)]
pub struct DocumentRow {
    /// Unique database ID
    pub id: i64,
    /// Globally unique access key
    pub chave_acesso: String,
    /// Company the document belongs to
    pub company_id: i64,
    /// Document type code
    pub doc_type: i32,
    /// Direction code
    pub direcao: i32,
    /// NSU under which the API distributed the document
    pub nsu: i64,
    /// Raw XML payload
    pub xml: String,
    /// Path to the stored rendered PDF, if fetched
    pub pdf_path: Option<String>,
    /// Document number
    pub numero: Option<String>,
    /// Total value
    pub valor_total: Option<f64>,
    /// Unix timestamp the document was issued at
    pub emitido_em: Option<i64>,
    /// Counterpart tax id
    pub contraparte: Option<String>,
    /// Unix timestamp the row was inserted
    pub inserido_em: i64,
}

/// Convert a unix timestamp to a UTC datetime, falling back to now on
/// out-of-range values
pub(crate) fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

/// Database handle for fiscal-dl
pub struct Database {
    pool: SqlitePool,
}
