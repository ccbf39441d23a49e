//! Core types for fiscal-dl

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Unique identifier for a download run
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct RunId(pub i64);

impl RunId {
    /// Create a new RunId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for RunId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<RunId> for i64 {
    fn from(id: RunId) -> Self {
        id.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for RunId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for RunId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for RunId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Unique identifier for a client company
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct CompanyId(pub i64);

impl CompanyId {
    /// Create a new CompanyId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for CompanyId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for CompanyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl sqlx::Type<sqlx::Sqlite> for CompanyId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for CompanyId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for CompanyId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Status of a download run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created and waiting for a worker slot
    Pendente,
    /// Worker is actively fetching pages
    Executando,
    /// Finished with no unrecovered errors (docs_novos may be zero)
    Concluido,
    /// Finished with an unrecoverable error
    Erro,
    /// Cancelled cooperatively between units of work
    Cancelado,
}

impl RunStatus {
    /// Convert integer status code to RunStatus enum
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => RunStatus::Pendente,
            1 => RunStatus::Executando,
            2 => RunStatus::Concluido,
            3 => RunStatus::Erro,
            4 => RunStatus::Cancelado,
            _ => RunStatus::Erro, // Default to Erro for unknown status
        }
    }

    /// Convert RunStatus enum to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            RunStatus::Pendente => 0,
            RunStatus::Executando => 1,
            RunStatus::Concluido => 2,
            RunStatus::Erro => 3,
            RunStatus::Cancelado => 4,
        }
    }

    /// Whether the run has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Concluido | RunStatus::Erro | RunStatus::Cancelado
        )
    }

    /// Rank used by the UI-facing listing: executando, pendente, concluido,
    /// erro, cancelado.
    pub fn display_rank(&self) -> i32 {
        match self {
            RunStatus::Executando => 0,
            RunStatus::Pendente => 1,
            RunStatus::Concluido => 2,
            RunStatus::Erro => 3,
            RunStatus::Cancelado => 4,
        }
    }
}

/// Fiscal document type served by the national API
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    /// Electronic service invoice (Nota Fiscal de Serviço eletrônica)
    #[default]
    Nfse,
    /// Electronic transport waybill (Conhecimento de Transporte eletrônico)
    Cte,
}

impl DocumentType {
    /// Convert integer code to DocumentType enum
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => DocumentType::Cte,
            _ => DocumentType::Nfse,
        }
    }

    /// Convert DocumentType enum to integer code
    pub fn to_i32(&self) -> i32 {
        match self {
            DocumentType::Nfse => 0,
            DocumentType::Cte => 1,
        }
    }
}

impl std::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentType::Nfse => write!(f, "nfse"),
            DocumentType::Cte => write!(f, "cte"),
        }
    }
}

/// What initiated a dispatch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Explicit user request (default)
    #[default]
    Manual,
    /// Started by a schedule or by the resume coordinator
    Agendado,
}

impl Trigger {
    /// Convert integer code to Trigger enum
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Trigger::Agendado,
            _ => Trigger::Manual,
        }
    }

    /// Convert Trigger enum to integer code
    pub fn to_i32(&self) -> i32 {
        match self {
            Trigger::Manual => 0,
            Trigger::Agendado => 1,
        }
    }
}

/// Direction of a fiscal document relative to the company
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Issued by the company
    Emitida,
    /// Received by the company
    Recebida,
    /// Company appears as a third party (e.g. CT-e tomador)
    Terceiro,
}

impl Direction {
    /// Convert integer code to Direction enum
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => Direction::Recebida,
            2 => Direction::Terceiro,
            _ => Direction::Emitida,
        }
    }

    /// Convert Direction enum to integer code
    pub fn to_i32(&self) -> i32 {
        match self {
            Direction::Emitida => 0,
            Direction::Recebida => 1,
            Direction::Terceiro => 2,
        }
    }
}

/// Whether a dispatch fetches everything in the period or only documents
/// newer than the persisted NSU cursor
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Fetch the full period (default)
    #[default]
    Full,
    /// Fetch only documents past the persisted cursor ("update only new")
    DeltaOnly,
}

impl DispatchMode {
    /// Whether this dispatch only fetches documents past the persisted cursor
    pub fn is_delta_only(&self) -> bool {
        matches!(self, DispatchMode::DeltaOnly)
    }
}

/// Competence period for a dispatch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Period {
    /// First day of the period (inclusive)
    pub inicio: NaiveDate,
    /// Last day of the period (inclusive)
    pub fim: NaiveDate,
}

/// Event emitted during the run lifecycle
///
/// The UI contract is polling (`downloadStatus`); events exist for embedders
/// that want push-style observability without polling the database.
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Run created and queued (pendente)
    RunQueued {
        /// Run ID
        id: RunId,
        /// Company the run belongs to
        company_id: CompanyId,
        /// Document type being fetched
        doc_type: DocumentType,
    },

    /// Worker admitted by the pool, run is executando
    RunStarted {
        /// Run ID
        id: RunId,
    },

    /// A page was fully committed (documents stored, cursor advanced)
    PageCommitted {
        /// Run ID
        id: RunId,
        /// Page number within this run (1-based)
        page: u32,
        /// Documents seen on the page
        docs: u32,
        /// Documents newly inserted from the page
        docs_novos: u32,
        /// Cursor value after the commit
        ultimo_nsu: i64,
    },

    /// Run finished with no unrecovered errors
    RunCompleted {
        /// Run ID
        id: RunId,
        /// Total documents seen
        total_docs: i64,
        /// Documents newly inserted
        docs_novos: i64,
    },

    /// Run finished in error
    RunFailed {
        /// Run ID
        id: RunId,
        /// Human-readable error text
        error: String,
        /// Whether the failure was an expired certificate
        certificado_vencido: bool,
    },

    /// Run was cancelled
    RunCancelled {
        /// Run ID
        id: RunId,
    },

    /// The resume coordinator started a retry round
    ResumeRoundStarted {
        /// Document type the round targets
        doc_type: DocumentType,
        /// Round number (1-based)
        round: u32,
        /// Companies being re-dispatched
        companies: usize,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

/// UI-facing view of a download run (returned by the status endpoint)
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RunInfo {
    /// Unique run identifier
    pub id: RunId,

    /// Company the run belongs to
    pub company_id: CompanyId,

    /// Company display name
    pub company_name: String,

    /// Document type being fetched
    pub doc_type: DocumentType,

    /// Current status
    pub status: RunStatus,

    /// What initiated the run
    pub trigger: Trigger,

    /// Documents processed so far
    pub progresso: i64,

    /// Expected document count, if the API reported one
    pub total_esperado: Option<i64>,

    /// Documents seen by this run
    pub total_docs: i64,

    /// Documents newly inserted by this run
    pub docs_novos: i64,

    /// Free-text current-step label (e.g. "baixando página 3")
    pub etapa: Option<String>,

    /// Error text, if the run failed
    pub erro: Option<String>,

    /// Cursor value observed in this run
    pub ultimo_nsu: Option<i64>,

    /// Whether the run failed because the certificate is expired
    pub certificado_vencido: bool,

    /// When the run was created
    pub criado_em: DateTime<Utc>,

    /// When the run reached a terminal state
    pub finalizado_em: Option<DateTime<Utc>>,
}

/// Engine statistics snapshot
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct EngineStats {
    /// Total runs currently tracked
    pub total: usize,

    /// Runs waiting for a worker slot
    pub pendentes: usize,

    /// Runs actively fetching
    pub executando: usize,

    /// Runs finished successfully
    pub concluidos: usize,

    /// Runs finished in error
    pub erros: usize,

    /// Runs cancelled
    pub cancelados: usize,

    /// Configured worker pool size
    pub pool_size: usize,

    /// Whether the engine is accepting new dispatches
    pub accepting_new: bool,
}
