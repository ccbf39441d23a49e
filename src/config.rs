//! Configuration types for fiscal-dl
//!
//! The engine never reads global mutable settings mid-run: callers resolve
//! the external flat key-value store into a [`Config`] snapshot (via
//! [`Config::from_settings`]) and the engine captures that snapshot per
//! dispatch, so a run's behavior is deterministic for its lifetime.

use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr, path::PathBuf, time::Duration};
use utoipa::ToSchema;

use crate::error::Error;
use crate::types::DocumentType;

/// Worker pool configuration (concurrency, admission stagger)
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct PoolConfig {
    /// Maximum companies fetched concurrently (default: 3, valid range 1–10)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_companies: usize,

    /// Delay between admitting consecutive companies (default: 3s)
    #[serde(default = "default_inter_company_delay", with = "duration_serde")]
    pub inter_company_delay: Duration,
}

impl PoolConfig {
    /// Pool size clamped to the valid 1–10 range
    pub fn effective_pool_size(&self) -> usize {
        self.max_concurrent_companies.clamp(1, 10)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_companies: default_max_concurrent(),
            inter_company_delay: default_inter_company_delay(),
        }
    }
}

/// Per-company worker configuration (deadline, pacing, PDF policy)
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct WorkerConfig {
    /// Baseline per-company deadline (default: 180s)
    #[serde(default = "default_company_timeout", with = "duration_serde")]
    pub per_company_timeout: Duration,

    /// Scale the deadline with the expected document volume (default: true)
    #[serde(default = "default_true")]
    pub dynamic_timeout: bool,

    /// Step function extending the deadline by expected volume.
    ///
    /// Each entry is (document threshold, extra seconds); the largest
    /// threshold not exceeding the expected count wins. The breakpoints are
    /// tunable constants, not hard-coded law.
    #[serde(default = "default_timeout_steps")]
    pub dynamic_timeout_steps: Vec<TimeoutStep>,

    /// Delay between pages of one company (default: 300ms)
    #[serde(default = "default_inter_page_delay", with = "duration_millis_serde")]
    pub inter_page_delay: Duration,

    /// Delay between PDF fetches within a page (default: 500ms)
    #[serde(default = "default_inter_pdf_delay", with = "duration_millis_serde")]
    pub inter_pdf_delay: Duration,

    /// Whether to fetch the rendered PDF for each document (default: true)
    #[serde(default = "default_true")]
    pub fetch_pdfs: bool,

    /// Skip a document's PDF after it fails `pdf_failure_limit` times instead
    /// of failing the run (default: true)
    #[serde(default = "default_true")]
    pub skip_failed_pdfs: bool,

    /// PDF attempts per document before the skip policy applies (default: 2)
    #[serde(default = "default_pdf_failure_limit")]
    pub pdf_failure_limit: u32,
}

impl WorkerConfig {
    /// Deadline for one company's run, given the expected document volume.
    ///
    /// Returns the baseline timeout when dynamic scaling is disabled or the
    /// volume is unknown.
    pub fn deadline_for(&self, expected_docs: Option<i64>) -> Duration {
        let baseline = self.per_company_timeout;

        if !self.dynamic_timeout {
            return baseline;
        }
        let Some(docs) = expected_docs else {
            return baseline;
        };

        let mut extra = Duration::ZERO;
        for step in &self.dynamic_timeout_steps {
            if docs >= step.min_docs {
                extra = Duration::from_secs(step.extra_secs);
            }
        }
        baseline + extra
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            per_company_timeout: default_company_timeout(),
            dynamic_timeout: true,
            dynamic_timeout_steps: default_timeout_steps(),
            inter_page_delay: default_inter_page_delay(),
            inter_pdf_delay: default_inter_pdf_delay(),
            fetch_pdfs: true,
            skip_failed_pdfs: true,
            pdf_failure_limit: default_pdf_failure_limit(),
        }
    }
}

/// One breakpoint of the dynamic-timeout step function
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TimeoutStep {
    /// Expected document count at which this step applies
    pub min_docs: i64,
    /// Extra seconds added on top of the baseline timeout
    pub extra_secs: u64,
}

/// Auto-resume configuration — one independent copy per document type
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ResumeConfig {
    /// Whether the resume coordinator re-dispatches erro runs (default: false)
    #[serde(default)]
    pub auto_resume: bool,

    /// Wait after the end of a batch before the next round (default: 5 min)
    #[serde(default = "default_resume_wait", with = "duration_serde")]
    pub wait: Duration,

    /// Rounds in bounded mode (default: 2); ignored when `infinite` is set
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,

    /// Repeat until zero companies remain in error (default: false)
    #[serde(default)]
    pub infinite: bool,
}

impl ResumeConfig {
    /// Minimum gap between round starts in infinite mode, enforced
    /// regardless of `wait`
    pub const MIN_ROUND_GAP: Duration = Duration::from_secs(15);

    /// Effective wait before a round: the configured wait, floored at
    /// [`Self::MIN_ROUND_GAP`] when `infinite` is set. Bounded mode uses
    /// the configured wait as-is.
    pub fn effective_wait(&self) -> Duration {
        if self.infinite {
            self.wait.max(Self::MIN_ROUND_GAP)
        } else {
            self.wait
        }
    }
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            auto_resume: false,
            wait: default_resume_wait(),
            max_rounds: default_max_rounds(),
            infinite: false,
        }
    }
}

/// Retry configuration for transient fetch failures within a run
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct PersistenceConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Directory where fetched PDFs are stored
    #[serde(default = "default_pdf_dir")]
    pub pdf_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            pdf_dir: default_pdf_dir(),
        }
    }
}

/// National fiscal API client configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ClientConfig {
    /// Base URL of the national distribution API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request HTTP timeout (default: 30s)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// REST API server configuration
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiConfig {
    /// Whether to serve the REST API (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address (default: 127.0.0.1:8990)
    #[serde(default = "default_bind_address")]
    pub bind_address: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
        }
    }
}

/// Main configuration for the download engine
///
/// Fields are organized into logical sub-configs:
/// - [`pool`](PoolConfig) — concurrency bound, admission stagger
/// - [`worker`](WorkerConfig) — per-company deadline, pacing, PDF policy
/// - [`resume_nfse`](ResumeConfig) / [`resume_cte`](ResumeConfig) — each
///   document type has its own independent resume settings
/// - [`retry`](RetryConfig) — in-run backoff for transient fetch failures
#[derive(Clone, Debug, Default, Serialize, Deserialize, ToSchema)]
pub struct Config {
    /// Worker pool settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Per-company worker settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Auto-resume settings for NFSe runs
    #[serde(default)]
    pub resume_nfse: ResumeConfig,

    /// Auto-resume settings for CT-e runs
    #[serde(default)]
    pub resume_cte: ResumeConfig,

    /// In-run retry/backoff settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Data storage settings
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Fiscal API client settings
    #[serde(default)]
    pub client: ClientConfig,

    /// REST API server settings
    #[serde(default)]
    pub api: ApiConfig,
}

impl Config {
    /// Resume settings for a document type
    pub fn resume_for(&self, doc_type: DocumentType) -> &ResumeConfig {
        match doc_type {
            DocumentType::Nfse => &self.resume_nfse,
            DocumentType::Cte => &self.resume_cte,
        }
    }

    /// Resolve the external flat key-value settings store into a typed
    /// snapshot, starting from defaults.
    ///
    /// Recognized keys (unknown keys are ignored; the store is shared with
    /// other subsystems):
    ///
    /// - `max_concurrent_companies` — integer 1–10
    /// - `inter_company_delay_secs`, `per_company_timeout_secs` — integer seconds
    /// - `dynamic_timeout`, `fetch_pdfs`, `skip_failed_pdfs` — "true"/"false"
    /// - `inter_page_delay_ms`, `inter_pdf_delay_ms` — integer milliseconds
    /// - `pdf_failure_limit` — integer
    /// - `{nfse,cte}.auto_resume`, `{nfse,cte}.infinite_resume` — "true"/"false"
    /// - `{nfse,cte}.resume_wait` — "HH:MM:SS"
    /// - `{nfse,cte}.max_resume_rounds` — integer
    pub fn from_settings(settings: &HashMap<String, String>) -> crate::error::Result<Self> {
        let mut config = Config::default();

        if let Some(v) = settings.get("max_concurrent_companies") {
            config.pool.max_concurrent_companies =
                parse_setting(v, "max_concurrent_companies")?;
        }
        if let Some(v) = settings.get("inter_company_delay_secs") {
            config.pool.inter_company_delay =
                Duration::from_secs(parse_setting(v, "inter_company_delay_secs")?);
        }
        if let Some(v) = settings.get("per_company_timeout_secs") {
            config.worker.per_company_timeout =
                Duration::from_secs(parse_setting(v, "per_company_timeout_secs")?);
        }
        if let Some(v) = settings.get("dynamic_timeout") {
            config.worker.dynamic_timeout = parse_bool(v, "dynamic_timeout")?;
        }
        if let Some(v) = settings.get("inter_page_delay_ms") {
            config.worker.inter_page_delay =
                Duration::from_millis(parse_setting(v, "inter_page_delay_ms")?);
        }
        if let Some(v) = settings.get("inter_pdf_delay_ms") {
            config.worker.inter_pdf_delay =
                Duration::from_millis(parse_setting(v, "inter_pdf_delay_ms")?);
        }
        if let Some(v) = settings.get("fetch_pdfs") {
            config.worker.fetch_pdfs = parse_bool(v, "fetch_pdfs")?;
        }
        if let Some(v) = settings.get("skip_failed_pdfs") {
            config.worker.skip_failed_pdfs = parse_bool(v, "skip_failed_pdfs")?;
        }
        if let Some(v) = settings.get("pdf_failure_limit") {
            config.worker.pdf_failure_limit = parse_setting(v, "pdf_failure_limit")?;
        }

        resolve_resume(settings, "nfse", &mut config.resume_nfse)?;
        resolve_resume(settings, "cte", &mut config.resume_cte)?;

        Ok(config)
    }
}

/// Resolve one document type's resume settings from prefixed keys
fn resolve_resume(
    settings: &HashMap<String, String>,
    prefix: &str,
    resume: &mut ResumeConfig,
) -> crate::error::Result<()> {
    if let Some(v) = settings.get(&format!("{prefix}.auto_resume")) {
        resume.auto_resume = parse_bool(v, &format!("{prefix}.auto_resume"))?;
    }
    if let Some(v) = settings.get(&format!("{prefix}.resume_wait")) {
        resume.wait = parse_hms(v).ok_or_else(|| Error::Config {
            message: format!("invalid HH:MM:SS duration: {v}"),
            key: Some(format!("{prefix}.resume_wait")),
        })?;
    }
    if let Some(v) = settings.get(&format!("{prefix}.max_resume_rounds")) {
        resume.max_rounds = parse_setting(v, &format!("{prefix}.max_resume_rounds"))?;
    }
    if let Some(v) = settings.get(&format!("{prefix}.infinite_resume")) {
        resume.infinite = parse_bool(v, &format!("{prefix}.infinite_resume"))?;
    }
    Ok(())
}

/// Parse an "HH:MM:SS" duration as stored by the settings UI
pub fn parse_hms(value: &str) -> Option<Duration> {
    let mut parts = value.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || minutes >= 60 || seconds >= 60 {
        return None;
    }
    Some(Duration::from_secs(hours * 3600 + minutes * 60 + seconds))
}

fn parse_setting<T: std::str::FromStr>(value: &str, key: &str) -> crate::error::Result<T> {
    value.trim().parse().map_err(|_| Error::Config {
        message: format!("invalid value for {key}: {value}"),
        key: Some(key.to_string()),
    })
}

fn parse_bool(value: &str, key: &str) -> crate::error::Result<bool> {
    match value.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::Config {
            message: format!("invalid boolean for {key}: {other}"),
            key: Some(key.to_string()),
        }),
    }
}

fn default_true() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    3
}

fn default_inter_company_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_company_timeout() -> Duration {
    Duration::from_secs(180)
}

fn default_timeout_steps() -> Vec<TimeoutStep> {
    vec![
        TimeoutStep {
            min_docs: 50,
            extra_secs: 0,
        },
        TimeoutStep {
            min_docs: 200,
            extra_secs: 300,
        },
        TimeoutStep {
            min_docs: 500,
            extra_secs: 900,
        },
    ]
}

fn default_inter_page_delay() -> Duration {
    Duration::from_millis(300)
}

fn default_inter_pdf_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_pdf_failure_limit() -> u32 {
    2
}

fn default_resume_wait() -> Duration {
    Duration::from_secs(300)
}

fn default_max_rounds() -> u32 {
    2
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./fiscal-dl.db")
}

fn default_pdf_dir() -> PathBuf {
    PathBuf::from("./pdfs")
}

fn default_base_url() -> String {
    "https://adn.fiscal.gov.br/api".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_bind_address() -> SocketAddr {
    "127.0.0.1:8990".parse().unwrap_or_else(|_| {
        SocketAddr::from(([127, 0, 0, 1], 8990)) // Fallback, should never happen
    })
}

/// Duration serialization as whole seconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Duration serialization as whole milliseconds (for sub-second delays)
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
