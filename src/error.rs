use thiserror::Error;

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(format!("JSON serialization error: {}", err))
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(format!("Database error: {}", err))
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        Self::ServiceError(format!("HTTP error: {}", err))
    }
}

impl From<config::ConfigError> for LedgerError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    /// The event was not committed; retry with a fresh draft.
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),

    /// Aggregation input is missing from the store; backfill before retrying.
    #[error("Incomplete range on chain {chain_id}: sequence {missing} is missing")]
    IncompleteRange { chain_id: String, missing: u64 },

    #[error("Anchor submission failed after {attempts} attempt(s): {reason}")]
    AnchorSubmissionFailure { attempts: u32, reason: String },

    #[error("Hash chain broken at event {0}")]
    ChainBroken(String),

    #[error("Proof invalid: {0}")]
    ProofInvalid(String),

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Retention violation: {0}")]
    RetentionViolation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Timestamp service error: {0}")]
    ServiceError(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl LedgerError {
    /// Errors that indicate the stored history can no longer be trusted.
    pub fn is_tamper_evidence(&self) -> bool {
        matches!(
            self,
            Self::ChainBroken(_) | Self::ProofInvalid(_) | Self::IntegrityViolation(_)
        )
    }

    pub fn missing(chain_id: &str, sequence: u64) -> Self {
        Self::IncompleteRange {
            chain_id: chain_id.to_string(),
            missing: sequence,
        }
    }
}
