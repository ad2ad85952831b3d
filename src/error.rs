//! Error taxonomy. One enum, one `Result` alias, all the way down.

use thiserror::Error;

/// Authorization failure codes from the expansion grant check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCode {
    Expired,
    MissingConversationScope,
    ConversationOutOfScope,
    DepthExceeded,
    TokenCapExceeded,
}

impl AuthCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthCode::Expired => "expired",
            AuthCode::MissingConversationScope => "missing_conversation_scope",
            AuthCode::ConversationOutOfScope => "conversation_out_of_scope",
            AuthCode::DepthExceeded => "depth_exceeded",
            AuthCode::TokenCapExceeded => "token_cap_exceeded",
        }
    }
}

impl std::fmt::Display for AuthCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum LcmError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("scope error: {0}")]
    Scope(String),

    #[error("authorization error: {0}")]
    Authorization(AuthCode),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage busy: {0}")]
    StorageBusy(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage corruption: {0}")]
    StorageCorruption(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("external timeout: {0}")]
    ExternalTimeout(String),

    #[error("external error: {0}")]
    ExternalError(String),
}

impl LcmError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn scope(msg: impl Into<String>) -> Self {
        Self::Scope(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LcmError::StorageBusy(_))
    }
}

pub type LcmResult<T> = Result<T, LcmError>;

/// Maps sqlx's coarse error variants onto the taxonomy: constraint violations
/// are fatal data-integrity problems, everything else (pool exhaustion, lock
/// contention, io) is treated as transient and retried by the caller.
impl From<sqlx::Error> for LcmError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                if db_err.is_unique_violation() || db_err.is_foreign_key_violation() {
                    LcmError::InvariantViolation(db_err.to_string())
                } else if db_err.message().contains("database is locked")
                    || db_err.message().contains("busy")
                {
                    LcmError::StorageBusy(db_err.to_string())
                } else {
                    LcmError::StorageCorruption(db_err.to_string())
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                LcmError::StorageUnavailable(err.to_string())
            }
            sqlx::Error::RowNotFound => LcmError::NotFound("row not found".to_string()),
            sqlx::Error::Migrate(_) => LcmError::SchemaMismatch(err.to_string()),
            other => LcmError::StorageUnavailable(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for LcmError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        LcmError::SchemaMismatch(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_busy_is_retryable() {
        let err = LcmError::StorageBusy("locked".into());
        assert!(err.is_retryable());
        assert!(!LcmError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn auth_code_display() {
        assert_eq!(AuthCode::Expired.as_str(), "expired");
        assert_eq!(format!("{}", AuthCode::DepthExceeded), "depth_exceeded");
    }
}
