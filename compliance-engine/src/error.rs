//! Engine error taxonomy
//!
//! Every failure the engine surfaces falls into one [`ErrorKind`]. Business
//! refusals are normally returned as structured results; the `NotAdmissible`
//! variant exists for callers that want to lift a refusal into an error.

use serde::{Deserialize, Serialize};

use crate::ledger::LedgerError;

/// Sub-kinds of persistence constraint failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    Check,
    NotNull,
    Other,
}

/// Error types for engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed input, caught before any external call
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Business-rule refusal
    #[error("Not admissible: {0}")]
    NotAdmissible(String),

    /// Persistence constraint failure
    #[error("Constraint violation ({kind:?}): {detail}")]
    Constraint { kind: ConstraintKind, detail: String },

    /// Optimistic-lock loss; the caller may retry
    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    /// Database busy or locked
    #[error("Database busy: {0}")]
    Deadlock(String),

    /// Ledger call timed out
    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    /// Ledger transport failure after retries
    #[error("Ledger unreachable: {0}")]
    LedgerUnreachable(String),

    /// Chain reorganization observed
    #[error("Chain reorganization at block {block}")]
    ReorgDetected { block: u64 },

    /// Other storage failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Misconfiguration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// The error taxonomy exposed to callers and donors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    NotAdmissible,
    ConstraintViolation,
    ConcurrentModification,
    Deadlock,
    NetworkTimeout,
    LedgerUnreachable,
    ReorgDetected,
    Internal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::ValidationError,
            EngineError::NotAdmissible(_) => ErrorKind::NotAdmissible,
            EngineError::Constraint { .. } => ErrorKind::ConstraintViolation,
            EngineError::ConcurrentModification(_) => ErrorKind::ConcurrentModification,
            EngineError::Deadlock(_) => ErrorKind::Deadlock,
            EngineError::NetworkTimeout(_) => ErrorKind::NetworkTimeout,
            EngineError::LedgerUnreachable(_) => ErrorKind::LedgerUnreachable,
            EngineError::ReorgDetected { .. } => ErrorKind::ReorgDetected,
            EngineError::Storage(_) | EngineError::Config(_) => ErrorKind::Internal,
        }
    }

    /// Donor-safe rendering: the kind plus a fixed message, never the
    /// underlying error text.
    pub fn donor_notice(&self) -> DonorNotice {
        DonorNotice::for_kind(self.kind())
    }
}

/// What a donor is allowed to see about a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DonorNotice {
    pub kind: ErrorKind,
    pub message: &'static str,
}

impl DonorNotice {
    pub fn for_kind(kind: ErrorKind) -> Self {
        let message = match kind {
            ErrorKind::ValidationError => "Some of the contribution details are invalid.",
            ErrorKind::NotAdmissible => "This contribution cannot be accepted.",
            ErrorKind::ConstraintViolation => "This contribution was already recorded.",
            ErrorKind::ConcurrentModification => {
                "Your contribution changed while we were processing it. Please try again."
            }
            ErrorKind::Deadlock | ErrorKind::Internal => {
                "We could not process your contribution right now. Please try again later."
            }
            ErrorKind::NetworkTimeout => {
                "Your transaction is still being confirmed. Check its status before trying again."
            }
            ErrorKind::LedgerUnreachable => {
                "Contribution limits could not be verified right now, so the contribution was not accepted."
            }
            ErrorKind::ReorgDetected => "Your contribution is being re-verified.",
        };
        Self { kind, message }
    }
}

/// Whether an error is transient and worth retrying under a [`crate::retry::RetryPolicy`].
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for EngineError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Deadlock(_)
                | EngineError::NetworkTimeout(_)
                | EngineError::LedgerUnreachable(_)
                | EngineError::Storage(_)
        )
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ffi;
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    EngineError::Deadlock(err.to_string())
                }
                ErrorCode::ConstraintViolation => {
                    let kind = match code.extended_code {
                        ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                            ConstraintKind::Unique
                        }
                        ffi::SQLITE_CONSTRAINT_FOREIGNKEY => ConstraintKind::ForeignKey,
                        ffi::SQLITE_CONSTRAINT_CHECK => ConstraintKind::Check,
                        ffi::SQLITE_CONSTRAINT_NOTNULL => ConstraintKind::NotNull,
                        _ => ConstraintKind::Other,
                    };
                    EngineError::Constraint {
                        kind,
                        detail: err.to_string(),
                    }
                }
                _ => EngineError::Storage(err.to_string()),
            },
            _ => EngineError::Storage(err.to_string()),
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InvalidInput(msg) => EngineError::Validation(msg),
            LedgerError::Timeout(msg) => EngineError::NetworkTimeout(msg),
            LedgerError::Rejected(reason) => EngineError::NotAdmissible(reason),
            LedgerError::NotInitialized => {
                EngineError::Config("ledger client used before connect()".to_string())
            }
            LedgerError::Transport(msg) | LedgerError::InvalidResponse(msg) => {
                EngineError::LedgerUnreachable(msg)
            }
        }
    }
}
