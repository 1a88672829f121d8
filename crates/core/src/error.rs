//! Ledger error model.

use serde::Serialize;
use thiserror::Error;

use crate::id::{KermesseId, StandId, StockId, TransactionId, UserId};

/// Result type used across the ledger.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Resource that a lookup failed to find.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "resource", content = "id", rename_all = "snake_case")]
pub enum Resource {
    Kermesse(KermesseId),
    Stand(StandId),
    StockItem(StockId),
    Transaction(TransactionId),
    User(UserId),
}

impl core::fmt::Display for Resource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Resource::Kermesse(id) => write!(f, "kermesse {id}"),
            Resource::Stand(id) => write!(f, "stand {id}"),
            Resource::StockItem(id) => write!(f, "stock item {id}"),
            Resource::Transaction(id) => write!(f, "transaction {id}"),
            Resource::User(id) => write!(f, "user {id}"),
        }
    }
}

/// Which membership check refused the caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Denial {
    NotParticipant,
    NotOrganizer,
    NotStandHolder,
}

impl core::fmt::Display for Denial {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Denial::NotParticipant => "user is not a participant of the kermesse",
            Denial::NotOrganizer => "user is not an organizer of the kermesse",
            Denial::NotStandHolder => "user does not hold this stand",
        })
    }
}

/// Ledger-level error.
///
/// Every store, workflow and service operation returns this tagged error so the
/// (external) transport layer can map the kind to a user-facing status.
/// Only `Conflict` is retried, and only by the service's unit-of-work loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{0} not found")]
    NotFound(Resource),

    #[error("permission denied: {0}")]
    PermissionDenied(Denial),

    /// Illegal status transition for the transaction's kind.
    #[error("invalid transaction status: cannot move {kind} transaction from {from} to {to}")]
    InvalidTransactionStatus {
        kind: String,
        from: String,
        to: String,
    },

    #[error("insufficient tokens: available {available}, required {required}")]
    InsufficientTokens { available: i64, required: i64 },

    #[error("insufficient stock: available {available}, requested {requested}")]
    InsufficientStock { available: i64, requested: i64 },

    /// The role carries no token balance (or is otherwise not allowed in a money operation).
    #[error("invalid user role: {0}")]
    InvalidUserRole(String),

    #[error("parent is not the parent of this student")]
    NotParentOfStudent,

    /// Malformed transaction or request (self-transfer, non-positive amount, ...).
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("stand does not belong to the kermesse")]
    StandNotInKermesse,

    #[error("points can only be attributed by activity stands")]
    NotActivityStand,

    /// Optimistic concurrency check failed (a row changed under the unit of work).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("operation timed out")]
    Timeout,

    /// Storage-level failure. The unit of work was aborted.
    #[error("storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    pub fn invalid_transaction(msg: impl Into<String>) -> Self {
        Self::InvalidTransaction(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether re-running the whole unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Conflict(_))
    }

    /// Stable machine-readable code for the error kind.
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::NotFound(_) => "not_found",
            LedgerError::PermissionDenied(_) => "permission_denied",
            LedgerError::InvalidTransactionStatus { .. } => "invalid_transaction_status",
            LedgerError::InsufficientTokens { .. } => "insufficient_tokens",
            LedgerError::InsufficientStock { .. } => "insufficient_stock",
            LedgerError::InvalidUserRole(_) => "invalid_user_role",
            LedgerError::NotParentOfStudent => "not_parent_of_student",
            LedgerError::InvalidTransaction(_) => "invalid_transaction",
            LedgerError::StandNotInKermesse => "stand_not_in_kermesse",
            LedgerError::NotActivityStand => "not_activity_stand",
            LedgerError::Conflict(_) => "conflict",
            LedgerError::Timeout => "timeout",
            LedgerError::Storage(_) => "internal",
        }
    }
}
