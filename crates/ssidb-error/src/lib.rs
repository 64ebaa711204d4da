use std::fmt;

use ssidb_types::{RowId, TxnId};
use thiserror::Error;

/// Primary error type for ssidb transaction operations.
///
/// Conflicts are retryable: the transaction has been aborted and nothing it
/// wrote is visible, so the caller may begin a new transaction and try again.
/// State errors indicate misuse of a transaction handle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MvccError {
    // === Conflicts (retryable) ===
    /// The row's chain head is held by another writer, or was replaced by a
    /// commit newer than this transaction's snapshot.
    #[error("write conflict on row {row}: held by {holder}")]
    WriteConflict { row: RowId, holder: Holder },

    /// SSI validation found a dangerous rw-antidependency structure.
    #[error("serialization failure: {txn} aborted as {reason}")]
    SerializationFailure { txn: TxnId, reason: SsiAbortReason },

    /// The durability layer did not accept the commit record.
    #[error("commit record for {txn} was not durably accepted: {detail}")]
    DurabilityFailure { txn: TxnId, detail: String },

    // === Misuse ===
    /// An operation was issued against a transaction that is not ACTIVE.
    #[error("{txn} is {state}, expected active")]
    InvalidTransactionState { txn: TxnId, state: &'static str },

    /// TxnId space exhausted.
    #[error("transaction id space exhausted")]
    TxnIdExhausted,

    // === Internal ===
    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Who currently owns the contended row slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Holder {
    /// An uncommitted writer holds the chain head.
    Txn(TxnId),
    /// A transaction committed a newer version at this timestamp.
    CommittedAt(u64),
    /// The CAS retry budget was exhausted without observing a stable head.
    Contended,
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Txn(id) => write!(f, "{id}"),
            Self::CommittedAt(ts) => write!(f, "commit at ts#{ts}"),
            Self::Contended => write!(f, "contending writers"),
        }
    }
}

/// Reason for an SSI abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SsiAbortReason {
    /// This transaction is the pivot (has both in + out rw edges).
    Pivot,
    /// A committed transaction this one depends on is a pivot whose outgoing
    /// edge already committed, so this transaction must abort instead.
    CommittedPivot,
}

impl fmt::Display for SsiAbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pivot => f.write_str("pivot"),
            Self::CommittedPivot => f.write_str("reader of committed pivot"),
        }
    }
}

/// Reason code attached to every abort outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    WriteConflict,
    Serialization(SsiAbortReason),
    Durability,
    /// The logged commit could not be applied to the version store.
    Internal,
    /// Requested by the caller.
    User,
}

/// Coarse classification of errors for callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Transient conflict; retry the transaction.
    Busy = 5,
    /// Storage could not persist the commit.
    IoErr = 10,
    /// Library used incorrectly.
    Misuse = 21,
    /// Internal logic error.
    Internal = 2,
    /// Identifier space exhausted.
    Full = 13,
}

impl MvccError {
    /// Map this error to a coarse error code.
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::WriteConflict { .. } | Self::SerializationFailure { .. } => ErrorCode::Busy,
            Self::DurabilityFailure { .. } => ErrorCode::IoErr,
            Self::InvalidTransactionState { .. } => ErrorCode::Misuse,
            Self::TxnIdExhausted => ErrorCode::Full,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether a fresh transaction retrying the same work may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WriteConflict { .. }
                | Self::SerializationFailure { .. }
                | Self::DurabilityFailure { .. }
        )
    }

    /// The abort reason carried by this error, if it forced an abort.
    pub const fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Self::WriteConflict { .. } => Some(AbortReason::WriteConflict),
            Self::SerializationFailure { reason, .. } => Some(AbortReason::Serialization(*reason)),
            Self::DurabilityFailure { .. } => Some(AbortReason::Durability),
            _ => None,
        }
    }

    /// Human-friendly suggestion for handling this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::WriteConflict { .. } | Self::SerializationFailure { .. } => {
                Some("Retry the transaction; the conflict is transient")
            }
            Self::DurabilityFailure { .. } => {
                Some("Retry once the log device accepts writes again")
            }
            Self::InvalidTransactionState { .. } => Some("Begin a new transaction"),
            _ => None,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `MvccError`.
pub type Result<T> = std::result::Result<T, MvccError>;
