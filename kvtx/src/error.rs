//! Error taxonomy for the transaction core.
//!
//! Kept as a single flat enum with hand-written `Display`/`Error` impls,
//! mirroring the style the rest of this crate's ancestor used for its own
//! `Error` type rather than reaching for a derive macro.

use std::fmt;

/// The terminal state a completed transaction record settled into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminalState {
    Committed,
    RolledBack,
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalState::Committed => write!(f, "committed"),
            TerminalState::RolledBack => write!(f, "rolled back"),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// The transaction record has been deleted or never existed.
    TxNotFound(String),

    /// The transaction has already committed; the caller tried to roll it
    /// back or add a request to it.
    TxCommitted(String),

    /// Symmetric to `TxCommitted`.
    TxRolledBack(String),

    /// A terminal state was observed but the specific terminal doesn't
    /// matter to the caller.
    TxCompleted(String, TerminalState),

    /// The record vanished between observing it and acting on it; we can't
    /// tell whether it committed or rolled back.
    TxUnknownCompleted(String),

    /// Lock acquisition failed because another transaction owns the row.
    ItemNotLocked {
        table: String,
        key: String,
        owner: String,
    },

    /// Two mutating requests were added for the same (table, key) within
    /// one transaction.
    DuplicateRequest { table: String, key: String },

    /// Validation failure: missing table, empty key, reserved attribute
    /// name, a conditional predicate on a transactional write, etc.
    InvalidRequest(String),

    /// The transaction record would exceed the backing store's maximum
    /// item size after adding this request.
    ItemSizeExceeded {
        table: String,
        key: String,
        size: usize,
        max: usize,
    },

    /// A conditional write's predicate was not satisfied. Distinguished
    /// from `BackingStore` so the core can retry on it specifically.
    ConditionalCheckFailed(String),

    /// The backing store raised a non-conditional failure.
    BackingStore(String),

    /// Canonical (de)serialization of a request or record failed.
    Serialization(String),

    /// An internal invariant was violated. Not recoverable; indicates a bug
    /// in the protocol implementation, not a caller mistake.
    Assertion(String),
}

pub type CResult<T> = Result<T, Error>;

impl Error {
    /// True for the two kinds that mean "this transaction is done, but I
    /// don't know which way it went."
    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            Error::TxCommitted(_) | Error::TxRolledBack(_) | Error::TxCompleted(_, _)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TxNotFound(txid) => write!(f, "transaction {txid} not found"),
            Error::TxCommitted(txid) => write!(f, "transaction {txid} already committed"),
            Error::TxRolledBack(txid) => write!(f, "transaction {txid} already rolled back"),
            Error::TxCompleted(txid, terminal) => {
                write!(f, "transaction {txid} already {terminal}")
            }
            Error::TxUnknownCompleted(txid) => write!(
                f,
                "transaction {txid} vanished between observation and action; outcome unknown"
            ),
            Error::ItemNotLocked { table, key, owner } => write!(
                f,
                "item {table}/{key} is locked by transaction {owner}"
            ),
            Error::DuplicateRequest { table, key } => write!(
                f,
                "duplicate mutating request for {table}/{key} in the same transaction"
            ),
            Error::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            Error::ItemSizeExceeded { table, key, size, max } => write!(
                f,
                "transaction record would grow to {size} bytes (max {max}) adding a request for {table}/{key}"
            ),
            Error::ConditionalCheckFailed(msg) => write!(f, "conditional check failed: {msg}"),
            Error::BackingStore(msg) => write!(f, "backing store error: {msg}"),
            Error::Serialization(msg) => write!(f, "serialization error: {msg}"),
            Error::Assertion(msg) => write!(f, "internal invariant violated: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_completed_covers_commit_and_rollback_kinds() {
        assert!(Error::TxCommitted("t1".into()).is_completed());
        assert!(Error::TxRolledBack("t1".into()).is_completed());
        assert!(Error::TxCompleted("t1".into(), TerminalState::Committed).is_completed());
        assert!(!Error::TxNotFound("t1".into()).is_completed());
    }

    #[test]
    fn display_mentions_the_txid() {
        let msg = Error::TxNotFound("abc-123".into()).to_string();
        assert!(msg.contains("abc-123"));
    }
}
