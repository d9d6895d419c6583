//! Storage collaborator interface.
//!
//! The executor never touches keys itself: it opens transaction scopes on a
//! [`SchemaStorage`], declares the spans each operation will access, and hands
//! the operations over. [`MemoryStorage`] is the reference implementation used
//! by tests and dry runs.

mod memory;
mod spanset;

pub mod keys;

pub use memory::{Fault, FaultKind, MemoryStorage, StorageStats};
pub use spanset::{printable, AccessSet, Span, SpanSet};

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::opgen::{Operation, Phase};

/// Errors surfaced by a storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Contention or a transient outage; the work may be retried.
    #[error("transient storage error: {0}")]
    Transient(String),

    /// The work did not finish in time; it may be retried.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// An operation touched a key outside its declared spans.
    #[error("undeclared {access} access to {key}")]
    AccessViolation {
        /// `"read"` or `"write"`.
        access: &'static str,
        /// The offending key or span.
        key: String,
    },

    /// Validation found data that violates the element being validated.
    #[error("validation failed: {0}")]
    Violation(String),

    /// Any other permanent failure.
    #[error("storage failure: {0}")]
    Fatal(String),
}

impl StorageError {
    /// Whether repeating the same work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient(_) | StorageError::Timeout(_))
    }
}

/// The kind of transaction a stage runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// The user's own statement transaction.
    Statement,
    /// The user's transaction, just before it commits.
    PreCommit,
    /// A background job transaction.
    Background,
}

impl From<Phase> for ScopeKind {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Statement => ScopeKind::Statement,
            Phase::PreCommit => ScopeKind::PreCommit,
            Phase::PostCommit | Phase::Validation => ScopeKind::Background,
        }
    }
}

/// Something that can open transactions against the catalog and table data.
pub trait SchemaStorage: Send + Sync {
    /// Open a transaction scope.
    fn begin(&self, scope: ScopeKind) -> Result<Box<dyn TransactionScope + '_>, StorageError>;
}

/// One open transaction.
///
/// Writes become visible atomically on [`commit`](TransactionScope::commit)
/// and are discarded on [`abort`](TransactionScope::abort) or on drop.
pub trait TransactionScope {
    /// Advertise the spans the following operations will access. Access
    /// outside declared spans fails with [`StorageError::AccessViolation`].
    fn declare(&mut self, access: &AccessSet);

    /// Abandon work still running at `deadline` with
    /// [`StorageError::Timeout`]. Scopes that cannot interrupt work may ignore
    /// this; the executor also refuses to commit a unit that ran past its
    /// deadline.
    fn set_deadline(&mut self, _deadline: Instant) {}

    /// Apply one operation within the transaction.
    fn execute(&mut self, op: &Operation) -> Result<(), StorageError>;

    /// Commit all buffered writes.
    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Discard all buffered writes.
    fn abort(self: Box<Self>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(StorageError::Transient("busy".into()).is_retryable());
        assert!(StorageError::Timeout(Duration::from_millis(5)).is_retryable());
        assert!(!StorageError::Violation("dup".into()).is_retryable());
        assert!(!StorageError::Fatal("disk".into()).is_retryable());
    }

    #[test]
    fn test_scope_for_phase() {
        assert_eq!(ScopeKind::from(Phase::Statement), ScopeKind::Statement);
        assert_eq!(ScopeKind::from(Phase::PreCommit), ScopeKind::PreCommit);
        assert_eq!(ScopeKind::from(Phase::PostCommit), ScopeKind::Background);
        assert_eq!(ScopeKind::from(Phase::Validation), ScopeKind::Background);
    }
}
