//! Core error types.

use thiserror::Error;

use crate::element::{Direction, ElementKind, Status};
use crate::exec::ExecutionStatus;
use crate::storage::StorageError;

/// Infrastructure errors (checkpoint persistence, configuration).
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

/// Errors raised while building a plan. Nothing has been mutated when one of
/// these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// The dependency graph contains a cycle.
    #[error("cyclic dependency: {}", .chain.join(" -> "))]
    CyclicDependency {
        /// Nodes on the cycle, first node repeated at the end.
        chain: Vec<String>,
    },

    /// No arc sequence is registered for this transition.
    #[error("unregistered transition for {element}: {from} -> {to}")]
    UnregisteredTransition {
        /// The element.
        element: String,
        /// Its current status.
        from: Status,
        /// The requested target.
        to: Status,
    },

    /// An element is missing required identity fields.
    #[error("malformed element {element}: {reason}")]
    MalformedElement {
        /// The element.
        element: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Two targets share one element identity.
    #[error("duplicate target for {element}")]
    DuplicateTarget {
        /// The element identity.
        element: String,
    },

    /// Two related elements are transitioning in conflicting directions.
    #[error("{first} and {second} cannot change together ({rule})")]
    MutuallyExclusive {
        /// Name of the rule that forbids the combination.
        rule: String,
        /// First element.
        first: String,
        /// Second element.
        second: String,
    },

    /// A kind pair connected by a relation has no rule.
    #[error("no dependency rule for {from} -> {to} via {relation}")]
    MissingRule {
        /// Kind on the relation's source side.
        from: ElementKind,
        /// Kind on the relation's target side.
        to: ElementKind,
        /// The relation.
        relation: String,
    },

    /// The operation registry lacks a direction for a kind.
    #[error("no {direction} transitions registered for {kind}")]
    IncompleteRegistry {
        /// The element kind.
        kind: ElementKind,
        /// The missing direction.
        direction: Direction,
    },

    /// A registered transition sequence is malformed.
    #[error("invalid {direction} transitions for {kind}: {reason}")]
    InvalidRegistry {
        /// The element kind.
        kind: ElementKind,
        /// The direction of the sequence.
        direction: Direction,
        /// What is wrong with it.
        reason: String,
    },

    /// A dependency rule can never apply.
    #[error("invalid rule {rule}: {reason}")]
    InvalidRule {
        /// Rule name.
        rule: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A status snapshot does not line up with the model.
    #[error("status snapshot has {found} entries, model has {expected}")]
    StatusMismatch {
        /// Number of model entries.
        expected: usize,
        /// Number of statuses supplied.
        found: usize,
    },
}

/// Errors raised while executing a plan.
#[derive(Debug, Error)]
pub enum ExecError {
    /// Planning (usually of the rollback plan) failed.
    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),

    /// The checkpoint store failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] Error),

    /// An operation failed in storage.
    #[error("stage {stage}: {op} failed after {attempts} attempt(s): {source}")]
    Storage {
        /// Stage index.
        stage: usize,
        /// Summary of the failing operation.
        op: String,
        /// Attempts made before giving up.
        attempts: u32,
        /// Underlying storage error.
        #[source]
        source: StorageError,
    },

    /// The change failed before its point of no return and was rolled back.
    #[error("schema change rolled back: {cause}")]
    RolledBack {
        /// What triggered the rollback.
        cause: String,
    },

    /// The change failed in a way that cannot be undone automatically.
    #[error("schema change requires attention at stage {stage}: {cause}")]
    RequiresAttention {
        /// Stage that failed.
        stage: usize,
        /// What failed.
        cause: String,
    },

    /// The checkpoint does not belong to this plan.
    #[error("checkpoint for plan {plan_id} is at stage {stage}, plan has {stage_count} stages")]
    PlanMismatch {
        /// Plan identifier.
        plan_id: String,
        /// Stage recorded in the checkpoint.
        stage: usize,
        /// Stages in the plan.
        stage_count: usize,
    },

    /// The requested transition is not allowed from the persisted status.
    #[error("cannot resume schema change in {status} state")]
    NotResumable {
        /// Persisted status.
        status: ExecutionStatus,
    },
}

impl ExecError {
    /// Stable user-facing classification.
    pub fn class(&self) -> ErrorClass {
        match self {
            ExecError::Plan(_) => ErrorClass::NothingChanged,
            ExecError::RolledBack { .. } => ErrorClass::RolledBack,
            _ => ErrorClass::RequiresAttention,
        }
    }

    /// Whether retrying the same work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::Storage { source, .. } if source.is_retryable())
    }

    /// Whether the failure may be answered with an automatic rollback.
    ///
    /// Access violations indicate a generator bug and are never rolled back.
    pub fn permits_rollback(&self) -> bool {
        !matches!(
            self,
            ExecError::Storage {
                source: StorageError::AccessViolation { .. },
                ..
            } | ExecError::Checkpoint(_)
                | ExecError::PlanMismatch { .. }
        )
    }
}

impl PlanError {
    /// Planning errors never leave anything changed.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::NothingChanged
    }
}

/// Stable classification reported to the statement or job that triggered a
/// schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Planning failed before any mutation.
    NothingChanged,
    /// Execution started and was undone.
    RolledBack,
    /// Execution failed past the point of no return, or rollback itself failed.
    RequiresAttention,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::NothingChanged => write!(f, "nothing changed"),
            ErrorClass::RolledBack => write!(f, "rolled back"),
            ErrorClass::RequiresAttention => write!(f, "requires attention"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display_includes_chain() {
        let err = PlanError::CyclicDependency {
            chain: vec![
                "Column(52.2) PUBLIC".to_string(),
                "SecondaryIndex(52.2) BACKFILLED".to_string(),
                "Column(52.2) PUBLIC".to_string(),
            ],
        };
        assert_eq!(
            err.to_string(),
            "cyclic dependency: Column(52.2) PUBLIC -> SecondaryIndex(52.2) BACKFILLED -> Column(52.2) PUBLIC"
        );
    }

    #[test]
    fn test_error_classes() {
        let plan = ExecError::Plan(PlanError::DuplicateTarget {
            element: "Column(52.2)".to_string(),
        });
        assert_eq!(plan.class(), ErrorClass::NothingChanged);

        let rolled = ExecError::RolledBack {
            cause: "boom".to_string(),
        };
        assert_eq!(rolled.class(), ErrorClass::RolledBack);

        let stuck = ExecError::RequiresAttention {
            stage: 3,
            cause: "boom".to_string(),
        };
        assert_eq!(stuck.class(), ErrorClass::RequiresAttention);
        assert_eq!(stuck.class().to_string(), "requires attention");
    }

    #[test]
    fn test_access_violation_blocks_rollback() {
        let err = ExecError::Storage {
            stage: 1,
            op: "BackfillIndex".to_string(),
            attempts: 1,
            source: StorageError::AccessViolation {
                access: "write",
                key: "/t/52/i/9/".to_string(),
            },
        };
        assert!(!err.permits_rollback());
        assert!(!err.is_retryable());

        let transient = ExecError::Storage {
            stage: 1,
            op: "BackfillIndex".to_string(),
            attempts: 3,
            source: StorageError::Transient("contention".to_string()),
        };
        assert!(transient.permits_rollback());
        assert!(transient.is_retryable());
    }
}
