//! Operation generation.
//!
//! For every element kind and direction of travel the registry holds an
//! ordered sequence of status arcs. Each arc names the status it reaches, the
//! earliest phase it may run in, whether it can be undone, and the operations
//! it emits. Resolving a target against the registry yields the arcs between
//! the element's current status and its target.

mod ops;
mod standard;

pub use ops::{DescriptorKind, OpClass, Operation, SubObject};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::element::{Direction, Element, ElementKind, Status, TargetState};
use crate::error::PlanError;

/// Execution phase of a stage. Phases are totally ordered.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Inside the user's statement transaction.
    Statement,
    /// Inside the user's transaction, immediately before commit.
    PreCommit,
    /// In background jobs after the user's transaction committed.
    PostCommit,
    /// In background jobs, validating data against new elements.
    Validation,
}

impl Phase {
    /// Every phase, in execution order.
    pub const ALL: [Phase; 4] = [
        Phase::Statement,
        Phase::PreCommit,
        Phase::PostCommit,
        Phase::Validation,
    ];

    /// Whether stages of this phase run after the user's transaction, as
    /// background work.
    pub fn is_async(&self) -> bool {
        matches!(self, Phase::PostCommit | Phase::Validation)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Statement => write!(f, "statement"),
            Phase::PreCommit => write!(f, "pre-commit"),
            Phase::PostCommit => write!(f, "post-commit"),
            Phase::Validation => write!(f, "validation"),
        }
    }
}

/// The statement a schema change was planned for, recorded in the event log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementContext {
    /// Statement text.
    pub statement: String,
    /// User who issued it.
    pub username: String,
    /// Position of the statement within its transaction.
    pub statement_id: u32,
    /// Schema-change job the plan belongs to. Every attempt at a change is a
    /// new job; zero asks the planner to assign one.
    #[serde(default)]
    pub job_id: u64,
}

impl StatementContext {
    pub fn new(statement: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            username: username.into(),
            statement_id: 0,
            job_id: 0,
        }
    }

    /// Attach to an existing job, e.g. to resume it after a restart.
    pub fn with_job_id(mut self, job_id: u64) -> Self {
        self.job_id = job_id;
        self
    }
}

/// A job id not handed out before by this process.
///
/// Ids are wall-clock microseconds, bumped past the last id issued.
pub fn next_job_id() -> u64 {
    static LAST: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default();
    let last = LAST
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or_else(|last| last);
    now.max(last + 1)
}

/// Builds the operations for one arc of one element.
pub type EmitFn = fn(&Element, &StatementContext) -> Vec<Operation>;

/// One status-to-status step of a transition sequence.
#[derive(Clone)]
pub struct ArcSpec {
    to: Status,
    min_phase: Phase,
    revertible: bool,
    emit: Option<EmitFn>,
}

impl ArcSpec {
    /// An arc reaching `to`, revertible, allowed from the statement phase on,
    /// emitting nothing.
    pub fn to(to: Status) -> Self {
        Self {
            to,
            min_phase: Phase::Statement,
            revertible: true,
            emit: None,
        }
    }

    /// Earliest phase the arc may run in.
    pub fn min_phase(mut self, phase: Phase) -> Self {
        self.min_phase = phase;
        self
    }

    /// Mark the arc as impossible to undo.
    pub fn non_revertible(mut self) -> Self {
        self.revertible = false;
        self
    }

    /// Operations the arc emits.
    pub fn emit(mut self, emit: EmitFn) -> Self {
        self.emit = Some(emit);
        self
    }

    /// Status reached.
    pub fn target(&self) -> Status {
        self.to
    }

    fn ops(&self, element: &Element, ctx: &StatementContext) -> Vec<Operation> {
        self.emit.map(|f| f(element, ctx)).unwrap_or_default()
    }
}

impl std::fmt::Debug for ArcSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArcSpec")
            .field("to", &self.to)
            .field("min_phase", &self.min_phase)
            .field("revertible", &self.revertible)
            .field("emits", &self.emit.is_some())
            .finish()
    }
}

/// Ordered arcs of one kind in one direction.
#[derive(Debug, Clone)]
pub struct TransitionSpec {
    direction: Direction,
    start: Status,
    arcs: Vec<ArcSpec>,
    equivalences: Vec<(Status, Status)>,
    entries: Vec<(Status, ArcSpec)>,
}

impl TransitionSpec {
    /// A sequence towards PUBLIC starting at `start`.
    pub fn to_public(start: Status) -> Self {
        Self::new(Direction::ToPublic, start)
    }

    /// A sequence towards ABSENT starting at `start`.
    pub fn to_absent(start: Status) -> Self {
        Self::new(Direction::ToAbsent, start)
    }

    /// A sequence towards TRANSIENT_ABSENT starting at `start`.
    pub fn to_transient_absent(start: Status) -> Self {
        Self::new(Direction::ToTransientAbsent, start)
    }

    fn new(direction: Direction, start: Status) -> Self {
        Self {
            direction,
            start,
            arcs: Vec::new(),
            equivalences: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Append an arc.
    pub fn arc(mut self, arc: ArcSpec) -> Self {
        self.arcs.push(arc);
        self
    }

    /// Treat an element currently at `status` as if it were at `as_status`.
    pub fn equiv(mut self, status: Status, as_status: Status) -> Self {
        self.equivalences.push((status, as_status));
        self
    }

    /// An arc that joins the sequence from a status not on it (for example
    /// reviving a descriptor marked as dropped).
    pub fn entry(mut self, from: Status, arc: ArcSpec) -> Self {
        self.entries.push((from, arc));
        self
    }

    /// Direction of travel.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Arcs in order.
    pub fn arcs(&self) -> &[ArcSpec] {
        &self.arcs
    }

    fn resolve(&self, status: Status) -> Status {
        self.equivalences
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, as_status)| *as_status)
            .unwrap_or(status)
    }

    /// Index of the first arc to take from `status`.
    fn position(&self, status: Status) -> Option<usize> {
        if status == self.start {
            return Some(0);
        }
        self.arcs.iter().position(|a| a.to == status).map(|p| p + 1)
    }

    fn check(&self, kind: ElementKind) -> Result<(), PlanError> {
        let invalid = |reason: String| PlanError::InvalidRegistry {
            kind,
            direction: self.direction,
            reason,
        };
        let last = self
            .arcs
            .last()
            .ok_or_else(|| invalid("no arcs".to_string()))?;
        if last.to != self.direction.terminal() {
            return Err(invalid(format!(
                "sequence ends at {} instead of {}",
                last.to,
                self.direction.terminal()
            )));
        }
        let mut seen = vec![self.start];
        for arc in &self.arcs {
            if seen.contains(&arc.to) {
                return Err(invalid(format!("{} reached twice", arc.to)));
            }
            seen.push(arc.to);
        }
        for (from, arc) in &self.entries {
            if seen.contains(from) || !seen.contains(&arc.to) {
                return Err(invalid(format!("entry arc {from} -> {} does not join", arc.to)));
            }
        }
        Ok(())
    }
}

/// An arc resolved for a concrete element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArc {
    /// Status the arc leaves.
    pub from: Status,
    /// Status the arc reaches.
    pub to: Status,
    /// Earliest phase.
    pub min_phase: Phase,
    /// Whether the arc can be undone.
    pub revertible: bool,
    /// Operations emitted.
    pub ops: Vec<Operation>,
}

/// Transition sequences for every kind and direction.
#[derive(Debug, Clone, Default)]
pub struct OpRegistry {
    specs: HashMap<(ElementKind, Direction), TransitionSpec>,
}

impl OpRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in sequences for every element kind, validated.
    pub fn standard() -> Result<Self, PlanError> {
        let registry = standard::registry();
        registry.validate()?;
        Ok(registry)
    }

    /// Register (or replace) the sequence for a kind.
    pub fn register(&mut self, kind: ElementKind, spec: TransitionSpec) -> &mut Self {
        self.specs.insert((kind, spec.direction), spec);
        self
    }

    /// Sequence for a kind and direction.
    pub fn get(&self, kind: ElementKind, direction: Direction) -> Option<&TransitionSpec> {
        self.specs.get(&(kind, direction))
    }

    /// Check every kind has a sequence in both permanent directions and that
    /// each sequence is well formed.
    pub fn validate(&self) -> Result<(), PlanError> {
        for kind in ElementKind::ALL {
            for &direction in kind.directions() {
                if !self.specs.contains_key(&(kind, direction)) {
                    return Err(PlanError::IncompleteRegistry { kind, direction });
                }
            }
        }
        let mut keys: Vec<_> = self.specs.keys().copied().collect();
        keys.sort();
        for key in keys {
            if let Some(spec) = self.specs.get(&key) {
                spec.check(key.0)?;
            }
        }
        Ok(())
    }

    /// Arcs leading from a target's current status to its target status.
    ///
    /// Trivial targets resolve to no arcs. A missing sequence, or a current
    /// status the sequence cannot start from, is an
    /// [`PlanError::UnregisteredTransition`].
    pub fn path(
        &self,
        entry: &TargetState,
        ctx: &StatementContext,
    ) -> Result<Vec<ResolvedArc>, PlanError> {
        let unregistered = || PlanError::UnregisteredTransition {
            element: entry.element.key().to_string(),
            from: entry.current,
            to: entry.target,
        };
        let direction = entry.direction().ok_or_else(unregistered)?;
        if entry.is_trivial() {
            return Ok(Vec::new());
        }
        let spec = self
            .get(entry.element.kind(), direction)
            .ok_or_else(unregistered)?;

        let start = spec.resolve(entry.current);
        if start == entry.target {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut from = entry.current;
        let position = match spec.position(start) {
            Some(position) => position,
            None => {
                let (_, arc) = spec
                    .entries
                    .iter()
                    .find(|(status, _)| *status == start)
                    .ok_or_else(unregistered)?;
                out.push(resolve_arc(arc, from, &entry.element, ctx));
                from = arc.to;
                spec.position(arc.to).ok_or_else(unregistered)?
            }
        };

        for arc in &spec.arcs[position..] {
            out.push(resolve_arc(arc, from, &entry.element, ctx));
            from = arc.to;
        }
        if out.is_empty() {
            return Err(unregistered());
        }
        Ok(out)
    }
}

fn resolve_arc(
    arc: &ArcSpec,
    from: Status,
    element: &Element,
    ctx: &StatementContext,
) -> ResolvedArc {
    ResolvedArc {
        from,
        to: arc.to,
        min_phase: arc.min_phase,
        revertible: arc.revertible,
        ops: arc.ops(element, ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Column, SecondaryIndex, Table, TemporaryIndex};

    fn column() -> Element {
        Element::Column(Column {
            table_id: 52,
            column_id: 2,
            name: "c2".to_string(),
        })
    }

    fn index() -> Element {
        Element::SecondaryIndex(SecondaryIndex {
            table_id: 52,
            index_id: 2,
            key_column_ids: vec![2],
            storing_column_ids: vec![],
            unique: false,
            temp_index_id: Some(3),
        })
    }

    fn statuses(arcs: &[ResolvedArc]) -> Vec<Status> {
        arcs.iter().map(|a| a.to).collect()
    }

    #[test]
    fn test_standard_registry_is_complete() {
        let registry = OpRegistry::standard().unwrap();
        for kind in ElementKind::ALL {
            for &direction in kind.directions() {
                assert!(registry.get(kind, direction).is_some(), "{kind:?} {direction:?}");
            }
        }
        assert!(registry
            .get(ElementKind::TemporaryIndex, Direction::ToPublic)
            .is_none());
    }

    #[test]
    fn test_temporary_index_never_made_public() {
        let registry = OpRegistry::standard().unwrap();
        let temp = Element::TemporaryIndex(TemporaryIndex {
            table_id: 52,
            index_id: 3,
            source_index_id: 2,
            key_column_ids: vec![2],
        });
        assert!(matches!(
            registry.path(&TargetState::adding(temp), &StatementContext::default()),
            Err(PlanError::UnregisteredTransition {
                to: Status::Public,
                ..
            })
        ));
    }

    #[test]
    fn test_incomplete_registry_rejected() {
        let mut registry = OpRegistry::new();
        registry.register(
            ElementKind::Table,
            TransitionSpec::to_public(Status::Absent).arc(ArcSpec::to(Status::Public)),
        );
        assert!(matches!(
            registry.validate(),
            Err(PlanError::IncompleteRegistry {
                kind: ElementKind::Table,
                direction: Direction::ToAbsent
            })
        ));
    }

    #[test]
    fn test_sequence_must_end_at_terminal() {
        let mut registry = standard::registry();
        registry.register(
            ElementKind::Column,
            TransitionSpec::to_public(Status::Absent).arc(ArcSpec::to(Status::WriteOnly)),
        );
        assert!(matches!(
            registry.validate(),
            Err(PlanError::InvalidRegistry { .. })
        ));
    }

    #[test]
    fn test_column_add_path() {
        let registry = OpRegistry::standard().unwrap();
        let ctx = StatementContext::default();
        let arcs = registry.path(&TargetState::adding(column()), &ctx).unwrap();
        assert_eq!(
            statuses(&arcs),
            vec![Status::DeleteOnly, Status::WriteOnly, Status::Public]
        );
        assert_eq!(arcs[0].from, Status::Absent);
        assert_eq!(arcs[0].min_phase, Phase::Statement);
        assert!(arcs[0].ops.iter().any(|op| op.name() == "AddColumn"));
        assert!(arcs.iter().all(|a| a.revertible));
    }

    #[test]
    fn test_path_from_intermediate_status() {
        let registry = OpRegistry::standard().unwrap();
        let entry = TargetState::new(column(), Status::WriteOnly, Status::Absent);
        let arcs = registry
            .path(&entry, &StatementContext::default())
            .unwrap();
        assert_eq!(statuses(&arcs), vec![Status::DeleteOnly, Status::Absent]);
        assert_eq!(arcs[0].from, Status::WriteOnly);
        assert!(!arcs[0].revertible);
    }

    #[test]
    fn test_equivalent_status_resolves() {
        let registry = OpRegistry::standard().unwrap();
        let entry = TargetState::new(index(), Status::Backfilled, Status::Absent);
        let arcs = registry
            .path(&entry, &StatementContext::default())
            .unwrap();
        assert_eq!(statuses(&arcs), vec![Status::Absent]);
        assert_eq!(arcs[0].from, Status::Backfilled);
        let names: Vec<_> = arcs[0].ops.iter().map(Operation::name).collect();
        assert!(names.contains(&"ClearIndexData"));
        assert!(names.contains(&"RemoveIndex"));
    }

    #[test]
    fn test_transient_absent_counts_as_absent() {
        let registry = OpRegistry::standard().unwrap();
        let temp = Element::TemporaryIndex(TemporaryIndex {
            table_id: 52,
            index_id: 3,
            source_index_id: 2,
            key_column_ids: vec![2],
        });
        let entry = TargetState::new(temp, Status::TransientAbsent, Status::Absent);
        assert!(registry
            .path(&entry, &StatementContext::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_dropped_table_can_be_revived() {
        let registry = OpRegistry::standard().unwrap();
        let table = Element::Table(Table {
            table_id: 52,
            name: "t".to_string(),
        });
        let entry = TargetState::new(table, Status::Dropped, Status::Public);
        let arcs = registry
            .path(&entry, &StatementContext::default())
            .unwrap();
        assert_eq!(statuses(&arcs), vec![Status::Public]);
        assert_eq!(arcs[0].from, Status::Dropped);
    }

    #[test]
    fn test_unregistered_transition() {
        let registry = OpRegistry::standard().unwrap();
        let entry = TargetState::new(column(), Status::Absent, Status::WriteOnly);
        assert!(matches!(
            registry.path(&entry, &StatementContext::default()),
            Err(PlanError::UnregisteredTransition { .. })
        ));

        let entry = TargetState::new(column(), Status::Merged, Status::Public);
        assert!(matches!(
            registry.path(&entry, &StatementContext::default()),
            Err(PlanError::UnregisteredTransition { .. })
        ));
    }

    #[test]
    fn test_trivial_target_has_no_arcs() {
        let registry = OpRegistry::standard().unwrap();
        let arcs = registry
            .path(&TargetState::existing(column()), &StatementContext::default())
            .unwrap();
        assert!(arcs.is_empty());
    }
}
