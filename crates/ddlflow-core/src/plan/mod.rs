//! Staged execution plans.
//!
//! A [`Planner`] turns a set of targets into a [`Plan`]: every element's
//! status path becomes a chain of graph nodes, dependency rules add edges
//! between nodes of related elements, and the graph is cut into ordered
//! stages. Planning is a pure function of the targets; nothing is mutated and
//! the same targets always produce the same stages. The plan id also covers
//! the job, so every attempt at a change is checkpointed separately.

mod describe;
mod graph;

pub use describe::{describe, PlanDescription, StageDescription};

use tracing::{debug, instrument};

use crate::element::{ElementKey, ElementModel, Status, TargetState};
use crate::error::PlanError;
use crate::opgen::{next_job_id, OpRegistry, Operation, Phase, StatementContext};
use crate::rules::{EdgeKind, RuleSet};

/// One status transition of one element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Model position of the element.
    pub element: usize,
    /// Status before the transition.
    pub from: Status,
    /// Status after it.
    pub to: Status,
    /// Earliest phase the transition may run in.
    pub min_phase: Phase,
    /// Whether a rollback can undo it.
    pub revertible: bool,
    /// Operations emitted for it.
    pub ops: Vec<Operation>,
}

/// A dependency between two nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Node that must run first (or together, for same-stage edges).
    pub from: usize,
    /// Node constrained by the edge.
    pub to: usize,
    /// Ordering strength.
    pub kind: EdgeKind,
    /// Rule that produced the edge, or the status-path marker.
    pub reason: &'static str,
}

/// A transition performed by a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Model position of the element.
    pub element: usize,
    pub from: Status,
    pub to: Status,
}

/// A set of transitions executed together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// Position in the plan.
    pub index: usize,
    /// Phase the stage runs in.
    pub phase: Phase,
    /// Transitions in model order.
    pub transitions: Vec<Transition>,
    /// Operations in execution order.
    pub ops: Vec<Operation>,
    /// False if any transition in the stage cannot be undone.
    pub revertible: bool,
}

/// A fully scheduled schema change.
#[derive(Debug, Clone)]
pub struct Plan {
    id: String,
    model: ElementModel,
    context: StatementContext,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    stages: Vec<Stage>,
    node_stage: Vec<usize>,
    point_of_no_return: Option<usize>,
}

impl Plan {
    /// Identifier derived from the target set and the job.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &ElementModel {
        &self.model
    }

    pub fn context(&self) -> &StatementContext {
        &self.context
    }

    /// Job this plan belongs to. Plan the same targets with this job id to
    /// get a plan that resumes from this one's checkpoint.
    pub fn job_id(&self) -> u64 {
        self.context.job_id
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Check if the plan has nothing to do.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Index of the first stage containing a transition that cannot be
    /// undone, if any.
    pub fn point_of_no_return(&self) -> Option<usize> {
        self.point_of_no_return
    }

    /// Stage a node was assigned to.
    pub fn node_stage(&self, node: usize) -> Option<usize> {
        self.node_stage.get(node).copied()
    }

    /// Stage in which an element reaches a status.
    pub fn stage_of(&self, key: &ElementKey, status: Status) -> Option<usize> {
        let element = self.model.position(key)?;
        self.nodes
            .iter()
            .position(|n| n.element == element && n.to == status)
            .and_then(|n| self.node_stage(n))
    }

    /// Whether a failure while executing `stage` may be rolled back.
    pub fn rollback_allowed_on_failure(&self, stage: usize) -> bool {
        self.point_of_no_return.map_or(true, |ponr| stage < ponr)
    }

    /// Whether a cancellation observed before running `stage` may be rolled
    /// back.
    pub fn rollback_allowed_before(&self, stage: usize) -> bool {
        self.point_of_no_return.map_or(true, |ponr| stage <= ponr)
    }

    /// Element statuses once the first `completed` stages have run.
    pub fn statuses_after(&self, completed: usize) -> Vec<Status> {
        let mut statuses = self.model.current_statuses();
        for stage in self.stages.iter().take(completed) {
            for t in &stage.transitions {
                statuses[t.element] = t.to;
            }
        }
        statuses
    }

    /// Human and machine readable description.
    pub fn describe(&self) -> PlanDescription {
        describe(self)
    }
}

/// Front end turning a statement into targets.
pub trait Decomposer {
    /// Produce the targets for a statement.
    fn decompose(&self, ctx: &StatementContext) -> Result<Vec<TargetState>, PlanError>;
}

/// Builds plans from targets using a fixed rule set and registry.
#[derive(Debug, Clone)]
pub struct Planner {
    rules: RuleSet,
    registry: OpRegistry,
}

impl Planner {
    /// Planner with the built-in rules and transitions.
    pub fn new() -> Result<Self, PlanError> {
        Self::with_parts(RuleSet::standard()?, OpRegistry::standard()?)
    }

    /// Planner with custom rules and transitions.
    pub fn with_parts(rules: RuleSet, registry: OpRegistry) -> Result<Self, PlanError> {
        registry.validate()?;
        Ok(Self { rules, registry })
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn registry(&self) -> &OpRegistry {
        &self.registry
    }

    /// Plan a target set with an empty statement context, as a new job.
    pub fn plan(&self, targets: Vec<TargetState>) -> Result<Plan, PlanError> {
        self.plan_with_context(targets, StatementContext::default())
    }

    /// Plan a target set on behalf of a statement. A context without a job
    /// id starts a new job.
    pub fn plan_with_context(
        &self,
        targets: Vec<TargetState>,
        context: StatementContext,
    ) -> Result<Plan, PlanError> {
        let model = ElementModel::new(targets)?;
        self.plan_model(model, context)
    }

    /// Decompose a statement and plan the result.
    pub fn plan_statement(
        &self,
        decomposer: &dyn Decomposer,
        context: StatementContext,
    ) -> Result<Plan, PlanError> {
        let targets = decomposer.decompose(&context)?;
        self.plan_with_context(targets, context)
    }

    /// Plan that undoes `plan` from the statuses it reached.
    pub fn plan_rollback(&self, plan: &Plan, reached: &[Status]) -> Result<Plan, PlanError> {
        let model = plan.model.reversed(reached)?;
        self.plan_model(model, plan.context.clone())
    }

    #[instrument(skip_all, fields(targets = model.len()))]
    fn plan_model(
        &self,
        model: ElementModel,
        mut context: StatementContext,
    ) -> Result<Plan, PlanError> {
        if context.job_id == 0 {
            context.job_id = next_job_id();
        }
        let schedule = graph::build(&model, &self.rules, &self.registry, &context)?;
        let id = plan_id(&model, context.job_id);
        debug!(
            plan_id = %id,
            stages = schedule.stages.len(),
            point_of_no_return = ?schedule.point_of_no_return,
            "planned schema change"
        );
        Ok(Plan {
            id,
            model,
            context,
            nodes: schedule.nodes,
            edges: schedule.edges,
            stages: schedule.stages,
            node_stage: schedule.node_stage,
            point_of_no_return: schedule.point_of_no_return,
        })
    }
}

fn plan_id(model: &ElementModel, job_id: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&job_id.to_le_bytes());
    for entry in model.entries() {
        hasher.update(format!("{:?}|{}|{}\n", entry.element, entry.current, entry.target).as_bytes());
    }
    hex::encode(&hasher.finalize().as_bytes()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{
        CheckConstraint, Column, ColumnType, Element, ElementKind, IndexName, SecondaryIndex,
        Table, TemporaryIndex,
    };

    fn table() -> Element {
        Element::Table(Table {
            table_id: 52,
            name: "t".to_string(),
        })
    }

    fn column() -> Element {
        Element::Column(Column {
            table_id: 52,
            column_id: 2,
            name: "c2".to_string(),
        })
    }

    fn column_type() -> Element {
        Element::ColumnType(ColumnType {
            table_id: 52,
            column_id: 2,
            sql_type: "INT8".to_string(),
            nullable: true,
            type_ref: None,
        })
    }

    fn add_column_and_index() -> Vec<TargetState> {
        vec![
            TargetState::existing(table()),
            TargetState::adding(column()),
            TargetState::adding(column_type()),
            TargetState::adding(Element::SecondaryIndex(SecondaryIndex {
                table_id: 52,
                index_id: 2,
                key_column_ids: vec![2],
                storing_column_ids: vec![],
                unique: false,
                temp_index_id: Some(3),
            })),
            TargetState::transient(Element::TemporaryIndex(TemporaryIndex {
                table_id: 52,
                index_id: 3,
                source_index_id: 2,
                key_column_ids: vec![2],
            })),
            TargetState::adding(Element::IndexName(IndexName {
                table_id: 52,
                index_id: 2,
                name: "idx".to_string(),
            })),
        ]
    }

    fn key(kind: ElementKind, sub_id: u32) -> ElementKey {
        ElementKey {
            kind,
            owner: 52,
            sub_id,
        }
    }

    #[test]
    fn test_plan_add_column_and_index() {
        let planner = Planner::new().unwrap();
        let plan = planner.plan(add_column_and_index()).unwrap();

        let column_public = plan
            .stage_of(&key(ElementKind::Column, 2), Status::Public)
            .unwrap();
        let backfilled = plan
            .stage_of(&key(ElementKind::SecondaryIndex, 2), Status::Backfilled)
            .unwrap();
        let index_public = plan
            .stage_of(&key(ElementKind::SecondaryIndex, 2), Status::Public)
            .unwrap();
        let name_public = plan
            .stage_of(&key(ElementKind::IndexName, 2), Status::Public)
            .unwrap();

        assert!(column_public < backfilled);
        assert!(backfilled < index_public);
        assert_eq!(index_public, name_public);
        assert_eq!(plan.stages()[0].phase, Phase::Statement);
        assert_eq!(plan.point_of_no_return(), Some(index_public));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let planner = Planner::new().unwrap();
        let a = planner.plan(add_column_and_index()).unwrap();
        let mut shuffled = add_column_and_index();
        shuffled.reverse();
        let b = planner
            .plan_with_context(shuffled, StatementContext::default().with_job_id(a.job_id()))
            .unwrap();

        assert_eq!(a.id(), b.id());
        assert_eq!(a.stages(), b.stages());
    }

    #[test]
    fn test_every_job_gets_its_own_plan_id() {
        let planner = Planner::new().unwrap();
        let first = planner.plan(add_column_and_index()).unwrap();
        let retry = planner.plan(add_column_and_index()).unwrap();

        assert_ne!(first.job_id(), 0);
        assert_ne!(first.job_id(), retry.job_id());
        assert_ne!(first.id(), retry.id());
        assert_eq!(first.stages(), retry.stages());

        let rollback = planner
            .plan_rollback(&first, &first.statuses_after(1))
            .unwrap();
        assert_eq!(rollback.job_id(), first.job_id());
        assert_ne!(rollback.id(), first.id());
    }

    #[test]
    fn test_async_stage_advances_element_once() {
        let planner = Planner::new().unwrap();
        let plan = planner.plan(add_column_and_index()).unwrap();
        for stage in plan.stages().iter().filter(|s| s.phase.is_async()) {
            let mut elements: Vec<_> = stage.transitions.iter().map(|t| t.element).collect();
            let before = elements.len();
            elements.sort_unstable();
            elements.dedup();
            assert_eq!(before, elements.len(), "stage {}", stage.index);
        }
    }

    #[test]
    fn test_phases_never_decrease_along_edges() {
        let planner = Planner::new().unwrap();
        let plan = planner.plan(add_column_and_index()).unwrap();
        for edge in plan.edges() {
            let from = plan.node_stage(edge.from).unwrap();
            let to = plan.node_stage(edge.to).unwrap();
            match edge.kind {
                EdgeKind::Precedes => assert!(from <= to, "{edge:?}"),
                EdgeKind::SameStage => assert_eq!(from, to, "{edge:?}"),
            }
            assert!(plan.stages()[from].phase <= plan.stages()[to].phase);
        }
    }

    #[test]
    fn test_drop_column_removes_constraint_first() {
        let planner = Planner::new().unwrap();
        let check = Element::CheckConstraint(CheckConstraint {
            table_id: 52,
            constraint_id: 2,
            column_ids: vec![2],
            expr: "c2 > 0".to_string(),
        });
        let plan = planner
            .plan(vec![
                TargetState::existing(table()),
                TargetState::dropping(column()),
                TargetState::dropping(column_type()),
                TargetState::dropping(check),
            ])
            .unwrap();

        let check_gone = plan
            .stage_of(&key(ElementKind::CheckConstraint, 2), Status::Absent)
            .unwrap();
        let column_delete_only = plan
            .stage_of(&key(ElementKind::Column, 2), Status::DeleteOnly)
            .unwrap();
        assert!(check_gone < column_delete_only);
        assert_eq!(plan.point_of_no_return(), Some(column_delete_only));
        assert!(plan.rollback_allowed_on_failure(check_gone));
        assert!(!plan.rollback_allowed_on_failure(column_delete_only));
    }

    #[test]
    fn test_noop_plan_is_empty() {
        let planner = Planner::new().unwrap();
        let plan = planner
            .plan(vec![TargetState::existing(table()), TargetState::existing(column())])
            .unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.point_of_no_return(), None);
    }

    #[test]
    fn test_statuses_after() {
        let planner = Planner::new().unwrap();
        let plan = planner.plan(add_column_and_index()).unwrap();
        let column = plan.model().position(&key(ElementKind::Column, 2)).unwrap();
        assert_eq!(plan.statuses_after(0)[column], Status::Absent);
        assert_eq!(plan.statuses_after(1)[column], Status::DeleteOnly);
        let all = plan.statuses_after(plan.len());
        for (entry, status) in plan.model().entries().iter().zip(all) {
            assert_eq!(entry.target, status);
        }
    }

    struct AddColumn;

    impl Decomposer for AddColumn {
        fn decompose(&self, _: &StatementContext) -> Result<Vec<TargetState>, PlanError> {
            Ok(vec![
                TargetState::existing(table()),
                TargetState::adding(column()),
                TargetState::adding(column_type()),
            ])
        }
    }

    #[test]
    fn test_plan_statement_records_context() {
        let planner = Planner::new().unwrap();
        let ctx = StatementContext::new("ALTER TABLE t ADD COLUMN c2 INT8", "root");
        let plan = planner.plan_statement(&AddColumn, ctx).unwrap();
        let logged = plan.stages()[0].ops.iter().any(|op| {
            matches!(op, Operation::LogEvent { statement, username, .. }
                if statement == "ALTER TABLE t ADD COLUMN c2 INT8" && username == "root")
        });
        assert!(logged);
    }
}
