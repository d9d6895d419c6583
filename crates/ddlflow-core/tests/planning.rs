//! Integration tests for plan construction.

mod common;

use common::*;
use ddlflow_core::element::ElementKey;
use ddlflow_core::opgen::OpRegistry;
use ddlflow_core::rules::{dependent, source, Constraint, Relation, StatusSel};
use ddlflow_core::{
    Decomposer, ElementKind, ErrorClass, Phase, Plan, PlanError, Planner, Rule, RuleSetBuilder,
    StatementContext, Status, TargetState,
};

fn key(kind: ElementKind, sub_id: u32) -> ElementKey {
    ElementKey {
        kind,
        owner: TABLE,
        sub_id,
    }
}

fn stage_of(plan: &Plan, kind: ElementKind, sub_id: u32, status: Status) -> usize {
    plan.stage_of(&key(kind, sub_id), status)
        .unwrap_or_else(|| panic!("{kind:?} {sub_id} never reaches {status}"))
}

fn scenarios() -> Vec<Vec<TargetState>> {
    vec![
        add_column_and_index(),
        add_column_with_check(),
        drop_column_with_check(),
        add_index(),
        drop_index(),
    ]
}

#[test]
fn test_column_and_index_scenario() {
    let planner = Planner::new().unwrap();
    let plan = planner.plan(add_column_and_index()).unwrap();

    let column_delete_only = stage_of(&plan, ElementKind::Column, 2, Status::DeleteOnly);
    let column_public = stage_of(&plan, ElementKind::Column, 2, Status::Public);
    let temp_write_only = stage_of(&plan, ElementKind::TemporaryIndex, 3, Status::WriteOnly);
    let backfilled = stage_of(&plan, ElementKind::SecondaryIndex, 2, Status::Backfilled);
    let merged = stage_of(&plan, ElementKind::SecondaryIndex, 2, Status::Merged);
    let temp_gone = stage_of(&plan, ElementKind::TemporaryIndex, 3, Status::TransientAbsent);
    let index_public = stage_of(&plan, ElementKind::SecondaryIndex, 2, Status::Public);
    let name_public = stage_of(&plan, ElementKind::IndexName, 2, Status::Public);

    assert_eq!(column_delete_only, 0);
    assert!(column_public < backfilled);
    assert!(temp_write_only < backfilled);
    assert!(backfilled < merged);
    assert!(merged < temp_gone);
    assert!(merged < index_public);
    assert_eq!(index_public, name_public);

    assert_eq!(plan.stages()[0].phase, Phase::Statement);
    assert_eq!(plan.stages()[backfilled].phase, Phase::PostCommit);
    assert_eq!(plan.stages()[index_public].phase, Phase::Validation);
    assert_eq!(plan.point_of_no_return(), Some(index_public));
}

#[test]
fn test_drop_column_with_check_scenario() {
    let planner = Planner::new().unwrap();
    let plan = planner.plan(drop_column_with_check()).unwrap();

    let check_write_only = stage_of(&plan, ElementKind::CheckConstraint, 2, Status::WriteOnly);
    let check_gone = stage_of(&plan, ElementKind::CheckConstraint, 2, Status::Absent);
    let column_write_only = stage_of(&plan, ElementKind::Column, 2, Status::WriteOnly);
    let column_delete_only = stage_of(&plan, ElementKind::Column, 2, Status::DeleteOnly);
    let column_gone = stage_of(&plan, ElementKind::Column, 2, Status::Absent);
    let type_gone = stage_of(&plan, ElementKind::ColumnType, 2, Status::Absent);

    assert_eq!(plan.stages()[check_write_only].phase, Phase::PreCommit);
    assert_eq!(plan.stages()[column_write_only].phase, Phase::PreCommit);
    assert!(check_gone < column_delete_only);
    assert_eq!(column_gone, type_gone);
    assert_eq!(plan.point_of_no_return(), Some(column_delete_only));
}

#[test]
fn test_phases_are_monotonic() {
    let planner = Planner::new().unwrap();
    for targets in scenarios() {
        let plan = planner.plan(targets).unwrap();
        let stages = plan.stages();
        for pair in stages.windows(2) {
            assert!(pair[0].phase <= pair[1].phase);
        }
        for edge in plan.edges() {
            let from = plan.node_stage(edge.from).unwrap();
            let to = plan.node_stage(edge.to).unwrap();
            assert!(from <= to, "{} breaks stage order", edge.reason);
            assert!(stages[from].phase <= stages[to].phase);
            if stages[to].phase.is_async() && edge.reason == "status path" {
                assert!(from < to, "element advanced twice in one async stage");
            }
        }
    }
}

#[test]
fn test_no_silent_noops() {
    let planner = Planner::new().unwrap();
    for targets in scenarios() {
        let plan = planner.plan(targets).unwrap();
        for node in plan.nodes() {
            let element = plan.model().element(node.element).key();
            assert!(
                !node.ops.is_empty(),
                "{element} {} -> {} emits nothing",
                node.from,
                node.to
            );
        }
        for stage in plan.stages() {
            assert!(!stage.ops.is_empty(), "stage {} is empty", stage.index);
        }
    }
}

#[test]
fn test_contradictory_rules_are_a_cycle() {
    let rules = RuleSetBuilder::with_defaults()
        .rule(Rule::new(
            "type after public column",
            ElementKind::Column,
            ElementKind::ColumnType,
            Relation::SameColumn,
            Constraint::precedes(
                source(StatusSel::Is(Status::Public)),
                dependent(StatusSel::Is(Status::Public)),
            ),
        ))
        .build()
        .unwrap();
    let planner = Planner::with_parts(rules, OpRegistry::standard().unwrap()).unwrap();

    let err = planner.plan(add_column_with_check()).unwrap_err();
    assert_eq!(err.class(), ErrorClass::NothingChanged);
    let PlanError::CyclicDependency { chain } = err else {
        panic!("expected a cycle, got {err}");
    };
    assert!(chain.len() >= 3, "{chain:?}");
    assert_eq!(chain.first(), chain.last());
    assert!(chain.iter().all(|node| node.starts_with("Column(52.2)")
        || node.starts_with("ColumnType(52.2)")));
}

#[test]
fn test_conflicting_directions_are_rejected() {
    let planner = Planner::new().unwrap();
    let err = planner
        .plan(vec![
            TargetState::dropping(column()),
            TargetState::adding(column_type()),
        ])
        .unwrap_err();
    assert!(matches!(err, PlanError::MutuallyExclusive { .. }), "{err}");
}

#[test]
fn test_duplicate_targets_are_rejected() {
    let planner = Planner::new().unwrap();
    let err = planner
        .plan(vec![TargetState::adding(column()), TargetState::dropping(column())])
        .unwrap_err();
    assert!(matches!(err, PlanError::DuplicateTarget { .. }), "{err}");
}

#[test]
fn test_unregistered_transition_is_rejected() {
    let planner = Planner::new().unwrap();
    let err = planner
        .plan(vec![TargetState::new(column(), Status::Absent, Status::Merged)])
        .unwrap_err();
    assert!(matches!(err, PlanError::UnregisteredTransition { .. }), "{err}");
}

#[test]
fn test_rollback_plan_reverses_reached_statuses() {
    let planner = Planner::new().unwrap();
    let plan = planner.plan(add_column_and_index()).unwrap();
    let ponr = plan.point_of_no_return().unwrap();

    for completed in 1..=ponr {
        let reached = plan.statuses_after(completed);
        let rollback = planner.plan_rollback(&plan, &reached).unwrap();
        // A finished transient element needs no undoing.
        let undone: Vec<Status> = rollback
            .statuses_after(rollback.len())
            .into_iter()
            .map(|s| if s == Status::TransientAbsent { Status::Absent } else { s })
            .collect();
        assert_eq!(undone, plan.model().current_statuses(), "after {completed} stages");
    }
}

struct JsonStatement(String);

impl Decomposer for JsonStatement {
    fn decompose(&self, _: &StatementContext) -> Result<Vec<TargetState>, PlanError> {
        serde_json::from_str(&self.0).map_err(|e| PlanError::MalformedElement {
            element: "statement".to_string(),
            reason: e.to_string(),
        })
    }
}

#[test]
fn test_plan_statement_from_json() {
    let planner = Planner::new().unwrap();
    let decomposer = JsonStatement(serde_json::to_string(&add_column_and_index()).unwrap());
    let ctx = StatementContext::new("CREATE INDEX orders_total_idx ON orders (total)", "admin");

    let from_json = planner.plan_statement(&decomposer, ctx.clone()).unwrap();
    let direct = planner
        .plan_with_context(add_column_and_index(), ctx.with_job_id(from_json.job_id()))
        .unwrap();
    assert_eq!(from_json.id(), direct.id());
    assert_eq!(from_json.stages(), direct.stages());
    assert_eq!(from_json.context().username, "admin");
}

#[test]
fn test_plan_description() {
    let planner = Planner::new().unwrap();
    let plan = planner.plan(drop_column_with_check()).unwrap();
    let description = plan.describe();

    assert_eq!(description.stages.len(), plan.len());
    assert_eq!(description.point_of_no_return, plan.point_of_no_return());
    let text = description.to_string();
    assert!(text.contains("point of no return at stage"));
    assert!(text.contains("pre-commit phase"));

    let json = serde_json::to_value(&description).unwrap();
    assert_eq!(json["plan_id"], plan.id());
}
