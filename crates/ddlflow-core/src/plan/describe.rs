//! Plan introspection.

use serde::Serialize;

use super::Plan;
use crate::opgen::Phase;

/// Description of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageDescription {
    /// Position in the plan.
    pub index: usize,
    /// Phase the stage runs in.
    pub phase: Phase,
    /// Whether a rollback may still undo this stage.
    pub revertible: bool,
    /// `"Column(52.2) ABSENT -> DELETE_ONLY"` per transition.
    pub transitions: Vec<String>,
    /// One line per operation.
    pub operations: Vec<String>,
}

/// Description of a whole plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanDescription {
    /// The plan's id.
    pub plan_id: String,
    /// First non-revertible stage, if any.
    pub point_of_no_return: Option<usize>,
    /// Stages in execution order.
    pub stages: Vec<StageDescription>,
}

/// Describe a plan stage by stage.
pub fn describe(plan: &Plan) -> PlanDescription {
    let model = plan.model();
    let stages = plan
        .stages()
        .iter()
        .map(|stage| StageDescription {
            index: stage.index,
            phase: stage.phase,
            revertible: stage.revertible,
            transitions: stage
                .transitions
                .iter()
                .map(|t| format!("{} {} -> {}", model.element(t.element).key(), t.from, t.to))
                .collect(),
            operations: stage.ops.iter().map(ToString::to_string).collect(),
        })
        .collect();
    PlanDescription {
        plan_id: plan.id().to_string(),
        point_of_no_return: plan.point_of_no_return(),
        stages,
    }
}

impl std::fmt::Display for PlanDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "plan {} ({} stages", self.plan_id, self.stages.len())?;
        match self.point_of_no_return {
            Some(stage) => writeln!(f, ", point of no return at stage {})", stage + 1)?,
            None => writeln!(f, ", fully revertible)")?,
        }
        for stage in &self.stages {
            writeln!(
                f,
                "  stage {} of {} in {} phase{}",
                stage.index + 1,
                self.stages.len(),
                stage.phase,
                if stage.revertible { "" } else { " (non-revertible)" }
            )?;
            for t in &stage.transitions {
                writeln!(f, "    {t}")?;
            }
            for op in &stage.operations {
                writeln!(f, "      * {op}")?;
            }
        }
        Ok(())
    }
}
