//! Phased plan execution.
//!
//! The executor runs a [`Plan`] one stage at a time against a
//! [`SchemaStorage`], checkpointing after every stage and every committed
//! work unit. Synchronous stages run as a single transaction; asynchronous
//! stages split their data operations into work units executed by a bounded
//! thread pool, then apply their descriptor mutations in one transaction.
//!
//! A failure before the plan's point of no return is answered by planning the
//! reverse of what was reached and executing that. A failure after it, or a
//! failure while rolling back, stops in [`ExecutionStatus::Failed`] until an
//! operator calls [`PhasedExecutor::resume_after_intervention`].

mod checkpoint;
mod worker;

pub use checkpoint::{
    Checkpoint, CheckpointStore, ExecutionStatus, MemoryCheckpointStore, SledCheckpointStore,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ExecutorConfig;
use crate::element::Status;
use crate::error::{ExecError, PlanError};
use crate::opgen::Operation;
use crate::plan::{Plan, Planner, Stage};
use crate::storage::{SchemaStorage, ScopeKind};

/// Requests cancellation of the schema change the executor runs next or is
/// running.
///
/// Cancellation is observed between stages. Before the point of no return it
/// starts a rollback; after it, the change runs to completion. Either way the
/// request is used up by that change and later changes run normally.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Withdraw a cancellation request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consume a pending request.
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Result of a single [`PhasedExecutor::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A stage committed. While rolling back, the index is into the rollback
    /// plan.
    Advanced {
        /// The stage that ran.
        stage: usize,
    },
    /// Forward execution stopped and the rollback plan is armed.
    RollbackStarted,
    /// Nothing left to do.
    Terminal(ExecutionStatus),
}

/// Runs plans stage by stage with checkpointing and rollback.
pub struct PhasedExecutor {
    planner: Arc<Planner>,
    storage: Arc<dyn SchemaStorage>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: ExecutorConfig,
    cancel: CancelHandle,
    /// Rollback plans by forward plan id.
    rollback_plans: Mutex<HashMap<String, Arc<Plan>>>,
}

impl PhasedExecutor {
    /// Create an executor.
    ///
    /// The planner must be the one that produced the plans handed to the
    /// executor; it is used to plan rollbacks.
    pub fn new(
        planner: Arc<Planner>,
        storage: Arc<dyn SchemaStorage>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            planner,
            storage,
            checkpoints,
            config,
            cancel: CancelHandle::default(),
            rollback_plans: Mutex::new(HashMap::new()),
        }
    }

    /// Handle for cancelling executions from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Persisted checkpoint of a plan.
    pub fn status(&self, plan_id: &str) -> Result<Option<Checkpoint>, ExecError> {
        Ok(self.checkpoints.load(plan_id)?)
    }

    /// Run a plan to a terminal status.
    ///
    /// Returns `Ok(Succeeded)` when every stage committed. A change that had
    /// to be undone returns [`ExecError::RolledBack`]; one that stopped in a
    /// state needing an operator returns [`ExecError::RequiresAttention`].
    /// Calling this again for a plan whose checkpoint is already terminal
    /// returns the same result without touching storage.
    #[instrument(skip(self, plan), fields(plan_id = %plan.id()))]
    pub fn execute(&self, plan: &Plan) -> Result<ExecutionStatus, ExecError> {
        if self.config.dry_run {
            return self.dry_run(plan);
        }
        if let Some(checkpoint) = self.checkpoints.load(plan.id())? {
            if checkpoint.status.is_terminal() {
                debug!(status = %checkpoint.status, "checkpoint already terminal");
                return terminal_result(checkpoint);
            }
        }
        loop {
            match self.step(plan)? {
                StepOutcome::Advanced { .. } | StepOutcome::RollbackStarted => continue,
                StepOutcome::Terminal(ExecutionStatus::Succeeded) => {
                    return Ok(ExecutionStatus::Succeeded)
                }
                StepOutcome::Terminal(status) => {
                    return match self.checkpoints.load(plan.id())? {
                        Some(checkpoint) => terminal_result(checkpoint),
                        None => Ok(status),
                    };
                }
            }
        }
    }

    /// Execute exactly one stage of the plan, or of its rollback plan.
    pub fn step(&self, plan: &Plan) -> Result<StepOutcome, ExecError> {
        let mut checkpoint = self.load_checkpoint(plan)?;
        match checkpoint.status {
            ExecutionStatus::Pending => {
                info!(
                    plan_id = %plan.id(),
                    stages = plan.len(),
                    point_of_no_return = ?plan.point_of_no_return(),
                    "schema change started"
                );
                checkpoint.status = ExecutionStatus::Executing;
                checkpoint.touch();
                self.forward_step(plan, checkpoint)
            }
            ExecutionStatus::Executing => self.forward_step(plan, checkpoint),
            ExecutionStatus::RollingBack => self.rollback_step(plan, checkpoint),
            status => Ok(StepOutcome::Terminal(status)),
        }
    }

    /// Re-arm a failed change after an operator fixed the cause, then run it
    /// to a terminal status. A change that failed while rolling back resumes
    /// its rollback.
    pub fn resume_after_intervention(&self, plan: &Plan) -> Result<ExecutionStatus, ExecError> {
        let Some(mut checkpoint) = self.checkpoints.load(plan.id())? else {
            return Err(ExecError::NotResumable {
                status: ExecutionStatus::Pending,
            });
        };
        if checkpoint.status != ExecutionStatus::Failed {
            return Err(ExecError::NotResumable {
                status: checkpoint.status,
            });
        }
        checkpoint.status = if checkpoint.in_rollback() {
            ExecutionStatus::RollingBack
        } else {
            checkpoint.error = None;
            ExecutionStatus::Executing
        };
        checkpoint.failed_stage = None;
        checkpoint.completed_units.clear();
        checkpoint.touch();
        self.checkpoints.save(&checkpoint)?;
        info!(
            plan_id = %plan.id(),
            stage = checkpoint.stage_index,
            status = %checkpoint.status,
            "schema change resumed after intervention"
        );
        self.execute(plan)
    }

    fn load_checkpoint(&self, plan: &Plan) -> Result<Checkpoint, ExecError> {
        let Some(checkpoint) = self.checkpoints.load(plan.id())? else {
            return Ok(Checkpoint::new(plan.id(), plan.model().current_statuses()));
        };
        let forward_overrun = !checkpoint.in_rollback() && checkpoint.stage_index > plan.len();
        if forward_overrun || checkpoint.statuses.len() != plan.model().len() {
            return Err(ExecError::PlanMismatch {
                plan_id: plan.id().to_string(),
                stage: checkpoint.stage_index,
                stage_count: plan.len(),
            });
        }
        Ok(checkpoint)
    }

    fn forward_step(&self, plan: &Plan, mut checkpoint: Checkpoint) -> Result<StepOutcome, ExecError> {
        let index = checkpoint.stage_index;
        let Some(stage) = plan.stages().get(index) else {
            checkpoint.status = ExecutionStatus::Succeeded;
            checkpoint.touch();
            self.checkpoints.save(&checkpoint)?;
            if self.cancel.take() {
                debug!(plan_id = %plan.id(), "deferred cancellation dropped");
            }
            info!(plan_id = %plan.id(), stages = plan.len(), "schema change succeeded");
            return Ok(StepOutcome::Terminal(ExecutionStatus::Succeeded));
        };

        if self.cancel.is_cancelled() {
            if plan.rollback_allowed_before(index) {
                self.cancel.take();
                warn!(plan_id = %plan.id(), stage = index, "schema change cancelled, rolling back");
                return self.begin_rollback(plan, checkpoint, index, "cancelled".to_string());
            }
            warn!(
                plan_id = %plan.id(),
                stage = index,
                "cancellation deferred past the point of no return"
            );
        }

        info!(
            plan_id = %plan.id(),
            stage = index,
            phase = %stage.phase,
            ops = stage.ops.len(),
            "running stage"
        );
        match self.run_stage(stage, &mut checkpoint) {
            Ok(()) => {
                checkpoint.advance(plan.statuses_after(index + 1));
                self.checkpoints.save(&checkpoint)?;
                Ok(StepOutcome::Advanced { stage: index })
            }
            Err(e @ ExecError::Checkpoint(_)) => Err(e),
            Err(e) if plan.rollback_allowed_on_failure(index) && e.permits_rollback() => {
                warn!(plan_id = %plan.id(), stage = index, error = %e, "stage failed, rolling back");
                self.begin_rollback(plan, checkpoint, index, e.to_string())
            }
            Err(e) => self.fail(checkpoint, index, e.to_string()),
        }
    }

    fn begin_rollback(
        &self,
        plan: &Plan,
        mut checkpoint: Checkpoint,
        stage: usize,
        cause: String,
    ) -> Result<StepOutcome, ExecError> {
        if let Err(e) = self.rollback_plan(plan, &checkpoint.statuses) {
            return self.fail(checkpoint, stage, format!("{cause}; rollback planning failed: {e}"));
        }
        checkpoint.start_rollback(cause);
        self.checkpoints.save(&checkpoint)?;
        Ok(StepOutcome::RollbackStarted)
    }

    fn rollback_step(&self, plan: &Plan, mut checkpoint: Checkpoint) -> Result<StepOutcome, ExecError> {
        let origin = match &checkpoint.rollback_origin {
            Some(origin) => origin.clone(),
            None => checkpoint.statuses.clone(),
        };
        let index = checkpoint.stage_index;
        let rollback = match self.rollback_plan(plan, &origin) {
            Ok(rollback) => rollback,
            Err(e) => return self.fail(checkpoint, index, format!("rollback planning failed: {e}")),
        };

        let Some(stage) = rollback.stages().get(index) else {
            checkpoint.status = ExecutionStatus::RolledBack;
            checkpoint.touch();
            self.checkpoints.save(&checkpoint)?;
            self.cancel.take();
            info!(
                plan_id = %plan.id(),
                stages = rollback.len(),
                cause = checkpoint.error.as_deref().unwrap_or(""),
                "schema change rolled back"
            );
            return Ok(StepOutcome::Terminal(ExecutionStatus::RolledBack));
        };

        info!(
            plan_id = %plan.id(),
            stage = index,
            phase = %stage.phase,
            ops = stage.ops.len(),
            "running rollback stage"
        );
        match self.run_stage(stage, &mut checkpoint) {
            Ok(()) => {
                checkpoint.advance(rollback.statuses_after(index + 1));
                self.checkpoints.save(&checkpoint)?;
                Ok(StepOutcome::Advanced { stage: index })
            }
            Err(e @ ExecError::Checkpoint(_)) => Err(e),
            Err(e) => self.fail(checkpoint, index, format!("rollback failed: {e}")),
        }
    }

    fn fail(
        &self,
        mut checkpoint: Checkpoint,
        stage: usize,
        cause: String,
    ) -> Result<StepOutcome, ExecError> {
        error!(
            plan_id = %checkpoint.plan_id,
            stage,
            error = %cause,
            "schema change requires attention"
        );
        checkpoint.fail(stage, cause.clone());
        self.checkpoints.save(&checkpoint)?;
        self.cancel.take();
        Err(ExecError::RequiresAttention { stage, cause })
    }

    /// Rollback plan for `plan` from the statuses it reached, planned once.
    fn rollback_plan(&self, plan: &Plan, reached: &[Status]) -> Result<Arc<Plan>, PlanError> {
        let mut cache = self.rollback_plans.lock();
        if let Some(rollback) = cache.get(plan.id()) {
            if rollback.model().current_statuses() == reached {
                return Ok(rollback.clone());
            }
        }
        let rollback = Arc::new(self.planner.plan_rollback(plan, reached)?);
        debug!(
            plan_id = %plan.id(),
            rollback_id = %rollback.id(),
            stages = rollback.len(),
            "planned rollback"
        );
        cache.insert(plan.id().to_string(), rollback.clone());
        Ok(rollback)
    }

    fn run_stage(&self, stage: &Stage, checkpoint: &mut Checkpoint) -> Result<(), ExecError> {
        if !stage.phase.is_async() {
            let ops: Vec<&Operation> = stage.ops.iter().collect();
            return self.run_transaction(stage.index, stage.phase.into(), &ops);
        }

        let units: Vec<(u32, Operation)> = stage
            .ops
            .iter()
            .filter(|op| op.is_data())
            .flat_map(|op| op.split(self.config.shards_per_operation))
            .enumerate()
            .map(|(ordinal, op)| (ordinal as u32, op))
            .filter(|(ordinal, _)| !checkpoint.completed_units.contains(ordinal))
            .collect();
        if !units.is_empty() {
            let progress = Mutex::new(&mut *checkpoint);
            let store = &*self.checkpoints;
            worker::run_units(
                &*self.storage,
                &self.config,
                stage.index,
                &units,
                &|ordinal| {
                    let mut checkpoint = progress.lock();
                    checkpoint.complete_unit(ordinal);
                    store.save(&checkpoint)
                },
            )?;
        }

        let mutations: Vec<&Operation> = stage.ops.iter().filter(|op| !op.is_data()).collect();
        self.run_transaction(stage.index, ScopeKind::Background, &mutations)
    }

    /// Run operations in one transaction, retrying it as a whole.
    fn run_transaction(
        &self,
        stage: usize,
        scope: ScopeKind,
        ops: &[&Operation],
    ) -> Result<(), ExecError> {
        if ops.is_empty() {
            return Ok(());
        }
        worker::with_retry(&self.config.stage_retry, stage, || {
            let mut txn = self
                .storage
                .begin(scope)
                .map_err(|e| ("begin transaction".to_string(), e))?;
            for op in ops {
                txn.declare(&op.access_set());
            }
            for op in ops {
                if let Err(e) = txn.execute(op) {
                    txn.abort();
                    return Err((op.to_string(), e));
                }
            }
            txn.commit().map_err(|e| ("commit".to_string(), e))
        })?;
        debug!(stage, ops = ops.len(), ?scope, "transaction committed");
        Ok(())
    }

    /// Open every stage's transaction and declare its spans without
    /// executing anything. No checkpoint is written.
    fn dry_run(&self, plan: &Plan) -> Result<ExecutionStatus, ExecError> {
        for stage in plan.stages() {
            let mut txn = self
                .storage
                .begin(stage.phase.into())
                .map_err(|source| ExecError::Storage {
                    stage: stage.index,
                    op: "begin transaction".to_string(),
                    attempts: 1,
                    source,
                })?;
            let mut declared = 0;
            for op in &stage.ops {
                for unit in op.split(self.config.shards_per_operation) {
                    txn.declare(&unit.access_set());
                    declared += 1;
                }
            }
            txn.abort();
            info!(
                plan_id = %plan.id(),
                stage = stage.index,
                phase = %stage.phase,
                declared,
                "dry run stage"
            );
        }
        Ok(ExecutionStatus::Succeeded)
    }
}

/// The result `execute` reports for a terminal checkpoint.
fn terminal_result(checkpoint: Checkpoint) -> Result<ExecutionStatus, ExecError> {
    match checkpoint.status {
        ExecutionStatus::RolledBack => Err(ExecError::RolledBack {
            cause: checkpoint.error.unwrap_or_default(),
        }),
        ExecutionStatus::Failed => Err(ExecError::RequiresAttention {
            stage: checkpoint.failed_stage.unwrap_or(checkpoint.stage_index),
            cause: checkpoint.error.unwrap_or_default(),
        }),
        status => Ok(status),
    }
}
