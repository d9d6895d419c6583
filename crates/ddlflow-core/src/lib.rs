//! ddlflow core - declarative schema-change planning and phased execution.
//!
//! A schema change is described as a set of [`TargetState`]s: every catalog
//! element involved, where it is now and where it should end up. The
//! [`Planner`] turns the targets into a [`Plan`] of ordered stages using a
//! table of status transitions ([`OpRegistry`]) and a table of dependency
//! rules ([`RuleSet`]). The [`PhasedExecutor`] runs a plan against a
//! [`SchemaStorage`], checkpointing as it goes, and rolls it back when it
//! fails before its point of no return.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod element;
pub mod error;
pub mod exec;
pub mod opgen;
pub mod plan;
pub mod rules;
pub mod storage;

pub use config::{CheckpointStoreConfig, ExecutorConfig, RetryPolicy};
pub use element::{Direction, Element, ElementKey, ElementKind, ElementModel, Status, TargetState};
pub use error::{Error, ErrorClass, ExecError, PlanError};
pub use exec::{
    CancelHandle, Checkpoint, CheckpointStore, ExecutionStatus, MemoryCheckpointStore,
    PhasedExecutor, SledCheckpointStore, StepOutcome,
};
pub use opgen::{next_job_id, OpRegistry, Operation, Phase, StatementContext};
pub use plan::{describe, Decomposer, Plan, PlanDescription, Planner, StageDescription};
pub use rules::{Rule, RuleSet, RuleSetBuilder};
pub use storage::{MemoryStorage, SchemaStorage, StorageError, TransactionScope};
