//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ddlflow_core::element::{
    CheckConstraint, Column, ColumnType, Element, IndexName, SecondaryIndex, Table,
    TemporaryIndex,
};
use ddlflow_core::storage::keys::PRIMARY_INDEX_ID;
use ddlflow_core::{
    CheckpointStore, ExecutorConfig, MemoryCheckpointStore, MemoryStorage, PhasedExecutor,
    Planner, RetryPolicy, TargetState,
};

pub const TABLE: u32 = 52;
pub const ROWS: u64 = 600;

pub fn table() -> Element {
    Element::Table(Table {
        table_id: TABLE,
        name: "orders".to_string(),
    })
}

pub fn column() -> Element {
    Element::Column(Column {
        table_id: TABLE,
        column_id: 2,
        name: "total".to_string(),
    })
}

pub fn column_type() -> Element {
    Element::ColumnType(ColumnType {
        table_id: TABLE,
        column_id: 2,
        sql_type: "INT8".to_string(),
        nullable: true,
        type_ref: None,
    })
}

pub fn index(temp_index_id: Option<u32>) -> Element {
    Element::SecondaryIndex(SecondaryIndex {
        table_id: TABLE,
        index_id: 2,
        key_column_ids: vec![2],
        storing_column_ids: vec![],
        unique: false,
        temp_index_id,
    })
}

pub fn temp_index() -> Element {
    Element::TemporaryIndex(TemporaryIndex {
        table_id: TABLE,
        index_id: 3,
        source_index_id: 2,
        key_column_ids: vec![2],
    })
}

pub fn index_name() -> Element {
    Element::IndexName(IndexName {
        table_id: TABLE,
        index_id: 2,
        name: "orders_total_idx".to_string(),
    })
}

pub fn check() -> Element {
    Element::CheckConstraint(CheckConstraint {
        table_id: TABLE,
        constraint_id: 2,
        column_ids: vec![2],
        expr: "total > 0".to_string(),
    })
}

/// `ALTER TABLE orders ADD COLUMN total INT8, CREATE INDEX ON orders (total)`.
pub fn add_column_and_index() -> Vec<TargetState> {
    vec![
        TargetState::existing(table()),
        TargetState::adding(column()),
        TargetState::adding(column_type()),
        TargetState::adding(index(Some(3))),
        TargetState::transient(temp_index()),
        TargetState::adding(index_name()),
    ]
}

/// `ALTER TABLE orders ADD COLUMN total INT8 CHECK (total > 0)`.
pub fn add_column_with_check() -> Vec<TargetState> {
    vec![
        TargetState::existing(table()),
        TargetState::adding(column()),
        TargetState::adding(column_type()),
        TargetState::adding(check()),
    ]
}

/// `ALTER TABLE orders DROP COLUMN total` with a check constraint on it.
pub fn drop_column_with_check() -> Vec<TargetState> {
    vec![
        TargetState::existing(table()),
        TargetState::dropping(column()),
        TargetState::dropping(column_type()),
        TargetState::dropping(check()),
    ]
}

/// `CREATE INDEX orders_total_idx ON orders (total)` on an existing column.
pub fn add_index() -> Vec<TargetState> {
    vec![
        TargetState::existing(table()),
        TargetState::existing(column()),
        TargetState::existing(column_type()),
        TargetState::adding(index(None)),
        TargetState::adding(index_name()),
    ]
}

/// `DROP INDEX orders_total_idx`.
pub fn drop_index() -> Vec<TargetState> {
    vec![
        TargetState::existing(table()),
        TargetState::existing(column()),
        TargetState::existing(column_type()),
        TargetState::dropping(index(None)),
        TargetState::dropping(index_name()),
    ]
}

/// Retries without sleeping so failure tests stay fast.
pub fn fast_config() -> ExecutorConfig {
    ExecutorConfig::default()
        .with_shards_per_operation(8)
        .with_unit_retry(RetryPolicy::immediate(3))
        .with_stage_retry(RetryPolicy::immediate(3))
}

pub struct TestContext {
    pub planner: Arc<Planner>,
    pub storage: Arc<MemoryStorage>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
}

impl TestContext {
    /// A table with rows in its primary index.
    pub fn new() -> Self {
        let storage = MemoryStorage::new();
        storage.seed_rows(TABLE, PRIMARY_INDEX_ID, ROWS);
        Self {
            planner: Arc::new(Planner::new().unwrap()),
            storage: Arc::new(storage),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
        }
    }

    pub fn executor(&self) -> PhasedExecutor {
        self.executor_with(fast_config())
    }

    pub fn executor_with(&self, config: ExecutorConfig) -> PhasedExecutor {
        self.executor_over(self.checkpoints.clone(), config)
    }

    pub fn executor_over(
        &self,
        checkpoints: Arc<dyn CheckpointStore>,
        config: ExecutorConfig,
    ) -> PhasedExecutor {
        PhasedExecutor::new(
            self.planner.clone(),
            self.storage.clone(),
            checkpoints,
            config,
        )
    }

    /// Plan and run a change to completion.
    pub fn apply(&self, targets: Vec<TargetState>) {
        let plan = self.planner.plan(targets).unwrap();
        self.executor().execute(&plan).unwrap();
    }
}
