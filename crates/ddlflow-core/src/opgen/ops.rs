//! Operations emitted by status transitions.
//!
//! Descriptor mutations are small catalog writes that always run inside one
//! transaction. Data operations (backfill, merge, validation, data removal)
//! scale with table size and are split into shard-range work units.

use crate::element::{ColumnId, ConstraintId, DescId, IndexId, Status};
use crate::storage::keys::{self, ShardRange, PRIMARY_INDEX_ID};
use crate::storage::AccessSet;

/// Execution class of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    /// A catalog mutation.
    Mutation,
    /// A data operation writing index or table entries.
    Backfill,
    /// A data operation that only reads and checks.
    Validation,
}

impl std::fmt::Display for OpClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpClass::Mutation => write!(f, "mutation"),
            OpClass::Backfill => write!(f, "backfill"),
            OpClass::Validation => write!(f, "validation"),
        }
    }
}

/// Kind of descriptor being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Table,
    Type,
}

impl DescriptorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptorKind::Table => "table",
            DescriptorKind::Type => "type",
        }
    }
}

/// A sub-object of a table descriptor whose mutation state is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubObject {
    Column(ColumnId),
    Index(IndexId),
    Constraint(ConstraintId),
}

impl std::fmt::Display for SubObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubObject::Column(id) => write!(f, "column {id}"),
            SubObject::Index(id) => write!(f, "index {id}"),
            SubObject::Constraint(id) => write!(f, "constraint {id}"),
        }
    }
}

/// One unit of work handed to the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateDescriptor {
        desc_id: DescId,
        kind: DescriptorKind,
        name: String,
    },
    MarkDescriptorDropped {
        desc_id: DescId,
    },
    DeleteDescriptor {
        desc_id: DescId,
    },
    AddColumn {
        table_id: DescId,
        column_id: ColumnId,
        name: String,
    },
    SetColumnType {
        table_id: DescId,
        column_id: ColumnId,
        sql_type: String,
        nullable: bool,
    },
    RemoveColumnType {
        table_id: DescId,
        column_id: ColumnId,
    },
    SetColumnDefault {
        table_id: DescId,
        column_id: ColumnId,
        expr: String,
    },
    RemoveColumnDefault {
        table_id: DescId,
        column_id: ColumnId,
    },
    SetColumnComment {
        table_id: DescId,
        column_id: ColumnId,
        comment: String,
    },
    RemoveColumnComment {
        table_id: DescId,
        column_id: ColumnId,
    },
    AddIndex {
        table_id: DescId,
        index_id: IndexId,
        key_column_ids: Vec<ColumnId>,
        unique: bool,
        state: Status,
    },
    SetIndexName {
        table_id: DescId,
        index_id: IndexId,
        name: String,
    },
    RemoveIndexName {
        table_id: DescId,
        index_id: IndexId,
    },
    AddCheckConstraint {
        table_id: DescId,
        constraint_id: ConstraintId,
        expr: String,
    },
    AddForeignKey {
        table_id: DescId,
        constraint_id: ConstraintId,
        referenced_table_id: DescId,
    },
    /// Record a sub-object's new mutation state in its descriptor.
    SetMutationState {
        table_id: DescId,
        object: SubObject,
        state: Status,
    },
    RemoveColumn {
        table_id: DescId,
        column_id: ColumnId,
    },
    RemoveIndex {
        table_id: DescId,
        index_id: IndexId,
    },
    RemoveConstraint {
        table_id: DescId,
        constraint_id: ConstraintId,
    },
    /// Add or remove a type's record of a table that uses it.
    UpdateTypeBackReference {
        type_id: DescId,
        table_id: DescId,
        present: bool,
    },
    /// Append an entry to the event log.
    LogEvent {
        element: String,
        status: Status,
        statement: String,
        username: String,
    },
    BackfillIndex {
        table_id: DescId,
        index_id: IndexId,
        source_index_id: IndexId,
        range: ShardRange,
    },
    MergeIndex {
        table_id: DescId,
        index_id: IndexId,
        temp_index_id: IndexId,
        range: ShardRange,
    },
    ValidateIndex {
        table_id: DescId,
        index_id: IndexId,
        unique: bool,
        range: ShardRange,
    },
    ValidateConstraint {
        table_id: DescId,
        constraint_id: ConstraintId,
        referenced_table_id: Option<DescId>,
        range: ShardRange,
    },
    ClearIndexData {
        table_id: DescId,
        index_id: IndexId,
        range: ShardRange,
    },
    ClearTableData {
        table_id: DescId,
    },
}

impl Operation {
    /// Variant name, stable across releases.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateDescriptor { .. } => "CreateDescriptor",
            Operation::MarkDescriptorDropped { .. } => "MarkDescriptorDropped",
            Operation::DeleteDescriptor { .. } => "DeleteDescriptor",
            Operation::AddColumn { .. } => "AddColumn",
            Operation::SetColumnType { .. } => "SetColumnType",
            Operation::RemoveColumnType { .. } => "RemoveColumnType",
            Operation::SetColumnDefault { .. } => "SetColumnDefault",
            Operation::RemoveColumnDefault { .. } => "RemoveColumnDefault",
            Operation::SetColumnComment { .. } => "SetColumnComment",
            Operation::RemoveColumnComment { .. } => "RemoveColumnComment",
            Operation::AddIndex { .. } => "AddIndex",
            Operation::SetIndexName { .. } => "SetIndexName",
            Operation::RemoveIndexName { .. } => "RemoveIndexName",
            Operation::AddCheckConstraint { .. } => "AddCheckConstraint",
            Operation::AddForeignKey { .. } => "AddForeignKey",
            Operation::SetMutationState { .. } => "SetMutationState",
            Operation::RemoveColumn { .. } => "RemoveColumn",
            Operation::RemoveIndex { .. } => "RemoveIndex",
            Operation::RemoveConstraint { .. } => "RemoveConstraint",
            Operation::UpdateTypeBackReference { .. } => "UpdateTypeBackReference",
            Operation::LogEvent { .. } => "LogEvent",
            Operation::BackfillIndex { .. } => "BackfillIndex",
            Operation::MergeIndex { .. } => "MergeIndex",
            Operation::ValidateIndex { .. } => "ValidateIndex",
            Operation::ValidateConstraint { .. } => "ValidateConstraint",
            Operation::ClearIndexData { .. } => "ClearIndexData",
            Operation::ClearTableData { .. } => "ClearTableData",
        }
    }

    /// Execution class.
    pub fn class(&self) -> OpClass {
        match self {
            Operation::BackfillIndex { .. }
            | Operation::MergeIndex { .. }
            | Operation::ClearIndexData { .. }
            | Operation::ClearTableData { .. } => OpClass::Backfill,
            Operation::ValidateIndex { .. } | Operation::ValidateConstraint { .. } => {
                OpClass::Validation
            }
            _ => OpClass::Mutation,
        }
    }

    /// Whether this is a data operation executed as work units.
    pub fn is_data(&self) -> bool {
        self.class() != OpClass::Mutation
    }

    /// The descriptor this operation touches.
    pub fn desc_id(&self) -> Option<DescId> {
        match self {
            Operation::CreateDescriptor { desc_id, .. }
            | Operation::MarkDescriptorDropped { desc_id }
            | Operation::DeleteDescriptor { desc_id } => Some(*desc_id),
            Operation::UpdateTypeBackReference { type_id, .. } => Some(*type_id),
            Operation::LogEvent { .. } => None,
            Operation::AddColumn { table_id, .. }
            | Operation::SetColumnType { table_id, .. }
            | Operation::RemoveColumnType { table_id, .. }
            | Operation::SetColumnDefault { table_id, .. }
            | Operation::RemoveColumnDefault { table_id, .. }
            | Operation::SetColumnComment { table_id, .. }
            | Operation::RemoveColumnComment { table_id, .. }
            | Operation::AddIndex { table_id, .. }
            | Operation::SetIndexName { table_id, .. }
            | Operation::RemoveIndexName { table_id, .. }
            | Operation::AddCheckConstraint { table_id, .. }
            | Operation::AddForeignKey { table_id, .. }
            | Operation::SetMutationState { table_id, .. }
            | Operation::RemoveColumn { table_id, .. }
            | Operation::RemoveIndex { table_id, .. }
            | Operation::RemoveConstraint { table_id, .. }
            | Operation::BackfillIndex { table_id, .. }
            | Operation::MergeIndex { table_id, .. }
            | Operation::ValidateIndex { table_id, .. }
            | Operation::ValidateConstraint { table_id, .. }
            | Operation::ClearIndexData { table_id, .. }
            | Operation::ClearTableData { table_id } => Some(*table_id),
        }
    }

    /// Shard range covered by a data operation.
    pub fn range(&self) -> Option<ShardRange> {
        match self {
            Operation::BackfillIndex { range, .. }
            | Operation::MergeIndex { range, .. }
            | Operation::ValidateIndex { range, .. }
            | Operation::ValidateConstraint { range, .. }
            | Operation::ClearIndexData { range, .. } => Some(*range),
            _ => None,
        }
    }

    /// Copy of this operation restricted to another shard range.
    fn with_range(&self, new_range: ShardRange) -> Operation {
        let mut op = self.clone();
        match &mut op {
            Operation::BackfillIndex { range, .. }
            | Operation::MergeIndex { range, .. }
            | Operation::ValidateIndex { range, .. }
            | Operation::ValidateConstraint { range, .. }
            | Operation::ClearIndexData { range, .. } => *range = new_range,
            _ => {}
        }
        op
    }

    /// Split a data operation into at most `parts` work units covering
    /// disjoint shard ranges. Operations without a range stay whole.
    pub fn split(&self, parts: usize) -> Vec<Operation> {
        match self.range() {
            Some(range) => range
                .split(parts)
                .into_iter()
                .map(|r| self.with_range(r))
                .collect(),
            None => vec![self.clone()],
        }
    }

    /// Spans this operation reads and writes.
    pub fn access_set(&self) -> AccessSet {
        match self {
            Operation::UpdateTypeBackReference { type_id, .. } => {
                AccessSet::writes(vec![keys::descriptor_span(*type_id)])
            }
            Operation::LogEvent { .. } => AccessSet::writes(vec![keys::event_span()]),
            Operation::BackfillIndex {
                table_id,
                index_id,
                source_index_id,
                range,
            } => AccessSet::writes(vec![keys::index_span(*table_id, *index_id, *range)])
                .with_read(keys::index_span(*table_id, *source_index_id, *range)),
            Operation::MergeIndex {
                table_id,
                index_id,
                temp_index_id,
                range,
            } => AccessSet::writes(vec![keys::index_span(*table_id, *index_id, *range)])
                .with_read(keys::index_span(*table_id, *temp_index_id, *range)),
            Operation::ValidateIndex {
                table_id,
                index_id,
                range,
                ..
            } => AccessSet::default()
                .with_read(keys::index_span(*table_id, *index_id, *range))
                .with_read(keys::index_span(*table_id, PRIMARY_INDEX_ID, *range)),
            Operation::ValidateConstraint {
                table_id,
                referenced_table_id,
                range,
                ..
            } => {
                let access = AccessSet::default()
                    .with_read(keys::index_span(*table_id, PRIMARY_INDEX_ID, *range));
                match referenced_table_id {
                    Some(referenced) => access.with_read(keys::index_span(
                        *referenced,
                        PRIMARY_INDEX_ID,
                        ShardRange::FULL,
                    )),
                    None => access,
                }
            }
            Operation::ClearIndexData {
                table_id,
                index_id,
                range,
            } => AccessSet::writes(vec![keys::index_span(*table_id, *index_id, *range)]),
            Operation::ClearTableData { table_id } => {
                AccessSet::writes(vec![keys::table_data_span(*table_id)])
            }
            other => match other.desc_id() {
                Some(desc_id) => AccessSet::writes(vec![keys::descriptor_span(desc_id)]),
                None => AccessSet::default(),
            },
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::CreateDescriptor {
                desc_id,
                kind,
                name,
            } => write!(f, "CreateDescriptor {} {desc_id} ({name})", kind.as_str()),
            Operation::MarkDescriptorDropped { desc_id } => {
                write!(f, "MarkDescriptorDropped {desc_id}")
            }
            Operation::DeleteDescriptor { desc_id } => write!(f, "DeleteDescriptor {desc_id}"),
            Operation::AddColumn {
                table_id,
                column_id,
                name,
            } => write!(f, "AddColumn {table_id}.{column_id} ({name})"),
            Operation::SetColumnType {
                table_id,
                column_id,
                sql_type,
                nullable,
            } => write!(
                f,
                "SetColumnType {table_id}.{column_id} {sql_type}{}",
                if *nullable { "" } else { " NOT NULL" }
            ),
            Operation::RemoveColumnType {
                table_id,
                column_id,
            } => write!(f, "RemoveColumnType {table_id}.{column_id}"),
            Operation::SetColumnDefault {
                table_id,
                column_id,
                expr,
            } => write!(f, "SetColumnDefault {table_id}.{column_id} {expr}"),
            Operation::RemoveColumnDefault {
                table_id,
                column_id,
            } => write!(f, "RemoveColumnDefault {table_id}.{column_id}"),
            Operation::SetColumnComment {
                table_id,
                column_id,
                ..
            } => write!(f, "SetColumnComment {table_id}.{column_id}"),
            Operation::RemoveColumnComment {
                table_id,
                column_id,
            } => write!(f, "RemoveColumnComment {table_id}.{column_id}"),
            Operation::AddIndex {
                table_id,
                index_id,
                state,
                ..
            } => write!(f, "AddIndex {table_id}.{index_id} as {state}"),
            Operation::SetIndexName {
                table_id,
                index_id,
                name,
            } => write!(f, "SetIndexName {table_id}.{index_id} ({name})"),
            Operation::RemoveIndexName { table_id, index_id } => {
                write!(f, "RemoveIndexName {table_id}.{index_id}")
            }
            Operation::AddCheckConstraint {
                table_id,
                constraint_id,
                expr,
            } => write!(f, "AddCheckConstraint {table_id}.{constraint_id} CHECK ({expr})"),
            Operation::AddForeignKey {
                table_id,
                constraint_id,
                referenced_table_id,
            } => write!(
                f,
                "AddForeignKey {table_id}.{constraint_id} REFERENCES {referenced_table_id}"
            ),
            Operation::SetMutationState {
                table_id,
                object,
                state,
            } => write!(f, "SetMutationState {table_id} {object} -> {state}"),
            Operation::RemoveColumn {
                table_id,
                column_id,
            } => write!(f, "RemoveColumn {table_id}.{column_id}"),
            Operation::RemoveIndex { table_id, index_id } => {
                write!(f, "RemoveIndex {table_id}.{index_id}")
            }
            Operation::RemoveConstraint {
                table_id,
                constraint_id,
            } => write!(f, "RemoveConstraint {table_id}.{constraint_id}"),
            Operation::UpdateTypeBackReference {
                type_id,
                table_id,
                present,
            } => write!(
                f,
                "UpdateTypeBackReference type {type_id} {} table {table_id}",
                if *present { "+" } else { "-" }
            ),
            Operation::LogEvent {
                element, status, ..
            } => write!(f, "LogEvent {element} {status}"),
            Operation::BackfillIndex {
                table_id,
                index_id,
                source_index_id,
                range,
            } => write!(
                f,
                "BackfillIndex {table_id}.{index_id} from {source_index_id} shards {range}"
            ),
            Operation::MergeIndex {
                table_id,
                index_id,
                temp_index_id,
                range,
            } => write!(
                f,
                "MergeIndex {table_id}.{index_id} from {temp_index_id} shards {range}"
            ),
            Operation::ValidateIndex {
                table_id,
                index_id,
                range,
                ..
            } => write!(f, "ValidateIndex {table_id}.{index_id} shards {range}"),
            Operation::ValidateConstraint {
                table_id,
                constraint_id,
                range,
                ..
            } => write!(
                f,
                "ValidateConstraint {table_id}.{constraint_id} shards {range}"
            ),
            Operation::ClearIndexData {
                table_id,
                index_id,
                range,
            } => write!(f, "ClearIndexData {table_id}.{index_id} shards {range}"),
            Operation::ClearTableData { table_id } => write!(f, "ClearTableData {table_id}"),
        }
    }
}
