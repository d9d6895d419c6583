//! Built-in transition sequences.

use super::{ArcSpec, DescriptorKind, OpRegistry, Operation, Phase, StatementContext, SubObject, TransitionSpec};
use crate::element::{Element, ElementKind, Status};
use crate::storage::keys::{ShardRange, PRIMARY_INDEX_ID};

pub(super) fn registry() -> OpRegistry {
    let mut registry = OpRegistry::new();
    register_descriptors(&mut registry);
    register_columns(&mut registry);
    register_indexes(&mut registry);
    register_constraints(&mut registry);
    registry
}

fn log_event(element: &Element, ctx: &StatementContext, status: Status) -> Operation {
    Operation::LogEvent {
        element: element.key().to_string(),
        status,
        statement: ctx.statement.clone(),
        username: ctx.username.clone(),
    }
}

fn set_state(element: &Element, state: Status) -> Vec<Operation> {
    let object = match element {
        Element::Column(e) => SubObject::Column(e.column_id),
        Element::SecondaryIndex(e) => SubObject::Index(e.index_id),
        Element::TemporaryIndex(e) => SubObject::Index(e.index_id),
        Element::CheckConstraint(e) => SubObject::Constraint(e.constraint_id),
        Element::ForeignKeyConstraint(e) => SubObject::Constraint(e.constraint_id),
        _ => return Vec::new(),
    };
    vec![Operation::SetMutationState {
        table_id: element.owner(),
        object,
        state,
    }]
}

// Tables and types.

fn create_descriptor(element: &Element, ctx: &StatementContext) -> Vec<Operation> {
    let (kind, name) = match element {
        Element::Table(e) => (DescriptorKind::Table, &e.name),
        Element::EnumType(e) => (DescriptorKind::Type, &e.name),
        _ => return Vec::new(),
    };
    vec![
        Operation::CreateDescriptor {
            desc_id: element.owner(),
            kind,
            name: name.clone(),
        },
        log_event(element, ctx, Status::Public),
    ]
}

fn mark_dropped(element: &Element, ctx: &StatementContext) -> Vec<Operation> {
    vec![
        Operation::MarkDescriptorDropped {
            desc_id: element.owner(),
        },
        log_event(element, ctx, Status::Dropped),
    ]
}

fn delete_table(element: &Element, _: &StatementContext) -> Vec<Operation> {
    vec![
        Operation::DeleteDescriptor {
            desc_id: element.owner(),
        },
        Operation::ClearTableData {
            table_id: element.owner(),
        },
    ]
}

fn delete_type(element: &Element, _: &StatementContext) -> Vec<Operation> {
    vec![Operation::DeleteDescriptor {
        desc_id: element.owner(),
    }]
}

fn register_descriptors(registry: &mut OpRegistry) {
    registry
        .register(
            ElementKind::Table,
            TransitionSpec::to_public(Status::Absent)
                .arc(ArcSpec::to(Status::Public).emit(create_descriptor))
                .entry(
                    Status::Dropped,
                    ArcSpec::to(Status::Public).emit(create_descriptor),
                ),
        )
        .register(
            ElementKind::Table,
            TransitionSpec::to_absent(Status::Public)
                .arc(ArcSpec::to(Status::Dropped).emit(mark_dropped))
                .arc(
                    ArcSpec::to(Status::Absent)
                        .min_phase(Phase::PostCommit)
                        .non_revertible()
                        .emit(delete_table),
                ),
        )
        .register(
            ElementKind::EnumType,
            TransitionSpec::to_public(Status::Absent)
                .arc(ArcSpec::to(Status::Public).emit(create_descriptor))
                .entry(
                    Status::Dropped,
                    ArcSpec::to(Status::Public).emit(create_descriptor),
                ),
        )
        .register(
            ElementKind::EnumType,
            TransitionSpec::to_absent(Status::Public)
                .arc(ArcSpec::to(Status::Dropped).emit(mark_dropped))
                .arc(
                    ArcSpec::to(Status::Absent)
                        .min_phase(Phase::PostCommit)
                        .non_revertible()
                        .emit(delete_type),
                ),
        );
}

// Columns and their attributes.

fn add_column(element: &Element, ctx: &StatementContext) -> Vec<Operation> {
    let Element::Column(c) = element else {
        return Vec::new();
    };
    vec![
        Operation::AddColumn {
            table_id: c.table_id,
            column_id: c.column_id,
            name: c.name.clone(),
        },
        log_event(element, ctx, Status::Public),
    ]
}

fn column_write_only(element: &Element, _: &StatementContext) -> Vec<Operation> {
    set_state(element, Status::WriteOnly)
}

fn column_public(element: &Element, _: &StatementContext) -> Vec<Operation> {
    set_state(element, Status::Public)
}

fn column_leaving(element: &Element, ctx: &StatementContext) -> Vec<Operation> {
    let mut ops = set_state(element, Status::WriteOnly);
    ops.push(log_event(element, ctx, Status::Absent));
    ops
}

fn column_delete_only(element: &Element, _: &StatementContext) -> Vec<Operation> {
    set_state(element, Status::DeleteOnly)
}

fn remove_column(element: &Element, _: &StatementContext) -> Vec<Operation> {
    let Element::Column(c) = element else {
        return Vec::new();
    };
    vec![Operation::RemoveColumn {
        table_id: c.table_id,
        column_id: c.column_id,
    }]
}

fn set_column_type(element: &Element, _: &StatementContext) -> Vec<Operation> {
    let Element::ColumnType(t) = element else {
        return Vec::new();
    };
    let mut ops = vec![Operation::SetColumnType {
        table_id: t.table_id,
        column_id: t.column_id,
        sql_type: t.sql_type.clone(),
        nullable: t.nullable,
    }];
    if let Some(type_id) = t.type_ref {
        ops.push(Operation::UpdateTypeBackReference {
            type_id,
            table_id: t.table_id,
            present: true,
        });
    }
    ops
}

fn remove_column_type(element: &Element, _: &StatementContext) -> Vec<Operation> {
    let Element::ColumnType(t) = element else {
        return Vec::new();
    };
    let mut ops = vec![Operation::RemoveColumnType {
        table_id: t.table_id,
        column_id: t.column_id,
    }];
    if let Some(type_id) = t.type_ref {
        ops.push(Operation::UpdateTypeBackReference {
            type_id,
            table_id: t.table_id,
            present: false,
        });
    }
    ops
}

fn set_column_default(element: &Element, _: &StatementContext) -> Vec<Operation> {
    let Element::ColumnDefault(d) = element else {
        return Vec::new();
    };
    let mut ops = vec![Operation::SetColumnDefault {
        table_id: d.table_id,
        column_id: d.column_id,
        expr: d.expr.clone(),
    }];
    ops.extend(d.type_refs.iter().map(|&type_id| Operation::UpdateTypeBackReference {
        type_id,
        table_id: d.table_id,
        present: true,
    }));
    ops
}

fn remove_column_default(element: &Element, _: &StatementContext) -> Vec<Operation> {
    let Element::ColumnDefault(d) = element else {
        return Vec::new();
    };
    let mut ops = vec![Operation::RemoveColumnDefault {
        table_id: d.table_id,
        column_id: d.column_id,
    }];
    ops.extend(d.type_refs.iter().map(|&type_id| Operation::UpdateTypeBackReference {
        type_id,
        table_id: d.table_id,
        present: false,
    }));
    ops
}

fn set_column_comment(element: &Element, _: &StatementContext) -> Vec<Operation> {
    let Element::ColumnComment(c) = element else {
        return Vec::new();
    };
    vec![Operation::SetColumnComment {
        table_id: c.table_id,
        column_id: c.column_id,
        comment: c.comment.clone(),
    }]
}

fn remove_column_comment(element: &Element, _: &StatementContext) -> Vec<Operation> {
    let Element::ColumnComment(c) = element else {
        return Vec::new();
    };
    vec![Operation::RemoveColumnComment {
        table_id: c.table_id,
        column_id: c.column_id,
    }]
}

fn register_columns(registry: &mut OpRegistry) {
    registry
        .register(
            ElementKind::Column,
            TransitionSpec::to_public(Status::Absent)
                .arc(ArcSpec::to(Status::DeleteOnly).emit(add_column))
                .arc(
                    ArcSpec::to(Status::WriteOnly)
                        .min_phase(Phase::PostCommit)
                        .emit(column_write_only),
                )
                .arc(
                    ArcSpec::to(Status::Public)
                        .min_phase(Phase::PostCommit)
                        .emit(column_public),
                ),
        )
        .register(
            ElementKind::Column,
            TransitionSpec::to_absent(Status::Public)
                .arc(
                    ArcSpec::to(Status::WriteOnly)
                        .min_phase(Phase::PreCommit)
                        .emit(column_leaving),
                )
                .arc(
                    ArcSpec::to(Status::DeleteOnly)
                        .min_phase(Phase::PostCommit)
                        .non_revertible()
                        .emit(column_delete_only),
                )
                .arc(
                    ArcSpec::to(Status::Absent)
                        .min_phase(Phase::PostCommit)
                        .non_revertible()
                        .emit(remove_column),
                ),
        )
        .register(
            ElementKind::ColumnType,
            TransitionSpec::to_public(Status::Absent)
                .arc(ArcSpec::to(Status::Public).emit(set_column_type)),
        )
        .register(
            ElementKind::ColumnType,
            TransitionSpec::to_absent(Status::Public).arc(
                ArcSpec::to(Status::Absent)
                    .min_phase(Phase::PostCommit)
                    .non_revertible()
                    .emit(remove_column_type),
            ),
        )
        .register(
            ElementKind::ColumnDefault,
            TransitionSpec::to_public(Status::Absent)
                .arc(ArcSpec::to(Status::Public).emit(set_column_default)),
        )
        .register(
            ElementKind::ColumnDefault,
            TransitionSpec::to_absent(Status::Public).arc(
                ArcSpec::to(Status::Absent)
                    .min_phase(Phase::PreCommit)
                    .emit(remove_column_default),
            ),
        )
        .register(
            ElementKind::ColumnComment,
            TransitionSpec::to_public(Status::Absent)
                .arc(ArcSpec::to(Status::Public).emit(set_column_comment)),
        )
        .register(
            ElementKind::ColumnComment,
            TransitionSpec::to_absent(Status::Public).arc(
                ArcSpec::to(Status::Absent)
                    .min_phase(Phase::PreCommit)
                    .non_revertible()
                    .emit(remove_column_comment),
            ),
        );
}

// Indexes.

fn add_index(element: &Element, ctx: &StatementContext) -> Vec<Operation> {
    match element {
        Element::SecondaryIndex(i) => vec![
            Operation::AddIndex {
                table_id: i.table_id,
                index_id: i.index_id,
                key_column_ids: i.key_column_ids.clone(),
                unique: i.unique,
                state: Status::BackfillOnly,
            },
            log_event(element, ctx, Status::Public),
        ],
        Element::TemporaryIndex(i) => vec![Operation::AddIndex {
            table_id: i.table_id,
            index_id: i.index_id,
            key_column_ids: i.key_column_ids.clone(),
            unique: false,
            state: Status::DeleteOnly,
        }],
        _ => Vec::new(),
    }
}

fn backfill_index(element: &Element, _: &StatementContext) -> Vec<Operation> {
    let Element::SecondaryIndex(i) = element else {
        return Vec::new();
    };
    let mut ops = vec![Operation::BackfillIndex {
        table_id: i.table_id,
        index_id: i.index_id,
        source_index_id: PRIMARY_INDEX_ID,
        range: ShardRange::FULL,
    }];
    ops.extend(set_state(element, Status::Backfilled));
    ops
}

fn merge_index(element: &Element, _: &StatementContext) -> Vec<Operation> {
    let Element::SecondaryIndex(i) = element else {
        return Vec::new();
    };
    let mut ops: Vec<Operation> = i
        .temp_index_id
        .map(|temp_index_id| Operation::MergeIndex {
            table_id: i.table_id,
            index_id: i.index_id,
            temp_index_id,
            range: ShardRange::FULL,
        })
        .into_iter()
        .collect();
    ops.extend(set_state(element, Status::Merged));
    ops
}

fn validate_index(element: &Element, _: &StatementContext) -> Vec<Operation> {
    let Element::SecondaryIndex(i) = element else {
        return Vec::new();
    };
    let mut ops = vec![Operation::ValidateIndex {
        table_id: i.table_id,
        index_id: i.index_id,
        unique: i.unique,
        range: ShardRange::FULL,
    }];
    ops.extend(set_state(element, Status::Validated));
    ops
}

fn index_write_only(element: &Element, _: &StatementContext) -> Vec<Operation> {
    set_state(element, Status::WriteOnly)
}

fn index_public(element: &Element, _: &StatementContext) -> Vec<Operation> {
    set_state(element, Status::Public)
}

fn index_leaving(element: &Element, ctx: &StatementContext) -> Vec<Operation> {
    let mut ops = set_state(element, Status::Validated);
    ops.push(log_event(element, ctx, Status::Absent));
    ops
}

fn index_delete_only(element: &Element, _: &StatementContext) -> Vec<Operation> {
    set_state(element, Status::DeleteOnly)
}

fn temp_index_delete_only(element: &Element, _: &StatementContext) -> Vec<Operation> {
    set_state(element, Status::TransientDeleteOnly)
}

fn remove_index(element: &Element, _: &StatementContext) -> Vec<Operation> {
    let (table_id, index_id) = match element {
        Element::SecondaryIndex(i) => (i.table_id, i.index_id),
        Element::TemporaryIndex(i) => (i.table_id, i.index_id),
        _ => return Vec::new(),
    };
    vec![
        Operation::ClearIndexData {
            table_id,
            index_id,
            range: ShardRange::FULL,
        },
        Operation::RemoveIndex { table_id, index_id },
    ]
}

fn set_index_name(element: &Element, _: &StatementContext) -> Vec<Operation> {
    let Element::IndexName(n) = element else {
        return Vec::new();
    };
    vec![Operation::SetIndexName {
        table_id: n.table_id,
        index_id: n.index_id,
        name: n.name.clone(),
    }]
}

fn remove_index_name(element: &Element, _: &StatementContext) -> Vec<Operation> {
    let Element::IndexName(n) = element else {
        return Vec::new();
    };
    vec![Operation::RemoveIndexName {
        table_id: n.table_id,
        index_id: n.index_id,
    }]
}

fn register_indexes(registry: &mut OpRegistry) {
    registry
        .register(
            ElementKind::SecondaryIndex,
            TransitionSpec::to_public(Status::Absent)
                .arc(ArcSpec::to(Status::BackfillOnly).emit(add_index))
                .arc(
                    ArcSpec::to(Status::Backfilled)
                        .min_phase(Phase::PostCommit)
                        .emit(backfill_index),
                )
                .arc(
                    ArcSpec::to(Status::Merged)
                        .min_phase(Phase::PostCommit)
                        .emit(merge_index),
                )
                .arc(
                    ArcSpec::to(Status::WriteOnly)
                        .min_phase(Phase::PostCommit)
                        .emit(index_write_only),
                )
                .arc(
                    ArcSpec::to(Status::Validated)
                        .min_phase(Phase::Validation)
                        .emit(validate_index),
                )
                .arc(
                    ArcSpec::to(Status::Public)
                        .min_phase(Phase::Validation)
                        .non_revertible()
                        .emit(index_public),
                ),
        )
        .register(
            ElementKind::SecondaryIndex,
            TransitionSpec::to_absent(Status::Public)
                .arc(
                    ArcSpec::to(Status::Validated)
                        .min_phase(Phase::PreCommit)
                        .emit(index_leaving),
                )
                .arc(
                    ArcSpec::to(Status::WriteOnly)
                        .min_phase(Phase::PostCommit)
                        .emit(index_write_only),
                )
                .arc(
                    ArcSpec::to(Status::DeleteOnly)
                        .min_phase(Phase::PostCommit)
                        .non_revertible()
                        .emit(index_delete_only),
                )
                .arc(
                    ArcSpec::to(Status::Absent)
                        .min_phase(Phase::PostCommit)
                        .non_revertible()
                        .emit(remove_index),
                )
                .equiv(Status::BackfillOnly, Status::DeleteOnly)
                .equiv(Status::Backfilled, Status::DeleteOnly)
                .equiv(Status::Merged, Status::WriteOnly),
        )
        .register(
            ElementKind::TemporaryIndex,
            TransitionSpec::to_transient_absent(Status::Absent)
                .arc(ArcSpec::to(Status::DeleteOnly).emit(add_index))
                .arc(
                    ArcSpec::to(Status::WriteOnly)
                        .min_phase(Phase::PostCommit)
                        .emit(index_write_only),
                )
                .arc(
                    ArcSpec::to(Status::TransientDeleteOnly)
                        .min_phase(Phase::PostCommit)
                        .emit(temp_index_delete_only),
                )
                .arc(
                    ArcSpec::to(Status::TransientAbsent)
                        .min_phase(Phase::PostCommit)
                        .emit(remove_index),
                ),
        )
        .register(
            ElementKind::TemporaryIndex,
            TransitionSpec::to_absent(Status::WriteOnly)
                .arc(
                    ArcSpec::to(Status::DeleteOnly)
                        .min_phase(Phase::PostCommit)
                        .emit(index_delete_only),
                )
                .arc(
                    ArcSpec::to(Status::Absent)
                        .min_phase(Phase::PostCommit)
                        .non_revertible()
                        .emit(remove_index),
                )
                .equiv(Status::TransientDeleteOnly, Status::DeleteOnly)
                .equiv(Status::TransientAbsent, Status::Absent),
        )
        .register(
            ElementKind::IndexName,
            TransitionSpec::to_public(Status::Absent)
                .arc(ArcSpec::to(Status::Public).emit(set_index_name)),
        )
        .register(
            ElementKind::IndexName,
            TransitionSpec::to_absent(Status::Public).arc(
                ArcSpec::to(Status::Absent)
                    .min_phase(Phase::PreCommit)
                    .emit(remove_index_name),
            ),
        );
}

// Constraints.

fn add_constraint(element: &Element, ctx: &StatementContext) -> Vec<Operation> {
    let op = match element {
        Element::CheckConstraint(c) => Operation::AddCheckConstraint {
            table_id: c.table_id,
            constraint_id: c.constraint_id,
            expr: c.expr.clone(),
        },
        Element::ForeignKeyConstraint(c) => Operation::AddForeignKey {
            table_id: c.table_id,
            constraint_id: c.constraint_id,
            referenced_table_id: c.referenced_table_id,
        },
        _ => return Vec::new(),
    };
    vec![op, log_event(element, ctx, Status::Public)]
}

fn validate_constraint(element: &Element, _: &StatementContext) -> Vec<Operation> {
    let (constraint_id, referenced_table_id) = match element {
        Element::CheckConstraint(c) => (c.constraint_id, None),
        Element::ForeignKeyConstraint(c) => (c.constraint_id, Some(c.referenced_table_id)),
        _ => return Vec::new(),
    };
    let mut ops = vec![Operation::ValidateConstraint {
        table_id: element.owner(),
        constraint_id,
        referenced_table_id,
        range: ShardRange::FULL,
    }];
    ops.extend(set_state(element, Status::Validated));
    ops
}

fn constraint_public(element: &Element, _: &StatementContext) -> Vec<Operation> {
    set_state(element, Status::Public)
}

fn constraint_leaving(element: &Element, ctx: &StatementContext) -> Vec<Operation> {
    let mut ops = set_state(element, Status::WriteOnly);
    ops.push(log_event(element, ctx, Status::Absent));
    ops
}

fn remove_constraint(element: &Element, _: &StatementContext) -> Vec<Operation> {
    vec![Operation::RemoveConstraint {
        table_id: element.owner(),
        constraint_id: element.sub_id(),
    }]
}

fn register_constraints(registry: &mut OpRegistry) {
    for kind in [ElementKind::CheckConstraint, ElementKind::ForeignKeyConstraint] {
        registry
            .register(
                kind,
                TransitionSpec::to_public(Status::Absent)
                    .arc(ArcSpec::to(Status::WriteOnly).emit(add_constraint))
                    .arc(
                        ArcSpec::to(Status::Validated)
                            .min_phase(Phase::Validation)
                            .emit(validate_constraint),
                    )
                    .arc(
                        ArcSpec::to(Status::Public)
                            .min_phase(Phase::Validation)
                            .non_revertible()
                            .emit(constraint_public),
                    ),
            )
            .register(
                kind,
                TransitionSpec::to_absent(Status::Public)
                    .arc(
                        ArcSpec::to(Status::WriteOnly)
                            .min_phase(Phase::PreCommit)
                            .emit(constraint_leaving),
                    )
                    .arc(
                        ArcSpec::to(Status::Absent)
                            .min_phase(Phase::PostCommit)
                            .emit(remove_constraint),
                    )
                    .equiv(Status::Validated, Status::WriteOnly),
            );
    }
}
