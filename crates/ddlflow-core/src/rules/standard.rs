//! Built-in dependency rules.

use super::{dependent, source, Constraint, Guard, Relation, Rule, StatusSel, Travel};
use crate::element::{ElementKind, Status};

use Constraint::{Independent, MutuallyExclusive};
use StatusSel::{Final, First, Is};

fn precedes(earlier: super::Endpoint, later: super::Endpoint) -> Constraint {
    Constraint::precedes(earlier, later)
}

fn same_stage(a: super::Endpoint, b: super::Endpoint) -> Constraint {
    Constraint::same_stage(a, b)
}

/// Split a constraint by direction: both adding, both dropping, anything else.
fn by_direction(adding: Constraint, dropping: Constraint, mixed: Constraint) -> Constraint {
    Constraint::when(
        Guard::both(Travel::Adding),
        adding,
        Constraint::when(Guard::both(Travel::Dropping), dropping, mixed),
    )
}

pub(super) fn rules() -> Vec<Rule> {
    let mut rules = Vec::new();

    for component in ElementKind::ALL.into_iter().filter(ElementKind::is_table_component) {
        rules.push(Rule::new(
            "table exists around its components",
            ElementKind::Table,
            component,
            Relation::Parent,
            by_direction(
                precedes(source(Is(Status::Public)), dependent(First)),
                Constraint::All(vec![
                    precedes(source(Is(Status::Dropped)), dependent(First)),
                    precedes(dependent(Final), source(Final)),
                ]),
                MutuallyExclusive,
            ),
        ));
    }

    rules.extend([
        Rule::new(
            "column type set with the column",
            ElementKind::Column,
            ElementKind::ColumnType,
            Relation::SameColumn,
            by_direction(
                same_stage(source(Is(Status::DeleteOnly)), dependent(Is(Status::Public))),
                same_stage(source(Is(Status::Absent)), dependent(Is(Status::Absent))),
                MutuallyExclusive,
            ),
        ),
        Rule::new(
            "column default needs a column",
            ElementKind::Column,
            ElementKind::ColumnDefault,
            Relation::SameColumn,
            by_direction(
                precedes(source(Is(Status::DeleteOnly)), dependent(Is(Status::Public))),
                precedes(dependent(Is(Status::Absent)), source(Is(Status::DeleteOnly))),
                Constraint::when(
                    Guard::new(Travel::Dropping, Travel::Adding),
                    MutuallyExclusive,
                    Independent,
                ),
            ),
        ),
        Rule::new(
            "column comment needs a column",
            ElementKind::Column,
            ElementKind::ColumnComment,
            Relation::SameColumn,
            by_direction(
                precedes(source(Is(Status::DeleteOnly)), dependent(Is(Status::Public))),
                precedes(dependent(Is(Status::Absent)), source(Is(Status::Absent))),
                Constraint::when(
                    Guard::new(Travel::Dropping, Travel::Adding),
                    MutuallyExclusive,
                    Independent,
                ),
            ),
        ),
        Rule::new(
            "index backfills from public columns",
            ElementKind::Column,
            ElementKind::SecondaryIndex,
            Relation::ColumnReference,
            by_direction(
                precedes(source(Is(Status::Public)), dependent(Is(Status::Backfilled))),
                Constraint::All(vec![
                    precedes(dependent(Is(Status::DeleteOnly)), source(Is(Status::DeleteOnly))),
                    precedes(dependent(Final), source(Final)),
                ]),
                MutuallyExclusive,
            ),
        ),
        Rule::new(
            "temporary index follows its columns",
            ElementKind::Column,
            ElementKind::TemporaryIndex,
            Relation::ColumnReference,
            by_direction(
                precedes(source(First), dependent(First)),
                precedes(dependent(Final), source(Final)),
                MutuallyExclusive,
            ),
        ),
        Rule::new(
            "check constraint validated over public columns",
            ElementKind::Column,
            ElementKind::CheckConstraint,
            Relation::ColumnReference,
            by_direction(
                precedes(source(Is(Status::Public)), dependent(Is(Status::Validated))),
                precedes(dependent(Final), source(Is(Status::DeleteOnly))),
                MutuallyExclusive,
            ),
        ),
        Rule::new(
            "foreign key validated over public columns",
            ElementKind::Column,
            ElementKind::ForeignKeyConstraint,
            Relation::ColumnReference,
            by_direction(
                precedes(source(Is(Status::Public)), dependent(Is(Status::Validated))),
                precedes(dependent(Final), source(Is(Status::DeleteOnly))),
                MutuallyExclusive,
            ),
        ),
        Rule::new(
            "index named when public",
            ElementKind::SecondaryIndex,
            ElementKind::IndexName,
            Relation::IndexComponent,
            by_direction(
                same_stage(source(Is(Status::Public)), dependent(Is(Status::Public))),
                same_stage(source(Is(Status::Validated)), dependent(Is(Status::Absent))),
                MutuallyExclusive,
            ),
        ),
        Rule::new(
            "temporary index brackets backfill and merge",
            ElementKind::SecondaryIndex,
            ElementKind::TemporaryIndex,
            Relation::IndexComponent,
            by_direction(
                Constraint::All(vec![
                    precedes(dependent(Is(Status::WriteOnly)), source(Is(Status::Backfilled))),
                    precedes(
                        source(Is(Status::Merged)),
                        dependent(Is(Status::TransientDeleteOnly)),
                    ),
                ]),
                Independent,
                Independent,
            ),
        ),
        Rule::new(
            "type exists around its column types",
            ElementKind::EnumType,
            ElementKind::ColumnType,
            Relation::TypeReference,
            by_direction(
                precedes(source(Is(Status::Public)), dependent(Is(Status::Public))),
                precedes(dependent(Final), source(Final)),
                MutuallyExclusive,
            ),
        ),
        Rule::new(
            "type exists around its defaults",
            ElementKind::EnumType,
            ElementKind::ColumnDefault,
            Relation::TypeReference,
            by_direction(
                precedes(source(Is(Status::Public)), dependent(Is(Status::Public))),
                precedes(dependent(Final), source(Final)),
                MutuallyExclusive,
            ),
        ),
        Rule::new(
            "referenced table exists around its foreign keys",
            ElementKind::Table,
            ElementKind::ForeignKeyConstraint,
            Relation::TableReference,
            by_direction(
                precedes(source(Is(Status::Public)), dependent(First)),
                precedes(dependent(Final), source(Final)),
                MutuallyExclusive,
            ),
        ),
    ]);

    rules
}
