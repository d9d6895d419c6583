//! Schema elements, statuses and targets.
//!
//! An element is an immutable fact about one schema sub-object: "this column
//! exists", "this index keys on these columns", "this constraint references
//! that table". Every element travels between statuses; the planner is handed
//! a set of [`TargetState`]s saying where each element is now and where it
//! should end up.

mod model;

pub use model::ElementModel;

use serde::{Deserialize, Serialize};

/// Descriptor identifier (tables and user-defined types).
pub type DescId = u32;
/// Column identifier, unique within a table.
pub type ColumnId = u32;
/// Index identifier, unique within a table.
pub type IndexId = u32;
/// Constraint identifier, unique within a table.
pub type ConstraintId = u32;

/// The closed set of element kinds the planner understands.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    /// A table descriptor.
    Table,
    /// A user-defined enum type descriptor.
    EnumType,
    /// A column of a table.
    Column,
    /// The data type of a column.
    ColumnType,
    /// The default expression of a column.
    ColumnDefault,
    /// A comment attached to a column.
    ColumnComment,
    /// A secondary index of a table.
    SecondaryIndex,
    /// A temporary index capturing writes while a secondary index backfills.
    TemporaryIndex,
    /// The name of an index.
    IndexName,
    /// A check constraint.
    CheckConstraint,
    /// A foreign key constraint.
    ForeignKeyConstraint,
}

impl ElementKind {
    /// Every element kind, in identity order.
    pub const ALL: [ElementKind; 11] = [
        ElementKind::Table,
        ElementKind::EnumType,
        ElementKind::Column,
        ElementKind::ColumnType,
        ElementKind::ColumnDefault,
        ElementKind::ColumnComment,
        ElementKind::SecondaryIndex,
        ElementKind::TemporaryIndex,
        ElementKind::IndexName,
        ElementKind::CheckConstraint,
        ElementKind::ForeignKeyConstraint,
    ];

    /// Directions a kind can travel in. Temporary indexes only ever exist
    /// transiently, so they never travel to public.
    pub fn directions(&self) -> &'static [Direction] {
        match self {
            ElementKind::TemporaryIndex => &[Direction::ToTransientAbsent, Direction::ToAbsent],
            _ => &[Direction::ToPublic, Direction::ToAbsent],
        }
    }

    /// Human-readable kind name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Table => "Table",
            ElementKind::EnumType => "EnumType",
            ElementKind::Column => "Column",
            ElementKind::ColumnType => "ColumnType",
            ElementKind::ColumnDefault => "ColumnDefault",
            ElementKind::ColumnComment => "ColumnComment",
            ElementKind::SecondaryIndex => "SecondaryIndex",
            ElementKind::TemporaryIndex => "TemporaryIndex",
            ElementKind::IndexName => "IndexName",
            ElementKind::CheckConstraint => "CheckConstraint",
            ElementKind::ForeignKeyConstraint => "ForeignKeyConstraint",
        }
    }

    /// Whether elements of this kind live inside a table descriptor.
    pub fn is_table_component(&self) -> bool {
        !matches!(self, ElementKind::Table | ElementKind::EnumType)
    }
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle position of an element.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// The element does not exist.
    Absent,
    /// The element is fully visible to every transaction.
    Public,
    /// The element existed transiently and is gone again.
    TransientAbsent,
    /// A descriptor marked as dropped, awaiting deletion.
    Dropped,
    /// Writes delete entries for this element but never add them.
    DeleteOnly,
    /// Writes maintain this element but reads ignore it.
    WriteOnly,
    /// An index that accepts backfill writes only.
    BackfillOnly,
    /// An index whose historical data has been backfilled.
    Backfilled,
    /// An index whose temporary-index writes have been merged in.
    Merged,
    /// Data has been validated against the element.
    Validated,
    /// A transient element on its way out.
    TransientDeleteOnly,
}

impl Status {
    /// Canonical upper-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Absent => "ABSENT",
            Status::Public => "PUBLIC",
            Status::TransientAbsent => "TRANSIENT_ABSENT",
            Status::Dropped => "DROPPED",
            Status::DeleteOnly => "DELETE_ONLY",
            Status::WriteOnly => "WRITE_ONLY",
            Status::BackfillOnly => "BACKFILL_ONLY",
            Status::Backfilled => "BACKFILLED",
            Status::Merged => "MERGED",
            Status::Validated => "VALIDATED",
            Status::TransientDeleteOnly => "TRANSIENT_DELETE_ONLY",
        }
    }

    /// Direction of travel implied by using this status as a target.
    ///
    /// Only terminal statuses are valid targets.
    pub fn direction(&self) -> Option<Direction> {
        match self {
            Status::Public => Some(Direction::ToPublic),
            Status::Absent => Some(Direction::ToAbsent),
            Status::TransientAbsent => Some(Direction::ToTransientAbsent),
            _ => None,
        }
    }

    /// The target a rollback substitutes for this target.
    pub fn reversed(&self) -> Status {
        match self {
            Status::Public | Status::TransientAbsent => Status::Absent,
            Status::Absent => Status::Public,
            other => *other,
        }
    }

    /// Whether this is a transient status.
    pub fn is_transient(&self) -> bool {
        matches!(self, Status::TransientAbsent | Status::TransientDeleteOnly)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of travel toward a target status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// ABSENT towards PUBLIC.
    ToPublic,
    /// PUBLIC towards ABSENT.
    ToAbsent,
    /// ABSENT through a transient existence back to TRANSIENT_ABSENT.
    ToTransientAbsent,
}

impl Direction {
    /// Whether the element is being created (permanently or transiently).
    pub fn is_adding(&self) -> bool {
        !matches!(self, Direction::ToAbsent)
    }

    /// Terminal status of this direction.
    pub fn terminal(&self) -> Status {
        match self {
            Direction::ToPublic => Status::Public,
            Direction::ToAbsent => Status::Absent,
            Direction::ToTransientAbsent => Status::TransientAbsent,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ToPublic => write!(f, "to_public"),
            Direction::ToAbsent => write!(f, "to_absent"),
            Direction::ToTransientAbsent => write!(f, "to_transient_absent"),
        }
    }
}

/// Stable identity of an element: kind plus owning descriptor plus sub-id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ElementKey {
    /// Element kind.
    pub kind: ElementKind,
    /// Owning descriptor.
    pub owner: DescId,
    /// Sub-object id within the owner (0 for descriptors).
    pub sub_id: u32,
}

impl std::fmt::Display for ElementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.sub_id == 0 {
            write!(f, "{}({})", self.kind, self.owner)
        } else {
            write!(f, "{}({}.{})", self.kind, self.owner, self.sub_id)
        }
    }
}

/// A table descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Table {
    /// Descriptor id.
    pub table_id: DescId,
    /// Table name.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// A user-defined enum type descriptor.
pub struct EnumType {
    /// Descriptor id.
    pub type_id: DescId,
    /// Type name.
    pub name: String,
    /// Labels in declaration order.
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// A column of a table. Its type, default and comment are separate elements.
pub struct Column {
    /// Owning table.
    pub table_id: DescId,
    /// Column id within the table.
    pub column_id: ColumnId,
    /// Column name.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Type of a column.
pub struct ColumnType {
    /// Owning table.
    pub table_id: DescId,
    /// Typed column.
    pub column_id: ColumnId,
    /// SQL spelling of the type, e.g. `INT8` or the enum type name.
    pub sql_type: String,
    /// Whether NULL is accepted.
    pub nullable: bool,
    /// User-defined type this column is typed as, if any.
    #[serde(default)]
    pub type_ref: Option<DescId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Default expression of a column.
pub struct ColumnDefault {
    /// Owning table.
    pub table_id: DescId,
    /// Column the default applies to.
    pub column_id: ColumnId,
    /// SQL expression text.
    pub expr: String,
    /// User-defined types referenced by the expression.
    #[serde(default)]
    pub type_refs: Vec<DescId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Comment attached to a column.
pub struct ColumnComment {
    /// Owning table.
    pub table_id: DescId,
    /// Commented column.
    pub column_id: ColumnId,
    /// Comment text.
    pub comment: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// A secondary index, built by backfill and merged from its temporary index.
pub struct SecondaryIndex {
    /// Owning table.
    pub table_id: DescId,
    /// Index id within the table.
    pub index_id: IndexId,
    /// Key columns in order.
    pub key_column_ids: Vec<ColumnId>,
    /// Extra columns stored in the index entries.
    #[serde(default)]
    pub storing_column_ids: Vec<ColumnId>,
    /// Whether the key must be unique. Checked when the index is validated.
    #[serde(default)]
    pub unique: bool,
    /// Temporary index that captures concurrent writes during the backfill.
    #[serde(default)]
    pub temp_index_id: Option<IndexId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Index that only exists while its secondary index is being built. It
/// ends transiently absent and is never made public.
pub struct TemporaryIndex {
    /// Owning table.
    pub table_id: DescId,
    /// Index id within the table.
    pub index_id: IndexId,
    /// The secondary index this temporary index feeds.
    pub source_index_id: IndexId,
    /// Same key columns as the source index.
    pub key_column_ids: Vec<ColumnId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// Name of a secondary index, visible once the index is public.
pub struct IndexName {
    /// Owning table.
    pub table_id: DescId,
    /// Named index.
    pub index_id: IndexId,
    /// Index name.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// A CHECK constraint.
pub struct CheckConstraint {
    /// Owning table.
    pub table_id: DescId,
    /// Constraint id within the table.
    pub constraint_id: ConstraintId,
    /// Columns the expression reads.
    pub column_ids: Vec<ColumnId>,
    /// Boolean SQL expression.
    pub expr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
/// A foreign key from columns of one table to columns of another.
pub struct ForeignKeyConstraint {
    /// Referencing table.
    pub table_id: DescId,
    /// Constraint id within the referencing table.
    pub constraint_id: ConstraintId,
    /// Referencing columns.
    pub column_ids: Vec<ColumnId>,
    /// Referenced table.
    pub referenced_table_id: DescId,
    /// Referenced columns, paired with `column_ids`.
    pub referenced_column_ids: Vec<ColumnId>,
}

/// A typed, immutable fact about one schema sub-object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Element {
    /// See [`Table`].
    Table(Table),
    /// See [`EnumType`].
    EnumType(EnumType),
    /// See [`Column`].
    Column(Column),
    /// See [`ColumnType`].
    ColumnType(ColumnType),
    /// See [`ColumnDefault`].
    ColumnDefault(ColumnDefault),
    /// See [`ColumnComment`].
    ColumnComment(ColumnComment),
    /// See [`SecondaryIndex`].
    SecondaryIndex(SecondaryIndex),
    /// See [`TemporaryIndex`].
    TemporaryIndex(TemporaryIndex),
    /// See [`IndexName`].
    IndexName(IndexName),
    /// See [`CheckConstraint`].
    CheckConstraint(CheckConstraint),
    /// See [`ForeignKeyConstraint`].
    ForeignKeyConstraint(ForeignKeyConstraint),
}

impl Element {
    /// The kind of this element.
    pub fn kind(&self) -> ElementKind {
        match self {
            Element::Table(_) => ElementKind::Table,
            Element::EnumType(_) => ElementKind::EnumType,
            Element::Column(_) => ElementKind::Column,
            Element::ColumnType(_) => ElementKind::ColumnType,
            Element::ColumnDefault(_) => ElementKind::ColumnDefault,
            Element::ColumnComment(_) => ElementKind::ColumnComment,
            Element::SecondaryIndex(_) => ElementKind::SecondaryIndex,
            Element::TemporaryIndex(_) => ElementKind::TemporaryIndex,
            Element::IndexName(_) => ElementKind::IndexName,
            Element::CheckConstraint(_) => ElementKind::CheckConstraint,
            Element::ForeignKeyConstraint(_) => ElementKind::ForeignKeyConstraint,
        }
    }

    /// The descriptor that owns this element.
    pub fn owner(&self) -> DescId {
        match self {
            Element::Table(e) => e.table_id,
            Element::EnumType(e) => e.type_id,
            Element::Column(e) => e.table_id,
            Element::ColumnType(e) => e.table_id,
            Element::ColumnDefault(e) => e.table_id,
            Element::ColumnComment(e) => e.table_id,
            Element::SecondaryIndex(e) => e.table_id,
            Element::TemporaryIndex(e) => e.table_id,
            Element::IndexName(e) => e.table_id,
            Element::CheckConstraint(e) => e.table_id,
            Element::ForeignKeyConstraint(e) => e.table_id,
        }
    }

    /// Sub-object id within the owning descriptor.
    pub fn sub_id(&self) -> u32 {
        match self {
            Element::Table(_) | Element::EnumType(_) => 0,
            Element::Column(e) => e.column_id,
            Element::ColumnType(e) => e.column_id,
            Element::ColumnDefault(e) => e.column_id,
            Element::ColumnComment(e) => e.column_id,
            Element::SecondaryIndex(e) => e.index_id,
            Element::TemporaryIndex(e) => e.index_id,
            Element::IndexName(e) => e.index_id,
            Element::CheckConstraint(e) => e.constraint_id,
            Element::ForeignKeyConstraint(e) => e.constraint_id,
        }
    }

    /// Stable identity of this element.
    pub fn key(&self) -> ElementKey {
        ElementKey {
            kind: self.kind(),
            owner: self.owner(),
            sub_id: self.sub_id(),
        }
    }

    /// The column this element describes, for column sub-elements.
    pub fn column_id(&self) -> Option<ColumnId> {
        match self {
            Element::Column(e) => Some(e.column_id),
            Element::ColumnType(e) => Some(e.column_id),
            Element::ColumnDefault(e) => Some(e.column_id),
            Element::ColumnComment(e) => Some(e.column_id),
            _ => None,
        }
    }

    /// Columns of the owning table this element reads or keys on.
    pub fn referenced_columns(&self) -> Vec<ColumnId> {
        match self {
            Element::SecondaryIndex(e) => e
                .key_column_ids
                .iter()
                .chain(e.storing_column_ids.iter())
                .copied()
                .collect(),
            Element::TemporaryIndex(e) => e.key_column_ids.clone(),
            Element::CheckConstraint(e) => e.column_ids.clone(),
            Element::ForeignKeyConstraint(e) => e.column_ids.clone(),
            _ => Vec::new(),
        }
    }

    /// Descriptors other than the owner that this element refers to.
    pub fn referenced_descriptors(&self) -> Vec<DescId> {
        match self {
            Element::ColumnType(e) => e.type_ref.into_iter().collect(),
            Element::ColumnDefault(e) => e.type_refs.clone(),
            Element::ForeignKeyConstraint(e) if e.referenced_table_id != e.table_id => {
                vec![e.referenced_table_id]
            }
            _ => Vec::new(),
        }
    }

    /// Check that the identity and payload are well formed.
    pub fn validate(&self) -> Result<(), String> {
        if self.owner() == 0 {
            return Err("descriptor id must be non-zero".to_string());
        }
        if self.kind().is_table_component() && self.sub_id() == 0 {
            return Err("sub-object id must be non-zero".to_string());
        }
        match self {
            Element::Table(e) if e.name.is_empty() => Err("table name is empty".to_string()),
            Element::EnumType(e) if e.name.is_empty() => Err("type name is empty".to_string()),
            Element::Column(e) if e.name.is_empty() => Err("column name is empty".to_string()),
            Element::ColumnType(e) if e.sql_type.is_empty() => {
                Err("column type is empty".to_string())
            }
            Element::ColumnType(ColumnType {
                type_ref: Some(0), ..
            }) => Err("type reference must be non-zero".to_string()),
            Element::IndexName(e) if e.name.is_empty() => Err("index name is empty".to_string()),
            Element::SecondaryIndex(e) if e.key_column_ids.is_empty() => {
                Err("index has no key columns".to_string())
            }
            Element::TemporaryIndex(e) if e.key_column_ids.is_empty() => {
                Err("temporary index has no key columns".to_string())
            }
            Element::TemporaryIndex(e) if e.source_index_id == 0 => {
                Err("temporary index has no source index".to_string())
            }
            Element::CheckConstraint(e) if e.column_ids.is_empty() => {
                Err("check constraint references no columns".to_string())
            }
            Element::ForeignKeyConstraint(e)
                if e.column_ids.is_empty()
                    || e.column_ids.len() != e.referenced_column_ids.len() =>
            {
                Err("foreign key column lists are empty or mismatched".to_string())
            }
            Element::ForeignKeyConstraint(e) if e.referenced_table_id == 0 => {
                Err("foreign key references no table".to_string())
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())?;
        match self {
            Element::Table(e) => write!(f, " {}", e.name),
            Element::EnumType(e) => write!(f, " {}", e.name),
            Element::Column(e) => write!(f, " {}", e.name),
            Element::IndexName(e) => write!(f, " {}", e.name),
            _ => Ok(()),
        }
    }
}

/// An element paired with where it is now and where it should end up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetState {
    /// The element.
    pub element: Element,
    /// Durable status right now.
    pub current: Status,
    /// Status the change should leave the element in.
    pub target: Status,
}

impl TargetState {
    /// Create a target state.
    pub fn new(element: Element, current: Status, target: Status) -> Self {
        Self {
            element,
            current,
            target,
        }
    }

    /// An element being added: ABSENT towards PUBLIC.
    pub fn adding(element: Element) -> Self {
        Self::new(element, Status::Absent, Status::Public)
    }

    /// An element being dropped: PUBLIC towards ABSENT.
    pub fn dropping(element: Element) -> Self {
        Self::new(element, Status::Public, Status::Absent)
    }

    /// An element that exists only for the duration of the change.
    pub fn transient(element: Element) -> Self {
        Self::new(element, Status::Absent, Status::TransientAbsent)
    }

    /// An element that is already public and stays that way.
    pub fn existing(element: Element) -> Self {
        Self::new(element, Status::Public, Status::Public)
    }

    /// Direction of travel, if the target is a terminal status.
    pub fn direction(&self) -> Option<Direction> {
        self.target.direction()
    }

    /// Whether the element is already at its target.
    pub fn is_trivial(&self) -> bool {
        self.current == self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(table_id: DescId, column_id: ColumnId) -> Element {
        Element::Column(Column {
            table_id,
            column_id,
            name: format!("c{column_id}"),
        })
    }

    #[test]
    fn test_element_key() {
        let key = column(52, 3).key();
        assert_eq!(key.kind, ElementKind::Column);
        assert_eq!(key.owner, 52);
        assert_eq!(key.sub_id, 3);
        assert_eq!(key.to_string(), "Column(52.3)");
    }

    #[test]
    fn test_status_direction() {
        assert_eq!(Status::Public.direction(), Some(Direction::ToPublic));
        assert_eq!(Status::Absent.direction(), Some(Direction::ToAbsent));
        assert_eq!(
            Status::TransientAbsent.direction(),
            Some(Direction::ToTransientAbsent)
        );
        assert_eq!(Status::WriteOnly.direction(), None);
    }

    #[test]
    fn test_status_reversed() {
        assert_eq!(Status::Public.reversed(), Status::Absent);
        assert_eq!(Status::Absent.reversed(), Status::Public);
        assert_eq!(Status::TransientAbsent.reversed(), Status::Absent);
    }

    #[test]
    fn test_validate_rejects_zero_ids() {
        assert!(column(0, 1).validate().is_err());
        assert!(column(52, 0).validate().is_err());
        assert!(column(52, 1).validate().is_ok());
    }

    #[test]
    fn test_validate_foreign_key_columns() {
        let fk = Element::ForeignKeyConstraint(ForeignKeyConstraint {
            table_id: 52,
            constraint_id: 2,
            column_ids: vec![1, 2],
            referenced_table_id: 53,
            referenced_column_ids: vec![1],
        });
        assert!(fk.validate().is_err());
    }

    #[test]
    fn test_referenced_descriptors() {
        let ty = Element::ColumnType(ColumnType {
            table_id: 52,
            column_id: 1,
            sql_type: "mood".to_string(),
            nullable: true,
            type_ref: Some(60),
        });
        assert_eq!(ty.referenced_descriptors(), vec![60]);

        let self_fk = Element::ForeignKeyConstraint(ForeignKeyConstraint {
            table_id: 52,
            constraint_id: 2,
            column_ids: vec![1],
            referenced_table_id: 52,
            referenced_column_ids: vec![1],
        });
        assert!(self_fk.referenced_descriptors().is_empty());
    }

    #[test]
    fn test_element_serde_tagging() {
        let json = serde_json::to_string(&column(52, 3)).unwrap();
        assert!(json.contains("\"kind\":\"column\""));
        let back: Element = serde_json::from_str(&json).unwrap();
        assert_eq!(back, column(52, 3));
    }
}
