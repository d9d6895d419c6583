//! Indexed, immutable view over a set of targets.

use std::collections::{BTreeMap, HashMap};

use super::{DescId, Element, ElementKey, ElementKind, Status, TargetState};
use crate::error::PlanError;

/// Arena of targets with lookup indices built once per planning attempt.
///
/// Entries are sorted by [`ElementKey`], so an entry's position is a stable,
/// deterministic handle for the lifetime of the model. Everything downstream
/// (graph nodes, checkpointed statuses) refers to elements by that position.
#[derive(Debug, Clone)]
pub struct ElementModel {
    entries: Vec<TargetState>,
    by_key: HashMap<ElementKey, usize>,
    by_kind: BTreeMap<ElementKind, Vec<usize>>,
    by_owner: HashMap<DescId, Vec<usize>>,
    by_reference: HashMap<DescId, Vec<usize>>,
}

impl ElementModel {
    /// Build a model, validating every element and the one-target-per-identity
    /// invariant.
    pub fn new(mut entries: Vec<TargetState>) -> Result<Self, PlanError> {
        for entry in &entries {
            entry
                .element
                .validate()
                .map_err(|reason| PlanError::MalformedElement {
                    element: entry.element.to_string(),
                    reason,
                })?;
        }

        entries.sort_by_key(|e| e.element.key());

        let mut by_key = HashMap::with_capacity(entries.len());
        let mut by_kind: BTreeMap<ElementKind, Vec<usize>> = BTreeMap::new();
        let mut by_owner: HashMap<DescId, Vec<usize>> = HashMap::new();
        let mut by_reference: HashMap<DescId, Vec<usize>> = HashMap::new();

        for (idx, entry) in entries.iter().enumerate() {
            let key = entry.element.key();
            if by_key.insert(key, idx).is_some() {
                return Err(PlanError::DuplicateTarget {
                    element: key.to_string(),
                });
            }
            by_kind.entry(key.kind).or_default().push(idx);
            by_owner.entry(key.owner).or_default().push(idx);
            for referenced in entry.element.referenced_descriptors() {
                by_reference.entry(referenced).or_default().push(idx);
            }
        }

        Ok(Self {
            entries,
            by_key,
            by_kind,
            by_owner,
            by_reference,
        })
    }

    /// Number of targets.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the model has no targets.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All targets in identity order.
    pub fn entries(&self) -> &[TargetState] {
        &self.entries
    }

    /// Target at an arena position.
    pub fn get(&self, idx: usize) -> Option<&TargetState> {
        self.entries.get(idx)
    }

    /// Element at an arena position.
    ///
    /// Panics if `idx` did not come from this model.
    pub fn element(&self, idx: usize) -> &Element {
        &self.entries[idx].element
    }

    /// Arena position of an element identity.
    pub fn position(&self, key: &ElementKey) -> Option<usize> {
        self.by_key.get(key).copied()
    }

    /// Target for an element identity.
    pub fn find(&self, key: &ElementKey) -> Option<&TargetState> {
        self.position(key).map(|idx| &self.entries[idx])
    }

    /// Positions of all elements of a kind.
    pub fn by_kind(&self, kind: ElementKind) -> &[usize] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Positions of all elements owned by a descriptor.
    pub fn by_owner(&self, owner: DescId) -> &[usize] {
        self.by_owner.get(&owner).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Positions of all elements that refer to a descriptor they do not own.
    pub fn referencing(&self, desc_id: DescId) -> &[usize] {
        self.by_reference
            .get(&desc_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Positions of every element that may be related to `idx`: elements of
    /// the same owner, elements referring to its owner, and elements owned by
    /// descriptors it refers to. `idx` itself is excluded.
    pub fn neighbors(&self, idx: usize) -> Vec<usize> {
        let element = &self.entries[idx].element;
        let mut out: Vec<usize> = self
            .by_owner(element.owner())
            .iter()
            .chain(self.referencing(element.owner()))
            .copied()
            .collect();
        for referenced in element.referenced_descriptors() {
            out.extend_from_slice(self.by_owner(referenced));
        }
        out.sort_unstable();
        out.dedup();
        out.retain(|&other| other != idx);
        out
    }

    /// Current statuses, indexed by arena position.
    pub fn current_statuses(&self) -> Vec<Status> {
        self.entries.iter().map(|e| e.current).collect()
    }

    /// The target set a rollback drives to, given the statuses reached so far.
    ///
    /// Non-trivial targets flip direction and start from the reached status;
    /// trivial targets are kept as they are.
    pub fn reversed(&self, reached: &[Status]) -> Result<ElementModel, PlanError> {
        if reached.len() != self.entries.len() {
            return Err(PlanError::StatusMismatch {
                expected: self.entries.len(),
                found: reached.len(),
            });
        }
        let entries = self
            .entries
            .iter()
            .zip(reached)
            .map(|(entry, &status)| {
                let target = if entry.is_trivial() {
                    entry.target
                } else {
                    entry.target.reversed()
                };
                TargetState::new(entry.element.clone(), status, target)
            })
            .collect();
        ElementModel::new(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Column, ColumnType, EnumType, SecondaryIndex, Table};

    fn table(id: DescId) -> Element {
        Element::Table(Table {
            table_id: id,
            name: format!("t{id}"),
        })
    }

    fn column(table_id: DescId, column_id: u32) -> Element {
        Element::Column(Column {
            table_id,
            column_id,
            name: format!("c{column_id}"),
        })
    }

    fn sample_model() -> ElementModel {
        ElementModel::new(vec![
            TargetState::adding(Element::SecondaryIndex(SecondaryIndex {
                table_id: 52,
                index_id: 2,
                key_column_ids: vec![2],
                storing_column_ids: vec![],
                unique: false,
                temp_index_id: None,
            })),
            TargetState::adding(column(52, 2)),
            TargetState::existing(table(52)),
            TargetState::existing(Element::EnumType(EnumType {
                type_id: 60,
                name: "mood".to_string(),
                labels: vec!["ok".to_string()],
            })),
            TargetState::adding(Element::ColumnType(ColumnType {
                table_id: 52,
                column_id: 2,
                sql_type: "mood".to_string(),
                nullable: true,
                type_ref: Some(60),
            })),
        ])
        .unwrap()
    }

    #[test]
    fn test_entries_sorted_by_identity() {
        let model = sample_model();
        let kinds: Vec<_> = model.entries().iter().map(|e| e.element.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ElementKind::Table,
                ElementKind::EnumType,
                ElementKind::Column,
                ElementKind::ColumnType,
                ElementKind::SecondaryIndex,
            ]
        );
    }

    #[test]
    fn test_lookup_indices() {
        let model = sample_model();
        assert_eq!(model.by_kind(ElementKind::Column).len(), 1);
        assert_eq!(model.by_owner(52).len(), 4);
        assert_eq!(model.referencing(60).len(), 1);
        assert!(model.by_kind(ElementKind::CheckConstraint).is_empty());

        let key = column(52, 2).key();
        let found = model.find(&key).unwrap();
        assert_eq!(found.target, Status::Public);
    }

    #[test]
    fn test_neighbors_follow_references() {
        let model = sample_model();
        let enum_idx = model.by_kind(ElementKind::EnumType)[0];
        let type_idx = model.by_kind(ElementKind::ColumnType)[0];
        assert!(model.neighbors(enum_idx).contains(&type_idx));
        assert!(model.neighbors(type_idx).contains(&enum_idx));
        assert!(!model.neighbors(type_idx).contains(&type_idx));
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let result = ElementModel::new(vec![
            TargetState::adding(column(52, 2)),
            TargetState::dropping(column(52, 2)),
        ]);
        assert!(matches!(result, Err(PlanError::DuplicateTarget { .. })));
    }

    #[test]
    fn test_malformed_element_rejected() {
        let result = ElementModel::new(vec![TargetState::adding(column(52, 0))]);
        assert!(matches!(result, Err(PlanError::MalformedElement { .. })));
    }

    #[test]
    fn test_reversed_flips_non_trivial_targets() {
        let model = sample_model();
        let mut reached = model.current_statuses();
        let column_idx = model.by_kind(ElementKind::Column)[0];
        reached[column_idx] = Status::WriteOnly;

        let reversed = model.reversed(&reached).unwrap();
        let column = reversed.get(column_idx).unwrap();
        assert_eq!(column.current, Status::WriteOnly);
        assert_eq!(column.target, Status::Absent);

        let table_idx = model.by_kind(ElementKind::Table)[0];
        assert!(reversed.get(table_idx).unwrap().is_trivial());
    }
}
