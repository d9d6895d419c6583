//! Dependency rules between related elements.
//!
//! A rule names an ordered pair of element kinds, the relation that must hold
//! between two concrete elements for it to apply, and a constraint on the
//! statuses they pass through. Applying a rule set to a model yields status
//! level edges that the planner resolves to graph nodes.
//!
//! Rule sets are exhaustive: every kind pair a relation can connect must be
//! covered by at least one rule, even if that rule only declares the pair
//! independent.

mod standard;

use std::collections::BTreeMap;

use tracing::trace;

use crate::element::{Direction, Element, ElementKind, ElementModel, Status};
use crate::error::PlanError;

/// How two elements can be related.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Relation {
    /// A table and an element it owns.
    Parent,
    /// A column and one of its attributes (type, default, comment).
    SameColumn,
    /// A column and an index or constraint over it.
    ColumnReference,
    /// A secondary index and its name or temporary index.
    IndexComponent,
    /// A user-defined type and an element typed by it.
    TypeReference,
    /// A table and a foreign key of another table referencing it.
    TableReference,
}

impl Relation {
    /// Every relation.
    pub const ALL: [Relation; 6] = [
        Relation::Parent,
        Relation::SameColumn,
        Relation::ColumnReference,
        Relation::IndexComponent,
        Relation::TypeReference,
        Relation::TableReference,
    ];

    /// Kind pairs this relation can connect, source kind first.
    pub fn kind_pairs(&self) -> Vec<(ElementKind, ElementKind)> {
        use ElementKind::*;
        match self {
            Relation::Parent => ElementKind::ALL
                .into_iter()
                .filter(ElementKind::is_table_component)
                .map(|k| (Table, k))
                .collect(),
            Relation::SameColumn => vec![
                (Column, ColumnType),
                (Column, ColumnDefault),
                (Column, ColumnComment),
            ],
            Relation::ColumnReference => vec![
                (Column, SecondaryIndex),
                (Column, TemporaryIndex),
                (Column, CheckConstraint),
                (Column, ForeignKeyConstraint),
            ],
            Relation::IndexComponent => {
                vec![(SecondaryIndex, IndexName), (SecondaryIndex, TemporaryIndex)]
            }
            Relation::TypeReference => vec![(EnumType, ColumnType), (EnumType, ColumnDefault)],
            Relation::TableReference => vec![(Table, ForeignKeyConstraint)],
        }
    }

    /// Whether the relation holds from `source` to `dependent`.
    pub fn holds(&self, source: &Element, dependent: &Element) -> bool {
        match (self, source, dependent) {
            (Relation::Parent, Element::Table(t), d) => {
                d.kind().is_table_component() && d.owner() == t.table_id
            }
            (Relation::SameColumn, Element::Column(c), d) => {
                d.kind() != ElementKind::Column
                    && d.owner() == c.table_id
                    && d.column_id() == Some(c.column_id)
            }
            (Relation::ColumnReference, Element::Column(c), d) => {
                d.owner() == c.table_id && d.referenced_columns().contains(&c.column_id)
            }
            (Relation::IndexComponent, Element::SecondaryIndex(i), Element::IndexName(n)) => {
                n.table_id == i.table_id && n.index_id == i.index_id
            }
            (Relation::IndexComponent, Element::SecondaryIndex(i), Element::TemporaryIndex(t)) => {
                t.table_id == i.table_id && t.source_index_id == i.index_id
            }
            (Relation::TypeReference, Element::EnumType(t), d) => {
                matches!(d, Element::ColumnType(_) | Element::ColumnDefault(_))
                    && d.referenced_descriptors().contains(&t.type_id)
            }
            (Relation::TableReference, Element::Table(t), Element::ForeignKeyConstraint(fk)) => {
                fk.referenced_table_id == t.table_id && fk.table_id != t.table_id
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Relation::Parent => write!(f, "parent"),
            Relation::SameColumn => write!(f, "same column"),
            Relation::ColumnReference => write!(f, "column reference"),
            Relation::IndexComponent => write!(f, "index component"),
            Relation::TypeReference => write!(f, "type reference"),
            Relation::TableReference => write!(f, "table reference"),
        }
    }
}

/// Picks one status on an element's path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusSel {
    /// The transition reaching this status.
    Is(Status),
    /// The element's first transition.
    First,
    /// The element's last transition.
    Final,
}

impl std::fmt::Display for StatusSel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusSel::Is(status) => write!(f, "{status}"),
            StatusSel::First => write!(f, "first"),
            StatusSel::Final => write!(f, "final"),
        }
    }
}

/// Which element of the related pair an endpoint refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The relation's source (the table, column, index or type).
    Source,
    /// The element depending on the source.
    Dependent,
}

/// One side of the pair at a selected status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Which element of the pair.
    pub side: Side,
    /// Which of its transitions.
    pub status: StatusSel,
}

/// The source element at a status.
pub fn source(status: StatusSel) -> Endpoint {
    Endpoint {
        side: Side::Source,
        status,
    }
}

/// The dependent element at a status.
pub fn dependent(status: StatusSel) -> Endpoint {
    Endpoint {
        side: Side::Dependent,
        status,
    }
}

/// Direction filter for one side of a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Travel {
    /// Moving towards PUBLIC or existing transiently.
    Adding,
    /// Moving towards ABSENT.
    Dropping,
    /// Either.
    Any,
}

impl Travel {
    fn matches(&self, direction: Direction) -> bool {
        match self {
            Travel::Adding => direction.is_adding(),
            Travel::Dropping => !direction.is_adding(),
            Travel::Any => true,
        }
    }
}

/// Condition on the directions of both elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Guard {
    /// Required travel of the source.
    pub source: Travel,
    /// Required travel of the dependent.
    pub dependent: Travel,
}

impl Guard {
    pub fn new(source: Travel, dependent: Travel) -> Self {
        Self { source, dependent }
    }

    /// Both elements travel the same way.
    pub fn both(travel: Travel) -> Self {
        Self::new(travel, travel)
    }

    fn matches(&self, source: Direction, dependent: Direction) -> bool {
        self.source.matches(source) && self.dependent.matches(dependent)
    }
}

/// What a rule requires of two related elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constraint {
    /// The transition reaching `earlier` happens in a strictly earlier stage
    /// than, or earlier within the same stage as, the one reaching `later`.
    Precedes { earlier: Endpoint, later: Endpoint },
    /// Both transitions happen in the same stage.
    SameStage { a: Endpoint, b: Endpoint },
    /// Both elements may not be mid-transition together.
    MutuallyExclusive,
    /// Conditional on the elements' directions.
    When {
        guard: Guard,
        then: Box<Constraint>,
        otherwise: Box<Constraint>,
    },
    /// Every constraint applies.
    All(Vec<Constraint>),
    /// No constraint.
    Independent,
}

impl Constraint {
    pub fn precedes(earlier: Endpoint, later: Endpoint) -> Self {
        Constraint::Precedes { earlier, later }
    }

    pub fn same_stage(a: Endpoint, b: Endpoint) -> Self {
        Constraint::SameStage { a, b }
    }

    pub fn when(guard: Guard, then: Constraint, otherwise: Constraint) -> Self {
        Constraint::When {
            guard,
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }
}

/// A named dependency rule.
///
/// A rule applies to every pair of model entries whose kinds match
/// `source` and `dependent` and for which `relation` holds. Each such pair
/// gets the edges of `constraint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Name reported in cycle and violation errors.
    pub name: &'static str,
    /// Kind of the source element.
    pub source: ElementKind,
    /// Kind of the dependent element.
    pub dependent: ElementKind,
    /// How the two elements must be related.
    pub relation: Relation,
    /// What the rule requires of the pair.
    pub constraint: Constraint,
}

impl Rule {
    /// Create a rule.
    pub fn new(
        name: &'static str,
        source: ElementKind,
        dependent: ElementKind,
        relation: Relation,
        constraint: Constraint,
    ) -> Self {
        Self {
            name,
            source,
            dependent,
            relation,
            constraint,
        }
    }
}

/// Kind of a status-level edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// Strict ordering.
    Precedes,
    /// Co-scheduling.
    SameStage,
}

/// An edge between two element statuses produced by a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepEdge {
    /// Model position and status of the first endpoint.
    pub from: (usize, StatusSel),
    /// Model position and status of the second endpoint.
    pub to: (usize, StatusSel),
    pub kind: EdgeKind,
    pub rule: &'static str,
}

/// An exhaustive, validated set of rules.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: BTreeMap<(ElementKind, ElementKind, Relation), Vec<Rule>>,
}

/// Accumulates rules and checks coverage on [`build`](RuleSetBuilder::build).
#[derive(Debug, Clone, Default)]
pub struct RuleSetBuilder {
    rules: Vec<Rule>,
}

impl RuleSetBuilder {
    /// Start from the built-in rules.
    pub fn with_defaults() -> Self {
        Self {
            rules: standard::rules(),
        }
    }

    /// Add a rule.
    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Declare a related kind pair independent.
    pub fn independent(
        self,
        source: ElementKind,
        dependent: ElementKind,
        relation: Relation,
    ) -> Self {
        self.rule(Rule::new(
            "independent",
            source,
            dependent,
            relation,
            Constraint::Independent,
        ))
    }

    /// Validate and build.
    pub fn build(self) -> Result<RuleSet, PlanError> {
        let mut rules: BTreeMap<(ElementKind, ElementKind, Relation), Vec<Rule>> = BTreeMap::new();
        for rule in self.rules {
            if !rule
                .relation
                .kind_pairs()
                .contains(&(rule.source, rule.dependent))
            {
                return Err(PlanError::InvalidRule {
                    rule: rule.name.to_string(),
                    reason: format!(
                        "{} never relates {} to {}",
                        rule.relation, rule.source, rule.dependent
                    ),
                });
            }
            rules
                .entry((rule.source, rule.dependent, rule.relation))
                .or_default()
                .push(rule);
        }
        for relation in Relation::ALL {
            for (source, dependent) in relation.kind_pairs() {
                if !rules.contains_key(&(source, dependent, relation)) {
                    return Err(PlanError::MissingRule {
                        from: source,
                        to: dependent,
                        relation: relation.to_string(),
                    });
                }
            }
        }
        Ok(RuleSet { rules })
    }
}

impl RuleSet {
    /// Start an empty builder.
    pub fn builder() -> RuleSetBuilder {
        RuleSetBuilder::default()
    }

    /// The built-in rules.
    pub fn standard() -> Result<RuleSet, PlanError> {
        RuleSetBuilder::with_defaults().build()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    /// Check if the set has no rules.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All rules in (source, dependent, relation) order.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values().flatten()
    }

    /// Apply every rule to every related pair in the model.
    pub fn apply(&self, model: &ElementModel) -> Result<Vec<DepEdge>, PlanError> {
        let mut out = Vec::new();
        for a in 0..model.len() {
            for b in model.neighbors(a) {
                let (source, dependent) = (model.element(a), model.element(b));
                for relation in Relation::ALL {
                    if !relation.holds(source, dependent) {
                        continue;
                    }
                    let rules = self
                        .rules
                        .get(&(source.kind(), dependent.kind(), relation))
                        .ok_or_else(|| PlanError::MissingRule {
                            from: source.kind(),
                            to: dependent.kind(),
                            relation: relation.to_string(),
                        })?;
                    for rule in rules {
                        apply_constraint(rule, &rule.constraint, model, a, b, &mut out)?;
                    }
                }
            }
        }
        trace!(edges = out.len(), "applied dependency rules");
        Ok(out)
    }
}

fn apply_constraint(
    rule: &Rule,
    constraint: &Constraint,
    model: &ElementModel,
    source: usize,
    dependent: usize,
    out: &mut Vec<DepEdge>,
) -> Result<(), PlanError> {
    let resolve = |endpoint: &Endpoint| match endpoint.side {
        Side::Source => (source, endpoint.status),
        Side::Dependent => (dependent, endpoint.status),
    };
    match constraint {
        Constraint::Precedes { earlier, later } => out.push(DepEdge {
            from: resolve(earlier),
            to: resolve(later),
            kind: EdgeKind::Precedes,
            rule: rule.name,
        }),
        Constraint::SameStage { a, b } => out.push(DepEdge {
            from: resolve(a),
            to: resolve(b),
            kind: EdgeKind::SameStage,
            rule: rule.name,
        }),
        Constraint::MutuallyExclusive => {
            let (first, second) = (&model.entries()[source], &model.entries()[dependent]);
            if !first.is_trivial() && !second.is_trivial() {
                return Err(PlanError::MutuallyExclusive {
                    rule: rule.name.to_string(),
                    first: first.element.key().to_string(),
                    second: second.element.key().to_string(),
                });
            }
        }
        Constraint::When {
            guard,
            then,
            otherwise,
        } => {
            let entries = model.entries();
            let (Some(s), Some(d)) = (
                entries[source].direction(),
                entries[dependent].direction(),
            ) else {
                return Ok(());
            };
            let next = if guard.matches(s, d) { then } else { otherwise };
            apply_constraint(rule, next, model, source, dependent, out)?;
        }
        Constraint::All(constraints) => {
            for c in constraints {
                apply_constraint(rule, c, model, source, dependent, out)?;
            }
        }
        Constraint::Independent => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{
        CheckConstraint, Column, ColumnComment, ColumnType, EnumType, ForeignKeyConstraint,
        SecondaryIndex, Table, TargetState,
    };

    fn table(id: u32) -> Element {
        Element::Table(Table {
            table_id: id,
            name: format!("t{id}"),
        })
    }

    fn column(column_id: u32) -> Element {
        Element::Column(Column {
            table_id: 52,
            column_id,
            name: format!("c{column_id}"),
        })
    }

    fn index(index_id: u32, columns: Vec<u32>) -> Element {
        Element::SecondaryIndex(SecondaryIndex {
            table_id: 52,
            index_id,
            key_column_ids: columns,
            storing_column_ids: vec![],
            unique: false,
            temp_index_id: None,
        })
    }

    #[test]
    fn test_relations_hold() {
        assert!(Relation::Parent.holds(&table(52), &column(2)));
        assert!(!Relation::Parent.holds(&table(53), &column(2)));
        assert!(Relation::ColumnReference.holds(&column(2), &index(2, vec![2])));
        assert!(!Relation::ColumnReference.holds(&column(3), &index(2, vec![2])));

        let comment = Element::ColumnComment(ColumnComment {
            table_id: 52,
            column_id: 2,
            comment: "x".to_string(),
        });
        assert!(Relation::SameColumn.holds(&column(2), &comment));
        assert!(!Relation::SameColumn.holds(&column(2), &column(2)));

        let ty = Element::ColumnType(ColumnType {
            table_id: 52,
            column_id: 2,
            sql_type: "mood".to_string(),
            nullable: true,
            type_ref: Some(60),
        });
        let enum_type = Element::EnumType(EnumType {
            type_id: 60,
            name: "mood".to_string(),
            labels: vec![],
        });
        assert!(Relation::TypeReference.holds(&enum_type, &ty));

        let fk = Element::ForeignKeyConstraint(ForeignKeyConstraint {
            table_id: 52,
            constraint_id: 3,
            column_ids: vec![2],
            referenced_table_id: 53,
            referenced_column_ids: vec![1],
        });
        assert!(Relation::TableReference.holds(&table(53), &fk));
        assert!(!Relation::TableReference.holds(&table(52), &fk));
    }

    #[test]
    fn test_kind_pairs_match_holds() {
        for relation in Relation::ALL {
            assert!(!relation.kind_pairs().is_empty());
        }
        assert_eq!(Relation::Parent.kind_pairs().len(), 9);
    }

    #[test]
    fn test_standard_rules_are_exhaustive() {
        let rules = RuleSet::standard().unwrap();
        for relation in Relation::ALL {
            for (source, dependent) in relation.kind_pairs() {
                assert!(
                    rules
                        .rules()
                        .any(|r| r.relation == relation
                            && r.source == source
                            && r.dependent == dependent),
                    "no rule for {source} -> {dependent} via {relation}"
                );
            }
        }
    }

    #[test]
    fn test_missing_rule_reported() {
        let result = RuleSet::builder()
            .independent(ElementKind::Table, ElementKind::Column, Relation::Parent)
            .build();
        assert!(matches!(result, Err(PlanError::MissingRule { .. })));
    }

    #[test]
    fn test_rule_for_unrelated_kinds_rejected() {
        let result = RuleSetBuilder::with_defaults()
            .independent(ElementKind::Column, ElementKind::Table, Relation::Parent)
            .build();
        assert!(matches!(result, Err(PlanError::InvalidRule { .. })));
    }

    #[test]
    fn test_apply_emits_guarded_edges() {
        let rules = RuleSet::standard().unwrap();
        let model = ElementModel::new(vec![
            TargetState::existing(table(52)),
            TargetState::adding(column(2)),
            TargetState::adding(index(2, vec![2])),
        ])
        .unwrap();

        let edges = rules.apply(&model).unwrap();
        let col = model.by_kind(ElementKind::Column)[0];
        let idx = model.by_kind(ElementKind::SecondaryIndex)[0];
        assert!(edges.iter().any(|e| e.kind == EdgeKind::Precedes
            && e.from == (col, StatusSel::Is(Status::Public))
            && e.to == (idx, StatusSel::Is(Status::Backfilled))));
    }

    #[test]
    fn test_mutually_exclusive_directions() {
        let rules = RuleSet::standard().unwrap();
        let model = ElementModel::new(vec![
            TargetState::dropping(column(2)),
            TargetState::adding(index(2, vec![2])),
        ])
        .unwrap();
        assert!(matches!(
            rules.apply(&model),
            Err(PlanError::MutuallyExclusive { .. })
        ));
    }

    #[test]
    fn test_trivial_element_never_conflicts() {
        let rules = RuleSet::standard().unwrap();
        let check = Element::CheckConstraint(CheckConstraint {
            table_id: 52,
            constraint_id: 2,
            column_ids: vec![2],
            expr: "c2 > 0".to_string(),
        });
        let model = ElementModel::new(vec![
            TargetState::existing(column(2)),
            TargetState::dropping(check),
        ])
        .unwrap();
        assert!(rules.apply(&model).is_ok());
    }
}
