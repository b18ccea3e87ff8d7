//! Event filters: select clauses and where-clause content filters.

use std::cmp::Ordering;

use crate::address_space::TypeTree;
use crate::node::AttributeId;
use crate::node_id::{ids, NodeId, QualifiedName};
use crate::status::StatusCode;
use crate::value::{NumericRange, Variant};

use super::events::EventRecord;

/// Addresses an event field by type and browse path.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleAttributeOperand {
    pub type_definition_id: NodeId,
    pub browse_path: Vec<QualifiedName>,
    pub attribute_id: u32,
    pub index_range: Option<String>,
}

impl SimpleAttributeOperand {
    /// The Value of a top-level BaseEventType field.
    #[must_use]
    pub fn field(name: &str) -> Self {
        Self::path([name])
    }

    /// The Value of a nested BaseEventType field.
    #[must_use]
    pub fn path<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            type_definition_id: ids::BASE_EVENT_TYPE,
            browse_path: names.into_iter().map(QualifiedName::from).collect(),
            attribute_id: AttributeId::Value as u32,
            index_range: None,
        }
    }

    fn validate(&self, type_tree: &TypeTree) -> StatusCode {
        if !type_tree.is_subtype_of(&self.type_definition_id, &ids::BASE_EVENT_TYPE) {
            return StatusCode::BadTypeDefinitionInvalid;
        }
        let Some(attribute) = AttributeId::from_u32(self.attribute_id) else {
            return StatusCode::BadAttributeIdInvalid;
        };
        if self.browse_path.is_empty() && attribute != AttributeId::NodeId {
            return StatusCode::BadBrowseNameInvalid;
        }
        if self.browse_path.iter().any(QualifiedName::is_empty) {
            return StatusCode::BadBrowseNameInvalid;
        }
        if let Err(status) = NumericRange::parse_optional(self.index_range.as_deref()) {
            return status;
        }
        StatusCode::Good
    }
}

/// Where-clause operand.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOperand {
    Literal(Variant),
    SimpleAttribute(SimpleAttributeOperand),
    /// Index of another element of the same filter; must point forward.
    Element(u32),
}

/// Where-clause operators.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    Equals,
    IsNull,
    GreaterThan,
    LessThan,
    Not,
    And,
    Or,
    OfType,
}

impl FilterOperator {
    const fn operand_count(self) -> usize {
        match self {
            Self::IsNull | Self::Not | Self::OfType => 1,
            Self::Equals | Self::GreaterThan | Self::LessThan | Self::And | Self::Or => 2,
        }
    }
}

/// One where-clause element.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct ContentFilterElement {
    pub operator: FilterOperator,
    pub operands: Vec<FilterOperand>,
}

impl ContentFilterElement {
    #[must_use]
    pub fn new(operator: FilterOperator, operands: Vec<FilterOperand>) -> Self {
        Self { operator, operands }
    }
}

/// A where clause; element 0 is the root.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentFilter {
    pub elements: Vec<ContentFilterElement>,
}

/// Select clauses plus where clause.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub select_clauses: Vec<SimpleAttributeOperand>,
    pub where_clause: ContentFilter,
}

/// Per-clause validation results returned to the client.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilterResult {
    pub select_clause_results: Vec<StatusCode>,
    pub where_clause_results: Vec<StatusCode>,
}

impl EventFilter {
    /// Validates every clause. The first status is `Good`,
    /// `BadEventFilterInvalid` (a select clause failed) or
    /// `BadContentFilterInvalid` (a where element failed).
    #[must_use]
    pub fn validate(&self, type_tree: &TypeTree) -> (StatusCode, EventFilterResult) {
        let select_clause_results: Vec<StatusCode> =
            self.select_clauses.iter().map(|c| c.validate(type_tree)).collect();
        let where_clause_results: Vec<StatusCode> = self
            .where_clause
            .elements
            .iter()
            .enumerate()
            .map(|(index, element)| validate_element(index, element, self.where_clause.elements.len(), type_tree))
            .collect();

        let status = if select_clause_results.iter().any(|s| s.is_bad()) {
            StatusCode::BadEventFilterInvalid
        } else if where_clause_results.iter().any(|s| s.is_bad()) {
            StatusCode::BadContentFilterInvalid
        } else {
            StatusCode::Good
        };
        (
            status,
            EventFilterResult {
                select_clause_results,
                where_clause_results,
            },
        )
    }

    /// Evaluates the where clause. An empty clause matches every event.
    #[must_use]
    pub fn matches(&self, event: &EventRecord, type_tree: &TypeTree) -> bool {
        if self.where_clause.elements.is_empty() {
            return true;
        }
        let eval = Evaluator {
            elements: &self.where_clause.elements,
            event,
            type_tree,
        };
        eval.element(0, 0) == Some(true)
    }

    /// Resolves the select clauses, in order.
    #[must_use]
    pub fn select(&self, event: &EventRecord) -> Vec<Variant> {
        self.select_clauses.iter().map(|c| event.get_field(c)).collect()
    }
}

fn validate_element(index: usize, element: &ContentFilterElement, len: usize, type_tree: &TypeTree) -> StatusCode {
    if element.operands.len() != element.operator.operand_count() {
        return StatusCode::BadFilterOperandInvalid;
    }
    for operand in &element.operands {
        let ok = match operand {
            FilterOperand::Literal(_) => true,
            FilterOperand::SimpleAttribute(sao) => sao.validate(type_tree).is_good(),
            FilterOperand::Element(target) => {
                let target = *target as usize;
                target > index && target < len
            }
        };
        if !ok {
            return StatusCode::BadFilterOperandInvalid;
        }
    }
    if element.operator == FilterOperator::OfType
        && !matches!(&element.operands[0], FilterOperand::Literal(Variant::NodeId(_)))
    {
        return StatusCode::BadFilterOperandInvalid;
    }
    StatusCode::Good
}

const MAX_FILTER_DEPTH: usize = 64;

struct Evaluator<'a> {
    elements: &'a [ContentFilterElement],
    event: &'a EventRecord,
    type_tree: &'a TypeTree,
}

impl Evaluator<'_> {
    fn element(&self, index: usize, depth: usize) -> Option<bool> {
        if depth > MAX_FILTER_DEPTH {
            return None;
        }
        let element = self.elements.get(index)?;
        let ops = &element.operands;
        match element.operator {
            FilterOperator::And => {
                Some(self.boolean(ops.first()?, depth)? && self.boolean(ops.get(1)?, depth)?)
            }
            FilterOperator::Or => {
                Some(self.boolean(ops.first()?, depth)? || self.boolean(ops.get(1)?, depth)?)
            }
            FilterOperator::Not => self.boolean(ops.first()?, depth).map(|b| !b),
            FilterOperator::IsNull => Some(self.value(ops.first()?, depth).is_empty()),
            FilterOperator::OfType => {
                let target = self.value(ops.first()?, depth);
                let type_id = target.as_node_id()?;
                Some(self.type_tree.is_subtype_of(&self.event.event_type, type_id))
            }
            FilterOperator::Equals => {
                let (a, b) = (self.value(ops.first()?, depth), self.value(ops.get(1)?, depth));
                Some(compare(&a, &b) == Some(Ordering::Equal))
            }
            FilterOperator::GreaterThan => {
                let (a, b) = (self.value(ops.first()?, depth), self.value(ops.get(1)?, depth));
                Some(compare(&a, &b) == Some(Ordering::Greater))
            }
            FilterOperator::LessThan => {
                let (a, b) = (self.value(ops.first()?, depth), self.value(ops.get(1)?, depth));
                Some(compare(&a, &b) == Some(Ordering::Less))
            }
        }
    }

    fn boolean(&self, operand: &FilterOperand, depth: usize) -> Option<bool> {
        match operand {
            FilterOperand::Element(i) => self.element(*i as usize, depth + 1),
            other => self.value(other, depth).as_bool(),
        }
    }

    fn value(&self, operand: &FilterOperand, depth: usize) -> Variant {
        match operand {
            FilterOperand::Literal(v) => v.clone(),
            FilterOperand::SimpleAttribute(sao) => self.event.get_field(sao),
            FilterOperand::Element(i) => match self.element(*i as usize, depth + 1) {
                Some(b) => Variant::Boolean(b),
                None => Variant::Empty,
            },
        }
    }
}

fn compare(a: &Variant, b: &Variant) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Variant::String(x), Variant::String(y)) => Some(x.cmp(y)),
        (Variant::DateTime(x), Variant::DateTime(y)) => Some(x.cmp(y)),
        (x, y) if x == y => Some(Ordering::Equal),
        _ => None,
    }
}
