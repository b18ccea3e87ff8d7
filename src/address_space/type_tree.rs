//! Shared index of `HasSubtype` edges.
//!
//! Used for `include_subtypes` reference filtering, aggregation detection and
//! event type checks. The lock is a leaf: it may be taken while a manager
//! holds its own lock, never the other way round.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use crate::node_id::{ids, NodeId};

/// Longest supertype chain walked before giving up.
const MAX_DEPTH: usize = 128;

#[derive(Debug, Default)]
struct TypeTreeState {
    supertypes: HashMap<NodeId, NodeId>,
    reference_types: HashSet<NodeId>,
}

/// Subtype relationships of every type node known to the server.
#[derive(Debug, Default)]
pub struct TypeTree {
    state: RwLock<TypeTreeState>,
}

impl TypeTree {
    /// An empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `subtype HasSubtype-inverse supertype`.
    pub fn add_subtype(&self, subtype: NodeId, supertype: NodeId) {
        if let Ok(mut state) = self.state.write() {
            state.supertypes.insert(subtype, supertype);
        }
    }

    /// Registers a reference type, optionally under a supertype.
    pub fn add_reference_type(&self, reference_type: NodeId, supertype: Option<NodeId>) {
        if let Ok(mut state) = self.state.write() {
            if let Some(supertype) = supertype {
                state.supertypes.insert(reference_type.clone(), supertype);
            }
            state.reference_types.insert(reference_type);
        }
    }

    /// Forgets a type.
    pub fn remove(&self, type_id: &NodeId) {
        if let Ok(mut state) = self.state.write() {
            state.supertypes.remove(type_id);
            state.reference_types.remove(type_id);
        }
    }

    /// The direct supertype.
    #[must_use]
    pub fn supertype(&self, type_id: &NodeId) -> Option<NodeId> {
        self.state.read().ok()?.supertypes.get(type_id).cloned()
    }

    /// The supertype chain starting at `type_id` itself, most derived first.
    #[must_use]
    pub fn supertype_chain(&self, type_id: &NodeId) -> Vec<NodeId> {
        let mut chain = vec![type_id.clone()];
        let Ok(state) = self.state.read() else {
            return chain;
        };
        let mut current = type_id;
        while let Some(parent) = state.supertypes.get(current) {
            if chain.len() > MAX_DEPTH || chain.contains(parent) {
                break;
            }
            chain.push(parent.clone());
            current = parent;
        }
        chain
    }

    /// Returns true when `type_id` equals `ancestor` or derives from it.
    #[must_use]
    pub fn is_subtype_of(&self, type_id: &NodeId, ancestor: &NodeId) -> bool {
        if type_id == ancestor {
            return true;
        }
        let Ok(state) = self.state.read() else {
            return false;
        };
        let mut current = type_id;
        for _ in 0..MAX_DEPTH {
            match state.supertypes.get(current) {
                Some(parent) if parent == ancestor => return true,
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }

    /// Reference type matching used by browse filters.
    #[must_use]
    pub fn matches_reference_type(
        &self,
        candidate: &NodeId,
        filter: Option<&NodeId>,
        include_subtypes: bool,
    ) -> bool {
        match filter {
            None => true,
            Some(f) if include_subtypes => self.is_subtype_of(candidate, f),
            Some(f) => candidate == f,
        }
    }

    /// Returns true for known reference types.
    #[must_use]
    pub fn is_reference_type(&self, type_id: &NodeId) -> bool {
        self.state
            .read()
            .map(|s| s.reference_types.contains(type_id))
            .unwrap_or(false)
    }

    /// Returns true for `HasChild` subtypes other than `HasSubtype`, i.e. the
    /// references that make the target part of the source.
    #[must_use]
    pub fn is_aggregation(&self, reference_type: &NodeId) -> bool {
        self.is_subtype_of(reference_type, &ids::AGGREGATES)
    }

    /// Returns true for reference types stored on the source only, with no
    /// inverse edge on the target.
    #[must_use]
    pub fn is_one_way(&self, reference_type: &NodeId) -> bool {
        self.is_subtype_of(reference_type, &ids::GENERATES_EVENT)
    }

    /// Returns true for hierarchical reference types.
    #[must_use]
    pub fn is_hierarchical(&self, reference_type: &NodeId) -> bool {
        self.is_subtype_of(reference_type, &ids::HIERARCHICAL_REFERENCES)
    }

    /// Number of recorded subtype edges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().map(|s| s.supertypes.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> TypeTree {
        let tree = TypeTree::new();
        tree.add_reference_type(ids::REFERENCES, None);
        tree.add_reference_type(ids::HIERARCHICAL_REFERENCES, Some(ids::REFERENCES));
        tree.add_reference_type(ids::HAS_CHILD, Some(ids::HIERARCHICAL_REFERENCES));
        tree.add_reference_type(ids::AGGREGATES, Some(ids::HAS_CHILD));
        tree.add_reference_type(ids::HAS_COMPONENT, Some(ids::AGGREGATES));
        tree.add_reference_type(ids::HAS_SUBTYPE, Some(ids::HAS_CHILD));
        tree.add_reference_type(ids::ORGANIZES, Some(ids::HIERARCHICAL_REFERENCES));
        tree
    }

    #[test]
    fn subtype_walk() {
        let tree = standard();
        assert!(tree.is_subtype_of(&ids::HAS_COMPONENT, &ids::REFERENCES));
        assert!(tree.is_subtype_of(&ids::HAS_COMPONENT, &ids::HAS_COMPONENT));
        assert!(!tree.is_subtype_of(&ids::ORGANIZES, &ids::HAS_CHILD));
        assert_eq!(
            tree.supertype_chain(&ids::AGGREGATES),
            vec![ids::AGGREGATES, ids::HAS_CHILD, ids::HIERARCHICAL_REFERENCES, ids::REFERENCES]
        );
    }

    #[test]
    fn aggregation_excludes_has_subtype() {
        let tree = standard();
        assert!(tree.is_aggregation(&ids::HAS_COMPONENT));
        assert!(!tree.is_aggregation(&ids::HAS_SUBTYPE));
        assert!(tree.is_hierarchical(&ids::ORGANIZES));
    }

    #[test]
    fn reference_filter() {
        let tree = standard();
        assert!(tree.matches_reference_type(&ids::HAS_COMPONENT, None, false));
        assert!(tree.matches_reference_type(&ids::HAS_COMPONENT, Some(&ids::HIERARCHICAL_REFERENCES), true));
        assert!(!tree.matches_reference_type(&ids::HAS_COMPONENT, Some(&ids::HIERARCHICAL_REFERENCES), false));
    }

    #[test]
    fn cycles_terminate() {
        let tree = TypeTree::new();
        let a = NodeId::numeric(2, 1);
        let b = NodeId::numeric(2, 2);
        tree.add_subtype(a.clone(), b.clone());
        tree.add_subtype(b.clone(), a.clone());
        assert!(!tree.is_subtype_of(&a, &NodeId::numeric(2, 3)));
        assert_eq!(tree.supertype_chain(&a).len(), 2);
    }
}
