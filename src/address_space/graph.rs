//! Node arena of one manager.
//!
//! Nodes are keyed by id and link to each other by id only. A reference whose
//! local target is not in this arena belongs to another manager; its mirror is
//! handed back to the caller as an [`ExternalReference`] instead of being
//! written here, so the owner can apply it under its own lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::browse::{BrowseDescription, HopTargets, ReferenceDescription, RelativePathElement};
use crate::error::GraphError;
use crate::node::{Node, Reference};
use crate::node_id::{ids, ExpandedNodeId, Identifier, NodeId};

use super::type_tree::TypeTree;

/// First numeric identifier handed out by [`NodeGraph::allocate_node_id`].
const FIRST_ALLOCATED_ID: u32 = 100_000;

/// A reference that must be added to (or removed from) a node owned by
/// another manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalReference {
    /// The node, owned elsewhere, that carries the edge.
    pub node_id: NodeId,
    /// The edge as stored on `node_id`.
    pub reference: Reference,
}

impl ExternalReference {
    /// The mirror of `reference` (stored on `source`) as it would be stored on
    /// its target.
    #[must_use]
    pub fn mirror_of(source: &NodeId, reference: &Reference) -> Option<Self> {
        let target = reference.target_id.as_local()?;
        Some(Self {
            node_id: target.clone(),
            reference: reference.mirrored(source),
        })
    }
}

/// Result of a node deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionOutcome {
    /// Every node removed, the requested node first.
    pub deleted: Vec<NodeId>,
    /// Back-references on nodes owned by other managers that now dangle.
    pub dangling: Vec<ExternalReference>,
}

/// The node arena.
#[derive(Debug, Default)]
pub struct NodeGraph {
    nodes: HashMap<NodeId, Node>,
    next_ids: HashMap<u16, u32>,
    shared_ids: Option<Arc<AtomicU32>>,
}

impl NodeGraph {
    /// An empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    #[must_use]
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates every node in arbitrary order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Inserts a node as is, without touching any other node.
    pub fn insert(&mut self, node: Node) -> Result<(), GraphError> {
        if node.node_id.is_null() {
            return Err(GraphError::InvalidNode {
                reason: "null node id".to_string(),
            });
        }
        if self.nodes.contains_key(&node.node_id) {
            return Err(GraphError::NodeExists(node.node_id));
        }
        self.nodes.insert(node.node_id.clone(), node);
        Ok(())
    }

    /// Inserts a node and mirrors its references.
    ///
    /// Mirrors of references to local targets in this graph are added
    /// immediately. Mirrors for local targets not in this graph are returned.
    /// One-way references such as `GeneratesEvent` are not mirrored.
    pub fn attach_node(&mut self, node: Node, type_tree: &TypeTree) -> Result<Vec<ExternalReference>, GraphError> {
        let source = node.node_id.clone();
        let references = node.references.clone();
        self.insert(node)?;
        let mut external = Vec::new();
        for reference in &references {
            if type_tree.is_one_way(&reference.reference_type_id) {
                continue;
            }
            let Some(mirror) = ExternalReference::mirror_of(&source, reference) else {
                continue;
            };
            match self.nodes.get_mut(&mirror.node_id) {
                Some(target) => {
                    target.add_reference(mirror.reference);
                }
                None => external.push(mirror),
            }
        }
        Ok(external)
    }

    /// Adds a reference stored on `source`.
    ///
    /// With `bidirectional` the mirror is added to a local target in this
    /// graph, or returned when the target lives elsewhere.
    pub fn add_reference(
        &mut self,
        source: &NodeId,
        reference: Reference,
        bidirectional: bool,
    ) -> Result<Option<ExternalReference>, GraphError> {
        if reference.reference_type_id.is_null() {
            return Err(GraphError::InvalidReference {
                reason: "null reference type".to_string(),
            });
        }
        let node = self
            .nodes
            .get_mut(source)
            .ok_or_else(|| GraphError::NodeNotFound(source.clone()))?;
        let mirror = ExternalReference::mirror_of(source, &reference);
        node.add_reference(reference);
        if !bidirectional {
            return Ok(None);
        }
        let Some(mirror) = mirror else {
            return Ok(None);
        };
        match self.nodes.get_mut(&mirror.node_id) {
            Some(target) => {
                target.add_reference(mirror.reference);
                Ok(None)
            }
            None => Ok(Some(mirror)),
        }
    }

    /// Applies a mirror produced by another manager. Returns false when the
    /// carrying node is not in this graph.
    pub fn add_external_reference(&mut self, external: &ExternalReference) -> bool {
        match self.nodes.get_mut(&external.node_id) {
            Some(node) => {
                node.add_reference(external.reference.clone());
                true
            }
            None => false,
        }
    }

    /// Removes a reference stored on `source`, and its mirror when
    /// `delete_bidirectional` is set.
    pub fn delete_reference(
        &mut self,
        source: &NodeId,
        reference: &Reference,
        delete_bidirectional: bool,
    ) -> Result<Option<ExternalReference>, GraphError> {
        let node = self
            .nodes
            .get_mut(source)
            .ok_or_else(|| GraphError::NodeNotFound(source.clone()))?;
        if !node.remove_reference(&reference.reference_type_id, reference.is_inverse, &reference.target_id) {
            return Err(GraphError::ReferenceNotFound {
                source_id: source.clone(),
                reference_type_id: reference.reference_type_id.clone(),
                target_id: reference.target_id.to_string(),
            });
        }
        if !delete_bidirectional {
            return Ok(None);
        }
        let Some(mirror) = ExternalReference::mirror_of(source, reference) else {
            return Ok(None);
        };
        match self.nodes.get_mut(&mirror.node_id) {
            Some(target) => {
                target.remove_reference(
                    &mirror.reference.reference_type_id,
                    mirror.reference.is_inverse,
                    &mirror.reference.target_id,
                );
                Ok(None)
            }
            None => Ok(Some(mirror)),
        }
    }

    /// Removes an edge on a node of this graph on behalf of another manager.
    pub fn remove_external_reference(&mut self, external: &ExternalReference) -> bool {
        self.nodes.get_mut(&external.node_id).is_some_and(|node| {
            node.remove_reference(
                &external.reference.reference_type_id,
                external.reference.is_inverse,
                &external.reference.target_id,
            )
        })
    }

    /// Removes a node and, with `delete_children`, every node reached from it
    /// through forward aggregation references.
    ///
    /// Edges between the deleted nodes and the rest of this graph are removed
    /// in both directions. Edges held by nodes of other managers are returned
    /// in [`DeletionOutcome::dangling`] for deferred cleanup.
    pub fn delete_node(
        &mut self,
        id: &NodeId,
        delete_children: bool,
        type_tree: &TypeTree,
    ) -> Result<DeletionOutcome, GraphError> {
        if !self.nodes.contains_key(id) {
            return Err(GraphError::NodeNotFound(id.clone()));
        }

        let mut doomed = vec![id.clone()];
        let mut seen: HashSet<NodeId> = HashSet::from([id.clone()]);
        if delete_children {
            let mut queue = VecDeque::from([id.clone()]);
            while let Some(current) = queue.pop_front() {
                let Some(node) = self.nodes.get(&current) else {
                    continue;
                };
                for r in &node.references {
                    if r.is_inverse || !type_tree.is_aggregation(&r.reference_type_id) {
                        continue;
                    }
                    let Some(child) = r.target_id.as_local() else {
                        continue;
                    };
                    if self.nodes.contains_key(child) && seen.insert(child.clone()) {
                        doomed.push(child.clone());
                        queue.push_back(child.clone());
                    }
                }
            }
        }

        let mut dangling = Vec::new();
        for victim in &doomed {
            let Some(node) = self.nodes.remove(victim) else {
                continue;
            };
            for r in node.references.iter().filter(|r| !type_tree.is_one_way(&r.reference_type_id)) {
                let Some(mirror) = ExternalReference::mirror_of(victim, r) else {
                    continue;
                };
                if seen.contains(&mirror.node_id) {
                    continue;
                }
                match self.nodes.get_mut(&mirror.node_id) {
                    Some(target) => {
                        target.remove_references_to(victim);
                    }
                    None => dangling.push(mirror),
                }
            }
        }

        // One-way references into the deleted set have no mirror to follow.
        for node in self.nodes.values_mut() {
            node.references
                .retain(|r| r.target_id.as_local().map_or(true, |t| !seen.contains(t)));
        }

        debug!(node_id = %id, deleted = doomed.len(), dangling = dangling.len(), "deleted node");
        Ok(DeletionOutcome {
            deleted: doomed,
            dangling,
        })
    }

    /// Removes every edge pointing at `target` from every node in this graph.
    pub fn remove_references_to(&mut self, target: &NodeId) -> usize {
        self.nodes
            .values_mut()
            .map(|n| n.remove_references_to(target))
            .sum()
    }

    /// Enumerates the references of a node that pass the direction and
    /// reference type filters. Target metadata is filled in for targets in this
    /// graph; the node class mask is left to the caller.
    pub fn browse(
        &self,
        description: &BrowseDescription,
        type_tree: &TypeTree,
    ) -> Result<Vec<ReferenceDescription>, GraphError> {
        let node = self
            .nodes
            .get(&description.node_id)
            .ok_or_else(|| GraphError::NodeNotFound(description.node_id.clone()))?;
        let out = node
            .references
            .iter()
            .filter(|r| description.browse_direction.matches(r.is_inverse))
            .filter(|r| {
                type_tree.matches_reference_type(
                    &r.reference_type_id,
                    description.reference_type_id.as_ref(),
                    description.include_subtypes,
                )
            })
            .map(|r| self.describe(r))
            .collect();
        Ok(out)
    }

    /// Builds a reference description, resolving target metadata locally.
    #[must_use]
    pub fn describe(&self, reference: &Reference) -> ReferenceDescription {
        let target = reference.target_id.as_local().and_then(|id| self.nodes.get(id));
        ReferenceDescription {
            reference_type_id: reference.reference_type_id.clone(),
            is_forward: !reference.is_inverse,
            node_id: reference.target_id.clone(),
            browse_name: target.map(|n| n.browse_name.clone()),
            display_name: target.map(|n| n.display_name.clone()),
            node_class: target.map(Node::node_class),
            type_definition: target.and_then(|n| n.type_definition().cloned()),
        }
    }

    /// Follows one relative-path hop from `source`.
    pub fn find_targets(
        &self,
        source: &NodeId,
        element: &RelativePathElement,
        type_tree: &TypeTree,
    ) -> Result<HopTargets, GraphError> {
        let node = self
            .nodes
            .get(source)
            .ok_or_else(|| GraphError::NodeNotFound(source.clone()))?;
        let mut hop = HopTargets::default();
        for r in &node.references {
            if r.is_inverse != element.is_inverse {
                continue;
            }
            let default_filter = ids::HIERARCHICAL_REFERENCES;
            let filter = element.reference_type_id.as_ref().unwrap_or(&default_filter);
            let include_subtypes = element.include_subtypes || element.reference_type_id.is_none();
            if !type_tree.matches_reference_type(&r.reference_type_id, Some(filter), include_subtypes) {
                continue;
            }
            match r.target_id.as_local() {
                None => hop.remote.push(r.target_id.clone()),
                Some(target) => match self.nodes.get(target) {
                    Some(t) if element.target_name.is_empty() || t.browse_name == element.target_name => {
                        if !hop.matched.contains(target) {
                            hop.matched.push(target.clone());
                        }
                    }
                    Some(_) => {}
                    None => {
                        if !hop.external.contains(target) {
                            hop.external.push(target.clone());
                        }
                    }
                },
            }
        }
        Ok(hop)
    }

    /// Forward aggregation children of a node, with the reference type used.
    #[must_use]
    pub fn children(&self, id: &NodeId, type_tree: &TypeTree) -> Vec<(NodeId, NodeId)> {
        self.nodes.get(id).map_or_else(Vec::new, |node| {
            node.references
                .iter()
                .filter(|r| !r.is_inverse && type_tree.is_aggregation(&r.reference_type_id))
                .filter_map(|r| {
                    r.target_id
                        .as_local()
                        .map(|t| (r.reference_type_id.clone(), t.clone()))
                })
                .collect()
        })
    }

    /// Draws numeric ids from a counter shared with other graphs instead of
    /// the per-namespace counters of this graph.
    pub fn use_shared_ids(&mut self, counter: Arc<AtomicU32>) {
        self.shared_ids = Some(counter);
    }

    /// Hands out a numeric node id in `namespace` not yet used in this graph.
    pub fn allocate_node_id(&mut self, namespace: u16) -> NodeId {
        loop {
            let value = match &self.shared_ids {
                Some(counter) => counter.fetch_add(1, Ordering::Relaxed),
                None => {
                    let next = self.next_ids.entry(namespace).or_insert(FIRST_ALLOCATED_ID);
                    let value = *next;
                    *next = next.wrapping_add(1);
                    value
                }
            };
            let candidate = NodeId {
                namespace,
                identifier: Identifier::Numeric(value),
            };
            if !self.nodes.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Returns true when `target` is referenced by some node of this graph.
    #[must_use]
    pub fn is_referenced(&self, target: &NodeId) -> bool {
        let target = ExpandedNodeId::local(target.clone());
        self.nodes
            .values()
            .any(|n| n.references.iter().any(|r| r.target_id == target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browse::BrowseDirection;

    fn tree() -> TypeTree {
        let tree = TypeTree::new();
        tree.add_reference_type(ids::REFERENCES, None);
        tree.add_reference_type(ids::HIERARCHICAL_REFERENCES, Some(ids::REFERENCES));
        tree.add_reference_type(ids::NON_HIERARCHICAL_REFERENCES, Some(ids::REFERENCES));
        tree.add_reference_type(ids::HAS_CHILD, Some(ids::HIERARCHICAL_REFERENCES));
        tree.add_reference_type(ids::AGGREGATES, Some(ids::HAS_CHILD));
        tree.add_reference_type(ids::HAS_COMPONENT, Some(ids::AGGREGATES));
        tree.add_reference_type(ids::ORGANIZES, Some(ids::HIERARCHICAL_REFERENCES));
        tree.add_reference_type(ids::HAS_TYPE_DEFINITION, Some(ids::NON_HIERARCHICAL_REFERENCES));
        tree
    }

    fn obj(i: u32, name: &str) -> Node {
        Node::object(NodeId::numeric(2, i), name, name)
    }

    #[test]
    fn bidirectional_reference_is_mirrored() {
        let mut g = NodeGraph::new();
        g.insert(obj(1, "A")).unwrap();
        g.insert(obj(2, "B")).unwrap();
        let ext = g
            .add_reference(&NodeId::numeric(2, 1), Reference::forward(ids::ORGANIZES, NodeId::numeric(2, 2)), true)
            .unwrap();
        assert!(ext.is_none());
        let b = g.get(&NodeId::numeric(2, 2)).unwrap();
        assert_eq!(b.references, vec![Reference::inverse(ids::ORGANIZES, NodeId::numeric(2, 1))]);
    }

    #[test]
    fn reference_to_foreign_node_is_returned() {
        let mut g = NodeGraph::new();
        g.insert(obj(1, "A")).unwrap();
        let ext = g
            .add_reference(&NodeId::numeric(2, 1), Reference::forward(ids::ORGANIZES, NodeId::numeric(3, 9)), true)
            .unwrap()
            .unwrap();
        assert_eq!(ext.node_id, NodeId::numeric(3, 9));
        assert!(ext.reference.is_inverse);
        assert_eq!(ext.reference.target_id, ExpandedNodeId::local(NodeId::numeric(2, 1)));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut g = NodeGraph::new();
        g.insert(obj(1, "A")).unwrap();
        assert_eq!(g.insert(obj(1, "A")), Err(GraphError::NodeExists(NodeId::numeric(2, 1))));
    }

    #[test]
    fn cascade_delete_follows_aggregates_only() {
        let tree = tree();
        let mut g = NodeGraph::new();
        for (i, n) in [(1, "Pump"), (2, "Motor"), (3, "Folder"), (4, "Other")] {
            g.insert(obj(i, n)).unwrap();
        }
        let pump = NodeId::numeric(2, 1);
        g.add_reference(&pump, Reference::forward(ids::HAS_COMPONENT, NodeId::numeric(2, 2)), true)
            .unwrap();
        g.add_reference(&NodeId::numeric(2, 3), Reference::forward(ids::ORGANIZES, pump.clone()), true)
            .unwrap();
        g.add_reference(&pump, Reference::forward(ids::ORGANIZES, NodeId::numeric(2, 4)), true)
            .unwrap();
        g.add_reference(&pump, Reference::forward(ids::ORGANIZES, NodeId::numeric(7, 1)), true)
            .unwrap();

        let outcome = g.delete_node(&pump, true, &tree).unwrap();
        assert_eq!(outcome.deleted, vec![pump.clone(), NodeId::numeric(2, 2)]);
        assert!(g.contains(&NodeId::numeric(2, 4)));
        assert!(g.get(&NodeId::numeric(2, 3)).unwrap().references.is_empty());
        assert!(g.get(&NodeId::numeric(2, 4)).unwrap().references.is_empty());
        assert_eq!(outcome.dangling.len(), 1);
        assert_eq!(outcome.dangling[0].node_id, NodeId::numeric(7, 1));
    }

    #[test]
    fn one_way_references_are_swept_on_delete() {
        let tree = tree();
        let mut g = NodeGraph::new();
        g.insert(obj(1, "A")).unwrap();
        g.insert(obj(2, "B")).unwrap();
        g.add_reference(
            &NodeId::numeric(2, 1),
            Reference::forward(ids::HAS_TYPE_DEFINITION, NodeId::numeric(2, 2)),
            false,
        )
        .unwrap();
        g.delete_node(&NodeId::numeric(2, 2), false, &tree).unwrap();
        assert!(!g.is_referenced(&NodeId::numeric(2, 2)));
    }

    #[test]
    fn browse_filters_direction_and_type() {
        let tree = tree();
        let mut g = NodeGraph::new();
        g.insert(obj(1, "A")).unwrap();
        g.insert(obj(2, "B")).unwrap();
        g.insert(obj(3, "C")).unwrap();
        let a = NodeId::numeric(2, 1);
        g.add_reference(&a, Reference::forward(ids::HAS_COMPONENT, NodeId::numeric(2, 2)), true)
            .unwrap();
        g.add_reference(&NodeId::numeric(2, 3), Reference::forward(ids::ORGANIZES, a.clone()), true)
            .unwrap();

        let forward = g.browse(&BrowseDescription::hierarchical(a.clone()), &tree).unwrap();
        assert_eq!(forward.len(), 1);
        assert_eq!(forward[0].browse_name.as_ref().map(|q| q.name.as_str()), Some("B"));

        let both = g.browse(&BrowseDescription::all(a, BrowseDirection::Both), &tree).unwrap();
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn allocated_ids_skip_existing_nodes() {
        let mut g = NodeGraph::new();
        g.insert(obj(FIRST_ALLOCATED_ID, "Taken")).unwrap();
        let id = g.allocate_node_id(2);
        assert_eq!(id, NodeId::numeric(2, FIRST_ALLOCATED_ID + 1));
    }

    #[test]
    fn generates_event_references_stay_one_way() {
        let tree = tree();
        tree.add_reference_type(ids::GENERATES_EVENT, Some(ids::NON_HIERARCHICAL_REFERENCES));
        let alarm = NodeId::numeric(2, 500);
        tree.add_reference_type(alarm.clone(), Some(ids::GENERATES_EVENT));

        let mut g = NodeGraph::new();
        let event_type = NodeId::numeric(2, 9);
        g.attach_node(Node::object_type(event_type.clone(), "OverheatEventType", false), &tree)
            .unwrap();
        let source = obj(1, "A")
            .with_reference(Reference::forward(ids::GENERATES_EVENT, event_type.clone()))
            .with_reference(Reference::forward(alarm, event_type.clone()))
            .with_reference(Reference::forward(ids::GENERATES_EVENT, NodeId::numeric(3, 9)))
            .with_reference(Reference::forward(ids::ORGANIZES, event_type.clone()));
        let external = g.attach_node(source, &tree).unwrap();
        assert!(external.is_empty());

        let target = g.get(&event_type).unwrap();
        assert_eq!(target.references, vec![Reference::inverse(ids::ORGANIZES, NodeId::numeric(2, 1))]);

        let outcome = g.delete_node(&NodeId::numeric(2, 1), false, &tree).unwrap();
        assert!(outcome.dangling.is_empty());
        assert!(g.get(&event_type).unwrap().references.is_empty());
    }
}
