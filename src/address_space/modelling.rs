//! Type instantiation ("apply modelling rules").
//!
//! The instance declarations of a type are the nodes reachable from the type
//! through forward aggregation references. Walking the supertype chain from
//! the most basic type down builds one declaration list keyed by browse-name
//! path, so a subtype's declaration replaces the inherited one at the same
//! path. Each declaration is then materialized according to its modelling
//! rule: Mandatory always, Optional only when the caller's template lists the
//! path, anything else never.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::GraphError;
use crate::node::Reference;
use crate::node_id::{ids, NodeId, QualifiedName};

use super::graph::{ExternalReference, NodeGraph};
use super::type_tree::TypeTree;

/// Deepest declaration nesting followed below a type.
const MAX_DECLARATION_DEPTH: usize = 16;

/// A browse-name path relative to the instance.
pub type BrowsePath = Vec<QualifiedName>;

/// The optional children a caller wants materialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceTemplate {
    optional: HashSet<BrowsePath>,
}

impl InstanceTemplate {
    /// An empty template: only mandatory children are created.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the optional child at `path`.
    #[must_use]
    pub fn with_optional<I, Q>(mut self, path: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<QualifiedName>,
    {
        self.optional.insert(path.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn contains(&self, path: &[QualifiedName]) -> bool {
        self.optional.contains(path)
    }
}

/// What instantiation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModellingOutcome {
    /// New instance nodes, parents before children.
    pub created: Vec<NodeId>,
    /// Mirrors to apply on nodes owned by other managers.
    pub external: Vec<ExternalReference>,
}

#[derive(Debug, Clone)]
struct Declaration {
    path: BrowsePath,
    node_id: NodeId,
    reference_type_id: NodeId,
}

/// Materializes the declarations of `type_definition` below `instance`.
pub fn apply_modelling_rules(
    graph: &mut NodeGraph,
    type_tree: &TypeTree,
    instance: &NodeId,
    type_definition: &NodeId,
    template: Option<&InstanceTemplate>,
) -> Result<ModellingOutcome, GraphError> {
    if !graph.contains(instance) {
        return Err(GraphError::NodeNotFound(instance.clone()));
    }
    if !graph.contains(type_definition) {
        return Err(GraphError::TypeDefinitionNotFound(type_definition.clone()));
    }

    let declarations = collect_declarations(graph, type_tree, type_definition);
    let mut outcome = ModellingOutcome::default();

    // path -> instance node
    let mut instances: HashMap<BrowsePath, NodeId> = HashMap::new();
    // declaration node -> instance node
    let mut by_declaration: HashMap<NodeId, NodeId> = HashMap::new();

    for decl in &declarations {
        let Some(rule) = graph.get(&decl.node_id).and_then(|n| n.modelling_rule().cloned()) else {
            continue;
        };
        let wanted = if rule == ids::MODELLING_RULE_MANDATORY {
            true
        } else if rule == ids::MODELLING_RULE_OPTIONAL {
            template.is_some_and(|t| t.contains(&decl.path))
        } else {
            false
        };
        if !wanted {
            continue;
        }

        let parent = match decl.path.split_last() {
            Some((_, [])) => instance.clone(),
            Some((_, parent_path)) => match instances.get(parent_path) {
                Some(parent) => parent.clone(),
                None => continue,
            },
            None => continue,
        };

        let name = decl.path.last().cloned().unwrap_or_default();
        if let Some(existing) = existing_child(graph, type_tree, &parent, &name) {
            instances.insert(decl.path.clone(), existing.clone());
            by_declaration.insert(decl.node_id.clone(), existing);
            continue;
        }

        let Some(template_node) = graph.get(&decl.node_id).cloned() else {
            continue;
        };
        let new_id = graph.allocate_node_id(instance.namespace);
        let type_definitions: Vec<Reference> = template_node
            .references
            .iter()
            .filter(|r| !r.is_inverse && r.reference_type_id == ids::HAS_TYPE_DEFINITION)
            .cloned()
            .collect();
        let mut node = template_node;
        node.node_id = new_id.clone();
        node.references = Vec::new();
        graph.insert(node)?;
        for reference in type_definitions {
            graph.add_reference(&new_id, reference, false)?;
        }
        if let Some(ext) = graph.add_reference(
            &parent,
            Reference::forward(decl.reference_type_id.clone(), new_id.clone()),
            true,
        )? {
            outcome.external.push(ext);
        }

        instances.insert(decl.path.clone(), new_id.clone());
        by_declaration.insert(decl.node_id.clone(), new_id.clone());
        outcome.created.push(new_id);
    }

    replay_declaration_references(graph, type_tree, &declarations, &by_declaration, &mut outcome)?;
    copy_type_references(graph, type_tree, instance, type_definition, &mut outcome)?;

    debug!(
        instance = %instance,
        type_definition = %type_definition,
        created = outcome.created.len(),
        "applied modelling rules"
    );
    Ok(outcome)
}

/// Declarations of the whole supertype chain, base type first; a subtype's
/// declaration replaces the inherited one in place.
fn collect_declarations(graph: &NodeGraph, type_tree: &TypeTree, type_definition: &NodeId) -> Vec<Declaration> {
    let mut chain = type_tree.supertype_chain(type_definition);
    chain.reverse();

    let mut list: Vec<Declaration> = Vec::new();
    let mut index: HashMap<BrowsePath, usize> = HashMap::new();
    for type_id in chain.iter().filter(|t| graph.contains(t)) {
        let mut stack: Vec<(NodeId, BrowsePath)> = vec![(type_id.clone(), Vec::new())];
        while let Some((parent, parent_path)) = stack.pop() {
            if parent_path.len() >= MAX_DECLARATION_DEPTH {
                continue;
            }
            let mut children = graph.children(&parent, type_tree);
            // Preserve reference order when popping.
            children.reverse();
            for (reference_type_id, child) in children {
                let Some(child_node) = graph.get(&child) else {
                    continue;
                };
                if child_node.modelling_rule().is_none() {
                    continue;
                }
                let mut path = parent_path.clone();
                path.push(child_node.browse_name.clone());
                let decl = Declaration {
                    path: path.clone(),
                    node_id: child.clone(),
                    reference_type_id,
                };
                match index.get(&path) {
                    Some(&i) => list[i] = decl,
                    None => {
                        index.insert(path.clone(), list.len());
                        list.push(decl);
                    }
                }
                stack.push((child, path));
            }
        }
    }
    // Parents must precede children for parent lookup during materialization.
    list.sort_by_key(|d| d.path.len());
    list
}

fn existing_child(graph: &NodeGraph, type_tree: &TypeTree, parent: &NodeId, name: &QualifiedName) -> Option<NodeId> {
    graph
        .children(parent, type_tree)
        .into_iter()
        .map(|(_, child)| child)
        .find(|child| graph.get(child).is_some_and(|n| &n.browse_name == name))
}

/// Copies non-aggregating references between declarations onto the
/// corresponding instances.
fn replay_declaration_references(
    graph: &mut NodeGraph,
    type_tree: &TypeTree,
    declarations: &[Declaration],
    by_declaration: &HashMap<NodeId, NodeId>,
    outcome: &mut ModellingOutcome,
) -> Result<(), GraphError> {
    for decl in declarations {
        let Some(source_instance) = by_declaration.get(&decl.node_id) else {
            continue;
        };
        let Some(decl_node) = graph.get(&decl.node_id) else {
            continue;
        };
        let replay: Vec<Reference> = decl_node
            .references
            .iter()
            .filter(|r| !r.is_inverse && !type_tree.is_aggregation(&r.reference_type_id))
            .filter(|r| r.reference_type_id != ids::HAS_MODELLING_RULE && r.reference_type_id != ids::HAS_TYPE_DEFINITION)
            .filter_map(|r| {
                let target = by_declaration.get(r.target_id.as_local()?)?;
                Some(Reference::forward(r.reference_type_id.clone(), target.clone()))
            })
            .collect();
        for reference in replay {
            if let Some(ext) = graph.add_reference(source_instance, reference, true)? {
                outcome.external.push(ext);
            }
        }
    }
    Ok(())
}

/// Copies the type's own forward non-aggregating references (other than
/// HasSubtype) onto the instance and ensures its HasTypeDefinition.
fn copy_type_references(
    graph: &mut NodeGraph,
    type_tree: &TypeTree,
    instance: &NodeId,
    type_definition: &NodeId,
    outcome: &mut ModellingOutcome,
) -> Result<(), GraphError> {
    let copied: Vec<Reference> = graph
        .get(type_definition)
        .map(|t| {
            t.references
                .iter()
                .filter(|r| !r.is_inverse)
                .filter(|r| !type_tree.is_aggregation(&r.reference_type_id))
                .filter(|r| !type_tree.is_subtype_of(&r.reference_type_id, &ids::HAS_SUBTYPE))
                .filter(|r| r.reference_type_id != ids::HAS_MODELLING_RULE && r.reference_type_id != ids::HAS_TYPE_DEFINITION)
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    for reference in copied {
        let one_way = type_tree.is_one_way(&reference.reference_type_id);
        if let Some(ext) = graph.add_reference(instance, reference, !one_way)? {
            outcome.external.push(ext);
        }
    }

    let has_type_definition = graph
        .get(instance)
        .is_some_and(|n| n.type_definition().is_some());
    if !has_type_definition {
        graph.add_reference(
            instance,
            Reference::forward(ids::HAS_TYPE_DEFINITION, type_definition.clone()),
            false,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    fn tree() -> TypeTree {
        let tree = TypeTree::new();
        tree.add_reference_type(ids::REFERENCES, None);
        tree.add_reference_type(ids::HIERARCHICAL_REFERENCES, Some(ids::REFERENCES));
        tree.add_reference_type(ids::NON_HIERARCHICAL_REFERENCES, Some(ids::REFERENCES));
        tree.add_reference_type(ids::HAS_CHILD, Some(ids::HIERARCHICAL_REFERENCES));
        tree.add_reference_type(ids::AGGREGATES, Some(ids::HAS_CHILD));
        tree.add_reference_type(ids::HAS_COMPONENT, Some(ids::AGGREGATES));
        tree.add_reference_type(ids::HAS_PROPERTY, Some(ids::AGGREGATES));
        tree.add_reference_type(ids::HAS_SUBTYPE, Some(ids::HAS_CHILD));
        tree.add_reference_type(ids::HAS_MODELLING_RULE, Some(ids::NON_HIERARCHICAL_REFERENCES));
        tree.add_reference_type(ids::HAS_TYPE_DEFINITION, Some(ids::NON_HIERARCHICAL_REFERENCES));
        tree.add_reference_type(ids::GENERATES_EVENT, Some(ids::NON_HIERARCHICAL_REFERENCES));
        tree
    }

    fn declaration(graph: &mut NodeGraph, parent: &NodeId, id: u32, name: &str, rule: NodeId) -> NodeId {
        let node_id = NodeId::numeric(2, id);
        let node = Node::variable(node_id.clone(), QualifiedName::new(2, name), name, ids::DOUBLE, 0.0)
            .with_reference(Reference::forward(ids::HAS_MODELLING_RULE, rule))
            .with_reference(Reference::forward(ids::HAS_TYPE_DEFINITION, ids::BASE_DATA_VARIABLE_TYPE));
        graph.insert(node).unwrap();
        graph
            .add_reference(parent, Reference::forward(ids::HAS_COMPONENT, node_id.clone()), true)
            .unwrap();
        node_id
    }

    /// PumpType { Speed (mandatory), Pressure (optional) }
    /// FastPumpType : PumpType { Speed (mandatory, overridden), Turbo (mandatory) }
    fn fixture() -> (NodeGraph, TypeTree, NodeId, NodeId) {
        let tree = tree();
        let mut g = NodeGraph::new();
        let pump_type = NodeId::numeric(2, 1);
        let fast_type = NodeId::numeric(2, 2);
        g.insert(Node::object_type(pump_type.clone(), QualifiedName::new(2, "PumpType"), false))
            .unwrap();
        g.insert(Node::object_type(fast_type.clone(), QualifiedName::new(2, "FastPumpType"), false))
            .unwrap();
        g.add_reference(&pump_type, Reference::forward(ids::HAS_SUBTYPE, fast_type.clone()), true)
            .unwrap();
        tree.add_subtype(fast_type.clone(), pump_type.clone());

        declaration(&mut g, &pump_type, 10, "Speed", ids::MODELLING_RULE_MANDATORY);
        declaration(&mut g, &pump_type, 11, "Pressure", ids::MODELLING_RULE_OPTIONAL);
        let over = declaration(&mut g, &fast_type, 20, "Speed", ids::MODELLING_RULE_MANDATORY);
        g.get_mut(&over).unwrap().display_name = "Overridden speed".into();
        declaration(&mut g, &fast_type, 21, "Turbo", ids::MODELLING_RULE_MANDATORY);

        g.insert(Node::object(NodeId::numeric(2, 100), QualifiedName::new(2, "Pump1"), "Pump1"))
            .unwrap();
        (g, tree, NodeId::numeric(2, 100), fast_type)
    }

    fn child_names(g: &NodeGraph, tree: &TypeTree, id: &NodeId) -> Vec<String> {
        let mut names: Vec<String> = g
            .children(id, tree)
            .iter()
            .map(|(_, c)| g.get(c).unwrap().browse_name.name.clone())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn mandatory_children_are_created_with_subtype_override() {
        let (mut g, tree, instance, fast_type) = fixture();
        let outcome = apply_modelling_rules(&mut g, &tree, &instance, &fast_type, None).unwrap();
        assert_eq!(outcome.created.len(), 2);
        assert_eq!(child_names(&g, &tree, &instance), vec!["Speed", "Turbo"]);

        let speed = g
            .children(&instance, &tree)
            .into_iter()
            .map(|(_, c)| c)
            .find(|c| g.get(c).unwrap().browse_name.name == "Speed")
            .unwrap();
        let speed = g.get(&speed).unwrap();
        assert_eq!(speed.display_name.text, "Overridden speed");
        assert!(speed.modelling_rule().is_none());
        assert_eq!(g.get(&instance).unwrap().type_definition(), Some(&fast_type));
    }

    #[test]
    fn optional_children_come_from_the_template() {
        let (mut g, tree, instance, fast_type) = fixture();
        let template = InstanceTemplate::new().with_optional([QualifiedName::new(2, "Pressure")]);
        apply_modelling_rules(&mut g, &tree, &instance, &fast_type, Some(&template)).unwrap();
        assert_eq!(child_names(&g, &tree, &instance), vec!["Pressure", "Speed", "Turbo"]);
    }

    #[test]
    fn existing_children_are_reused() {
        let (mut g, tree, instance, fast_type) = fixture();
        apply_modelling_rules(&mut g, &tree, &instance, &fast_type, None).unwrap();
        let again = apply_modelling_rules(&mut g, &tree, &instance, &fast_type, None).unwrap();
        assert!(again.created.is_empty());
        assert_eq!(child_names(&g, &tree, &instance).len(), 2);
    }

    #[test]
    fn subtype_edges_are_not_copied() {
        let (mut g, tree, instance, _) = fixture();
        let pump_type = NodeId::numeric(2, 1);
        apply_modelling_rules(&mut g, &tree, &instance, &pump_type, None).unwrap();
        let node = g.get(&instance).unwrap();
        assert!(node.references.iter().all(|r| r.reference_type_id != ids::HAS_SUBTYPE));
    }

    #[test]
    fn missing_type_definition_fails() {
        let (mut g, tree, instance, _) = fixture();
        let err = apply_modelling_rules(&mut g, &tree, &instance, &NodeId::numeric(2, 999), None).unwrap_err();
        assert_eq!(err, GraphError::TypeDefinitionNotFound(NodeId::numeric(2, 999)));
    }
}
