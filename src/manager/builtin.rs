//! Built-in address spaces: the namespace 0 skeleton owned by the core
//! manager and the server diagnostics object owned by the diagnostics
//! manager.

use crate::node::{EventNotifier, Node, Reference};
use crate::node_id::{ids, NodeId, QualifiedName};
use crate::value::Variant;

/// URI of the standard namespace (index 0).
pub const CORE_NAMESPACE_URI: &str = "http://opcfoundation.org/UA/";

/// Counters exposed under `ServerDiagnostics`, in node order.
pub const DIAGNOSTIC_COUNTERS: [&str; 5] = [
    "ServiceCalls",
    "ItemsProcessed",
    "ItemsFailed",
    "ReferencesCleaned",
    "MonitoredItemsCreated",
];

const SERVER_DIAGNOSTICS: &str = "ServerDiagnostics";

/// (id, browse name, abstract, symmetric, inverse name, supertype)
type ReferenceTypeRow = (NodeId, &'static str, bool, bool, Option<&'static str>, Option<NodeId>);

fn reference_types() -> Vec<ReferenceTypeRow> {
    vec![
        (ids::REFERENCES, "References", true, true, None, None),
        (
            ids::NON_HIERARCHICAL_REFERENCES,
            "NonHierarchicalReferences",
            true,
            false,
            None,
            Some(ids::REFERENCES),
        ),
        (
            ids::HIERARCHICAL_REFERENCES,
            "HierarchicalReferences",
            true,
            false,
            None,
            Some(ids::REFERENCES),
        ),
        (ids::HAS_CHILD, "HasChild", true, false, None, Some(ids::HIERARCHICAL_REFERENCES)),
        (
            ids::ORGANIZES,
            "Organizes",
            false,
            false,
            Some("OrganizedBy"),
            Some(ids::HIERARCHICAL_REFERENCES),
        ),
        (
            ids::HAS_EVENT_SOURCE,
            "HasEventSource",
            false,
            false,
            Some("EventSourceOf"),
            Some(ids::HIERARCHICAL_REFERENCES),
        ),
        (
            ids::HAS_MODELLING_RULE,
            "HasModellingRule",
            false,
            false,
            Some("ModellingRuleOf"),
            Some(ids::NON_HIERARCHICAL_REFERENCES),
        ),
        (
            ids::HAS_TYPE_DEFINITION,
            "HasTypeDefinition",
            false,
            false,
            Some("TypeDefinitionOf"),
            Some(ids::NON_HIERARCHICAL_REFERENCES),
        ),
        (
            ids::GENERATES_EVENT,
            "GeneratesEvent",
            false,
            false,
            Some("GeneratedBy"),
            Some(ids::NON_HIERARCHICAL_REFERENCES),
        ),
        (ids::AGGREGATES, "Aggregates", true, false, None, Some(ids::HAS_CHILD)),
        (ids::HAS_SUBTYPE, "HasSubtype", false, false, Some("SubtypeOf"), Some(ids::HAS_CHILD)),
        (ids::HAS_PROPERTY, "HasProperty", false, false, Some("PropertyOf"), Some(ids::AGGREGATES)),
        (ids::HAS_COMPONENT, "HasComponent", false, false, Some("ComponentOf"), Some(ids::AGGREGATES)),
        (ids::HAS_NOTIFIER, "HasNotifier", false, false, Some("NotifierOf"), Some(ids::HAS_EVENT_SOURCE)),
    ]
}

fn folder(node_id: NodeId, name: &str, parent: Option<NodeId>) -> Node {
    let node = Node::object(node_id, name, name).with_reference(Reference::forward(ids::HAS_TYPE_DEFINITION, ids::FOLDER_TYPE));
    match parent {
        Some(parent) => node.with_reference(Reference::inverse(ids::ORGANIZES, parent)),
        None => node,
    }
}

fn subtype_of(node: Node, supertype: NodeId) -> Node {
    node.with_reference(Reference::inverse(ids::HAS_SUBTYPE, supertype))
}

/// The namespace 0 skeleton, supertypes before subtypes and parents before
/// children.
#[must_use]
pub fn core_address_space() -> Vec<Node> {
    let mut nodes = Vec::new();

    for (id, name, is_abstract, symmetric, inverse_name, supertype) in reference_types() {
        let node = Node::reference_type(id, name, is_abstract, symmetric, inverse_name);
        nodes.push(match supertype {
            Some(supertype) => subtype_of(node, supertype),
            None => node,
        });
    }

    nodes.push(Node::object_type(ids::BASE_OBJECT_TYPE, "BaseObjectType", false));
    nodes.push(subtype_of(
        Node::object_type(ids::FOLDER_TYPE, "FolderType", false),
        ids::BASE_OBJECT_TYPE,
    ));
    nodes.push(subtype_of(
        Node::object_type(ids::MODELLING_RULE_TYPE, "ModellingRuleType", false),
        ids::BASE_OBJECT_TYPE,
    ));
    nodes.push(subtype_of(
        Node::object_type(ids::SERVER_TYPE, "ServerType", false),
        ids::BASE_OBJECT_TYPE,
    ));
    nodes.push(subtype_of(
        Node::object_type(ids::BASE_EVENT_TYPE, "BaseEventType", true),
        ids::BASE_OBJECT_TYPE,
    ));

    nodes.push(Node::variable_type(ids::BASE_VARIABLE_TYPE, "BaseVariableType", ids::BASE_DATA_TYPE, true));
    nodes.push(subtype_of(
        Node::variable_type(ids::BASE_DATA_VARIABLE_TYPE, "BaseDataVariableType", ids::BASE_DATA_TYPE, false),
        ids::BASE_VARIABLE_TYPE,
    ));
    nodes.push(subtype_of(
        Node::variable_type(ids::PROPERTY_TYPE, "PropertyType", ids::BASE_DATA_TYPE, false),
        ids::BASE_VARIABLE_TYPE,
    ));

    nodes.push(Node::data_type(ids::BASE_DATA_TYPE, "BaseDataType", true));
    for (id, name) in [
        (ids::BOOLEAN, "Boolean"),
        (ids::INT32, "Int32"),
        (ids::UINT32, "UInt32"),
        (ids::INT64, "Int64"),
        (ids::DOUBLE, "Double"),
        (ids::STRING, "String"),
        (ids::DATE_TIME, "DateTime"),
    ] {
        nodes.push(subtype_of(Node::data_type(id, name, false), ids::BASE_DATA_TYPE));
    }

    for (id, name) in [
        (ids::MODELLING_RULE_MANDATORY, "Mandatory"),
        (ids::MODELLING_RULE_OPTIONAL, "Optional"),
    ] {
        nodes.push(
            Node::object(id, name, name)
                .with_reference(Reference::forward(ids::HAS_TYPE_DEFINITION, ids::MODELLING_RULE_TYPE)),
        );
    }

    nodes.push(folder(ids::ROOT_FOLDER, "Root", None));
    nodes.push(folder(ids::OBJECTS_FOLDER, "Objects", Some(ids::ROOT_FOLDER)));
    nodes.push(
        folder(ids::TYPES_FOLDER, "Types", Some(ids::ROOT_FOLDER))
            .with_reference(Reference::forward(ids::ORGANIZES, ids::BASE_OBJECT_TYPE))
            .with_reference(Reference::forward(ids::ORGANIZES, ids::BASE_VARIABLE_TYPE))
            .with_reference(Reference::forward(ids::ORGANIZES, ids::BASE_DATA_TYPE))
            .with_reference(Reference::forward(ids::ORGANIZES, ids::REFERENCES)),
    );
    nodes.push(folder(ids::VIEWS_FOLDER, "Views", Some(ids::ROOT_FOLDER)));

    nodes.push(
        Node::object(ids::SERVER, "Server", "Server")
            .with_event_notifier(EventNotifier::SUBSCRIBE_TO_EVENTS)
            .with_reference(Reference::forward(ids::HAS_TYPE_DEFINITION, ids::SERVER_TYPE))
            .with_reference(Reference::inverse(ids::ORGANIZES, ids::OBJECTS_FOLDER)),
    );

    nodes
}

/// Id of the `ServerDiagnostics` object in the server namespace.
#[must_use]
pub fn diagnostics_object_id(namespace: u16) -> NodeId {
    NodeId::string(namespace, SERVER_DIAGNOSTICS)
}

/// Id of one diagnostics counter variable.
#[must_use]
pub fn diagnostics_counter_id(namespace: u16, counter: &str) -> NodeId {
    NodeId::string(namespace, format!("{SERVER_DIAGNOSTICS}.{counter}"))
}

/// The `ServerDiagnostics` object and its counters. The object hangs below
/// the Server object, so attaching it yields an external mirror for the core
/// manager.
#[must_use]
pub fn diagnostics_address_space(namespaces: &[u16]) -> Vec<Node> {
    let ns = namespaces.first().copied().unwrap_or(1);
    let object_id = diagnostics_object_id(ns);
    let mut nodes = vec![Node::object(
        object_id.clone(),
        QualifiedName::new(ns, SERVER_DIAGNOSTICS),
        SERVER_DIAGNOSTICS,
    )
    .with_reference(Reference::forward(ids::HAS_TYPE_DEFINITION, ids::BASE_OBJECT_TYPE))
    .with_reference(Reference::inverse(ids::HAS_COMPONENT, ids::SERVER))];
    for counter in DIAGNOSTIC_COUNTERS {
        nodes.push(
            Node::variable(
                diagnostics_counter_id(ns, counter),
                QualifiedName::new(ns, counter),
                counter,
                ids::INT64,
                Variant::Int64(0),
            )
            .with_reference(Reference::forward(ids::HAS_TYPE_DEFINITION, ids::BASE_DATA_VARIABLE_TYPE))
            .with_reference(Reference::inverse(ids::HAS_COMPONENT, object_id.clone())),
        );
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::{NodeGraph, TypeTree};
    use crate::browse::RelativePathElement;

    fn graph() -> NodeGraph {
        let mut graph = NodeGraph::new();
        for node in core_address_space() {
            let external = graph.attach_node(node, &TypeTree::new()).unwrap();
            assert!(external.is_empty(), "core skeleton must be self-contained");
        }
        graph
    }

    #[test]
    fn skeleton_is_mirrored_and_reachable() {
        let graph = graph();
        let objects = graph.get(&ids::OBJECTS_FOLDER).unwrap();
        assert!(objects.references.contains(&Reference::forward(ids::ORGANIZES, ids::SERVER)));
        let server = graph.get(&ids::SERVER).unwrap();
        assert_eq!(server.event_notifier(), Some(EventNotifier::SUBSCRIBE_TO_EVENTS));

        let tree = TypeTree::new();
        tree.add_reference_type(ids::HIERARCHICAL_REFERENCES, None);
        tree.add_reference_type(ids::ORGANIZES, Some(ids::HIERARCHICAL_REFERENCES));
        let hop = graph
            .find_targets(&ids::ROOT_FOLDER, &RelativePathElement::child("Objects"), &tree)
            .unwrap();
        assert_eq!(hop.matched, vec![ids::OBJECTS_FOLDER]);
    }

    #[test]
    fn reference_types_have_supertypes_except_the_root() {
        let rows = reference_types();
        assert_eq!(rows.iter().filter(|r| r.5.is_none()).count(), 1);
        let graph = graph();
        let has_subtype = graph.get(&ids::HAS_SUBTYPE).unwrap();
        assert!(has_subtype
            .references
            .contains(&Reference::inverse(ids::HAS_SUBTYPE, ids::HAS_CHILD)));
    }

    #[test]
    fn diagnostics_hang_below_server() {
        let mut graph = NodeGraph::new();
        let mut external = Vec::new();
        for node in diagnostics_address_space(&[1]) {
            external.extend(graph.attach_node(node, &TypeTree::new()).unwrap());
        }
        let to_server: Vec<_> = external.iter().filter(|e| e.node_id == ids::SERVER).collect();
        assert_eq!(to_server.len(), 1);
        assert_eq!(
            to_server[0].reference,
            Reference::forward(ids::HAS_COMPONENT, diagnostics_object_id(1))
        );
        assert_eq!(graph.len(), 1 + DIAGNOSTIC_COUNTERS.len());
    }
}
