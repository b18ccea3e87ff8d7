use std::sync::Arc;
use std::time::Duration;

use uacore::browse::{BrowseDescription, BrowseDirection, BrowsePath, RelativePathElement};
use uacore::node_id::ids;
use uacore::{
    ExpandedNodeId, InMemoryNodeManager, MasterNodeManager, Node, NodeId, OperationContext, QualifiedName, Reference,
    ServerConfig, ServiceItem, StatusCode,
};

const PLANT: &str = "urn:uacore:test:lifecycle";

fn plant_nodes(namespaces: &[u16]) -> Vec<Node> {
    let ns = namespaces[0];
    let boiler = NodeId::numeric(ns, 1);
    let pump_type = NodeId::numeric(ns, 10);
    vec![
        Node::object(boiler.clone(), QualifiedName::new(ns, "Boiler"), "Boiler")
            .with_reference(Reference::forward(ids::HAS_TYPE_DEFINITION, ids::BASE_OBJECT_TYPE))
            .with_reference(Reference::inverse(ids::ORGANIZES, ids::OBJECTS_FOLDER)),
        Node::variable(
            NodeId::numeric(ns, 2),
            QualifiedName::new(ns, "Temperature"),
            "Temperature",
            ids::DOUBLE,
            20.0,
        )
        .with_reference(Reference::inverse(ids::HAS_COMPONENT, boiler)),
        Node::object_type(pump_type.clone(), QualifiedName::new(ns, "PumpType"), false)
            .with_reference(Reference::inverse(ids::HAS_SUBTYPE, ids::BASE_OBJECT_TYPE)),
        Node::variable(
            NodeId::numeric(ns, 11),
            QualifiedName::new(ns, "Speed"),
            "Speed",
            ids::DOUBLE,
            0.0,
        )
        .with_reference(Reference::inverse(ids::HAS_COMPONENT, pump_type.clone()))
        .with_reference(Reference::forward(ids::HAS_MODELLING_RULE, ids::MODELLING_RULE_MANDATORY)),
        Node::object(NodeId::numeric(ns, 20), QualifiedName::new(ns, "Pump1"), "Pump1")
            .with_reference(Reference::forward(ids::HAS_TYPE_DEFINITION, pump_type))
            .with_reference(Reference::inverse(ids::ORGANIZES, ids::OBJECTS_FOLDER)),
    ]
}

fn fixture() -> (MasterNodeManager, InMemoryNodeManager, u16) {
    let master = MasterNodeManager::with_defaults(ServerConfig::default()).unwrap();
    let plant = InMemoryNodeManager::new("lifecycle", vec![PLANT.to_string()]).with_address_space(plant_nodes);
    master.register_manager(Arc::new(plant.clone())).unwrap();
    master.startup().unwrap();
    let ns = master.namespace_index(PLANT).unwrap();
    (master, plant, ns)
}

fn targets(master: &MasterNodeManager, description: BrowseDescription) -> Vec<ExpandedNodeId> {
    let ctx = OperationContext::system();
    let mut items = vec![ServiceItem::new(description)];
    master.browse(&ctx, 0, &mut items).unwrap();
    items[0]
        .result()
        .map(|r| r.references.iter().map(|r| r.node_id.clone()).collect())
        .unwrap_or_default()
}

fn local(id: &NodeId) -> ExpandedNodeId {
    ExpandedNodeId::local(id.clone())
}

#[test]
fn deleting_a_node_cleans_edges_held_by_other_managers() {
    let (master, plant, ns) = fixture();
    let ctx = OperationContext::system();
    let boiler = NodeId::numeric(ns, 1);
    assert!(targets(&master, BrowseDescription::hierarchical(ids::OBJECTS_FOLDER)).contains(&local(&boiler)));

    let deleted = master.delete_node(&ctx, &boiler, true).unwrap();
    assert_eq!(deleted.len(), 2);
    assert!(deleted.contains(&NodeId::numeric(ns, 2)));
    assert!(plant.node(&boiler).is_none());

    assert!(master.flush_cleanup(Duration::from_secs(2)));
    assert!(!targets(&master, BrowseDescription::hierarchical(ids::OBJECTS_FOLDER)).contains(&local(&boiler)));
    assert!(master.references_cleaned() >= 1);
    assert_eq!(master.resolve(&boiler), None);
}

#[test]
fn deleting_without_children_keeps_them() {
    let (master, plant, ns) = fixture();
    let ctx = OperationContext::system();
    let deleted = master.delete_node(&ctx, &NodeId::numeric(ns, 1), false).unwrap();
    assert_eq!(deleted, vec![NodeId::numeric(ns, 1)]);
    let temperature = plant.node(&NodeId::numeric(ns, 2)).unwrap();
    assert!(temperature
        .references
        .iter()
        .all(|r| r.reference_type_id != ids::HAS_COMPONENT));

    assert_eq!(
        master.delete_node(&ctx, &NodeId::numeric(ns, 1), false),
        Err(StatusCode::BadNodeIdUnknown)
    );
}

#[test]
fn added_nodes_are_linked_into_other_managers() {
    let (master, _plant, ns) = fixture();
    let ctx = OperationContext::system();
    let valve = NodeId::numeric(ns, 30);
    let node = Node::object(valve.clone(), QualifiedName::new(ns, "Valve"), "Valve")
        .with_reference(Reference::inverse(ids::ORGANIZES, ids::OBJECTS_FOLDER));
    master.add_node(&ctx, node.clone()).unwrap();
    assert!(targets(&master, BrowseDescription::hierarchical(ids::OBJECTS_FOLDER)).contains(&local(&valve)));

    assert_eq!(master.add_node(&ctx, node), Err(StatusCode::BadNodeIdExists));
    assert_eq!(
        master.add_node(&ctx, Node::object(NodeId::numeric(42, 1), "Orphan", "Orphan")),
        Err(StatusCode::BadNodeIdInvalid)
    );
    let dangling = Node::object(NodeId::numeric(ns, 31), QualifiedName::new(ns, "Dangling"), "Dangling")
        .with_reference(Reference::inverse(ids::ORGANIZES, NodeId::numeric(42, 7)));
    assert_eq!(master.add_node(&ctx, dangling), Err(StatusCode::BadNodeIdUnknown));
}

#[test]
fn cross_manager_references_are_mirrored_and_removed() {
    let (master, _plant, ns) = fixture();
    let ctx = OperationContext::system();
    let temperature = NodeId::numeric(ns, 2);
    let reference = Reference::forward(ids::ORGANIZES, temperature.clone());

    master
        .add_reference(&ctx, &ids::SERVER, reference.clone(), true)
        .unwrap();
    let inverse = BrowseDescription::all(temperature.clone(), BrowseDirection::Inverse);
    assert!(targets(&master, inverse.clone()).contains(&local(&ids::SERVER)));

    master
        .delete_reference(&ctx, &ids::SERVER, &reference, true)
        .unwrap();
    assert!(!targets(&master, inverse).contains(&local(&ids::SERVER)));
    assert!(!targets(&master, BrowseDescription::hierarchical(ids::SERVER)).contains(&local(&temperature)));

    assert_eq!(
        master.add_reference(&ctx, &ids::SERVER, Reference::forward(NodeId::numeric(ns, 1), temperature), true),
        Err(StatusCode::BadReferenceTypeIdInvalid)
    );
}

#[test]
fn instantiation_creates_mandatory_children() {
    let (master, _plant, ns) = fixture();
    let ctx = OperationContext::system();
    let pump = NodeId::numeric(ns, 20);
    let created = master
        .instantiate(&ctx, &pump, &NodeId::numeric(ns, 10), None)
        .unwrap();
    assert_eq!(created.len(), 1);

    let mut items = vec![ServiceItem::new(BrowsePath {
        starting_node: ids::OBJECTS_FOLDER,
        relative_path: vec![
            RelativePathElement::child(QualifiedName::new(ns, "Pump1")),
            RelativePathElement::child(QualifiedName::new(ns, "Speed")),
        ],
    })];
    master.translate_browse_paths(&ctx, &mut items).unwrap();
    assert_eq!(items[0].result().unwrap()[0].target_id, local(&created[0]));
    assert!(master.resolve(&created[0]).is_some());
}

#[test]
fn generates_event_references_are_not_mirrored() {
    let (master, plant, ns) = fixture();
    let ctx = OperationContext::system();
    let boiler = NodeId::numeric(ns, 1);
    master
        .add_reference(&ctx, &boiler, Reference::forward(ids::GENERATES_EVENT, ids::BASE_EVENT_TYPE), true)
        .unwrap();

    assert!(plant
        .node(&boiler)
        .unwrap()
        .references
        .contains(&Reference::forward(ids::GENERATES_EVENT, ids::BASE_EVENT_TYPE)));
    let inverse = BrowseDescription::all(ids::BASE_EVENT_TYPE, BrowseDirection::Inverse);
    assert!(!targets(&master, inverse.clone()).contains(&local(&boiler)));

    master.delete_node(&ctx, &boiler, true).unwrap();
    assert!(master.flush_cleanup(Duration::from_secs(2)));
    assert!(!targets(&master, inverse).contains(&local(&boiler)));
}
