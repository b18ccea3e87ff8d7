use std::sync::{Arc, OnceLock};

use uacore::browse::{BrowseDescription, BrowsePath, HopTargets, RelativePathElement};
use uacore::manager::{ManagerContext, NodeMetadata};
use uacore::node::AccessLevel;
use uacore::node_id::ids;
use uacore::security::{PermissionType, RolePermission};
use uacore::service::{
    CallMethodRequest, HistoryReadValueId, NodeBrowseItem, ReadItem, ReadRawDetails, ReadValueId, WriteValue,
};
use uacore::value::TimestampsToReturn;
use uacore::{
    AttributeId, ExpandedNodeId, InMemoryNodeManager, MasterNodeManager, Node, NodeHandle, NodeId, NodeManager,
    OperationContext, QualifiedName, Reference, ServerConfig, ServiceItem, StatusCode, Variant,
};

const PLANT: &str = "urn:uacore:test:plant";

fn operator() -> NodeId {
    NodeId::numeric(0, 15680)
}

fn observer() -> NodeId {
    NodeId::numeric(0, 15668)
}

fn plant_nodes(namespaces: &[u16]) -> Vec<Node> {
    let ns = namespaces[0];
    let boiler = NodeId::numeric(ns, 1);
    vec![
        Node::object(boiler.clone(), QualifiedName::new(ns, "Boiler"), "Boiler")
            .with_reference(Reference::forward(ids::HAS_TYPE_DEFINITION, ids::BASE_OBJECT_TYPE))
            .with_reference(Reference::inverse(ids::ORGANIZES, ids::OBJECTS_FOLDER)),
        Node::variable(
            NodeId::numeric(ns, 2),
            QualifiedName::new(ns, "Temperature"),
            "Temperature",
            ids::DOUBLE,
            20.5,
        )
        .with_access_level(AccessLevel::CURRENT_READ | AccessLevel::CURRENT_WRITE)
        .with_historizing(true)
        .with_reference(Reference::inverse(ids::HAS_COMPONENT, boiler.clone())),
        Node::variable(
            NodeId::numeric(ns, 3),
            QualifiedName::new(ns, "Setpoint"),
            "Setpoint",
            ids::DOUBLE,
            80.0,
        )
        .with_role_permissions(vec![RolePermission::new(
            operator(),
            PermissionType::BROWSE | PermissionType::READ,
        )])
        .with_reference(Reference::inverse(ids::HAS_COMPONENT, boiler.clone())),
        Node::method(NodeId::numeric(ns, 4), QualifiedName::new(ns, "Reset"), "Reset")
            .with_reference(Reference::inverse(ids::HAS_COMPONENT, boiler)),
    ]
}

struct Fixture {
    master: MasterNodeManager,
    plant: InMemoryNodeManager,
    ns: u16,
}

fn fixture() -> Fixture {
    let master = MasterNodeManager::with_defaults(ServerConfig::default()).unwrap();
    let plant = InMemoryNodeManager::new("plant", vec![PLANT.to_string()]).with_address_space(plant_nodes);
    master.register_manager(Arc::new(plant.clone())).unwrap();
    master.startup().unwrap();
    let ns = master.namespace_index(PLANT).unwrap();
    Fixture { master, plant, ns }
}

fn session_with(master: &MasterNodeManager, role: NodeId) -> OperationContext {
    let session = master.session_builder().granted_roles(vec![role]).build();
    OperationContext::new(Arc::new(session))
}

/// Owns one node and panics on every read.
#[derive(Default)]
struct FaultyManager {
    context: OnceLock<(uacore::ManagerId, u16)>,
}

impl FaultyManager {
    fn owned(&self, node_id: &NodeId) -> Option<uacore::ManagerId> {
        let (id, ns) = *self.context.get()?;
        (*node_id == NodeId::numeric(ns, 1)).then_some(id)
    }
}

impl NodeManager for FaultyManager {
    fn name(&self) -> &str {
        "faulty"
    }

    fn namespace_uris(&self) -> Vec<String> {
        vec!["urn:uacore:test:faulty".to_string()]
    }

    fn attach(&self, context: ManagerContext) {
        let _ = self.context.set((context.id, context.namespace_indices[0]));
    }

    fn get_manager_handle(&self, node_id: &NodeId) -> Option<NodeHandle> {
        self.owned(node_id).map(|manager| NodeHandle {
            node_id: node_id.clone(),
            manager,
        })
    }

    fn node_metadata(&self, _ctx: &OperationContext, node_ids: &[NodeId]) -> Vec<Option<NodeMetadata>> {
        node_ids
            .iter()
            .map(|id| {
                self.owned(id)
                    .map(|_| NodeMetadata::of(&Node::object(id.clone(), "Sensor", "Sensor")))
            })
            .collect()
    }

    fn browse(&self, _ctx: &OperationContext, _items: &mut [NodeBrowseItem]) {}

    fn translate_hop(
        &self,
        _ctx: &OperationContext,
        _source: &NodeId,
        _element: &RelativePathElement,
    ) -> Result<HopTargets, StatusCode> {
        Err(StatusCode::BadNotSupported)
    }

    fn read(&self, _ctx: &OperationContext, _timestamps: TimestampsToReturn, _items: &mut [ReadItem]) {
        panic!("sensor bus offline");
    }
}

#[test]
fn every_item_of_a_batch_gets_a_result() {
    let f = fixture();
    let ctx = OperationContext::system();
    let mut items = vec![
        ServiceItem::new(ReadValueId::value(NodeId::numeric(f.ns, 2))),
        ServiceItem::new(ReadValueId::value(NodeId::numeric(f.ns, 99))),
        ServiceItem::new(ReadValueId::attribute(ids::SERVER, AttributeId::BrowseName)),
        ServiceItem::new(ReadValueId {
            attribute_id: 999,
            ..ReadValueId::value(ids::SERVER)
        }),
    ];
    f.master.read(&ctx, TimestampsToReturn::Both, &mut items).unwrap();

    assert!(items.iter().all(|i| i.is_processed() && i.result().is_some()));
    assert_eq!(items[0].status(), StatusCode::Good);
    assert_eq!(items[0].result().unwrap().value, Variant::Double(20.5));
    assert_eq!(items[1].status(), StatusCode::BadNodeIdUnknown);
    assert_eq!(items[1].result().unwrap().status, StatusCode::BadNodeIdUnknown);
    assert_eq!(
        items[2].result().unwrap().value,
        Variant::QualifiedName(QualifiedName::from("Server"))
    );
    assert_eq!(items[3].status(), StatusCode::BadAttributeIdInvalid);

    let stats = f.master.stats();
    assert_eq!(stats.service_calls, 1);
    assert_eq!(stats.items_failed, 2);
}

#[test]
fn timestamps_are_filtered_on_the_way_out() {
    let f = fixture();
    let ctx = OperationContext::system();
    let mut items = vec![ServiceItem::new(ReadValueId::value(NodeId::numeric(f.ns, 2)))];
    f.master.read(&ctx, TimestampsToReturn::Neither, &mut items).unwrap();
    let value = items[0].result().unwrap();
    assert!(value.source_timestamp.is_none());
    assert!(value.server_timestamp.is_none());
}

#[test]
fn a_panicking_manager_fails_only_its_own_items() {
    let master = MasterNodeManager::with_defaults(ServerConfig::default()).unwrap();
    master.register_manager(Arc::new(FaultyManager::default())).unwrap();
    master.startup().unwrap();
    let ns = master.namespace_index("urn:uacore:test:faulty").unwrap();

    let ctx = OperationContext::system();
    let mut items = vec![
        ServiceItem::new(ReadValueId::value(NodeId::numeric(ns, 1))),
        ServiceItem::new(ReadValueId::attribute(ids::SERVER, AttributeId::BrowseName)),
    ];
    master.read(&ctx, TimestampsToReturn::Both, &mut items).unwrap();

    assert_eq!(items[0].status(), StatusCode::BadUnexpectedError);
    assert!(items[0].diagnostic().is_some());
    assert_eq!(items[1].status(), StatusCode::Good);
}

#[test]
fn role_permissions_gate_reads_and_browse() {
    let f = fixture();
    let setpoint = NodeId::numeric(f.ns, 3);

    let observer_ctx = session_with(&f.master, observer());
    let mut items = vec![ServiceItem::new(ReadValueId::value(setpoint.clone()))];
    f.master.read(&observer_ctx, TimestampsToReturn::Both, &mut items).unwrap();
    assert_eq!(items[0].status(), StatusCode::BadUserAccessDenied);

    let operator_ctx = session_with(&f.master, operator());
    let mut items = vec![ServiceItem::new(ReadValueId::value(setpoint.clone()))];
    f.master.read(&operator_ctx, TimestampsToReturn::Both, &mut items).unwrap();
    assert_eq!(items[0].status(), StatusCode::Good);

    let browse_children = |ctx: &OperationContext| {
        let mut items = vec![ServiceItem::new(BrowseDescription::hierarchical(NodeId::numeric(f.ns, 1)))];
        f.master.browse(ctx, 0, &mut items).unwrap();
        items[0]
            .result()
            .unwrap()
            .references
            .iter()
            .filter_map(|r| r.node_id.as_local().cloned())
            .collect::<Vec<_>>()
    };
    assert!(!browse_children(&observer_ctx).contains(&setpoint));
    assert!(browse_children(&operator_ctx).contains(&setpoint));
}

#[test]
fn objects_folder_lists_nodes_of_another_manager() {
    let f = fixture();
    let ctx = OperationContext::system();
    let mut items = vec![ServiceItem::new(BrowseDescription::hierarchical(ids::OBJECTS_FOLDER))];
    f.master.browse(&ctx, 0, &mut items).unwrap();
    let references = &items[0].result().unwrap().references;
    let boiler = references
        .iter()
        .find(|r| r.node_id == ExpandedNodeId::local(NodeId::numeric(f.ns, 1)))
        .unwrap();
    assert_eq!(boiler.browse_name, Some(QualifiedName::new(f.ns, "Boiler")));
    assert_eq!(boiler.reference_type_id, ids::ORGANIZES);
    assert!(references
        .iter()
        .any(|r| r.node_id == ExpandedNodeId::local(ids::SERVER)));
}

#[test]
fn translate_walks_across_managers() {
    let f = fixture();
    let ctx = OperationContext::system();
    let path = |names: Vec<QualifiedName>| BrowsePath {
        starting_node: ids::ROOT_FOLDER,
        relative_path: names.into_iter().map(RelativePathElement::child).collect(),
    };
    let mut items = vec![
        ServiceItem::new(path(vec![
            QualifiedName::from("Objects"),
            QualifiedName::new(f.ns, "Boiler"),
            QualifiedName::new(f.ns, "Temperature"),
        ])),
        ServiceItem::new(path(vec![QualifiedName::from("Objects"), QualifiedName::new(f.ns, "Pump")])),
        ServiceItem::new(path(Vec::new())),
        ServiceItem::new(path(vec![QualifiedName::from(""), QualifiedName::from("Server")])),
    ];
    f.master.translate_browse_paths(&ctx, &mut items).unwrap();

    let targets = items[0].result().unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].target_id, ExpandedNodeId::local(NodeId::numeric(f.ns, 2)));
    assert_eq!(targets[0].remaining_path_index, u32::MAX);
    assert_eq!(items[1].status(), StatusCode::BadNoMatch);
    assert_eq!(items[2].status(), StatusCode::BadNothingToDo);
    assert_eq!(items[3].status(), StatusCode::BadBrowseNameInvalid);
}

#[test]
fn writes_are_recorded_in_history() {
    let f = fixture();
    let ctx = OperationContext::system();
    let temperature = NodeId::numeric(f.ns, 2);

    let mut writes = vec![
        ServiceItem::new(WriteValue::value(temperature.clone(), 21.0)),
        ServiceItem::new(WriteValue::value(NodeId::numeric(f.ns, 3), 90.0)),
    ];
    f.master.write(&ctx, &mut writes).unwrap();
    assert_eq!(writes[0].status(), StatusCode::Good);
    assert_eq!(writes[1].status(), StatusCode::BadNotWritable);

    let mut reads = vec![ServiceItem::new(HistoryReadValueId {
        node_id: temperature,
        index_range: None,
    })];
    f.master
        .history_read(&ctx, &ReadRawDetails::default(), &mut reads)
        .unwrap();
    let values = &reads[0].result().unwrap().values;
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].value, Variant::Double(21.0));
}

#[test]
fn methods_are_called_on_their_object() {
    let f = fixture();
    let ctx = OperationContext::system();
    let boiler = NodeId::numeric(f.ns, 1);
    let reset = NodeId::numeric(f.ns, 4);
    f.plant
        .register_method(reset.clone(), |_, _, args| Ok(vec![Variant::Boolean(args.is_empty())]));

    let call = |object_id: NodeId, method_id: NodeId| {
        ServiceItem::new(CallMethodRequest {
            object_id,
            method_id,
            input_arguments: Vec::new(),
        })
    };
    let mut items = vec![
        call(boiler.clone(), reset.clone()),
        call(boiler, NodeId::numeric(f.ns, 77)),
        call(ids::SERVER, reset),
    ];
    f.master.call(&ctx, &mut items).unwrap();

    assert_eq!(items[0].status(), StatusCode::Good);
    assert_eq!(items[0].result().unwrap().output_arguments, vec![Variant::Boolean(true)]);
    assert_eq!(items[1].status(), StatusCode::BadMethodInvalid);
    assert_eq!(items[2].status(), StatusCode::BadMethodInvalid);
}

#[test]
fn cancelled_calls_stop_between_items() {
    let f = fixture();
    let ctx = OperationContext::system();
    ctx.cancel();
    let mut items = vec![ServiceItem::new(ReadValueId::value(NodeId::numeric(f.ns, 2)))];
    let err = f.master.read(&ctx, TimestampsToReturn::Both, &mut items).unwrap_err();
    assert!(matches!(err, uacore::ServiceError::Cancelled { .. }));
}
