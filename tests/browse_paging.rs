use std::sync::{Arc, OnceLock};

use uacore::browse::{BrowseDescription, HopTargets, RelativePathElement};
use uacore::manager::{ManagerContext, NodeMetadata};
use uacore::node_id::ids;
use uacore::service::NodeBrowseItem;
use uacore::{
    InMemoryNodeManager, ManagerId, MasterNodeManager, Node, NodeClass, NodeHandle, NodeId, NodeManager,
    OperationContext, QualifiedName, Reference, ServerConfig, ServiceError, ServiceItem, StatusCode,
};

const PLANT: &str = "urn:uacore:test:paging";
const TRIPWIRE: &str = "urn:uacore:test:tripwire";
const CHILDREN: u32 = 25;

/// Folder `i=1` with 25 variables and one object, and folder `i=2` with 25
/// variables plus a reference to the tripwire node.
fn nodes(namespaces: &[u16], tripwire: Option<NodeId>) -> Vec<Node> {
    let ns = namespaces[0];
    let mut nodes = Vec::new();
    for folder in [1, 2] {
        let folder_id = NodeId::numeric(ns, folder);
        let mut node = Node::object(folder_id.clone(), QualifiedName::new(ns, format!("Line{folder}")), "Line")
            .with_reference(Reference::forward(ids::HAS_TYPE_DEFINITION, ids::FOLDER_TYPE))
            .with_reference(Reference::inverse(ids::ORGANIZES, ids::OBJECTS_FOLDER));
        if folder == 2 {
            if let Some(target) = &tripwire {
                node = node.with_reference(Reference::forward(ids::ORGANIZES, target.clone()));
            }
        }
        nodes.push(node);
        for child in 0..CHILDREN {
            let id = folder * 1000 + child;
            nodes.push(
                Node::variable(
                    NodeId::numeric(ns, id),
                    QualifiedName::new(ns, format!("Sensor{id}")),
                    "Sensor",
                    ids::DOUBLE,
                    0.0,
                )
                .with_reference(Reference::inverse(ids::ORGANIZES, folder_id.clone())),
            );
        }
    }
    nodes.push(
        Node::object(NodeId::numeric(ns, 9), QualifiedName::new(ns, "Cabinet"), "Cabinet")
            .with_reference(Reference::inverse(ids::ORGANIZES, NodeId::numeric(ns, 1))),
    );
    nodes
}

fn master_with(config: ServerConfig) -> (MasterNodeManager, u16) {
    let master = MasterNodeManager::with_defaults(config).unwrap();
    let plant = InMemoryNodeManager::new("paging", vec![PLANT.to_string()]).with_address_space(|ns| nodes(ns, None));
    master.register_manager(Arc::new(plant)).unwrap();
    master.startup().unwrap();
    let ns = master.namespace_index(PLANT).unwrap();
    (master, ns)
}

fn client(master: &MasterNodeManager) -> OperationContext {
    OperationContext::new(Arc::new(master.session_builder().build()))
}

fn browse(master: &MasterNodeManager, ctx: &OperationContext, node: NodeId, max: usize) -> ServiceItem<BrowseDescription, uacore::browse::BrowseResult> {
    let mut items = vec![ServiceItem::new(BrowseDescription::hierarchical(node))];
    master.browse(ctx, max, &mut items).unwrap();
    items.remove(0)
}

#[test]
fn continuation_points_page_through_every_reference() {
    let (master, ns) = master_with(ServerConfig::default());
    let ctx = client(&master);

    let first = browse(&master, &ctx, NodeId::numeric(ns, 2), 10);
    let first = first.result().unwrap().clone();
    assert_eq!(first.references.len(), 10);
    let point = first.continuation_point.unwrap();
    assert_eq!(ctx.session().continuation_point_count(), 1);

    let mut seen: Vec<_> = first.references.clone();
    let mut next = Some(point);
    while let Some(id) = next {
        let mut items = vec![ServiceItem::new(id)];
        master.browse_next(&ctx, false, &mut items).unwrap();
        let page = items[0].result().unwrap();
        assert!(page.references.len() <= 10);
        seen.extend(page.references.iter().cloned());
        next = page.continuation_point;
    }

    assert_eq!(seen.len(), CHILDREN as usize);
    let mut ids: Vec<_> = seen.iter().map(|r| r.node_id.clone()).collect();
    ids.dedup();
    assert_eq!(ids.len(), CHILDREN as usize);
    assert_eq!(ctx.session().continuation_point_count(), 0);
}

#[test]
fn a_page_size_of_zero_uses_the_server_limit() {
    let config = ServerConfig {
        max_references_per_node: 30,
        ..ServerConfig::default()
    };
    let (master, ns) = master_with(config);
    let ctx = client(&master);
    let item = browse(&master, &ctx, NodeId::numeric(ns, 1), 0);
    let result = item.result().unwrap();
    assert_eq!(result.references.len(), CHILDREN as usize + 1);
    assert!(result.continuation_point.is_none());
}

#[test]
fn node_class_mask_filters_targets() {
    let (master, ns) = master_with(ServerConfig::default());
    let ctx = client(&master);
    let mut items = vec![ServiceItem::new(BrowseDescription {
        node_class_mask: NodeClass::Object.mask(),
        ..BrowseDescription::hierarchical(NodeId::numeric(ns, 1))
    })];
    master.browse(&ctx, 0, &mut items).unwrap();
    let references = &items[0].result().unwrap().references;
    assert_eq!(references.len(), 1);
    assert_eq!(references[0].node_class, Some(NodeClass::Object));
}

#[test]
fn released_and_unknown_points_are_invalid() {
    let (master, ns) = master_with(ServerConfig::default());
    let ctx = client(&master);
    let point = browse(&master, &ctx, NodeId::numeric(ns, 1), 5)
        .result()
        .unwrap()
        .continuation_point
        .unwrap();

    let mut release = vec![ServiceItem::new(point)];
    master.browse_next(&ctx, true, &mut release).unwrap();
    assert_eq!(release[0].status(), StatusCode::Good);
    assert!(release[0].result().unwrap().references.is_empty());
    assert_eq!(ctx.session().continuation_point_count(), 0);

    let mut again = vec![ServiceItem::new(point)];
    master.browse_next(&ctx, false, &mut again).unwrap();
    assert_eq!(again[0].status(), StatusCode::BadContinuationPointInvalid);
}

#[test]
fn points_belong_to_their_session() {
    let (master, ns) = master_with(ServerConfig::default());
    let owner = client(&master);
    let other = client(&master);
    let point = browse(&master, &owner, NodeId::numeric(ns, 1), 5)
        .result()
        .unwrap()
        .continuation_point
        .unwrap();

    let mut items = vec![ServiceItem::new(point)];
    master.browse_next(&other, false, &mut items).unwrap();
    assert_eq!(items[0].status(), StatusCode::BadContinuationPointInvalid);

    assert_eq!(owner.session().close(), 1);
    let mut items = vec![ServiceItem::new(point)];
    master.browse_next(&owner, false, &mut items).unwrap();
    assert_eq!(items[0].status(), StatusCode::BadSessionIdInvalid);
}

#[test]
fn the_session_budget_evicts_the_oldest_point() {
    let config = ServerConfig {
        max_browse_continuation_points: 1,
        ..ServerConfig::default()
    };
    let (master, ns) = master_with(config);
    let ctx = client(&master);
    let oldest = browse(&master, &ctx, NodeId::numeric(ns, 1), 5)
        .result()
        .unwrap()
        .continuation_point
        .unwrap();
    let newest = browse(&master, &ctx, NodeId::numeric(ns, 2), 5)
        .result()
        .unwrap()
        .continuation_point
        .unwrap();
    assert_eq!(ctx.session().continuation_point_count(), 1);

    let mut items = vec![ServiceItem::new(oldest), ServiceItem::new(newest)];
    master.browse_next(&ctx, false, &mut items).unwrap();
    assert_eq!(items[0].status(), StatusCode::BadContinuationPointInvalid);
    assert_eq!(items[1].status(), StatusCode::Good);
}

#[test]
fn one_call_allocates_a_limited_number_of_points() {
    let config = ServerConfig {
        max_continuation_points_per_browse: 1,
        ..ServerConfig::default()
    };
    let (master, ns) = master_with(config);
    let ctx = client(&master);
    let mut items = vec![
        ServiceItem::new(BrowseDescription::hierarchical(NodeId::numeric(ns, 1))),
        ServiceItem::new(BrowseDescription::hierarchical(NodeId::numeric(ns, 2))),
    ];
    master.browse(&ctx, 5, &mut items).unwrap();
    assert!(items[0].result().unwrap().continuation_point.is_some());
    assert_eq!(items[1].status(), StatusCode::BadNoContinuationPoints);
}

#[test]
fn invalid_reference_types_fail_the_item() {
    let (master, ns) = master_with(ServerConfig::default());
    let ctx = client(&master);
    let mut items = vec![ServiceItem::new(BrowseDescription {
        reference_type_id: Some(NodeId::numeric(ns, 1)),
        ..BrowseDescription::hierarchical(NodeId::numeric(ns, 1))
    })];
    master.browse(&ctx, 0, &mut items).unwrap();
    assert_eq!(items[0].status(), StatusCode::BadReferenceTypeIdInvalid);
}

/// Owns one node; asking for its metadata cancels the request.
#[derive(Default)]
struct Tripwire {
    context: OnceLock<(ManagerId, u16)>,
}

impl Tripwire {
    fn owned(&self, node_id: &NodeId) -> Option<ManagerId> {
        let (id, ns) = *self.context.get()?;
        (*node_id == NodeId::numeric(ns, 1)).then_some(id)
    }
}

impl NodeManager for Tripwire {
    fn name(&self) -> &str {
        "tripwire"
    }

    fn namespace_uris(&self) -> Vec<String> {
        vec![TRIPWIRE.to_string()]
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

    fn node_metadata(&self, ctx: &OperationContext, node_ids: &[NodeId]) -> Vec<Option<NodeMetadata>> {
        ctx.cancel();
        node_ids
            .iter()
            .map(|id| self.owned(id).map(|_| NodeMetadata::of(&Node::object(id.clone(), "Trip", "Trip"))))
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
}

#[test]
fn cancellation_releases_the_points_of_the_call() {
    let master = MasterNodeManager::with_defaults(ServerConfig::default()).unwrap();
    let tripwire = Arc::new(Tripwire::default());
    master.register_manager(Arc::clone(&tripwire) as Arc<dyn NodeManager>).unwrap();
    let trip_ns = master.namespace_index(TRIPWIRE).unwrap();
    let trip_node = NodeId::numeric(trip_ns, 1);
    let plant = InMemoryNodeManager::new("paging", vec![PLANT.to_string()])
        .with_address_space(move |ns| nodes(ns, Some(trip_node)));
    master.register_manager(Arc::new(plant)).unwrap();
    master.startup().unwrap();
    let ns = master.namespace_index(PLANT).unwrap();

    let ctx = client(&master);
    let mut items = vec![
        ServiceItem::new(BrowseDescription::hierarchical(NodeId::numeric(ns, 1))),
        ServiceItem::new(BrowseDescription::hierarchical(NodeId::numeric(ns, 2))),
        ServiceItem::new(BrowseDescription::hierarchical(NodeId::numeric(ns, 1))),
    ];
    let err = master.browse(&ctx, 5, &mut items).unwrap_err();
    assert!(matches!(err, ServiceError::Cancelled { completed: 2 }));
    assert_eq!(ctx.session().continuation_point_count(), 0);
}
