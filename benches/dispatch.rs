use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use uacore::browse::BrowseDescription;
use uacore::node_id::ids;
use uacore::service::ReadValueId;
use uacore::subscription::quantize;
use uacore::value::TimestampsToReturn;
use uacore::{
    InMemoryNodeManager, MasterNodeManager, Node, NodeId, OperationContext, QualifiedName, Reference, ServerConfig,
    ServiceItem,
};

const PLANT: &str = "urn:uacore:bench:plant";
const SENSORS: u32 = 512;

// One folder holding 512 double variables.
fn make_master() -> (MasterNodeManager, u16) {
    let master = MasterNodeManager::with_defaults(ServerConfig::default()).unwrap();
    let plant = InMemoryNodeManager::new("bench", vec![PLANT.to_string()]).with_address_space(|namespaces| {
        let ns = namespaces[0];
        let folder = NodeId::numeric(ns, 1);
        let mut nodes = vec![Node::object(folder.clone(), QualifiedName::new(ns, "Line"), "Line")
            .with_reference(Reference::forward(ids::HAS_TYPE_DEFINITION, ids::FOLDER_TYPE))
            .with_reference(Reference::inverse(ids::ORGANIZES, ids::OBJECTS_FOLDER))];
        for i in 0..SENSORS {
            nodes.push(
                Node::variable(
                    NodeId::numeric(ns, 100 + i),
                    QualifiedName::new(ns, format!("Sensor{i}")),
                    "Sensor",
                    ids::DOUBLE,
                    f64::from(i),
                )
                .with_reference(Reference::inverse(ids::ORGANIZES, folder.clone())),
            );
        }
        nodes
    });
    master.register_manager(Arc::new(plant)).unwrap();
    master.startup().unwrap();
    let ns = master.namespace_index(PLANT).unwrap();
    (master, ns)
}

fn bench_read(c: &mut Criterion) {
    let (master, ns) = make_master();
    let ctx = OperationContext::system();
    let template: Vec<ReadValueId> = (0..SENSORS).map(|i| ReadValueId::value(NodeId::numeric(ns, 100 + i))).collect();

    let mut group = c.benchmark_group("dispatch/read");
    group.throughput(Throughput::Elements(u64::from(SENSORS)));
    group.bench_function("values", |b| {
        b.iter_batched(
            || template.iter().cloned().map(ServiceItem::new).collect::<Vec<_>>(),
            |mut items| {
                master.read(&ctx, TimestampsToReturn::Both, &mut items).unwrap();
                black_box(items)
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

fn bench_browse(c: &mut Criterion) {
    let (master, ns) = make_master();
    let ctx = OperationContext::system();

    c.bench_function("dispatch/browse_folder", |b| {
        b.iter(|| {
            let mut items = vec![ServiceItem::new(BrowseDescription::hierarchical(NodeId::numeric(ns, 1)))];
            master.browse(&ctx, 0, &mut items).unwrap();
            black_box(items)
        });
    });
}

fn bench_quantize(c: &mut Criterion) {
    let bands = ServerConfig::default().sampling_rates;
    c.bench_function("dispatch/quantize", |b| {
        b.iter(|| {
            let mut total = 0.0;
            for requested in [0.0, 37.5, 150.0, 999.0, 12_345.0, f64::MAX] {
                total += quantize(&bands, black_box(requested));
            }
            black_box(total)
        });
    });
}

criterion_group!(benches, bench_read, bench_browse, bench_quantize);
criterion_main!(benches);
