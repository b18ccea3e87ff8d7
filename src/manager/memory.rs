//! In-memory node manager over a [`NodeGraph`].
//!
//! One mutex guards the graph, the monitored-item index and the raw history.
//! Everything that may call back into this manager (sampling, value sources,
//! method handlers, the cleanup queue, event delivery) runs after that lock
//! is released.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, Weak};

use tracing::{debug, error, warn};

use crate::address_space::{apply_modelling_rules, InstanceTemplate, ModellingOutcome, NodeGraph, TypeTree};
use crate::browse::{HopTargets, RelativePathElement};
use crate::node::{AttributeId, EventNotifier, Node, NodeAttributes, NodeClass, Reference};
use crate::node_id::{ids, ExpandedNodeId, NodeId};
use crate::service::{
    CallItem, CallMethodResult, CreateMonitoredItem, ExistingMonitoredItem, HistoryData, HistoryReadItem,
    HistoryUpdateDetails, HistoryUpdateItem, HistoryUpdateResult, ModifyMonitoredItem, MonitoredItemCreateResult,
    MonitoredItemModifyResult, MonitoringParameters, NodeBrowseItem, ReadItem, ReadRawDetails, ReadValueId,
    ServiceItem, SubscriptionContext, WriteItem,
};
use crate::session::{OperationContext, SessionId};
use crate::status::StatusCode;
use crate::subscription::{
    validate_event_item, DeadbandType, EventFilter, EventFilterResult, EventManager, EventRecord, MonitoredItem,
    MonitoredItemSettings, MonitoringFilter, MonitoringMode, SampleReader, SamplingGroupManager,
};
use crate::value::{DataValue, NumericRange, TimestampsToReturn, Variant};

use super::{ExternalReference, ManagerContext, ManagerId, NodeHandle, NodeManager, NodeMetadata};

/// Invoked for a Call on a registered method: `(ctx, object, inputs)`.
pub type MethodHandler =
    dyn Fn(&OperationContext, &NodeId, &[Variant]) -> Result<Vec<Variant>, StatusCode> + Send + Sync;

/// Produces the current Value of a variable on every read.
pub type ValueSource = dyn Fn() -> DataValue + Send + Sync;

type AddressSpaceBuilder = Box<dyn FnOnce(&[u16]) -> Vec<Node> + Send>;

/// Longest notifier chain walked when delivering an event.
const MAX_NOTIFIER_DEPTH: usize = 32;

fn lock_err(context: &str) -> StatusCode {
    error!(context, "node manager lock poisoned");
    StatusCode::BadInternalError
}

#[derive(Default)]
struct ManagerState {
    graph: NodeGraph,
    items: HashMap<u32, Arc<MonitoredItem>>,
    // Items on non-Value attributes reported on change instead of sampled.
    exception_items: HashMap<NodeId, Vec<Arc<MonitoredItem>>>,
    history: HashMap<NodeId, VecDeque<DataValue>>,
}

struct ManagerInner {
    name: String,
    namespace_uris: Vec<String>,
    builder: Mutex<Option<AddressSpaceBuilder>>,
    context: OnceLock<ManagerContext>,
    state: Mutex<ManagerState>,
    sampling: OnceLock<SamplingGroupManager>,
    events: OnceLock<EventManager>,
    methods: RwLock<HashMap<NodeId, Arc<MethodHandler>>>,
    value_sources: RwLock<HashMap<NodeId, Arc<ValueSource>>>,
}

/// Reference node manager: an in-memory graph with method handlers, value
/// sources, raw history, sampling and events.
#[derive(Clone)]
pub struct InMemoryNodeManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for InMemoryNodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryNodeManager")
            .field("name", &self.inner.name)
            .field("namespace_uris", &self.inner.namespace_uris)
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

impl InMemoryNodeManager {
    /// Creates an empty manager serving `namespace_uris`.
    #[must_use]
    pub fn new(name: impl Into<String>, namespace_uris: Vec<String>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                name: name.into(),
                namespace_uris,
                builder: Mutex::new(None),
                context: OnceLock::new(),
                state: Mutex::new(ManagerState::default()),
                sampling: OnceLock::new(),
                events: OnceLock::new(),
                methods: RwLock::new(HashMap::new()),
                value_sources: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Sets the nodes created at startup. The closure receives the indices
    /// assigned to this manager's namespace URIs.
    #[must_use]
    pub fn with_address_space<F>(self, build: F) -> Self
    where
        F: FnOnce(&[u16]) -> Vec<Node> + Send + 'static,
    {
        if let Ok(mut builder) = self.inner.builder.lock() {
            *builder = Some(Box::new(build));
        }
        self
    }

    /// The id assigned at registration.
    #[must_use]
    pub fn id(&self) -> Option<ManagerId> {
        self.inner.context.get().map(|c| c.id)
    }

    /// Namespace indices assigned at registration.
    #[must_use]
    pub fn namespace_indices(&self) -> Vec<u16> {
        self.inner
            .context
            .get()
            .map(|c| c.namespace_indices.clone())
            .unwrap_or_default()
    }

    /// Installs the handler for Call on `method_id`.
    pub fn register_method<F>(&self, method_id: NodeId, handler: F)
    where
        F: Fn(&OperationContext, &NodeId, &[Variant]) -> Result<Vec<Variant>, StatusCode> + Send + Sync + 'static,
    {
        match self.inner.methods.write() {
            Ok(mut methods) => {
                methods.insert(method_id, Arc::new(handler));
            }
            Err(_) => {
                lock_err("methods");
            }
        }
    }

    /// Makes every read of the variable's Value call `source`.
    pub fn register_value_source<F>(&self, node_id: NodeId, source: F)
    where
        F: Fn() -> DataValue + Send + Sync + 'static,
    {
        match self.inner.value_sources.write() {
            Ok(mut sources) => {
                sources.insert(node_id, Arc::new(source));
            }
            Err(_) => {
                lock_err("value sources");
            }
        }
    }

    /// Sets a variable's value from the server side, bypassing the access
    /// level. Historizing variables record the value.
    pub fn set_value(&self, node_id: &NodeId, value: DataValue) -> Result<(), StatusCode> {
        let max_history = self.inner.max_history();
        let mut guard = self.inner.state()?;
        let state = &mut *guard;
        let node = state
            .graph
            .get_mut(node_id)
            .ok_or(StatusCode::BadNodeIdUnknown)?;
        let NodeAttributes::Variable(v) = &mut node.attributes else {
            return Err(StatusCode::BadNodeClassInvalid);
        };
        v.value = value.clone();
        if v.historizing {
            record_history(&mut state.history, node_id, value, max_history);
        }
        Ok(())
    }

    /// A copy of a node.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<Node> {
        self.inner.state().ok()?.graph.get(node_id).cloned()
    }

    /// Runs `f` against the graph under the manager lock.
    pub fn with_graph<R>(&self, f: impl FnOnce(&NodeGraph) -> R) -> Result<R, StatusCode> {
        let state = self.inner.state()?;
        Ok(f(&state.graph))
    }

    /// Number of live monitored items.
    #[must_use]
    pub fn monitored_item_count(&self) -> usize {
        self.inner.state().map(|s| s.items.len()).unwrap_or(0)
    }

    /// Number of live sampling groups.
    #[must_use]
    pub fn sampling_group_count(&self) -> usize {
        self.inner.sampling.get().map_or(0, SamplingGroupManager::group_count)
    }
}

impl ManagerInner {
    fn state(&self) -> Result<MutexGuard<'_, ManagerState>, StatusCode> {
        self.state.lock().map_err(|_| lock_err(&self.name))
    }

    fn id(&self) -> Option<ManagerId> {
        self.context.get().map(|c| c.id)
    }

    fn type_tree(&self) -> Option<&Arc<TypeTree>> {
        self.context.get().map(|c| &c.type_tree)
    }

    fn max_history(&self) -> usize {
        self.context
            .get()
            .map_or(1000, |c| c.config.max_history_values_per_node)
    }

    fn method(&self, method_id: &NodeId) -> Option<Arc<MethodHandler>> {
        self.methods.read().ok()?.get(method_id).cloned()
    }

    fn value_source(&self, node_id: &NodeId) -> Option<Arc<ValueSource>> {
        self.value_sources.read().ok()?.get(node_id).cloned()
    }

    fn has_value_source(&self, node_id: &NodeId) -> bool {
        self.value_sources
            .read()
            .map(|s| s.contains_key(node_id))
            .unwrap_or(false)
    }

    fn read_items(&self, id: ManagerId, items: &mut [ReadItem]) {
        let mut deferred: Vec<(usize, Arc<ValueSource>, Option<NumericRange>)> = Vec::new();
        {
            let state = match self.state() {
                Ok(s) => s,
                Err(status) => return fail_claimable(id, items, status),
            };
            for (index, item) in items.iter_mut().enumerate() {
                if !item.is_claimable_by(id) {
                    continue;
                }
                let request = item.request();
                let Some(attribute) = request.resolved_attribute() else {
                    item.fail(StatusCode::BadAttributeIdInvalid);
                    continue;
                };
                let range = match NumericRange::parse_optional(request.index_range.as_deref()) {
                    Ok(r) => r,
                    Err(status) => {
                        item.fail(status);
                        continue;
                    }
                };
                let Some(node) = state.graph.get(&request.node_id) else {
                    item.fail(StatusCode::BadNodeIdUnknown);
                    continue;
                };
                if attribute == AttributeId::Value && node.node_class() == NodeClass::Variable {
                    if let Some(source) = self.value_source(&request.node_id) {
                        deferred.push((index, source, range));
                        continue;
                    }
                }
                let value = node.read(attribute, range.as_ref());
                if value.status.is_bad() {
                    item.fail(value.status);
                } else {
                    item.complete(value);
                }
            }
        }
        for (index, source, range) in deferred {
            let value = source();
            let item = &mut items[index];
            match range {
                None => item.complete(value),
                Some(range) => match value.value.apply_range(&range) {
                    Ok(v) => item.complete(DataValue { value: v, ..value }),
                    Err(status) => item.fail(status),
                },
            }
        }
    }

    fn notifier_chain(&self, graph: &NodeGraph, type_tree: &TypeTree, source: &NodeId) -> Vec<NodeId> {
        let mut chain = vec![source.clone()];
        let mut seen: HashSet<NodeId> = HashSet::from([source.clone()]);
        let mut frontier = vec![source.clone()];
        for _ in 0..MAX_NOTIFIER_DEPTH {
            let mut next = Vec::new();
            for current in &frontier {
                let Some(node) = graph.get(current) else {
                    continue;
                };
                for r in &node.references {
                    if !r.is_inverse || !type_tree.is_subtype_of(&r.reference_type_id, &ids::HAS_EVENT_SOURCE) {
                        continue;
                    }
                    if let Some(parent) = r.target_id.as_local() {
                        if seen.insert(parent.clone()) {
                            chain.push(parent.clone());
                            next.push(parent.clone());
                        }
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        if !seen.contains(&ids::SERVER) {
            chain.push(ids::SERVER);
        }
        chain
    }
}

impl SampleReader for ManagerInner {
    fn read_samples(&self, _ctx: &OperationContext, items: &[ReadValueId]) -> Vec<DataValue> {
        let Some(id) = self.id() else {
            return items.iter().map(|_| DataValue::bad(StatusCode::BadInternalError)).collect();
        };
        let mut batch: Vec<ReadItem> = items
            .iter()
            .map(|rvi| {
                let mut item = ServiceItem::new(rvi.clone());
                item.set_handle(NodeHandle {
                    node_id: rvi.node_id.clone(),
                    manager: id,
                });
                item
            })
            .collect();
        self.read_items(id, &mut batch);
        batch
            .into_iter()
            .map(|mut item| {
                if !item.is_processed() {
                    return DataValue::bad(StatusCode::BadNodeIdUnknown);
                }
                item.take_result().unwrap_or_else(|| DataValue::bad(item.status()))
            })
            .collect()
    }
}

fn fail_claimable<Req, Res>(id: ManagerId, items: &mut [ServiceItem<Req, Res>], status: StatusCode) {
    for item in items.iter_mut().filter(|i| i.is_claimable_by(id)) {
        item.fail(status);
    }
}

/// Registers subtype edges carried by a node or a reference in the type tree.
fn index_reference(type_tree: &TypeTree, node_id: &NodeId, node_class: Option<NodeClass>, reference: &Reference) {
    if reference.reference_type_id != ids::HAS_SUBTYPE {
        return;
    }
    let Some(other) = reference.target_id.as_local() else {
        return;
    };
    let (subtype, supertype) = if reference.is_inverse {
        (node_id.clone(), other.clone())
    } else {
        (other.clone(), node_id.clone())
    };
    if node_class == Some(NodeClass::ReferenceType) || type_tree.is_reference_type(&supertype) {
        type_tree.add_reference_type(subtype, Some(supertype));
    } else {
        type_tree.add_subtype(subtype, supertype);
    }
}

fn index_node(type_tree: &TypeTree, node: &Node) {
    if node.node_class() == NodeClass::ReferenceType {
        type_tree.add_reference_type(node.node_id.clone(), None);
    }
    for reference in &node.references {
        index_reference(type_tree, &node.node_id, Some(node.node_class()), reference);
    }
}

fn record_history(history: &mut HashMap<NodeId, VecDeque<DataValue>>, node_id: &NodeId, value: DataValue, cap: usize) {
    let entries = history.entry(node_id.clone()).or_default();
    let stamp = value.source_timestamp;
    let pos = entries
        .iter()
        .position(|v| v.source_timestamp > stamp)
        .unwrap_or(entries.len());
    entries.insert(pos, value);
    while entries.len() > cap.max(1) {
        entries.pop_front();
    }
}

fn apply_history_update(
    entries: &mut VecDeque<DataValue>,
    details: &HistoryUpdateDetails,
    cap: usize,
) -> Vec<StatusCode> {
    let position = |entries: &VecDeque<DataValue>, value: &DataValue| {
        entries
            .iter()
            .position(|v| v.source_timestamp == value.source_timestamp)
    };
    let results = match details {
        HistoryUpdateDetails::Insert { values, .. }
        | HistoryUpdateDetails::Replace { values, .. }
        | HistoryUpdateDetails::Update { values, .. } => values
            .iter()
            .map(|value| {
                if value.source_timestamp.is_none() {
                    return StatusCode::BadInvalidArgument;
                }
                let existing = position(entries, value);
                match (details, existing) {
                    (HistoryUpdateDetails::Insert { .. }, Some(_)) => StatusCode::BadEntryExists,
                    (HistoryUpdateDetails::Replace { .. }, None) => StatusCode::BadNoEntryExists,
                    (_, Some(pos)) => {
                        entries[pos] = value.clone();
                        StatusCode::Good
                    }
                    (_, None) => {
                        let pos = entries
                            .iter()
                            .position(|v| v.source_timestamp > value.source_timestamp)
                            .unwrap_or(entries.len());
                        entries.insert(pos, value.clone());
                        StatusCode::Good
                    }
                }
            })
            .collect(),
        HistoryUpdateDetails::DeleteRaw {
            start_time, end_time, ..
        } => {
            let before = entries.len();
            entries.retain(|v| {
                v.source_timestamp
                    .map_or(true, |t| t < *start_time || t >= *end_time)
            });
            if entries.len() == before {
                vec![StatusCode::BadNoEntryExists]
            } else {
                vec![StatusCode::Good]
            }
        }
    };
    while entries.len() > cap.max(1) {
        entries.pop_front();
    }
    results
}

fn read_history(entries: Option<&VecDeque<DataValue>>, details: &ReadRawDetails, range: Option<&NumericRange>) -> HistoryData {
    let limit = if details.num_values_per_node == 0 {
        usize::MAX
    } else {
        details.num_values_per_node as usize
    };
    let values = entries
        .into_iter()
        .flatten()
        .filter(|v| {
            let Some(t) = v.source_timestamp else {
                return false;
            };
            details.start_time.map_or(true, |s| t >= s) && details.end_time.map_or(true, |e| t < e)
        })
        .take(limit)
        .map(|v| match range {
            None => v.clone(),
            Some(range) => match v.value.apply_range(range) {
                Ok(ranged) => DataValue { value: ranged, ..v.clone() },
                Err(status) => DataValue { status, value: Variant::Empty, ..v.clone() },
            },
        })
        .collect();
    HistoryData { values }
}

/// Checks a data item filter against its attribute.
fn validate_data_filter(attribute: AttributeId, filter: Option<&MonitoringFilter>) -> Result<(), StatusCode> {
    match filter {
        None => Ok(()),
        Some(MonitoringFilter::Event(_)) => Err(StatusCode::BadFilterNotAllowed),
        Some(MonitoringFilter::Aggregate { .. }) => Err(StatusCode::BadMonitoredItemFilterUnsupported),
        Some(MonitoringFilter::DataChange(f)) => {
            if attribute != AttributeId::Value {
                return Err(StatusCode::BadFilterNotAllowed);
            }
            if f.deadband_type == DeadbandType::Percent {
                return Err(StatusCode::BadMonitoredItemFilterUnsupported);
            }
            if f.deadband_type == DeadbandType::Absolute && !(f.deadband_value >= 0.0) {
                return Err(StatusCode::BadMonitoredItemFilterInvalid);
            }
            Ok(())
        }
    }
}

/// What creating or modifying an item needs to know about its node.
struct NodeFacts {
    minimum_sampling_interval: f64,
    event_notifier: Option<EventNotifier>,
    attribute_status: StatusCode,
}

/// Outcome of revising an item's parameters.
struct Revised {
    settings: MonitoredItemSettings,
    event_filter: Option<(EventFilter, EventFilterResult)>,
    periodic: bool,
}

impl ManagerInner {
    fn node_facts(&self, node_id: &NodeId, attribute: AttributeId, range: Option<&NumericRange>) -> Result<NodeFacts, StatusCode> {
        let state = self.state()?;
        let node = state.graph.get(node_id).ok_or(StatusCode::BadNodeIdUnknown)?;
        let minimum_sampling_interval = node.as_variable().map_or(0.0, |v| v.minimum_sampling_interval);
        let attribute_status = match attribute {
            AttributeId::Value if self.has_value_source(node_id) => StatusCode::Good,
            _ => node.read(attribute, range).status,
        };
        Ok(NodeFacts {
            minimum_sampling_interval,
            event_notifier: node.event_notifier(),
            attribute_status,
        })
    }

    fn revise(
        &self,
        item_to_monitor: &ReadValueId,
        attribute: AttributeId,
        facts: &NodeFacts,
        subscription: &SubscriptionContext,
        mode: MonitoringMode,
        parameters: &MonitoringParameters,
    ) -> Result<Revised, (StatusCode, Option<EventFilterResult>)> {
        let sampling = self.sampling.get().ok_or((StatusCode::BadInternalError, None))?;
        let type_tree = self.type_tree().ok_or((StatusCode::BadInternalError, None))?;
        let queue_size = sampling.revise_queue_size(parameters.queue_size);
        let base = MonitoredItemSettings {
            monitoring_mode: mode,
            client_handle: parameters.client_handle,
            sampling_interval: 0.0,
            queue_size,
            discard_oldest: parameters.discard_oldest,
            filter: parameters.filter.clone(),
        };
        if attribute == AttributeId::EventNotifier {
            if !facts
                .event_notifier
                .is_some_and(|n| n.contains(EventNotifier::SUBSCRIBE_TO_EVENTS))
            {
                return Err((StatusCode::BadAttributeIdInvalid, None));
            }
            let (filter, result) = validate_event_item(item_to_monitor, parameters.filter.as_ref(), type_tree)
                .map_err(|r| (r.status, r.result))?;
            return Ok(Revised {
                settings: base,
                event_filter: Some((filter, result)),
                periodic: false,
            });
        }
        if facts.attribute_status == StatusCode::BadAttributeIdInvalid
            || facts.attribute_status == StatusCode::BadIndexRangeInvalid
        {
            return Err((facts.attribute_status, None));
        }
        validate_data_filter(attribute, parameters.filter.as_ref()).map_err(|s| (s, None))?;
        let exception = attribute != AttributeId::Value && parameters.sampling_interval == 0.0;
        let sampling_interval = if exception {
            0.0
        } else {
            sampling.revise_sampling_interval(
                parameters.sampling_interval,
                subscription.publishing_interval,
                facts.minimum_sampling_interval,
            )
        };
        Ok(Revised {
            settings: MonitoredItemSettings {
                sampling_interval,
                ..base
            },
            event_filter: None,
            periodic: !exception,
        })
    }

    fn create_items(&self, id: ManagerId, ctx: &OperationContext, subscription: &SubscriptionContext, items: &mut [CreateMonitoredItem]) {
        let (Some(context), Some(sampling), Some(events)) = (self.context.get(), self.sampling.get(), self.events.get()) else {
            return fail_claimable(id, items, StatusCode::BadInternalError);
        };
        let mut exception_reads: Vec<Arc<MonitoredItem>> = Vec::new();
        for item in items.iter_mut().filter(|i| i.is_claimable_by(id)) {
            let request = item.request().clone();
            let rvi = &request.item_to_monitor;
            let Some(attribute) = rvi.resolved_attribute() else {
                item.fail(StatusCode::BadAttributeIdInvalid);
                continue;
            };
            let range = match NumericRange::parse_optional(rvi.index_range.as_deref()) {
                Ok(r) => r,
                Err(status) => {
                    item.fail(status);
                    continue;
                }
            };
            let facts = match self.node_facts(&rvi.node_id, attribute, range.as_ref()) {
                Ok(f) => f,
                Err(status) => {
                    item.fail(status);
                    continue;
                }
            };
            let revised = match self.revise(rvi, attribute, &facts, subscription, request.monitoring_mode, &request.parameters) {
                Ok(r) => r,
                Err((status, Some(filter_result))) => {
                    item.complete_with_status(
                        status,
                        MonitoredItemCreateResult {
                            monitored_item_id: 0,
                            revised_sampling_interval: 0.0,
                            revised_queue_size: 0,
                            filter_result: Some(filter_result),
                            item: None,
                        },
                    );
                    continue;
                }
                Err((status, None)) => {
                    item.fail(status);
                    continue;
                }
            };
            let monitored_item_id = context.monitored_item_ids.fetch_add(1, Ordering::Relaxed);
            let revised_sampling_interval = revised.settings.sampling_interval;
            let revised_queue_size = revised.settings.queue_size;
            let monitored = Arc::new(MonitoredItem::new(
                monitored_item_id,
                subscription.subscription_id,
                ctx.session().id(),
                id,
                rvi.clone(),
                attribute,
                range,
                revised.settings,
            ));
            match self.state() {
                Ok(mut state) => {
                    state.items.insert(monitored_item_id, Arc::clone(&monitored));
                    if !revised.periodic && revised.event_filter.is_none() {
                        state
                            .exception_items
                            .entry(rvi.node_id.clone())
                            .or_default()
                            .push(Arc::clone(&monitored));
                    }
                }
                Err(status) => {
                    item.fail(status);
                    continue;
                }
            }
            let filter_result = match revised.event_filter {
                Some((filter, result)) => {
                    events.add_item(Arc::clone(&monitored), filter);
                    Some(result)
                }
                None if revised.periodic => {
                    sampling.start_monitoring(Arc::clone(&monitored), subscription.diagnostics_mask);
                    None
                }
                None => {
                    exception_reads.push(Arc::clone(&monitored));
                    None
                }
            };
            debug!(
                manager = %self.name,
                item_id = monitored_item_id,
                node_id = %rvi.node_id,
                interval_ms = revised_sampling_interval,
                "created monitored item"
            );
            item.complete(MonitoredItemCreateResult {
                monitored_item_id,
                revised_sampling_interval,
                revised_queue_size,
                filter_result,
                item: Some(monitored),
            });
        }
        sampling.apply_changes();
        self.report_exception_values(&exception_reads);
    }

    /// Reads exception-based items once and queues the values.
    fn report_exception_values(&self, items: &[Arc<MonitoredItem>]) {
        if items.is_empty() {
            return;
        }
        let requests: Vec<ReadValueId> = items.iter().map(|i| i.item_to_monitor().clone()).collect();
        let values = self.read_samples(&OperationContext::system(), &requests);
        for (item, value) in items.iter().zip(values) {
            item.queue_value(value, None);
        }
    }

    fn modify_items(&self, id: ManagerId, subscription: &SubscriptionContext, items: &mut [ModifyMonitoredItem]) {
        let (Some(sampling), Some(events)) = (self.sampling.get(), self.events.get()) else {
            return fail_claimable(id, items, StatusCode::BadInternalError);
        };
        let mut exception_reads: Vec<Arc<MonitoredItem>> = Vec::new();
        for item in items.iter_mut().filter(|i| i.is_claimable_by(id)) {
            let monitored = Arc::clone(&item.request().item);
            let parameters = item.request().parameters.clone();
            let known = self
                .state()
                .map(|s| s.items.contains_key(&monitored.id()))
                .unwrap_or(false);
            if !known {
                item.fail(StatusCode::BadMonitoredItemIdInvalid);
                continue;
            }
            let attribute = monitored.attribute();
            let facts = match self.node_facts(monitored.node_id(), attribute, monitored.index_range()) {
                Ok(f) => f,
                Err(status) => {
                    item.fail(status);
                    continue;
                }
            };
            let revised = match self.revise(
                monitored.item_to_monitor(),
                attribute,
                &facts,
                subscription,
                monitored.monitoring_mode(),
                &parameters,
            ) {
                Ok(r) => r,
                Err((status, _)) => {
                    item.fail(status);
                    continue;
                }
            };
            let revised_sampling_interval = revised.settings.sampling_interval;
            let revised_queue_size = revised.settings.queue_size;
            monitored.modify(revised.settings);
            let filter_result = match revised.event_filter {
                Some((filter, result)) => {
                    events.modify_item(monitored.id(), filter);
                    Some(result)
                }
                None => {
                    let was_exception = match self.set_exception_item(&monitored, !revised.periodic) {
                        Ok(was) => was,
                        Err(status) => {
                            item.fail(status);
                            continue;
                        }
                    };
                    match (was_exception, revised.periodic) {
                        (false, true) => {
                            sampling.modify_monitoring(Arc::clone(&monitored), subscription.diagnostics_mask);
                        }
                        (true, true) => {
                            sampling.start_monitoring(Arc::clone(&monitored), subscription.diagnostics_mask);
                        }
                        (false, false) => {
                            sampling.stop_monitoring(monitored.id());
                            exception_reads.push(Arc::clone(&monitored));
                        }
                        (true, false) => {}
                    }
                    None
                }
            };
            item.complete(MonitoredItemModifyResult {
                revised_sampling_interval,
                revised_queue_size,
                filter_result,
            });
        }
        sampling.apply_changes();
        self.report_exception_values(&exception_reads);
    }

    /// Adds the item to, or removes it from, the exception-reported items of
    /// its node. Returns whether it was exception-reported before.
    fn set_exception_item(&self, monitored: &Arc<MonitoredItem>, exception: bool) -> Result<bool, StatusCode> {
        let mut state = self.state()?;
        let node_id = monitored.node_id().clone();
        let list = state.exception_items.entry(node_id.clone()).or_default();
        let was = list.iter().any(|i| i.id() == monitored.id());
        if exception && !was {
            list.push(Arc::clone(monitored));
        } else if !exception {
            list.retain(|i| i.id() != monitored.id());
            if list.is_empty() {
                state.exception_items.remove(&node_id);
            }
        }
        Ok(was)
    }

    fn delete_items(&self, id: ManagerId, items: &mut [ExistingMonitoredItem]) {
        let mut removed: Vec<u32> = Vec::new();
        {
            let mut state = match self.state() {
                Ok(s) => s,
                Err(status) => return fail_claimable(id, items, status),
            };
            for item in items.iter_mut().filter(|i| i.is_claimable_by(id)) {
                let item_id = item.request().id();
                let Some(monitored) = state.items.remove(&item_id) else {
                    item.fail(StatusCode::BadMonitoredItemIdInvalid);
                    continue;
                };
                if let Some(list) = state.exception_items.get_mut(monitored.node_id()) {
                    list.retain(|i| i.id() != item_id);
                }
                removed.push(item_id);
                item.complete(());
            }
            state.exception_items.retain(|_, list| !list.is_empty());
        }
        if let Some(sampling) = self.sampling.get() {
            for item_id in &removed {
                sampling.stop_monitoring(*item_id);
            }
            sampling.apply_changes();
        }
        if let Some(events) = self.events.get() {
            for item_id in &removed {
                events.remove_item(*item_id);
            }
        }
    }

    /// Claims items that this manager still knows; fails the others.
    fn known_items<'a>(
        &self,
        id: ManagerId,
        items: &'a mut [ExistingMonitoredItem],
    ) -> Vec<&'a mut ExistingMonitoredItem> {
        let known: HashSet<u32> = match self.state() {
            Ok(state) => state.items.keys().copied().collect(),
            Err(status) => {
                fail_claimable(id, items, status);
                return Vec::new();
            }
        };
        let mut out = Vec::new();
        for item in items.iter_mut().filter(|i| i.is_claimable_by(id)) {
            if known.contains(&item.request().id()) {
                out.push(item);
            } else {
                item.fail(StatusCode::BadMonitoredItemIdInvalid);
            }
        }
        out
    }
}

impl NodeManager for InMemoryNodeManager {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn namespace_uris(&self) -> Vec<String> {
        self.inner.namespace_uris.clone()
    }

    fn attach(&self, context: ManagerContext) {
        let reader: Weak<dyn SampleReader> = Arc::downgrade(&self.inner) as Weak<dyn SampleReader>;
        let sampling = SamplingGroupManager::new(&context.config, reader);
        let events = EventManager::new(Arc::clone(&context.type_tree));
        let id = context.id;
        let node_ids = Arc::clone(&context.node_ids);
        if self.inner.context.set(context).is_err() {
            warn!(manager = %self.inner.name, "manager attached twice; keeping first registration");
            return;
        }
        if self.inner.sampling.set(sampling).is_err() {
            warn!(manager = %self.inner.name, "sampling already attached; keeping the existing groups");
        }
        if self.inner.events.set(events).is_err() {
            warn!(manager = %self.inner.name, "event manager already attached; keeping the existing items");
        }
        if let Ok(mut state) = self.inner.state() {
            state.graph.use_shared_ids(node_ids);
        }
        debug!(manager = %self.inner.name, id = %id, "manager attached");
    }

    fn get_manager_handle(&self, node_id: &NodeId) -> Option<NodeHandle> {
        let id = self.inner.id()?;
        let state = self.inner.state().ok()?;
        state.graph.contains(node_id).then(|| NodeHandle {
            node_id: node_id.clone(),
            manager: id,
        })
    }

    fn node_metadata(&self, _ctx: &OperationContext, node_ids: &[NodeId]) -> Vec<Option<NodeMetadata>> {
        let Ok(state) = self.inner.state() else {
            return vec![None; node_ids.len()];
        };
        node_ids
            .iter()
            .map(|id| state.graph.get(id).map(NodeMetadata::of))
            .collect()
    }

    fn create_address_space(&self) -> Result<Vec<ExternalReference>, StatusCode> {
        let build = self.inner.builder.lock().map_err(|_| lock_err("builder"))?.take();
        let Some(build) = build else {
            return Ok(Vec::new());
        };
        let type_tree = self.inner.type_tree().ok_or(StatusCode::BadInternalError)?;
        let nodes = build(&self.namespace_indices());
        let count = nodes.len();
        let mut external = Vec::new();
        let mut state = self.inner.state()?;
        for node in nodes {
            index_node(type_tree, &node);
            external.extend(state.graph.attach_node(node, type_tree)?);
        }
        drop(state);
        debug!(manager = %self.inner.name, nodes = count, external = external.len(), "address space created");
        Ok(external)
    }

    fn delete_address_space(&self) {
        if let Some(sampling) = self.inner.sampling.get() {
            sampling.shutdown();
        }
        if let Some(events) = self.inner.events.get() {
            let dropped = events.clear();
            debug!(manager = %self.inner.name, items = dropped, "event items dropped");
        }
        let Ok(mut state) = self.inner.state() else {
            return;
        };
        let removed = state.graph.len();
        *state = ManagerState::default();
        drop(state);
        debug!(manager = %self.inner.name, nodes = removed, "address space deleted");
    }

    fn add_references(&self, references: &[ExternalReference]) -> usize {
        let type_tree = self.inner.type_tree().cloned();
        let Ok(mut state) = self.inner.state() else {
            return 0;
        };
        let mut added = 0;
        for external in references {
            if state.graph.add_external_reference(external) {
                added += 1;
                if let Some(tree) = &type_tree {
                    let class = state.graph.get(&external.node_id).map(Node::node_class);
                    index_reference(tree, &external.node_id, class, &external.reference);
                }
            }
        }
        added
    }

    fn delete_references(&self, references: &[ExternalReference]) -> usize {
        let Ok(mut state) = self.inner.state() else {
            return 0;
        };
        references
            .iter()
            .filter(|r| state.graph.remove_external_reference(r))
            .count()
    }

    fn browse(&self, _ctx: &OperationContext, items: &mut [NodeBrowseItem]) {
        let Some(id) = self.inner.id() else {
            return;
        };
        let Some(type_tree) = self.inner.type_tree() else {
            return fail_claimable(id, items, StatusCode::BadInternalError);
        };
        let state = match self.inner.state() {
            Ok(s) => s,
            Err(status) => return fail_claimable(id, items, status),
        };
        for item in items.iter_mut().filter(|i| i.is_claimable_by(id)) {
            match state.graph.browse(item.request(), type_tree) {
                Ok(references) => item.complete(references),
                Err(err) => item.fail(err.into()),
            }
        }
    }

    fn translate_hop(
        &self,
        _ctx: &OperationContext,
        source: &NodeId,
        element: &RelativePathElement,
    ) -> Result<HopTargets, StatusCode> {
        let type_tree = self.inner.type_tree().ok_or(StatusCode::BadInternalError)?;
        let state = self.inner.state()?;
        state
            .graph
            .find_targets(source, element, type_tree)
            .map_err(StatusCode::from)
    }

    fn read(&self, _ctx: &OperationContext, _timestamps: TimestampsToReturn, items: &mut [ReadItem]) {
        if let Some(id) = self.inner.id() {
            self.inner.read_items(id, items);
        }
    }

    fn write(&self, _ctx: &OperationContext, items: &mut [WriteItem]) {
        let Some(id) = self.inner.id() else {
            return;
        };
        let max_history = self.inner.max_history();
        let mut changed: Vec<(Arc<MonitoredItem>, DataValue)> = Vec::new();
        {
            let mut state = match self.inner.state() {
                Ok(s) => s,
                Err(status) => return fail_claimable(id, items, status),
            };
            let state = &mut *state;
            for item in items.iter_mut().filter(|i| i.is_claimable_by(id)) {
                let request = item.request();
                let Some(attribute) = AttributeId::from_u32(request.attribute_id) else {
                    item.fail(StatusCode::BadAttributeIdInvalid);
                    continue;
                };
                let range = match NumericRange::parse_optional(request.index_range.as_deref()) {
                    Ok(r) => r,
                    Err(status) => {
                        item.fail(status);
                        continue;
                    }
                };
                if attribute == AttributeId::Value && self.inner.has_value_source(&request.node_id) {
                    item.fail(StatusCode::BadWriteNotSupported);
                    continue;
                }
                let node_id = request.node_id.clone();
                let value = request.value.clone();
                let Some(node) = state.graph.get_mut(&node_id) else {
                    item.fail(StatusCode::BadNodeIdUnknown);
                    continue;
                };
                if let Err(status) = node.write(attribute, &value, range.as_ref()) {
                    item.fail(status);
                    continue;
                }
                if attribute == AttributeId::Value {
                    if let Some(v) = node.as_variable().filter(|v| v.historizing) {
                        let recorded = v.value.clone();
                        record_history(&mut state.history, &node_id, recorded, max_history);
                    }
                } else if let Some(watchers) = state.exception_items.get(&node_id) {
                    for watcher in watchers.iter().filter(|w| w.attribute() == attribute) {
                        changed.push((Arc::clone(watcher), node.read(attribute, watcher.index_range())));
                    }
                }
                item.complete(());
            }
        }
        for (watcher, value) in changed {
            watcher.queue_value(value, None);
        }
    }

    fn call(&self, ctx: &OperationContext, items: &mut [CallItem]) {
        let Some(id) = self.inner.id() else {
            return;
        };
        let mut calls: Vec<(usize, Arc<MethodHandler>)> = Vec::new();
        {
            let state = match self.inner.state() {
                Ok(s) => s,
                Err(status) => return fail_claimable(id, items, status),
            };
            for (index, item) in items.iter_mut().enumerate() {
                if !item.is_claimable_by(id) {
                    continue;
                }
                let request = item.request();
                let Some(object) = state.graph.get(&request.object_id) else {
                    item.fail(StatusCode::BadNodeIdUnknown);
                    continue;
                };
                let method_target = ExpandedNodeId::local(request.method_id.clone());
                if !object
                    .references
                    .iter()
                    .any(|r| !r.is_inverse && r.target_id == method_target)
                {
                    item.fail(StatusCode::BadMethodInvalid);
                    continue;
                }
                if let Some(method) = state.graph.get(&request.method_id) {
                    match &method.attributes {
                        NodeAttributes::Method { executable, .. } if !*executable => {
                            item.fail(StatusCode::BadNotExecutable);
                            continue;
                        }
                        NodeAttributes::Method { .. } => {}
                        _ => {
                            item.fail(StatusCode::BadMethodInvalid);
                            continue;
                        }
                    }
                }
                match self.inner.method(&request.method_id) {
                    Some(handler) => calls.push((index, handler)),
                    None => item.fail(StatusCode::BadMethodInvalid),
                }
            }
        }
        for (index, handler) in calls {
            let item = &mut items[index];
            let request = item.request();
            let inputs = request.input_arguments.len();
            match handler(ctx, &request.object_id, &request.input_arguments) {
                Ok(output_arguments) => item.complete(CallMethodResult {
                    input_argument_results: vec![StatusCode::Good; inputs],
                    output_arguments,
                }),
                Err(status) => item.fail(status),
            }
        }
    }

    fn history_read(&self, _ctx: &OperationContext, details: &ReadRawDetails, items: &mut [HistoryReadItem]) {
        let Some(id) = self.inner.id() else {
            return;
        };
        let state = match self.inner.state() {
            Ok(s) => s,
            Err(status) => return fail_claimable(id, items, status),
        };
        for item in items.iter_mut().filter(|i| i.is_claimable_by(id)) {
            let request = item.request();
            let range = match NumericRange::parse_optional(request.index_range.as_deref()) {
                Ok(r) => r,
                Err(status) => {
                    item.fail(status);
                    continue;
                }
            };
            let Some(node) = state.graph.get(&request.node_id) else {
                item.fail(StatusCode::BadNodeIdUnknown);
                continue;
            };
            let Some(variable) = node.as_variable() else {
                item.fail(StatusCode::BadHistoryOperationUnsupported);
                continue;
            };
            let entries = state.history.get(&request.node_id);
            if !variable.historizing && entries.is_none() {
                item.fail(StatusCode::BadHistoryOperationUnsupported);
                continue;
            }
            let data = read_history(entries, details, range.as_ref());
            if data.values.is_empty() {
                item.complete_with_status(StatusCode::GoodNoData, data);
            } else {
                item.complete(data);
            }
        }
    }

    fn history_update(&self, _ctx: &OperationContext, items: &mut [HistoryUpdateItem]) {
        let Some(id) = self.inner.id() else {
            return;
        };
        let cap = self.inner.max_history();
        let mut state = match self.inner.state() {
            Ok(s) => s,
            Err(status) => return fail_claimable(id, items, status),
        };
        let state = &mut *state;
        for item in items.iter_mut().filter(|i| i.is_claimable_by(id)) {
            let details = item.request().clone();
            let node_id = details.node_id();
            let historizing = match state.graph.get(node_id).map(Node::as_variable) {
                None => {
                    item.fail(StatusCode::BadNodeIdUnknown);
                    continue;
                }
                Some(None) => {
                    item.fail(StatusCode::BadHistoryOperationUnsupported);
                    continue;
                }
                Some(Some(v)) => v.historizing,
            };
            if !historizing {
                item.fail(StatusCode::BadHistoryOperationUnsupported);
                continue;
            }
            let entries = state.history.entry(node_id.clone()).or_default();
            let operation_results = apply_history_update(entries, &details, cap);
            item.complete(HistoryUpdateResult { operation_results });
        }
    }

    fn create_monitored_items(
        &self,
        ctx: &OperationContext,
        subscription: &SubscriptionContext,
        items: &mut [CreateMonitoredItem],
    ) {
        if let Some(id) = self.inner.id() {
            self.inner.create_items(id, ctx, subscription, items);
        }
    }

    fn modify_monitored_items(
        &self,
        _ctx: &OperationContext,
        subscription: &SubscriptionContext,
        items: &mut [ModifyMonitoredItem],
    ) {
        if let Some(id) = self.inner.id() {
            self.inner.modify_items(id, subscription, items);
        }
    }

    fn delete_monitored_items(&self, _ctx: &OperationContext, items: &mut [ExistingMonitoredItem]) {
        if let Some(id) = self.inner.id() {
            self.inner.delete_items(id, items);
        }
    }

    fn set_monitoring_mode(&self, _ctx: &OperationContext, mode: MonitoringMode, items: &mut [ExistingMonitoredItem]) {
        let Some(id) = self.inner.id() else {
            return;
        };
        let mut enabled = Vec::new();
        for item in self.inner.known_items(id, items) {
            let monitored = item.request();
            let previous = monitored.set_monitoring_mode(mode);
            if previous == MonitoringMode::Disabled && mode != MonitoringMode::Disabled {
                enabled.push(Arc::clone(monitored));
            }
            item.complete(());
        }
        if enabled.is_empty() {
            return;
        }
        let exception: Vec<Arc<MonitoredItem>> = match self.inner.state() {
            Ok(state) => enabled
                .into_iter()
                .filter(|m| {
                    state
                        .exception_items
                        .get(m.node_id())
                        .is_some_and(|list| list.iter().any(|i| i.id() == m.id()))
                })
                .collect(),
            Err(_) => return,
        };
        self.inner.report_exception_values(&exception);
    }

    fn transfer_monitored_items(
        &self,
        _ctx: &OperationContext,
        session_id: SessionId,
        subscription_id: u32,
        items: &mut [ExistingMonitoredItem],
    ) {
        let Some(id) = self.inner.id() else {
            return;
        };
        let mut moved = Vec::new();
        for item in self.inner.known_items(id, items) {
            let monitored = Arc::clone(item.request());
            monitored.transfer(session_id, subscription_id);
            if !monitored.is_event_item() && monitored.sampling_interval() > 0.0 {
                moved.push(monitored);
            }
            item.complete(());
        }
        if let Some(sampling) = self.inner.sampling.get() {
            for monitored in moved {
                sampling.reassign(monitored);
            }
            sampling.apply_changes();
        }
    }

    fn subscribe_to_all_events(&self, item: &Arc<MonitoredItem>) -> bool {
        let Some(events) = self.inner.events.get() else {
            return false;
        };
        let filter = match item.filter() {
            Some(MonitoringFilter::Event(f)) => f,
            _ => EventFilter::default(),
        };
        events.add_item(Arc::clone(item), filter);
        events.subscribe_all(item.id())
    }

    fn unsubscribe_from_all_events(&self, item_id: u32) {
        if let Some(events) = self.inner.events.get() {
            events.remove_item(item_id);
        }
    }

    fn report_event(&self, event: &EventRecord) -> usize {
        let (Some(events), Some(type_tree)) = (self.inner.events.get(), self.inner.type_tree()) else {
            return 0;
        };
        let chain = match self.inner.state() {
            Ok(state) => self.inner.notifier_chain(&state.graph, type_tree, &event.source_node),
            Err(_) => return 0,
        };
        events.report_event(event, &chain)
    }

    fn add_node(&self, _ctx: &OperationContext, node: Node) -> Result<Vec<ExternalReference>, StatusCode> {
        let type_tree = self.inner.type_tree().ok_or(StatusCode::BadInternalError)?;
        if !self.namespace_indices().contains(&node.node_id.namespace) {
            return Err(StatusCode::BadNodeIdInvalid);
        }
        let mut state = self.inner.state()?;
        index_node(type_tree, &node);
        let node_id = node.node_id.clone();
        let external = state.graph.attach_node(node, type_tree)?;
        drop(state);
        debug!(manager = %self.inner.name, node_id = %node_id, external = external.len(), "added node");
        Ok(external)
    }

    fn delete_node(&self, _ctx: &OperationContext, node_id: &NodeId, delete_children: bool) -> Result<Vec<NodeId>, StatusCode> {
        let context = self.inner.context.get().ok_or(StatusCode::BadInternalError)?;
        let outcome = {
            let mut state = self.inner.state()?;
            let outcome = state.graph.delete_node(node_id, delete_children, &context.type_tree)?;
            for deleted in &outcome.deleted {
                context.type_tree.remove(deleted);
                state.history.remove(deleted);
            }
            outcome
        };
        if !outcome.dangling.is_empty() {
            context.cleanup.schedule(node_id.clone(), outcome.dangling);
        }
        Ok(outcome.deleted)
    }

    fn add_reference(
        &self,
        _ctx: &OperationContext,
        source: &NodeId,
        reference: Reference,
        bidirectional: bool,
    ) -> Result<Option<ExternalReference>, StatusCode> {
        let type_tree = self.inner.type_tree().ok_or(StatusCode::BadInternalError)?;
        let mut state = self.inner.state()?;
        let class = state.graph.get(source).map(Node::node_class);
        index_reference(type_tree, source, class, &reference);
        let bidirectional = bidirectional && !type_tree.is_one_way(&reference.reference_type_id);
        Ok(state.graph.add_reference(source, reference, bidirectional)?)
    }

    fn delete_reference(
        &self,
        _ctx: &OperationContext,
        source: &NodeId,
        reference: &Reference,
        delete_bidirectional: bool,
    ) -> Result<Option<ExternalReference>, StatusCode> {
        let type_tree = self.inner.type_tree().ok_or(StatusCode::BadInternalError)?;
        let delete_bidirectional = delete_bidirectional && !type_tree.is_one_way(&reference.reference_type_id);
        let mut state = self.inner.state()?;
        Ok(state.graph.delete_reference(source, reference, delete_bidirectional)?)
    }

    fn instantiate(
        &self,
        _ctx: &OperationContext,
        instance: &NodeId,
        type_definition: &NodeId,
        template: Option<&InstanceTemplate>,
    ) -> Result<ModellingOutcome, StatusCode> {
        let type_tree = self.inner.type_tree().ok_or(StatusCode::BadInternalError)?;
        let mut state = self.inner.state()?;
        Ok(apply_modelling_rules(&mut state.graph, type_tree, instance, type_definition, template)?)
    }
}
