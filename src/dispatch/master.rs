//! The master node manager: validates batched requests, resolves owners,
//! checks permissions and fans each batch out to every registered manager.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::address_space::{InstanceTemplate, TypeTree};
use crate::browse::{BrowsePathTarget, BrowseResult, ReferenceDescription};
use crate::config::ServerConfig;
use crate::continuation::{BrowseCursor, ContinuationPoint, ContinuationPointId};
use crate::error::{ConfigError, ServiceError, ServiceResult};
use crate::manager::{
    core_address_space, diagnostics_address_space, diagnostics_counter_id, ExternalReference, InMemoryNodeManager,
    ManagerContext, ManagerId, MetadataCache, NamespaceTable, NodeHandle, NodeManager, NodeMetadata,
    CORE_NAMESPACE_URI, DIAGNOSTIC_COUNTERS,
};
use crate::node::{AttributeId, Node, Reference};
use crate::node_id::{ids, ExpandedNodeId, NodeId};
use crate::security::{OperationType, PermissionValidator};
use crate::service::{
    finalize_read_results, BrowseItem, BrowseNextItem, CallItem, CreateMonitoredItem, ExistingMonitoredItem,
    HistoryReadItem, HistoryUpdateDetails, HistoryUpdateItem, ModifyMonitoredItem, NodeBrowseItem, ReadItem,
    ReadRawDetails, ServiceItem, SubscriptionContext, TranslateItem, WriteItem,
};
use crate::session::{OperationContext, SessionBuilder, SessionId};
use crate::status::StatusCode;
use crate::subscription::{EventRecord, MonitoredItem, MonitoringMode};
use crate::value::{DataValue, NumericRange, TimestampsToReturn, Variant};

use super::cleanup::{CleanupSender, CleanupWorker};
use super::registry::Registry;

/// Counters kept by the dispatcher and published under `ServerDiagnostics`.
#[derive(Debug, Default)]
pub struct DispatchStats {
    service_calls: AtomicU64,
    items_processed: AtomicU64,
    items_failed: AtomicU64,
    references_cleaned: Arc<AtomicU64>,
    monitored_items_created: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSnapshot {
    pub service_calls: u64,
    pub items_processed: u64,
    pub items_failed: u64,
    pub references_cleaned: u64,
    pub monitored_items_created: u64,
}

impl DispatchStats {
    /// Current values.
    #[must_use]
    pub fn snapshot(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            service_calls: self.service_calls.load(Ordering::Relaxed),
            items_processed: self.items_processed.load(Ordering::Relaxed),
            items_failed: self.items_failed.load(Ordering::Relaxed),
            references_cleaned: self.references_cleaned.load(Ordering::Relaxed),
            monitored_items_created: self.monitored_items_created.load(Ordering::Relaxed),
        }
    }

    /// Value of a named diagnostics counter.
    #[must_use]
    pub fn counter(&self, name: &str) -> Option<u64> {
        let s = self.snapshot();
        match name {
            "ServiceCalls" => Some(s.service_calls),
            "ItemsProcessed" => Some(s.items_processed),
            "ItemsFailed" => Some(s.items_failed),
            "ReferencesCleaned" => Some(s.references_cleaned),
            "MonitoredItemsCreated" => Some(s.monitored_items_created),
            _ => None,
        }
    }
}

/// Owners and metadata looked up during one service call.
#[derive(Default)]
struct Lookup {
    handles: HashMap<NodeId, Option<NodeHandle>>,
    metadata: MetadataCache,
}

impl Lookup {
    fn handle(&self, node_id: &NodeId) -> Option<&NodeHandle> {
        self.handles.get(node_id).and_then(Option::as_ref)
    }

    fn metadata(&self, node_id: &NodeId) -> Option<&NodeMetadata> {
        self.metadata.get(node_id).and_then(Option::as_ref)
    }
}

/// What an item addresses and which permission it needs.
struct Target {
    node_id: NodeId,
    operation: OperationType,
    also: Option<OperationType>,
    /// A second node checked instead of `node_id`, with the status used when
    /// it does not exist.
    permission_node: Option<(NodeId, StatusCode)>,
}

impl Target {
    fn new(node_id: NodeId, operation: OperationType) -> Self {
        Self {
            node_id,
            operation,
            also: None,
            permission_node: None,
        }
    }
}

/// The dispatcher in front of every node manager.
pub struct MasterNodeManager {
    config: Arc<ServerConfig>,
    registry: Arc<Registry>,
    type_tree: Arc<TypeTree>,
    permissions: PermissionValidator,
    monitored_item_ids: Arc<AtomicU32>,
    node_ids: Arc<AtomicU32>,
    cleanup: CleanupWorker,
    stats: Arc<DispatchStats>,
    started: AtomicBool,
    // Server event items registered as "all events" subscribers elsewhere.
    event_routes: Mutex<HashMap<u32, Vec<ManagerId>>>,
}

impl std::fmt::Debug for MasterNodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterNodeManager")
            .field("managers", &self.registry.len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl MasterNodeManager {
    /// Position of the namespace 0 manager.
    pub const CORE: ManagerId = ManagerId(0);
    /// Position of the server namespace manager.
    pub const DIAGNOSTICS: ManagerId = ManagerId(1);

    /// Creates the dispatcher and registers `managers` in order. The first
    /// must serve the standard namespace and the second the server
    /// namespace.
    pub fn new(config: ServerConfig, managers: Vec<Arc<dyn NodeManager>>) -> ServiceResult<Self> {
        let config = Arc::new(config.validate()?);
        let serves = |index: usize, uri: &str| {
            managers
                .get(index)
                .is_some_and(|m| m.namespace_uris().iter().any(|u| u == uri))
        };
        if !serves(0, CORE_NAMESPACE_URI) {
            return Err(ConfigError::MissingManager {
                reason: format!("manager 0 must serve {CORE_NAMESPACE_URI}"),
            }
            .into());
        }
        if !serves(1, &config.server_uri) {
            return Err(ConfigError::MissingManager {
                reason: format!("manager 1 must serve {}", config.server_uri),
            }
            .into());
        }

        let namespaces = Arc::new(NamespaceTable::new(&config.server_uri));
        let registry = Arc::new(Registry::new(namespaces));
        let stats = Arc::new(DispatchStats::default());
        let cleanup = CleanupWorker::start(
            config.cleanup_queue_capacity,
            Arc::downgrade(&registry),
            Arc::clone(&stats.references_cleaned),
        )?;
        let master = Self {
            config,
            registry,
            type_tree: Arc::new(TypeTree::new()),
            permissions: PermissionValidator::new(),
            monitored_item_ids: Arc::new(AtomicU32::new(1)),
            node_ids: Arc::new(AtomicU32::new(1_000_000)),
            cleanup,
            stats,
            started: AtomicBool::new(false),
            event_routes: Mutex::new(HashMap::new()),
        };
        for manager in managers {
            master.register_manager(manager)?;
        }
        Ok(master)
    }

    /// A dispatcher with the built-in core and diagnostics managers.
    pub fn with_defaults(config: ServerConfig) -> ServiceResult<Self> {
        let core = Arc::new(
            InMemoryNodeManager::new("core", vec![CORE_NAMESPACE_URI.to_string()])
                .with_address_space(|_| core_address_space()),
        );
        let diagnostics = Arc::new(
            InMemoryNodeManager::new("diagnostics", vec![config.server_uri.clone()])
                .with_address_space(diagnostics_address_space),
        );
        let master = Self::new(config, vec![core, Arc::clone(&diagnostics) as Arc<dyn NodeManager>])?;
        master.install_diagnostics(&diagnostics);
        Ok(master)
    }

    fn install_diagnostics(&self, diagnostics: &InMemoryNodeManager) {
        let Some(ns) = diagnostics.namespace_indices().first().copied() else {
            return;
        };
        for counter in DIAGNOSTIC_COUNTERS {
            let stats = Arc::clone(&self.stats);
            diagnostics.register_value_source(diagnostics_counter_id(ns, counter), move || {
                let value = stats.counter(counter).unwrap_or(0);
                DataValue::new(Variant::Int64(i64::try_from(value).unwrap_or(i64::MAX)))
            });
        }
    }

    /// Registers a manager, assigns its namespaces and attaches its context.
    /// After startup the manager's address space is built immediately.
    pub fn register_manager(&self, manager: Arc<dyn NodeManager>) -> ServiceResult<ManagerId> {
        let (id, namespace_indices) = self.registry.register(Arc::clone(&manager))?;
        manager.attach(ManagerContext {
            id,
            namespace_indices: namespace_indices.clone(),
            namespaces: Arc::clone(&self.registry.namespaces),
            type_tree: Arc::clone(&self.type_tree),
            monitored_item_ids: Arc::clone(&self.monitored_item_ids),
            node_ids: Arc::clone(&self.node_ids),
            cleanup: self.cleanup_sender(),
            config: Arc::clone(&self.config),
        });
        info!(manager = manager.name(), id = %id, namespaces = ?namespace_indices, "registered node manager");
        if self.started.load(Ordering::Acquire) {
            let external = self.build_address_space(id, manager.as_ref())?;
            self.route_references(external, true);
        }
        Ok(id)
    }

    /// Registers a namespace URI without a manager; returns its index.
    pub fn register_namespace(&self, uri: &str) -> Result<u16, StatusCode> {
        self.registry.namespaces.register(uri)
    }

    #[must_use]
    pub fn namespace_index(&self, uri: &str) -> Option<u16> {
        self.registry.namespaces.index_of(uri)
    }

    #[must_use]
    pub fn namespaces(&self) -> &Arc<NamespaceTable> {
        &self.registry.namespaces
    }

    #[must_use]
    pub fn type_tree(&self) -> &Arc<TypeTree> {
        &self.type_tree
    }

    #[must_use]
    pub const fn permissions(&self) -> &PermissionValidator {
        &self.permissions
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// A registered manager.
    #[must_use]
    pub fn manager(&self, id: ManagerId) -> Option<Arc<dyn NodeManager>> {
        self.registry.manager(id)
    }

    #[must_use]
    pub fn manager_count(&self) -> usize {
        self.registry.len()
    }

    /// Owner of a node, if any manager claims it.
    #[must_use]
    pub fn resolve(&self, node_id: &NodeId) -> Option<NodeHandle> {
        self.registry.resolve(node_id)
    }

    #[must_use]
    pub fn stats(&self) -> DispatchSnapshot {
        self.stats.snapshot()
    }

    /// A session builder preset with the server's continuation point budget.
    #[must_use]
    pub fn session_builder(&self) -> SessionBuilder {
        crate::session::Session::builder().max_continuation_points(self.config.max_browse_continuation_points)
    }

    fn cleanup_sender(&self) -> CleanupSender {
        self.cleanup.sender()
    }

    /// Builds every address space and exchanges the cross-manager
    /// references they produce.
    pub fn startup(&self) -> ServiceResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut external = Vec::new();
        for (id, manager) in self.registry.managers() {
            external.extend(self.build_address_space(id, manager.as_ref())?);
        }
        let routed = self.route_references(external, true);
        info!(managers = self.registry.len(), external_references = routed, "address space started");
        Ok(())
    }

    fn build_address_space(&self, id: ManagerId, manager: &dyn NodeManager) -> ServiceResult<Vec<ExternalReference>> {
        match panic::catch_unwind(AssertUnwindSafe(|| manager.create_address_space())) {
            Ok(Ok(external)) => Ok(external),
            Ok(Err(status)) => {
                error!(manager = manager.name(), id = %id, %status, "address space creation failed");
                Err(ServiceError::Status(status))
            }
            Err(_) => {
                error!(manager = manager.name(), id = %id, "manager panicked while creating its address space");
                Err(ServiceError::internal(format!("{} panicked during startup", manager.name())))
            }
        }
    }

    /// Tears down every manager and stops the cleanup worker.
    pub fn shutdown(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            self.cleanup.shutdown();
            return;
        }
        for (id, manager) in self.registry.managers() {
            if panic::catch_unwind(AssertUnwindSafe(|| manager.delete_address_space())).is_err() {
                error!(manager = manager.name(), id = %id, "manager panicked during shutdown");
            }
        }
        self.cleanup.shutdown();
        info!("address space shut down");
    }

    /// Waits until every dangling reference queued so far was handled.
    pub fn flush_cleanup(&self, timeout: Duration) -> bool {
        self.cleanup.flush(timeout)
    }

    /// Edges removed by the cleanup worker so far.
    #[must_use]
    pub fn references_cleaned(&self) -> u64 {
        self.cleanup.removed()
    }

    /// Hands each reference to the manager owning the node that carries it.
    /// Returns how many landed.
    fn route_references(&self, references: Vec<ExternalReference>, add: bool) -> usize {
        let mut by_owner: HashMap<ManagerId, Vec<ExternalReference>> = HashMap::new();
        for reference in references {
            match self.registry.resolve(&reference.node_id) {
                Some(handle) => by_owner.entry(handle.manager).or_default().push(reference),
                None => debug!(node_id = %reference.node_id, "no owner for external reference"),
            }
        }
        let mut applied = 0;
        for (id, references) in by_owner {
            let Some(manager) = self.registry.manager(id) else {
                continue;
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                if add {
                    manager.add_references(&references)
                } else {
                    manager.delete_references(&references)
                }
            }));
            match outcome {
                Ok(n) => applied += n,
                Err(_) => error!(manager = manager.name(), "manager panicked while applying external references"),
            }
        }
        applied
    }

    fn check_batch(&self, len: usize) -> ServiceResult<()> {
        if len == 0 {
            return Err(ServiceError::Status(StatusCode::BadNothingToDo));
        }
        if len > self.config.max_nodes_per_operation {
            return Err(ServiceError::Status(StatusCode::BadTooManyOperations));
        }
        Ok(())
    }

    /// Resolves owners and fetches metadata for every id not yet in `lookup`.
    fn fetch(&self, ctx: &OperationContext, node_ids: &[NodeId], lookup: &mut Lookup) {
        let mut by_owner: HashMap<ManagerId, Vec<NodeId>> = HashMap::new();
        for node_id in node_ids {
            if lookup.handles.contains_key(node_id) {
                continue;
            }
            let handle = self.registry.resolve(node_id);
            match &handle {
                Some(h) => by_owner.entry(h.manager).or_default().push(node_id.clone()),
                None => {
                    lookup.metadata.insert(node_id.clone(), None);
                }
            }
            lookup.handles.insert(node_id.clone(), handle);
        }
        for (id, ids) in by_owner {
            let Some(manager) = self.registry.manager(id) else {
                continue;
            };
            let found = panic::catch_unwind(AssertUnwindSafe(|| manager.node_metadata(ctx, &ids))).unwrap_or_else(|_| {
                error!(manager = manager.name(), "manager panicked while reporting node metadata");
                Vec::new()
            });
            let mut found = found.into_iter();
            for node_id in ids {
                lookup.metadata.insert(node_id, found.next().flatten());
            }
        }
    }

    fn check_permission(
        &self,
        ctx: &OperationContext,
        node_id: &NodeId,
        metadata: &NodeMetadata,
        operation: OperationType,
    ) -> Result<(), StatusCode> {
        self.permissions
            .validate(ctx.session(), operation, node_id, &metadata.permissions)
    }

    /// Validates every item, resolves its owner and runs the permission gate.
    /// Items that pass carry a handle; the others are failed.
    fn prepare<Req, Res>(
        &self,
        ctx: &OperationContext,
        items: &mut [ServiceItem<Req, Res>],
        lookup: &mut Lookup,
        target: impl Fn(&Req) -> Result<Target, StatusCode>,
    ) -> ServiceResult<()> {
        let mut targets: Vec<Option<Target>> = Vec::with_capacity(items.len());
        let mut wanted: Vec<NodeId> = Vec::new();
        for (index, item) in items.iter_mut().enumerate() {
            ctx.check(index)?;
            if item.is_processed() {
                targets.push(None);
                continue;
            }
            match target(item.request()) {
                Ok(t) => {
                    wanted.push(t.node_id.clone());
                    if let Some((node, _)) = &t.permission_node {
                        wanted.push(node.clone());
                    }
                    targets.push(Some(t));
                }
                Err(status) => {
                    item.fail(status);
                    targets.push(None);
                }
            }
        }
        self.fetch(ctx, &wanted, lookup);

        for (item, target) in items.iter_mut().zip(targets) {
            let Some(target) = target else {
                continue;
            };
            let (Some(handle), Some(metadata)) = (lookup.handle(&target.node_id), lookup.metadata(&target.node_id)) else {
                item.fail(StatusCode::BadNodeIdUnknown);
                continue;
            };
            let (checked_id, checked) = match &target.permission_node {
                None => (&target.node_id, metadata),
                Some((node, missing)) => match lookup.metadata(node) {
                    Some(found) => (node, found),
                    None => {
                        item.fail(*missing);
                        continue;
                    }
                },
            };
            let outcome = self
                .check_permission(ctx, checked_id, checked, target.operation)
                .and_then(|()| match target.also {
                    Some(op) => self.check_permission(ctx, checked_id, checked, op),
                    None => Ok(()),
                });
            if let Err(status) = outcome {
                item.fail(status);
                continue;
            }
            item.set_handle(handle.clone());
        }
        Ok(())
    }

    /// Hands the whole batch to every manager in registration order. A
    /// manager that panics fails the items it had not completed; items no
    /// manager claimed end as `BadNodeIdUnknown`.
    fn fan_out<Req, Res>(
        &self,
        ctx: &OperationContext,
        service: &'static str,
        items: &mut [ServiceItem<Req, Res>],
        call: impl Fn(&dyn NodeManager, &mut [ServiceItem<Req, Res>]),
    ) -> ServiceResult<()> {
        for (id, manager) in self.registry.managers() {
            ctx.check(items.iter().filter(|i| i.is_processed()).count())?;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| call(manager.as_ref(), &mut *items)));
            if outcome.is_err() {
                let mut failed = 0;
                for item in items.iter_mut().filter(|i| i.is_claimable_by(id)) {
                    item.fail_with_diagnostic(StatusCode::BadUnexpectedError, format!("{} failed", manager.name()));
                    failed += 1;
                }
                error!(service, manager = manager.name(), id = %id, failed, "node manager panicked");
            }
        }
        for item in items.iter_mut().filter(|i| !i.is_processed()) {
            item.fail(StatusCode::BadNodeIdUnknown);
        }
        Ok(())
    }

    fn record<Req, Res>(&self, service: &'static str, items: &[ServiceItem<Req, Res>]) {
        let failed = items.iter().filter(|i| i.status().is_bad()).count();
        let processed = items.len() - failed;
        self.stats.service_calls.fetch_add(1, Ordering::Relaxed);
        self.stats.items_processed.fetch_add(processed as u64, Ordering::Relaxed);
        self.stats.items_failed.fetch_add(failed as u64, Ordering::Relaxed);
        debug!(service, items = items.len(), failed, "service call complete");
    }

    // ---- Browse -------------------------------------------------------

    /// Browses each starting node. `max_references` of 0 uses the server
    /// page size. Results longer than a page get a continuation point.
    pub fn browse(&self, ctx: &OperationContext, max_references: usize, items: &mut [BrowseItem]) -> ServiceResult<()> {
        self.check_batch(items.len())?;
        let mut lookup = Lookup::default();
        for item in items.iter_mut() {
            if let Some(rt) = &item.request().reference_type_id {
                if !self.type_tree.is_reference_type(rt) {
                    item.fail(StatusCode::BadReferenceTypeIdInvalid);
                }
            }
        }
        self.prepare(ctx, items, &mut lookup, |d| Ok(Target::new(d.node_id.clone(), OperationType::Browse)))?;

        let mut node_items: Vec<NodeBrowseItem> = Vec::new();
        let mut positions: Vec<usize> = Vec::new();
        for (index, item) in items.iter().enumerate() {
            if let (false, Some(handle)) = (item.is_processed(), item.handle()) {
                let mut node_item = ServiceItem::new(item.request().clone());
                node_item.set_handle(handle.clone());
                node_items.push(node_item);
                positions.push(index);
            }
        }
        if !node_items.is_empty() {
            self.fan_out(ctx, "browse", &mut node_items, |m, batch| m.browse(ctx, batch))?;
        }

        let page = if max_references == 0 {
            self.config.max_references_per_node
        } else {
            max_references
        };
        let mut allocated: Vec<ContinuationPointId> = Vec::new();
        for (done, (node_item, index)) in node_items.iter_mut().zip(positions).enumerate() {
            if let Err(err) = ctx.check(done) {
                self.release_points(ctx, &allocated);
                return Err(err);
            }
            let item = &mut items[index];
            let Some(references) = node_item.take_result() else {
                item.fail(node_item.status());
                continue;
            };
            let class_mask = item.request().node_class_mask;
            let references = self.post_process(ctx, references, class_mask, &mut lookup);
            let manager = item.handle().map_or(Self::CORE, |h| h.manager);
            let mut cursor = BrowseCursor::new(references);
            let first = cursor.next_page(page);
            if cursor.is_exhausted() {
                item.complete(BrowseResult {
                    references: first,
                    continuation_point: None,
                });
                continue;
            }
            if allocated.len() >= self.config.max_continuation_points_per_browse {
                item.fail(StatusCode::BadNoContinuationPoints);
                continue;
            }
            let point = ContinuationPoint::new(manager, item.request().node_id.clone(), page, cursor);
            let id = point.id;
            match ctx.session().store_continuation_point(point) {
                Ok(_) => {
                    allocated.push(id);
                    item.complete(BrowseResult {
                        references: first,
                        continuation_point: Some(id),
                    });
                }
                Err(status) => item.fail(status),
            }
        }
        self.record("browse", items);
        Ok(())
    }

    fn release_points(&self, ctx: &OperationContext, points: &[ContinuationPointId]) {
        for id in points {
            ctx.session().release_continuation_point(*id);
        }
        if !points.is_empty() {
            debug!(released = points.len(), "released continuation points of an aborted browse");
        }
    }

    /// Fills in metadata of targets owned by other managers, applies the
    /// node class mask and drops targets the caller may not browse.
    fn post_process(
        &self,
        ctx: &OperationContext,
        references: Vec<ReferenceDescription>,
        class_mask: u32,
        lookup: &mut Lookup,
    ) -> Vec<ReferenceDescription> {
        let targets: Vec<NodeId> = references
            .iter()
            .filter_map(|r| r.node_id.as_local().cloned())
            .collect();
        self.fetch(ctx, &targets, lookup);
        references
            .into_iter()
            .filter_map(|mut reference| {
                let Some(target) = reference.node_id.as_local() else {
                    return Some(reference);
                };
                if let Some(metadata) = lookup.metadata(target) {
                    if !reference.has_metadata() {
                        reference.browse_name = Some(metadata.browse_name.clone());
                        reference.display_name = Some(metadata.display_name.clone());
                        reference.node_class = Some(metadata.node_class);
                        reference.type_definition.clone_from(&metadata.type_definition);
                    }
                    if self
                        .check_permission(ctx, target, metadata, OperationType::Browse)
                        .is_err()
                    {
                        return None;
                    }
                }
                match reference.node_class {
                    Some(class) if !class.matches_mask(class_mask) => None,
                    _ => Some(reference),
                }
            })
            .collect()
    }

    /// Resumes browses. With `release` the points are disposed and nothing
    /// is returned.
    pub fn browse_next(&self, ctx: &OperationContext, release: bool, items: &mut [BrowseNextItem]) -> ServiceResult<()> {
        self.check_batch(items.len())?;
        let session = ctx.session();
        for (index, item) in items.iter_mut().enumerate() {
            ctx.check(index)?;
            let id = *item.request();
            let mut point = match session.take_continuation_point(id) {
                Ok(Some(point)) => point,
                Ok(None) => {
                    item.fail(StatusCode::BadContinuationPointInvalid);
                    continue;
                }
                Err(status) => {
                    item.fail(status);
                    continue;
                }
            };
            if release {
                item.complete(BrowseResult::default());
                continue;
            }
            let references = point.cursor.next_page(point.max_references);
            if point.cursor.is_exhausted() {
                item.complete(BrowseResult {
                    references,
                    continuation_point: None,
                });
                continue;
            }
            match session.store_continuation_point(point) {
                Ok(_) => item.complete(BrowseResult {
                    references,
                    continuation_point: Some(id),
                }),
                Err(status) => item.fail(status),
            }
        }
        self.record("browse_next", items);
        Ok(())
    }

    /// Resolves relative paths hop by hop.
    pub fn translate_browse_paths(&self, ctx: &OperationContext, items: &mut [TranslateItem]) -> ServiceResult<()> {
        self.check_batch(items.len())?;
        let mut lookup = Lookup::default();
        for (index, item) in items.iter_mut().enumerate() {
            ctx.check(index)?;
            let path = item.request().clone();
            if path.relative_path.is_empty() {
                item.fail(StatusCode::BadNothingToDo);
                continue;
            }
            let last = path.relative_path.len() - 1;
            if path.relative_path[..last].iter().any(|e| e.target_name.is_empty()) {
                item.fail(StatusCode::BadBrowseNameInvalid);
                continue;
            }
            self.fetch(ctx, std::slice::from_ref(&path.starting_node), &mut lookup);
            let Some(start) = lookup.metadata(&path.starting_node) else {
                item.fail(StatusCode::BadNodeIdUnknown);
                continue;
            };
            if let Err(status) = self.check_permission(ctx, &path.starting_node, start, OperationType::TranslateBrowsePath) {
                item.fail(status);
                continue;
            }

            let mut current = vec![path.starting_node.clone()];
            let mut remote: Vec<BrowsePathTarget> = Vec::new();
            let mut failure = None;
            for (hop, element) in path.relative_path.iter().enumerate() {
                let mut next: Vec<NodeId> = Vec::new();
                let mut external: Vec<NodeId> = Vec::new();
                for source in &current {
                    let Some(handle) = lookup.handle(source).cloned().or_else(|| self.registry.resolve(source)) else {
                        continue;
                    };
                    let Some(manager) = self.registry.manager(handle.manager) else {
                        continue;
                    };
                    let found = panic::catch_unwind(AssertUnwindSafe(|| manager.translate_hop(ctx, source, element)));
                    match found {
                        Ok(Ok(targets)) => {
                            next.extend(targets.matched);
                            external.extend(targets.external);
                            let remaining = u32::try_from(hop).unwrap_or(u32::MAX);
                            remote.extend(targets.remote.into_iter().map(|target_id| BrowsePathTarget {
                                target_id,
                                remaining_path_index: remaining,
                            }));
                        }
                        Ok(Err(status)) => debug!(node_id = %source, %status, "hop failed"),
                        Err(_) => {
                            error!(manager = manager.name(), "manager panicked during translate");
                            failure = Some(StatusCode::BadUnexpectedError);
                        }
                    }
                }
                self.fetch(ctx, &external, &mut lookup);
                for candidate in external {
                    let matches = lookup.metadata(&candidate).is_some_and(|m| {
                        element.target_name.is_empty() || m.browse_name == element.target_name
                    });
                    if matches {
                        next.push(candidate);
                    }
                }
                let mut seen = std::collections::HashSet::new();
                next.retain(|n| seen.insert(n.clone()));
                current = next;
                if current.is_empty() {
                    break;
                }
            }

            self.fetch(ctx, &current, &mut lookup);
            let mut denied = None;
            let mut targets: Vec<BrowsePathTarget> = Vec::new();
            for node in current {
                let Some(metadata) = lookup.metadata(&node) else {
                    continue;
                };
                match self.check_permission(ctx, &node, metadata, OperationType::TranslateBrowsePath) {
                    Ok(()) => targets.push(BrowsePathTarget::resolved(ExpandedNodeId::local(node))),
                    Err(status) => denied = Some(status),
                }
            }
            targets.extend(remote);
            if !targets.is_empty() {
                item.complete(targets);
            } else if let Some(status) = failure.or(denied) {
                item.fail(status);
            } else {
                item.fail(StatusCode::BadNoMatch);
            }
        }
        self.record("translate_browse_paths", items);
        Ok(())
    }

    // ---- Attribute services ------------------------------------------

    /// Reads attributes. Failed items carry their status in the value.
    pub fn read(&self, ctx: &OperationContext, timestamps: TimestampsToReturn, items: &mut [ReadItem]) -> ServiceResult<()> {
        self.check_batch(items.len())?;
        let mut lookup = Lookup::default();
        self.prepare(ctx, items, &mut lookup, |r| {
            let attribute = r.resolved_attribute().ok_or(StatusCode::BadAttributeIdInvalid)?;
            if r.data_encoding.is_some() && attribute != AttributeId::Value {
                return Err(StatusCode::BadDataEncodingInvalid);
            }
            NumericRange::parse_optional(r.index_range.as_deref())?;
            Ok(Target::new(r.node_id.clone(), OperationType::for_read(attribute)))
        })?;
        self.fan_out(ctx, "read", items, |m, batch| m.read(ctx, timestamps, batch))?;
        finalize_read_results(items);
        for item in items.iter_mut() {
            let status = item.status();
            if let Some(value) = item.take_result() {
                item.complete_with_status(status, value.filter_timestamps(timestamps));
            }
        }
        self.record("read", items);
        Ok(())
    }

    /// Writes attributes.
    pub fn write(&self, ctx: &OperationContext, items: &mut [WriteItem]) -> ServiceResult<()> {
        self.check_batch(items.len())?;
        let mut lookup = Lookup::default();
        self.prepare(ctx, items, &mut lookup, |w| {
            let attribute = AttributeId::from_u32(w.attribute_id).ok_or(StatusCode::BadAttributeIdInvalid)?;
            NumericRange::parse_optional(w.index_range.as_deref())?;
            Ok(Target::new(w.node_id.clone(), OperationType::for_write(attribute)))
        })?;
        self.fan_out(ctx, "write", items, |m, batch| m.write(ctx, batch))?;
        self.record("write", items);
        Ok(())
    }

    /// Reads raw history in `[start, end)`.
    pub fn history_read(&self, ctx: &OperationContext, details: &ReadRawDetails, items: &mut [HistoryReadItem]) -> ServiceResult<()> {
        self.check_batch(items.len())?;
        let invalid = matches!((details.start_time, details.end_time), (Some(s), Some(e)) if e < s);
        let mut lookup = Lookup::default();
        self.prepare(ctx, items, &mut lookup, |h| {
            if invalid {
                return Err(StatusCode::BadHistoryOperationInvalid);
            }
            NumericRange::parse_optional(h.index_range.as_deref())?;
            Ok(Target::new(h.node_id.clone(), OperationType::ReadHistory))
        })?;
        self.fan_out(ctx, "history_read", items, |m, batch| m.history_read(ctx, details, batch))?;
        self.record("history_read", items);
        Ok(())
    }

    /// Inserts, replaces or deletes history.
    pub fn history_update(&self, ctx: &OperationContext, items: &mut [HistoryUpdateItem]) -> ServiceResult<()> {
        self.check_batch(items.len())?;
        let mut lookup = Lookup::default();
        self.prepare(ctx, items, &mut lookup, |d| {
            let node_id = d.node_id().clone();
            Ok(match d {
                HistoryUpdateDetails::Insert { .. } => Target::new(node_id, OperationType::InsertHistory),
                HistoryUpdateDetails::Replace { .. } => Target::new(node_id, OperationType::ModifyHistory),
                HistoryUpdateDetails::Update { .. } => Target {
                    also: Some(OperationType::ModifyHistory),
                    ..Target::new(node_id, OperationType::InsertHistory)
                },
                HistoryUpdateDetails::DeleteRaw {
                    start_time, end_time, ..
                } => {
                    if end_time < start_time {
                        return Err(StatusCode::BadHistoryOperationInvalid);
                    }
                    Target::new(node_id, OperationType::DeleteHistory)
                }
            })
        })?;
        self.fan_out(ctx, "history_update", items, |m, batch| m.history_update(ctx, batch))?;
        self.record("history_update", items);
        Ok(())
    }

    /// Invokes methods. The Call permission is checked on the method node.
    pub fn call(&self, ctx: &OperationContext, items: &mut [CallItem]) -> ServiceResult<()> {
        self.check_batch(items.len())?;
        let mut lookup = Lookup::default();
        self.prepare(ctx, items, &mut lookup, |c| {
            Ok(Target {
                permission_node: Some((c.method_id.clone(), StatusCode::BadMethodInvalid)),
                ..Target::new(c.object_id.clone(), OperationType::Call)
            })
        })?;
        self.fan_out(ctx, "call", items, |m, batch| m.call(ctx, batch))?;
        self.record("call", items);
        Ok(())
    }

    // ---- Monitored items ---------------------------------------------

    /// Creates monitored items. Event items on the Server object also
    /// receive the events of every other manager.
    pub fn create_monitored_items(
        &self,
        ctx: &OperationContext,
        subscription: &SubscriptionContext,
        items: &mut [CreateMonitoredItem],
    ) -> ServiceResult<()> {
        self.check_batch(items.len())?;
        let mut lookup = Lookup::default();
        self.prepare(ctx, items, &mut lookup, |c| {
            let rvi = &c.item_to_monitor;
            let attribute = rvi.resolved_attribute().ok_or(StatusCode::BadAttributeIdInvalid)?;
            if rvi.data_encoding.is_some() && attribute != AttributeId::Value {
                return Err(StatusCode::BadDataEncodingInvalid);
            }
            NumericRange::parse_optional(rvi.index_range.as_deref())?;
            let operation = if attribute == AttributeId::EventNotifier {
                OperationType::ReceiveEvents
            } else {
                OperationType::Read
            };
            Ok(Target::new(rvi.node_id.clone(), operation))
        })?;
        self.fan_out(ctx, "create_monitored_items", items, |m, batch| {
            m.create_monitored_items(ctx, subscription, batch);
        })?;

        let mut created = 0u64;
        for item in items.iter() {
            let Some(monitored) = item.result().and_then(|r| r.item.as_ref()) else {
                continue;
            };
            created += 1;
            if monitored.is_event_item() && monitored.node_id() == &ids::SERVER {
                self.route_server_events(monitored);
            }
        }
        self.stats.monitored_items_created.fetch_add(created, Ordering::Relaxed);
        self.record("create_monitored_items", items);
        Ok(())
    }

    fn route_server_events(&self, item: &Arc<MonitoredItem>) {
        let mut routed = Vec::new();
        for (id, manager) in self.registry.managers() {
            if id == item.manager() {
                continue;
            }
            let subscribed = panic::catch_unwind(AssertUnwindSafe(|| manager.subscribe_to_all_events(item)));
            if matches!(subscribed, Ok(true)) {
                routed.push(id);
            }
        }
        debug!(item_id = item.id(), managers = routed.len(), "server event item routed");
        self.event_routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(item.id(), routed);
    }

    fn unroute_server_events(&self, item_id: u32) -> Vec<ManagerId> {
        let routed = self
            .event_routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&item_id)
            .unwrap_or_default();
        for id in &routed {
            if let Some(manager) = self.registry.manager(*id) {
                if panic::catch_unwind(AssertUnwindSafe(|| manager.unsubscribe_from_all_events(item_id))).is_err() {
                    error!(manager = manager.name(), item_id, "manager panicked while unsubscribing events");
                }
            }
        }
        routed
    }

    /// Hands every existing-item request to the manager that created it.
    /// Items of another session fail with `BadMonitoredItemIdInvalid` unless
    /// the caller is the system session.
    fn bind_owners<Req, Res>(
        ctx: &OperationContext,
        items: &mut [ServiceItem<Req, Res>],
        item_of: impl Fn(&Req) -> &Arc<MonitoredItem>,
    ) {
        let session = ctx.session();
        for item in items.iter_mut() {
            let monitored = item_of(item.request());
            if !session.is_system() && monitored.session_id() != session.id() {
                debug!(item_id = monitored.id(), "monitored item belongs to another session");
                item.fail(StatusCode::BadMonitoredItemIdInvalid);
                continue;
            }
            let handle = NodeHandle {
                node_id: monitored.node_id().clone(),
                manager: monitored.manager(),
            };
            item.set_handle(handle);
        }
    }

    /// Revises the settings of existing items.
    pub fn modify_monitored_items(
        &self,
        ctx: &OperationContext,
        subscription: &SubscriptionContext,
        items: &mut [ModifyMonitoredItem],
    ) -> ServiceResult<()> {
        self.check_batch(items.len())?;
        Self::bind_owners(ctx, items, |r| &r.item);
        self.fan_out(ctx, "modify_monitored_items", items, |m, batch| {
            m.modify_monitored_items(ctx, subscription, batch);
        })?;
        for item in items.iter().filter(|i| i.status().is_good()) {
            let monitored = &item.request().item;
            if monitored.is_event_item() && !self.unroute_server_events(monitored.id()).is_empty() {
                self.route_server_events(monitored);
            }
        }
        self.record("modify_monitored_items", items);
        Ok(())
    }

    /// Deletes items and stops their sampling.
    pub fn delete_monitored_items(&self, ctx: &OperationContext, items: &mut [ExistingMonitoredItem]) -> ServiceResult<()> {
        self.check_batch(items.len())?;
        Self::bind_owners(ctx, items, |r| r);
        self.fan_out(ctx, "delete_monitored_items", items, |m, batch| m.delete_monitored_items(ctx, batch))?;
        for item in items.iter().filter(|i| i.status().is_good()) {
            self.unroute_server_events(item.request().id());
        }
        self.record("delete_monitored_items", items);
        Ok(())
    }

    /// Changes the monitoring mode of existing items.
    pub fn set_monitoring_mode(
        &self,
        ctx: &OperationContext,
        mode: MonitoringMode,
        items: &mut [ExistingMonitoredItem],
    ) -> ServiceResult<()> {
        self.check_batch(items.len())?;
        Self::bind_owners(ctx, items, |r| r);
        self.fan_out(ctx, "set_monitoring_mode", items, |m, batch| m.set_monitoring_mode(ctx, mode, batch))?;
        self.record("set_monitoring_mode", items);
        Ok(())
    }

    /// Moves items to another session and subscription.
    pub fn transfer_monitored_items(
        &self,
        ctx: &OperationContext,
        session_id: SessionId,
        subscription_id: u32,
        items: &mut [ExistingMonitoredItem],
    ) -> ServiceResult<()> {
        self.check_batch(items.len())?;
        Self::bind_owners(ctx, items, |r| r);
        self.fan_out(ctx, "transfer_monitored_items", items, |m, batch| {
            m.transfer_monitored_items(ctx, session_id, subscription_id, batch);
        })?;
        self.record("transfer_monitored_items", items);
        Ok(())
    }

    /// Delivers an event through the manager owning its source node, or the
    /// core manager when no manager owns it. Returns how many items queued it.
    pub fn report_event(&self, event: &EventRecord) -> usize {
        let owner = self
            .registry
            .resolve(&event.source_node)
            .map_or(Self::CORE, |h| h.manager);
        let Some(manager) = self.registry.manager(owner) else {
            return 0;
        };
        match panic::catch_unwind(AssertUnwindSafe(|| manager.report_event(event))) {
            Ok(delivered) => delivered,
            Err(_) => {
                error!(manager = manager.name(), "manager panicked while reporting an event");
                0
            }
        }
    }

    // ---- Node management ---------------------------------------------

    fn owner_of(&self, node_id: &NodeId) -> Result<(NodeHandle, Arc<dyn NodeManager>), StatusCode> {
        let handle = self.registry.resolve(node_id).ok_or(StatusCode::BadNodeIdUnknown)?;
        let manager = self.registry.manager(handle.manager).ok_or(StatusCode::BadNodeIdUnknown)?;
        Ok((handle, manager))
    }

    fn guarded<T>(manager: &dyn NodeManager, op: &'static str, f: impl FnOnce() -> Result<T, StatusCode>) -> Result<T, StatusCode> {
        panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
            error!(manager = manager.name(), op, "node manager panicked");
            Err(StatusCode::BadUnexpectedError)
        })
    }

    fn authorize(&self, ctx: &OperationContext, node_id: &NodeId, operation: OperationType) -> Result<(), StatusCode> {
        let mut lookup = Lookup::default();
        self.fetch(ctx, std::slice::from_ref(node_id), &mut lookup);
        let metadata = lookup.metadata(node_id).ok_or(StatusCode::BadNodeIdUnknown)?;
        self.check_permission(ctx, node_id, metadata, operation)
    }

    fn check_local_target(&self, reference: &Reference) -> Result<(), StatusCode> {
        match reference.target_id.as_local() {
            Some(target) if !self.registry.has_namespace_owner(target) => Err(StatusCode::BadNodeIdUnknown),
            _ => Ok(()),
        }
    }

    /// Adds a node to the first manager serving its namespace, and applies
    /// the mirrors of its references in the other managers.
    pub fn add_node(&self, ctx: &OperationContext, node: Node) -> Result<(), StatusCode> {
        if self.registry.resolve(&node.node_id).is_some() {
            return Err(StatusCode::BadNodeIdExists);
        }
        for reference in &node.references {
            self.check_local_target(reference)?;
        }
        let owner = self
            .registry
            .owners_of(node.node_id.namespace)
            .first()
            .copied()
            .ok_or(StatusCode::BadNodeIdInvalid)?;
        let manager = self.registry.manager(owner).ok_or(StatusCode::BadNodeIdInvalid)?;
        let node_id = node.node_id.clone();
        let external = Self::guarded(manager.as_ref(), "add_node", || manager.add_node(ctx, node))?;
        let routed = self.route_references(external, true);
        debug!(node_id = %node_id, manager = manager.name(), routed, "node added");
        Ok(())
    }

    /// Deletes a node; edges held by other managers are cleaned up later.
    pub fn delete_node(&self, ctx: &OperationContext, node_id: &NodeId, delete_children: bool) -> Result<Vec<NodeId>, StatusCode> {
        self.authorize(ctx, node_id, OperationType::DeleteNode)?;
        let (_, manager) = self.owner_of(node_id)?;
        Self::guarded(manager.as_ref(), "delete_node", || manager.delete_node(ctx, node_id, delete_children))
    }

    /// Adds a reference on `source`; the mirror is applied by the target's
    /// owner after the source owner returned.
    pub fn add_reference(&self, ctx: &OperationContext, source: &NodeId, reference: Reference, bidirectional: bool) -> Result<(), StatusCode> {
        if !self.type_tree.is_reference_type(&reference.reference_type_id) {
            return Err(StatusCode::BadReferenceTypeIdInvalid);
        }
        self.check_local_target(&reference)?;
        self.authorize(ctx, source, OperationType::AddReference)?;
        let (_, manager) = self.owner_of(source)?;
        let mirror = Self::guarded(manager.as_ref(), "add_reference", || {
            manager.add_reference(ctx, source, reference, bidirectional)
        })?;
        if let Some(mirror) = mirror {
            if self.route_references(vec![mirror], true) == 0 {
                warn!(source = %source, "reference mirror not applied");
            }
        }
        Ok(())
    }

    /// Deletes a reference on `source` and, when asked, its mirror.
    pub fn delete_reference(
        &self,
        ctx: &OperationContext,
        source: &NodeId,
        reference: &Reference,
        delete_bidirectional: bool,
    ) -> Result<(), StatusCode> {
        self.authorize(ctx, source, OperationType::RemoveReference)?;
        let (_, manager) = self.owner_of(source)?;
        let mirror = Self::guarded(manager.as_ref(), "delete_reference", || {
            manager.delete_reference(ctx, source, reference, delete_bidirectional)
        })?;
        if let Some(mirror) = mirror {
            self.route_references(vec![mirror], false);
        }
        Ok(())
    }

    /// Materializes the declarations of `type_definition` below `instance`.
    /// Returns the created nodes.
    pub fn instantiate(
        &self,
        ctx: &OperationContext,
        instance: &NodeId,
        type_definition: &NodeId,
        template: Option<&InstanceTemplate>,
    ) -> Result<Vec<NodeId>, StatusCode> {
        let (_, manager) = self.owner_of(instance)?;
        let outcome = Self::guarded(manager.as_ref(), "instantiate", || {
            manager.instantiate(ctx, instance, type_definition, template)
        })?;
        self.route_references(outcome.external, true);
        Ok(outcome.created)
    }
}

impl Drop for MasterNodeManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browse::BrowseDescription;
    use crate::service::ReadValueId;

    fn master() -> MasterNodeManager {
        let master = MasterNodeManager::with_defaults(ServerConfig::default()).unwrap();
        master.startup().unwrap();
        master
    }

    #[test]
    fn construction_requires_core_and_server_managers() {
        let only_core: Vec<Arc<dyn NodeManager>> =
            vec![Arc::new(InMemoryNodeManager::new("core", vec![CORE_NAMESPACE_URI.to_string()]))];
        let err = MasterNodeManager::new(ServerConfig::default(), only_core).unwrap_err();
        assert!(matches!(err, ServiceError::Config(ConfigError::MissingManager { .. })));

        let wrong_first: Vec<Arc<dyn NodeManager>> = vec![
            Arc::new(InMemoryNodeManager::new("x", vec!["urn:x".to_string()])),
            Arc::new(InMemoryNodeManager::new("core", vec![CORE_NAMESPACE_URI.to_string()])),
        ];
        assert!(MasterNodeManager::new(ServerConfig::default(), wrong_first).is_err());
    }

    #[test]
    fn diagnostics_counters_follow_service_calls() {
        let master = master();
        let ctx = OperationContext::system();
        let ns = master.namespace_index("urn:uacore:server").unwrap();
        let counter = diagnostics_counter_id(ns, "ServiceCalls");

        let mut items = vec![ServiceItem::new(ReadValueId::value(counter.clone()))];
        master.read(&ctx, TimestampsToReturn::Both, &mut items).unwrap();
        let first = items[0].result().unwrap().value.clone();

        let mut items = vec![ServiceItem::new(ReadValueId::value(counter))];
        master.read(&ctx, TimestampsToReturn::Both, &mut items).unwrap();
        let second = items[0].result().unwrap().value.clone();
        assert_eq!(first, Variant::Int64(0));
        assert_eq!(second, Variant::Int64(1));
    }

    #[test]
    fn server_lists_diagnostics_from_another_manager() {
        let master = master();
        let ctx = OperationContext::system();
        let ns = master.namespace_index("urn:uacore:server").unwrap();
        let mut items = vec![ServiceItem::new(BrowseDescription::hierarchical(ids::SERVER))];
        master.browse(&ctx, 0, &mut items).unwrap();
        let refs = &items[0].result().unwrap().references;
        let diag = refs
            .iter()
            .find(|r| r.node_id.as_local() == Some(&crate::manager::diagnostics_object_id(ns)))
            .unwrap();
        assert_eq!(diag.browse_name.as_ref().map(|q| q.name.as_str()), Some("ServerDiagnostics"));
    }

    #[test]
    fn empty_and_oversized_batches_fail_the_call() {
        let config = ServerConfig {
            max_nodes_per_operation: 1,
            ..ServerConfig::default()
        };
        let master = MasterNodeManager::with_defaults(config).unwrap();
        let ctx = OperationContext::system();
        let mut none: Vec<ReadItem> = Vec::new();
        assert_eq!(
            master.read(&ctx, TimestampsToReturn::Both, &mut none).unwrap_err().status(),
            StatusCode::BadNothingToDo
        );
        let mut two = vec![
            ServiceItem::new(ReadValueId::value(ids::SERVER)),
            ServiceItem::new(ReadValueId::value(ids::SERVER)),
        ];
        assert_eq!(
            master.read(&ctx, TimestampsToReturn::Both, &mut two).unwrap_err().status(),
            StatusCode::BadTooManyOperations
        );
    }
}
