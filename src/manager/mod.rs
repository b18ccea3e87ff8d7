//! Node managers: the pluggable owners of namespace-scoped parts of the
//! address space.
//!
//! The dispatcher never downcasts a manager. Every service goes through the
//! [`NodeManager`] capability trait: the dispatcher resolves each item's owner
//! into a [`NodeHandle`], hands the *whole* batch to every manager, and each
//! manager claims the items whose handle names it
//! ([`ServiceItem::is_claimable_by`](crate::service::ServiceItem::is_claimable_by)).
//!
//! A manager holds one lock over its graph and monitored-item index and never
//! keeps it while calling into another manager, the dispatcher, a sampling
//! group or the cleanup queue.

pub mod builtin;
pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::address_space::{InstanceTemplate, ModellingOutcome, TypeTree};
use crate::browse::{HopTargets, RelativePathElement};
use crate::config::ServerConfig;
use crate::dispatch::cleanup::CleanupSender;
use crate::node::{Node, NodeClass, Reference};
use crate::node_id::{LocalizedText, NodeId, QualifiedName};
use crate::security::PermissionSnapshot;
use crate::service::{
    CallItem, CreateMonitoredItem, ExistingMonitoredItem, HistoryReadItem, HistoryUpdateItem, ModifyMonitoredItem,
    NodeBrowseItem, ReadItem, ReadRawDetails, SubscriptionContext, WriteItem,
};
use crate::session::{OperationContext, SessionId};
use crate::status::StatusCode;
use crate::subscription::{EventRecord, MonitoredItem, MonitoringMode};
use crate::value::TimestampsToReturn;

pub use crate::address_space::ExternalReference;
pub use self::builtin::{
    core_address_space, diagnostics_address_space, diagnostics_counter_id, diagnostics_object_id, CORE_NAMESPACE_URI,
    DIAGNOSTIC_COUNTERS,
};
pub use self::memory::{InMemoryNodeManager, MethodHandler, ValueSource};

/// Position of a manager in the dispatcher's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManagerId(pub usize);

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "manager#{}", self.0)
    }
}

/// A node resolved to its owning manager.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    pub node_id: NodeId,
    pub manager: ManagerId,
}

/// What the dispatcher needs to know about a node it does not own: browse
/// metadata and the permission snapshot.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct NodeMetadata {
    pub node_id: NodeId,
    pub browse_name: QualifiedName,
    pub display_name: LocalizedText,
    pub node_class: NodeClass,
    pub type_definition: Option<NodeId>,
    pub permissions: PermissionSnapshot,
}

impl NodeMetadata {
    /// Captures the metadata of a node.
    #[must_use]
    pub fn of(node: &Node) -> Self {
        Self {
            node_id: node.node_id.clone(),
            browse_name: node.browse_name.clone(),
            display_name: node.display_name.clone(),
            node_class: node.node_class(),
            type_definition: node.type_definition().cloned(),
            permissions: PermissionSnapshot::of(node),
        }
    }
}

/// Namespace URI table. Index 0 is the standard namespace, index 1 the
/// server's own.
#[derive(Debug, Default)]
pub struct NamespaceTable {
    uris: RwLock<Vec<String>>,
}

impl NamespaceTable {
    /// A table holding the standard and the server namespace.
    #[must_use]
    pub fn new(server_uri: &str) -> Self {
        Self {
            uris: RwLock::new(vec![CORE_NAMESPACE_URI.to_string(), server_uri.to_string()]),
        }
    }

    /// Returns the index of `uri`, registering it when new.
    pub fn register(&self, uri: &str) -> Result<u16, StatusCode> {
        let mut uris = self.uris.write().map_err(|_| StatusCode::BadInternalError)?;
        if let Some(pos) = uris.iter().position(|u| u == uri) {
            return u16::try_from(pos).map_err(|_| StatusCode::BadInternalError);
        }
        let index = u16::try_from(uris.len()).map_err(|_| StatusCode::BadTooManyOperations)?;
        uris.push(uri.to_string());
        Ok(index)
    }

    #[must_use]
    pub fn index_of(&self, uri: &str) -> Option<u16> {
        let uris = self.uris.read().ok()?;
        uris.iter().position(|u| u == uri).and_then(|p| u16::try_from(p).ok())
    }

    #[must_use]
    pub fn uri(&self, index: u16) -> Option<String> {
        self.uris.read().ok()?.get(usize::from(index)).cloned()
    }

    /// Every registered URI, by index.
    #[must_use]
    pub fn uris(&self) -> Vec<String> {
        self.uris.read().map(|u| u.clone()).unwrap_or_default()
    }
}

/// Everything the dispatcher hands a manager at registration.
#[derive(Clone)]
pub struct ManagerContext {
    /// The manager's own id.
    pub id: ManagerId,
    /// Indices of the manager's namespace URIs, in declaration order.
    pub namespace_indices: Vec<u16>,
    /// The server-wide namespace table.
    pub namespaces: Arc<NamespaceTable>,
    /// The server-wide type tree.
    pub type_tree: Arc<TypeTree>,
    /// The single monitored-item id counter, owned by the dispatcher.
    pub monitored_item_ids: Arc<AtomicU32>,
    /// The single counter for node ids allocated at runtime.
    pub node_ids: Arc<AtomicU32>,
    /// Queue for dangling cross-manager references.
    pub cleanup: CleanupSender,
    /// Server limits.
    pub config: Arc<ServerConfig>,
}

impl fmt::Debug for ManagerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerContext")
            .field("id", &self.id)
            .field("namespace_indices", &self.namespace_indices)
            .finish_non_exhaustive()
    }
}

/// Index of metadata fetched during one service call.
pub type MetadataCache = HashMap<NodeId, Option<NodeMetadata>>;

/// The capability interface every node manager implements.
///
/// Batched methods receive the complete item slice and must only touch items
/// for which `is_claimable_by(own id)` holds, completing or failing each one.
/// Items no manager claims end as `BadNodeIdUnknown`. Defaults claim nothing.
#[allow(unused_variables)]
pub trait NodeManager: Send + Sync {
    /// Human readable name for logs.
    fn name(&self) -> &str;

    /// Namespace URIs this manager serves.
    fn namespace_uris(&self) -> Vec<String>;

    /// Receives the registration context. Called once, before startup.
    fn attach(&self, context: ManagerContext);

    /// Returns a handle when this manager owns `node_id`.
    fn get_manager_handle(&self, node_id: &NodeId) -> Option<NodeHandle>;

    /// Metadata for owned nodes, one entry per id.
    fn node_metadata(&self, ctx: &OperationContext, node_ids: &[NodeId]) -> Vec<Option<NodeMetadata>>;

    /// Builds the initial address space. Returns the mirrors of references
    /// that point into other managers.
    fn create_address_space(&self) -> Result<Vec<ExternalReference>, StatusCode> {
        Ok(Vec::new())
    }

    /// Drops the address space and stops every background activity.
    fn delete_address_space(&self) {}

    /// Applies mirrors produced by other managers. Returns how many landed.
    fn add_references(&self, references: &[ExternalReference]) -> usize {
        0
    }

    /// Removes edges that dangle after another manager deleted their target.
    fn delete_references(&self, references: &[ExternalReference]) -> usize {
        0
    }

    /// Enumerates references of owned nodes, unpaged and without class
    /// filtering.
    fn browse(&self, ctx: &OperationContext, items: &mut [NodeBrowseItem]);

    /// Follows one relative-path hop from an owned node.
    fn translate_hop(
        &self,
        ctx: &OperationContext,
        source: &NodeId,
        element: &RelativePathElement,
    ) -> Result<HopTargets, StatusCode>;

    /// Reads attributes.
    fn read(&self, ctx: &OperationContext, timestamps: TimestampsToReturn, items: &mut [ReadItem]) {}

    /// Writes attributes.
    fn write(&self, ctx: &OperationContext, items: &mut [WriteItem]) {}

    /// Invokes methods on owned objects.
    fn call(&self, ctx: &OperationContext, items: &mut [CallItem]) {}

    /// Reads raw history.
    fn history_read(&self, ctx: &OperationContext, details: &ReadRawDetails, items: &mut [HistoryReadItem]) {}

    /// Inserts, replaces or deletes history.
    fn history_update(&self, ctx: &OperationContext, items: &mut [HistoryUpdateItem]) {}

    /// Creates monitored items; ids come from the shared counter.
    fn create_monitored_items(
        &self,
        ctx: &OperationContext,
        subscription: &SubscriptionContext,
        items: &mut [CreateMonitoredItem],
    ) {
    }

    /// Modifies items this manager created.
    fn modify_monitored_items(
        &self,
        ctx: &OperationContext,
        subscription: &SubscriptionContext,
        items: &mut [ModifyMonitoredItem],
    ) {
    }

    /// Deletes items this manager created.
    fn delete_monitored_items(&self, ctx: &OperationContext, items: &mut [ExistingMonitoredItem]) {}

    /// Changes the monitoring mode of items this manager created.
    fn set_monitoring_mode(&self, ctx: &OperationContext, mode: MonitoringMode, items: &mut [ExistingMonitoredItem]) {}

    /// Moves items to another session and subscription.
    fn transfer_monitored_items(
        &self,
        ctx: &OperationContext,
        session_id: SessionId,
        subscription_id: u32,
        items: &mut [ExistingMonitoredItem],
    ) {
    }

    /// Registers an event item owned elsewhere that wants every event of the
    /// server. Returns false when this manager produces no events.
    fn subscribe_to_all_events(&self, item: &Arc<MonitoredItem>) -> bool {
        false
    }

    /// Reverses [`subscribe_to_all_events`](Self::subscribe_to_all_events).
    fn unsubscribe_from_all_events(&self, item_id: u32) {}

    /// Delivers an event whose source this manager owns. Returns the number
    /// of items that queued it.
    fn report_event(&self, event: &EventRecord) -> usize {
        0
    }

    /// Adds a node; returns mirrors for other managers.
    fn add_node(&self, ctx: &OperationContext, node: Node) -> Result<Vec<ExternalReference>, StatusCode> {
        Err(StatusCode::BadNotSupported)
    }

    /// Deletes an owned node; returns every node removed. Dangling edges in
    /// other managers are queued for cleanup.
    fn delete_node(&self, ctx: &OperationContext, node_id: &NodeId, delete_children: bool) -> Result<Vec<NodeId>, StatusCode> {
        Err(StatusCode::BadNotSupported)
    }

    /// Adds a reference on an owned node; returns the mirror when its target
    /// lives elsewhere.
    fn add_reference(
        &self,
        ctx: &OperationContext,
        source: &NodeId,
        reference: Reference,
        bidirectional: bool,
    ) -> Result<Option<ExternalReference>, StatusCode> {
        Err(StatusCode::BadNotSupported)
    }

    /// Deletes a reference on an owned node; returns the mirror to remove
    /// elsewhere.
    fn delete_reference(
        &self,
        ctx: &OperationContext,
        source: &NodeId,
        reference: &Reference,
        delete_bidirectional: bool,
    ) -> Result<Option<ExternalReference>, StatusCode> {
        Err(StatusCode::BadNotSupported)
    }

    /// Materializes the children of an owned instance from its type.
    fn instantiate(
        &self,
        ctx: &OperationContext,
        instance: &NodeId,
        type_definition: &NodeId,
        template: Option<&InstanceTemplate>,
    ) -> Result<ModellingOutcome, StatusCode> {
        Err(StatusCode::BadNotSupported)
    }
}
