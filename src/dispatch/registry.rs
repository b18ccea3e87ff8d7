//! Namespace to manager table.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::error;

use crate::manager::{NodeHandle, NodeManager, ManagerId, NamespaceTable};
use crate::node_id::NodeId;
use crate::status::StatusCode;

fn lock_err(context: &str) -> StatusCode {
    error!(context, "registry lock poisoned");
    StatusCode::BadInternalError
}

/// Registered managers and the ordered owner list of every namespace.
pub(crate) struct Registry {
    managers: RwLock<Vec<Arc<dyn NodeManager>>>,
    by_namespace: RwLock<HashMap<u16, Vec<ManagerId>>>,
    pub(crate) namespaces: Arc<NamespaceTable>,
}

impl Registry {
    pub(crate) fn new(namespaces: Arc<NamespaceTable>) -> Self {
        Self {
            managers: RwLock::new(Vec::new()),
            by_namespace: RwLock::new(HashMap::new()),
            namespaces,
        }
    }

    /// Appends a manager and its namespaces. Returns its id and the indices
    /// of its namespace URIs.
    pub(crate) fn register(&self, manager: Arc<dyn NodeManager>) -> Result<(ManagerId, Vec<u16>), StatusCode> {
        let indices = manager
            .namespace_uris()
            .iter()
            .map(|uri| self.namespaces.register(uri))
            .collect::<Result<Vec<u16>, StatusCode>>()?;
        let mut managers = self.managers.write().map_err(|_| lock_err("managers"))?;
        let id = ManagerId(managers.len());
        managers.push(manager);
        drop(managers);
        let mut by_namespace = self.by_namespace.write().map_err(|_| lock_err("namespaces"))?;
        for index in &indices {
            let owners = by_namespace.entry(*index).or_default();
            if !owners.contains(&id) {
                owners.push(id);
            }
        }
        Ok((id, indices))
    }

    /// Snapshot of every manager with its id, in registration order.
    pub(crate) fn managers(&self) -> Vec<(ManagerId, Arc<dyn NodeManager>)> {
        self.managers
            .read()
            .map(|m| m.iter().enumerate().map(|(i, m)| (ManagerId(i), Arc::clone(m))).collect())
            .unwrap_or_else(|_| {
                lock_err("managers");
                Vec::new()
            })
    }

    pub(crate) fn manager(&self, id: ManagerId) -> Option<Arc<dyn NodeManager>> {
        self.managers.read().ok()?.get(id.0).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.managers.read().map(|m| m.len()).unwrap_or(0)
    }

    /// Managers registered for a namespace, first registrant first.
    pub(crate) fn owners_of(&self, namespace: u16) -> Vec<ManagerId> {
        self.by_namespace
            .read()
            .ok()
            .and_then(|m| m.get(&namespace).cloned())
            .unwrap_or_default()
    }

    /// Asks the managers of the node's namespace, in order, for a handle.
    pub(crate) fn resolve(&self, node_id: &NodeId) -> Option<NodeHandle> {
        self.owners_of(node_id.namespace)
            .into_iter()
            .filter_map(|id| self.manager(id))
            .find_map(|m| m.get_manager_handle(node_id))
    }

    /// True when some manager serves the node's namespace.
    pub(crate) fn has_namespace_owner(&self, node_id: &NodeId) -> bool {
        !self.owners_of(node_id.namespace).is_empty()
    }
}
