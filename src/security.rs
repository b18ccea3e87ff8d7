//! Access restriction and role permission checks.
//!
//! Every operation passes two independent gates:
//!
//! 1. **Access restrictions**: the channel security of the caller must satisfy
//!    the `SigningRequired`/`EncryptionRequired`/`SessionRequired` flags of the
//!    node (or the namespace default). Browse-type operations are only checked
//!    when the node sets `ApplyRestrictionsToBrowse`.
//! 2. **Role permissions**: the node's role permissions are intersected with
//!    its user role permissions per role id; at least one role granted to the
//!    session must carry the requested bit.
//!
//! A failed restriction yields `BadSecurityModeInsufficient`; a failed role
//! check yields `BadUserAccessDenied`. Both are distinct from "unknown node".

use std::collections::HashMap;
use std::sync::RwLock;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::node::{AttributeId, Node};
use crate::node_id::NodeId;
use crate::session::Session;
use crate::status::StatusCode;

bitflags! {
    /// Permission bits granted to a role.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PermissionType: u32 {
        const BROWSE = 1;
        const READ_ROLE_PERMISSIONS = 1 << 1;
        const WRITE_ATTRIBUTE = 1 << 2;
        const WRITE_ROLE_PERMISSIONS = 1 << 3;
        const WRITE_HISTORIZING = 1 << 4;
        const READ = 1 << 5;
        const WRITE = 1 << 6;
        const READ_HISTORY = 1 << 7;
        const INSERT_HISTORY = 1 << 8;
        const MODIFY_HISTORY = 1 << 9;
        const DELETE_HISTORY = 1 << 10;
        const RECEIVE_EVENTS = 1 << 11;
        const CALL = 1 << 12;
        const ADD_REFERENCE = 1 << 13;
        const REMOVE_REFERENCE = 1 << 14;
        const DELETE_NODE = 1 << 15;
        const ADD_NODE = 1 << 16;
    }
}

bitflags! {
    /// Channel security a node demands.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AccessRestrictions: u16 {
        const SIGNING_REQUIRED = 1;
        const ENCRYPTION_REQUIRED = 1 << 1;
        const SESSION_REQUIRED = 1 << 2;
        const APPLY_RESTRICTIONS_TO_BROWSE = 1 << 3;
    }
}

/// Permissions granted to one role on one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RolePermission {
    /// The role node id.
    pub role_id: NodeId,
    /// Granted bits.
    pub permissions: PermissionType,
}

impl RolePermission {
    /// Creates a role permission pair.
    #[must_use]
    pub const fn new(role_id: NodeId, permissions: PermissionType) -> Self {
        Self { role_id, permissions }
    }
}

/// Message security mode of the caller's secure channel.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecurityMode {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
}

/// The permission-relevant attributes of one node.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PermissionSnapshot {
    pub access_restrictions: Option<AccessRestrictions>,
    pub role_permissions: Option<Vec<RolePermission>>,
    pub user_role_permissions: Option<Vec<RolePermission>>,
}

impl PermissionSnapshot {
    /// Captures the node-level values of a node.
    #[must_use]
    pub fn of(node: &Node) -> Self {
        Self {
            access_restrictions: node.access_restrictions,
            role_permissions: node.role_permissions.clone(),
            user_role_permissions: node.user_role_permissions.clone(),
        }
    }
}

/// Namespace-level defaults used when a node carries no value of its own.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamespaceMetadata {
    pub namespace_uri: String,
    pub default_role_permissions: Option<Vec<RolePermission>>,
    pub default_user_role_permissions: Option<Vec<RolePermission>>,
    pub default_access_restrictions: Option<AccessRestrictions>,
}

/// The kind of operation being authorized.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Browse,
    TranslateBrowsePath,
    Read,
    ReadRolePermissions,
    Write,
    WriteAttribute,
    WriteRolePermissions,
    WriteHistorizing,
    ReadHistory,
    InsertHistory,
    ModifyHistory,
    DeleteHistory,
    ReceiveEvents,
    Call,
    AddReference,
    RemoveReference,
    DeleteNode,
    AddNode,
}

impl OperationType {
    /// Operation type for reading an attribute.
    #[must_use]
    pub const fn for_read(attribute: AttributeId) -> Self {
        match attribute {
            AttributeId::Value => Self::Read,
            AttributeId::RolePermissions => Self::ReadRolePermissions,
            _ => Self::Browse,
        }
    }

    /// Operation type for writing an attribute.
    #[must_use]
    pub const fn for_write(attribute: AttributeId) -> Self {
        match attribute {
            AttributeId::Value => Self::Write,
            AttributeId::RolePermissions => Self::WriteRolePermissions,
            AttributeId::Historizing => Self::WriteHistorizing,
            _ => Self::WriteAttribute,
        }
    }

    /// The permission bit this operation requires.
    #[must_use]
    pub const fn permission(self) -> PermissionType {
        match self {
            Self::Browse | Self::TranslateBrowsePath => PermissionType::BROWSE,
            Self::Read => PermissionType::READ,
            Self::ReadRolePermissions => PermissionType::READ_ROLE_PERMISSIONS,
            Self::Write => PermissionType::WRITE,
            Self::WriteAttribute => PermissionType::WRITE_ATTRIBUTE,
            Self::WriteRolePermissions => PermissionType::WRITE_ROLE_PERMISSIONS,
            Self::WriteHistorizing => PermissionType::WRITE_HISTORIZING,
            Self::ReadHistory => PermissionType::READ_HISTORY,
            Self::InsertHistory => PermissionType::INSERT_HISTORY,
            Self::ModifyHistory => PermissionType::MODIFY_HISTORY,
            Self::DeleteHistory => PermissionType::DELETE_HISTORY,
            Self::ReceiveEvents => PermissionType::RECEIVE_EVENTS,
            Self::Call => PermissionType::CALL,
            Self::AddReference => PermissionType::ADD_REFERENCE,
            Self::RemoveReference => PermissionType::REMOVE_REFERENCE,
            Self::DeleteNode => PermissionType::DELETE_NODE,
            Self::AddNode => PermissionType::ADD_NODE,
        }
    }

    /// Browse-type operations are exempt from access restrictions unless the
    /// node opts in with `ApplyRestrictionsToBrowse`.
    #[must_use]
    pub const fn is_browse(self) -> bool {
        matches!(self, Self::Browse | Self::TranslateBrowsePath)
    }
}

/// Evaluates both permission gates.
#[derive(Debug, Default)]
pub struct PermissionValidator {
    namespaces: RwLock<HashMap<u16, NamespaceMetadata>>,
}

impl PermissionValidator {
    /// Creates a validator with no namespace defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the defaults for a namespace index.
    pub fn set_namespace_metadata(&self, index: u16, metadata: NamespaceMetadata) -> Result<(), StatusCode> {
        let mut namespaces = self.namespaces.write().map_err(|_| lock_err("namespace metadata"))?;
        namespaces.insert(index, metadata);
        Ok(())
    }

    /// Returns the defaults for a namespace index.
    #[must_use]
    pub fn namespace_metadata(&self, index: u16) -> Option<NamespaceMetadata> {
        self.namespaces.read().ok()?.get(&index).cloned()
    }

    /// Runs both gates.
    pub fn validate(
        &self,
        session: &Session,
        operation: OperationType,
        node_id: &NodeId,
        snapshot: &PermissionSnapshot,
    ) -> Result<(), StatusCode> {
        if session.is_system() {
            return Ok(());
        }
        let namespace = self.namespace_metadata(node_id.namespace);
        let namespace = namespace.as_ref();

        let restrictions = snapshot
            .access_restrictions
            .or_else(|| namespace.and_then(|n| n.default_access_restrictions))
            .unwrap_or_else(AccessRestrictions::empty);
        if let Err(status) = Self::validate_access_restrictions(session, operation, restrictions) {
            debug!(node_id = %node_id, ?operation, ?restrictions, "access restriction not satisfied");
            return Err(status);
        }

        let roles = snapshot
            .role_permissions
            .as_ref()
            .or_else(|| namespace.and_then(|n| n.default_role_permissions.as_ref()));
        let user_roles = snapshot
            .user_role_permissions
            .as_ref()
            .or_else(|| namespace.and_then(|n| n.default_user_role_permissions.as_ref()));
        if let Err(status) =
            Self::validate_role_permissions(session.granted_roles(), operation.permission(), roles, user_roles)
        {
            debug!(node_id = %node_id, ?operation, session_id = %session.id(), "role permission denied");
            return Err(status);
        }
        Ok(())
    }

    /// The access-restriction gate on its own.
    pub fn validate_access_restrictions(
        session: &Session,
        operation: OperationType,
        restrictions: AccessRestrictions,
    ) -> Result<(), StatusCode> {
        if restrictions.is_empty() {
            return Ok(());
        }
        if operation.is_browse() && !restrictions.contains(AccessRestrictions::APPLY_RESTRICTIONS_TO_BROWSE) {
            return Ok(());
        }
        if restrictions.contains(AccessRestrictions::SESSION_REQUIRED) && !session.has_session() {
            return Err(StatusCode::BadSecurityModeInsufficient);
        }
        let mode = session.security_mode();
        let secure_transport = session.secure_transport();
        if restrictions.contains(AccessRestrictions::SIGNING_REQUIRED)
            && mode == SecurityMode::None
            && !secure_transport
        {
            return Err(StatusCode::BadSecurityModeInsufficient);
        }
        if restrictions.contains(AccessRestrictions::ENCRYPTION_REQUIRED)
            && mode != SecurityMode::SignAndEncrypt
            && !secure_transport
        {
            return Err(StatusCode::BadSecurityModeInsufficient);
        }
        Ok(())
    }

    /// The role gate on its own.
    ///
    /// With neither list configured the gate passes. With one list, that list
    /// is used as is; with both, the bits are intersected per role id.
    pub fn validate_role_permissions(
        granted_roles: &[NodeId],
        requested: PermissionType,
        role_permissions: Option<&Vec<RolePermission>>,
        user_role_permissions: Option<&Vec<RolePermission>>,
    ) -> Result<(), StatusCode> {
        if role_permissions.is_none() && user_role_permissions.is_none() {
            return Ok(());
        }
        let allowed = granted_roles.iter().any(|role| {
            Self::role_bits(role, role_permissions, user_role_permissions).contains(requested)
        });
        if allowed {
            Ok(())
        } else {
            Err(StatusCode::BadUserAccessDenied)
        }
    }

    /// Union of the intersected bits over every role granted to the session.
    #[must_use]
    pub fn effective_permissions(&self, session: &Session, node_id: &NodeId, snapshot: &PermissionSnapshot) -> PermissionType {
        if session.is_system() {
            return PermissionType::all();
        }
        let namespace = self.namespace_metadata(node_id.namespace);
        let namespace = namespace.as_ref();
        let roles = snapshot
            .role_permissions
            .as_ref()
            .or_else(|| namespace.and_then(|n| n.default_role_permissions.as_ref()));
        let user_roles = snapshot
            .user_role_permissions
            .as_ref()
            .or_else(|| namespace.and_then(|n| n.default_user_role_permissions.as_ref()));
        if roles.is_none() && user_roles.is_none() {
            return PermissionType::all();
        }
        session
            .granted_roles()
            .iter()
            .fold(PermissionType::empty(), |acc, role| acc | Self::role_bits(role, roles, user_roles))
    }

    fn role_bits(
        role: &NodeId,
        role_permissions: Option<&Vec<RolePermission>>,
        user_role_permissions: Option<&Vec<RolePermission>>,
    ) -> PermissionType {
        let lookup = |list: &Vec<RolePermission>| {
            list.iter()
                .filter(|rp| &rp.role_id == role)
                .fold(PermissionType::empty(), |acc, rp| acc | rp.permissions)
        };
        match (role_permissions, user_role_permissions) {
            (Some(node), Some(user)) => lookup(node) & lookup(user),
            (Some(only), None) | (None, Some(only)) => lookup(only),
            (None, None) => PermissionType::all(),
        }
    }
}

fn lock_err(context: &'static str) -> StatusCode {
    tracing::error!(context, "poisoned lock");
    StatusCode::BadInternalError
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator() -> NodeId {
        NodeId::string(1, "Operator")
    }

    fn observer() -> NodeId {
        NodeId::string(1, "Observer")
    }

    fn session_with(roles: Vec<NodeId>, mode: SecurityMode) -> Session {
        Session::builder().security_mode(mode).granted_roles(roles).build()
    }

    #[test]
    fn no_role_configuration_allows_everything() {
        let validator = PermissionValidator::new();
        let session = session_with(vec![], SecurityMode::None);
        let node = NodeId::numeric(2, 1);
        assert!(validator
            .validate(&session, OperationType::Write, &node, &PermissionSnapshot::default())
            .is_ok());
    }

    #[test]
    fn role_gate_uses_intersection() {
        let node_perms = vec![RolePermission::new(
            operator(),
            PermissionType::BROWSE | PermissionType::READ | PermissionType::WRITE,
        )];
        let user_perms = vec![RolePermission::new(operator(), PermissionType::BROWSE | PermissionType::READ)];
        let granted = [operator()];

        assert!(PermissionValidator::validate_role_permissions(
            &granted,
            PermissionType::READ,
            Some(&node_perms),
            Some(&user_perms)
        )
        .is_ok());
        assert_eq!(
            PermissionValidator::validate_role_permissions(
                &granted,
                PermissionType::WRITE,
                Some(&node_perms),
                Some(&user_perms)
            ),
            Err(StatusCode::BadUserAccessDenied)
        );
    }

    #[test]
    fn role_gate_requires_a_granted_role() {
        let node_perms = vec![RolePermission::new(operator(), PermissionType::all())];
        assert_eq!(
            PermissionValidator::validate_role_permissions(
                &[observer()],
                PermissionType::BROWSE,
                Some(&node_perms),
                None
            ),
            Err(StatusCode::BadUserAccessDenied)
        );
    }

    #[test]
    fn namespace_defaults_apply_when_node_is_silent() {
        let validator = PermissionValidator::new();
        validator
            .set_namespace_metadata(
                2,
                NamespaceMetadata {
                    namespace_uri: "urn:plant".to_string(),
                    default_role_permissions: Some(vec![RolePermission::new(observer(), PermissionType::BROWSE)]),
                    ..NamespaceMetadata::default()
                },
            )
            .unwrap();
        let session = session_with(vec![observer()], SecurityMode::None);
        let node = NodeId::numeric(2, 9);
        let snapshot = PermissionSnapshot::default();
        assert!(validator.validate(&session, OperationType::Browse, &node, &snapshot).is_ok());
        assert_eq!(
            validator.validate(&session, OperationType::Read, &node, &snapshot),
            Err(StatusCode::BadUserAccessDenied)
        );
        assert_eq!(validator.effective_permissions(&session, &node, &snapshot), PermissionType::BROWSE);
    }

    #[test]
    fn encryption_required_rejects_signed_channel() {
        let signed = session_with(vec![], SecurityMode::Sign);
        let encrypted = session_with(vec![], SecurityMode::SignAndEncrypt);
        let restrictions = AccessRestrictions::ENCRYPTION_REQUIRED;
        assert_eq!(
            PermissionValidator::validate_access_restrictions(&signed, OperationType::Read, restrictions),
            Err(StatusCode::BadSecurityModeInsufficient)
        );
        assert!(
            PermissionValidator::validate_access_restrictions(&encrypted, OperationType::Read, restrictions).is_ok()
        );
    }

    #[test]
    fn browse_is_exempt_unless_flagged() {
        let plain = session_with(vec![], SecurityMode::None);
        let restrictions = AccessRestrictions::SIGNING_REQUIRED;
        assert!(PermissionValidator::validate_access_restrictions(&plain, OperationType::Browse, restrictions).is_ok());
        assert_eq!(
            PermissionValidator::validate_access_restrictions(
                &plain,
                OperationType::Browse,
                restrictions | AccessRestrictions::APPLY_RESTRICTIONS_TO_BROWSE
            ),
            Err(StatusCode::BadSecurityModeInsufficient)
        );
    }

    #[test]
    fn system_session_bypasses_both_gates() {
        let validator = PermissionValidator::new();
        let snapshot = PermissionSnapshot {
            access_restrictions: Some(AccessRestrictions::ENCRYPTION_REQUIRED),
            role_permissions: Some(vec![]),
            user_role_permissions: None,
        };
        let system = Session::system();
        assert!(validator
            .validate(&system, OperationType::Write, &NodeId::numeric(2, 1), &snapshot)
            .is_ok());
    }
}
