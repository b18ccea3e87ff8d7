//! Node records and their attributes.
//!
//! A `Node` is owned by exactly one node manager and lives in that manager's
//! graph arena. References are stored on the source node and point at their
//! targets by id only.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::node_id::{ids, ExpandedNodeId, LocalizedText, NodeId, QualifiedName};
use crate::security::{AccessRestrictions, RolePermission};
use crate::status::StatusCode;
use crate::value::{DataValue, NumericRange, Variant};

/// The class of a node. Discriminants are the browse node-class mask bits.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeClass {
    Object = 1,
    Variable = 2,
    Method = 4,
    ObjectType = 8,
    VariableType = 16,
    ReferenceType = 32,
    DataType = 64,
    View = 128,
}

impl NodeClass {
    /// The mask bit of this class.
    #[must_use]
    pub const fn mask(self) -> u32 {
        self as u32
    }

    /// A zero mask selects every class.
    #[must_use]
    pub const fn matches_mask(self, mask: u32) -> bool {
        mask == 0 || mask & self.mask() != 0
    }

    /// Returns true for the type classes.
    #[must_use]
    pub const fn is_type(self) -> bool {
        matches!(
            self,
            Self::ObjectType | Self::VariableType | Self::ReferenceType | Self::DataType
        )
    }
}

/// Node attribute identifiers.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeId {
    NodeId = 1,
    NodeClass = 2,
    BrowseName = 3,
    DisplayName = 4,
    Description = 5,
    WriteMask = 6,
    UserWriteMask = 7,
    IsAbstract = 8,
    Symmetric = 9,
    InverseName = 10,
    ContainsNoLoops = 11,
    EventNotifier = 12,
    Value = 13,
    DataType = 14,
    ValueRank = 15,
    ArrayDimensions = 16,
    AccessLevel = 17,
    UserAccessLevel = 18,
    MinimumSamplingInterval = 19,
    Historizing = 20,
    Executable = 21,
    UserExecutable = 22,
    DataTypeDefinition = 23,
    RolePermissions = 24,
    UserRolePermissions = 25,
    AccessRestrictions = 26,
}

impl AttributeId {
    /// Resolves a raw attribute id.
    #[must_use]
    pub const fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::NodeId,
            2 => Self::NodeClass,
            3 => Self::BrowseName,
            4 => Self::DisplayName,
            5 => Self::Description,
            6 => Self::WriteMask,
            7 => Self::UserWriteMask,
            8 => Self::IsAbstract,
            9 => Self::Symmetric,
            10 => Self::InverseName,
            11 => Self::ContainsNoLoops,
            12 => Self::EventNotifier,
            13 => Self::Value,
            14 => Self::DataType,
            15 => Self::ValueRank,
            16 => Self::ArrayDimensions,
            17 => Self::AccessLevel,
            18 => Self::UserAccessLevel,
            19 => Self::MinimumSamplingInterval,
            20 => Self::Historizing,
            21 => Self::Executable,
            22 => Self::UserExecutable,
            23 => Self::DataTypeDefinition,
            24 => Self::RolePermissions,
            25 => Self::UserRolePermissions,
            26 => Self::AccessRestrictions,
            _ => return None,
        })
    }

    /// The write-mask bit guarding this attribute, if it has one.
    #[must_use]
    pub const fn write_mask_bit(self) -> Option<WriteMask> {
        Some(match self {
            Self::AccessLevel => WriteMask::ACCESS_LEVEL,
            Self::ArrayDimensions => WriteMask::ARRAY_DIMENSIONS,
            Self::BrowseName => WriteMask::BROWSE_NAME,
            Self::ContainsNoLoops => WriteMask::CONTAINS_NO_LOOPS,
            Self::DataType => WriteMask::DATA_TYPE,
            Self::Description => WriteMask::DESCRIPTION,
            Self::DisplayName => WriteMask::DISPLAY_NAME,
            Self::EventNotifier => WriteMask::EVENT_NOTIFIER,
            Self::Executable => WriteMask::EXECUTABLE,
            Self::Historizing => WriteMask::HISTORIZING,
            Self::InverseName => WriteMask::INVERSE_NAME,
            Self::IsAbstract => WriteMask::IS_ABSTRACT,
            Self::MinimumSamplingInterval => WriteMask::MINIMUM_SAMPLING_INTERVAL,
            Self::Symmetric => WriteMask::SYMMETRIC,
            Self::UserAccessLevel => WriteMask::USER_ACCESS_LEVEL,
            Self::UserExecutable => WriteMask::USER_EXECUTABLE,
            Self::ValueRank => WriteMask::VALUE_RANK,
            Self::WriteMask => WriteMask::WRITE_MASK,
            Self::RolePermissions => WriteMask::ROLE_PERMISSIONS,
            Self::AccessRestrictions => WriteMask::ACCESS_RESTRICTIONS,
            _ => return None,
        })
    }
}

bitflags! {
    /// Variable access level bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AccessLevel: u8 {
        const CURRENT_READ = 1;
        const CURRENT_WRITE = 1 << 1;
        const HISTORY_READ = 1 << 2;
        const HISTORY_WRITE = 1 << 3;
    }
}

bitflags! {
    /// Object/View event notifier bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EventNotifier: u8 {
        const SUBSCRIBE_TO_EVENTS = 1;
        const HISTORY_READ = 1 << 2;
        const HISTORY_WRITE = 1 << 3;
    }
}

bitflags! {
    /// Which non-value attributes a client may write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct WriteMask: u32 {
        const ACCESS_LEVEL = 1;
        const ARRAY_DIMENSIONS = 1 << 1;
        const BROWSE_NAME = 1 << 2;
        const CONTAINS_NO_LOOPS = 1 << 3;
        const DATA_TYPE = 1 << 4;
        const DESCRIPTION = 1 << 5;
        const DISPLAY_NAME = 1 << 6;
        const EVENT_NOTIFIER = 1 << 7;
        const EXECUTABLE = 1 << 8;
        const HISTORIZING = 1 << 9;
        const INVERSE_NAME = 1 << 10;
        const IS_ABSTRACT = 1 << 11;
        const MINIMUM_SAMPLING_INTERVAL = 1 << 12;
        const NODE_CLASS = 1 << 13;
        const NODE_ID = 1 << 14;
        const SYMMETRIC = 1 << 15;
        const USER_ACCESS_LEVEL = 1 << 16;
        const USER_EXECUTABLE = 1 << 17;
        const USER_WRITE_MASK = 1 << 18;
        const VALUE_RANK = 1 << 19;
        const WRITE_MASK = 1 << 20;
        const VALUE_FOR_VARIABLE_TYPE = 1 << 21;
        const ROLE_PERMISSIONS = 1 << 23;
        const ACCESS_RESTRICTIONS = 1 << 24;
    }
}

/// A directed edge stored on its source node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Reference type node id.
    pub reference_type_id: NodeId,
    /// True when the edge points from target to source.
    pub is_inverse: bool,
    /// Target, possibly remote.
    pub target_id: ExpandedNodeId,
}

impl Reference {
    /// A forward reference to a local target.
    #[must_use]
    pub fn forward(reference_type_id: NodeId, target: NodeId) -> Self {
        Self {
            reference_type_id,
            is_inverse: false,
            target_id: ExpandedNodeId::local(target),
        }
    }

    /// An inverse reference to a local target.
    #[must_use]
    pub fn inverse(reference_type_id: NodeId, target: NodeId) -> Self {
        Self {
            reference_type_id,
            is_inverse: true,
            target_id: ExpandedNodeId::local(target),
        }
    }

    /// The same edge seen from the other end.
    #[must_use]
    pub fn mirrored(&self, source: &NodeId) -> Self {
        Self {
            reference_type_id: self.reference_type_id.clone(),
            is_inverse: !self.is_inverse,
            target_id: ExpandedNodeId::local(source.clone()),
        }
    }
}

/// Class-specific attributes of a variable.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableAttributes {
    pub value: DataValue,
    pub data_type: NodeId,
    pub value_rank: i32,
    pub access_level: AccessLevel,
    pub user_access_level: AccessLevel,
    /// Milliseconds; 0 means the value changes are reported by exception.
    pub minimum_sampling_interval: f64,
    pub historizing: bool,
}

impl Default for VariableAttributes {
    fn default() -> Self {
        Self {
            value: DataValue::default(),
            data_type: ids::BASE_DATA_TYPE,
            value_rank: -1,
            access_level: AccessLevel::CURRENT_READ,
            user_access_level: AccessLevel::CURRENT_READ,
            minimum_sampling_interval: 0.0,
            historizing: false,
        }
    }
}

/// Class-specific attributes.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum NodeAttributes {
    Object {
        event_notifier: EventNotifier,
    },
    Variable(VariableAttributes),
    Method {
        executable: bool,
        user_executable: bool,
    },
    ObjectType {
        is_abstract: bool,
    },
    VariableType {
        value: Variant,
        data_type: NodeId,
        value_rank: i32,
        is_abstract: bool,
    },
    ReferenceType {
        is_abstract: bool,
        symmetric: bool,
        inverse_name: Option<LocalizedText>,
    },
    DataType {
        is_abstract: bool,
    },
    View {
        contains_no_loops: bool,
        event_notifier: EventNotifier,
    },
}

impl NodeAttributes {
    /// The node class these attributes belong to.
    #[must_use]
    pub const fn node_class(&self) -> NodeClass {
        match self {
            Self::Object { .. } => NodeClass::Object,
            Self::Variable(_) => NodeClass::Variable,
            Self::Method { .. } => NodeClass::Method,
            Self::ObjectType { .. } => NodeClass::ObjectType,
            Self::VariableType { .. } => NodeClass::VariableType,
            Self::ReferenceType { .. } => NodeClass::ReferenceType,
            Self::DataType { .. } => NodeClass::DataType,
            Self::View { .. } => NodeClass::View,
        }
    }
}

/// A node record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Identity.
    pub node_id: NodeId,
    /// Browse name.
    pub browse_name: QualifiedName,
    /// Display name.
    pub display_name: LocalizedText,
    /// Optional description.
    pub description: Option<LocalizedText>,
    /// Writable non-value attributes.
    pub write_mask: WriteMask,
    /// Class-specific attributes.
    pub attributes: NodeAttributes,
    /// Node-level role permissions; namespace defaults apply when absent.
    pub role_permissions: Option<Vec<RolePermission>>,
    /// Node-level user role permissions.
    pub user_role_permissions: Option<Vec<RolePermission>>,
    /// Node-level access restrictions.
    pub access_restrictions: Option<AccessRestrictions>,
    /// Outgoing and incoming edges, in insertion order.
    pub references: Vec<Reference>,
}

impl Node {
    /// Creates a node with the given class attributes.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        browse_name: impl Into<QualifiedName>,
        display_name: impl Into<LocalizedText>,
        attributes: NodeAttributes,
    ) -> Self {
        Self {
            node_id,
            browse_name: browse_name.into(),
            display_name: display_name.into(),
            description: None,
            write_mask: WriteMask::empty(),
            attributes,
            role_permissions: None,
            user_role_permissions: None,
            access_restrictions: None,
            references: Vec::new(),
        }
    }

    /// An object node that does not notify events.
    #[must_use]
    pub fn object(
        node_id: NodeId,
        browse_name: impl Into<QualifiedName>,
        display_name: impl Into<LocalizedText>,
    ) -> Self {
        Self::new(
            node_id,
            browse_name,
            display_name,
            NodeAttributes::Object {
                event_notifier: EventNotifier::empty(),
            },
        )
    }

    /// A readable variable holding `value`.
    #[must_use]
    pub fn variable(
        node_id: NodeId,
        browse_name: impl Into<QualifiedName>,
        display_name: impl Into<LocalizedText>,
        data_type: NodeId,
        value: impl Into<Variant>,
    ) -> Self {
        Self::new(
            node_id,
            browse_name,
            display_name,
            NodeAttributes::Variable(VariableAttributes {
                value: DataValue::new(value),
                data_type,
                ..VariableAttributes::default()
            }),
        )
    }

    /// An executable method.
    #[must_use]
    pub fn method(
        node_id: NodeId,
        browse_name: impl Into<QualifiedName>,
        display_name: impl Into<LocalizedText>,
    ) -> Self {
        Self::new(
            node_id,
            browse_name,
            display_name,
            NodeAttributes::Method {
                executable: true,
                user_executable: true,
            },
        )
    }

    /// An object type.
    #[must_use]
    pub fn object_type(
        node_id: NodeId,
        browse_name: impl Into<QualifiedName>,
        is_abstract: bool,
    ) -> Self {
        let browse_name = browse_name.into();
        let display = LocalizedText::new(browse_name.name.clone());
        Self::new(node_id, browse_name, display, NodeAttributes::ObjectType { is_abstract })
    }

    /// A variable type.
    #[must_use]
    pub fn variable_type(
        node_id: NodeId,
        browse_name: impl Into<QualifiedName>,
        data_type: NodeId,
        is_abstract: bool,
    ) -> Self {
        let browse_name = browse_name.into();
        let display = LocalizedText::new(browse_name.name.clone());
        Self::new(
            node_id,
            browse_name,
            display,
            NodeAttributes::VariableType {
                value: Variant::Empty,
                data_type,
                value_rank: -1,
                is_abstract,
            },
        )
    }

    /// A reference type.
    #[must_use]
    pub fn reference_type(
        node_id: NodeId,
        browse_name: impl Into<QualifiedName>,
        is_abstract: bool,
        symmetric: bool,
        inverse_name: Option<&str>,
    ) -> Self {
        let browse_name = browse_name.into();
        let display = LocalizedText::new(browse_name.name.clone());
        Self::new(
            node_id,
            browse_name,
            display,
            NodeAttributes::ReferenceType {
                is_abstract,
                symmetric,
                inverse_name: inverse_name.map(LocalizedText::new),
            },
        )
    }

    /// A data type.
    #[must_use]
    pub fn data_type(node_id: NodeId, browse_name: impl Into<QualifiedName>, is_abstract: bool) -> Self {
        let browse_name = browse_name.into();
        let display = LocalizedText::new(browse_name.name.clone());
        Self::new(node_id, browse_name, display, NodeAttributes::DataType { is_abstract })
    }

    /// A view.
    #[must_use]
    pub fn view(
        node_id: NodeId,
        browse_name: impl Into<QualifiedName>,
        display_name: impl Into<LocalizedText>,
    ) -> Self {
        Self::new(
            node_id,
            browse_name,
            display_name,
            NodeAttributes::View {
                contains_no_loops: true,
                event_notifier: EventNotifier::empty(),
            },
        )
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<LocalizedText>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub const fn with_write_mask(mut self, write_mask: WriteMask) -> Self {
        self.write_mask = write_mask;
        self
    }

    #[must_use]
    pub fn with_role_permissions(mut self, permissions: Vec<RolePermission>) -> Self {
        self.role_permissions = Some(permissions);
        self
    }

    #[must_use]
    pub fn with_user_role_permissions(mut self, permissions: Vec<RolePermission>) -> Self {
        self.user_role_permissions = Some(permissions);
        self
    }

    #[must_use]
    pub const fn with_access_restrictions(mut self, restrictions: AccessRestrictions) -> Self {
        self.access_restrictions = Some(restrictions);
        self
    }

    /// Sets the event notifier on objects and views.
    #[must_use]
    pub fn with_event_notifier(mut self, notifier: EventNotifier) -> Self {
        match &mut self.attributes {
            NodeAttributes::Object { event_notifier }
            | NodeAttributes::View { event_notifier, .. } => *event_notifier = notifier,
            _ => {}
        }
        self
    }

    /// Sets both access levels of a variable.
    #[must_use]
    pub fn with_access_level(mut self, level: AccessLevel) -> Self {
        if let NodeAttributes::Variable(v) = &mut self.attributes {
            v.access_level = level;
            v.user_access_level = level;
        }
        self
    }

    /// Sets a variable's minimum sampling interval in milliseconds.
    #[must_use]
    pub fn with_minimum_sampling_interval(mut self, interval_ms: f64) -> Self {
        if let NodeAttributes::Variable(v) = &mut self.attributes {
            v.minimum_sampling_interval = interval_ms;
        }
        self
    }

    /// Sets a variable's historizing flag.
    #[must_use]
    pub fn with_historizing(mut self, historizing: bool) -> Self {
        if let NodeAttributes::Variable(v) = &mut self.attributes {
            v.historizing = historizing;
            if historizing {
                v.access_level |= AccessLevel::HISTORY_READ;
                v.user_access_level |= AccessLevel::HISTORY_READ;
            }
        }
        self
    }

    /// Appends a reference.
    #[must_use]
    pub fn with_reference(mut self, reference: Reference) -> Self {
        self.add_reference(reference);
        self
    }

    /// The node class.
    #[must_use]
    pub const fn node_class(&self) -> NodeClass {
        self.attributes.node_class()
    }

    /// The variable attributes, if this is a variable.
    #[must_use]
    pub const fn as_variable(&self) -> Option<&VariableAttributes> {
        match &self.attributes {
            NodeAttributes::Variable(v) => Some(v),
            _ => None,
        }
    }

    /// The event notifier of an object or view.
    #[must_use]
    pub const fn event_notifier(&self) -> Option<EventNotifier> {
        match &self.attributes {
            NodeAttributes::Object { event_notifier }
            | NodeAttributes::View { event_notifier, .. } => Some(*event_notifier),
            _ => None,
        }
    }

    /// Target of the forward HasTypeDefinition reference.
    #[must_use]
    pub fn type_definition(&self) -> Option<&NodeId> {
        self.forward_target(&ids::HAS_TYPE_DEFINITION)
    }

    /// Target of the forward HasModellingRule reference.
    #[must_use]
    pub fn modelling_rule(&self) -> Option<&NodeId> {
        self.forward_target(&ids::HAS_MODELLING_RULE)
    }

    fn forward_target(&self, reference_type_id: &NodeId) -> Option<&NodeId> {
        self.references
            .iter()
            .find(|r| !r.is_inverse && &r.reference_type_id == reference_type_id)
            .and_then(|r| r.target_id.as_local())
    }

    /// Adds a reference unless an identical one already exists.
    pub fn add_reference(&mut self, reference: Reference) -> bool {
        if self.references.contains(&reference) {
            return false;
        }
        self.references.push(reference);
        true
    }

    /// Removes a matching reference; returns whether one was removed.
    pub fn remove_reference(
        &mut self,
        reference_type_id: &NodeId,
        is_inverse: bool,
        target_id: &ExpandedNodeId,
    ) -> bool {
        let before = self.references.len();
        self.references.retain(|r| {
            !(r.is_inverse == is_inverse
                && &r.reference_type_id == reference_type_id
                && &r.target_id == target_id)
        });
        self.references.len() != before
    }

    /// Removes every edge pointing at `target`; returns how many were removed.
    pub fn remove_references_to(&mut self, target: &NodeId) -> usize {
        let before = self.references.len();
        self.references
            .retain(|r| r.target_id.as_local() != Some(target));
        before - self.references.len()
    }

    /// Reads an attribute.
    ///
    /// Failures are reported in the returned value's status so the caller can
    /// hand the result back unchanged.
    #[must_use]
    pub fn read(&self, attribute: AttributeId, range: Option<&NumericRange>) -> DataValue {
        match self.read_attribute(attribute, range) {
            Ok(value) => value,
            Err(status) => DataValue::bad(status),
        }
    }

    fn read_attribute(
        &self,
        attribute: AttributeId,
        range: Option<&NumericRange>,
    ) -> Result<DataValue, StatusCode> {
        if attribute == AttributeId::Value {
            let value = match &self.attributes {
                NodeAttributes::Variable(v) => {
                    if !v.access_level.contains(AccessLevel::CURRENT_READ) {
                        return Err(StatusCode::BadNotReadable);
                    }
                    v.value.clone()
                }
                NodeAttributes::VariableType { value, .. } => DataValue::new(value.clone()),
                _ => return Err(StatusCode::BadAttributeIdInvalid),
            };
            return match range {
                None => Ok(value),
                Some(range) => {
                    let ranged = value.value.apply_range(range)?;
                    Ok(DataValue { value: ranged, ..value })
                }
            };
        }
        if range.is_some() {
            return Err(StatusCode::BadIndexRangeInvalid);
        }
        let variant = self.attribute_variant(attribute)?;
        Ok(DataValue::new(variant))
    }

    fn attribute_variant(&self, attribute: AttributeId) -> Result<Variant, StatusCode> {
        let invalid = Err(StatusCode::BadAttributeIdInvalid);
        let v = match (attribute, &self.attributes) {
            (AttributeId::NodeId, _) => Variant::NodeId(self.node_id.clone()),
            (AttributeId::NodeClass, _) => Variant::Int32(self.node_class() as i32),
            (AttributeId::BrowseName, _) => Variant::QualifiedName(self.browse_name.clone()),
            (AttributeId::DisplayName, _) => Variant::LocalizedText(self.display_name.clone()),
            (AttributeId::Description, _) => self
                .description
                .clone()
                .map_or(Variant::Empty, Variant::LocalizedText),
            (AttributeId::WriteMask | AttributeId::UserWriteMask, _) => {
                Variant::UInt32(self.write_mask.bits())
            }
            (AttributeId::RolePermissions, _) => permissions_variant(self.role_permissions.as_ref())?,
            (AttributeId::UserRolePermissions, _) => {
                permissions_variant(self.user_role_permissions.as_ref())?
            }
            (AttributeId::AccessRestrictions, _) => Variant::UInt32(u32::from(
                self.access_restrictions.map_or(0, |r| r.bits()),
            )),
            (AttributeId::IsAbstract, NodeAttributes::ObjectType { is_abstract })
            | (AttributeId::IsAbstract, NodeAttributes::VariableType { is_abstract, .. })
            | (AttributeId::IsAbstract, NodeAttributes::ReferenceType { is_abstract, .. })
            | (AttributeId::IsAbstract, NodeAttributes::DataType { is_abstract }) => {
                Variant::Boolean(*is_abstract)
            }
            (AttributeId::Symmetric, NodeAttributes::ReferenceType { symmetric, .. }) => {
                Variant::Boolean(*symmetric)
            }
            (AttributeId::InverseName, NodeAttributes::ReferenceType { inverse_name, .. }) => {
                inverse_name.clone().map_or(Variant::Empty, Variant::LocalizedText)
            }
            (AttributeId::ContainsNoLoops, NodeAttributes::View { contains_no_loops, .. }) => {
                Variant::Boolean(*contains_no_loops)
            }
            (AttributeId::EventNotifier, NodeAttributes::Object { event_notifier })
            | (AttributeId::EventNotifier, NodeAttributes::View { event_notifier, .. }) => {
                Variant::UInt32(u32::from(event_notifier.bits()))
            }
            (AttributeId::DataType, NodeAttributes::Variable(v)) => Variant::NodeId(v.data_type.clone()),
            (AttributeId::DataType, NodeAttributes::VariableType { data_type, .. }) => {
                Variant::NodeId(data_type.clone())
            }
            (AttributeId::ValueRank, NodeAttributes::Variable(v)) => Variant::Int32(v.value_rank),
            (AttributeId::ValueRank, NodeAttributes::VariableType { value_rank, .. }) => {
                Variant::Int32(*value_rank)
            }
            (AttributeId::ArrayDimensions, NodeAttributes::Variable(_) | NodeAttributes::VariableType { .. }) => {
                Variant::Empty
            }
            (AttributeId::AccessLevel, NodeAttributes::Variable(v)) => {
                Variant::UInt32(u32::from(v.access_level.bits()))
            }
            (AttributeId::UserAccessLevel, NodeAttributes::Variable(v)) => {
                Variant::UInt32(u32::from(v.user_access_level.bits()))
            }
            (AttributeId::MinimumSamplingInterval, NodeAttributes::Variable(v)) => {
                Variant::Double(v.minimum_sampling_interval)
            }
            (AttributeId::Historizing, NodeAttributes::Variable(v)) => Variant::Boolean(v.historizing),
            (AttributeId::Executable, NodeAttributes::Method { executable, .. }) => {
                Variant::Boolean(*executable)
            }
            (AttributeId::UserExecutable, NodeAttributes::Method { user_executable, .. }) => {
                Variant::Boolean(*user_executable)
            }
            _ => return invalid,
        };
        Ok(v)
    }

    /// Writes an attribute.
    ///
    /// The Value attribute is governed by the access level; every other
    /// attribute by the write mask.
    pub fn write(
        &mut self,
        attribute: AttributeId,
        value: &DataValue,
        range: Option<&NumericRange>,
    ) -> Result<(), StatusCode> {
        if attribute == AttributeId::Value {
            return self.write_value(value, range);
        }
        if range.is_some() {
            return Err(StatusCode::BadIndexRangeInvalid);
        }
        let bit = attribute.write_mask_bit().ok_or(StatusCode::BadNotWritable)?;
        if !self.write_mask.contains(bit) {
            return Err(StatusCode::BadNotWritable);
        }
        let mismatch = StatusCode::BadTypeMismatch;
        match (attribute, &value.value, &mut self.attributes) {
            (AttributeId::DisplayName, Variant::LocalizedText(t), _) => self.display_name = t.clone(),
            (AttributeId::Description, Variant::LocalizedText(t), _) => {
                self.description = Some(t.clone());
            }
            (AttributeId::BrowseName, Variant::QualifiedName(q), _) => self.browse_name = q.clone(),
            (AttributeId::WriteMask, Variant::UInt32(bits), _) => {
                self.write_mask = WriteMask::from_bits_truncate(*bits);
            }
            (AttributeId::RolePermissions, Variant::Structured(json), _) => {
                let list: Vec<RolePermission> =
                    serde_json::from_value(json.clone()).map_err(|_| mismatch)?;
                self.role_permissions = Some(list);
            }
            (AttributeId::AccessRestrictions, Variant::UInt32(bits), _) => {
                let bits = u16::try_from(*bits).map_err(|_| mismatch)?;
                self.access_restrictions = Some(AccessRestrictions::from_bits_truncate(bits));
            }
            (AttributeId::EventNotifier, Variant::UInt32(bits), NodeAttributes::Object { event_notifier })
            | (
                AttributeId::EventNotifier,
                Variant::UInt32(bits),
                NodeAttributes::View { event_notifier, .. },
            ) => {
                let bits = u8::try_from(*bits).map_err(|_| mismatch)?;
                *event_notifier = EventNotifier::from_bits_truncate(bits);
            }
            (AttributeId::AccessLevel, Variant::UInt32(bits), NodeAttributes::Variable(v)) => {
                let bits = u8::try_from(*bits).map_err(|_| mismatch)?;
                v.access_level = AccessLevel::from_bits_truncate(bits);
            }
            (AttributeId::UserAccessLevel, Variant::UInt32(bits), NodeAttributes::Variable(v)) => {
                let bits = u8::try_from(*bits).map_err(|_| mismatch)?;
                v.user_access_level = AccessLevel::from_bits_truncate(bits);
            }
            (AttributeId::MinimumSamplingInterval, Variant::Double(ms), NodeAttributes::Variable(v)) => {
                v.minimum_sampling_interval = *ms;
            }
            (AttributeId::Historizing, Variant::Boolean(b), NodeAttributes::Variable(v)) => {
                v.historizing = *b;
            }
            (AttributeId::Executable, Variant::Boolean(b), NodeAttributes::Method { executable, .. }) => {
                *executable = *b;
            }
            (AttributeId::IsAbstract, Variant::Boolean(b), NodeAttributes::ObjectType { is_abstract })
            | (AttributeId::IsAbstract, Variant::Boolean(b), NodeAttributes::DataType { is_abstract }) => {
                *is_abstract = *b;
            }
            (_, _, attrs) => {
                // Right attribute for the class but wrong value type.
                return if self_has_attribute(attrs, attribute) {
                    Err(mismatch)
                } else {
                    Err(StatusCode::BadAttributeIdInvalid)
                };
            }
        }
        Ok(())
    }

    fn write_value(&mut self, value: &DataValue, range: Option<&NumericRange>) -> Result<(), StatusCode> {
        let NodeAttributes::Variable(v) = &mut self.attributes else {
            return Err(StatusCode::BadAttributeIdInvalid);
        };
        if !v.access_level.contains(AccessLevel::CURRENT_WRITE) {
            return Err(StatusCode::BadNotWritable);
        }
        match range {
            None => {
                if !v.value.value.is_empty()
                    && !value.value.is_empty()
                    && !v.value.value.same_type(&value.value)
                {
                    return Err(StatusCode::BadTypeMismatch);
                }
                v.value = stamped(value);
            }
            Some(range) => {
                let (Variant::Array(current), Variant::Array(patch)) = (&mut v.value.value, &value.value) else {
                    return Err(StatusCode::BadIndexRangeInvalid);
                };
                let start = range.start as usize;
                let end = range.end.map_or(start, |e| e as usize);
                if end >= current.len() {
                    return Err(StatusCode::BadIndexRangeNoData);
                }
                if patch.len() != end - start + 1 {
                    return Err(StatusCode::BadIndexRangeInvalid);
                }
                current[start..=end].clone_from_slice(patch);
                v.value.status = value.status;
                v.value.source_timestamp = value.source_timestamp.or(v.value.source_timestamp);
                v.value.server_timestamp = Some(chrono::Utc::now());
            }
        }
        Ok(())
    }
}

fn stamped(value: &DataValue) -> DataValue {
    let now = chrono::Utc::now();
    DataValue {
        value: value.value.clone(),
        status: value.status,
        source_timestamp: value.source_timestamp.or(Some(now)),
        server_timestamp: Some(now),
    }
}

fn self_has_attribute(attrs: &NodeAttributes, attribute: AttributeId) -> bool {
    matches!(
        (attribute, attrs),
        (
            AttributeId::DisplayName
                | AttributeId::Description
                | AttributeId::BrowseName
                | AttributeId::WriteMask
                | AttributeId::RolePermissions
                | AttributeId::AccessRestrictions,
            _
        ) | (
            AttributeId::EventNotifier,
            NodeAttributes::Object { .. } | NodeAttributes::View { .. }
        ) | (
            AttributeId::AccessLevel
                | AttributeId::UserAccessLevel
                | AttributeId::MinimumSamplingInterval
                | AttributeId::Historizing,
            NodeAttributes::Variable(_)
        ) | (AttributeId::Executable, NodeAttributes::Method { .. })
            | (
                AttributeId::IsAbstract,
                NodeAttributes::ObjectType { .. } | NodeAttributes::DataType { .. }
            )
    )
}

fn permissions_variant(permissions: Option<&Vec<RolePermission>>) -> Result<Variant, StatusCode> {
    match permissions {
        None => Ok(Variant::Empty),
        Some(list) => serde_json::to_value(list)
            .map(Variant::Structured)
            .map_err(|_| StatusCode::BadInternalError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::PermissionType;

    fn temperature() -> Node {
        Node::variable(NodeId::string(2, "temp"), "Temperature", "Temperature", ids::DOUBLE, 20.0)
    }

    #[test]
    fn node_class_mask() {
        assert!(NodeClass::Variable.matches_mask(0));
        assert!(NodeClass::Variable.matches_mask(NodeClass::Variable.mask() | NodeClass::Object.mask()));
        assert!(!NodeClass::Method.matches_mask(NodeClass::Object.mask()));
    }

    #[test]
    fn read_value_and_metadata() {
        let node = temperature();
        assert_eq!(node.read(AttributeId::Value, None).value, Variant::Double(20.0));
        assert_eq!(
            node.read(AttributeId::BrowseName, None).value,
            Variant::QualifiedName(QualifiedName::from("Temperature"))
        );
        assert_eq!(
            node.read(AttributeId::Executable, None).status,
            StatusCode::BadAttributeIdInvalid
        );
    }

    #[test]
    fn write_value_requires_access_level() {
        let mut node = temperature();
        assert_eq!(
            node.write(AttributeId::Value, &DataValue::new(21.0), None),
            Err(StatusCode::BadNotWritable)
        );

        let mut node = node.with_access_level(AccessLevel::CURRENT_READ | AccessLevel::CURRENT_WRITE);
        node.write(AttributeId::Value, &DataValue::new(21.0), None).unwrap();
        assert_eq!(node.read(AttributeId::Value, None).value, Variant::Double(21.0));
        assert_eq!(
            node.write(AttributeId::Value, &DataValue::new("hot"), None),
            Err(StatusCode::BadTypeMismatch)
        );
    }

    #[test]
    fn write_array_slice() {
        let mut node = Node::variable(
            NodeId::numeric(2, 1),
            "Samples",
            "Samples",
            ids::INT32,
            Variant::Array(vec![1.into(), 2.into(), 3.into()]),
        )
        .with_access_level(AccessLevel::CURRENT_READ | AccessLevel::CURRENT_WRITE);
        let range = NumericRange::parse("1:2").unwrap();
        node.write(
            AttributeId::Value,
            &DataValue::new(Variant::Array(vec![8.into(), 9.into()])),
            Some(&range),
        )
        .unwrap();
        assert_eq!(
            node.read(AttributeId::Value, None).value,
            Variant::Array(vec![1.into(), 8.into(), 9.into()])
        );
    }

    #[test]
    fn write_mask_gates_non_value_attributes() {
        let mut node = temperature();
        let name = DataValue::new(LocalizedText::new("Boiler temperature"));
        assert_eq!(node.write(AttributeId::DisplayName, &name, None), Err(StatusCode::BadNotWritable));

        let mut node = node.with_write_mask(WriteMask::DISPLAY_NAME);
        node.write(AttributeId::DisplayName, &name, None).unwrap();
        assert_eq!(node.display_name.text, "Boiler temperature");
    }

    #[test]
    fn role_permissions_read_back_as_structured() {
        let node = temperature().with_role_permissions(vec![RolePermission::new(
            NodeId::numeric(0, 15656),
            PermissionType::BROWSE | PermissionType::READ,
        )]);
        let value = node.read(AttributeId::RolePermissions, None).value;
        assert!(matches!(value, Variant::Structured(_)));
    }

    #[test]
    fn references_are_deduplicated() {
        let mut node = Node::object(NodeId::numeric(2, 5), "Pump", "Pump");
        let r = Reference::forward(ids::HAS_TYPE_DEFINITION, ids::BASE_OBJECT_TYPE);
        assert!(node.add_reference(r.clone()));
        assert!(!node.add_reference(r));
        assert_eq!(node.type_definition(), Some(&ids::BASE_OBJECT_TYPE));
        assert_eq!(node.remove_references_to(&ids::BASE_OBJECT_TYPE), 1);
        assert!(node.type_definition().is_none());
    }
}
