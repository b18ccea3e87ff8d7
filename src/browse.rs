//! Browse and TranslateBrowsePath request/result types.

use serde::{Deserialize, Serialize};

use crate::continuation::ContinuationPointId;
use crate::node::NodeClass;
use crate::node_id::{ExpandedNodeId, LocalizedText, NodeId, QualifiedName};

/// Which edge directions a browse follows.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BrowseDirection {
    #[default]
    Forward,
    Inverse,
    Both,
}

impl BrowseDirection {
    /// Returns true when an edge with this orientation is followed.
    #[must_use]
    pub const fn matches(self, is_inverse: bool) -> bool {
        match self {
            Self::Forward => !is_inverse,
            Self::Inverse => is_inverse,
            Self::Both => true,
        }
    }
}

/// One starting node of a browse call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowseDescription {
    /// Node whose references are enumerated.
    pub node_id: NodeId,
    /// Edge direction filter.
    pub browse_direction: BrowseDirection,
    /// Reference type filter; `None` means every type.
    pub reference_type_id: Option<NodeId>,
    /// Also match subtypes of `reference_type_id`.
    pub include_subtypes: bool,
    /// Node class mask of targets; 0 means every class.
    pub node_class_mask: u32,
}

impl BrowseDescription {
    /// Forward browse over every hierarchical reference.
    #[must_use]
    pub fn hierarchical(node_id: NodeId) -> Self {
        Self {
            node_id,
            browse_direction: BrowseDirection::Forward,
            reference_type_id: Some(crate::node_id::ids::HIERARCHICAL_REFERENCES),
            include_subtypes: true,
            node_class_mask: 0,
        }
    }

    /// Browse every reference in the given direction.
    #[must_use]
    pub const fn all(node_id: NodeId, browse_direction: BrowseDirection) -> Self {
        Self {
            node_id,
            browse_direction,
            reference_type_id: None,
            include_subtypes: true,
            node_class_mask: 0,
        }
    }
}

/// A reference returned by browse, with target metadata.
///
/// The metadata fields stay `None` for remote targets.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceDescription {
    pub reference_type_id: NodeId,
    pub is_forward: bool,
    pub node_id: ExpandedNodeId,
    pub browse_name: Option<QualifiedName>,
    pub display_name: Option<LocalizedText>,
    pub node_class: Option<NodeClass>,
    pub type_definition: Option<NodeId>,
}

impl ReferenceDescription {
    /// Returns true once the target's metadata has been resolved.
    #[must_use]
    pub const fn has_metadata(&self) -> bool {
        self.node_class.is_some()
    }
}

/// One page of browse output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowseResult {
    /// References in this page.
    pub references: Vec<ReferenceDescription>,
    /// Set when more references remain.
    pub continuation_point: Option<ContinuationPointId>,
}

/// One hop of a relative path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativePathElement {
    /// Reference type to follow; `None` means any hierarchical reference.
    pub reference_type_id: Option<NodeId>,
    /// Follow the inverse direction.
    pub is_inverse: bool,
    /// Also match subtypes of the reference type.
    pub include_subtypes: bool,
    /// Browse name the hop must reach. May be empty only on the last hop.
    pub target_name: QualifiedName,
}

impl RelativePathElement {
    /// A forward hierarchical hop to `name`.
    #[must_use]
    pub fn child(name: impl Into<QualifiedName>) -> Self {
        Self {
            reference_type_id: Some(crate::node_id::ids::HIERARCHICAL_REFERENCES),
            is_inverse: false,
            include_subtypes: true,
            target_name: name.into(),
        }
    }
}

/// A starting node plus a relative path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrowsePath {
    /// Where the walk starts.
    pub starting_node: NodeId,
    /// Hops.
    pub relative_path: Vec<RelativePathElement>,
}

/// A node reached by a browse path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowsePathTarget {
    /// The node reached.
    pub target_id: ExpandedNodeId,
    /// For remote targets, the index of the first hop not yet followed;
    /// `u32::MAX` when the whole path was resolved.
    pub remaining_path_index: u32,
}

impl BrowsePathTarget {
    /// A fully resolved local target.
    #[must_use]
    pub const fn resolved(target_id: ExpandedNodeId) -> Self {
        Self {
            target_id,
            remaining_path_index: u32::MAX,
        }
    }
}

/// Candidates a manager found for one hop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HopTargets {
    /// Targets owned by the answering manager whose browse name matched.
    pub matched: Vec<NodeId>,
    /// Local targets owned elsewhere; their browse name must be checked with
    /// their owner.
    pub external: Vec<NodeId>,
    /// Targets on other servers.
    pub remote: Vec<ExpandedNodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_matching() {
        assert!(BrowseDirection::Forward.matches(false));
        assert!(!BrowseDirection::Forward.matches(true));
        assert!(BrowseDirection::Inverse.matches(true));
        assert!(BrowseDirection::Both.matches(true) && BrowseDirection::Both.matches(false));
    }
}
