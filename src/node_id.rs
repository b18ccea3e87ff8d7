//! Node identity types.
//!
//! A node is addressed by a namespace index plus an opaque identifier.
//! `ExpandedNodeId` additionally carries a namespace URI and server index so a
//! reference can point at a node that lives outside this process.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The identifier part of a `NodeId`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Identifier {
    Numeric(u32),
    String(String),
    Guid(Uuid),
    Opaque(Vec<u8>),
}

/// Namespace-qualified node identifier.
///
/// # Examples
///
/// ```
/// use uacore::NodeId;
///
/// let id: NodeId = "ns=2;s=Boiler".parse().unwrap();
/// assert_eq!(id.namespace, 2);
/// assert_eq!(id.to_string(), "ns=2;s=Boiler");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    /// Namespace index.
    pub namespace: u16,
    /// Identifier within the namespace.
    pub identifier: Identifier,
}

impl NodeId {
    /// Numeric identifier in namespace 0.
    #[must_use]
    pub const fn ns0(value: u32) -> Self {
        Self {
            namespace: 0,
            identifier: Identifier::Numeric(value),
        }
    }

    /// Numeric identifier.
    #[must_use]
    pub const fn numeric(namespace: u16, value: u32) -> Self {
        Self {
            namespace,
            identifier: Identifier::Numeric(value),
        }
    }

    /// String identifier.
    #[must_use]
    pub fn string(namespace: u16, value: impl Into<String>) -> Self {
        Self {
            namespace,
            identifier: Identifier::String(value.into()),
        }
    }

    /// GUID identifier.
    #[must_use]
    pub const fn guid(namespace: u16, value: Uuid) -> Self {
        Self {
            namespace,
            identifier: Identifier::Guid(value),
        }
    }

    /// Opaque (byte string) identifier.
    #[must_use]
    pub fn opaque(namespace: u16, value: impl Into<Vec<u8>>) -> Self {
        Self {
            namespace,
            identifier: Identifier::Opaque(value.into()),
        }
    }

    /// The null node id (`i=0`).
    #[must_use]
    pub const fn null() -> Self {
        Self::ns0(0)
    }

    /// Returns true for the null id or an empty string/opaque identifier.
    #[must_use]
    pub fn is_null(&self) -> bool {
        match &self.identifier {
            Identifier::Numeric(v) => self.namespace == 0 && *v == 0,
            Identifier::String(s) => s.is_empty(),
            Identifier::Guid(g) => g.is_nil(),
            Identifier::Opaque(b) => b.is_empty(),
        }
    }

    /// Returns the numeric identifier, if any.
    #[must_use]
    pub const fn as_numeric(&self) -> Option<u32> {
        match self.identifier {
            Identifier::Numeric(v) => Some(v),
            _ => None,
        }
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::null()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace != 0 {
            write!(f, "ns={};", self.namespace)?;
        }
        match &self.identifier {
            Identifier::Numeric(v) => write!(f, "i={v}"),
            Identifier::String(s) => write!(f, "s={s}"),
            Identifier::Guid(g) => write!(f, "g={g}"),
            Identifier::Opaque(b) => {
                write!(f, "b=")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Error returned when a textual node id cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid node id '{input}': {reason}")]
pub struct ParseNodeIdError {
    input: String,
    reason: &'static str,
}

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseNodeIdError {
            input: s.to_string(),
            reason,
        };

        let (namespace, rest) = match s.strip_prefix("ns=") {
            Some(tail) => {
                let (ns, rest) = tail.split_once(';').ok_or_else(|| err("missing ';' after namespace"))?;
                let ns: u16 = ns.parse().map_err(|_| err("namespace is not a u16"))?;
                (ns, rest)
            }
            None => (0, s),
        };

        let (kind, value) = rest.split_once('=').ok_or_else(|| err("missing identifier type"))?;
        let identifier = match kind {
            "i" => Identifier::Numeric(value.parse().map_err(|_| err("numeric identifier is not a u32"))?),
            "s" => Identifier::String(value.to_string()),
            "g" => Identifier::Guid(Uuid::parse_str(value).map_err(|_| err("malformed guid"))?),
            "b" => {
                if value.len() % 2 != 0 {
                    return Err(err("opaque identifier must be hex pairs"));
                }
                let bytes = (0..value.len())
                    .step_by(2)
                    .map(|i| u8::from_str_radix(&value[i..i + 2], 16))
                    .collect::<Result<Vec<u8>, _>>()
                    .map_err(|_| err("opaque identifier must be hex pairs"))?;
                Identifier::Opaque(bytes)
            }
            _ => return Err(err("unknown identifier type")),
        };

        Ok(Self { namespace, identifier })
    }
}

/// A node id that may point outside this server.
///
/// A target is local when `server_index == 0` and no namespace URI override is
/// present. Anything else is opaque to this process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExpandedNodeId {
    /// The node id (namespace index is ignored when `namespace_uri` is set).
    pub node_id: NodeId,
    /// Explicit namespace URI, for ids whose namespace is not in the local table.
    pub namespace_uri: Option<String>,
    /// Index into the server table; 0 is this server.
    pub server_index: u32,
}

impl ExpandedNodeId {
    /// Wraps a local node id.
    #[must_use]
    pub const fn local(node_id: NodeId) -> Self {
        Self {
            node_id,
            namespace_uri: None,
            server_index: 0,
        }
    }

    /// A node on another server.
    #[must_use]
    pub fn remote(node_id: NodeId, namespace_uri: impl Into<String>, server_index: u32) -> Self {
        Self {
            node_id,
            namespace_uri: Some(namespace_uri.into()),
            server_index,
        }
    }

    /// Returns true when the id resolves within this server's namespace table.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.server_index == 0 && self.namespace_uri.is_none()
    }

    /// Returns the node id if local.
    #[must_use]
    pub fn as_local(&self) -> Option<&NodeId> {
        if self.is_local() {
            Some(&self.node_id)
        } else {
            None
        }
    }
}

impl From<NodeId> for ExpandedNodeId {
    fn from(node_id: NodeId) -> Self {
        Self::local(node_id)
    }
}

impl fmt::Display for ExpandedNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.server_index != 0 {
            write!(f, "svr={};", self.server_index)?;
        }
        if let Some(uri) = &self.namespace_uri {
            write!(f, "nsu={uri};")?;
        }
        write!(f, "{}", self.node_id)
    }
}

/// Namespace-qualified browse name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct QualifiedName {
    /// Namespace index.
    pub namespace: u16,
    /// Name text.
    pub name: String,
}

impl QualifiedName {
    /// Creates a qualified name.
    #[must_use]
    pub fn new(namespace: u16, name: impl Into<String>) -> Self {
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// Returns true when the name text is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }
}

impl From<&str> for QualifiedName {
    fn from(name: &str) -> Self {
        Self::new(0, name)
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace == 0 {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}:{}", self.namespace, self.name)
        }
    }
}

/// Human readable text with an optional locale.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct LocalizedText {
    /// Locale id such as `en-US`.
    pub locale: Option<String>,
    /// Text.
    pub text: String,
}

impl LocalizedText {
    /// Text without a locale.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            locale: None,
            text: text.into(),
        }
    }
}

impl From<&str> for LocalizedText {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl fmt::Display for LocalizedText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Well-known identifiers from the standard namespace.
#[allow(missing_docs)]
pub mod ids {
    use super::NodeId;

    // Reference types
    pub const REFERENCES: NodeId = NodeId::ns0(31);
    pub const NON_HIERARCHICAL_REFERENCES: NodeId = NodeId::ns0(32);
    pub const HIERARCHICAL_REFERENCES: NodeId = NodeId::ns0(33);
    pub const HAS_CHILD: NodeId = NodeId::ns0(34);
    pub const ORGANIZES: NodeId = NodeId::ns0(35);
    pub const HAS_EVENT_SOURCE: NodeId = NodeId::ns0(36);
    pub const HAS_MODELLING_RULE: NodeId = NodeId::ns0(37);
    pub const HAS_TYPE_DEFINITION: NodeId = NodeId::ns0(40);
    pub const GENERATES_EVENT: NodeId = NodeId::ns0(41);
    pub const AGGREGATES: NodeId = NodeId::ns0(44);
    pub const HAS_SUBTYPE: NodeId = NodeId::ns0(45);
    pub const HAS_PROPERTY: NodeId = NodeId::ns0(46);
    pub const HAS_COMPONENT: NodeId = NodeId::ns0(47);
    pub const HAS_NOTIFIER: NodeId = NodeId::ns0(48);

    // Modelling rules
    pub const MODELLING_RULE_MANDATORY: NodeId = NodeId::ns0(78);
    pub const MODELLING_RULE_OPTIONAL: NodeId = NodeId::ns0(80);

    // Folders and well-known objects
    pub const ROOT_FOLDER: NodeId = NodeId::ns0(84);
    pub const OBJECTS_FOLDER: NodeId = NodeId::ns0(85);
    pub const TYPES_FOLDER: NodeId = NodeId::ns0(86);
    pub const VIEWS_FOLDER: NodeId = NodeId::ns0(87);
    pub const SERVER: NodeId = NodeId::ns0(2253);

    // Types
    pub const BASE_OBJECT_TYPE: NodeId = NodeId::ns0(58);
    pub const FOLDER_TYPE: NodeId = NodeId::ns0(61);
    pub const BASE_VARIABLE_TYPE: NodeId = NodeId::ns0(62);
    pub const BASE_DATA_VARIABLE_TYPE: NodeId = NodeId::ns0(63);
    pub const PROPERTY_TYPE: NodeId = NodeId::ns0(68);
    pub const MODELLING_RULE_TYPE: NodeId = NodeId::ns0(77);
    pub const SERVER_TYPE: NodeId = NodeId::ns0(2004);
    pub const BASE_EVENT_TYPE: NodeId = NodeId::ns0(2041);

    // Data types
    pub const BOOLEAN: NodeId = NodeId::ns0(1);
    pub const INT32: NodeId = NodeId::ns0(6);
    pub const UINT32: NodeId = NodeId::ns0(7);
    pub const INT64: NodeId = NodeId::ns0(8);
    pub const DOUBLE: NodeId = NodeId::ns0(11);
    pub const STRING: NodeId = NodeId::ns0(12);
    pub const DATE_TIME: NodeId = NodeId::ns0(13);
    pub const BASE_DATA_TYPE: NodeId = NodeId::ns0(24);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_numeric() {
        let id: NodeId = "i=85".parse().unwrap();
        assert_eq!(id, ids::OBJECTS_FOLDER);
        assert_eq!(id.to_string(), "i=85");
    }

    #[test]
    fn parse_opaque_and_guid() {
        let id: NodeId = "ns=3;b=00ff10".parse().unwrap();
        assert_eq!(id.identifier, Identifier::Opaque(vec![0x00, 0xff, 0x10]));
        assert_eq!(id.to_string(), "ns=3;b=00ff10");

        let g = Uuid::new_v4();
        let id: NodeId = format!("ns=1;g={g}").parse().unwrap();
        assert_eq!(id, NodeId::guid(1, g));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("ns=x;i=1".parse::<NodeId>().is_err());
        assert!("q=1".parse::<NodeId>().is_err());
        assert!("ns=1;b=abc".parse::<NodeId>().is_err());
    }

    #[test]
    fn null_detection() {
        assert!(NodeId::null().is_null());
        assert!(NodeId::string(2, "").is_null());
        assert!(!NodeId::numeric(2, 0).is_null());
    }

    #[test]
    fn expanded_locality() {
        let local = ExpandedNodeId::from(NodeId::numeric(2, 7));
        assert!(local.is_local());
        assert_eq!(local.as_local(), Some(&NodeId::numeric(2, 7)));

        let remote = ExpandedNodeId::remote(NodeId::numeric(1, 7), "urn:other", 3);
        assert!(!remote.is_local());
        assert!(remote.as_local().is_none());
        assert_eq!(remote.to_string(), "svr=3;nsu=urn:other;ns=1;i=7");
    }
}
