//! Event records delivered to event monitored items.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::node::AttributeId;
use crate::node_id::{LocalizedText, NodeId};
use crate::value::Variant;

use super::filter::SimpleAttributeOperand;

/// One occurrence of an event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Unique id of this occurrence.
    pub event_id: Vec<u8>,
    /// Event type node.
    pub event_type: NodeId,
    /// Node the event originates from.
    pub source_node: NodeId,
    /// Browse name of the source.
    pub source_name: String,
    /// When the event occurred.
    pub time: DateTime<Utc>,
    /// When the server received it.
    pub receive_time: DateTime<Utc>,
    /// Human readable description.
    pub message: LocalizedText,
    /// 1 (lowest) to 1000 (highest).
    pub severity: u16,
    fields: HashMap<String, Variant>,
}

impl EventRecord {
    /// Creates an event occurring now.
    #[must_use]
    pub fn new(event_type: NodeId, source_node: NodeId, message: impl Into<LocalizedText>, severity: u16) -> Self {
        let now = Utc::now();
        Self {
            event_id: Uuid::new_v4().as_bytes().to_vec(),
            event_type,
            source_node,
            source_name: String::new(),
            time: now,
            receive_time: now,
            message: message.into(),
            severity: severity.clamp(1, 1000),
            fields: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }

    /// Adds a field addressed by its browse path, e.g. `"Limits/High"`.
    #[must_use]
    pub fn with_field(mut self, path: impl Into<String>, value: impl Into<Variant>) -> Self {
        self.fields.insert(path.into(), value.into());
        self
    }

    /// Resolves a select clause or where-clause operand against this event.
    /// Unknown fields are `Variant::Empty`.
    #[must_use]
    pub fn get_field(&self, operand: &SimpleAttributeOperand) -> Variant {
        if operand.attribute_id != AttributeId::Value as u32 {
            return Variant::Empty;
        }
        let path: Vec<&str> = operand.browse_path.iter().map(|q| q.name.as_str()).collect();
        match path.as_slice() {
            ["EventId"] => Variant::ByteString(self.event_id.clone()),
            ["EventType"] => Variant::NodeId(self.event_type.clone()),
            ["SourceNode"] => Variant::NodeId(self.source_node.clone()),
            ["SourceName"] => Variant::String(self.source_name.clone()),
            ["Time"] => Variant::DateTime(self.time),
            ["ReceiveTime"] => Variant::DateTime(self.receive_time),
            ["Message"] => Variant::LocalizedText(self.message.clone()),
            ["Severity"] => Variant::UInt32(u32::from(self.severity)),
            [] => Variant::Empty,
            parts => self.fields.get(&parts.join("/")).cloned().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_id::ids;

    #[test]
    fn standard_and_custom_fields() {
        let event = EventRecord::new(ids::BASE_EVENT_TYPE, NodeId::numeric(2, 1), "Overheat", 700)
            .with_field("Limits/High", 90.0);
        assert_eq!(
            event.get_field(&SimpleAttributeOperand::field("Severity")),
            Variant::UInt32(700)
        );
        assert_eq!(
            event.get_field(&SimpleAttributeOperand::path(["Limits", "High"])),
            Variant::Double(90.0)
        );
        assert_eq!(event.get_field(&SimpleAttributeOperand::field("Missing")), Variant::Empty);
    }

    #[test]
    fn severity_is_clamped() {
        let event = EventRecord::new(ids::BASE_EVENT_TYPE, NodeId::numeric(2, 1), "x", 5000);
        assert_eq!(event.severity, 1000);
    }
}
