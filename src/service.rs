//! Batched service items.
//!
//! Every service call carries a slice of [`ServiceItem`]s. The dispatcher
//! resolves each item's owning manager into its handle; each manager then
//! claims the unprocessed items whose handle names it and completes or fails
//! them. An item ends in exactly one terminal state: `processed` with a result
//! and `Good`, or `processed` with a failure status.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::browse::{BrowseDescription, BrowsePath, BrowsePathTarget, BrowseResult, ReferenceDescription};
use crate::continuation::ContinuationPointId;
use crate::manager::{ManagerId, NodeHandle};
use crate::node::AttributeId;
use crate::node_id::{NodeId, QualifiedName};
use crate::status::StatusCode;
use crate::subscription::{EventFilterResult, MonitoredItem, MonitoringFilter, MonitoringMode};
use crate::value::{DataValue, Variant};

/// One item of a batched request.
#[derive(Debug, Clone)]
pub struct ServiceItem<Req, Res> {
    request: Req,
    handle: Option<NodeHandle>,
    processed: bool,
    status: StatusCode,
    result: Option<Res>,
    diagnostic: Option<String>,
}

impl<Req, Res> ServiceItem<Req, Res> {
    /// Wraps a request.
    #[must_use]
    pub const fn new(request: Req) -> Self {
        Self {
            request,
            handle: None,
            processed: false,
            status: StatusCode::Good,
            result: None,
            diagnostic: None,
        }
    }

    #[must_use]
    pub const fn request(&self) -> &Req {
        &self.request
    }

    /// The owner resolved by the dispatcher.
    #[must_use]
    pub const fn handle(&self) -> Option<&NodeHandle> {
        self.handle.as_ref()
    }

    pub(crate) fn set_handle(&mut self, handle: NodeHandle) {
        self.handle = Some(handle);
    }

    #[must_use]
    pub const fn is_processed(&self) -> bool {
        self.processed
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub const fn result(&self) -> Option<&Res> {
        self.result.as_ref()
    }

    /// Moves the result out.
    pub fn take_result(&mut self) -> Option<Res> {
        self.result.take()
    }

    #[must_use]
    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    /// True when the item is still open and resolved to `manager`.
    #[must_use]
    pub fn is_claimable_by(&self, manager: ManagerId) -> bool {
        !self.processed && self.handle.as_ref().is_some_and(|h| h.manager == manager)
    }

    /// Finishes the item successfully.
    pub fn complete(&mut self, result: Res) {
        self.complete_with_status(StatusCode::Good, result);
    }

    /// Finishes the item with a result and a non-fatal status.
    pub fn complete_with_status(&mut self, status: StatusCode, result: Res) {
        self.processed = true;
        self.status = status;
        self.result = Some(result);
    }

    /// Finishes the item with a failure.
    pub fn fail(&mut self, status: StatusCode) {
        self.processed = true;
        self.status = status;
        self.result = None;
    }

    /// Finishes the item with a failure and a diagnostic string.
    pub fn fail_with_diagnostic(&mut self, status: StatusCode, diagnostic: impl Into<String>) {
        self.fail(status);
        self.diagnostic = Some(diagnostic.into());
    }
}

/// Node, attribute and optional index range/encoding to read or monitor.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadValueId {
    pub node_id: NodeId,
    /// Raw attribute id; validated by the dispatcher.
    pub attribute_id: u32,
    pub index_range: Option<String>,
    pub data_encoding: Option<QualifiedName>,
}

impl ReadValueId {
    /// The Value attribute of a node.
    #[must_use]
    pub fn value(node_id: NodeId) -> Self {
        Self::attribute(node_id, AttributeId::Value)
    }

    /// Any attribute of a node.
    #[must_use]
    pub fn attribute(node_id: NodeId, attribute: AttributeId) -> Self {
        Self {
            node_id,
            attribute_id: attribute as u32,
            index_range: None,
            data_encoding: None,
        }
    }

    /// Adds an index range.
    #[must_use]
    pub fn with_index_range(mut self, range: impl Into<String>) -> Self {
        self.index_range = Some(range.into());
        self
    }

    /// The attribute, if the raw id is valid.
    #[must_use]
    pub const fn resolved_attribute(&self) -> Option<AttributeId> {
        AttributeId::from_u32(self.attribute_id)
    }
}

/// One attribute write.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteValue {
    pub node_id: NodeId,
    pub attribute_id: u32,
    pub index_range: Option<String>,
    pub value: DataValue,
}

impl WriteValue {
    /// A write to the Value attribute.
    #[must_use]
    pub fn value(node_id: NodeId, value: impl Into<Variant>) -> Self {
        Self {
            node_id,
            attribute_id: AttributeId::Value as u32,
            index_range: None,
            value: DataValue::new(value),
        }
    }
}

/// One method invocation.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMethodRequest {
    /// Object or object type the method is called on.
    pub object_id: NodeId,
    pub method_id: NodeId,
    pub input_arguments: Vec<Variant>,
}

/// Output of a method invocation.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallMethodResult {
    pub input_argument_results: Vec<StatusCode>,
    pub output_arguments: Vec<Variant>,
}

/// Raw history query, shared by every item of a HistoryRead call.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadRawDetails {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// 0 means no limit.
    pub num_values_per_node: u32,
}

/// One node of a HistoryRead call.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryReadValueId {
    pub node_id: NodeId,
    pub index_range: Option<String>,
}

/// History values of one node, oldest first.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryData {
    pub values: Vec<DataValue>,
}

/// One history update.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryUpdateDetails {
    /// Insert values whose timestamps are not yet present.
    Insert { node_id: NodeId, values: Vec<DataValue> },
    /// Replace values whose timestamps already exist.
    Replace { node_id: NodeId, values: Vec<DataValue> },
    /// Insert or replace.
    Update { node_id: NodeId, values: Vec<DataValue> },
    /// Remove values in `[start, end)`.
    DeleteRaw {
        node_id: NodeId,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    },
}

impl HistoryUpdateDetails {
    /// The node updated.
    #[must_use]
    pub const fn node_id(&self) -> &NodeId {
        match self {
            Self::Insert { node_id, .. }
            | Self::Replace { node_id, .. }
            | Self::Update { node_id, .. }
            | Self::DeleteRaw { node_id, .. } => node_id,
        }
    }
}

/// Per-value outcomes of a history update.
#[allow(missing_docs)]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryUpdateResult {
    pub operation_results: Vec<StatusCode>,
}

/// Client-requested monitoring settings.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringParameters {
    pub client_handle: u32,
    /// Milliseconds; negative means "use the publishing interval".
    pub sampling_interval: f64,
    pub filter: Option<MonitoringFilter>,
    pub queue_size: u32,
    pub discard_oldest: bool,
}

impl Default for MonitoringParameters {
    fn default() -> Self {
        Self {
            client_handle: 0,
            sampling_interval: -1.0,
            filter: None,
            queue_size: 1,
            discard_oldest: true,
        }
    }
}

/// One monitored item to create.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemCreateRequest {
    pub item_to_monitor: ReadValueId,
    pub monitoring_mode: MonitoringMode,
    pub parameters: MonitoringParameters,
}

impl MonitoredItemCreateRequest {
    /// A reporting data-change item on the Value attribute.
    #[must_use]
    pub fn value(node_id: NodeId, sampling_interval: f64) -> Self {
        Self {
            item_to_monitor: ReadValueId::value(node_id),
            monitoring_mode: MonitoringMode::Reporting,
            parameters: MonitoringParameters {
                sampling_interval,
                ..MonitoringParameters::default()
            },
        }
    }
}

/// Outcome of creating a monitored item.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct MonitoredItemCreateResult {
    pub monitored_item_id: u32,
    pub revised_sampling_interval: f64,
    pub revised_queue_size: u32,
    pub filter_result: Option<EventFilterResult>,
    /// The live item; the notification layer drains its queue. `None` when
    /// creation failed and only the filter result is reported.
    pub item: Option<Arc<MonitoredItem>>,
}

/// One monitored item to modify.
#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct MonitoredItemModifyRequest {
    pub item: Arc<MonitoredItem>,
    pub parameters: MonitoringParameters,
}

/// Outcome of modifying a monitored item.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemModifyResult {
    pub revised_sampling_interval: f64,
    pub revised_queue_size: u32,
    pub filter_result: Option<EventFilterResult>,
}

/// Subscription-level settings passed with monitored item calls.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscriptionContext {
    pub subscription_id: u32,
    /// Milliseconds.
    pub publishing_interval: f64,
    pub diagnostics_mask: u32,
}

impl SubscriptionContext {
    #[must_use]
    pub const fn new(subscription_id: u32, publishing_interval: f64) -> Self {
        Self {
            subscription_id,
            publishing_interval,
            diagnostics_mask: 0,
        }
    }
}

/// Client browse item.
pub type BrowseItem = ServiceItem<BrowseDescription, BrowseResult>;
/// Browse item as seen by a node manager: the full, unpaged reference list.
pub type NodeBrowseItem = ServiceItem<BrowseDescription, Vec<ReferenceDescription>>;
/// BrowseNext item.
pub type BrowseNextItem = ServiceItem<ContinuationPointId, BrowseResult>;
/// TranslateBrowsePathsToNodeIds item.
pub type TranslateItem = ServiceItem<BrowsePath, Vec<BrowsePathTarget>>;
/// Read item.
pub type ReadItem = ServiceItem<ReadValueId, DataValue>;
/// Write item.
pub type WriteItem = ServiceItem<WriteValue, ()>;
/// Call item.
pub type CallItem = ServiceItem<CallMethodRequest, CallMethodResult>;
/// HistoryRead item.
pub type HistoryReadItem = ServiceItem<HistoryReadValueId, HistoryData>;
/// HistoryUpdate item.
pub type HistoryUpdateItem = ServiceItem<HistoryUpdateDetails, HistoryUpdateResult>;
/// CreateMonitoredItems item.
pub type CreateMonitoredItem = ServiceItem<MonitoredItemCreateRequest, MonitoredItemCreateResult>;
/// ModifyMonitoredItems item.
pub type ModifyMonitoredItem = ServiceItem<MonitoredItemModifyRequest, MonitoredItemModifyResult>;
/// Delete, SetMonitoringMode and Transfer items address an existing item.
pub type ExistingMonitoredItem = ServiceItem<Arc<MonitoredItem>, ()>;

/// Gives failed read items a value carrying their status.
pub fn finalize_read_results(items: &mut [ReadItem]) {
    for item in items.iter_mut() {
        if item.result.is_none() {
            item.result = Some(DataValue::bad(item.status));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(manager: usize) -> NodeHandle {
        NodeHandle {
            node_id: NodeId::numeric(2, 1),
            manager: ManagerId(manager),
        }
    }

    #[test]
    fn claim_requires_matching_open_handle() {
        let mut item: ReadItem = ServiceItem::new(ReadValueId::value(NodeId::numeric(2, 1)));
        assert!(!item.is_claimable_by(ManagerId(2)));
        item.set_handle(handle(2));
        assert!(item.is_claimable_by(ManagerId(2)));
        assert!(!item.is_claimable_by(ManagerId(3)));
        item.complete(DataValue::new(1.0));
        assert!(!item.is_claimable_by(ManagerId(2)));
        assert!(item.is_processed());
        assert_eq!(item.status(), StatusCode::Good);
    }

    #[test]
    fn failed_reads_carry_status_in_value() {
        let mut items: Vec<ReadItem> = vec![ServiceItem::new(ReadValueId::value(NodeId::numeric(2, 1)))];
        items[0].fail_with_diagnostic(StatusCode::BadNodeIdUnknown, "no owner");
        finalize_read_results(&mut items);
        assert_eq!(items[0].result().unwrap().status, StatusCode::BadNodeIdUnknown);
        assert_eq!(items[0].diagnostic(), Some("no owner"));
    }
}
