//! Registry of event monitored items and event delivery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::address_space::TypeTree;
use crate::node_id::NodeId;
use crate::service::ReadValueId;
use crate::status::StatusCode;

use super::events::EventRecord;
use super::filter::{EventFilter, EventFilterResult};
use super::monitored_item::{MonitoredItem, MonitoringFilter};

/// Why an event item was refused.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterRejection {
    /// Item status.
    pub status: StatusCode,
    /// Per-clause detail when the filter itself was examined.
    pub result: Option<EventFilterResult>,
}

impl From<StatusCode> for FilterRejection {
    fn from(status: StatusCode) -> Self {
        Self { status, result: None }
    }
}

/// Checks an event item request before the item is created.
pub fn validate_event_item(
    item_to_monitor: &ReadValueId,
    filter: Option<&MonitoringFilter>,
    type_tree: &TypeTree,
) -> Result<(EventFilter, EventFilterResult), FilterRejection> {
    if item_to_monitor.index_range.is_some() {
        return Err(StatusCode::BadIndexRangeInvalid.into());
    }
    if item_to_monitor.data_encoding.is_some() {
        return Err(StatusCode::BadDataEncodingInvalid.into());
    }
    let filter = match filter {
        Some(MonitoringFilter::Event(f)) => f,
        Some(MonitoringFilter::DataChange(_)) => return Err(StatusCode::BadFilterNotAllowed.into()),
        Some(MonitoringFilter::Aggregate { .. }) => {
            return Err(StatusCode::BadMonitoredItemFilterUnsupported.into())
        }
        None => return Err(StatusCode::BadMonitoredItemFilterInvalid.into()),
    };
    let (status, result) = filter.validate(type_tree);
    if status.is_bad() {
        return Err(FilterRejection {
            status,
            result: Some(result),
        });
    }
    Ok((filter.clone(), result))
}

#[derive(Debug)]
struct EventEntry {
    item: Arc<MonitoredItem>,
    notifier: NodeId,
    all_events: bool,
    filter: EventFilter,
}

/// Event items of one manager.
#[derive(Debug)]
pub struct EventManager {
    items: Mutex<HashMap<u32, EventEntry>>,
    type_tree: Arc<TypeTree>,
}

impl EventManager {
    #[must_use]
    pub fn new(type_tree: Arc<TypeTree>) -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            type_tree,
        }
    }

    /// Registers an item whose filter was already validated. The item's
    /// node is its notifier.
    pub fn add_item(&self, item: Arc<MonitoredItem>, filter: EventFilter) {
        let notifier = item.node_id().clone();
        self.items().insert(
            item.id(),
            EventEntry {
                item,
                notifier,
                all_events: false,
                filter,
            },
        );
    }

    /// Replaces an item's filter. Returns false for unknown items.
    pub fn modify_item(&self, item_id: u32, filter: EventFilter) -> bool {
        match self.items().get_mut(&item_id) {
            Some(entry) => {
                entry.filter = filter;
                true
            }
            None => false,
        }
    }

    /// Marks an item as receiving events from every source.
    pub fn subscribe_all(&self, item_id: u32) -> bool {
        match self.items().get_mut(&item_id) {
            Some(entry) => {
                entry.all_events = true;
                true
            }
            None => false,
        }
    }

    pub fn remove_item(&self, item_id: u32) -> Option<Arc<MonitoredItem>> {
        self.items().remove(&item_id).map(|e| e.item)
    }

    /// Drops every item. Returns how many were registered.
    pub fn clear(&self) -> usize {
        let mut items = self.items();
        let count = items.len();
        items.clear();
        count
    }

    #[must_use]
    pub fn contains(&self, item_id: u32) -> bool {
        self.items().contains_key(&item_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every item whose notifier is in
    /// `notifier_chain` or that subscribes to all events, and whose where
    /// clause matches. Returns the number of items that queued it.
    pub fn report_event(&self, event: &EventRecord, notifier_chain: &[NodeId]) -> usize {
        let targets: Vec<(Arc<MonitoredItem>, EventFilter)> = self
            .items()
            .values()
            .filter(|e| e.all_events || notifier_chain.contains(&e.notifier))
            .map(|e| (Arc::clone(&e.item), e.filter.clone()))
            .collect();

        let mut delivered = 0;
        for (item, filter) in targets {
            if !filter.matches(event, &self.type_tree) {
                continue;
            }
            if item.queue_event(filter.select(event)) {
                delivered += 1;
            }
        }
        trace!(event_type = %event.event_type, delivered, "event reported");
        delivered
    }

    fn items(&self) -> MutexGuard<'_, HashMap<u32, EventEntry>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
