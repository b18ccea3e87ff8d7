//! Monitored items and their notification queues.
//!
//! A monitored item is created by its owning node manager and shared (`Arc`)
//! with the sampling engine or the event manager that feeds it and with the
//! notification layer that drains it. Pushes go through
//! [`MonitoredItem::queue_value`] and [`MonitoredItem::queue_event`]; the
//! drain is [`MonitoredItem::take_notifications`].

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::manager::ManagerId;
use crate::node::AttributeId;
use crate::node_id::NodeId;
use crate::service::ReadValueId;
use crate::session::SessionId;
use crate::status::StatusCode;
use crate::value::{DataValue, NumericRange, Variant};

use super::filter::EventFilter;

/// Whether an item samples and reports.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MonitoringMode {
    /// Not sampled; the queue is flushed.
    Disabled,
    /// Sampled and queued, not reported.
    Sampling,
    #[default]
    Reporting,
}

/// What counts as a data change.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataChangeTrigger {
    Status,
    #[default]
    StatusValue,
    StatusValueTimestamp,
}

/// Deadband applied to numeric values.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeadbandType {
    #[default]
    None,
    Absolute,
    Percent,
}

/// Data change filter.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DataChangeFilter {
    pub trigger: DataChangeTrigger,
    pub deadband_type: DeadbandType,
    pub deadband_value: f64,
}

impl DataChangeFilter {
    /// Returns true when `new` must be reported given the last reported `old`.
    #[must_use]
    pub fn has_changed(&self, old: &DataValue, new: &DataValue) -> bool {
        if old.status != new.status {
            return true;
        }
        if self.trigger == DataChangeTrigger::Status {
            return false;
        }
        if self.trigger == DataChangeTrigger::StatusValueTimestamp
            && old.source_timestamp != new.source_timestamp
        {
            return true;
        }
        self.value_changed(&old.value, &new.value)
    }

    fn value_changed(&self, old: &Variant, new: &Variant) -> bool {
        if self.deadband_type != DeadbandType::Absolute {
            return old != new;
        }
        match (old, new) {
            (Variant::Array(a), Variant::Array(b)) => {
                a.len() != b.len() || a.iter().zip(b).any(|(x, y)| self.value_changed(x, y))
            }
            _ => match (old.as_f64(), new.as_f64()) {
                (Some(x), Some(y)) => (x - y).abs() > self.deadband_value,
                _ => old != new,
            },
        }
    }
}

/// Filter attached to a monitored item.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum MonitoringFilter {
    DataChange(DataChangeFilter),
    Event(EventFilter),
    /// Aggregate computation; accepted in requests, supported by no manager here.
    Aggregate { aggregate_type: NodeId },
}

/// A queued notification.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    DataChange { client_handle: u32, value: DataValue },
    Event { client_handle: u32, fields: Vec<Variant> },
}

/// Drained queue content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueuedNotifications {
    /// Notifications in queue order.
    pub notifications: Vec<Notification>,
    /// True when notifications were discarded since the last drain.
    pub overflow: bool,
}

/// Revised settings applied to an item.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoredItemSettings {
    pub monitoring_mode: MonitoringMode,
    pub client_handle: u32,
    pub sampling_interval: f64,
    pub queue_size: u32,
    pub discard_oldest: bool,
    pub filter: Option<MonitoringFilter>,
}

impl Default for MonitoredItemSettings {
    fn default() -> Self {
        Self {
            monitoring_mode: MonitoringMode::Reporting,
            client_handle: 0,
            sampling_interval: 0.0,
            queue_size: 1,
            discard_oldest: true,
            filter: None,
        }
    }
}

#[derive(Debug)]
struct ItemState {
    settings: MonitoredItemSettings,
    session_id: SessionId,
    subscription_id: u32,
    last_value: Option<DataValue>,
}

#[derive(Debug, Default)]
struct NotificationQueue {
    entries: VecDeque<Notification>,
    overflow: bool,
}

/// A client's standing request for data changes or events on one node.
#[derive(Debug)]
pub struct MonitoredItem {
    id: u32,
    manager: ManagerId,
    item_to_monitor: ReadValueId,
    attribute: AttributeId,
    index_range: Option<NumericRange>,
    state: Mutex<ItemState>,
    queue: Mutex<NotificationQueue>,
}

impl MonitoredItem {
    /// Creates an item. `attribute` and `index_range` are the validated forms
    /// of the raw fields in `item_to_monitor`.
    #[must_use]
    pub fn new(
        id: u32,
        subscription_id: u32,
        session_id: SessionId,
        manager: ManagerId,
        item_to_monitor: ReadValueId,
        attribute: AttributeId,
        index_range: Option<NumericRange>,
        settings: MonitoredItemSettings,
    ) -> Self {
        Self {
            id,
            manager,
            item_to_monitor,
            attribute,
            index_range,
            state: Mutex::new(ItemState {
                settings,
                session_id,
                subscription_id,
                last_value: None,
            }),
            queue: Mutex::new(NotificationQueue::default()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// The manager that created and owns this item.
    #[must_use]
    pub const fn manager(&self) -> ManagerId {
        self.manager
    }

    #[must_use]
    pub const fn item_to_monitor(&self) -> &ReadValueId {
        &self.item_to_monitor
    }

    #[must_use]
    pub const fn node_id(&self) -> &NodeId {
        &self.item_to_monitor.node_id
    }

    #[must_use]
    pub const fn attribute(&self) -> AttributeId {
        self.attribute
    }

    #[must_use]
    pub const fn index_range(&self) -> Option<&NumericRange> {
        self.index_range.as_ref()
    }

    /// Event items monitor the EventNotifier attribute.
    #[must_use]
    pub fn is_event_item(&self) -> bool {
        self.attribute == AttributeId::EventNotifier
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.state().session_id
    }

    #[must_use]
    pub fn subscription_id(&self) -> u32 {
        self.state().subscription_id
    }

    #[must_use]
    pub fn monitoring_mode(&self) -> MonitoringMode {
        self.state().settings.monitoring_mode
    }

    /// Revised sampling interval in milliseconds.
    #[must_use]
    pub fn sampling_interval(&self) -> f64 {
        self.state().settings.sampling_interval
    }

    #[must_use]
    pub fn queue_size(&self) -> u32 {
        self.state().settings.queue_size
    }

    #[must_use]
    pub fn client_handle(&self) -> u32 {
        self.state().settings.client_handle
    }

    #[must_use]
    pub fn filter(&self) -> Option<MonitoringFilter> {
        self.state().settings.filter.clone()
    }

    #[must_use]
    pub fn settings(&self) -> MonitoredItemSettings {
        self.state().settings.clone()
    }

    /// The last value accepted into the queue.
    #[must_use]
    pub fn last_value(&self) -> Option<DataValue> {
        self.state().last_value.clone()
    }

    /// Replaces the settings, shrinking the queue if needed.
    pub fn modify(&self, settings: MonitoredItemSettings) {
        let queue_size = settings.queue_size.max(1) as usize;
        let discard_oldest = settings.discard_oldest;
        self.state().settings = settings;
        let mut queue = self.queue();
        while queue.entries.len() > queue_size {
            if discard_oldest {
                queue.entries.pop_front();
            } else {
                queue.entries.pop_back();
            }
            queue.overflow = true;
        }
    }

    /// Changes the monitoring mode; returns the previous one. Disabling flushes
    /// the queue and forgets the last value.
    pub fn set_monitoring_mode(&self, mode: MonitoringMode) -> MonitoringMode {
        let previous = {
            let mut state = self.state();
            let previous = state.settings.monitoring_mode;
            state.settings.monitoring_mode = mode;
            if mode == MonitoringMode::Disabled {
                state.last_value = None;
            }
            previous
        };
        if mode == MonitoringMode::Disabled {
            let mut queue = self.queue();
            queue.entries.clear();
            queue.overflow = false;
        }
        previous
    }

    /// Moves the item to another session and subscription.
    pub fn transfer(&self, session_id: SessionId, subscription_id: u32) {
        let mut state = self.state();
        state.session_id = session_id;
        state.subscription_id = subscription_id;
    }

    /// Offers a sampled value. `error` replaces the value when the read
    /// failed as a whole. Returns true when a notification was queued.
    pub fn queue_value(&self, value: DataValue, error: Option<StatusCode>) -> bool {
        let value = match error {
            Some(status) => DataValue::bad(status),
            None => value,
        };
        let (client_handle, queue_size, discard_oldest) = {
            let mut state = self.state();
            if state.settings.monitoring_mode == MonitoringMode::Disabled {
                return false;
            }
            let filter = match &state.settings.filter {
                Some(MonitoringFilter::DataChange(f)) => *f,
                _ => DataChangeFilter::default(),
            };
            if let Some(last) = &state.last_value {
                if !filter.has_changed(last, &value) {
                    return false;
                }
            }
            state.last_value = Some(value.clone());
            (
                state.settings.client_handle,
                state.settings.queue_size,
                state.settings.discard_oldest,
            )
        };
        self.push(Notification::DataChange { client_handle, value }, queue_size, discard_oldest);
        true
    }

    /// Offers an event's selected fields. Returns true when queued.
    pub fn queue_event(&self, fields: Vec<Variant>) -> bool {
        let (client_handle, queue_size, discard_oldest) = {
            let state = self.state();
            if state.settings.monitoring_mode == MonitoringMode::Disabled {
                return false;
            }
            (
                state.settings.client_handle,
                state.settings.queue_size,
                state.settings.discard_oldest,
            )
        };
        self.push(Notification::Event { client_handle, fields }, queue_size, discard_oldest);
        true
    }

    /// Drains the queue.
    pub fn take_notifications(&self) -> QueuedNotifications {
        let mut queue = self.queue();
        QueuedNotifications {
            notifications: queue.entries.drain(..).collect(),
            overflow: std::mem::take(&mut queue.overflow),
        }
    }

    /// Number of queued notifications.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue().entries.len()
    }

    fn push(&self, notification: Notification, queue_size: u32, discard_oldest: bool) {
        let capacity = queue_size.max(1) as usize;
        let mut queue = self.queue();
        if queue.entries.len() >= capacity {
            queue.overflow = true;
            if discard_oldest {
                queue.entries.pop_front();
            } else {
                // Newest entry is replaced.
                queue.entries.pop_back();
            }
        }
        queue.entries.push_back(notification);
    }

    // Item state is plain data; a poisoned lock still holds a usable value.
    fn state(&self) -> MutexGuard<'_, ItemState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, NotificationQueue> {
        self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(settings: MonitoredItemSettings) -> MonitoredItem {
        MonitoredItem::new(
            1,
            7,
            SessionId::new(),
            ManagerId(2),
            ReadValueId::value(NodeId::numeric(2, 1)),
            AttributeId::Value,
            None,
            settings,
        )
    }

    #[test]
    fn unchanged_values_are_not_queued() {
        let item = item(MonitoredItemSettings {
            queue_size: 10,
            ..MonitoredItemSettings::default()
        });
        let v = DataValue::new(1.0);
        assert!(item.queue_value(v.clone(), None));
        assert!(!item.queue_value(v, None));
        assert!(item.queue_value(DataValue::new(2.0), None));
        assert_eq!(item.queue_len(), 2);
    }

    #[test]
    fn absolute_deadband_suppresses_small_changes() {
        let item = item(MonitoredItemSettings {
            queue_size: 10,
            filter: Some(MonitoringFilter::DataChange(DataChangeFilter {
                trigger: DataChangeTrigger::StatusValue,
                deadband_type: DeadbandType::Absolute,
                deadband_value: 0.5,
            })),
            ..MonitoredItemSettings::default()
        });
        assert!(item.queue_value(DataValue::new(10.0), None));
        assert!(!item.queue_value(DataValue::new(10.3), None));
        assert!(item.queue_value(DataValue::new(10.6), None));
    }

    #[test]
    fn error_status_is_a_change() {
        let item = item(MonitoredItemSettings::default());
        assert!(item.queue_value(DataValue::new(1.0), None));
        assert!(item.queue_value(DataValue::default(), Some(StatusCode::BadNotReadable)));
        let drained = item.take_notifications();
        let Some(Notification::DataChange { value, .. }) = drained.notifications.last() else {
            panic!("expected data change");
        };
        assert_eq!(value.status, StatusCode::BadNotReadable);
    }

    #[test]
    fn overflow_discards_oldest() {
        let item = item(MonitoredItemSettings {
            queue_size: 2,
            ..MonitoredItemSettings::default()
        });
        for v in [1.0, 2.0, 3.0] {
            item.queue_value(DataValue::new(v), None);
        }
        let drained = item.take_notifications();
        assert!(drained.overflow);
        let values: Vec<Variant> = drained
            .notifications
            .into_iter()
            .map(|n| match n {
                Notification::DataChange { value, .. } => value.value,
                Notification::Event { .. } => Variant::Empty,
            })
            .collect();
        assert_eq!(values, vec![Variant::Double(2.0), Variant::Double(3.0)]);
        assert!(!item.take_notifications().overflow);
    }

    #[test]
    fn disabled_items_ignore_values_and_flush() {
        let item = item(MonitoredItemSettings {
            queue_size: 5,
            ..MonitoredItemSettings::default()
        });
        item.queue_value(DataValue::new(1.0), None);
        assert_eq!(item.set_monitoring_mode(MonitoringMode::Disabled), MonitoringMode::Reporting);
        assert_eq!(item.queue_len(), 0);
        assert!(!item.queue_value(DataValue::new(2.0), None));
        assert!(!item.queue_event(vec![Variant::from("x")]));
    }
}
