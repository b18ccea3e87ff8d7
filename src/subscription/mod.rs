//! Monitored items, sampling groups and event delivery.
//!
//! - [`monitored_item`]: the item, its filter and its notification queue.
//! - [`sampling`]: quantization and the per-interval polling loop.
//! - [`sampling_manager`]: group assignment and retirement.
//! - [`filter`] and [`events`]: event filters and event records.
//! - [`event_manager`]: event item registry and delivery.

pub mod event_manager;
pub mod events;
pub mod filter;
pub mod monitored_item;
pub mod sampling;
pub mod sampling_manager;

pub use event_manager::{validate_event_item, EventManager, FilterRejection};
pub use events::EventRecord;
pub use filter::{
    ContentFilter, ContentFilterElement, EventFilter, EventFilterResult, FilterOperand, FilterOperator,
    SimpleAttributeOperand,
};
pub use monitored_item::{
    DataChangeFilter, DataChangeTrigger, DeadbandType, MonitoredItem, MonitoredItemSettings, MonitoringFilter,
    MonitoringMode, Notification, QueuedNotifications,
};
pub use sampling::{quantize, SampleReader, SamplingGroup, SamplingRateBand};
pub use sampling_manager::SamplingGroupManager;
