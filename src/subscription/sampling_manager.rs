//! Assigns monitored items to sampling groups and retires empty groups.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use crate::config::ServerConfig;

use super::monitored_item::MonitoredItem;
use super::sampling::{quantize, SampleReader, SamplingGroup, SamplingRateBand};

/// Per-manager registry of sampling groups.
pub struct SamplingGroupManager {
    bands: Vec<SamplingRateBand>,
    max_queue_size: u32,
    min_sampling_interval: f64,
    reader: Weak<dyn SampleReader>,
    groups: Mutex<Vec<Arc<SamplingGroup>>>,
}

impl std::fmt::Debug for SamplingGroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplingGroupManager")
            .field("bands", &self.bands)
            .field("max_queue_size", &self.max_queue_size)
            .field("groups", &self.group_count())
            .finish_non_exhaustive()
    }
}

impl SamplingGroupManager {
    /// Creates a manager reading through `reader`.
    #[must_use]
    pub fn new(config: &ServerConfig, reader: Weak<dyn SampleReader>) -> Self {
        Self {
            bands: config.sampling_rates.clone(),
            max_queue_size: config.max_queue_size,
            min_sampling_interval: config.min_sampling_interval,
            reader,
            groups: Mutex::new(Vec::new()),
        }
    }

    /// Revised sampling interval. A negative request means the publishing
    /// interval; the result is never below the node's or the server's
    /// minimum, and is quantized onto the ladder.
    #[must_use]
    pub fn revise_sampling_interval(&self, requested: f64, publishing_interval: f64, node_minimum: f64) -> f64 {
        let mut interval = if requested < 0.0 || requested.is_nan() {
            publishing_interval
        } else {
            requested
        };
        interval = interval.max(node_minimum).max(self.min_sampling_interval);
        quantize(&self.bands, interval)
    }

    /// Revised queue size: at least 1, at most the server maximum.
    #[must_use]
    pub fn revise_queue_size(&self, requested: u32) -> u32 {
        requested.clamp(1, self.max_queue_size.max(1))
    }

    /// Stages `item` in the group for its session, interval and mask,
    /// creating the group if none accepts it.
    pub fn start_monitoring(&self, item: Arc<MonitoredItem>, diagnostics_mask: u32) {
        let session_id = item.session_id();
        let interval = item.sampling_interval();
        let mut groups = self.groups();
        if let Some(group) = groups.iter().find(|g| g.accepts(session_id, interval, diagnostics_mask)) {
            group.start_monitoring(item);
            return;
        }
        debug!(interval_ms = interval, session = %session_id, "creating sampling group");
        let group = Arc::new(SamplingGroup::new(session_id, interval, diagnostics_mask, self.reader.clone()));
        group.start_monitoring(item);
        groups.push(group);
    }

    /// Moves `item` to the group matching its current settings, if that
    /// changed.
    pub fn modify_monitoring(&self, item: Arc<MonitoredItem>, diagnostics_mask: u32) {
        let session_id = item.session_id();
        let interval = item.sampling_interval();
        {
            let groups = self.groups();
            let current = groups.iter().find(|g| g.contains(item.id()));
            if let Some(group) = current {
                if group.accepts(session_id, interval, diagnostics_mask) {
                    return;
                }
                group.stop_monitoring(item.id());
            }
        }
        self.start_monitoring(item, diagnostics_mask);
    }

    /// Moves `item` after its session changed, keeping its diagnostics mask.
    pub fn reassign(&self, item: Arc<MonitoredItem>) {
        let mask = self.group_of(item.id()).map_or(0, |g| g.diagnostics_mask());
        self.modify_monitoring(item, mask);
    }

    /// Stages removal of `item_id` from whichever group holds it.
    pub fn stop_monitoring(&self, item_id: u32) {
        for group in self.groups().iter() {
            group.stop_monitoring(item_id);
        }
    }

    /// Applies staged changes in every group and retires the empty ones.
    /// Group work runs outside the registry lock.
    pub fn apply_changes(&self) {
        let snapshot: Vec<Arc<SamplingGroup>> = self.groups().clone();
        let empty: Vec<Arc<SamplingGroup>> = snapshot.into_iter().filter(|g| g.apply_changes()).collect();
        if empty.is_empty() {
            return;
        }
        let retired: Vec<Arc<SamplingGroup>> = {
            let mut groups = self.groups();
            let mut retired = Vec::new();
            // A group may have been refilled since it reported empty.
            groups.retain(|g| {
                let retire = empty.iter().any(|e| Arc::ptr_eq(e, g)) && g.is_empty() && !g.has_pending();
                if retire {
                    retired.push(Arc::clone(g));
                }
                !retire
            });
            retired
        };
        for group in retired {
            debug!(interval_ms = group.interval(), "retiring sampling group");
            group.shutdown();
        }
    }

    /// Stops every group.
    pub fn shutdown(&self) {
        let groups = std::mem::take(&mut *self.groups());
        for group in groups {
            group.shutdown();
        }
    }

    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups().len()
    }

    /// Intervals of the live groups.
    #[must_use]
    pub fn group_intervals(&self) -> Vec<f64> {
        self.groups().iter().map(|g| g.interval()).collect()
    }

    /// The group holding `item_id`, if any.
    #[must_use]
    pub fn group_of(&self, item_id: u32) -> Option<Arc<SamplingGroup>> {
        self.groups().iter().find(|g| g.contains(item_id)).cloned()
    }

    fn groups(&self) -> MutexGuard<'_, Vec<Arc<SamplingGroup>>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
