//! Sampling groups: periodic batched reads for monitored items sharing one
//! quantized interval.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::ConfigError;
use crate::service::ReadValueId;
use crate::session::{OperationContext, SessionId};
use crate::status::StatusCode;
use crate::value::DataValue;

use super::monitored_item::{MonitoredItem, MonitoringMode};

/// Shortest loop period; interval 0 would otherwise spin.
const MIN_LOOP_INTERVAL_MS: f64 = 1.0;

/// One rung of the sampling-rate ladder: `start + increment * i` for
/// `i in 0..count`, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplingRateBand {
    /// First representable interval.
    pub start: f64,
    /// Step between representable intervals.
    pub increment: f64,
    /// Number of representable intervals.
    pub count: u32,
}

impl SamplingRateBand {
    #[must_use]
    pub const fn new(start: f64, increment: f64, count: u32) -> Self {
        Self {
            start,
            increment,
            count,
        }
    }

    /// Largest representable interval.
    #[must_use]
    pub fn max(&self) -> f64 {
        self.start + self.increment * f64::from(self.count.saturating_sub(1))
    }

    /// Rejects bands that represent nothing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.start.is_finite() || !self.increment.is_finite() {
            return Err(ConfigError::InvalidSamplingRate {
                reason: "band values must be finite".to_string(),
            });
        }
        if self.start < 0.0 {
            return Err(ConfigError::InvalidSamplingRate {
                reason: format!("band start {} is negative", self.start),
            });
        }
        if self.increment <= 0.0 {
            return Err(ConfigError::InvalidSamplingRate {
                reason: format!("band increment {} must be positive", self.increment),
            });
        }
        if self.count == 0 {
            return Err(ConfigError::InvalidSamplingRate {
                reason: "band count must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Rounds `requested` up to the nearest representable value of the first
/// band whose range covers it. Falls through to `requested` when no band
/// does.
#[must_use]
pub fn quantize(bands: &[SamplingRateBand], requested: f64) -> f64 {
    for band in bands {
        if band.max() < requested {
            continue;
        }
        if requested <= band.start {
            return band.start;
        }
        for i in 0..band.count {
            let candidate = band.start + band.increment * f64::from(i);
            if candidate >= requested {
                return candidate;
            }
        }
    }
    requested
}

/// Batch reader used by the sampling loop. Implemented by node managers.
pub trait SampleReader: Send + Sync {
    /// Reads every item; returns one value per item, in order.
    fn read_samples(&self, ctx: &OperationContext, items: &[ReadValueId]) -> Vec<DataValue>;
}

#[derive(Debug, Default)]
struct Members {
    items: Vec<Arc<MonitoredItem>>,
    pending_add: Vec<Arc<MonitoredItem>>,
    pending_remove: Vec<u32>,
}

struct GroupShared {
    interval: f64,
    members: Mutex<Members>,
    reader: Weak<dyn SampleReader>,
    cycles: AtomicU64,
}

impl GroupShared {
    fn members(&self) -> MutexGuard<'_, Members> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads `items` through the reader and pushes the values. Returns
    /// false when the reader is gone.
    fn sample(&self, ctx: &OperationContext, items: &[Arc<MonitoredItem>]) -> bool {
        let Some(reader) = self.reader.upgrade() else {
            return false;
        };
        let active: Vec<&Arc<MonitoredItem>> = items
            .iter()
            .filter(|i| i.monitoring_mode() != MonitoringMode::Disabled)
            .collect();
        if active.is_empty() {
            return true;
        }
        let requests: Vec<ReadValueId> = active.iter().map(|i| i.item_to_monitor().clone()).collect();
        let read = panic::catch_unwind(AssertUnwindSafe(|| reader.read_samples(ctx, &requests)));
        match read {
            Ok(values) => {
                if values.len() != active.len() {
                    warn!(
                        interval_ms = self.interval,
                        expected = active.len(),
                        got = values.len(),
                        "sample reader returned wrong number of values"
                    );
                }
                let mut values = values.into_iter();
                for item in active {
                    match values.next() {
                        Some(v) => item.queue_value(v, None),
                        None => item.queue_value(DataValue::default(), Some(StatusCode::BadInternalError)),
                    };
                }
            }
            Err(_) => {
                error!(interval_ms = self.interval, items = active.len(), "sample reader panicked");
                for item in active {
                    item.queue_value(DataValue::default(), Some(StatusCode::BadUnexpectedError));
                }
            }
        }
        true
    }
}

struct Worker {
    stop_tx: Sender<()>,
    join: JoinHandle<()>,
}

/// A bucket of monitored items polled together.
pub struct SamplingGroup {
    session_id: SessionId,
    diagnostics_mask: u32,
    shared: Arc<GroupShared>,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for SamplingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplingGroup")
            .field("session_id", &self.session_id)
            .field("interval", &self.shared.interval)
            .field("diagnostics_mask", &self.diagnostics_mask)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl SamplingGroup {
    /// Creates an idle group. The loop starts on the first non-empty
    /// [`apply_changes`](Self::apply_changes).
    #[must_use]
    pub fn new(session_id: SessionId, interval: f64, diagnostics_mask: u32, reader: Weak<dyn SampleReader>) -> Self {
        Self {
            session_id,
            diagnostics_mask,
            shared: Arc::new(GroupShared {
                interval,
                members: Mutex::new(Members::default()),
                reader,
                cycles: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Quantized interval in milliseconds.
    #[must_use]
    pub fn interval(&self) -> f64 {
        self.shared.interval
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub const fn diagnostics_mask(&self) -> u32 {
        self.diagnostics_mask
    }

    /// True when an item with these properties belongs in this group.
    #[must_use]
    pub fn accepts(&self, session_id: SessionId, interval: f64, diagnostics_mask: u32) -> bool {
        self.session_id == session_id
            && self.diagnostics_mask == diagnostics_mask
            && self.shared.interval.to_bits() == interval.to_bits()
    }

    /// Stages an item for addition.
    pub fn start_monitoring(&self, item: Arc<MonitoredItem>) {
        let mut members = self.shared.members();
        let id = item.id();
        members.pending_remove.retain(|r| *r != id);
        if !members.pending_add.iter().any(|i| i.id() == id) {
            members.pending_add.push(item);
        }
    }

    /// Stages an item for removal.
    pub fn stop_monitoring(&self, item_id: u32) {
        let mut members = self.shared.members();
        members.pending_add.retain(|i| i.id() != item_id);
        if members.items.iter().any(|i| i.id() == item_id) && !members.pending_remove.contains(&item_id) {
            members.pending_remove.push(item_id);
        }
    }

    /// True when the item is a member or staged for addition, and not
    /// staged for removal.
    #[must_use]
    pub fn contains(&self, item_id: u32) -> bool {
        let members = self.shared.members();
        if members.pending_remove.contains(&item_id) {
            return false;
        }
        members.items.iter().chain(&members.pending_add).any(|i| i.id() == item_id)
    }

    /// Number of active members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.members().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when staged changes await [`apply_changes`](Self::apply_changes).
    #[must_use]
    pub fn has_pending(&self) -> bool {
        let members = self.shared.members();
        !members.pending_add.is_empty() || !members.pending_remove.is_empty()
    }

    /// Completed poll cycles.
    #[must_use]
    pub fn cycle_count(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }

    /// Applies staged membership. New members get one immediate sample.
    /// Returns true when the group is now empty.
    pub fn apply_changes(&self) -> bool {
        let added = {
            let mut members = self.shared.members();
            let removed = std::mem::take(&mut members.pending_remove);
            members.items.retain(|i| !removed.contains(&i.id()));
            let added = std::mem::take(&mut members.pending_add);
            members.items.extend(added.iter().cloned());
            if members.items.is_empty() {
                return true;
            }
            added
        };
        if !added.is_empty() {
            let ctx = OperationContext::system();
            self.shared.sample(&ctx, &added);
        }
        self.ensure_started();
        false
    }

    /// Stops the loop and waits for it to exit.
    pub fn shutdown(&self) {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(worker) = worker else {
            return;
        };
        drop(worker.stop_tx);
        if worker.join.thread().id() == thread::current().id() {
            return;
        }
        if worker.join.join().is_err() {
            error!(interval_ms = self.shared.interval, "sampling thread panicked");
        }
    }

    /// True while the loop thread is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|w| !w.join.is_finished())
    }

    fn ensure_started(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(|w| !w.join.is_finished()) {
            return;
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let name = format!("ua-sampling-{}ms", self.shared.interval);
        let spawned = thread::Builder::new().name(name).spawn(move || {
            let period = Duration::from_secs_f64(shared.interval.max(MIN_LOOP_INTERVAL_MS) / 1000.0);
            let ctx = OperationContext::system();
            let mut wait = period;
            loop {
                match stop_rx.recv_timeout(wait) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let started = Instant::now();
                let snapshot = shared.members().items.clone();
                if !shared.sample(&ctx, &snapshot) {
                    debug!(interval_ms = shared.interval, "sample reader dropped; stopping loop");
                    break;
                }
                shared.cycles.fetch_add(1, Ordering::Relaxed);
                wait = next_delay(period, started.elapsed());
            }
        });
        match spawned {
            Ok(join) => {
                debug!(interval_ms = self.shared.interval, "sampling loop started");
                *worker = Some(Worker { stop_tx, join });
            }
            Err(err) => {
                error!(interval_ms = self.shared.interval, error = %err, "failed to spawn sampling thread");
            }
        }
    }
}

impl Drop for SamplingGroup {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Delay before the next cycle: the rest of the period, or when the cycle
/// overran, `2 * period - elapsed` clamped at zero.
#[must_use]
pub fn next_delay(period: Duration, elapsed: Duration) -> Duration {
    if elapsed <= period {
        period - elapsed
    } else {
        (period * 2).saturating_sub(elapsed)
    }
}
