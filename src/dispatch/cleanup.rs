//! Deferred removal of cross-manager back-references.
//!
//! A manager that deletes a node cannot touch edges held by other managers
//! without taking their locks while holding its own. It queues those edges
//! here after releasing its lock; a dedicated worker hands each one to the
//! owner of the node carrying it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendError, Sender};
use tracing::{debug, error, warn};

use crate::address_space::ExternalReference;
use crate::error::ServiceError;
use crate::node_id::NodeId;

use super::registry::Registry;

pub(crate) enum CleanupMsg {
    Dangling {
        deleted: NodeId,
        references: Vec<ExternalReference>,
    },
    Flush {
        reply: Sender<()>,
    },
    Shutdown,
}

/// Producer side of the cleanup queue, cloned into every manager context.
#[derive(Clone)]
pub struct CleanupSender {
    tx: Sender<CleanupMsg>,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for CleanupSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupSender")
            .field("queued", &self.tx.len())
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl CleanupSender {
    /// Queues the dangling edges left by deleting `deleted`. Blocks while
    /// the queue is full; callers must not hold a manager lock.
    pub fn schedule(&self, deleted: NodeId, references: Vec<ExternalReference>) -> bool {
        if references.is_empty() {
            return true;
        }
        let count = references.len();
        match self.tx.send(CleanupMsg::Dangling { deleted, references }) {
            Ok(()) => true,
            Err(SendError(_)) => {
                self.dropped.fetch_add(count as u64, Ordering::Relaxed);
                warn!(count, "cleanup worker stopped; dangling references dropped");
                false
            }
        }
    }

    /// References that could not be queued.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The worker thread and its queue.
pub(crate) struct CleanupWorker {
    sender: CleanupSender,
    join: Mutex<Option<JoinHandle<()>>>,
    removed: Arc<AtomicU64>,
}

impl CleanupWorker {
    /// Spawns the worker. `removed` counts the edges it deletes.
    pub(crate) fn start(capacity: usize, registry: Weak<Registry>, removed: Arc<AtomicU64>) -> Result<Self, ServiceError> {
        let (tx, rx) = bounded::<CleanupMsg>(capacity.max(1));
        let thread_removed = Arc::clone(&removed);
        let join = thread::Builder::new()
            .name("ua-reference-cleanup".to_string())
            .spawn(move || worker_loop(&rx, &registry, &thread_removed))
            .map_err(|err| ServiceError::internal(format!("failed to spawn cleanup worker: {err}")))?;
        Ok(Self {
            sender: CleanupSender {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            join: Mutex::new(Some(join)),
            removed,
        })
    }

    pub(crate) fn sender(&self) -> CleanupSender {
        self.sender.clone()
    }

    /// Edges removed so far.
    pub(crate) fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    /// Waits until everything queued before this call was processed.
    pub(crate) fn flush(&self, timeout: Duration) -> bool {
        let (reply, done) = bounded::<()>(1);
        if self.sender.tx.send(CleanupMsg::Flush { reply }).is_err() {
            return false;
        }
        done.recv_timeout(timeout).is_ok()
    }

    pub(crate) fn shutdown(&self) {
        let join = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(join) = join else {
            return;
        };
        let _ = self.sender.tx.send(CleanupMsg::Shutdown);
        if join.join().is_err() {
            error!("cleanup worker panicked");
        }
    }
}

impl Drop for CleanupWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: &Receiver<CleanupMsg>, registry: &Weak<Registry>, removed: &AtomicU64) {
    loop {
        let msg = match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => {
                if registry.strong_count() == 0 {
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match msg {
            CleanupMsg::Dangling { deleted, references } => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let mut count = 0;
                for reference in &references {
                    let Some(handle) = registry.resolve(&reference.node_id) else {
                        debug!(node_id = %reference.node_id, "dangling reference owner gone");
                        continue;
                    };
                    let Some(owner) = registry.manager(handle.manager) else {
                        continue;
                    };
                    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                        owner.delete_references(std::slice::from_ref(reference))
                    }));
                    match outcome {
                        Ok(n) => count += n,
                        Err(_) => error!(manager = %handle.manager, "manager panicked during reference cleanup"),
                    }
                }
                removed.fetch_add(count as u64, Ordering::Relaxed);
                debug!(node_id = %deleted, removed = count, queued = references.len(), "cleaned dangling references");
            }
            CleanupMsg::Flush { reply } => {
                let _ = reply.send(());
            }
            CleanupMsg::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::NamespaceTable;
    use crate::node::Reference;
    use crate::node_id::ids;

    fn dangling() -> Vec<ExternalReference> {
        vec![ExternalReference {
            node_id: ids::OBJECTS_FOLDER,
            reference: Reference::forward(ids::ORGANIZES, NodeId::numeric(2, 1)),
        }]
    }

    #[test]
    fn flush_waits_for_queued_work() {
        let registry = Arc::new(Registry::new(Arc::new(NamespaceTable::default())));
        let worker = CleanupWorker::start(4, Arc::downgrade(&registry), Arc::new(AtomicU64::new(0))).unwrap();
        assert!(worker.sender().schedule(NodeId::numeric(2, 1), dangling()));
        assert!(worker.flush(Duration::from_secs(2)));
        // No manager owns namespace 0 here.
        assert_eq!(worker.removed(), 0);
    }

    #[test]
    fn scheduling_after_shutdown_counts_drops() {
        let registry = Arc::new(Registry::new(Arc::new(NamespaceTable::default())));
        let worker = CleanupWorker::start(4, Arc::downgrade(&registry), Arc::new(AtomicU64::new(0))).unwrap();
        let sender = worker.sender();
        worker.shutdown();
        assert!(!sender.schedule(NodeId::numeric(2, 1), dangling()));
        assert_eq!(sender.dropped(), 1);
        assert!(!worker.flush(Duration::from_millis(50)));
        assert!(sender.schedule(NodeId::numeric(2, 1), Vec::new()));
    }
}
