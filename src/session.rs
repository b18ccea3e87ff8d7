//! Caller identity and per-request context.
//!
//! The session layer itself is an external collaborator; this module holds
//! only what the dispatcher needs from it: the security context used by the
//! permission gates, the session-scoped continuation points, and the
//! cancellation/deadline flag of a single request.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::continuation::{ContinuationPoint, ContinuationPointId, ContinuationTable};
use crate::error::{ServiceError, ServiceResult};
use crate::node_id::NodeId;
use crate::security::SecurityMode;
use crate::status::StatusCode;

/// Default number of continuation points a session may hold.
pub const DEFAULT_SESSION_CONTINUATION_POINTS: usize = 10;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Creates a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The nil id used by the internal system session.
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The security context of a connected client.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    security_mode: SecurityMode,
    secure_transport: bool,
    has_session: bool,
    granted_roles: Vec<NodeId>,
    system: bool,
    continuation_points: Mutex<ContinuationTable>,
    active: AtomicBool,
}

impl Session {
    /// Starts building an activated session.
    #[must_use]
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// The internal session used by sampling loops and startup. It bypasses
    /// both permission gates.
    #[must_use]
    pub fn system() -> Self {
        Self {
            id: SessionId::nil(),
            security_mode: SecurityMode::SignAndEncrypt,
            secure_transport: true,
            has_session: true,
            granted_roles: Vec::new(),
            system: true,
            continuation_points: Mutex::new(ContinuationTable::new(DEFAULT_SESSION_CONTINUATION_POINTS)),
            active: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub const fn security_mode(&self) -> SecurityMode {
        self.security_mode
    }

    /// True when the transport itself is secure (e.g. a TLS based transport).
    #[must_use]
    pub const fn secure_transport(&self) -> bool {
        self.secure_transport
    }

    /// False for session-less service calls.
    #[must_use]
    pub const fn has_session(&self) -> bool {
        self.has_session
    }

    #[must_use]
    pub fn granted_roles(&self) -> &[NodeId] {
        &self.granted_roles
    }

    #[must_use]
    pub const fn is_system(&self) -> bool {
        self.system
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Ends the session and disposes every continuation point it holds.
    /// Returns how many points were disposed.
    pub fn close(&self) -> usize {
        self.active.store(false, Ordering::Release);
        let disposed = match self.continuation_points.lock() {
            Ok(mut table) => table.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        };
        debug!(session_id = %self.id, disposed, "session closed");
        disposed
    }

    /// Stores a continuation point. When the session budget is full the
    /// oldest point is evicted and its id returned.
    pub fn store_continuation_point(
        &self,
        point: ContinuationPoint,
    ) -> Result<Option<ContinuationPointId>, StatusCode> {
        if !self.is_active() {
            return Err(StatusCode::BadSessionIdInvalid);
        }
        let mut table = self.table()?;
        let evicted = table.store(point);
        if let Some(id) = evicted {
            debug!(session_id = %self.id, continuation_point = %id, "evicted oldest continuation point");
        }
        Ok(evicted)
    }

    /// Removes and returns a continuation point.
    pub fn take_continuation_point(&self, id: ContinuationPointId) -> Result<Option<ContinuationPoint>, StatusCode> {
        if !self.is_active() {
            return Err(StatusCode::BadSessionIdInvalid);
        }
        Ok(self.table()?.take(id))
    }

    /// Disposes a continuation point; returns whether it existed.
    pub fn release_continuation_point(&self, id: ContinuationPointId) -> bool {
        self.table().map(|mut t| t.release(id)).unwrap_or(false)
    }

    /// Number of live continuation points.
    #[must_use]
    pub fn continuation_point_count(&self) -> usize {
        self.table().map(|t| t.len()).unwrap_or(0)
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, ContinuationTable>, StatusCode> {
        self.continuation_points
            .lock()
            .map_err(|_| StatusCode::BadInternalError)
    }
}

/// Builder for [`Session`].
#[derive(Debug, Clone)]
pub struct SessionBuilder {
    security_mode: SecurityMode,
    secure_transport: bool,
    has_session: bool,
    granted_roles: Vec<NodeId>,
    max_continuation_points: usize,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self {
            security_mode: SecurityMode::None,
            secure_transport: false,
            has_session: true,
            granted_roles: Vec::new(),
            max_continuation_points: DEFAULT_SESSION_CONTINUATION_POINTS,
        }
    }
}

impl SessionBuilder {
    #[must_use]
    pub const fn security_mode(mut self, mode: SecurityMode) -> Self {
        self.security_mode = mode;
        self
    }

    #[must_use]
    pub const fn secure_transport(mut self, secure: bool) -> Self {
        self.secure_transport = secure;
        self
    }

    /// Marks the caller as session-less.
    #[must_use]
    pub const fn without_session(mut self) -> Self {
        self.has_session = false;
        self
    }

    #[must_use]
    pub fn granted_roles(mut self, roles: Vec<NodeId>) -> Self {
        self.granted_roles = roles;
        self
    }

    #[must_use]
    pub const fn max_continuation_points(mut self, max: usize) -> Self {
        self.max_continuation_points = max;
        self
    }

    #[must_use]
    pub fn build(self) -> Session {
        Session {
            id: SessionId::new(),
            security_mode: self.security_mode,
            secure_transport: self.secure_transport,
            has_session: self.has_session,
            granted_roles: self.granted_roles,
            system: false,
            continuation_points: Mutex::new(ContinuationTable::new(self.max_continuation_points)),
            active: AtomicBool::new(true),
        }
    }
}

/// Per-request context handed to every service and manager call.
#[derive(Debug, Clone)]
pub struct OperationContext {
    session: Arc<Session>,
    started: Instant,
    deadline: Option<Instant>,
    cancel: Arc<AtomicBool>,
}

impl OperationContext {
    /// A context without deadline.
    #[must_use]
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            started: Instant::now(),
            deadline: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A context for internal work.
    #[must_use]
    pub fn system() -> Self {
        Self::new(Arc::new(Session::system()))
    }

    /// Fails the request once `timeout` has elapsed.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(self.started + timeout);
        self
    }

    /// Shares a cancellation flag with the session layer.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The flag the session layer sets to cancel this request.
    #[must_use]
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Checked between items. `completed` is the number of items already
    /// finished, reported back in the error.
    pub fn check(&self, completed: usize) -> ServiceResult<()> {
        if self.is_cancelled() {
            return Err(ServiceError::Cancelled { completed });
        }
        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            if now >= deadline {
                let elapsed = now.duration_since(self.started);
                return Err(ServiceError::Timeout {
                    duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::BrowseCursor;
    use crate::manager::ManagerId;

    fn point() -> ContinuationPoint {
        ContinuationPoint::new(ManagerId(0), NodeId::ns0(85), 1, BrowseCursor::default())
    }

    #[test]
    fn close_disposes_points() {
        let session = Session::builder().build();
        let p = point();
        let id = p.id;
        session.store_continuation_point(p).unwrap();
        assert_eq!(session.continuation_point_count(), 1);
        assert_eq!(session.close(), 1);
        assert_eq!(
            session.take_continuation_point(id).unwrap_err(),
            StatusCode::BadSessionIdInvalid
        );
    }

    #[test]
    fn session_budget_evicts_oldest() {
        let session = Session::builder().max_continuation_points(1).build();
        let first = point();
        let first_id = first.id;
        assert_eq!(session.store_continuation_point(first).unwrap(), None);
        assert_eq!(session.store_continuation_point(point()).unwrap(), Some(first_id));
    }

    #[test]
    fn context_cancellation() {
        let ctx = OperationContext::new(Arc::new(Session::builder().build()));
        assert!(ctx.check(0).is_ok());
        ctx.cancel();
        let err = ctx.check(4).unwrap_err();
        assert!(matches!(err, ServiceError::Cancelled { completed: 4 }));
    }

    #[test]
    fn context_deadline() {
        let ctx = OperationContext::system().with_timeout(Duration::ZERO);
        assert!(matches!(ctx.check(0), Err(ServiceError::Timeout { .. })));
    }
}
