//! Browse continuation points.
//!
//! A continuation point captures the unread tail of a browse so a bounded
//! response can be resumed by BrowseNext. Points belong to a session and are
//! stored in that session's `ContinuationTable`. Taking a point removes it, so
//! at most one caller can advance a given enumerator.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::browse::ReferenceDescription;
use crate::manager::ManagerId;
use crate::node_id::NodeId;

/// Opaque handle returned to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContinuationPointId(Uuid);

impl ContinuationPointId {
    /// Creates a new random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The byte-string form sent on the wire.
    #[must_use]
    pub fn to_bytes(self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    /// Parses the byte-string form; anything malformed is `None`.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        Uuid::from_slice(bytes).ok().map(Self)
    }
}

impl Default for ContinuationPointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContinuationPointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The partially consumed enumerator of one browse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrowseCursor {
    remaining: VecDeque<ReferenceDescription>,
}

impl BrowseCursor {
    /// Wraps the references not yet returned.
    #[must_use]
    pub fn new(references: impl IntoIterator<Item = ReferenceDescription>) -> Self {
        Self {
            remaining: references.into_iter().collect(),
        }
    }

    /// Removes and returns up to `max` references; 0 means no limit.
    pub fn next_page(&mut self, max: usize) -> Vec<ReferenceDescription> {
        let take = if max == 0 { self.remaining.len() } else { max.min(self.remaining.len()) };
        self.remaining.drain(..take).collect()
    }

    /// Returns true when nothing remains.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining.is_empty()
    }

    /// Number of references not yet returned.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

/// A stored browse continuation.
#[derive(Debug, Clone, PartialEq)]
pub struct ContinuationPoint {
    /// Handle given to the client.
    pub id: ContinuationPointId,
    /// Manager that produced the enumeration.
    pub manager: ManagerId,
    /// Node the browse started from.
    pub node_id: NodeId,
    /// Page size requested by the original browse.
    pub max_references: usize,
    /// Unread tail.
    pub cursor: BrowseCursor,
}

impl ContinuationPoint {
    /// Creates a point with a fresh id.
    #[must_use]
    pub fn new(manager: ManagerId, node_id: NodeId, max_references: usize, cursor: BrowseCursor) -> Self {
        Self {
            id: ContinuationPointId::new(),
            manager,
            node_id,
            max_references,
            cursor,
        }
    }
}

/// Per-session store of live continuation points.
///
/// Bounded; when full, storing a new point evicts the oldest one.
#[derive(Debug)]
pub struct ContinuationTable {
    points: VecDeque<ContinuationPoint>,
    capacity: usize,
}

impl ContinuationTable {
    /// Creates a table that holds at most `capacity` points.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            points: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Stores a point; returns the id of the point evicted to make room.
    pub fn store(&mut self, point: ContinuationPoint) -> Option<ContinuationPointId> {
        let evicted = if self.points.len() >= self.capacity {
            self.points.pop_front().map(|p| p.id)
        } else {
            None
        };
        self.points.push_back(point);
        evicted
    }

    /// Removes and returns a point.
    pub fn take(&mut self, id: ContinuationPointId) -> Option<ContinuationPoint> {
        let pos = self.points.iter().position(|p| p.id == id)?;
        self.points.remove(pos)
    }

    /// Disposes a point; returns whether it existed.
    pub fn release(&mut self, id: ContinuationPointId) -> bool {
        self.take(id).is_some()
    }

    /// Disposes every point; returns how many there were.
    pub fn clear(&mut self) -> usize {
        let n = self.points.len();
        self.points.clear();
        n
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: ContinuationPointId) -> bool {
        self.points.iter().any(|p| p.id == id)
    }
}
