//! Ring-bounded tracker of finalized query identifiers
//!
//! Every message carrying a `qid` is recorded here by the processor loop.
//! Callers waiting on a query count occurrences inside the current window,
//! not over the whole session history, so a response can slide out of the
//! window before a slow caller looks at it.

use std::collections::VecDeque;

use super::DEFAULT_TRACKER_CAPACITY;

/// Fixed-capacity FIFO of recently finalized query identifiers
#[derive(Debug, Clone)]
pub struct IdTracker {
    ids: VecDeque<i64>,
    capacity: usize,
}

impl Default for IdTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKER_CAPACITY)
    }
}

impl IdTracker {
    /// Create a tracker holding at most `capacity` identifiers (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ids: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Maximum number of identifiers kept in the window
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of identifiers currently in the window
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when nothing has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Append an identifier, returning the evicted oldest one when full
    pub fn record(&mut self, id: i64) -> Option<i64> {
        let evicted = if self.ids.len() >= self.capacity {
            self.ids.pop_front()
        } else {
            None
        };
        self.ids.push_back(id);
        evicted
    }

    /// True if `id` is anywhere in the current window
    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    /// Copy of the current window, oldest first
    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            ids: self.ids.iter().copied().collect(),
        }
    }
}

/// Immutable copy of the tracker window taken at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackerSnapshot {
    ids: Vec<i64>,
}

impl TrackerSnapshot {
    /// How many times `id` appears in the window
    pub fn count(&self, id: i64) -> usize {
        self.ids.iter().filter(|&&x| x == id).count()
    }

    /// True if `id` appears at least once
    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    /// Identifiers oldest first, newest last
    pub fn as_slice(&self) -> &[i64] {
        &self.ids
    }

    /// Number of identifiers in the snapshot
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// True when the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
