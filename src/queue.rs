//! Bounded priority queue for not-yet-sent payloads
//!
//! The in-memory pre-send tier. On overflow only the oldest
//! normal-priority entry may be evicted; if the oldest entry carries a
//! higher priority the push is refused and the caller routes the
//! payload to the durable overflow store instead. Pop serves critical
//! entries first, then strict FIFO.

use crate::clock::Clock;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Payload priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Priority {
    /// Standard telemetry, evictable under pressure
    #[default]
    Normal = 0,
    /// Not evictable, but does not jump the send order
    High = 1,
    /// Not evictable and served before anything else
    Critical = 2,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// A queued payload
///
/// Generic over the payload type so that callers can keep delivery
/// bookkeeping attached to the entry it belongs to; whatever is evicted
/// or refused takes its bookkeeping with it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry<T> {
    /// The queued payload
    pub payload: T,
    /// Enqueue time in clock milliseconds
    pub enqueue_ms: u64,
    /// Priority assigned at enqueue time
    pub priority: Priority,
}

/// Outcome of a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Entry stored
    Stored,
    /// Entry stored after evicting the oldest normal-priority entry
    StoredEvicted,
    /// Queue full and the oldest entry outranks normal; nothing dropped
    Refused,
    /// Lock contended; try again later
    Busy,
}

impl PushOutcome {
    /// Whether the entry now resides in the queue
    pub fn is_stored(&self) -> bool {
        matches!(self, Self::Stored | Self::StoredEvicted)
    }
}

/// Outcome of a pop
#[derive(Debug, Clone, PartialEq)]
pub enum PopOutcome<T> {
    /// Next entry to send
    Entry(QueueEntry<T>),
    /// Queue empty
    Empty,
    /// Lock contended; try again later
    Busy,
}

/// Fixed-capacity priority queue
///
/// All mutating operations are serialized by one lock acquired
/// non-blockingly; a contended call reports `Busy` rather than waiting
/// or losing data. Pop compaction is O(n), acceptable for the small
/// capacities this runs at.
pub struct PriorityQueue<T> {
    inner: Mutex<VecDeque<QueueEntry<T>>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl<T> PriorityQueue<T> {
    /// Create a queue with the default capacity of 100 entries
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(100, clock)
    }

    /// Create a queue with an explicit capacity
    pub fn with_capacity(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            clock,
        }
    }

    /// Enqueue a payload
    pub fn push(&self, payload: T, priority: Priority) -> PushOutcome {
        let Ok(mut queue) = self.inner.try_lock() else {
            return PushOutcome::Busy;
        };

        let mut evicted = false;
        if queue.len() >= self.capacity {
            match queue.front() {
                Some(oldest) if oldest.priority == Priority::Normal => {
                    queue.pop_front();
                    evicted = true;
                    log::warn!("queue: full, evicted oldest normal entry");
                }
                _ => return PushOutcome::Refused,
            }
        }

        queue.push_back(QueueEntry {
            payload,
            enqueue_ms: self.clock.now_ms(),
            priority,
        });

        if evicted {
            PushOutcome::StoredEvicted
        } else {
            PushOutcome::Stored
        }
    }

    /// Dequeue the next payload to send
    ///
    /// The critical entry nearest the head wins; otherwise strict FIFO.
    /// Entries behind the removed one keep their relative order.
    pub fn pop(&self) -> PopOutcome<T> {
        let Ok(mut queue) = self.inner.try_lock() else {
            return PopOutcome::Busy;
        };

        if queue.is_empty() {
            return PopOutcome::Empty;
        }

        let index = queue
            .iter()
            .position(|e| e.priority == Priority::Critical)
            .unwrap_or(0);

        match queue.remove(index) {
            Some(entry) => PopOutcome::Entry(entry),
            None => PopOutcome::Empty,
        }
    }

    /// Number of queued entries (0 when the lock is contended)
    pub fn len(&self) -> usize {
        self.inner.try_lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Whether the queue holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn queue(capacity: usize) -> PriorityQueue<Vec<u8>> {
        PriorityQueue::with_capacity(capacity, Arc::new(ManualClock::new()))
    }

    fn payload(i: usize) -> Vec<u8> {
        format!("{{\"seq\":{}}}", i).into_bytes()
    }

    #[test]
    fn test_fifo_order() {
        let q = queue(10);
        for i in 0..3 {
            assert_eq!(q.push(payload(i), Priority::Normal), PushOutcome::Stored);
        }

        for i in 0..3 {
            let PopOutcome::Entry(entry) = q.pop() else {
                panic!("expected entry");
            };
            assert_eq!(entry.payload, payload(i));
        }
        assert_eq!(q.pop(), PopOutcome::Empty);
    }

    #[test]
    fn test_critical_served_first() {
        let q = queue(10);
        q.push(payload(0), Priority::Normal);
        q.push(payload(1), Priority::High);
        q.push(payload(2), Priority::Critical);
        q.push(payload(3), Priority::Normal);
        q.push(payload(4), Priority::Critical);

        let order: Vec<Vec<u8>> = std::iter::from_fn(|| match q.pop() {
            PopOutcome::Entry(e) => Some(e.payload),
            _ => None,
        })
        .collect();

        // Criticals in arrival order, then the rest FIFO
        assert_eq!(
            order,
            vec![payload(2), payload(4), payload(0), payload(1), payload(3)]
        );
    }

    #[test]
    fn test_high_does_not_jump_queue() {
        let q = queue(10);
        q.push(payload(0), Priority::Normal);
        q.push(payload(1), Priority::High);

        let PopOutcome::Entry(first) = q.pop() else {
            panic!("expected entry");
        };
        assert_eq!(first.payload, payload(0));
    }

    #[test]
    fn test_overflow_evicts_oldest_normal() {
        let q = queue(3);
        for i in 0..3 {
            q.push(payload(i), Priority::Normal);
        }

        assert_eq!(q.push(payload(3), Priority::Normal), PushOutcome::StoredEvicted);
        assert_eq!(q.len(), 3);

        let PopOutcome::Entry(head) = q.pop() else {
            panic!("expected entry");
        };
        // Entry 0 was evicted, 1 survives as the oldest
        assert_eq!(head.payload, payload(1));
    }

    #[test]
    fn test_overflow_refuses_when_oldest_outranks_normal() {
        let q = queue(2);
        q.push(payload(0), Priority::Critical);
        q.push(payload(1), Priority::Critical);

        assert_eq!(q.push(payload(2), Priority::Normal), PushOutcome::Refused);
        assert_eq!(q.len(), 2, "refusal must not drop anything");

        let PopOutcome::Entry(head) = q.pop() else {
            panic!("expected entry");
        };
        assert_eq!(head.payload, payload(0));
    }

    #[test]
    fn test_refusal_with_high_priority_head() {
        let q = queue(1);
        q.push(payload(0), Priority::High);
        assert_eq!(q.push(payload(1), Priority::Normal), PushOutcome::Refused);
    }

    #[test]
    fn test_empty_pop() {
        let q = queue(4);
        assert_eq!(q.pop(), PopOutcome::Empty);
        assert!(q.is_empty());
        assert_eq!(q.capacity(), 4);
    }
}
