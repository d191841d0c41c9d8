//! Ordered timeout store
//!
//! Min-heap of (deadline, insertion-seq, fiber) with lazy cancellation:
//! removal only deletes the side-table ticket, and stale heap entries are
//! skipped when the head is inspected. This keeps insert/remove cheap for
//! the common await-then-complete-before-timeout pattern.
//!
//! # Complexity
//!
//! - Add: O(log n)
//! - Remove: O(1)
//! - Next timeout / drain: O(k log n) over k stale or due entries

use strand_core::FiberId;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// Heap entry; ordered ascending by deadline, ties broken by insertion
/// order.
struct HeapEntry {
    due: Instant,
    seq: u64,
    id: FiberId,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first),
        // insertion order on equal deadlines.
        match other.due.cmp(&self.due) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

/// Side-table entry proving a fiber's timer is still armed.
struct Ticket {
    seq: u64,
    /// None for entries that never expire (negative duration).
    due: Option<Instant>,
}

/// Ordered store of (fiber, deadline) items.
///
/// A fiber holds at most one ticket; re-adding replaces the previous one.
pub struct TimerQueue {
    heap: BinaryHeap<HeapEntry>,
    active: HashMap<FiberId, Ticket>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            active: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Arm a timer for `id` expiring in `duration_ms` milliseconds.
    /// Negative duration stores an item that never expires.
    pub fn add(&mut self, id: FiberId, duration_ms: i64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if duration_ms < 0 {
            self.active.insert(id, Ticket { seq, due: None });
            return;
        }
        let due = Instant::now() + Duration::from_millis(duration_ms as u64);
        self.active.insert(id, Ticket { seq, due: Some(due) });
        self.heap.push(HeapEntry { due, seq, id });
    }

    /// Disarm `id`'s timer. Idempotent.
    pub fn remove(&mut self, id: FiberId) {
        self.active.remove(&id);
    }

    /// Whether `id` currently holds a ticket (finite or not).
    pub fn contains(&self, id: FiberId) -> bool {
        self.active.contains_key(&id)
    }

    /// Number of armed items, including never-expiring ones.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Drop cancelled/replaced entries sitting at the heap head.
    fn drop_stale(&mut self) {
        while let Some(head) = self.heap.peek() {
            let live = self
                .active
                .get(&head.id)
                .is_some_and(|ticket| ticket.seq == head.seq);
            if live {
                break;
            }
            self.heap.pop();
        }
        if self.heap.is_empty() && self.active.is_empty() {
            self.next_seq = 0;
        }
    }

    /// Milliseconds until the earliest finite deadline, rounded up so a
    /// poll sleeping this long can never return before the deadline.
    /// `0` when something is already due, `-1` when nothing can expire.
    pub fn next_timeout(&mut self) -> i32 {
        self.drop_stale();
        let Some(head) = self.heap.peek() else {
            return -1;
        };
        let now = Instant::now();
        if head.due <= now {
            return 0;
        }
        let delta = head.due - now;
        delta
            .as_nanos()
            .div_ceil(1_000_000)
            .min(i32::MAX as u128) as i32
    }

    /// Pop up to `cap` due items into `buf`, earliest deadline first,
    /// insertion order on ties. Returns the number appended.
    pub fn drain_due(&mut self, buf: &mut Vec<FiberId>, cap: usize) -> usize {
        let now = Instant::now();
        let mut n = 0;
        while n < cap {
            self.drop_stale();
            let due = self.heap.peek().is_some_and(|head| head.due <= now);
            if !due {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry");
            self.active.remove(&entry.id);
            buf.push(entry.id);
            n += 1;
        }
        n
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_all(q: &mut TimerQueue) -> Vec<FiberId> {
        let mut buf = Vec::new();
        q.drain_due(&mut buf, usize::MAX);
        buf
    }

    #[test]
    fn test_ordering() {
        let mut q = TimerQueue::new();
        // Insert out of order; everything already due.
        q.add(FiberId::new(3), 0);
        q.add(FiberId::new(1), 0);
        q.add(FiberId::new(2), 0);

        // Same deadline resolution tier: insertion order decides.
        let due = drain_all(&mut q);
        assert_eq!(due, vec![FiberId::new(3), FiberId::new(1), FiberId::new(2)]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_deadline_order_beats_insertion_order() {
        let mut q = TimerQueue::new();
        q.add(FiberId::new(1), 30_000);
        q.add(FiberId::new(2), 0);

        let mut buf = Vec::new();
        q.drain_due(&mut buf, 8);
        assert_eq!(buf, vec![FiberId::new(2)]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut q = TimerQueue::new();
        q.add(FiberId::new(7), 10_000);
        assert!(q.contains(FiberId::new(7)));

        q.remove(FiberId::new(7));
        assert!(!q.contains(FiberId::new(7)));
        q.remove(FiberId::new(7));

        assert!(drain_all(&mut q).is_empty());
        assert_eq!(q.next_timeout(), -1);
    }

    #[test]
    fn test_re_add_replaces() {
        let mut q = TimerQueue::new();
        q.add(FiberId::new(7), 60_000);
        q.add(FiberId::new(7), 0);

        // Only the replacement fires; the first entry is stale.
        let due = drain_all(&mut q);
        assert_eq!(due, vec![FiberId::new(7)]);
        assert!(drain_all(&mut q).is_empty());
    }

    #[test]
    fn test_infinite_entry_never_expires() {
        let mut q = TimerQueue::new();
        q.add(FiberId::new(1), -1);
        assert!(q.contains(FiberId::new(1)));
        assert_eq!(q.len(), 1);

        // Nothing can expire: wait indefinitely.
        assert_eq!(q.next_timeout(), -1);
        assert!(drain_all(&mut q).is_empty());
        assert!(q.contains(FiberId::new(1)));
    }

    #[test]
    fn test_next_timeout_rounds_up() {
        let mut q = TimerQueue::new();
        q.add(FiberId::new(1), 50);
        let t = q.next_timeout();
        assert!(t > 0 && t <= 51, "timeout {} out of range", t);
    }

    #[test]
    fn test_next_timeout_due_now() {
        let mut q = TimerQueue::new();
        q.add(FiberId::new(1), 0);
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(q.next_timeout(), 0);
    }

    #[test]
    fn test_drain_respects_cap() {
        let mut q = TimerQueue::new();
        for i in 0..10 {
            q.add(FiberId::new(i), 0);
        }
        let mut buf = Vec::new();
        assert_eq!(q.drain_due(&mut buf, 4), 4);
        assert_eq!(buf.len(), 4);
        assert_eq!(q.len(), 6);
        assert_eq!(q.drain_due(&mut buf, usize::MAX), 6);
    }
}
