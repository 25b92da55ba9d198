use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

use slab::Slab;

/// Stable reference to one armed deadline, held by the timer handle
/// that armed it. Reuse of a slab slot bumps `unique`, so a stale
/// ticket can never cancel somebody else's deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTicket {
    index: usize,
    unique: u32,
}

#[derive(Debug)]
struct Entry {
    deadline: Instant,
    handle: usize,
    unique: u32,
}

/// Min-heap of deadlines keyed by completion-handle slot.
///
/// Cancellation detaches the slab entry and leaves the heap node to
/// be skipped lazily, so the heap stays valid without a sift.
pub struct TimeStore {
    entries: Slab<Entry>,
    heap: BinaryHeap<Reverse<(Instant, usize, u32)>>,
    unique: u32,
}

impl TimeStore {
    pub fn new() -> TimeStore {
        TimeStore {
            entries: Slab::new(),
            heap: BinaryHeap::new(),
            unique: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, handle: usize, deadline: Instant) -> TimerTicket {
        self.unique = self.unique.wrapping_add(1);
        let unique = self.unique;
        let index = self.entries.insert(Entry {
            deadline,
            handle,
            unique,
        });
        self.heap.push(Reverse((deadline, index, unique)));
        TimerTicket { index, unique }
    }

    pub fn cancel(&mut self, ticket: TimerTicket) -> bool {
        match self.entries.get(ticket.index) {
            Some(entry) if entry.unique == ticket.unique => {
                self.entries.remove(ticket.index);
                true
            }
            _ => false,
        }
    }

    /// Earliest pending deadline, used as the poller wait timeout.
    /// Stale heap nodes are dropped on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(&Reverse((deadline, index, unique))) = self.heap.peek() {
            match self.entries.get(index) {
                Some(entry) if entry.unique == unique => return Some(deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Pops every deadline at or before `now`, appending the owning
    /// handle slots in deadline order.
    pub fn pop_expired(&mut self, now: Instant, expired: &mut Vec<usize>) {
        while let Some(&Reverse((deadline, index, unique))) = self.heap.peek() {
            match self.entries.get(index) {
                Some(entry) if entry.unique == unique => {
                    if deadline > now {
                        break;
                    }
                    expired.push(entry.handle);
                    self.entries.remove(index);
                    self.heap.pop();
                }
                _ => {
                    self.heap.pop();
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn expiry_order() {
        let mut ts = TimeStore::new();
        let now = Instant::now();

        ts.add(1, now + Duration::from_millis(30));
        ts.add(2, now + Duration::from_millis(10));
        ts.add(3, now + Duration::from_millis(20));

        assert_eq!(ts.next_deadline(), Some(now + Duration::from_millis(10)));

        let mut out = Vec::new();
        ts.pop_expired(now + Duration::from_millis(25), &mut out);
        assert_eq!(out, vec![2, 3]);

        out.clear();
        ts.pop_expired(now + Duration::from_millis(60), &mut out);
        assert_eq!(out, vec![1]);
        assert!(ts.is_empty());
    }

    #[test]
    fn cancel_skips_entry() {
        let mut ts = TimeStore::new();
        let now = Instant::now();

        let t1 = ts.add(1, now + Duration::from_millis(5));
        ts.add(2, now + Duration::from_millis(10));

        assert!(ts.cancel(t1));
        assert!(!ts.cancel(t1));

        assert_eq!(ts.next_deadline(), Some(now + Duration::from_millis(10)));

        let mut out = Vec::new();
        ts.pop_expired(now + Duration::from_millis(50), &mut out);
        assert_eq!(out, vec![2]);
    }

    #[test]
    fn ticket_reuse_is_guarded() {
        let mut ts = TimeStore::new();
        let now = Instant::now();

        let t1 = ts.add(1, now + Duration::from_millis(5));
        assert!(ts.cancel(t1));

        // slot may be reused by the next add; the old ticket stays dead
        let _t2 = ts.add(7, now + Duration::from_millis(9));
        assert!(!ts.cancel(t1));

        let mut out = Vec::new();
        ts.pop_expired(now + Duration::from_millis(50), &mut out);
        assert_eq!(out, vec![7]);
    }
}
