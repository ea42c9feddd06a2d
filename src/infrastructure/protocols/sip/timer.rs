//! Timer queue driving retransmissions, transaction wait states, dialog 2xx
//! retransmission and refresher renewals.
//!
//! Cancelling removes the entry from the live table; the heap entry left
//! behind is skipped lazily because its generation no longer matches. A
//! handle can therefore be cancelled any number of times, and a timer that
//! is due but not yet popped never fires once cancelled.

use crate::domain::shared::value_objects::{DialogId, RefresherId, TransactionKey};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tokio::time::Instant;

/// RFC 3261 Timer types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerType {
    /// Timer A: INVITE request retransmit interval (default: T1)
    TimerA,
    /// Timer B: INVITE transaction timeout (default: 64*T1)
    TimerB,
    /// Timer D: Wait time for response retransmits (default: 32s for UDP, 0s for TCP)
    TimerD,
    /// Timer E: Non-INVITE request retransmit (default: T1)
    TimerE,
    /// Timer F: Non-INVITE transaction timeout (default: 64*T1)
    TimerF,
    /// Timer G: INVITE response retransmit (default: T1)
    TimerG,
    /// Timer H: Wait time for ACK receipt (default: 64*T1)
    TimerH,
    /// Timer I: Wait time for ACK retransmits (default: T4 for UDP, 0s for TCP)
    TimerI,
    /// Timer J: Wait time for retransmits of non-INVITE requests (default: 64*T1 for UDP, 0s for TCP)
    TimerJ,
    /// Timer K: Wait time for response retransmits (default: T4 for UDP, 0s for TCP)
    TimerK,
}

/// Why a refresher timer was armed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshPurpose {
    NormalRefresh,
    Retry,
}

/// What a timer acts on when it fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerTarget {
    Transaction(TransactionKey, TimerType),
    /// Remove a terminated transaction from the table
    ReapTransaction(TransactionKey),
    /// UAS retransmission of a 2xx to INVITE until the ACK arrives
    Dialog2xxRetransmit(DialogId),
    Dialog2xxTimeout(DialogId),
    /// Drop the tombstone of a terminated dialog
    ForgetDialog(DialogId),
    Refresher(RefresherId, RefreshPurpose),
}

/// Handle returned by [`TimerQueue::schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    id: u64,
    generation: u64,
}

#[derive(Debug)]
struct TimerEntry {
    generation: u64,
    deadline: Instant,
    target: TimerTarget,
}

/// Single-threaded timer queue
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64, u64)>>,
    live: HashMap<u64, TimerEntry>,
    next_id: u64,
    next_generation: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Instant, target: TimerTarget) -> TimerHandle {
        self.next_id += 1;
        self.next_generation += 1;
        let handle = TimerHandle {
            id: self.next_id,
            generation: self.next_generation,
        };
        self.heap
            .push(Reverse((deadline, handle.id, handle.generation)));
        self.live.insert(
            handle.id,
            TimerEntry {
                generation: handle.generation,
                deadline,
                target,
            },
        );
        handle
    }

    /// Cancel a timer. Returns false when it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.live.get(&handle.id) {
            Some(entry) if entry.generation == handle.generation => {
                self.live.remove(&handle.id);
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.live
            .get(&handle.id)
            .is_some_and(|entry| entry.generation == handle.generation)
    }

    /// Deadline of a pending timer
    pub fn deadline(&self, handle: TimerHandle) -> Option<Instant> {
        self.live
            .get(&handle.id)
            .filter(|entry| entry.generation == handle.generation)
            .map(|entry| entry.deadline)
    }

    /// Pop the earliest live timer due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerHandle, TimerTarget)> {
        while let Some(Reverse((deadline, id, generation))) = self.heap.peek().copied() {
            let live = self
                .live
                .get(&id)
                .is_some_and(|entry| entry.generation == generation);
            if !live {
                // cancelled, drop the stale heap slot
                self.heap.pop();
                continue;
            }
            if deadline > now {
                return None;
            }
            self.heap.pop();
            let entry = self.live.remove(&id)?;
            return Some((TimerHandle { id, generation }, entry.target));
        }
        None
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id, generation))) = self.heap.peek().copied() {
            let live = self
                .live
                .get(&id)
                .is_some_and(|entry| entry.generation == generation);
            if live {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
