use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::error::SchedulerError;
use crate::job::{JobId, JobState, Priority};

/// Heap key. Higher priority first, then lower sequence number.
#[derive(Debug, PartialEq, Eq)]
struct Ticket {
    priority: Priority,
    seq: u64,
    id: JobId,
}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Slot<W> {
    state: JobState,
    work: Option<W>,
}

/// Pending jobs of one lane, ordered for the drain loop.
///
/// Entries stay in the map until the submitter reclaims them. Heap tickets
/// of reclaimed entries are skipped lazily on pop.
#[derive(Debug)]
pub(crate) struct JobQueue<W> {
    heap: BinaryHeap<Ticket>,
    slots: HashMap<JobId, Slot<W>>,
    next_seq: u64,
    closed: bool,
}

impl<W> JobQueue<W> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: HashMap::new(),
            next_seq: 0,
            closed: false,
        }
    }

    pub fn push(&mut self, priority: Priority, work: W) -> Result<JobId, SchedulerError> {
        if self.closed {
            return Err(SchedulerError::Cancelled);
        }
        let id = JobId::new();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(
            id,
            Slot {
                state: JobState::Pending,
                work: Some(work),
            },
        );
        self.heap.push(Ticket { priority, seq, id });
        Ok(id)
    }

    /// Next pending job, now marked in flight. The caller owns the work
    /// until it reports completion.
    pub fn pop(&mut self) -> Option<(JobId, W)> {
        while let Some(ticket) = self.heap.pop() {
            let Some(slot) = self.slots.get_mut(&ticket.id) else {
                continue;
            };
            if let Some(work) = slot.work.take() {
                slot.state = JobState::InFlight;
                return Some((ticket.id, work));
            }
        }
        None
    }

    pub fn complete(&mut self, id: JobId) {
        if let Some(slot) = self.slots.get_mut(&id) {
            slot.state = JobState::Completed;
        }
    }

    /// Drop the entry. Returns its last state, `None` if already gone.
    pub fn reclaim(&mut self, id: JobId) -> Option<JobState> {
        self.slots.remove(&id).map(|slot| slot.state)
    }

    pub fn state(&self, id: JobId) -> Option<JobState> {
        self.slots.get(&id).map(|slot| slot.state)
    }

    pub fn pending(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.state == JobState::Pending)
            .count()
    }

    /// Reject further pushes and hand back every job not yet started.
    pub fn close(&mut self) -> Vec<W> {
        self.closed = true;
        self.heap.clear();
        self.slots
            .values_mut()
            .filter(|slot| slot.state == JobState::Pending)
            .filter_map(|slot| slot.work.take())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
