//! Fixed-capacity snapshot ring with a strict hand-off protocol.
//!
//! The ring pre-allocates its slots once; production (`get_free`/`set_used`)
//! and consumption (`get_used`/`release_used`) each advance their own pair of
//! modular cursors under one narrow lock, so neither side ever blocks on the
//! other beyond the ring's fixed capacity. Hand-off order is enforced by
//! ownership: [`FreeSlot`] can only be consumed by [`set_used`], [`UsedSlot`]
//! only by [`release_used`], and the cursor check panics on any token that
//! comes back out of order.
//!
//! [`set_used`]: SnapshotRing::set_used
//! [`release_used`]: SnapshotRing::release_used

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::bitset::ChangeVector;
use crate::field::{FieldData, FieldTree};

/// One queued unit of delivery: materialized values plus the changed and
/// overrun marks describing them.
#[derive(Debug)]
pub struct Snapshot {
    /// Last materialized values for the subscribed subset.
    pub data: FieldData,
    /// Fields changed since the previous delivery.
    pub changed: ChangeVector,
    /// Fields that changed more than once, losing intermediate values.
    pub overrun: ChangeVector,
}

impl Snapshot {
    pub(crate) fn for_tree(tree: &FieldTree) -> Self {
        Self {
            data: FieldData::for_tree(tree),
            changed: ChangeVector::new(tree.field_count()),
            overrun: ChangeVector::new(tree.field_count()),
        }
    }

    /// Clears the changed and overrun marks, keeping the data values.
    pub fn clear_marks(&mut self) {
        self.changed.clear_all();
        self.overrun.clear_all();
    }
}

pub(crate) type SlotRef = Arc<Mutex<Snapshot>>;

pub(crate) fn lock_slot(slot: &SlotRef) -> MutexGuard<'_, Snapshot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Token for a slot obtained from [`SnapshotRing::get_free`]; the producer
/// fills it and must hand exactly this token to [`SnapshotRing::set_used`].
pub(crate) struct FreeSlot {
    index: usize,
    slot: SlotRef,
}

impl FreeSlot {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Snapshot> {
        lock_slot(&self.slot)
    }
}

/// Token for a slot obtained from [`SnapshotRing::get_used`]; the consumer
/// reads it and must hand exactly this token to
/// [`SnapshotRing::release_used`].
pub(crate) struct UsedSlot {
    index: usize,
    slot: SlotRef,
}

impl UsedSlot {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Snapshot> {
        lock_slot(&self.slot)
    }

    pub(crate) fn slot(&self) -> &SlotRef {
        &self.slot
    }
}

#[derive(Debug)]
struct RingState {
    next_free: usize,
    next_commit: usize,
    next_consume: usize,
    next_release: usize,
    free_count: usize,
    used_count: usize,
    producer_holding: bool,
    consumer_holding: bool,
}

/// Fixed-capacity circular buffer of pre-allocated snapshots.
#[derive(Debug)]
pub(crate) struct SnapshotRing {
    slots: Vec<SlotRef>,
    state: Mutex<RingState>,
}

impl SnapshotRing {
    /// Pre-allocates `capacity` slots shaped for `tree`. Capacity must be at
    /// least 2; a single shared slot is the no-queue strategy's job.
    pub(crate) fn new(capacity: usize, tree: &FieldTree) -> Self {
        assert!(capacity >= 2, "snapshot ring needs at least 2 slots");
        let slots = (0..capacity)
            .map(|_| Arc::new(Mutex::new(Snapshot::for_tree(tree))))
            .collect();
        Self {
            slots,
            state: Mutex::new(RingState {
                next_free: 0,
                next_commit: 0,
                next_consume: 0,
                next_release: 0,
                free_count: capacity,
                used_count: 0,
                producer_holding: false,
                consumer_holding: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// `(free, used, in_flight)`; the three always sum to the capacity.
    pub(crate) fn counts(&self) -> (usize, usize, usize) {
        let st = self.state();
        let in_flight = self.slots.len() - st.free_count - st.used_count;
        (st.free_count, st.used_count, in_flight)
    }

    /// Resets all cursors and counts and wipes every slot's marks.
    pub(crate) fn clear(&self) {
        let mut st = self.state();
        assert!(
            !st.producer_holding && !st.consumer_holding,
            "snapshot ring cleared while a slot is in flight"
        );
        *st = RingState {
            next_free: 0,
            next_commit: 0,
            next_consume: 0,
            next_release: 0,
            free_count: self.slots.len(),
            used_count: 0,
            producer_holding: false,
            consumer_holding: false,
        };
        drop(st);
        for slot in &self.slots {
            lock_slot(slot).clear_marks();
        }
    }

    /// Takes the next free slot, or `None` when the ring is full.
    pub(crate) fn get_free(&self) -> Option<FreeSlot> {
        let mut st = self.state();
        assert!(
            !st.producer_holding,
            "get_free while a free slot is already outstanding"
        );
        if st.free_count == 0 {
            return None;
        }
        let index = st.next_free;
        st.next_free = (st.next_free + 1) % self.slots.len();
        st.free_count -= 1;
        st.producer_holding = true;
        Some(FreeSlot {
            index,
            slot: Arc::clone(&self.slots[index]),
        })
    }

    /// Commits the slot produced last, making it visible to the consumer.
    pub(crate) fn set_used(&self, token: FreeSlot) {
        let mut st = self.state();
        assert!(
            st.producer_holding && token.index == st.next_commit,
            "snapshot committed out of order"
        );
        st.next_commit = (st.next_commit + 1) % self.slots.len();
        st.used_count += 1;
        st.producer_holding = false;
    }

    /// Takes the oldest committed slot, or `None` when nothing is ready or
    /// the consumer still holds one.
    pub(crate) fn get_used(&self) -> Option<UsedSlot> {
        let mut st = self.state();
        if st.consumer_holding || st.used_count == 0 {
            return None;
        }
        let index = st.next_consume;
        st.next_consume = (st.next_consume + 1) % self.slots.len();
        st.used_count -= 1;
        st.consumer_holding = true;
        Some(UsedSlot {
            index,
            slot: Arc::clone(&self.slots[index]),
        })
    }

    /// Returns the slot consumed last to the free pool.
    pub(crate) fn release_used(&self, token: UsedSlot) {
        let mut st = self.state();
        assert!(
            st.consumer_holding && token.index == st.next_release,
            "snapshot released out of order"
        );
        st.next_release = (st.next_release + 1) % self.slots.len();
        st.free_count += 1;
        st.consumer_holding = false;
    }

    /// The newest committed-but-unconsumed slot, the coalescing target when
    /// the ring is full. `None` only when nothing is committed.
    pub(crate) fn newest_used(&self) -> Option<SlotRef> {
        let st = self.state();
        if st.used_count == 0 {
            return None;
        }
        let index = (st.next_consume + st.used_count - 1) % self.slots.len();
        Some(Arc::clone(&self.slots[index]))
    }
}
