// This file is part of qnet-arbiter.

//! Min-heap timer service (component C1).
//!
//! Grounded on `examples/original_source/qdevices/timer-list.c`: a binary min-heap over a
//! slab of entries, ordered by wraparound-safe "time to expire", with deleted entries returned
//! to a free list for reuse rather than freed outright.

use std::time::Instant;

/// Bounds the schedulable horizon to half of the wraparound tick space, exactly as
/// `TIMER_LIST_MAX_INTERVAL` does in the original.
pub const MAX_INTERVAL_MS: u32 = u32::max_value() / 2;

const INACTIVE: usize = usize::max_value();

/// What a timer callback wants to happen next, replacing the original's "return 0 to delete,
/// nonzero to reschedule" convention with a typed enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// Reschedule the timer for another `interval` from now.
    Reschedule,
    /// Remove the timer; it returns to the free list.
    Cancel,
}

/// Opaque handle to a scheduled timer. Carries a generation so a handle for a deleted timer
/// can never be silently confused with a later timer that reused the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    slot: usize,
    generation: u32,
}

struct Slot {
    active: bool,
    generation: u32,
    epoch: u32,
    interval_ms: u32,
    expire: u32,
    heap_pos: usize,
    callback: Option<Box<dyn FnMut() -> TimerOutcome>>,
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            active: false,
            generation: 0,
            epoch: 0,
            interval_ms: 0,
            expire: 0,
            heap_pos: INACTIVE,
            callback: None,
        }
    }
}

/// Wraparound-safe "time to expire": `expire - now` taken as unsigned; if that unsigned
/// difference exceeds half the tick space the timer is treated as already expired.
fn time_to_expire(expire: u32, now: u32) -> u32 {
    let diff = expire.wrapping_sub(now);
    if diff > MAX_INTERVAL_MS {
        0
    } else {
        diff
    }
}

/// A binary min-heap of timer entries, keyed by wraparound-safe time-to-expire relative to
/// each entry's own epoch (the instant it was last (re)scheduled).
pub struct TimerHeap {
    slots: Vec<Slot>,
    free: Vec<usize>,
    heap: Vec<usize>,
    start: Instant,
}

impl TimerHeap {
    pub fn new() -> TimerHeap {
        TimerHeap {
            slots: Vec::new(),
            free: Vec::new(),
            heap: Vec::new(),
            start: Instant::now(),
        }
    }

    /// Current tick, wrapping within `u32`. One tick is one millisecond.
    pub fn now(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    /// Schedule `callback` to run in `interval_ms` milliseconds.
    ///
    /// Returns `None` if `interval_ms` is out of `[1, MAX_INTERVAL_MS]`.
    pub fn add(
        &mut self,
        interval_ms: u32,
        callback: Box<dyn FnMut() -> TimerOutcome>,
    ) -> Option<TimerHandle> {
        if interval_ms < 1 || interval_ms > MAX_INTERVAL_MS {
            return None;
        }

        let now = self.now();
        let slot_index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::empty());
                self.slots.len() - 1
            }
        };

        let generation = self.slots[slot_index].generation;
        self.slots[slot_index] = Slot {
            active: true,
            generation,
            epoch: now,
            interval_ms,
            expire: now.wrapping_add(interval_ms),
            heap_pos: INACTIVE,
            callback: Some(callback),
        };

        self.heap_insert(slot_index);

        Some(TimerHandle {
            slot: slot_index,
            generation,
        })
    }

    /// Remove a timer. A no-op if the handle is stale or already deleted.
    pub fn delete(&mut self, handle: TimerHandle) {
        if !self.is_live(handle) {
            return;
        }
        self.heap_delete(handle.slot);
        self.retire(handle.slot);
    }

    /// Delete then reinsert with a fresh epoch, preserving interval and callback.
    pub fn reschedule(&mut self, handle: TimerHandle) {
        if !self.is_live(handle) {
            return;
        }
        self.heap_delete(handle.slot);
        let now = self.now();
        let slot = &mut self.slots[handle.slot];
        slot.epoch = now;
        slot.expire = now.wrapping_add(slot.interval_ms);
        self.heap_insert(handle.slot);
    }

    /// Delete then reinsert with a new interval and fresh epoch. Only valid on active entries.
    pub fn set_interval(&mut self, handle: TimerHandle, interval_ms: u32) -> bool {
        if !self.is_live(handle) || interval_ms < 1 || interval_ms > MAX_INTERVAL_MS {
            return false;
        }
        self.heap_delete(handle.slot);
        let now = self.now();
        let slot = &mut self.slots[handle.slot];
        slot.interval_ms = interval_ms;
        slot.epoch = now;
        slot.expire = now.wrapping_add(interval_ms);
        self.heap_insert(handle.slot);
        true
    }

    /// Milliseconds until the next timer is due, `0` if one is already due, or `None` if the
    /// heap is empty — directly usable as a poll timeout.
    pub fn time_to_expire(&self) -> Option<u32> {
        let top = *self.heap.first()?;
        let now = self.now();
        Some(time_to_expire(self.slots[top].expire, now))
    }

    /// Run every timer whose time-to-expire is zero, rescheduling or removing each per its
    /// callback's `TimerOutcome`. A callback may itself add/delete/adjust timers.
    pub fn expire(&mut self) {
        loop {
            let top = match self.heap.first() {
                Some(&index) => index,
                None => break,
            };
            let now = self.now();
            if time_to_expire(self.slots[top].expire, now) != 0 {
                break;
            }

            let mut callback = match self.slots[top].callback.take() {
                Some(cb) => cb,
                None => break,
            };
            let outcome = callback();

            // The callback may have deleted or rescheduled `top` itself (e.g. disconnecting
            // its own client); only touch it further if it's still the same live entry.
            if self.slots[top].active && self.slots[top].callback.is_none() {
                self.slots[top].callback = Some(callback);
                match outcome {
                    TimerOutcome::Cancel => {
                        self.heap_delete(top);
                        self.retire(top);
                    }
                    TimerOutcome::Reschedule => {
                        self.heap_delete(top);
                        let now = self.now();
                        let slot = &mut self.slots[top];
                        slot.epoch = now;
                        slot.expire = now.wrapping_add(slot.interval_ms);
                        self.heap_insert(top);
                    }
                }
            }
        }
    }

    fn is_live(&self, handle: TimerHandle) -> bool {
        handle.slot < self.slots.len()
            && self.slots[handle.slot].active
            && self.slots[handle.slot].generation == handle.generation
    }

    fn retire(&mut self, slot_index: usize) {
        self.slots[slot_index].active = false;
        self.slots[slot_index].callback = None;
        self.slots[slot_index].generation = self.slots[slot_index].generation.wrapping_add(1);
        self.free.push(slot_index);
    }

    fn cmp(&self, a: usize, b: usize, now: u32) -> std::cmp::Ordering {
        time_to_expire(self.slots[a].expire, now).cmp(&time_to_expire(self.slots[b].expire, now))
    }

    fn heap_insert(&mut self, slot_index: usize) {
        let pos = self.heap.len();
        self.heap.push(slot_index);
        self.slots[slot_index].heap_pos = pos;
        self.sift_up(pos);
    }

    /// Swap-with-last-then-sift, matching `timer_list_heap_delete`'s exact procedure: the
    /// entry being removed is replaced by the heap's last slot, which is then sifted up or
    /// down depending on how it compares to the removed entry (not a generic re-heapify).
    fn heap_delete(&mut self, slot_index: usize) {
        let now = self.now();
        let pos = self.slots[slot_index].heap_pos;
        let last_pos = self.heap.len() - 1;

        let replacement = self.heap[last_pos];
        self.heap[pos] = replacement;
        self.slots[replacement].heap_pos = pos;
        self.heap.pop();
        self.slots[slot_index].heap_pos = INACTIVE;

        if pos >= self.heap.len() {
            return;
        }

        match self.cmp(replacement, slot_index, now) {
            std::cmp::Ordering::Less => self.sift_up(pos),
            std::cmp::Ordering::Greater => self.sift_down(pos),
            std::cmp::Ordering::Equal => {}
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        let now = self.now();
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.cmp(self.heap[parent], self.heap[pos], now) == std::cmp::Ordering::Greater {
                self.heap.swap(parent, pos);
                self.slots[self.heap[parent]].heap_pos = parent;
                self.slots[self.heap[pos]].heap_pos = pos;
                pos = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let now = self.now();
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut smallest = pos;

            if left < self.heap.len()
                && self.cmp(self.heap[left], self.heap[smallest], now) == std::cmp::Ordering::Less
            {
                smallest = left;
            }
            if right < self.heap.len()
                && self.cmp(self.heap[right], self.heap[smallest], now) == std::cmp::Ordering::Less
            {
                smallest = right;
            }

            if smallest == pos {
                break;
            }

            self.heap.swap(pos, smallest);
            self.slots[self.heap[pos]].heap_pos = pos;
            self.slots[self.heap[smallest]].heap_pos = smallest;
            pos = smallest;
        }
    }

    /// Used only by tests, matching `timer_list_debug_is_valid_heap`.
    #[cfg(test)]
    fn debug_is_valid_heap(&self) -> bool {
        let now = self.now();
        for i in 0..self.heap.len() {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            if left < self.heap.len()
                && self.cmp(self.heap[left], self.heap[i], now) == std::cmp::Ordering::Less
            {
                return false;
            }
            if right < self.heap.len()
                && self.cmp(self.heap[right], self.heap[i], now) == std::cmp::Ordering::Less
            {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn wraparound_time_to_expire() {
        // Property 1: for delta < TICK_SPACE/2, ttE == delta; otherwise 0.
        let half = MAX_INTERVAL_MS;
        assert_eq!(time_to_expire(100, 0), 100);
        assert_eq!(time_to_expire(0, 0), 0);
        assert_eq!(time_to_expire(half, 0), half);
        assert_eq!(time_to_expire(half + 1, 0), 0);
        // Wraps near u32::MAX.
        let now = u32::max_value() - 10;
        assert_eq!(time_to_expire(now.wrapping_add(20), now), 20);
    }

    #[test]
    fn add_rejects_bad_interval() {
        let mut heap = TimerHeap::new();
        assert!(heap.add(0, Box::new(|| TimerOutcome::Cancel)).is_none());
        assert!(heap
            .add(MAX_INTERVAL_MS + 1, Box::new(|| TimerOutcome::Cancel))
            .is_none());
        assert!(heap.add(1, Box::new(|| TimerOutcome::Cancel)).is_some());
    }

    #[test]
    fn delete_is_idempotent() {
        let mut heap = TimerHeap::new();
        let handle = heap.add(1000, Box::new(|| TimerOutcome::Cancel)).unwrap();
        heap.delete(handle);
        heap.delete(handle);
        assert!(heap.debug_is_valid_heap());
    }

    #[test]
    fn expire_on_empty_heap_is_noop() {
        let mut heap = TimerHeap::new();
        heap.expire();
        assert!(heap.time_to_expire().is_none());
    }

    #[test]
    fn heap_property_holds_after_mutations() {
        let mut heap = TimerHeap::new();
        let mut handles = Vec::new();
        for interval in [500u32, 10, 2000, 1, 999, 42, 100000].iter() {
            handles.push(heap.add(*interval, Box::new(|| TimerOutcome::Cancel)).unwrap());
            assert!(heap.debug_is_valid_heap());
        }
        heap.delete(handles[2]);
        assert!(heap.debug_is_valid_heap());
        heap.reschedule(handles[0]);
        assert!(heap.debug_is_valid_heap());
        heap.set_interval(handles[4], 5);
        assert!(heap.debug_is_valid_heap());
        for h in handles {
            heap.delete(h);
        }
        assert!(heap.debug_is_valid_heap());
    }

    #[test]
    fn callback_fires_and_reschedules() {
        let mut heap = TimerHeap::new();
        let count = Rc::new(RefCell::new(0));
        let count_cb = count.clone();
        let _handle = heap
            .add(
                1,
                Box::new(move || {
                    *count_cb.borrow_mut() += 1;
                    TimerOutcome::Cancel
                }),
            )
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        heap.expire();
        assert_eq!(*count.borrow(), 1);
        // Entry was cancelled, so a second expire() call does nothing.
        heap.expire();
        assert_eq!(*count.borrow(), 1);
    }
}
