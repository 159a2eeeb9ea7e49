//! Ring of preallocated PC-sample buffers
//!
//! Single producer (the launching thread pulling from the driver), single
//! consumer (the background serializer). The producer spins while its slot
//! is still occupied; that situation means buffers get used faster than
//! they get stored, which is latched and surfaced as a report warning.

use kernelscope_shared::PcSampleBlock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

struct RingSlot {
    occupied: AtomicBool,
    block: Mutex<PcSampleBlock>,
}

struct RingState {
    put: usize,
    get: usize,
}

/// The PC-sample ring.
pub struct PcRing {
    slots: Vec<RingSlot>,
    state: Mutex<RingState>,
    backpressure: AtomicBool,
}

impl PcRing {
    /// Preallocate `count` slots of `capacity` records each.
    pub fn new(count: usize, capacity: usize) -> Self {
        let slots = (0..count)
            .map(|_| RingSlot {
                occupied: AtomicBool::new(false),
                block: Mutex::new(PcSampleBlock::with_capacity(capacity as u64)),
            })
            .collect();
        Self {
            slots,
            state: Mutex::new(RingState { put: 0, get: 0 }),
            backpressure: AtomicBool::new(false),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Record capacity of each slot.
    pub fn slot_capacity(&self) -> u64 {
        self.slots[0].block.lock().unwrap().collect_num_pcs
    }

    /// Claim the next producer slot, spinning while it is still occupied.
    ///
    /// The consumer frees slots without taking the ring lock, so holding it
    /// across the spin cannot deadlock.
    pub fn claim(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        while self.slots[state.put].occupied.load(Ordering::Acquire) {
            self.backpressure.store(true, Ordering::Relaxed);
            std::hint::spin_loop();
        }
        let index = state.put;
        self.slots[index].occupied.store(true, Ordering::Release);
        state.put = (state.put + 1) % self.slots.len();
        index
    }

    /// Access a claimed slot's buffer.
    pub fn with_block<R>(&self, index: usize, f: impl FnOnce(&mut PcSampleBlock) -> R) -> R {
        let mut block = self.slots[index].block.lock().unwrap();
        f(&mut block)
    }

    /// Consumer side: free the slot and advance the get index.
    pub fn release(&self, index: usize) {
        // Clear the flag first so a spinning producer can make progress
        // before we contend for the ring lock.
        self.slots[index].occupied.store(false, Ordering::Release);
        let mut state = self.state.lock().unwrap();
        state.get = (state.get + 1) % self.slots.len();
    }

    /// True once any producer observed a full ring.
    pub fn backpressure_hit(&self) -> bool {
        self.backpressure.load(Ordering::Relaxed)
    }
}
