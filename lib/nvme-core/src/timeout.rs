// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coarse I/O timeout detection.
//!
//! Time is divided into one-second slots arranged in a ring as long as the
//! I/O timeout. Each queue counts the commands submitted during every slot.
//! When the shared clock comes back around to a slot whose count is still
//! non-zero, those commands have been outstanding for the whole timeout.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Controller-wide slot index, advanced by the exception task.
#[derive(Debug)]
pub struct TimeoutClock {
    slots: usize,
    current: AtomicUsize,
}

impl TimeoutClock {
    pub fn new(slots: usize) -> Self {
        assert!(slots > 0);
        Self { slots, current: AtomicUsize::new(0) }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// The slot [`Self::advance`] will move to.
    ///
    /// Commands submitted until then are still accounted to the current
    /// slot, so the next one can be checked for expiry before any new
    /// command lands in it.
    pub fn peek_next(&self) -> usize {
        (self.current() + 1) % self.slots
    }

    /// Move to the next slot and return it.
    pub fn advance(&self) -> usize {
        let next = self.peek_next();
        self.current.store(next, Ordering::Release);
        next
    }
}

/// Per-queue counts of outstanding commands by submission slot.
#[derive(Debug)]
pub struct TimeoutWheel {
    clock: Arc<TimeoutClock>,
    counts: Box<[AtomicU32]>,
}

impl TimeoutWheel {
    pub fn new(clock: Arc<TimeoutClock>) -> Self {
        let counts = (0..clock.slots()).map(|_| AtomicU32::new(0)).collect();
        Self { clock, counts }
    }

    /// Account a newly submitted command, returning the slot it landed in.
    pub fn arm(&self) -> usize {
        let slot = self.clock.current();
        self.counts[slot].fetch_add(1, Ordering::AcqRel);
        slot
    }

    pub fn disarm(&self, slot: usize) {
        let _ = self.counts[slot].fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |n| n.checked_sub(1),
        );
    }

    /// Commands submitted during `slot` and still outstanding.
    pub fn outstanding(&self, slot: usize) -> u32 {
        self.counts[slot].load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        for count in self.counts.iter() {
            count.store(0, Ordering::Release);
        }
    }
}
